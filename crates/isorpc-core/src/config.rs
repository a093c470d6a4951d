//! Centralized configuration for isorpc.
//!
//! Protocol limits, transport sizing, process timeouts and environment
//! variable names. Runtime overrides go through
//! [`RemoteProcessOptions`](crate::remote::RemoteProcessOptions) and the
//! worker's [`WorkerSettings`](crate::worker::WorkerSettings).

use std::collections::HashMap;
use std::time::Duration;

/// Wire protocol limits.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Largest payload accepted in a single frame.
    pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024; // 64MB
    /// How often an interrupt is re-sent while the cancelled call is pending.
    pub const INTERRUPT_RESEND_INTERVAL: Duration = Duration::from_millis(250);
    /// How long a pending call keeps reading replies once its connection is marked closed.
    pub const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);
    /// Call id reserved for requests that expect no reply.
    pub const FIRE_AND_FORGET_ID: u64 = 0;
}

/// Transport sizing.
pub struct TransportConfig;

impl TransportConfig {
    pub const SHM_DEFAULT_CAPACITY: usize = 1024 * 1024;
    pub const SHM_MIN_CAPACITY: usize = 4 * 1024;
    pub const SHM_MAX_CAPACITY: usize = 64 * 1024 * 1024;
    pub const SHM_DIR_PREFIX: &'static str = "isorpc-shm-";
    /// Buffer size of in-memory duplex links.
    pub const MEMORY_BUFFER_SIZE: usize = 64 * 1024;
}

/// Worker process lifetime bounds.
pub struct ProcessConfig;

impl ProcessConfig {
    pub const DEFAULT_BIND_ADDR: &'static str = "127.0.0.1:0";
    /// Launch until both channels are connected and negotiated.
    pub const LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);
    /// Graceful shutdown before forced termination.
    pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
    /// Time between SIGTERM and SIGKILL.
    pub const KILL_GRACE: Duration = Duration::from_secs(2);
    /// How long an accepted connection may take to present its hello.
    pub const HELLO_TIMEOUT: Duration = Duration::from_secs(2);
    /// Worker-side timeout for connecting back to the controller.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    /// How long a failed call waits for the supervisor to report an exit status.
    pub const EXIT_STATUS_GRACE: Duration = Duration::from_millis(500);
}

/// Environment variables read or written across the process boundary.
pub struct EnvConfig;

impl EnvConfig {
    /// Marks a process as already running inside a selected backend.
    pub const BACKEND: &'static str = "ISORPC_BACKEND";
    /// `host:port` the worker connects back to.
    pub const ENDPOINT: &'static str = "ISORPC_ENDPOINT";
    /// Session secret the worker presents on every connection.
    pub const SESSION: &'static str = "ISORPC_SESSION";
    /// Comma-separated transports the worker is willing to use.
    pub const TRANSPORTS: &'static str = "ISORPC_TRANSPORTS";

    /// Variables never inherited across an isolation boundary.
    pub const UNSAFE_VARS: &'static [&'static str] = &[
        "LD_PRELOAD",
        "LD_LIBRARY_PATH",
        "PYTHONPATH",
        "PYTHONHOME",
        "VIRTUAL_ENV",
    ];

    /// Prefixes of variables never inherited across an isolation boundary.
    pub const UNSAFE_PREFIXES: &'static [&'static str] = &["DYLD_", "CONDA_", "ISORPC_"];
}

/// Byte transports that can carry the main channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Length-prefixed JSON frames over a stream socket.
    TcpJson,
    /// JSON frames through memory-mapped rings, announced on a stream socket.
    ShmJson,
}

impl TransportKind {
    /// Every transport, in default preference order.
    pub const ALL: [TransportKind; 2] = [TransportKind::ShmJson, TransportKind::TcpJson];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::TcpJson => "tcp-json",
            TransportKind::ShmJson => "shm-json",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "tcp-json" => Some(TransportKind::TcpJson),
            "shm-json" => Some(TransportKind::ShmJson),
            _ => None,
        }
    }

    /// Parse a comma-separated list, skipping unknown names.
    pub fn parse_list(s: &str) -> Vec<Self> {
        s.split(',').filter_map(Self::from_str).collect()
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Name of the backend this process is already running inside, if any.
pub fn active_backend() -> Option<String> {
    std::env::var(EnvConfig::BACKEND)
        .ok()
        .filter(|name| !name.is_empty())
}

/// Whether a variable must not be passed to a worker.
pub fn is_unsafe_env_var(name: &str) -> bool {
    EnvConfig::UNSAFE_VARS.contains(&name)
        || EnvConfig::UNSAFE_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix))
}

/// The current environment minus entries unsafe to inherit.
///
/// Variables that are not valid UTF-8 are dropped as well.
pub fn safe_environment() -> HashMap<String, String> {
    sanitize_environment(std::env::vars_os().filter_map(|(key, value)| {
        Some((key.into_string().ok()?, value.into_string().ok()?))
    }))
}

/// Filter an arbitrary set of variables the same way as [`safe_environment`].
pub fn sanitize_environment<I>(vars: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter()
        .filter(|(key, _)| !is_unsafe_env_var(key))
        .collect()
}
