//! Remote-process backend.
//!
//! Launches a worker process with a sanitized environment, accepts its two
//! connections on a loopback listener, negotiates the main transport, and
//! supervises the child for the lifetime of the backend.
//!
//! ```text
//! controller                                  worker process
//!   bind 127.0.0.1:0
//!   launch (ISORPC_ENDPOINT, ISORPC_SESSION) ──▶  connect main, hello
//!                                               connect interrupt, hello
//!   offer / select / [shm setup]   ◀────────▶   negotiate
//!   supervisor: wait | terminate | kill
//! ```
//!
//! Dropping a [`RemoteProcessBackend`] kills the worker. Use
//! [`RemoteProcessBackend::shutdown`] for a graceful stop, or
//! [`RemoteProcessBackend::scope`] to tie the worker's lifetime to a block.

pub mod launcher;

pub use launcher::{CommandLauncher, ExitInfo, WorkerLauncher, WorkerProcess};

use crate::backend::{Backend, ConnectionCloser, RpcConnection};
use crate::config::{safe_environment, EnvConfig, ProcessConfig, TransportConfig, TransportKind};
use crate::error::{Result, RpcError};
use crate::transport::auto::{recv_handshake, AutoTransport, ChannelRole, Handshake};
use crate::transport::{Link, StreamTransport};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Settings for launching a worker process.
#[derive(Clone)]
pub struct RemoteProcessOptions {
    launcher: Arc<dyn WorkerLauncher>,
    backend_name: String,
    transports: Vec<TransportKind>,
    bind_addr: SocketAddr,
    worker_args: Vec<String>,
    env: HashMap<String, String>,
    launch_timeout: Duration,
    shutdown_timeout: Duration,
    kill_grace: Duration,
    shm_capacity: usize,
}

impl RemoteProcessOptions {
    pub fn new(launcher: impl WorkerLauncher + 'static) -> Self {
        Self {
            launcher: Arc::new(launcher),
            backend_name: "remote-process".to_string(),
            transports: TransportKind::ALL.to_vec(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            worker_args: Vec::new(),
            env: HashMap::new(),
            launch_timeout: ProcessConfig::LAUNCH_TIMEOUT,
            shutdown_timeout: ProcessConfig::SHUTDOWN_TIMEOUT,
            kill_grace: ProcessConfig::KILL_GRACE,
            shm_capacity: TransportConfig::SHM_DEFAULT_CAPACITY,
        }
    }

    /// Launch `program` directly.
    pub fn command(program: impl Into<PathBuf>) -> Self {
        Self::new(CommandLauncher::new(program))
    }

    /// Name exported to the worker as `ISORPC_BACKEND` and used in logs.
    pub fn with_backend_name(mut self, name: impl Into<String>) -> Self {
        self.backend_name = name.into();
        self
    }

    /// Transports to offer, in preference order.
    pub fn with_transports(mut self, transports: Vec<TransportKind>) -> Self {
        self.transports = transports;
        self
    }

    /// Listener address; port 0 picks a free port.
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.worker_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add a variable on top of the sanitized environment.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_launch_timeout(mut self, timeout: Duration) -> Self {
        self.launch_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_shm_capacity(mut self, capacity: usize) -> Self {
        self.shm_capacity = capacity;
        self
    }

    fn environment(&self, endpoint: SocketAddr, session: &str) -> HashMap<String, String> {
        let mut env = safe_environment();
        env.insert(EnvConfig::BACKEND.to_string(), self.backend_name.clone());
        env.insert(EnvConfig::ENDPOINT.to_string(), endpoint.to_string());
        env.insert(EnvConfig::SESSION.to_string(), session.to_string());
        env.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }
}

impl std::fmt::Debug for RemoteProcessOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProcessOptions")
            .field("backend_name", &self.backend_name)
            .field("transports", &self.transports)
            .field("bind_addr", &self.bind_addr)
            .field("worker_args", &self.worker_args)
            .field("launch_timeout", &self.launch_timeout)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("kill_grace", &self.kill_grace)
            .finish()
    }
}

/// Accept connections until both channels of `session` have said hello.
async fn accept_channels(
    listener: &TcpListener,
    session: &str,
    hello_timeout: Duration,
) -> Result<(TcpStream, TcpStream)> {
    let mut main = None;
    let mut interrupt = None;

    loop {
        if let (Some(_), Some(_)) = (&main, &interrupt) {
            break;
        }
        let (mut stream, peer) = listener.accept().await?;
        stream.set_nodelay(true)?;

        let hello = match tokio::time::timeout(hello_timeout, recv_handshake(&mut stream)).await {
            Ok(hello) => hello,
            Err(_) => {
                warn!("Dropping connection from {}: no hello within {:?}", peer, hello_timeout);
                continue;
            }
        };
        match hello {
            Ok(Handshake::Hello {
                session: presented,
                channel,
            }) if presented == session => {
                let slot = match channel {
                    ChannelRole::Main => &mut main,
                    ChannelRole::Interrupt => &mut interrupt,
                };
                if slot.is_some() {
                    warn!("Ignoring duplicate {:?} connection from {}", channel, peer);
                } else {
                    debug!("Worker {:?} channel connected from {}", channel, peer);
                    *slot = Some(stream);
                }
            }
            Ok(Handshake::Hello { .. }) => {
                warn!("Rejecting connection from {}: session mismatch", peer)
            }
            Ok(other) => warn!("Rejecting connection from {}: unexpected {:?}", peer, other),
            Err(e) => warn!("Handshake with {} failed: {}", peer, e),
        }
    }

    match (main, interrupt) {
        (Some(main), Some(interrupt)) => Ok((main, interrupt)),
        _ => Err(RpcError::protocol("worker channels incomplete")),
    }
}

async fn connect_worker(
    listener: &TcpListener,
    session: &str,
    options: &RemoteProcessOptions,
) -> Result<Link> {
    let (main, interrupt) = accept_channels(listener, session, ProcessConfig::HELLO_TIMEOUT).await?;
    let main = AutoTransport::new(options.transports.clone())
        .with_shm_capacity(options.shm_capacity)
        .negotiate_controller(main)
        .await?;
    Ok(Link::new(main, Arc::new(StreamTransport::new(interrupt))))
}

async fn supervise(
    mut process: WorkerProcess,
    mut control: oneshot::Receiver<Duration>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    closer: ConnectionCloser,
) {
    let pid = process.id();
    let exit = tokio::select! {
        exit = process.wait() => exit,
        request = &mut control => match request {
            Ok(grace) => {
                debug!("Terminating worker {:?} (grace {:?})", pid, grace);
                process.terminate(grace).await
            }
            Err(_) => {
                debug!("Backend dropped, killing worker {:?}", pid);
                process.kill().await
            }
        },
    };

    let exit = exit.unwrap_or_else(|e| ExitInfo {
        code: None,
        status: format!("unknown ({})", e),
    });
    info!("Worker {:?} exited: {}", pid, exit.status);
    closer.worker_exited(exit.code, exit.status.clone());
    exit_tx.send_replace(Some(exit));
}

/// A backend served by a supervised worker process.
pub struct RemoteProcessBackend {
    backend: Backend,
    pid: Option<u32>,
    exit: watch::Receiver<Option<ExitInfo>>,
    control: Option<oneshot::Sender<Duration>>,
    supervisor: Option<JoinHandle<()>>,
    shutdown_timeout: Duration,
    kill_grace: Duration,
}

impl RemoteProcessBackend {
    /// Launch a worker and connect to it.
    ///
    /// Fails with [`RpcError::WorkerExited`] if the worker dies before both
    /// channels are up, or [`RpcError::Timeout`] if it does not connect in time.
    pub async fn launch(options: RemoteProcessOptions) -> Result<Self> {
        let listener = TcpListener::bind(options.bind_addr).await?;
        let endpoint = listener.local_addr()?;
        let session = Uuid::new_v4().to_string();
        let env = options.environment(endpoint, &session);

        let mut process = options.launcher.launch(&options.worker_args, &env)?;
        let pid = process.id();
        info!(
            "Waiting for worker {:?} ({}) on {}",
            pid, options.backend_name, endpoint
        );

        let connect = tokio::time::timeout(
            options.launch_timeout,
            connect_worker(&listener, &session, &options),
        );
        let outcome = tokio::select! {
            biased;
            result = connect => result.unwrap_or_else(|_| Err(RpcError::Timeout {
                what: format!("worker {:?} to connect", pid),
                after: options.launch_timeout,
            })),
            exit = process.wait() => Err(match exit {
                Ok(exit) => RpcError::WorkerExited {
                    code: exit.code,
                    status: exit.status,
                },
                Err(e) => e,
            }),
        };

        let link = match outcome {
            Ok(link) => link,
            Err(e) => {
                warn!("Worker {:?} failed to start: {}", pid, e);
                if let Err(kill_err) = process.kill().await {
                    debug!("Killing worker {:?}: {}", pid, kill_err);
                }
                return Err(e);
            }
        };
        drop(listener);

        let connection = RpcConnection::new(options.backend_name.clone(), link).supervised();
        let closer = connection.closer();
        let backend = Backend::new(connection);

        let (control, control_rx) = oneshot::channel();
        let (exit_tx, exit) = watch::channel(None);
        let supervisor = tokio::spawn(supervise(process, control_rx, exit_tx, closer));

        info!("Worker {:?} ready ({})", pid, options.backend_name);
        Ok(Self {
            backend,
            pid,
            exit,
            control: Some(control),
            supervisor: Some(supervisor),
            shutdown_timeout: options.shutdown_timeout,
            kill_grace: options.kill_grace,
        })
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit information, once the worker has exited.
    pub fn exit_status(&self) -> Option<ExitInfo> {
        self.exit.borrow().clone()
    }

    /// Wait up to `timeout` for the worker to exit on its own.
    pub async fn wait_exit(&mut self, timeout: Duration) -> Option<ExitInfo> {
        let exited = self.exit.wait_for(Option::is_some);
        match tokio::time::timeout(timeout, exited).await {
            Ok(Ok(exit)) => exit.clone(),
            _ => None,
        }
    }

    /// Ask the worker to stop, escalating to termination if it does not exit in time.
    pub async fn shutdown(mut self) -> Result<ExitInfo> {
        if let Err(e) = self.backend.request_shutdown().await {
            debug!("Shutdown request to worker {:?} failed: {}", self.pid, e);
        }
        if let Some(exit) = self.wait_exit(self.shutdown_timeout).await {
            return Ok(exit);
        }
        warn!(
            "Worker {:?} did not exit within {:?}, terminating",
            self.pid, self.shutdown_timeout
        );
        let grace = self.kill_grace;
        self.stop(grace).await
    }

    /// Stop the worker immediately.
    pub async fn terminate(mut self) -> Result<ExitInfo> {
        self.stop(Duration::ZERO).await
    }

    async fn stop(&mut self, grace: Duration) -> Result<ExitInfo> {
        if let Some(control) = self.control.take() {
            // A closed channel means the supervisor already saw the exit
            let _ = control.send(grace);
        }
        if let Some(supervisor) = self.supervisor.take() {
            supervisor
                .await
                .map_err(|e| RpcError::protocol(format!("worker supervisor failed: {}", e)))?;
        }
        self.exit_status().ok_or(RpcError::WorkerExited {
            code: None,
            status: "unknown".to_string(),
        })
    }

    /// Run `body` against a freshly launched worker.
    ///
    /// When `body` succeeds the worker is shut down gracefully. When it
    /// fails the worker is terminated and the original error returned.
    pub async fn scope<F, Fut, T, E>(options: RemoteProcessOptions, body: F) -> std::result::Result<T, E>
    where
        F: FnOnce(Backend) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<RpcError>,
    {
        let process = Self::launch(options).await?;
        match body(process.backend().clone()).await {
            Ok(value) => {
                process.shutdown().await?;
                Ok(value)
            }
            Err(err) => {
                let pid = process.pid();
                if let Err(e) = process.terminate().await {
                    warn!("Terminating worker {:?} after failure: {}", pid, e);
                }
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for RemoteProcessBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProcessBackend")
            .field("name", &self.backend.name())
            .field("pid", &self.pid)
            .field("exit", &self.exit_status())
            .finish()
    }
}
