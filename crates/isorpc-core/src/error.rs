//! Error types for isorpc.
//!
//! Errors fall into two families. Call-level errors fail a single call and
//! leave the connection usable. Connection-level errors mean the session is
//! over: the transport broke, the worker died, or setup failed. Callers use
//! [`RpcError::is_connection_error`] to tell "your code raised X" apart from
//! "the worker process died".
//!
//! [`RemoteError`] is both the error type worker-side code returns and the
//! payload that travels back inside an `exception` message.

use crate::protocol::Handle;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Main error type for isorpc.
#[derive(Debug, Error)]
pub enum RpcError {
    // Call-level errors
    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Unknown instance handle {handle}")]
    UnknownInstance { handle: Handle },

    #[error("Remote {0}")]
    Remote(RemoteError),

    #[error("Call was cancelled")]
    Cancelled,

    #[error("A cancellation token is already active in this task")]
    TokenAlreadyActive,

    #[error("Cancellation token is already bound to an in-flight call")]
    TokenInUse,

    #[error("Invalid locator '{locator}': {reason}")]
    InvalidLocator { locator: String, reason: String },

    #[error("Name '{name}' is reserved and cannot be forwarded")]
    ReservedName { name: String },

    #[error("Unexpected reply: expected {expected}, got {actual}")]
    UnexpectedReply {
        expected: &'static str,
        actual: String,
    },

    // Connection-level errors
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Worker process exited: {status}")]
    WorkerExited { code: Option<i32>, status: String },

    #[error("Transport negotiation failed: offered {offered:?}, supported {supported:?}")]
    ProtocolNegotiation {
        offered: Vec<String>,
        supported: Vec<String>,
    },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Worker launch failed: {message}")]
    LaunchFailed { message: String },

    #[error("Timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },
}

/// Result type alias for isorpc operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl RpcError {
    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        RpcError::Protocol {
            message: message.into(),
        }
    }

    /// Create a serialization error without an underlying serde error.
    pub fn serialization(message: impl Into<String>) -> Self {
        RpcError::Serialization {
            message: message.into(),
            source: None,
        }
    }

    /// Whether this error ends the session rather than a single call.
    ///
    /// A fatal remote error counts as a connection error: the worker stops
    /// serving after reporting it.
    pub fn is_connection_error(&self) -> bool {
        match self {
            RpcError::ConnectionClosed
            | RpcError::WorkerExited { .. }
            | RpcError::ProtocolNegotiation { .. }
            | RpcError::Protocol { .. }
            | RpcError::FrameTooLarge { .. }
            | RpcError::LaunchFailed { .. }
            | RpcError::Timeout { .. }
            | RpcError::Io { .. } => true,
            RpcError::Remote(err) => err.is_fatal(),
            _ => false,
        }
    }

    /// The remote error payload, if this error came from worker code.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            RpcError::Remote(err) => Some(err),
            _ => None,
        }
    }
}

// Conversion implementations for common error types

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted => RpcError::ConnectionClosed,
            _ => RpcError::Io {
                message: err.to_string(),
                source: Some(err),
            },
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Serialization {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<RemoteError> for RpcError {
    /// Reconstruct the controller-side error for an `exception` payload.
    fn from(err: RemoteError) -> Self {
        match err.class {
            ErrorClass::Cancelled => RpcError::Cancelled,
            ErrorClass::UnknownInstance => RpcError::UnknownInstance {
                handle: err.handle.unwrap_or_default(),
            },
            ErrorClass::Serialization => RpcError::Serialization {
                message: err.message,
                source: None,
            },
            ErrorClass::Application | ErrorClass::Fatal => RpcError::Remote(err),
        }
    }
}

/// Category of a worker-side failure, carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Ordinary error raised by the target code.
    Application,
    /// The call observed its cancellation token.
    Cancelled,
    /// The request named a handle that is not in the instance table.
    UnknownInstance,
    /// Arguments or results could not be converted.
    Serialization,
    /// Unrecoverable failure; the worker stops serving after reporting it.
    Fatal,
}

/// An error raised by code running in the worker.
///
/// `kind` is the error's type name as the worker saw it (for example
/// `ValueError` or `ParseIntError`); `traceback` holds the source chain,
/// outermost first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub class: ErrorClass,
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traceback: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<Handle>,
}

impl RemoteError {
    /// Create an application error with a type name and message.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Application,
            kind: kind.into(),
            message: message.into(),
            traceback: Vec::new(),
            handle: None,
        }
    }

    /// Capture any Rust error, keeping its type name and source chain.
    pub fn from_error<E>(err: &E) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        let mut traceback = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            traceback.push(cause.to_string());
            source = cause.source();
        }

        Self {
            traceback,
            ..Self::new(short_type_name::<E>(), err.to_string())
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new("ValueError", message)
    }

    pub fn attribute_error(name: &str) -> Self {
        Self::new("AttributeError", format!("no attribute '{}'", name))
    }

    pub fn lookup_error(locator: &str) -> Self {
        Self::new("LookupError", format!("nothing registered at '{}'", locator))
    }

    /// The error reported when a call observes its cancellation token.
    pub fn cancelled() -> Self {
        Self {
            class: ErrorClass::Cancelled,
            ..Self::new("CancelledError", "Operation was cancelled")
        }
    }

    pub fn unknown_instance(handle: Handle) -> Self {
        Self {
            class: ErrorClass::UnknownInstance,
            handle: Some(handle),
            ..Self::new("UnknownInstanceError", format!("unknown instance {}", handle))
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Serialization,
            ..Self::new("SerializationError", message)
        }
    }

    /// An unrecoverable failure. The worker reports it and stops serving.
    pub fn fatal(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Fatal,
            ..Self::new(kind, message)
        }
    }

    /// Append a line to the traceback.
    pub fn with_context(mut self, line: impl Into<String>) -> Self {
        self.traceback.push(line.into());
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.class == ErrorClass::Fatal
    }

    pub fn is_cancelled(&self) -> bool {
        self.class == ErrorClass::Cancelled
    }

    /// Whether this error has the given type name.
    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind == kind
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(err: serde_json::Error) -> Self {
        RemoteError::serialization(err.to_string())
    }
}

/// Last path segment of a type name, without generic parameters.
fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}
