//! The message union exchanged between controller and worker.

use super::types::{CallArgs, CallId, Handle};
use crate::error::RemoteError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single protocol message.
///
/// `call` and `interrupt` travel controller to worker; everything else is a
/// reply travelling back. Every reply carries the id of the call it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    Call {
        id: CallId,
        request: Request,
        #[serde(default)]
        arguments: CallArgs,
        /// Whether the controller may interrupt this call.
        #[serde(default)]
        cancellable: bool,
    },
    Return {
        id: CallId,
        value: WireValue,
    },
    Exception {
        id: CallId,
        error: RemoteError,
    },
    /// One value produced by a generator session.
    Yield {
        id: CallId,
        value: Value,
    },
    /// The generator session is exhausted and already closed by the worker.
    Stop {
        id: CallId,
    },
    /// Cancel the call with `call_id`. Sent on the interrupt channel.
    Interrupt {
        call_id: CallId,
    },
    Ack {
        id: CallId,
    },
}

impl Message {
    /// Id of the call this message answers, for replies.
    pub fn reply_id(&self) -> Option<CallId> {
        match self {
            Message::Return { id, .. }
            | Message::Exception { id, .. }
            | Message::Yield { id, .. }
            | Message::Stop { id }
            | Message::Ack { id } => Some(*id),
            Message::Call { .. } | Message::Interrupt { .. } => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Message::Call { .. } => "call",
            Message::Return { .. } => "return",
            Message::Exception { .. } => "exception",
            Message::Yield { .. } => "yield",
            Message::Stop { .. } => "stop",
            Message::Interrupt { .. } => "interrupt",
            Message::Ack { .. } => "ack",
        }
    }
}

/// What a `call` asks the worker to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Invoke the callable registered at `locator`.
    Static { locator: String },
    /// Invoke a method on a live instance.
    Method { handle: Handle, name: String },
    /// Read an attribute of a live instance.
    GetAttr { handle: Handle, name: String },
    /// Advance a generator session by one value.
    Next { handle: Handle },
    /// Close a generator session early.
    Close { handle: Handle },
    /// Drop a live instance or generator session.
    Del { handle: Handle },
    /// Health check.
    Ping,
    /// Stop serving after acknowledging.
    Shutdown,
}

impl Request {
    pub fn op_name(&self) -> &'static str {
        match self {
            Request::Static { .. } => "static",
            Request::Method { .. } => "method",
            Request::GetAttr { .. } => "get_attr",
            Request::Next { .. } => "next",
            Request::Close { .. } => "close",
            Request::Del { .. } => "del",
            Request::Ping => "ping",
            Request::Shutdown => "shutdown",
        }
    }
}

/// Result of a `call`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireValue {
    /// A plain value.
    Value { value: Value },
    /// A newly tracked instance.
    Instance { handle: Handle },
    /// A newly opened generator session.
    Generator { handle: Handle },
}

impl WireValue {
    pub fn value(value: impl Into<Value>) -> Self {
        WireValue::Value {
            value: value.into(),
        }
    }
}
