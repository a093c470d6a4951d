//! Controller side of the RPC layer.
//!
//! A [`Backend`] is the uniform entry point for remote calls. It wraps a
//! [`Dispatch`] implementation:
//!
//! - **connection**: [`RpcConnection`], a worker reached over a [`Link`]
//! - **local**: [`InProcess`], a [`Worker`](crate::worker::Worker) driven in
//!   this process with the same semantics
//!
//! Results that the worker keeps by reference come back as proxies
//! ([`InstanceProxy`], [`GeneratorProxy`]) that release the remote side
//! when dropped.

pub mod connection;
pub mod local;
pub mod proxy;

pub use connection::{ConnectionCloser, RpcConnection};
pub use local::InProcess;
pub use proxy::{Advance, GeneratorProxy, InstanceProxy, RemoteValue};

use crate::config::ProtocolConfig;
use crate::error::{Result, RpcError};
use crate::protocol::{CallArgs, Handle, Locator, Message, Request, WireValue};
use crate::transport::Link;
use serde_json::Value;
use std::sync::Arc;
use tracing::trace;

/// A successful reply to a dispatched request.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Value(WireValue),
    Yield(Value),
    Stop,
    Ack,
}

impl Reply {
    /// Convert a worker message into a reply, surfacing exceptions as errors.
    pub fn from_message(message: Message) -> Result<Self> {
        match message {
            Message::Return { value, .. } => Ok(Reply::Value(value)),
            Message::Yield { value, .. } => Ok(Reply::Yield(value)),
            Message::Stop { .. } => Ok(Reply::Stop),
            Message::Ack { .. } => Ok(Reply::Ack),
            Message::Exception { error, .. } => Err(error.into()),
            other => Err(RpcError::UnexpectedReply {
                expected: "reply",
                actual: other.kind_name().to_string(),
            }),
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Reply::Value(_) => "return",
            Reply::Yield(_) => "yield",
            Reply::Stop => "stop",
            Reply::Ack => "ack",
        }
    }
}

/// Remote state to release without waiting for the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Instance(Handle),
    Generator(Handle),
}

impl Release {
    pub(crate) fn request(self) -> Request {
        match self {
            Release::Instance(handle) => Request::Del { handle },
            Release::Generator(handle) => Request::Close { handle },
        }
    }

    /// The fire-and-forget call that performs this release.
    pub(crate) fn message(self) -> Message {
        Message::Call {
            id: ProtocolConfig::FIRE_AND_FORGET_ID,
            request: self.request(),
            arguments: CallArgs::new(),
            cancellable: false,
        }
    }

    /// What must be released when `reply` reaches nobody.
    pub(crate) fn orphaned_by(reply: &Message) -> Option<Self> {
        match reply {
            Message::Return {
                value: WireValue::Instance { handle },
                ..
            } => Some(Release::Instance(*handle)),
            Message::Return {
                value: WireValue::Generator { handle },
                ..
            } => Some(Release::Generator(*handle)),
            _ => None,
        }
    }
}

/// Delivers requests to a worker.
#[async_trait::async_trait]
pub trait Dispatch: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Send one request and wait for its reply.
    ///
    /// Calls made inside [`CancellationToken::run`](crate::cancel::CancellationToken::run)
    /// are bound to that token.
    async fn dispatch(&self, request: Request, arguments: CallArgs) -> Result<Reply>;

    /// Schedule a fire-and-forget release. Never blocks, never fails.
    fn release(&self, release: Release);
}

/// Uniform entry point for remote calls, whichever worker serves them.
#[derive(Clone)]
pub struct Backend {
    inner: Arc<dyn Dispatch>,
}

fn is_reserved(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}

fn check_name(name: &str) -> Result<()> {
    if is_reserved(name) {
        return Err(RpcError::ReservedName {
            name: name.to_string(),
        });
    }
    Ok(())
}

impl Backend {
    pub fn new(dispatch: impl Dispatch) -> Self {
        Self {
            inner: Arc::new(dispatch),
        }
    }

    /// A backend over an already negotiated link.
    pub fn over_link(name: impl Into<String>, link: Link) -> Self {
        Self::new(RpcConnection::new(name, link))
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Invoke the callable registered at `locator` (`module.path:Qualified.name`).
    pub async fn static_call(&self, locator: &str, arguments: CallArgs) -> Result<RemoteValue> {
        let locator = Locator::parse(locator)?;
        trace!("[{}] static call {}", self.name(), locator);
        let reply = self
            .inner
            .dispatch(
                Request::Static {
                    locator: locator.to_string(),
                },
                arguments,
            )
            .await?;
        self.wrap(reply)
    }

    /// Invoke a method on a remote instance.
    pub async fn instance_call(
        &self,
        handle: Handle,
        method: &str,
        arguments: CallArgs,
    ) -> Result<RemoteValue> {
        check_name(method)?;
        let reply = self
            .inner
            .dispatch(
                Request::Method {
                    handle,
                    name: method.to_string(),
                },
                arguments,
            )
            .await?;
        self.wrap(reply)
    }

    /// Read an attribute of a remote instance. Attributes always come back by value.
    pub async fn instance_get(&self, handle: Handle, name: &str) -> Result<Value> {
        check_name(name)?;
        let reply = self
            .inner
            .dispatch(
                Request::GetAttr {
                    handle,
                    name: name.to_string(),
                },
                CallArgs::new(),
            )
            .await?;
        match self.wrap(reply)? {
            RemoteValue::Value(value) => Ok(value),
            other => Err(RpcError::UnexpectedReply {
                expected: "value",
                actual: other.kind_name().to_string(),
            }),
        }
    }

    /// Release a remote instance and wait for the worker to confirm.
    pub async fn instance_del(&self, handle: Handle) -> Result<()> {
        self.expect_ack(Request::Del { handle }).await
    }

    pub(crate) async fn generator_next(&self, handle: Handle) -> Result<Option<Value>> {
        match self
            .inner
            .dispatch(Request::Next { handle }, CallArgs::new())
            .await?
        {
            Reply::Yield(value) => Ok(Some(value)),
            Reply::Stop => Ok(None),
            other => Err(RpcError::UnexpectedReply {
                expected: "yield or stop",
                actual: other.kind_name().to_string(),
            }),
        }
    }

    pub(crate) async fn generator_close(&self, handle: Handle) -> Result<()> {
        self.expect_ack(Request::Close { handle }).await
    }

    pub(crate) fn release(&self, release: Release) {
        self.inner.release(release);
    }

    /// Round-trip a no-op request.
    pub async fn ping(&self) -> Result<()> {
        self.expect_ack(Request::Ping).await
    }

    /// Ask the worker to release everything and stop serving.
    pub async fn request_shutdown(&self) -> Result<()> {
        self.expect_ack(Request::Shutdown).await
    }

    async fn expect_ack(&self, request: Request) -> Result<()> {
        match self.inner.dispatch(request, CallArgs::new()).await? {
            Reply::Ack => Ok(()),
            other => Err(RpcError::UnexpectedReply {
                expected: "ack",
                actual: other.kind_name().to_string(),
            }),
        }
    }

    fn wrap(&self, reply: Reply) -> Result<RemoteValue> {
        match reply {
            Reply::Value(WireValue::Value { value }) => Ok(RemoteValue::Value(value)),
            Reply::Value(WireValue::Instance { handle }) => {
                Ok(RemoteValue::Instance(InstanceProxy::new(self.clone(), handle)))
            }
            Reply::Value(WireValue::Generator { handle }) => {
                Ok(RemoteValue::Generator(GeneratorProxy::new(self.clone(), handle)))
            }
            other => Err(RpcError::UnexpectedReply {
                expected: "return",
                actual: other.kind_name().to_string(),
            }),
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").field("name", &self.name()).finish()
    }
}
