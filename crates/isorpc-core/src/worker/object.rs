//! Worker-side capabilities: callables, instances and generator sessions.

use crate::cancel::CancellationToken;
use crate::error::RemoteError;
use crate::protocol::{CallArgs, CallId};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

/// Per-call execution context handed to worker code.
///
/// Cancellation is cooperative: long-running code calls [`check`](Self::check)
/// or sleeps through [`sleep`](Self::sleep), which wakes as soon as the
/// controller interrupts the call.
#[derive(Debug, Clone)]
pub struct CallContext {
    call_id: CallId,
    token: CancellationToken,
}

impl CallContext {
    pub fn new(call_id: CallId, token: CancellationToken) -> Self {
        Self { call_id, token }
    }

    /// A context that is never interrupted, for calls made outside a connection.
    pub fn detached() -> Self {
        Self::new(0, CancellationToken::new())
    }

    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fail with a cancellation error if the controller interrupted this call.
    pub fn check(&self) -> Result<(), RemoteError> {
        self.token.check().map_err(RemoteError::from)
    }

    /// Sleep for `duration`, returning a cancellation error as soon as the call is interrupted.
    pub fn sleep(&self, duration: Duration) -> Result<(), RemoteError> {
        self.token.wait_timeout(duration);
        self.check()
    }
}

/// What a callable produced.
pub enum Outcome {
    /// Returned by value.
    Value(Value),
    /// Entered in the instance table; the controller receives a handle.
    Instance(Box<dyn RemoteObject>),
    /// Opened as a generator session; the controller receives a handle.
    Generator(Box<dyn RemoteGenerator>),
}

impl Outcome {
    /// Serialize any value into a by-value outcome.
    pub fn value<T: Serialize + ?Sized>(value: &T) -> Result<Self, RemoteError> {
        Ok(Outcome::Value(serde_json::to_value(value)?))
    }

    pub fn none() -> Self {
        Outcome::Value(Value::Null)
    }

    pub fn instance(object: impl RemoteObject) -> Self {
        Outcome::Instance(Box::new(object))
    }

    pub fn generator(generator: impl RemoteGenerator) -> Self {
        Outcome::Generator(Box::new(generator))
    }

    /// A generator session over an infallible iterator.
    pub fn iter<I>(iter: I) -> Self
    where
        I: Iterator<Item = Value> + Send + 'static,
    {
        Outcome::generator(IterGenerator::new(iter.map(Ok)))
    }
}

impl std::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Outcome::Instance(_) => f.write_str("Instance"),
            Outcome::Generator(_) => f.write_str("Generator"),
        }
    }
}

/// A stateful object owned by the worker and addressed by handle.
pub trait RemoteObject: Send + 'static {
    /// Invoke a method.
    fn call_method(
        &mut self,
        name: &str,
        args: CallArgs,
        ctx: &CallContext,
    ) -> Result<Outcome, RemoteError>;

    /// Read an attribute. Unknown attributes are an `AttributeError`.
    fn get_attribute(&self, name: &str) -> Result<Value, RemoteError> {
        Err(RemoteError::attribute_error(name))
    }
}

/// A generator session: produces values one advance at a time.
pub trait RemoteGenerator: Send + 'static {
    /// Produce the next value, or `None` when exhausted.
    fn advance(&mut self, ctx: &CallContext) -> Result<Option<Value>, RemoteError>;

    /// Release resources held by the session.
    ///
    /// Called exactly once, when the session leaves the instance table for
    /// any reason: exhaustion, error, cancellation, close, deletion or
    /// worker shutdown.
    fn close(&mut self) {}
}

/// Adapts an iterator of results into a generator session.
///
/// Closing drops the iterator, which runs its cleanup.
pub struct IterGenerator<I> {
    iter: Option<I>,
}

impl<I> IterGenerator<I> {
    pub fn new(iter: I) -> Self {
        Self { iter: Some(iter) }
    }
}

impl<I> RemoteGenerator for IterGenerator<I>
where
    I: Iterator<Item = Result<Value, RemoteError>> + Send + 'static,
{
    fn advance(&mut self, ctx: &CallContext) -> Result<Option<Value>, RemoteError> {
        ctx.check()?;
        match self.iter.as_mut() {
            Some(iter) => iter.next().transpose(),
            None => Ok(None),
        }
    }

    fn close(&mut self) {
        self.iter = None;
    }
}
