//! Controller-side proxies for worker-owned state.
//!
//! Dropping a proxy schedules a fire-and-forget release through the
//! backend; it never blocks and never fails. Use
//! [`InstanceProxy::release`] or [`GeneratorProxy::close`] to release
//! deterministically.

use super::{Backend, Release};
use crate::error::{Result, RpcError};
use crate::protocol::{CallArgs, Handle};
use futures::stream::{self, Stream};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::trace;

/// Result of a backend call.
#[derive(Debug)]
pub enum RemoteValue {
    /// Returned by value.
    Value(Value),
    /// Owned by the worker, addressed through a proxy.
    Instance(InstanceProxy),
    /// A generator session.
    Generator(GeneratorProxy),
}

impl RemoteValue {
    pub fn kind_name(&self) -> &'static str {
        match self {
            RemoteValue::Value(_) => "value",
            RemoteValue::Instance(_) => "instance",
            RemoteValue::Generator(_) => "generator",
        }
    }

    fn unexpected(&self, expected: &'static str) -> RpcError {
        RpcError::UnexpectedReply {
            expected,
            actual: self.kind_name().to_string(),
        }
    }

    pub fn into_value(self) -> Result<Value> {
        match self {
            RemoteValue::Value(value) => Ok(value),
            other => Err(other.unexpected("value")),
        }
    }

    /// Deserialize a by-value result.
    pub fn deserialize<T: DeserializeOwned>(self) -> Result<T> {
        let value = self.into_value()?;
        serde_json::from_value(value).map_err(RpcError::from)
    }

    pub fn into_instance(self) -> Result<InstanceProxy> {
        match self {
            RemoteValue::Instance(instance) => Ok(instance),
            other => Err(other.unexpected("instance")),
        }
    }

    pub fn into_generator(self) -> Result<GeneratorProxy> {
        match self {
            RemoteValue::Generator(generator) => Ok(generator),
            other => Err(other.unexpected("generator")),
        }
    }
}

/// A worker-owned instance.
///
/// Method calls and attribute reads are forwarded by handle. The proxy is
/// the only controller-side owner of the handle; dropping it deletes the
/// instance on the worker.
#[derive(Debug)]
pub struct InstanceProxy {
    backend: Backend,
    handle: Handle,
    released: bool,
}

impl InstanceProxy {
    pub(crate) fn new(backend: Backend, handle: Handle) -> Self {
        Self {
            backend,
            handle,
            released: false,
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Invoke a method on the instance.
    pub async fn call(&self, method: &str, arguments: CallArgs) -> Result<RemoteValue> {
        self.backend
            .instance_call(self.handle, method, arguments)
            .await
    }

    /// Read an attribute of the instance.
    pub async fn get(&self, name: &str) -> Result<Value> {
        self.backend.instance_get(self.handle, name).await
    }

    /// Delete the instance and wait for the worker to confirm.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.backend.instance_del(self.handle).await
    }
}

impl Drop for InstanceProxy {
    fn drop(&mut self) {
        if !self.released {
            trace!("Dropping proxy for instance {}", self.handle);
            self.backend.release(Release::Instance(self.handle));
        }
    }
}

/// One step of a generator session.
#[derive(Debug, Clone, PartialEq)]
pub enum Advance {
    Value(Value),
    End,
}

/// A worker-side generator session.
///
/// Each [`advance`](Self::advance) is one round trip. Once the session has
/// reported its end or an error it never advances again. Dropping a
/// session the worker has not already removed closes it there.
#[derive(Debug)]
pub struct GeneratorProxy {
    backend: Backend,
    handle: Handle,
    /// The worker removed the session.
    exhausted: bool,
    /// No further advances.
    done: bool,
    released: bool,
}

impl GeneratorProxy {
    pub(crate) fn new(backend: Backend, handle: Handle) -> Self {
        Self {
            backend,
            handle,
            exhausted: false,
            done: false,
            released: false,
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Whether the session has ended.
    pub fn is_finished(&self) -> bool {
        self.done || self.exhausted || self.released
    }

    /// Request the next value.
    pub async fn advance(&mut self) -> Result<Advance> {
        if self.is_finished() {
            return Ok(Advance::End);
        }
        match self.backend.generator_next(self.handle).await {
            Ok(Some(value)) => Ok(Advance::Value(value)),
            Ok(None) => {
                self.exhausted = true;
                self.done = true;
                Ok(Advance::End)
            }
            Err(err) => {
                self.done = true;
                // Errors raised by the generator itself close the session on the worker
                self.exhausted = matches!(err, RpcError::Remote(_));
                Err(err)
            }
        }
    }

    /// Request the next value, `None` once the session has ended.
    pub async fn next(&mut self) -> Result<Option<Value>> {
        match self.advance().await? {
            Advance::Value(value) => Ok(Some(value)),
            Advance::End => Ok(None),
        }
    }

    /// Close the session early and wait for the worker to confirm.
    pub async fn close(mut self) -> Result<()> {
        if self.exhausted || self.released {
            return Ok(());
        }
        self.released = true;
        match self.backend.generator_close(self.handle).await {
            Err(RpcError::UnknownInstance { .. }) if self.done => Ok(()),
            result => result,
        }
    }

    /// Drain the remaining values.
    pub async fn collect(mut self) -> Result<Vec<Value>> {
        let mut values = Vec::new();
        while let Some(value) = self.next().await? {
            values.push(value);
        }
        Ok(values)
    }

    /// Adapt into a [`Stream`]. The stream ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Value>> + Send {
        stream::unfold(Some(self), |generator| async move {
            let mut generator = generator?;
            match generator.next().await {
                Ok(Some(value)) => Some((Ok(value), Some(generator))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }
}

impl Drop for GeneratorProxy {
    fn drop(&mut self) {
        if !self.exhausted && !self.released {
            trace!("Dropping open generator session {}", self.handle);
            self.backend.release(Release::Generator(self.handle));
        }
    }
}
