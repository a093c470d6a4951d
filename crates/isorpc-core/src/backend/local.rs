//! In-process backend.
//!
//! Drives a [`Worker`] in the controller's own process. Calls still run on
//! the blocking pool and still go through handles, so code written against
//! a remote worker behaves the same without the process boundary.

use super::{Backend, Dispatch, Release, Reply};
use crate::cancel::CancellationToken;
use crate::error::{Result, RpcError};
use crate::protocol::{CallArgs, Message, Request};
use crate::worker::{Registry, Worker};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, trace};

/// A worker driven directly, without a transport.
pub struct InProcess {
    name: String,
    worker: Arc<Worker>,
    next_id: AtomicU64,
    gate: Mutex<()>,
    terminated: AtomicBool,
}

impl InProcess {
    pub fn new(name: impl Into<String>, worker: Arc<Worker>) -> Self {
        Self {
            name: name.into(),
            worker,
            next_id: AtomicU64::new(1),
            gate: Mutex::new(()),
            terminated: AtomicBool::new(false),
        }
    }

    /// A backend serving `registry` in this process.
    pub fn backend(registry: Registry) -> Backend {
        Backend::new(Self::new("in-process", Arc::new(Worker::new(registry))))
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }
}

#[async_trait::async_trait]
impl Dispatch for InProcess {
    fn name(&self) -> &str {
        &self.name
    }

    async fn dispatch(&self, request: Request, arguments: CallArgs) -> Result<Reply> {
        let token = CancellationToken::current();
        let _binding = token.as_ref().map(CancellationToken::bind).transpose()?;
        if let Some(token) = &token {
            if token.is_cancelled() {
                token.mark_observed();
                return Err(RpcError::Cancelled);
            }
        }

        let _gate = self.gate.lock().await;
        if self.terminated.load(Ordering::SeqCst) {
            return Err(RpcError::ConnectionClosed);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let message = Message::Call {
            id,
            request,
            arguments,
            cancellable: token.is_some(),
        };

        let worker = self.worker.clone();
        let (done, mut finished) = oneshot::channel();
        tokio::task::spawn_blocking(move || {
            let handled = worker.handle(message);
            if let Err(handled) = done.send(handled) {
                // Abandoned by the caller
                if let Some(orphan) = handled.reply.as_ref().and_then(Release::orphaned_by) {
                    debug!("Releasing {:?} from abandoned call {}", orphan, id);
                    worker.handle(orphan.message());
                }
            }
        });
        let handled = tokio::select! {
            biased;
            handled = &mut finished => handled,
            _ = async {
                match &token {
                    Some(token) => token.cancelled().await,
                    None => std::future::pending().await,
                }
            } => {
                debug!("[{}] Interrupting call {}", self.name, id);
                self.worker.handle_interrupt(id);
                finished.await
            }
        }
        .map_err(|_| RpcError::protocol(format!("call task for call {} failed", id)))?;

        if handled.terminate {
            debug!("[{}] Worker terminated after call {}", self.name, id);
            self.terminated.store(true, Ordering::SeqCst);
            let worker = self.worker.clone();
            let _ = tokio::task::spawn_blocking(move || worker.shutdown()).await;
        }
        let reply = handled.reply.ok_or(RpcError::ConnectionClosed)?;
        let reply = Reply::from_message(reply);
        if let (Err(RpcError::Cancelled), Some(token)) = (&reply, &token) {
            token.mark_observed();
        }
        reply
    }

    fn release(&self, release: Release) {
        let message = release.message();
        trace!("[{}] Releasing {:?}", self.name, release);
        let worker = self.worker.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || worker.handle(message));
            }
            Err(_) => {
                worker.handle(message);
            }
        }
    }
}

impl std::fmt::Debug for InProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcess")
            .field("name", &self.name)
            .field("worker", &self.worker)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::protocol::WireValue;
    use std::time::Duration;

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .function("t:add", |args, _ctx| {
                Ok(args.get::<i64>(0)? + args.get::<i64>(1)?)
            })
            .unwrap()
            .function("t:wait", |_args, ctx| -> std::result::Result<(), RemoteError> {
                loop {
                    ctx.sleep(Duration::from_millis(10))?;
                }
            })
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_in_process_call() {
        let local = InProcess::new("local", Arc::new(Worker::new(registry())));
        let reply = local
            .dispatch(
                Request::Static {
                    locator: "t:add".into(),
                },
                CallArgs::positional([20, 22]),
            )
            .await
            .unwrap();
        assert_eq!(reply, Reply::Value(WireValue::value(42)));
        assert_eq!(local.worker().call_count(), 1);
    }

    #[tokio::test]
    async fn test_in_process_cancel() {
        let local = InProcess::new("local", Arc::new(Worker::new(registry())));
        let token = CancellationToken::new();

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                token.cancel();
            })
        };

        let result = token
            .run(local.dispatch(
                Request::Static {
                    locator: "t:wait".into(),
                },
                CallArgs::new(),
            ))
            .await
            .unwrap();
        canceller.await.unwrap();

        assert!(matches!(result, Err(RpcError::Cancelled)));
        assert_eq!(token.state(), crate::cancel::TokenState::Observed);
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_fail() {
        let local = InProcess::new("local", Arc::new(Worker::new(registry())));
        assert_eq!(
            local.dispatch(Request::Shutdown, CallArgs::new()).await.unwrap(),
            Reply::Ack
        );
        let err = local.dispatch(Request::Ping, CallArgs::new()).await.unwrap_err();
        assert!(matches!(err, RpcError::ConnectionClosed));
    }
}
