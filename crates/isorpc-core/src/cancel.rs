//! Cooperative cancellation.
//!
//! A `CancellationToken` is shared by the code that owns a call and the code
//! executing it. On the controller, [`CancellationToken::run`] installs a token
//! as the current token of the running task; every backend call made inside
//! that scope is bound to it and forwards an interrupt when it fires. On the
//! worker, each call gets a fresh token handed to user code through
//! [`CallContext`](crate::worker::CallContext).

use crate::error::RpcError;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

const INACTIVE: u8 = 0;
const REQUESTED: u8 = 1;
const OBSERVED: u8 = 2;

tokio::task_local! {
    static CURRENT: CancellationToken;
}

/// Lifecycle of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    /// No cancellation requested.
    Inactive,
    /// Cancellation requested but not yet observed by the bound call.
    Active,
    /// The bound call aborted and reported it.
    Observed,
}

#[derive(Debug, Default)]
struct Inner {
    state: AtomicU8,
    bound: AtomicBool,
    notify: Notify,
    lock: Mutex<()>,
    wakeup: Condvar,
}

/// A cancellation token for cooperative cancellation of calls.
///
/// Clones share state: cancelling any clone cancels all of them.
///
/// # Example
///
/// ```
/// use isorpc::cancel::CancellationToken;
///
/// let token = CancellationToken::new();
/// let token_clone = token.clone();
///
/// // Cancel from another thread or task
/// token_clone.cancel();
/// assert!(token.is_cancelled());
/// assert!(token.check().is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    /// Create a new cancellation token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Callable from any thread.
    pub fn cancel(&self) {
        let _ = self.inner.state.compare_exchange(
            INACTIVE,
            REQUESTED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.inner.notify.notify_waiters();

        // Taken so a blocking waiter cannot miss the wakeup between its check and its wait.
        let _guard = self
            .inner
            .lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.inner.wakeup.notify_all();
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) != INACTIVE
    }

    pub fn state(&self) -> TokenState {
        match self.inner.state.load(Ordering::SeqCst) {
            INACTIVE => TokenState::Inactive,
            REQUESTED => TokenState::Active,
            _ => TokenState::Observed,
        }
    }

    /// Check cancellation and return an error if cancelled.
    ///
    /// A failed check marks the cancellation as observed.
    pub fn check(&self) -> Result<(), CancelledError> {
        if self.is_cancelled() {
            self.mark_observed();
            Err(CancelledError)
        } else {
            Ok(())
        }
    }

    pub(crate) fn mark_observed(&self) {
        let _ = self.inner.state.compare_exchange(
            REQUESTED,
            OBSERVED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Wait until cancellation is requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Block the current thread for up to `timeout`, waking early on cancel.
    ///
    /// Returns `true` if the token was cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self
            .inner
            .lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let _ = self
            .inner
            .wakeup
            .wait_timeout_while(guard, timeout, |_| !self.is_cancelled())
            .unwrap_or_else(PoisonError::into_inner);
        self.is_cancelled()
    }

    /// Reset the token for reuse.
    ///
    /// Use with caution - ensure no call is still bound to this token.
    pub fn reset(&self) {
        self.inner.state.store(INACTIVE, Ordering::SeqCst);
    }

    /// Create a child token that shares cancellation state with this token.
    ///
    /// Cancelling either the parent or child will cancel both.
    pub fn child_token(&self) -> Self {
        self.clone()
    }

    /// Bind this token to an in-flight call.
    ///
    /// Fails with [`RpcError::TokenInUse`] while another call holds the binding.
    pub fn bind(&self) -> Result<TokenBinding, RpcError> {
        self.inner
            .bound
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| RpcError::TokenInUse)?;
        Ok(TokenBinding {
            token: self.clone(),
        })
    }

    /// Whether a call currently holds the binding.
    pub fn is_bound(&self) -> bool {
        self.inner.bound.load(Ordering::SeqCst)
    }

    /// Run `future` with this token as the current token of the task.
    ///
    /// Fails with [`RpcError::TokenAlreadyActive`] if the task is already
    /// inside another token's scope. Tasks spawned from inside the scope do
    /// not inherit the token.
    pub async fn run<F>(&self, future: F) -> Result<F::Output, RpcError>
    where
        F: Future,
    {
        if CURRENT.try_with(|_| ()).is_ok() {
            return Err(RpcError::TokenAlreadyActive);
        }
        Ok(CURRENT.scope(self.clone(), future).await)
    }

    /// The token installed by the enclosing [`run`](Self::run), if any.
    pub fn current() -> Option<CancellationToken> {
        CURRENT.try_with(Clone::clone).ok()
    }
}

/// Releases a token's call binding when dropped.
#[derive(Debug)]
pub struct TokenBinding {
    token: CancellationToken,
}

impl TokenBinding {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for TokenBinding {
    fn drop(&mut self) {
        self.token.inner.bound.store(false, Ordering::SeqCst);
    }
}

/// Error returned when an operation is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelledError;

impl std::fmt::Display for CancelledError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Operation was cancelled")
    }
}

impl std::error::Error for CancelledError {}

impl From<CancelledError> for RpcError {
    fn from(_: CancelledError) -> Self {
        RpcError::Cancelled
    }
}

impl From<CancelledError> for crate::error::RemoteError {
    fn from(_: CancelledError) -> Self {
        crate::error::RemoteError::cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_new_token_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert_eq!(token.state(), TokenState::Inactive);
    }

    #[test]
    fn test_cancel_then_observe() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(token.is_cancelled());
        assert_eq!(token.state(), TokenState::Active);

        assert_eq!(token.check(), Err(CancelledError));
        assert_eq!(token.state(), TokenState::Observed);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_reset() {
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(token.check(), Err(CancelledError));
        token.reset();
        assert_eq!(token.state(), TokenState::Inactive);
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
    }

    #[test]
    fn test_clone_shares_state() {
        let token1 = CancellationToken::new();
        let token2 = token1.clone();

        token2.cancel();

        assert!(token1.is_cancelled());
        assert!(token2.is_cancelled());
    }

    #[test]
    fn test_child_token_shares_cancellation() {
        let parent = CancellationToken::new();
        let child = parent.child_token();

        child.cancel();
        assert!(parent.is_cancelled());

        parent.reset();
        assert!(!child.is_cancelled());

        let _binding = child.bind().unwrap();
        assert!(parent.is_bound());
    }

    #[test]
    fn test_bind_is_exclusive() {
        let token = CancellationToken::new();
        let binding = token.bind().unwrap();
        assert!(token.is_bound());
        assert!(matches!(token.bind(), Err(RpcError::TokenInUse)));

        drop(binding);
        assert!(!token.is_bound());
        assert!(token.bind().is_ok());
    }

    #[test]
    fn test_wait_timeout_wakes_on_cancel() {
        let token = CancellationToken::new();
        let remote = token.clone();
        let started = Instant::now();

        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });

        assert!(token.wait_timeout(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(5));
        canceller.join().unwrap();
    }

    #[test]
    fn test_wait_timeout_expires() {
        let token = CancellationToken::new();
        assert!(!token.wait_timeout(Duration::from_millis(5)));
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let token = CancellationToken::new();
        let remote = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            remote.cancel();
        });

        tokio::time::timeout(Duration::from_secs(5), token.cancelled())
            .await
            .expect("token should fire");
    }

    #[tokio::test]
    async fn test_run_installs_current_token() {
        assert!(CancellationToken::current().is_none());

        let token = CancellationToken::new();
        let inner = token
            .run(async {
                let current = CancellationToken::current().unwrap();
                current.cancel();
            })
            .await;
        assert!(inner.is_ok());
        assert!(token.is_cancelled());
        assert!(CancellationToken::current().is_none());
    }

    #[tokio::test]
    async fn test_nested_run_is_rejected() {
        let outer = CancellationToken::new();
        let result = outer
            .run(async {
                let inner = CancellationToken::new();
                inner.run(async {}).await
            })
            .await
            .unwrap();
        assert!(matches!(result, Err(RpcError::TokenAlreadyActive)));
    }

    #[test]
    fn test_cancelled_error_display() {
        assert_eq!(CancelledError.to_string(), "Operation was cancelled");
    }
}
