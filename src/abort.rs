//! Cancelable fetch futures.
//!
//! An [`AbortableFetch`] is an ordinary future paired with an [`AbortHandle`].
//! Calling `abort()` asks the underlying work to stop (best effort) and makes the
//! fetch resolve with [`FetchError::Aborted`] the next time it is polled.
//!
//! Fetches derived with [`AbortableFetch::then`] carry the handle of the fetch
//! they were built from: aborting the derived value aborts the original, and
//! `is_aborted()` on either reports the same live state.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use tokio::sync::Notify;

/// Why a fetch did not produce a payload.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("fetch aborted")]
    Aborted,

    #[error("request to {url} failed with status {status}")]
    Status { url: String, status: u16 },

    #[error("request to {url} failed: {reason}")]
    Transport { url: String, reason: String },

    #[error("failed to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Default)]
struct AbortState {
    aborted: AtomicBool,
    notify: Notify,
}

/// Shared cancel switch for one in-flight fetch.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AbortState>);

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Returns `true` only for the call that flipped the state.
    pub fn abort(&self) -> bool {
        if self.0.aborted.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.0.notify.notify_waiters();
        true
    }

    pub fn is_aborted(&self) -> bool {
        self.0.aborted.load(Ordering::SeqCst)
    }

    /// Completes once `abort()` has been called.
    pub async fn aborted(&self) {
        loop {
            // Registered before the flag check so a concurrent abort is not missed.
            let notified = self.0.notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}

/// A fetch future that can be canceled through its [`AbortHandle`].
pub struct AbortableFetch<T> {
    future: BoxFuture<'static, Result<T, FetchError>>,
    handle: AbortHandle,
}

impl<T: Send + 'static> AbortableFetch<T> {
    /// Wrap `future` with a fresh abort handle.
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        Self::with_handle(future, AbortHandle::new())
    }

    /// Wrap `future` so that aborting `handle` drops it and resolves `Aborted`.
    pub fn with_handle<F>(future: F, handle: AbortHandle) -> Self
    where
        F: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let signal = handle.clone();
        let raced = async move {
            tokio::select! {
                biased;
                _ = signal.aborted() => Err(FetchError::Aborted),
                result = future => result,
            }
        };
        Self {
            future: Box::pin(raced),
            handle,
        }
    }

    /// An already-resolved fetch.
    pub fn ready(value: T) -> Self {
        Self {
            future: Box::pin(async move { Ok(value) }),
            handle: AbortHandle::new(),
        }
    }

    pub fn abort(&self) -> bool {
        self.handle.abort()
    }

    pub fn is_aborted(&self) -> bool {
        self.handle.is_aborted()
    }

    pub fn handle(&self) -> AbortHandle {
        self.handle.clone()
    }

    /// Post-process the outcome without losing the abort handle.
    ///
    /// `f` receives the original outcome and the shared handle, so it can tell
    /// an aborted fetch apart from one that merely failed.
    pub fn then<U, F>(self, f: F) -> AbortableFetch<U>
    where
        U: Send + 'static,
        F: FnOnce(Result<T, FetchError>, &AbortHandle) -> Result<U, FetchError> + Send + 'static,
    {
        let handle = self.handle;
        let observed = handle.clone();
        let future = self.future;
        AbortableFetch {
            future: Box::pin(async move {
                let outcome = future.await;
                f(outcome, &observed)
            }),
            handle,
        }
    }
}

impl<T> Future for AbortableFetch<T> {
    type Output = Result<T, FetchError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.future.as_mut().poll(cx)
    }
}
