//! Graceful shutdown
//!
//! Components register a callback when they start. On shutdown the shared
//! [`CancellationToken`] is cancelled first, then the callbacks run one by
//! one in reverse registration order, so what started last stops first:
//!
//! ```text
//!   start:    volumes ──► distribution ──► checker
//!   shutdown: checker ──► distribution ──► volumes
//! ```

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

type Callback = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

#[derive(Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    callbacks: Mutex<Vec<(String, Callback)>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled when shutdown starts.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Registers a callback run on shutdown.
    pub fn on_shutdown<F, Fut>(&self, name: impl Into<String>, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: Callback = Box::new(move || Box::pin(callback()));
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((name.into(), callback));
    }

    /// Cancels the token and runs the callbacks, newest first.
    ///
    /// Calling it again runs only callbacks registered since.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let callbacks = std::mem::take(&mut *self.callbacks.lock().unwrap_or_else(|e| e.into_inner()));
        info!(callbacks = callbacks.len(), "shutting down");
        for (name, callback) in callbacks.into_iter().rev() {
            info!(component = %name, "stopping");
            callback().await;
        }
        info!("shutdown done");
    }

    /// Resolves once shutdown has started.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}
