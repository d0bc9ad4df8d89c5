//! Event loop handle shared by pull contexts.
//!
//! Wraps the tokio runtime handle the transfer jobs are spawned on, plus an
//! exit slot a context fills when it finishes without a completion callback.

use crate::error::{PullError, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Handle to the loop driving one or more pulls.
#[derive(Clone)]
pub struct EventLoop {
    handle: Handle,
    exit_tx: Arc<watch::Sender<Option<i32>>>,
}

impl EventLoop {
    pub fn new(handle: Handle) -> Self {
        let (exit_tx, _) = watch::channel(None);
        Self {
            handle,
            exit_tx: Arc::new(exit_tx),
        }
    }

    /// Bind to the runtime of the calling task.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| PullError::EventLoopInit(e.to_string()))
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Ask the loop to stop with `code`. The first request wins.
    pub fn exit(&self, code: i32) {
        self.exit_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(code);
            true
        });
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_tx.borrow()
    }

    /// Wait until some context asked the loop to exit.
    pub async fn wait(&self) -> i32 {
        let mut exit_rx = self.exit_tx.subscribe();
        match exit_rx.wait_for(Option::is_some).await {
            Ok(code) => code.unwrap_or_default(),
            Err(_) => 0,
        }
    }
}
