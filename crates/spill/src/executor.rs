//! Worker pool for blocking spill I/O.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use spillway_common::{Result, SpillwayError};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Runs spill encode/decode and file I/O off the caller's thread.
///
/// Work is spawned onto the given runtime and executed with
/// `spawn_blocking`; at most `io_threads` jobs touch the disk at once.
#[derive(Debug, Clone)]
pub struct SpillExecutor {
    handle: Handle,
    io_slots: Arc<Semaphore>,
}

impl SpillExecutor {
    pub fn new(handle: Handle, io_threads: usize) -> Self {
        Self {
            handle,
            io_slots: Arc::new(Semaphore::new(io_threads.max(1))),
        }
    }

    /// Executor bound to the runtime of the calling task.
    pub fn current(io_threads: usize) -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| {
            SpillwayError::Execution(format!("spill executor needs a tokio runtime: {e}"))
        })?;
        Ok(Self::new(handle, io_threads))
    }

    pub fn available_slots(&self) -> usize {
        self.io_slots.available_permits()
    }

    /// Queue `work` and return a future for its result.
    pub fn spawn<T, F>(&self, work: F) -> SpillFuture<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let slots = Arc::clone(&self.io_slots);
        let join = self.handle.spawn(async move {
            let _permit = slots.acquire_owned().await.map_err(|e| {
                SpillwayError::Execution(format!("failed to acquire spill slot: {e}"))
            })?;
            tokio::task::spawn_blocking(work)
                .await
                .map_err(|e| SpillwayError::Execution(format!("spill task failed: {e}")))?
        });
        SpillFuture { join }
    }
}

/// Completion of a job submitted to a [`SpillExecutor`].
///
/// The job runs whether or not the future is polled.
#[derive(Debug)]
pub struct SpillFuture<T> {
    join: JoinHandle<Result<T>>,
}

/// Completion of one spill call.
pub type SpillHandle = SpillFuture<()>;

impl<T> SpillFuture<T> {
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl<T> Future for SpillFuture<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.join).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(e)) => Poll::Ready(Err(SpillwayError::Execution(format!(
                "spill task failed: {e}"
            )))),
        }
    }
}
