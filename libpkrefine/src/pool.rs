use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::RefineError;

/// Bounded pool for daemon calls that only exist in blocking form.
///
/// Jobs run on the runtime's blocking threads, never on the caller's task;
/// at most `width` of them run at once.
#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    width: usize,
}

impl WorkerPool {
    pub fn new(width: usize) -> Self {
        let width = width.max(1);
        Self {
            permits: Arc::new(Semaphore::new(width)),
            width,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub async fn run<F, T>(&self, job: F) -> Result<T, RefineError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| RefineError::Failed(format!("worker pool closed: {e}")))?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|e| RefineError::Failed(format!("worker job failed: {e}")))
    }
}
