use log::{debug, error, warn};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::RefineError;

pub type JobResult = Result<(), RefineError>;

/// Completion barrier for one refine call.
///
/// The pending counter starts at one, covering the dispatch phase itself.
/// Every batch reserves a slot before it is issued and releases it once its
/// results are merged. The completion channel fires exactly once, when the
/// counter drains to zero, with the first error seen.
pub struct RefineJob {
    id: Uuid,
    pending: usize,
    dispatched: usize,
    first_error: Option<RefineError>,
    cancel: CancellationToken,
    completion: Option<oneshot::Sender<JobResult>>,
}

impl RefineJob {
    pub fn new(cancel: CancellationToken) -> (Self, oneshot::Receiver<JobResult>) {
        let (tx, rx) = oneshot::channel();
        let job = Self {
            id: Uuid::new_v4(),
            pending: 1,
            dispatched: 0,
            first_error: None,
            cancel,
            completion: Some(tx),
        };
        (job, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Number of batches issued over the life of the job.
    pub fn dispatched(&self) -> usize {
        self.dispatched
    }

    pub fn is_complete(&self) -> bool {
        self.completion.is_none()
    }

    /// Takes a slot for a batch about to be issued.
    pub fn reserve(&mut self) {
        if self.is_complete() {
            error!("[job {}] reserve after completion ignored", self.id);
            return;
        }
        self.pending += 1;
        self.dispatched += 1;
    }

    /// Returns the slot of a finished batch, keeping its error if it is the
    /// first one.
    pub fn release(&mut self, outcome: JobResult) {
        if self.pending == 0 {
            error!("[job {}] release with no pending operations", self.id);
            return;
        }
        if let Err(e) = outcome {
            match &self.first_error {
                None => self.first_error = Some(e),
                Some(_) => warn!("[job {}] discarding further error: {e}", self.id),
            }
        }
        self.pending -= 1;
        if self.pending == 0 {
            self.complete();
        }
    }

    /// Returns the slot held for the dispatch phase.
    pub fn release_dispatch(&mut self) {
        self.release(Ok(()));
    }

    fn complete(&mut self) {
        let Some(tx) = self.completion.take() else {
            return;
        };
        let result = if self.cancel.is_cancelled() {
            if let Some(e) = self.first_error.take() {
                debug!("[job {}] cancelled, dropping error: {e}", self.id);
            }
            Err(RefineError::cancelled())
        } else {
            match self.first_error.take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        };
        debug!(
            "[job {}] complete after {} batches: {result:?}",
            self.id, self.dispatched
        );
        // the caller may have stopped waiting
        let _ = tx.send(result);
    }
}
