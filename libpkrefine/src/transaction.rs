use std::future::Future;

use log::debug;
use tokio_util::sync::CancellationToken;

use crate::daemon::{ControlHandle, DaemonResult};
use crate::error::{DaemonError, DaemonErrorCode};

fn cancelled() -> DaemonError {
    DaemonError::new(
        DaemonErrorCode::Cancelled,
        "cancelled while waiting for the transaction slot",
    )
}

/// Issues `issue` against the daemon's exclusive transaction slot.
///
/// Waits until no transaction is active, issues, and on `Busy` goes back to
/// waiting for idle. While another transaction is active it waits for the
/// count to change first. `Busy` is never returned; every other outcome is
/// passed through unchanged.
/// Cancellation is observed at every wait.
pub(crate) async fn run_exclusive<T, F, Fut>(
    control: &dyn ControlHandle,
    cancel: &CancellationToken,
    mut issue: F,
) -> DaemonResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DaemonResult<T>>,
{
    let mut active = control.active_transactions();
    let mut attempt = 0u32;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled()),
            idle = active.wait_for(|n| *n == 0) => {
                if idle.is_err() {
                    return Err(DaemonError::new(
                        DaemonErrorCode::Failed,
                        "daemon stopped reporting active transactions",
                    ));
                }
            }
        }

        attempt += 1;
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled()),
            outcome = issue() => outcome,
        };
        match outcome {
            Err(e) if e.is_busy() => {
                debug!("transaction slot busy on attempt {attempt}");
                if *active.borrow_and_update() == 0 {
                    // the slot was already released
                    continue;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return Err(cancelled()),
                    changed = active.changed() => {
                        if changed.is_err() {
                            return Err(DaemonError::new(
                                DaemonErrorCode::Failed,
                                "daemon stopped reporting active transactions",
                            ));
                        }
                    }
                }
            }
            other => return other,
        }
    }
}
