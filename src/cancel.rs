//! Cooperative cancellation helpers.
//!
//! Every suspension point in the pipeline takes a shared
//! [`CancellationToken`]. Cancellation is monotonic: once cancelled, the
//! token stays cancelled.

use crate::PatchflowError;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

pub use tokio_util::sync::CancellationToken;

/// Longest time a blocking wait goes without re-checking the token.
pub const POLL_SLICE: Duration = Duration::from_millis(50);

/// Fail with `OperationCancelled` if the token has been cancelled.
pub fn ensure_not_cancelled(token: &CancellationToken) -> Result<(), PatchflowError> {
    if token.is_cancelled() {
        return Err(PatchflowError::OperationCancelled);
    }
    Ok(())
}

/// Block the current thread for `duration`, waking early on cancellation.
pub fn sleep(token: &CancellationToken, duration: Duration) -> Result<(), PatchflowError> {
    let deadline = Instant::now() + duration;
    loop {
        ensure_not_cancelled(token)?;
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        std::thread::sleep(POLL_SLICE.min(deadline - now));
    }
}

/// Run a blocking call on a helper thread and wait for it in slices.
///
/// Fails with `OperationCancelled` as soon as the token fires and with
/// `Transport` once `limit` elapses. An abandoned call keeps running on its
/// thread until it returns; its result is dropped.
pub fn run_blocking<T, F>(
    token: &CancellationToken,
    limit: Duration,
    call: F,
) -> Result<T, PatchflowError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, PatchflowError> + Send + 'static,
{
    ensure_not_cancelled(token)?;
    let (tx, rx) = mpsc::sync_channel(1);
    thread::Builder::new()
        .name("blocking-call".to_string())
        .spawn(move || {
            let _ = tx.send(call());
        })
        .map_err(|e| PatchflowError::Io(format!("Failed to spawn helper thread: {}", e)))?;

    let deadline = Instant::now() + limit;
    loop {
        ensure_not_cancelled(token)?;
        match rx.recv_timeout(POLL_SLICE) {
            Ok(result) => {
                ensure_not_cancelled(token)?;
                return result;
            }
            Err(RecvTimeoutError::Timeout) if Instant::now() >= deadline => {
                return Err(PatchflowError::Transport(format!(
                    "no answer within {:?}",
                    limit
                )));
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                return Err(PatchflowError::Transport(
                    "blocking call ended without a result".to_string(),
                ));
            }
        }
    }
}
