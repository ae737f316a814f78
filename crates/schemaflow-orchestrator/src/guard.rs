//! Cancellation and timeout guard
//!
//! Composes the caller's cancellation signal with a wall-clock deadline into
//! one derived signal. Cancellation is advisory: the guarded function keeps
//! running until it notices the signal and returns on its own.

use schemaflow_core::{FlowError, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const PRE_ABORT_MESSAGE: &str = "Request already aborted";

/// Run `f` under `external` and a `timeout` deadline
///
/// `f` receives a child of `external` that is also cancelled when the
/// deadline passes. Returns `f`'s own result; the only other error is a
/// pre-cancelled `external`, in which case `f` is never called. The deadline
/// timer lives inside this future, so it is gone as soon as `f` settles.
pub async fn guard<F, Fut, T>(f: F, timeout: Duration, external: &CancellationToken) -> Result<T>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if external.is_cancelled() {
        return Err(FlowError::Aborted(PRE_ABORT_MESSAGE.to_string()));
    }

    let derived = external.child_token();
    let work = f(derived.clone());
    tokio::pin!(work);

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut expired = false;

    loop {
        tokio::select! {
            result = &mut work => {
                debug!("Guarded work settled (deadline expired: {})", expired);
                return result;
            }
            _ = &mut deadline, if !expired => {
                expired = true;
                warn!("Deadline of {:?} reached, cancelling run", timeout);
                derived.cancel();
            }
        }
    }
}
