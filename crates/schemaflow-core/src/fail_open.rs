//! Best-effort side effects
//!
//! Transcript persistence runs beside the pipeline and never decides its
//! outcome. Agent calls, tool commands and checkpoint writes do not go
//! through here.

use std::future::Future;
use tracing::warn;

use crate::Result;

/// Await `work`, logging and discarding its error
///
/// Returns `None` when `work` failed.
pub async fn fail_open<T>(
    operation: &str,
    thread_id: &str,
    work: impl Future<Output = Result<T>>,
) -> Option<T> {
    work.await
        .map_err(|e| warn!(thread_id, "{} failed, continuing: {}", operation, e))
        .ok()
}
