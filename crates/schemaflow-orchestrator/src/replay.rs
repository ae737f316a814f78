//! Replay of a stored run
//!
//! Re-derives the event stream from the latest checkpoint of a thread.
//! Agents are never invoked.

use crate::checkpoint::CheckpointStore;
use crate::progress::state_events;
use async_stream::stream;
use futures::Stream;
use schemaflow_core::{ProgressEvent, StageCursor};
use std::sync::Arc;
use tracing::{info, warn};

pub const NO_CHECKPOINT_MESSAGE: &str = "No checkpoint found for replay";

/// Events for the latest checkpoint of `thread_id`, ending with `end`
pub fn replay(
    store: Arc<dyn CheckpointStore>,
    thread_id: String,
) -> impl Stream<Item = ProgressEvent> + Send + 'static {
    stream! {
        match store.load_latest_checkpoint(&thread_id).await {
            Ok(Some(checkpoint)) => {
                info!(
                    "Replaying thread {} from checkpoint {}",
                    thread_id, checkpoint.checkpoint_id
                );
                for event in state_events(None, &checkpoint.run_state) {
                    yield event;
                }
                if let StageCursor::Failed { stage, error } = &checkpoint.stage_cursor {
                    yield ProgressEvent::error(format!("{} failed: {}", stage, error));
                }
            }
            Ok(None) => {
                yield ProgressEvent::error(NO_CHECKPOINT_MESSAGE);
            }
            Err(e) => {
                warn!("Failed to load checkpoint for {}: {}", thread_id, e);
                yield ProgressEvent::error(e.user_message());
            }
        }
        yield ProgressEvent::end();
    }
}
