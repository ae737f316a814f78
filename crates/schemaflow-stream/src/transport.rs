//! Stream transport
//!
//! Pumps progress events into a frame sink. The output always ends with one
//! `end` frame; upstream `end` events are absorbed. Cancellation is checked
//! at every event boundary. Once it is seen, nothing more is forwarded, but
//! the upstream is still drained so an in-flight stage finishes on its own
//! and never loses a checkpoint.

use crate::wire::encode_event;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use schemaflow_core::{FlowError, ProgressEvent, Result};
use schemaflow_orchestrator::ABORT_MESSAGE;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Destination for encoded frames
#[async_trait]
pub trait EventSink: Send {
    async fn send(&mut self, frame: String) -> Result<()>;
}

#[async_trait]
impl EventSink for mpsc::Sender<String> {
    async fn send(&mut self, frame: String) -> Result<()> {
        mpsc::Sender::send(self, frame)
            .await
            .map_err(|_| FlowError::Transport("client disconnected".to_string()))
    }
}

#[async_trait]
impl EventSink for Vec<String> {
    async fn send(&mut self, frame: String) -> Result<()> {
        self.push(frame);
        Ok(())
    }
}

/// What a pump delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpReport {
    /// Upstream events written to the sink
    pub forwarded: usize,
    /// Whether the run was cut short by cancellation
    pub aborted: bool,
}

/// Forward `events` to `sink` as wire frames
///
/// Returns `FlowError::Transport` when the sink stops accepting frames; the
/// upstream is drained regardless.
pub async fn pump<S, K>(events: S, sink: &mut K, signal: &CancellationToken) -> Result<PumpReport>
where
    S: Stream<Item = ProgressEvent>,
    K: EventSink + ?Sized,
{
    tokio::pin!(events);

    let mut forwarded = 0usize;
    let mut aborted = false;
    let mut error_sent = false;
    let mut broken: Option<FlowError> = None;

    while let Some(event) = events.next().await {
        // A run that already reached its own end was not cut short
        if event.is_end() || broken.is_some() {
            continue;
        }
        if !aborted && signal.is_cancelled() {
            debug!("Cancellation observed after {} events", forwarded);
            aborted = true;
        }
        if aborted {
            continue;
        }

        if let Err(e) = sink.send(encode_event(&event)).await {
            warn!("Event sink closed, draining run without delivery: {}", e);
            broken = Some(e);
            continue;
        }
        error_sent |= event.is_error();
        forwarded += 1;
    }

    if let Some(e) = broken {
        return Err(e);
    }

    if aborted && !error_sent {
        sink.send(encode_event(&ProgressEvent::error(ABORT_MESSAGE)))
            .await?;
    }
    sink.send(encode_event(&ProgressEvent::end())).await?;

    Ok(PumpReport { forwarded, aborted })
}
