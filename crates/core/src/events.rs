//! Pipeline event stream.
//!
//! Workers publish [`PipelineEvent`]s on a bounded channel. Progress events
//! are best effort and dropped when the channel is full; state changes and
//! final results always wait for room.

use crate::job::{JobResult, JobState};
use crate::progress::ProgressSnapshot;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default capacity of the event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    StateChanged {
        job_id: Uuid,
        path: PathBuf,
        state: JobState,
    },
    Progress {
        job_id: Uuid,
        path: PathBuf,
        snapshot: ProgressSnapshot,
    },
    Finished(JobResult),
}

/// Sending half used by the pipeline workers.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<PipelineEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<PipelineEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Deliver a state change or result, waiting for room.
    pub async fn send(&self, event: PipelineEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).await.is_err() {
                debug!("Event receiver dropped");
            }
        }
    }

    /// Offer a progress event; dropped when the channel is full.
    pub fn offer(&self, event: PipelineEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(event);
        }
    }
}

/// Error a callback may return; it is logged and otherwise ignored.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// User callback invoked for every event.
pub type EventCallback = Box<dyn FnMut(&PipelineEvent) -> Result<(), CallbackError> + Send>;

/// Drive `callbacks` from `rx` until the channel closes.
///
/// A callback that errors or panics is logged; the remaining callbacks and
/// the jobs themselves are unaffected.
pub fn spawn_callback_adapter(
    mut rx: mpsc::Receiver<PipelineEvent>,
    mut callbacks: Vec<EventCallback>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            for (index, callback) in callbacks.iter_mut().enumerate() {
                match catch_unwind(AssertUnwindSafe(|| callback(&event))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(callback = index, error = %e, "Event callback failed"),
                    Err(_) => warn!(callback = index, "Event callback panicked"),
                }
            }
        }
    })
}
