use std::path::PathBuf;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

/// Events queued before the oldest unread one is discarded.
pub const EVENT_CAPACITY: usize = 256;

/// Notifications from the render thread to the pipeline owner.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    RecordingStarted { path: PathBuf },
    RecordingStopped { path: PathBuf },
    /// Enabling, a recorded frame, or finalisation failed.
    RecordingFailed { error: String },
    /// The encoder finished writing `path`.
    RecordingFinalized { path: PathBuf },
    /// A new throughput estimate closed a measurement window.
    Fps { fps: f64, dropped: u64 },
    /// The display surface could not present; the thread is shutting down.
    SurfaceLost,
    Terminated,
}

/// Render thread side of the event channel. Never blocks.
#[derive(Debug, Clone)]
pub(crate) struct EventSender {
    tx: Sender<PipelineEvent>,
    rx: Receiver<PipelineEvent>,
}

impl EventSender {
    pub fn emit(&self, event: PipelineEvent) {
        let mut event = event;
        loop {
            match self.tx.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    // Drop the oldest so the owner always sees the newest state.
                    if let Ok(stale) = self.rx.try_recv() {
                        tracing::debug!(?stale, "event queue full; discarding oldest");
                    }
                    event = rejected;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

pub(crate) fn channel() -> (EventSender, Receiver<PipelineEvent>) {
    let (tx, rx) = bounded(EVENT_CAPACITY);
    (
        EventSender {
            tx,
            rx: rx.clone(),
        },
        rx,
    )
}
