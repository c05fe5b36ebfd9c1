//! Run bookkeeping for pause and resume.
//!
//! Every active turn loop registers a [`RunControl`] in the process-wide
//! [`RunRegistry`]. A pause request flips a flag the loop checks between
//! turns; the loop reports back once it has stopped, so only one writer ever
//! appends to a discussion's transcript.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use super::models::{DiscussionStatus, TranscriptEntry};
use super::registry::SpeakerRoster;
use crate::errors::DiscussionError;

/// Status edges a run may take; `RoundTableDb::set_status_if` refuses any
/// other. Closing a discussion through the terminal phase is handled
/// separately by the phase state machine.
pub fn is_valid_transition(from: DiscussionStatus, to: DiscussionStatus) -> bool {
    matches!(
        (from, to),
        (DiscussionStatus::Pending, DiscussionStatus::InProgress)
            | (DiscussionStatus::InProgress, DiscussionStatus::Completed)
            | (DiscussionStatus::InProgress, DiscussionStatus::Paused)
            | (DiscussionStatus::InProgress, DiscussionStatus::Error)
            | (DiscussionStatus::Paused, DiscussionStatus::InProgress)
    )
}

/// Registry side of one active run.
struct RunControl {
    pause_tx: watch::Sender<bool>,
    stopped_tx: watch::Sender<bool>,
}

/// Turn-loop side of one active run.
pub struct RunHandle {
    pause_rx: watch::Receiver<bool>,
}

impl RunHandle {
    pub fn pause_requested(&self) -> bool {
        *self.pause_rx.borrow()
    }
}

/// Active runs in this process, keyed by discussion id.
#[derive(Clone, Default)]
pub struct RunRegistry {
    runs: Arc<tokio::sync::Mutex<HashMap<Uuid, RunControl>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run. At most one run per discussion may be active.
    pub async fn register(&self, id: Uuid) -> Result<RunHandle, DiscussionError> {
        let mut runs = self.runs.lock().await;
        if runs.contains_key(&id) {
            return Err(DiscussionError::InvalidState {
                id,
                status: DiscussionStatus::InProgress,
                operation: "run",
            });
        }
        let (pause_tx, pause_rx) = watch::channel(false);
        let (stopped_tx, _) = watch::channel(false);
        runs.insert(
            id,
            RunControl {
                pause_tx,
                stopped_tx,
            },
        );
        debug!(discussion_id = %id, "run registered");
        Ok(RunHandle { pause_rx })
    }

    /// Ask the run to stop at its next turn boundary.
    ///
    /// Returns a receiver that turns `true` once the loop has stopped, or
    /// `None` when no run is active for `id`.
    pub async fn request_pause(&self, id: Uuid) -> Option<watch::Receiver<bool>> {
        let runs = self.runs.lock().await;
        let control = runs.get(&id)?;
        control.pause_tx.send_replace(true);
        Some(control.stopped_tx.subscribe())
    }

    pub async fn pause_requested(&self, id: Uuid) -> bool {
        let runs = self.runs.lock().await;
        runs.get(&id).is_some_and(|c| *c.pause_tx.borrow())
    }

    pub async fn is_active(&self, id: Uuid) -> bool {
        self.runs.lock().await.contains_key(&id)
    }

    pub async fn active_ids(&self) -> Vec<Uuid> {
        self.runs.lock().await.keys().copied().collect()
    }

    /// Deregister a run and wake anyone waiting for it to stop.
    pub async fn finish(&self, id: Uuid) {
        let control = self.runs.lock().await.remove(&id);
        if let Some(control) = control {
            control.stopped_tx.send_replace(true);
            debug!(discussion_id = %id, "run finished");
        }
    }
}

/// Wait until a run reports that it stopped.
pub async fn wait_stopped(mut stopped: watch::Receiver<bool>) {
    // An error means the run was dropped, which also means it stopped.
    let _ = stopped.wait_for(|stopped| *stopped).await;
}

/// Position of the participant who spoke last in a saved conversation.
///
/// The next turn goes to whoever follows them in priority order. `None` when
/// the last entry's name matches nobody, so the first participant goes next.
pub fn resume_cursor(roster: &SpeakerRoster, saved: &[TranscriptEntry]) -> Option<usize> {
    saved
        .iter()
        .rev()
        .find(|e| e.role != "system")
        .and_then(|last| roster.position_of(&last.name))
}
