//! Round-table service.
//!
//! Composes the registry, phase machine, scheduler, transcript store and run
//! registry into the operations the HTTP layer exposes.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::db::DbHandle;
use super::generation::Generator;
use super::lifecycle::{RunRegistry, resume_cursor, wait_stopped};
use super::models::{
    Agent, AgentUpdate, Discussion, DiscussionStatus, Message, MessageType, NewAgent, NewDiscussion,
    Participant, TranscriptEntry,
};
use super::phase;
use super::registry::{SpeakerRoster, require_roster};
use super::scheduler::{SelectionPolicy, StopReason, TurnScheduler, TurnState, opening_message};
use super::transcript::TranscriptStore;
use super::ws::{DiscussionEvent, broadcast_message};
use crate::errors::DiscussionError;

/// Result of a run or resume.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub status: DiscussionStatus,
    pub discussion_id: Uuid,
    pub chat_history: Vec<TranscriptEntry>,
    pub attribution_fallbacks: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct PauseSummary {
    pub status: DiscussionStatus,
    pub discussion_id: Uuid,
    pub message_count: usize,
}

/// Where a discussion goes when its turn loop fails.
#[derive(Debug, Clone, Copy)]
enum OnFailure {
    MarkError,
    RevertToPaused,
}

#[derive(Clone)]
pub struct RoundTableService {
    db: DbHandle,
    transcript: TranscriptStore,
    generator: Arc<dyn Generator>,
    runs: RunRegistry,
    events: broadcast::Sender<String>,
}

impl RoundTableService {
    pub fn new(
        db: DbHandle,
        generator: Arc<dyn Generator>,
        events: broadcast::Sender<String>,
    ) -> Self {
        Self {
            transcript: TranscriptStore::new(db.clone()),
            db,
            generator,
            runs: RunRegistry::new(),
            events,
        }
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub fn events(&self) -> &broadcast::Sender<String> {
        &self.events
    }

    pub fn runs(&self) -> &RunRegistry {
        &self.runs
    }

    // ── Agents ────────────────────────────────────────────────────────

    pub async fn create_agent(&self, new: NewAgent) -> Result<Agent, DiscussionError> {
        if new.name.trim().is_empty() {
            return Err(DiscussionError::InvalidConfig(
                "agent name must not be empty".to_string(),
            ));
        }
        Ok(self.db.call(move |db| db.create_agent(&new)).await?)
    }

    pub async fn get_agent(&self, id: Uuid) -> Result<Agent, DiscussionError> {
        self.db
            .call(move |db| db.get_agent(id))
            .await?
            .ok_or(DiscussionError::AgentNotFound { id })
    }

    pub async fn list_agents(&self) -> Result<Vec<Agent>, DiscussionError> {
        Ok(self.db.call(|db| db.list_agents()).await?)
    }

    pub async fn update_agent(
        &self,
        id: Uuid,
        update: AgentUpdate,
    ) -> Result<Agent, DiscussionError> {
        if update.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(DiscussionError::InvalidConfig(
                "agent name must not be empty".to_string(),
            ));
        }
        self.db
            .call(move |db| db.update_agent(id, &update))
            .await?
            .ok_or(DiscussionError::AgentNotFound { id })
    }

    pub async fn delete_agent(&self, id: Uuid) -> Result<(), DiscussionError> {
        if self.db.call(move |db| db.delete_agent(id)).await? {
            Ok(())
        } else {
            Err(DiscussionError::AgentNotFound { id })
        }
    }

    pub async fn delete_all_agents(&self) -> Result<usize, DiscussionError> {
        Ok(self.db.call(|db| db.delete_all_agents()).await?)
    }

    // ── Discussions ───────────────────────────────────────────────────

    pub async fn create_discussion(
        &self,
        new: NewDiscussion,
    ) -> Result<Discussion, DiscussionError> {
        let discussion = self.db.call(move |db| db.create_discussion(&new)).await?;
        info!(discussion_id = %discussion.id, title = %discussion.title, "round table created");
        broadcast_message(
            &self.events,
            &DiscussionEvent::DiscussionCreated {
                discussion: discussion.clone(),
            },
        );
        Ok(discussion)
    }

    pub async fn get_discussion(&self, id: Uuid) -> Result<Discussion, DiscussionError> {
        self.db
            .call(move |db| db.get_discussion(id))
            .await?
            .ok_or(DiscussionError::NotFound { id })
    }

    pub async fn list_discussions(&self) -> Result<Vec<Discussion>, DiscussionError> {
        Ok(self.db.call(|db| db.list_discussions()).await?)
    }

    pub async fn delete_all_discussions(&self) -> Result<usize, DiscussionError> {
        let deleted = self.db.call(|db| db.delete_all_discussions()).await?;
        info!(deleted, "all round tables deleted");
        Ok(deleted)
    }

    pub async fn participants(&self, id: Uuid) -> Result<Vec<Participant>, DiscussionError> {
        self.get_discussion(id).await?;
        Ok(self.db.call(move |db| db.list_participants(id)).await?)
    }

    /// The stored transcript. An empty transcript is reported as not found.
    pub async fn messages(&self, id: Uuid) -> Result<Vec<Message>, DiscussionError> {
        let messages = self.transcript.read(id).await?;
        if messages.is_empty() {
            return Err(DiscussionError::NotFound { id });
        }
        Ok(messages)
    }

    pub async fn purge_messages(&self) -> Result<usize, DiscussionError> {
        let deleted = self.transcript.purge_all().await?;
        info!(deleted, "all messages purged");
        Ok(deleted)
    }

    pub async fn transition_phase(
        &self,
        id: Uuid,
        target: String,
    ) -> Result<Discussion, DiscussionError> {
        let change = phase::transition(&self.db, id, target).await?;
        broadcast_message(
            &self.events,
            &DiscussionEvent::PhaseChanged {
                discussion_id: id,
                from: change.from,
                to: change.to,
                status: change.discussion.status,
            },
        );
        Ok(change.discussion)
    }

    // ── Runs ──────────────────────────────────────────────────────────

    async fn status_of(&self, id: Uuid) -> Result<DiscussionStatus, DiscussionError> {
        Ok(self.get_discussion(id).await?.status)
    }

    fn scheduler(
        &self,
        discussion: &Discussion,
        roster: SpeakerRoster,
        hints: Vec<String>,
    ) -> TurnScheduler {
        TurnScheduler::new(
            discussion.id,
            discussion.settings.clone(),
            roster,
            SelectionPolicy::new(discussion.settings.speaker_selection_method, hints),
            self.generator.clone(),
            self.db.clone(),
            self.transcript.clone(),
            self.events.clone(),
        )
    }

    /// Run a pending discussion from its opening message to completion.
    ///
    /// The turn loop runs on its own task, so dropping the returned future
    /// (a disconnected HTTP client) leaves the run going and still pausable.
    pub async fn run_discussion(
        &self,
        id: Uuid,
        prompt: String,
        speaker_hints: Vec<String>,
    ) -> Result<RunOutcome, DiscussionError> {
        let service = self.clone();
        let task =
            tokio::spawn(async move { service.drive_run(id, prompt, speaker_hints).await });
        self.join_run(id, task).await
    }

    async fn drive_run(
        &self,
        id: Uuid,
        prompt: String,
        speaker_hints: Vec<String>,
    ) -> Result<RunOutcome, DiscussionError> {
        let mut discussion = self.get_discussion(id).await?;
        if discussion.status != DiscussionStatus::Pending {
            return Err(DiscussionError::InvalidState {
                id,
                status: discussion.status,
                operation: "run",
            });
        }
        let entries = require_roster(&self.db, id).await?;
        let roster = SpeakerRoster::build(id, &entries)?;
        let entry_phase = discussion
            .phase_config
            .entry_phase()
            .map(str::to_string)
            .ok_or_else(|| {
                DiscussionError::InvalidConfig("phase graph declares no phases".to_string())
            })?;

        let handle = self.runs.register(id).await?;
        let phase_for_start = entry_phase.clone();
        let claimed = match self
            .db
            .call(move |db| db.start_discussion(id, &phase_for_start))
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                self.runs.finish(id).await;
                return Err(e.into());
            }
        };
        if !claimed {
            self.runs.finish(id).await;
            return Err(DiscussionError::InvalidState {
                id,
                status: self.status_of(id).await?,
                operation: "run",
            });
        }
        discussion.status = DiscussionStatus::InProgress;
        discussion.current_phase = Some(entry_phase.clone());

        info!(
            discussion_id = %id,
            participants = roster.len(),
            max_rounds = discussion.settings.max_rounds,
            selection = discussion.settings.speaker_selection_method.as_str(),
            "discussion started"
        );
        broadcast_message(
            &self.events,
            &DiscussionEvent::DiscussionStarted {
                discussion_id: id,
                phase: Some(entry_phase),
                participants: roster
                    .speakers()
                    .iter()
                    .map(|s| s.display_name.clone())
                    .collect(),
            },
        );

        let opening = opening_message(&discussion, &prompt, &roster);
        let mut scheduler = self.scheduler(&discussion, roster, speaker_hints);
        let mut state = TurnState::default();
        let result = match scheduler.seed(&mut state, opening).await {
            Ok(()) => scheduler.run(&mut state, &handle).await,
            Err(e) => Err(e),
        };
        let concluded = self
            .conclude(id, result, &state, OnFailure::MarkError)
            .await;
        self.runs.finish(id).await;
        let status = concluded?;

        Ok(RunOutcome {
            status,
            discussion_id: id,
            chat_history: state.transcript,
            attribution_fallbacks: state.fallbacks,
        })
    }

    /// Stop an in-progress discussion at its next turn boundary and save
    /// its conversation snapshot.
    pub async fn pause(&self, id: Uuid) -> Result<PauseSummary, DiscussionError> {
        let status = self.status_of(id).await?;
        if status != DiscussionStatus::InProgress {
            return Err(DiscussionError::InvalidState {
                id,
                status,
                operation: "pause",
            });
        }
        if let Some(stopped) = self.runs.request_pause(id).await {
            wait_stopped(stopped).await;
        }

        let snapshot = self.transcript.snapshot(id).await?;
        let message_count = snapshot.len();
        let paused = self
            .db
            .call(move |db| db.save_paused_state(id, &snapshot))
            .await?;
        if !paused {
            return Err(DiscussionError::InvalidState {
                id,
                status: self.status_of(id).await?,
                operation: "pause",
            });
        }

        info!(discussion_id = %id, message_count, "discussion paused");
        broadcast_message(
            &self.events,
            &DiscussionEvent::DiscussionPaused {
                discussion_id: id,
                message_count,
            },
        );
        Ok(PauseSummary {
            status: DiscussionStatus::Paused,
            discussion_id: id,
            message_count,
        })
    }

    /// Continue a paused discussion from its saved snapshot. Detached from
    /// the caller like [`Self::run_discussion`].
    pub async fn resume(&self, id: Uuid) -> Result<RunOutcome, DiscussionError> {
        let service = self.clone();
        let task = tokio::spawn(async move { service.drive_resume(id).await });
        self.join_run(id, task).await
    }

    /// Wait for a detached run. A task that died without concluding is
    /// deregistered so the discussion can still be paused or resumed.
    async fn join_run(
        &self,
        id: Uuid,
        task: JoinHandle<Result<RunOutcome, DiscussionError>>,
    ) -> Result<RunOutcome, DiscussionError> {
        match task.await {
            Ok(result) => result,
            Err(e) => {
                error!(discussion_id = %id, error = %e, "discussion task aborted");
                self.runs.finish(id).await;
                Err(DiscussionError::Database(
                    anyhow::Error::new(e).context("discussion task aborted"),
                ))
            }
        }
    }

    async fn drive_resume(&self, id: Uuid) -> Result<RunOutcome, DiscussionError> {
        let discussion = self.get_discussion(id).await?;
        if discussion.status != DiscussionStatus::Paused {
            return Err(DiscussionError::InvalidState {
                id,
                status: discussion.status,
                operation: "resume",
            });
        }
        let saved = discussion
            .messages_state
            .clone()
            .filter(|entries| !entries.is_empty())
            .ok_or(DiscussionError::MissingState { id })?;
        let entries = require_roster(&self.db, id).await?;
        let roster = SpeakerRoster::build(id, &entries)?;
        let current = resume_cursor(&roster, &saved);
        let turns_taken = self
            .transcript
            .count(id, Some(MessageType::Discussion))
            .await?;

        let handle = self.runs.register(id).await?;
        let claimed = match self
            .db
            .call(move |db| {
                db.set_status_if(id, DiscussionStatus::Paused, DiscussionStatus::InProgress)
            })
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                self.runs.finish(id).await;
                return Err(e.into());
            }
        };
        if !claimed {
            self.runs.finish(id).await;
            return Err(DiscussionError::InvalidState {
                id,
                status: self.status_of(id).await?,
                operation: "resume",
            });
        }

        let remaining_turns = discussion.settings.max_rounds.saturating_sub(turns_taken);
        info!(
            discussion_id = %id,
            saved_entries = saved.len(),
            remaining_turns,
            next_speaker = %roster.get(roster.next_after(current)).display_name,
            "discussion resumed"
        );
        broadcast_message(
            &self.events,
            &DiscussionEvent::DiscussionResumed {
                discussion_id: id,
                remaining_turns,
            },
        );

        let mut scheduler = self.scheduler(&discussion, roster, Vec::new());
        let mut state = TurnState {
            transcript: saved,
            current,
            turns_taken,
            fallbacks: 0,
        };
        let result = scheduler.run(&mut state, &handle).await;
        let concluded = self
            .conclude(id, result, &state, OnFailure::RevertToPaused)
            .await;
        self.runs.finish(id).await;
        let status = concluded?;

        Ok(RunOutcome {
            status,
            discussion_id: id,
            chat_history: state.transcript,
            attribution_fallbacks: state.fallbacks,
        })
    }

    /// Pause every run active in this process. Used on shutdown.
    pub async fn pause_all(&self) {
        for id in self.runs.active_ids().await {
            match self.pause(id).await {
                Ok(summary) => {
                    info!(discussion_id = %id, message_count = summary.message_count, "paused on shutdown")
                }
                Err(e) => warn!(discussion_id = %id, error = %e, "failed to pause on shutdown"),
            }
        }
    }

    /// Apply the status write that follows a turn loop.
    async fn conclude(
        &self,
        id: Uuid,
        result: Result<StopReason, DiscussionError>,
        state: &TurnState,
        on_failure: OnFailure,
    ) -> Result<DiscussionStatus, DiscussionError> {
        match result {
            Ok(StopReason::BudgetExhausted | StopReason::Terminated) => {
                if !self.db.call(move |db| db.complete_discussion(id)).await? {
                    warn!(discussion_id = %id, "discussion left in_progress before completion");
                    return self.status_of(id).await;
                }
                info!(discussion_id = %id, turns = state.turns_taken, "discussion completed");
                broadcast_message(
                    &self.events,
                    &DiscussionEvent::DiscussionCompleted {
                        discussion_id: id,
                        message_count: state.transcript.len(),
                    },
                );
                Ok(DiscussionStatus::Completed)
            }
            Ok(StopReason::PauseRequested) => Ok(DiscussionStatus::Paused),
            Ok(StopReason::Closed) => self.status_of(id).await,
            Err(err) => {
                let status = match on_failure {
                    OnFailure::MarkError => {
                        let marked = self
                            .db
                            .call(move |db| {
                                db.set_status_if(
                                    id,
                                    DiscussionStatus::InProgress,
                                    DiscussionStatus::Error,
                                )
                            })
                            .await;
                        if let Err(e) = marked {
                            error!(discussion_id = %id, error = %e, "failed to mark discussion as errored");
                        }
                        DiscussionStatus::Error
                    }
                    OnFailure::RevertToPaused => {
                        if let Err(e) = self.revert_to_paused(id).await {
                            error!(discussion_id = %id, error = %e, "failed to revert discussion to paused");
                        }
                        DiscussionStatus::Paused
                    }
                };
                error!(discussion_id = %id, status = %status, error = %err, "discussion run failed");
                broadcast_message(
                    &self.events,
                    &DiscussionEvent::DiscussionFailed {
                        discussion_id: id,
                        status,
                        error: err.to_string(),
                    },
                );
                Err(err)
            }
        }
    }

    /// Re-snapshot the transcript, including turns taken since the resume.
    async fn revert_to_paused(&self, id: Uuid) -> Result<(), DiscussionError> {
        let snapshot = self.transcript.snapshot(id).await?;
        self.db
            .call(move |db| db.save_paused_state(id, &snapshot))
            .await?;
        Ok(())
    }
}
