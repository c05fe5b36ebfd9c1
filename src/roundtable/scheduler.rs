//! Turn scheduler.
//!
//! Drives one run of a discussion: pick the next eligible speaker, ask the
//! generator for an utterance, attribute it, append it to the transcript and
//! repeat until the turn budget is spent, a participant asks to terminate, or
//! a pause is requested.

use std::collections::VecDeque;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use super::db::DbHandle;
use super::generation::Generator;
use super::lifecycle::RunHandle;
use super::models::{
    Discussion, DiscussionSettings, DiscussionStatus, MessageType, SpeakerSelection,
    TranscriptEntry,
};
use super::phase::PhaseDefinition;
use super::registry::SpeakerRoster;
use super::transcript::TranscriptStore;
use super::ws::{DiscussionEvent, broadcast_message};
use crate::errors::{DiscussionError, GenerationError};

/// Framing handed to every speaker ahead of their own background.
pub const DISCUSSION_FRAMING: &str = "You are a participant in a round table discussion. \
Respond to the other participants in character and keep your contribution focused. \
When the group has reached a conclusion, end your message with TERMINATE.";

/// Opening message that starts every run.
pub fn opening_message(discussion: &Discussion, prompt: &str, roster: &SpeakerRoster) -> String {
    let phase = discussion
        .current_phase
        .as_deref()
        .or_else(|| discussion.phase_config.entry_phase())
        .unwrap_or("none");
    let mut text = format!(
        "Round Table Discussion\nObjective: {}\nTask: {}\nCurrent Phase: {}\n\
Please discuss this topic and work together to reach a conclusion.",
        discussion.context, prompt, phase
    );
    if discussion.settings.send_introductions {
        text.push_str("\n\nParticipants:");
        for speaker in roster.speakers() {
            text.push_str(&format!("\n- {}", speaker.display_name));
            if let Some(role) = &speaker.role {
                text.push_str(&format!(" ({})", role));
            }
            if !speaker.title.is_empty() {
                text.push_str(&format!(": {}", speaker.title));
            }
        }
    }
    text
}

/// How the next speaker is chosen.
pub enum SelectionPolicy {
    RoundRobin,
    /// Ask the generator; fall back to round robin when it has no answer.
    Auto,
    Random(StdRng),
    /// Caller-supplied display names, consumed one per turn.
    Manual(VecDeque<String>),
}

impl SelectionPolicy {
    pub fn new(method: SpeakerSelection, hints: Vec<String>) -> Self {
        match method {
            SpeakerSelection::RoundRobin => Self::RoundRobin,
            SpeakerSelection::Auto => Self::Auto,
            SpeakerSelection::Random => Self::Random(StdRng::from_os_rng()),
            SpeakerSelection::Manual => Self::Manual(hints.into()),
        }
    }

    pub fn seeded_random(seed: u64) -> Self {
        Self::Random(StdRng::seed_from_u64(seed))
    }
}

/// Indices of participants allowed to take the next turn.
///
/// The phase's speaker list narrows the roster; if it admits nobody every
/// participant stays eligible. With repeats disabled the previous speaker is
/// excluded unless they are the only one left.
pub fn eligible_speakers(
    roster: &SpeakerRoster,
    phase: Option<&PhaseDefinition>,
    previous: Option<usize>,
    allow_repeat: bool,
) -> Vec<usize> {
    let all: Vec<usize> = (0..roster.len()).collect();
    let mut eligible: Vec<usize> = match phase {
        Some(phase) => all
            .iter()
            .copied()
            .filter(|&i| {
                let speaker = roster.get(i);
                phase.admits(&speaker.display_name, speaker.role.as_deref())
            })
            .collect(),
        None => all.clone(),
    };
    if eligible.is_empty() {
        debug!(
            phase = phase.map(|p| p.id.as_str()).unwrap_or("none"),
            "phase admits no participant; opening the floor to everyone"
        );
        eligible = all;
    }
    if !allow_repeat
        && let Some(previous) = previous
        && eligible.len() > 1
    {
        eligible.retain(|&i| i != previous);
    }
    eligible
}

/// First eligible index after `previous` in cyclic priority order.
fn round_robin(roster: &SpeakerRoster, eligible: &[usize], previous: Option<usize>) -> usize {
    let start = roster.next_after(previous);
    (0..roster.len())
        .map(|offset| (start + offset) % roster.len())
        .find(|i| eligible.contains(i))
        .unwrap_or(eligible[0])
}

impl SelectionPolicy {
    /// Choose the next speaker among `eligible`, which must not be empty.
    pub async fn select(
        &mut self,
        roster: &SpeakerRoster,
        eligible: &[usize],
        previous: Option<usize>,
        generator: &dyn Generator,
        transcript: &[TranscriptEntry],
    ) -> Result<usize, GenerationError> {
        let pick = match self {
            Self::RoundRobin => None,
            Self::Random(rng) => Some(eligible[rng.random_range(0..eligible.len())]),
            Self::Auto => {
                let handles: Vec<_> = eligible.iter().map(|&i| roster.get(i)).collect();
                generator
                    .select_next_speaker(transcript, &handles)
                    .await?
                    .and_then(|name| roster.position_of(&name))
                    .filter(|i| eligible.contains(i))
            }
            Self::Manual(hints) => {
                let hint = hints.pop_front();
                let pick = hint
                    .as_deref()
                    .and_then(|name| roster.position_of(name))
                    .filter(|i| eligible.contains(i));
                if pick.is_none()
                    && let Some(name) = hint
                {
                    debug!(hint = %name, "speaker hint is not eligible; using round robin");
                }
                pick
            }
        };
        Ok(pick.unwrap_or_else(|| round_robin(roster, eligible, previous)))
    }
}

/// Why a run's turn loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    BudgetExhausted,
    Terminated,
    PauseRequested,
    /// The discussion left `in_progress` underneath the loop.
    Closed,
}

/// Mutable state of one run, kept by the caller so a failed run still
/// reports how far it got.
#[derive(Debug, Clone, Default)]
pub struct TurnState {
    pub transcript: Vec<TranscriptEntry>,
    /// Roster index of whoever spoke last.
    pub current: Option<usize>,
    /// Discussion turns taken so far, across pauses.
    pub turns_taken: u32,
    pub fallbacks: u32,
}

pub struct TurnScheduler {
    discussion_id: Uuid,
    settings: DiscussionSettings,
    roster: SpeakerRoster,
    policy: SelectionPolicy,
    generator: Arc<dyn Generator>,
    db: DbHandle,
    transcript: TranscriptStore,
    events: broadcast::Sender<String>,
}

impl TurnScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        discussion_id: Uuid,
        settings: DiscussionSettings,
        roster: SpeakerRoster,
        policy: SelectionPolicy,
        generator: Arc<dyn Generator>,
        db: DbHandle,
        transcript: TranscriptStore,
        events: broadcast::Sender<String>,
    ) -> Self {
        Self {
            discussion_id,
            settings,
            roster,
            policy,
            generator,
            db,
            transcript,
            events,
        }
    }

    /// Persist the opening message under the first participant.
    pub async fn seed(&self, state: &mut TurnState, text: String) -> Result<(), DiscussionError> {
        let first = self.roster.first();
        let message = self
            .transcript
            .append(
                self.discussion_id,
                first.agent_id,
                text,
                MessageType::Introduction,
            )
            .await?;
        state.transcript.push(TranscriptEntry::from_message(&message));
        state.current = Some(0);
        Ok(())
    }

    /// Take turns until a stop condition holds.
    pub async fn run(
        &mut self,
        state: &mut TurnState,
        handle: &RunHandle,
    ) -> Result<StopReason, DiscussionError> {
        let id = self.discussion_id;
        loop {
            if state.turns_taken >= self.settings.max_rounds {
                return Ok(StopReason::BudgetExhausted);
            }
            if handle.pause_requested() {
                info!(discussion_id = %id, turns = state.turns_taken, "pause requested; stopping at turn boundary");
                return Ok(StopReason::PauseRequested);
            }

            let discussion = self.db.call(move |db| db.get_discussion(id)).await?;
            let Some(discussion) = discussion else {
                return Ok(StopReason::Closed);
            };
            if discussion.status != DiscussionStatus::InProgress {
                info!(discussion_id = %id, status = %discussion.status, "discussion closed during run");
                return Ok(StopReason::Closed);
            }

            let turn = state.turns_taken + 1;
            let phase = discussion
                .current_phase
                .as_deref()
                .and_then(|p| discussion.phase_config.phase(p));
            let eligible = eligible_speakers(
                &self.roster,
                phase,
                state.current,
                self.settings.allow_repeat_speaker,
            );
            let failure = |source| DiscussionError::GenerationFailure { id, turn, source };

            let index = self
                .policy
                .select(
                    &self.roster,
                    &eligible,
                    state.current,
                    self.generator.as_ref(),
                    &state.transcript,
                )
                .await
                .map_err(failure)?;
            let speaker = self.roster.get(index);
            debug!(discussion_id = %id, turn, speaker = %speaker.display_name, "requesting utterance");

            let utterance = self
                .generator
                .generate(speaker, DISCUSSION_FRAMING, &state.transcript)
                .await
                .map_err(failure)?;

            let attribution = self.roster.attribute(&utterance.name);
            let author = self.roster.get(attribution.index);
            if attribution.fallback {
                state.fallbacks += 1;
                broadcast_message(
                    &self.events,
                    &DiscussionEvent::AttributionFallback {
                        discussion_id: id,
                        turn,
                        reported_name: utterance.name.clone(),
                        attributed_to: author.display_name.clone(),
                    },
                );
            }

            let message = self
                .transcript
                .append(
                    id,
                    author.agent_id,
                    utterance.content,
                    MessageType::Discussion,
                )
                .await?;
            state.transcript.push(TranscriptEntry::from_message(&message));
            state.current = Some(attribution.index);
            state.turns_taken = turn;
            info!(discussion_id = %id, turn, speaker = %message.agent_name, "turn completed");
            broadcast_message(
                &self.events,
                &DiscussionEvent::TurnCompleted {
                    discussion_id: id,
                    turn,
                    message,
                },
            );

            if utterance.terminate {
                info!(discussion_id = %id, turn, "participant ended the discussion");
                return Ok(StopReason::Terminated);
            }
        }
    }
}
