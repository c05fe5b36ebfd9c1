//! Participant registry.
//!
//! Resolves a discussion's roster from storage and turns it into the
//! immutable [`SpeakerRoster`] a run schedules against.

use std::collections::HashMap;

use tracing::warn;
use uuid::Uuid;

use super::db::DbHandle;
use super::generation::ModelOverrides;
use super::models::RosterEntry;
use crate::errors::DiscussionError;

/// Ordered roster for a discussion, joined with current agent records.
pub async fn roster(db: &DbHandle, id: Uuid) -> Result<Vec<RosterEntry>, DiscussionError> {
    let entries = db
        .call(move |db| {
            if db.get_discussion(id)?.is_none() {
                return Err(DiscussionError::NotFound { id }.into());
            }
            db.list_roster(id)
        })
        .await?;
    Ok(entries)
}

/// Like [`roster`], but an empty roster is an error.
pub async fn require_roster(
    db: &DbHandle,
    id: Uuid,
) -> Result<Vec<RosterEntry>, DiscussionError> {
    let entries = roster(db, id).await?;
    if entries.is_empty() {
        return Err(DiscussionError::EmptyRoster { id });
    }
    Ok(entries)
}

/// Everything the turn loop needs to know about one participant.
#[derive(Debug, Clone)]
pub struct SpeakerHandle {
    pub agent_id: Uuid,
    pub display_name: String,
    pub title: String,
    pub system_prompt: String,
    pub role: Option<String>,
    pub priority: i64,
    pub overrides: ModelOverrides,
}

impl From<&RosterEntry> for SpeakerHandle {
    fn from(entry: &RosterEntry) -> Self {
        Self {
            agent_id: entry.agent.id,
            display_name: entry.agent.name.clone(),
            title: entry.agent.title.clone(),
            system_prompt: entry.agent.background.clone(),
            role: entry.role.clone(),
            priority: entry.speaking_priority,
            overrides: ModelOverrides::from_llm_config(&entry.agent.llm_config),
        }
    }
}

/// Outcome of mapping a generated utterance's name to a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attribution {
    pub index: usize,
    /// The name matched nobody and the first participant was used.
    pub fallback: bool,
}

/// Speakers in priority order plus a display-name index.
#[derive(Debug, Clone)]
pub struct SpeakerRoster {
    speakers: Vec<SpeakerHandle>,
    by_name: HashMap<String, usize>,
}

impl SpeakerRoster {
    /// Build from roster entries already sorted by priority.
    ///
    /// Fails on an empty roster or when two participants share a display name.
    pub fn build(id: Uuid, entries: &[RosterEntry]) -> Result<Self, DiscussionError> {
        if entries.is_empty() {
            return Err(DiscussionError::EmptyRoster { id });
        }
        let mut speakers: Vec<SpeakerHandle> = entries.iter().map(SpeakerHandle::from).collect();
        speakers.sort_by_key(|s| s.priority);
        let mut by_name = HashMap::with_capacity(speakers.len());
        for (index, speaker) in speakers.iter().enumerate() {
            if by_name.insert(speaker.display_name.clone(), index).is_some() {
                return Err(DiscussionError::DuplicateDisplayName {
                    id,
                    name: speaker.display_name.clone(),
                });
            }
        }
        Ok(Self { speakers, by_name })
    }

    pub fn len(&self) -> usize {
        self.speakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.speakers.is_empty()
    }

    pub fn speakers(&self) -> &[SpeakerHandle] {
        &self.speakers
    }

    pub fn get(&self, index: usize) -> &SpeakerHandle {
        &self.speakers[index]
    }

    pub fn first(&self) -> &SpeakerHandle {
        &self.speakers[0]
    }

    pub fn position_of(&self, display_name: &str) -> Option<usize> {
        self.by_name.get(display_name).copied()
    }

    /// Map a display name to a participant, falling back to the first one.
    pub fn attribute(&self, display_name: &str) -> Attribution {
        match self.position_of(display_name) {
            Some(index) => Attribution {
                index,
                fallback: false,
            },
            None => {
                warn!(
                    name = display_name,
                    fallback = %self.first().display_name,
                    "utterance name matches no participant; attributing to first participant"
                );
                Attribution {
                    index: 0,
                    fallback: true,
                }
            }
        }
    }

    /// Next index in cyclic priority order. `None` starts at the first speaker.
    pub fn next_after(&self, index: Option<usize>) -> usize {
        match index {
            Some(i) => (i + 1) % self.speakers.len(),
            None => 0,
        }
    }
}
