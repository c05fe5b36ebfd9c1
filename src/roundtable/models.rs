use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::phase::PhaseGraph;

/// Current UTC time as an RFC 3339 string with microsecond precision.
///
/// The fixed-width format sorts lexicographically in time order, which the
/// transcript ordering relies on.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_uuid(raw: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("Invalid {} id '{}'", what, raw))
}

// ── Enums ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiscussionStatus {
    Pending,
    InProgress,
    Paused,
    Completed,
    Error,
}

impl DiscussionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl FromStr for DiscussionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid discussion status: {}", s)),
        }
    }
}

impl std::fmt::Display for DiscussionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the next speaker is chosen each turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpeakerSelection {
    RoundRobin,
    #[default]
    Auto,
    Random,
    Manual,
}

impl SpeakerSelection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::Auto => "auto",
            Self::Random => "random",
            Self::Manual => "manual",
        }
    }
}

impl FromStr for SpeakerSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Self::RoundRobin),
            "auto" => Ok(Self::Auto),
            "random" => Ok(Self::Random),
            "manual" => Ok(Self::Manual),
            _ => Err(format!("Invalid speaker selection method: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Introduction,
    Discussion,
    Conclusion,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Introduction => "introduction",
            Self::Discussion => "discussion",
            Self::Conclusion => "conclusion",
        }
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "introduction" => Ok(Self::Introduction),
            "discussion" => Ok(Self::Discussion),
            "conclusion" => Ok(Self::Conclusion),
            _ => Err(format!("Invalid message type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    #[default]
    Standard,
    HumanProxy,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::HumanProxy => "human_proxy",
        }
    }
}

impl FromStr for AgentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(Self::Standard),
            "human_proxy" => Ok(Self::HumanProxy),
            _ => Err(format!("Invalid agent type: {}", s)),
        }
    }
}

// ── Settings ──────────────────────────────────────────────────────────

/// Per-discussion scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscussionSettings {
    /// Number of discussion turns after which the run completes.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    #[serde(default)]
    pub speaker_selection_method: SpeakerSelection,
    #[serde(default = "default_true")]
    pub allow_repeat_speaker: bool,
    /// Append a participant listing to the opening message.
    #[serde(default = "default_true")]
    pub send_introductions: bool,
}

fn default_max_rounds() -> u32 {
    12
}

fn default_true() -> bool {
    true
}

impl Default for DiscussionSettings {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            speaker_selection_method: SpeakerSelection::default(),
            allow_repeat_speaker: true,
            send_introductions: true,
        }
    }
}

impl DiscussionSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_rounds == 0 {
            return Err("max_rounds must be at least 1".to_string());
        }
        Ok(())
    }
}

// ── Agents ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub title: String,
    pub background: String,
    pub agent_type: AgentType,
    pub llm_config: serde_json::Value,
    pub tool_config: serde_json::Value,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields accepted when registering an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAgent {
    pub name: String,
    pub title: String,
    pub background: String,
    #[serde(default)]
    pub agent_type: AgentType,
    #[serde(default = "empty_object")]
    pub llm_config: serde_json::Value,
    #[serde(default = "empty_object")]
    pub tool_config: serde_json::Value,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

/// Partial agent update; absent fields keep their stored value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub background: Option<String>,
    #[serde(default)]
    pub agent_type: Option<AgentType>,
    #[serde(default)]
    pub llm_config: Option<serde_json::Value>,
    #[serde(default)]
    pub tool_config: Option<serde_json::Value>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

#[derive(Debug, Clone)]
pub struct AgentRow {
    pub id: String,
    pub name: String,
    pub title: String,
    pub background: String,
    pub agent_type: String,
    pub llm_config: String,
    pub tool_config: String,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl AgentRow {
    pub fn into_agent(self) -> Result<Agent> {
        Ok(Agent {
            id: parse_uuid(&self.id, "agent")?,
            agent_type: AgentType::from_str(&self.agent_type).map_err(|e| anyhow::anyhow!(e))?,
            llm_config: serde_json::from_str(&self.llm_config)
                .context("Failed to parse agent llm_config")?,
            tool_config: serde_json::from_str(&self.tool_config)
                .context("Failed to parse agent tool_config")?,
            name: self.name,
            title: self.title,
            background: self.background,
            is_active: self.is_active,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

// ── Discussions ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discussion {
    pub id: Uuid,
    pub title: String,
    pub context: String,
    pub status: DiscussionStatus,
    pub current_phase: Option<String>,
    pub phase_config: PhaseGraph,
    pub settings: DiscussionSettings,
    pub messages_state: Option<Vec<TranscriptEntry>>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DiscussionRow {
    pub id: String,
    pub title: String,
    pub context: String,
    pub status: String,
    pub current_phase: Option<String>,
    pub phase_config: String,
    pub settings: String,
    pub messages_state: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

impl DiscussionRow {
    pub fn into_discussion(self) -> Result<Discussion> {
        let messages_state = match self.messages_state {
            Some(raw) => Some(
                serde_json::from_str(&raw).context("Failed to parse round table messages_state")?,
            ),
            None => None,
        };
        Ok(Discussion {
            id: parse_uuid(&self.id, "round table")?,
            status: DiscussionStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            phase_config: serde_json::from_str(&self.phase_config)
                .context("Failed to parse round table phase_config")?,
            settings: serde_json::from_str(&self.settings)
                .context("Failed to parse round table settings")?,
            messages_state,
            title: self.title,
            context: self.context,
            current_phase: self.current_phase,
            created_at: self.created_at,
            completed_at: self.completed_at,
        })
    }
}

/// A participant slot requested at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewParticipant {
    pub agent_id: Uuid,
    #[serde(default)]
    pub role: Option<String>,
}

/// Fields accepted when creating a discussion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDiscussion {
    pub title: String,
    pub context: String,
    pub participants: Vec<NewParticipant>,
    #[serde(default)]
    pub settings: DiscussionSettings,
    #[serde(default)]
    pub phase_config: Option<PhaseGraph>,
}

// ── Participants ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: Uuid,
    pub round_table_id: Uuid,
    pub agent_id: Uuid,
    pub role: Option<String>,
    pub speaking_priority: i64,
    pub created_at: String,
}

/// A participant joined against its current agent record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterEntry {
    pub agent: Agent,
    pub role: Option<String>,
    pub speaking_priority: i64,
}

// ── Messages ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub round_table_id: Uuid,
    pub agent_id: Uuid,
    pub agent_name: String,
    pub content: String,
    pub message_type: MessageType,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: String,
    pub round_table_id: String,
    pub agent_id: String,
    pub agent_name: String,
    pub content: String,
    pub message_type: String,
    pub created_at: String,
}

impl MessageRow {
    pub fn into_message(self) -> Result<Message> {
        Ok(Message {
            id: parse_uuid(&self.id, "message")?,
            round_table_id: parse_uuid(&self.round_table_id, "round table")?,
            agent_id: parse_uuid(&self.agent_id, "agent")?,
            message_type: MessageType::from_str(&self.message_type)
                .map_err(|e| anyhow::anyhow!(e))?,
            agent_name: self.agent_name,
            content: self.content,
            created_at: self.created_at,
        })
    }
}

/// One entry of a working or saved conversation.
///
/// This is also the element type of the persisted `messages_state` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscriptEntry {
    pub role: String,
    pub content: String,
    pub name: String,
    #[serde(default)]
    pub function_call: Option<serde_json::Value>,
}

impl TranscriptEntry {
    pub fn assistant(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
            name: name.into(),
            function_call: None,
        }
    }

    pub fn from_message(message: &Message) -> Self {
        Self::assistant(message.agent_name.clone(), message.content.clone())
    }
}
