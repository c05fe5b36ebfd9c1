use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use super::lifecycle::is_valid_transition;
use super::models::*;
use super::phase::PhaseGraph;
use crate::errors::DiscussionError;

/// Async-safe handle to the round-table database.
///
/// Wraps `RoundTableDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, keeping synchronous SQLite
/// I/O off the async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<RoundTableDb>>,
}

impl DbHandle {
    pub fn new(db: RoundTableDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&RoundTableDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct RoundTableDb {
    conn: Connection,
}

const AGENT_COLUMNS: &str = "id, name, title, background, agent_type, llm_config, tool_config, is_active, created_at, updated_at";

const DISCUSSION_COLUMNS: &str = "id, title, context, status, current_phase, phase_config, settings, messages_state, created_at, completed_at";

const MESSAGE_SELECT: &str = "SELECT m.id, m.round_table_id, m.agent_id, a.name, m.content, m.message_type, m.created_at
     FROM messages m JOIN agents a ON a.id = m.agent_id";

fn agent_row(row: &Row<'_>) -> rusqlite::Result<AgentRow> {
    Ok(AgentRow {
        id: row.get(0)?,
        name: row.get(1)?,
        title: row.get(2)?,
        background: row.get(3)?,
        agent_type: row.get(4)?,
        llm_config: row.get(5)?,
        tool_config: row.get(6)?,
        is_active: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn discussion_row(row: &Row<'_>) -> rusqlite::Result<DiscussionRow> {
    Ok(DiscussionRow {
        id: row.get(0)?,
        title: row.get(1)?,
        context: row.get(2)?,
        status: row.get(3)?,
        current_phase: row.get(4)?,
        phase_config: row.get(5)?,
        settings: row.get(6)?,
        messages_state: row.get(7)?,
        created_at: row.get(8)?,
        completed_at: row.get(9)?,
    })
}

fn message_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        round_table_id: row.get(1)?,
        agent_id: row.get(2)?,
        agent_name: row.get(3)?,
        content: row.get(4)?,
        message_type: row.get(5)?,
        created_at: row.get(6)?,
    })
}

impl RoundTableDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS agents (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    title TEXT NOT NULL,
                    background TEXT NOT NULL,
                    agent_type TEXT NOT NULL DEFAULT 'standard',
                    llm_config TEXT NOT NULL DEFAULT '{}',
                    tool_config TEXT NOT NULL DEFAULT '{}',
                    is_active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS round_tables (
                    id TEXT PRIMARY KEY,
                    title TEXT NOT NULL,
                    context TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    current_phase TEXT,
                    phase_config TEXT NOT NULL,
                    settings TEXT NOT NULL,
                    messages_state TEXT,
                    created_at TEXT NOT NULL,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS round_table_participants (
                    id TEXT PRIMARY KEY,
                    round_table_id TEXT NOT NULL REFERENCES round_tables(id) ON DELETE CASCADE,
                    agent_id TEXT NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
                    role TEXT,
                    speaking_priority INTEGER NOT NULL,
                    created_at TEXT NOT NULL,
                    UNIQUE(round_table_id, agent_id)
                );

                CREATE TABLE IF NOT EXISTS messages (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL UNIQUE,
                    round_table_id TEXT NOT NULL REFERENCES round_tables(id) ON DELETE CASCADE,
                    agent_id TEXT NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
                    content TEXT NOT NULL,
                    message_type TEXT NOT NULL DEFAULT 'discussion',
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_participants_round_table ON round_table_participants(round_table_id, speaking_priority);
                CREATE INDEX IF NOT EXISTS idx_messages_round_table ON messages(round_table_id, created_at, seq);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Agent CRUD ────────────────────────────────────────────────────

    pub fn create_agent(&self, agent: &NewAgent) -> Result<Agent> {
        let id = Uuid::new_v4();
        let now = now_timestamp();
        self.conn
            .execute(
                "INSERT INTO agents (id, name, title, background, agent_type, llm_config, tool_config, is_active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    id.to_string(),
                    agent.name,
                    agent.title,
                    agent.background,
                    agent.agent_type.as_str(),
                    agent.llm_config.to_string(),
                    agent.tool_config.to_string(),
                    agent.is_active,
                    now,
                ],
            )
            .context("Failed to insert agent")?;
        self.get_agent(id)?.context("Agent not found after insert")
    }

    pub fn get_agent(&self, id: Uuid) -> Result<Option<Agent>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM agents WHERE id = ?1", AGENT_COLUMNS),
                params![id.to_string()],
                agent_row,
            )
            .optional()
            .context("Failed to query agent")?;
        row.map(AgentRow::into_agent).transpose()
    }

    pub fn list_agents(&self) -> Result<Vec<Agent>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM agents ORDER BY created_at, rowid",
                AGENT_COLUMNS
            ))
            .context("Failed to prepare list_agents")?;
        let rows = stmt
            .query_map([], agent_row)
            .context("Failed to query agents")?;
        let mut agents = Vec::new();
        for row in rows {
            agents.push(row.context("Failed to read agent row")?.into_agent()?);
        }
        Ok(agents)
    }

    /// Apply a partial update. `None` when the agent does not exist.
    pub fn update_agent(&self, id: Uuid, update: &AgentUpdate) -> Result<Option<Agent>> {
        let Some(mut agent) = self.get_agent(id)? else {
            return Ok(None);
        };
        if let Some(name) = &update.name {
            agent.name = name.clone();
        }
        if let Some(title) = &update.title {
            agent.title = title.clone();
        }
        if let Some(background) = &update.background {
            agent.background = background.clone();
        }
        if let Some(agent_type) = update.agent_type {
            agent.agent_type = agent_type;
        }
        if let Some(llm_config) = &update.llm_config {
            agent.llm_config = llm_config.clone();
        }
        if let Some(tool_config) = &update.tool_config {
            agent.tool_config = tool_config.clone();
        }
        if let Some(is_active) = update.is_active {
            agent.is_active = is_active;
        }

        self.conn
            .execute(
                "UPDATE agents SET name = ?2, title = ?3, background = ?4, agent_type = ?5,
                        llm_config = ?6, tool_config = ?7, is_active = ?8, updated_at = ?9
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    agent.name,
                    agent.title,
                    agent.background,
                    agent.agent_type.as_str(),
                    agent.llm_config.to_string(),
                    agent.tool_config.to_string(),
                    agent.is_active,
                    now_timestamp(),
                ],
            )
            .context("Failed to update agent")?;
        self.get_agent(id)
    }

    /// Delete one agent. Participations and messages cascade.
    pub fn delete_agent(&self, id: Uuid) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM agents WHERE id = ?1", params![id.to_string()])
            .context("Failed to delete agent")?;
        Ok(deleted > 0)
    }

    pub fn delete_all_agents(&self) -> Result<usize> {
        self.conn
            .execute("DELETE FROM agents", [])
            .context("Failed to delete agents")
    }

    // ── Round table CRUD ──────────────────────────────────────────────

    /// Insert a discussion and its participants in one transaction.
    ///
    /// Participants receive speaking priorities 1..=N in request order.
    pub fn create_discussion(&self, new: &NewDiscussion) -> Result<Discussion> {
        new.settings
            .validate()
            .map_err(DiscussionError::InvalidConfig)?;
        let phase_config = new.phase_config.clone().unwrap_or_default();
        phase_config
            .validate()
            .map_err(DiscussionError::InvalidConfig)?;

        let mut seen = HashSet::new();
        for participant in &new.participants {
            if !seen.insert(participant.agent_id) {
                return Err(DiscussionError::InvalidConfig(format!(
                    "agent {} is listed more than once",
                    participant.agent_id
                ))
                .into());
            }
            let agent = self
                .get_agent(participant.agent_id)?
                .ok_or(DiscussionError::AgentNotFound {
                    id: participant.agent_id,
                })?;
            if !agent.is_active {
                return Err(DiscussionError::InvalidConfig(format!(
                    "agent '{}' is inactive",
                    agent.name
                ))
                .into());
            }
        }

        let id = Uuid::new_v4();
        let now = now_timestamp();
        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO round_tables (id, title, context, status, phase_config, settings, created_at)
             VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6)",
            params![
                id.to_string(),
                new.title,
                new.context,
                serde_json::to_string(&phase_config)?,
                serde_json::to_string(&new.settings)?,
                now,
            ],
        )
        .context("Failed to insert round table")?;
        for (index, participant) in new.participants.iter().enumerate() {
            tx.execute(
                "INSERT INTO round_table_participants (id, round_table_id, agent_id, role, speaking_priority, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    Uuid::new_v4().to_string(),
                    id.to_string(),
                    participant.agent_id.to_string(),
                    participant.role,
                    index as i64 + 1,
                    now,
                ],
            )
            .context("Failed to insert participant")?;
        }
        tx.commit().context("Failed to commit round table")?;

        self.get_discussion(id)?
            .context("Round table not found after insert")
    }

    pub fn get_discussion(&self, id: Uuid) -> Result<Option<Discussion>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM round_tables WHERE id = ?1", DISCUSSION_COLUMNS),
                params![id.to_string()],
                discussion_row,
            )
            .optional()
            .context("Failed to query round table")?;
        row.map(DiscussionRow::into_discussion).transpose()
    }

    pub fn list_discussions(&self) -> Result<Vec<Discussion>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM round_tables ORDER BY created_at, rowid",
                DISCUSSION_COLUMNS
            ))
            .context("Failed to prepare list_discussions")?;
        let rows = stmt
            .query_map([], discussion_row)
            .context("Failed to query round tables")?;
        let mut discussions = Vec::new();
        for row in rows {
            discussions.push(row.context("Failed to read round table row")?.into_discussion()?);
        }
        Ok(discussions)
    }

    /// Delete every discussion. Participants and messages cascade.
    pub fn delete_all_discussions(&self) -> Result<usize> {
        self.conn
            .execute("DELETE FROM round_tables", [])
            .context("Failed to delete round tables")
    }

    // ── Lifecycle updates ─────────────────────────────────────────────
    //
    // Every status write is conditioned on the expected prior status and
    // reports whether it applied.

    /// `pending -> in_progress`, entering the given phase.
    pub fn start_discussion(&self, id: Uuid, entry_phase: &str) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE round_tables SET status = 'in_progress', current_phase = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![id.to_string(), entry_phase],
            )
            .context("Failed to start round table")?;
        Ok(updated > 0)
    }

    pub fn set_status_if(
        &self,
        id: Uuid,
        expected: DiscussionStatus,
        status: DiscussionStatus,
    ) -> Result<bool> {
        if !is_valid_transition(expected, status) {
            anyhow::bail!("Illegal round table status change {} -> {}", expected, status);
        }
        let updated = self
            .conn
            .execute(
                "UPDATE round_tables SET status = ?3 WHERE id = ?1 AND status = ?2",
                params![id.to_string(), expected.as_str(), status.as_str()],
            )
            .context("Failed to update round table status")?;
        Ok(updated > 0)
    }

    /// `in_progress -> completed`, stamping completion and dropping any snapshot.
    pub fn complete_discussion(&self, id: Uuid) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE round_tables SET status = 'completed', completed_at = ?2, messages_state = NULL
                 WHERE id = ?1 AND status = 'in_progress'",
                params![id.to_string(), now_timestamp()],
            )
            .context("Failed to complete round table")?;
        Ok(updated > 0)
    }

    /// `in_progress -> paused`, storing the conversation snapshot in the same write.
    pub fn save_paused_state(&self, id: Uuid, entries: &[TranscriptEntry]) -> Result<bool> {
        let snapshot =
            serde_json::to_string(entries).context("Failed to serialize messages_state")?;
        let updated = self
            .conn
            .execute(
                "UPDATE round_tables SET status = 'paused', messages_state = ?2
                 WHERE id = ?1 AND status = 'in_progress'",
                params![id.to_string(), snapshot],
            )
            .context("Failed to save paused state")?;
        Ok(updated > 0)
    }

    /// Set the current phase; when `complete` is set, also mark the
    /// discussion completed in the same statement.
    pub fn set_phase(&self, id: Uuid, phase: &str, complete: bool) -> Result<()> {
        if complete {
            self.conn
                .execute(
                    "UPDATE round_tables SET current_phase = ?2, status = 'completed', completed_at = ?3,
                            messages_state = NULL
                     WHERE id = ?1",
                    params![id.to_string(), phase, now_timestamp()],
                )
                .context("Failed to complete round table phase")?;
        } else {
            self.conn
                .execute(
                    "UPDATE round_tables SET current_phase = ?2 WHERE id = ?1",
                    params![id.to_string(), phase],
                )
                .context("Failed to update round table phase")?;
        }
        Ok(())
    }

    // ── Participants ──────────────────────────────────────────────────

    pub fn list_participants(&self, round_table_id: Uuid) -> Result<Vec<Participant>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, round_table_id, agent_id, role, speaking_priority, created_at
                 FROM round_table_participants WHERE round_table_id = ?1
                 ORDER BY speaking_priority",
            )
            .context("Failed to prepare list_participants")?;
        let rows = stmt
            .query_map(params![round_table_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .context("Failed to query participants")?;
        let mut participants = Vec::new();
        for row in rows {
            let (id, rt_id, agent_id, role, speaking_priority, created_at) =
                row.context("Failed to read participant row")?;
            participants.push(Participant {
                id: Uuid::parse_str(&id).context("Invalid participant id")?,
                round_table_id: Uuid::parse_str(&rt_id).context("Invalid round table id")?,
                agent_id: Uuid::parse_str(&agent_id).context("Invalid agent id")?,
                role,
                speaking_priority,
                created_at,
            });
        }
        Ok(participants)
    }

    /// Participants joined with their agent records, in speaking order.
    pub fn list_roster(&self, round_table_id: Uuid) -> Result<Vec<RosterEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT a.id, a.name, a.title, a.background, a.agent_type, a.llm_config, a.tool_config,
                        a.is_active, a.created_at, a.updated_at, p.role, p.speaking_priority
                 FROM round_table_participants p JOIN agents a ON a.id = p.agent_id
                 WHERE p.round_table_id = ?1
                 ORDER BY p.speaking_priority",
            )
            .context("Failed to prepare list_roster")?;
        let rows = stmt
            .query_map(params![round_table_id.to_string()], |row| {
                Ok((
                    agent_row(row)?,
                    row.get::<_, Option<String>>(10)?,
                    row.get::<_, i64>(11)?,
                ))
            })
            .context("Failed to query roster")?;
        let mut roster = Vec::new();
        for row in rows {
            let (agent, role, speaking_priority) = row.context("Failed to read roster row")?;
            roster.push(RosterEntry {
                agent: agent.into_agent()?,
                role,
                speaking_priority,
            });
        }
        Ok(roster)
    }

    // ── Messages ──────────────────────────────────────────────────────

    /// Append a message. Its timestamp never precedes the latest one already
    /// stored for the discussion.
    pub fn append_message(
        &self,
        round_table_id: Uuid,
        agent_id: Uuid,
        content: &str,
        message_type: MessageType,
    ) -> Result<Message> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let latest: Option<String> = tx
            .query_row(
                "SELECT MAX(created_at) FROM messages WHERE round_table_id = ?1",
                params![round_table_id.to_string()],
                |row| row.get(0),
            )
            .context("Failed to read latest message timestamp")?;
        let mut created_at = now_timestamp();
        if let Some(latest) = latest {
            if latest > created_at {
                created_at = latest;
            }
        }
        let id = Uuid::new_v4();
        tx.execute(
            "INSERT INTO messages (id, round_table_id, agent_id, content, message_type, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id.to_string(),
                round_table_id.to_string(),
                agent_id.to_string(),
                content,
                message_type.as_str(),
                created_at,
            ],
        )
        .context("Failed to insert message")?;
        tx.commit().context("Failed to commit message")?;

        let row = self
            .conn
            .query_row(
                &format!("{} WHERE m.id = ?1", MESSAGE_SELECT),
                params![id.to_string()],
                message_row,
            )
            .context("Message not found after insert")?;
        row.into_message()
    }

    /// Messages of one discussion ordered by `(created_at, insertion order)`.
    pub fn list_messages(&self, round_table_id: Uuid) -> Result<Vec<Message>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{} WHERE m.round_table_id = ?1 ORDER BY m.created_at, m.seq",
                MESSAGE_SELECT
            ))
            .context("Failed to prepare list_messages")?;
        let rows = stmt
            .query_map(params![round_table_id.to_string()], message_row)
            .context("Failed to query messages")?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row.context("Failed to read message row")?.into_message()?);
        }
        Ok(messages)
    }

    pub fn count_messages(
        &self,
        round_table_id: Uuid,
        message_type: Option<MessageType>,
    ) -> Result<u32> {
        let count: i64 = match message_type {
            Some(kind) => self.conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE round_table_id = ?1 AND message_type = ?2",
                params![round_table_id.to_string(), kind.as_str()],
                |row| row.get::<_, i64>(0),
            ),
            None => self.conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE round_table_id = ?1",
                params![round_table_id.to_string()],
                |row| row.get::<_, i64>(0),
            ),
        }
        .context("Failed to count messages")?;
        Ok(count as u32)
    }

    pub fn delete_all_messages(&self) -> Result<usize> {
        self.conn
            .execute("DELETE FROM messages", [])
            .context("Failed to delete messages")
    }
}
