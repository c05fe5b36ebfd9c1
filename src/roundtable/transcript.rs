//! Append-only transcript store.
//!
//! Messages are never updated or reordered. Reads return them ordered by
//! creation time with insertion order breaking ties.

use uuid::Uuid;

use super::db::DbHandle;
use super::models::{Message, MessageType, TranscriptEntry};
use crate::errors::DiscussionError;

#[derive(Clone)]
pub struct TranscriptStore {
    db: DbHandle,
}

impl TranscriptStore {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    pub async fn append(
        &self,
        round_table_id: Uuid,
        agent_id: Uuid,
        content: String,
        message_type: MessageType,
    ) -> Result<Message, DiscussionError> {
        let message = self
            .db
            .call(move |db| db.append_message(round_table_id, agent_id, &content, message_type))
            .await?;
        Ok(message)
    }

    pub async fn read(&self, round_table_id: Uuid) -> Result<Vec<Message>, DiscussionError> {
        Ok(self
            .db
            .call(move |db| db.list_messages(round_table_id))
            .await?)
    }

    pub async fn count(
        &self,
        round_table_id: Uuid,
        message_type: Option<MessageType>,
    ) -> Result<u32, DiscussionError> {
        Ok(self
            .db
            .call(move |db| db.count_messages(round_table_id, message_type))
            .await?)
    }

    /// The stored transcript in `messages_state` form.
    pub async fn snapshot(
        &self,
        round_table_id: Uuid,
    ) -> Result<Vec<TranscriptEntry>, DiscussionError> {
        let messages = self.read(round_table_id).await?;
        Ok(messages.iter().map(TranscriptEntry::from_message).collect())
    }

    /// Delete every message of every discussion.
    pub async fn purge_all(&self) -> Result<usize, DiscussionError> {
        Ok(self.db.call(|db| db.delete_all_messages()).await?)
    }
}
