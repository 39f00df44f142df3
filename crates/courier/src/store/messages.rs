//! Message persistence and inbox queries.
//!
//! Messages are immutable: one insert, then reads. The interesting part is
//! the query matrix serving inbox views (agent-scoped or global, filtered
//! by state or sender), all of which return [`InboxMessage`] records
//! carrying sender identity and, where the view is recipient-scoped, the
//! recipient-state fields.

use chrono::{DateTime, Utc};

use super::{InboxRow, MailStore, MailTx, MessageRow};
use crate::error::StoreError;
use crate::types::{
    AgentId, InboxMessage, Message, MessageId, Priority, TopicId,
};

const MSG_COLS: &str = "id, thread_id, topic_id, log_offset, sender_id, subject, body, \
     priority, deadline_at, attachments, idempotency_key, created_at";

const INBOX_COLS: &str = "m.id, m.thread_id, m.topic_id, m.log_offset, m.sender_id, \
     s.name AS sender_name, s.project_key AS sender_project_key, \
     s.git_branch AS sender_git_branch, \
     m.subject, m.body, m.priority, m.deadline_at, m.attachments, m.created_at";

const RECIPIENT_COLS: &str = "r.state AS state, r.read_at AS read_at, \
     r.acked_at AS acked_at, r.snoozed_until AS snoozed_until";

const NO_RECIPIENT_COLS: &str = "NULL AS state, NULL AS read_at, \
     NULL AS acked_at, NULL AS snoozed_until";

/// Fields of a message about to be inserted. The log offset must have been
/// allocated inside the same transaction that performs the insert.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub thread_id: String,
    pub topic_id: TopicId,
    pub log_offset: i64,
    pub sender_id: AgentId,
    pub subject: String,
    pub body: String,
    pub priority: Priority,
    pub deadline_at: Option<DateTime<Utc>>,
    pub attachments: Option<String>,
    pub idempotency_key: Option<String>,
}

impl MailTx {
    /// Allocate the next log offset for a topic. Valid only inside the
    /// transaction that inserts the message, which is what keeps offsets
    /// gap-free and strictly increasing per topic.
    pub async fn next_log_offset(&mut self, topic_id: TopicId) -> Result<i64, StoreError> {
        let row: (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(log_offset), 0) + 1 FROM messages WHERE topic_id = ?")
                .bind(topic_id)
                .fetch_one(&mut *self.tx)
                .await?;
        Ok(row.0)
    }

    pub async fn create_message(&mut self, new: NewMessage) -> Result<Message, StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO messages (thread_id, topic_id, log_offset, sender_id, subject, body, \
             priority, deadline_at, attachments, idempotency_key, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&new.thread_id)
        .bind(new.topic_id)
        .bind(new.log_offset)
        .bind(new.sender_id)
        .bind(&new.subject)
        .bind(&new.body)
        .bind(new.priority.as_str())
        .bind(new.deadline_at)
        .bind(&new.attachments)
        .bind(&new.idempotency_key)
        .bind(now)
        .execute(&mut *self.tx)
        .await?;

        Ok(Message {
            id: result.last_insert_rowid(),
            thread_id: new.thread_id,
            topic_id: new.topic_id,
            log_offset: new.log_offset,
            sender_id: new.sender_id,
            subject: new.subject,
            body: new.body,
            priority: new.priority,
            deadline_at: new.deadline_at,
            attachments: new.attachments,
            idempotency_key: new.idempotency_key,
            created_at: now,
        })
    }

    pub async fn get_message(&mut self, id: MessageId) -> Result<Option<Message>, StoreError> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MSG_COLS} FROM messages WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(Message::from))
    }

    pub async fn message_by_idempotency_key(
        &mut self,
        key: &str,
    ) -> Result<Option<Message>, StoreError> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MSG_COLS} FROM messages WHERE idempotency_key = ?"
        ))
        .bind(key)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(Message::from))
    }

    /// One message as seen by one recipient, including archived and trashed
    /// rows. `None` when the agent is not a recipient.
    pub async fn inbox_message(
        &mut self,
        agent_id: AgentId,
        message_id: MessageId,
    ) -> Result<Option<InboxMessage>, StoreError> {
        let row = sqlx::query_as::<_, InboxRow>(&format!(
            "SELECT {INBOX_COLS}, {RECIPIENT_COLS} \
             FROM messages m \
             JOIN agents s ON s.id = m.sender_id \
             JOIN message_recipients r ON r.message_id = m.id \
             WHERE r.agent_id = ? AND m.id = ?"
        ))
        .bind(agent_id)
        .bind(message_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(InboxMessage::from))
    }

    /// Permanently delete a message row. Used by the purge path once the
    /// last recipient row is gone.
    pub async fn delete_message(&mut self, id: MessageId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

impl MailStore {
    /// One message as seen by one recipient, including archived and
    /// trashed rows. `None` when the agent is not a recipient.
    pub async fn inbox_message(
        &self,
        agent_id: AgentId,
        message_id: MessageId,
    ) -> Result<Option<InboxMessage>, StoreError> {
        let row = sqlx::query_as::<_, InboxRow>(&format!(
            "SELECT {INBOX_COLS}, {RECIPIENT_COLS} \
             FROM messages m \
             JOIN agents s ON s.id = m.sender_id \
             JOIN message_recipients r ON r.message_id = m.id \
             WHERE r.agent_id = ? AND m.id = ?"
        ))
        .bind(agent_id)
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(InboxMessage::from))
    }

    pub async fn get_message(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MSG_COLS} FROM messages WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Message::from))
    }

    /// All messages of a thread, oldest first. No recipient state, no
    /// sender identity — the raw rows.
    pub async fn messages_by_thread(&self, thread_id: &str) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MSG_COLS} FROM messages WHERE thread_id = ? ORDER BY id"
        ))
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Message::from).collect())
    }

    /// Thread view enriched with sender identity. Deliberately carries no
    /// per-recipient read flags.
    pub async fn messages_by_thread_with_sender(
        &self,
        thread_id: &str,
    ) -> Result<Vec<InboxMessage>, StoreError> {
        let rows = sqlx::query_as::<_, InboxRow>(&format!(
            "SELECT {INBOX_COLS}, {NO_RECIPIENT_COLS} \
             FROM messages m \
             JOIN agents s ON s.id = m.sender_id \
             WHERE m.thread_id = ? ORDER BY m.id"
        ))
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(InboxMessage::from).collect())
    }

    /// An agent's inbox, newest first. Archived and trashed rows are
    /// excluded; ask for them explicitly via [`list_by_state`](Self::list_by_state).
    pub async fn list_inbox(
        &self,
        agent_id: AgentId,
        limit: i64,
    ) -> Result<Vec<InboxMessage>, StoreError> {
        let rows = sqlx::query_as::<_, InboxRow>(&format!(
            "SELECT {INBOX_COLS}, {RECIPIENT_COLS} \
             FROM messages m \
             JOIN agents s ON s.id = m.sender_id \
             JOIN message_recipients r ON r.message_id = m.id \
             WHERE r.agent_id = ? AND r.state NOT IN ('archived', 'trash') \
             ORDER BY m.id DESC LIMIT ?"
        ))
        .bind(agent_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(InboxMessage::from).collect())
    }

    /// The global inbox view: one record per live `(message, recipient)`
    /// pair across all agents.
    pub async fn list_inbox_global(&self, limit: i64) -> Result<Vec<InboxMessage>, StoreError> {
        let rows = sqlx::query_as::<_, InboxRow>(&format!(
            "SELECT {INBOX_COLS}, {RECIPIENT_COLS} \
             FROM messages m \
             JOIN agents s ON s.id = m.sender_id \
             JOIN message_recipients r ON r.message_id = m.id \
             WHERE r.state NOT IN ('archived', 'trash') \
             ORDER BY m.id DESC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(InboxMessage::from).collect())
    }

    pub async fn list_unread(
        &self,
        agent_id: AgentId,
        limit: i64,
    ) -> Result<Vec<InboxMessage>, StoreError> {
        self.list_by_state_raw(agent_id, "unread", limit).await
    }

    /// Inbox rows in one specific state. This is the only way to see
    /// archived or trashed rows.
    pub async fn list_by_state(
        &self,
        agent_id: AgentId,
        state: crate::types::MessageState,
        limit: i64,
    ) -> Result<Vec<InboxMessage>, StoreError> {
        self.list_by_state_raw(agent_id, state.as_str(), limit).await
    }

    async fn list_by_state_raw(
        &self,
        agent_id: AgentId,
        state: &str,
        limit: i64,
    ) -> Result<Vec<InboxMessage>, StoreError> {
        let rows = sqlx::query_as::<_, InboxRow>(&format!(
            "SELECT {INBOX_COLS}, {RECIPIENT_COLS} \
             FROM messages m \
             JOIN agents s ON s.id = m.sender_id \
             JOIN message_recipients r ON r.message_id = m.id \
             WHERE r.agent_id = ? AND r.state = ? \
             ORDER BY m.id DESC LIMIT ?"
        ))
        .bind(agent_id)
        .bind(state)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(InboxMessage::from).collect())
    }

    /// Messages sent by an agent, newest first. Carries no recipient state.
    pub async fn list_sent(
        &self,
        agent_id: AgentId,
        limit: i64,
    ) -> Result<Vec<InboxMessage>, StoreError> {
        let rows = sqlx::query_as::<_, InboxRow>(&format!(
            "SELECT {INBOX_COLS}, {NO_RECIPIENT_COLS} \
             FROM messages m \
             JOIN agents s ON s.id = m.sender_id \
             WHERE m.sender_id = ? \
             ORDER BY m.id DESC LIMIT ?"
        ))
        .bind(agent_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(InboxMessage::from).collect())
    }

    pub async fn list_sent_global(&self, limit: i64) -> Result<Vec<InboxMessage>, StoreError> {
        let rows = sqlx::query_as::<_, InboxRow>(&format!(
            "SELECT {INBOX_COLS}, {NO_RECIPIENT_COLS} \
             FROM messages m \
             JOIN agents s ON s.id = m.sender_id \
             ORDER BY m.id DESC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(InboxMessage::from).collect())
    }

    /// Inbox rows whose sender name starts with `prefix`.
    pub async fn list_by_sender_prefix(
        &self,
        agent_id: AgentId,
        prefix: &str,
        limit: i64,
    ) -> Result<Vec<InboxMessage>, StoreError> {
        let pattern = format!("{prefix}%");
        let rows = sqlx::query_as::<_, InboxRow>(&format!(
            "SELECT {INBOX_COLS}, {RECIPIENT_COLS} \
             FROM messages m \
             JOIN agents s ON s.id = m.sender_id \
             JOIN message_recipients r ON r.message_id = m.id \
             WHERE r.agent_id = ? AND s.name LIKE ? \
               AND r.state NOT IN ('archived', 'trash') \
             ORDER BY m.id DESC LIMIT ?"
        ))
        .bind(agent_id)
        .bind(pattern)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(InboxMessage::from).collect())
    }

    /// Substring search over subject and body within an agent's inbox.
    pub async fn search_inbox(
        &self,
        agent_id: AgentId,
        query: &str,
        limit: i64,
    ) -> Result<Vec<InboxMessage>, StoreError> {
        let pattern = format!("%{query}%");
        let rows = sqlx::query_as::<_, InboxRow>(&format!(
            "SELECT {INBOX_COLS}, {RECIPIENT_COLS} \
             FROM messages m \
             JOIN agents s ON s.id = m.sender_id \
             JOIN message_recipients r ON r.message_id = m.id \
             WHERE r.agent_id = ? AND (m.subject LIKE ? OR m.body LIKE ?) \
             ORDER BY m.id DESC LIMIT ?"
        ))
        .bind(agent_id)
        .bind(&pattern)
        .bind(&pattern)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(InboxMessage::from).collect())
    }

    /// Substring search over every message, regardless of recipient.
    pub async fn search_global(
        &self,
        query: &str,
        limit: i64,
    ) -> Result<Vec<InboxMessage>, StoreError> {
        let pattern = format!("%{query}%");
        let rows = sqlx::query_as::<_, InboxRow>(&format!(
            "SELECT {INBOX_COLS}, {NO_RECIPIENT_COLS} \
             FROM messages m \
             JOIN agents s ON s.id = m.sender_id \
             WHERE m.subject LIKE ? OR m.body LIKE ? \
             ORDER BY m.id DESC LIMIT ?"
        ))
        .bind(&pattern)
        .bind(&pattern)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(InboxMessage::from).collect())
    }

    /// Live inbox rows with a message id above `after_id`, oldest first.
    /// Drives the inbox subscription poller.
    pub async fn inbox_messages_after(
        &self,
        agent_id: AgentId,
        after_id: MessageId,
    ) -> Result<Vec<InboxMessage>, StoreError> {
        let rows = sqlx::query_as::<_, InboxRow>(&format!(
            "SELECT {INBOX_COLS}, {RECIPIENT_COLS} \
             FROM messages m \
             JOIN agents s ON s.id = m.sender_id \
             JOIN message_recipients r ON r.message_id = m.id \
             WHERE r.agent_id = ? AND m.id > ? \
               AND r.state NOT IN ('archived', 'trash') \
             ORDER BY m.id"
        ))
        .bind(agent_id)
        .bind(after_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(InboxMessage::from).collect())
    }

    /// The highest message id currently assigned, or 0 on an empty store.
    pub async fn max_message_id(&self) -> Result<MessageId, StoreError> {
        let row: (i64,) = sqlx::query_as("SELECT COALESCE(MAX(id), 0) FROM messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Messages of one topic past a log offset, in offset order. Recipient
    /// state is joined for `agent_id` where a row exists.
    pub async fn messages_since_offset(
        &self,
        topic_id: TopicId,
        after_offset: i64,
        agent_id: AgentId,
    ) -> Result<Vec<InboxMessage>, StoreError> {
        let rows = sqlx::query_as::<_, InboxRow>(&format!(
            "SELECT {INBOX_COLS}, {RECIPIENT_COLS} \
             FROM messages m \
             JOIN agents s ON s.id = m.sender_id \
             LEFT JOIN message_recipients r \
               ON r.message_id = m.id AND r.agent_id = ? \
             WHERE m.topic_id = ? AND m.log_offset > ? \
             ORDER BY m.log_offset"
        ))
        .bind(agent_id)
        .bind(topic_id)
        .bind(after_offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(InboxMessage::from).collect())
    }
}
