//! Per-recipient row operations and unread counters.
//!
//! Updates follow the SQL contract that zero affected rows is not an
//! error: callers get the affected-row count back and decide what silence
//! means.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::{MailStore, MailTx, RecipientRow};
use crate::error::StoreError;
use crate::types::{AgentId, MessageId, MessageRecipient, MessageState};

const RECIPIENT_COLS: &str = "message_id, agent_id, state, snoozed_until, read_at, acked_at, \
     purge_at, was_read, was_starred";

/// The full set of state fields written when a lifecycle transition is
/// persisted. Fields not carried by the new state are cleared.
#[derive(Debug, Clone)]
pub struct RecipientStateUpdate {
    pub state: MessageState,
    pub snoozed_until: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub acked_at: Option<DateTime<Utc>>,
    pub purge_at: Option<DateTime<Utc>>,
    pub was_read: bool,
    pub was_starred: bool,
}

impl MailTx {
    /// Insert the initial `unread` row for one recipient of a message.
    pub async fn create_recipient(
        &mut self,
        message_id: MessageId,
        agent_id: AgentId,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO message_recipients (message_id, agent_id, state) VALUES (?, ?, 'unread')",
        )
        .bind(message_id)
        .bind(agent_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn get_recipient(
        &mut self,
        message_id: MessageId,
        agent_id: AgentId,
    ) -> Result<Option<MessageRecipient>, StoreError> {
        let row = sqlx::query_as::<_, RecipientRow>(&format!(
            "SELECT {RECIPIENT_COLS} FROM message_recipients WHERE message_id = ? AND agent_id = ?"
        ))
        .bind(message_id)
        .bind(agent_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(MessageRecipient::from))
    }

    /// Write every state field of a recipient row. Returns the number of
    /// rows affected (zero when the row does not exist).
    pub async fn update_recipient_state(
        &mut self,
        message_id: MessageId,
        agent_id: AgentId,
        update: &RecipientStateUpdate,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE message_recipients SET state = ?, snoozed_until = ?, read_at = ?, \
             acked_at = ?, purge_at = ?, was_read = ?, was_starred = ? \
             WHERE message_id = ? AND agent_id = ?",
        )
        .bind(update.state.as_str())
        .bind(update.snoozed_until)
        .bind(update.read_at)
        .bind(update.acked_at)
        .bind(update.purge_at)
        .bind(update.was_read)
        .bind(update.was_starred)
        .bind(message_id)
        .bind(agent_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    /// The dedicated mark-read path: flips the row to `read` and stamps
    /// `read_at`, clearing any snooze.
    pub async fn mark_read(
        &mut self,
        message_id: MessageId,
        agent_id: AgentId,
        read_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE message_recipients SET state = 'read', read_at = ?, snoozed_until = NULL \
             WHERE message_id = ? AND agent_id = ?",
        )
        .bind(read_at)
        .bind(message_id)
        .bind(agent_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    /// Stamp `acked_at` without touching the state machine fields.
    pub async fn ack_recipient(
        &mut self,
        message_id: MessageId,
        agent_id: AgentId,
        acked_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE message_recipients SET acked_at = ? WHERE message_id = ? AND agent_id = ?",
        )
        .bind(acked_at)
        .bind(message_id)
        .bind(agent_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    /// Move a row to `snoozed` with the given wake time.
    pub async fn snooze_recipient(
        &mut self,
        message_id: MessageId,
        agent_id: AgentId,
        until: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE message_recipients SET state = 'snoozed', snoozed_until = ? \
             WHERE message_id = ? AND agent_id = ?",
        )
        .bind(until)
        .bind(message_id)
        .bind(agent_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    /// Permanently remove one recipient row (the purge path).
    pub async fn delete_recipient(
        &mut self,
        message_id: MessageId,
        agent_id: AgentId,
    ) -> Result<bool, StoreError> {
        let result =
            sqlx::query("DELETE FROM message_recipients WHERE message_id = ? AND agent_id = ?")
                .bind(message_id)
                .bind(agent_id)
                .execute(&mut *self.tx)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// How many recipient rows a message still has.
    pub async fn count_recipients(&mut self, message_id: MessageId) -> Result<i64, StoreError> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM message_recipients WHERE message_id = ?")
                .bind(message_id)
                .fetch_one(&mut *self.tx)
                .await?;
        Ok(row.0)
    }
}

/// A recipient row joined with the thread id of its message, as needed to
/// rebuild lifecycle machines after a restart.
#[derive(Debug, FromRow)]
struct ResumeRow {
    message_id: i64,
    agent_id: i64,
    state: String,
    snoozed_until: Option<DateTime<Utc>>,
    read_at: Option<DateTime<Utc>>,
    acked_at: Option<DateTime<Utc>>,
    purge_at: Option<DateTime<Utc>>,
    was_read: bool,
    was_starred: bool,
    thread_id: String,
}

impl MailStore {
    pub async fn get_recipient(
        &self,
        message_id: MessageId,
        agent_id: AgentId,
    ) -> Result<Option<MessageRecipient>, StoreError> {
        let row = sqlx::query_as::<_, RecipientRow>(&format!(
            "SELECT {RECIPIENT_COLS} FROM message_recipients WHERE message_id = ? AND agent_id = ?"
        ))
        .bind(message_id)
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(MessageRecipient::from))
    }

    pub async fn get_recipients(
        &self,
        message_id: MessageId,
    ) -> Result<Vec<MessageRecipient>, StoreError> {
        let rows = sqlx::query_as::<_, RecipientRow>(&format!(
            "SELECT {RECIPIENT_COLS} FROM message_recipients WHERE message_id = ? ORDER BY agent_id"
        ))
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(MessageRecipient::from).collect())
    }

    /// Recipient rows for a batch of messages in one query.
    pub async fn get_recipients_bulk(
        &self,
        message_ids: &[MessageId],
    ) -> Result<Vec<MessageRecipient>, StoreError> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; message_ids.len()].join(", ");
        let sql = format!(
            "SELECT {RECIPIENT_COLS} FROM message_recipients \
             WHERE message_id IN ({placeholders}) ORDER BY message_id, agent_id"
        );
        let mut query = sqlx::query_as::<_, RecipientRow>(&sql);
        for id in message_ids {
            query = query.bind(*id);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(MessageRecipient::from).collect())
    }

    /// Rows holding a pending timer (`snoozed` or `trash`), with the thread
    /// id each lifecycle machine needs.
    pub async fn recipients_with_pending_timers(
        &self,
    ) -> Result<Vec<(MessageRecipient, String)>, StoreError> {
        let rows = sqlx::query_as::<_, ResumeRow>(
            "SELECT r.message_id, r.agent_id, r.state, r.snoozed_until, r.read_at, r.acked_at, \
                    r.purge_at, r.was_read, r.was_starred, m.thread_id \
             FROM message_recipients r \
             JOIN messages m ON m.id = r.message_id \
             WHERE r.state IN ('snoozed', 'trash') \
             ORDER BY r.message_id, r.agent_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    MessageRecipient {
                        message_id: r.message_id,
                        agent_id: r.agent_id,
                        state: MessageState::from_wire(&r.state),
                        snoozed_until: r.snoozed_until,
                        read_at: r.read_at,
                        acked_at: r.acked_at,
                        purge_at: r.purge_at,
                        was_read: r.was_read,
                        was_starred: r.was_starred,
                    },
                    r.thread_id,
                )
            })
            .collect())
    }

    // -- counts --------------------------------------------------------------

    pub async fn count_unread(&self, agent_id: AgentId) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM message_recipients WHERE agent_id = ? AND state = 'unread'",
        )
        .bind(agent_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    pub async fn count_unread_urgent(&self, agent_id: AgentId) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM message_recipients r \
             JOIN messages m ON m.id = r.message_id \
             WHERE r.agent_id = ? AND r.state = 'unread' AND m.priority = 'urgent'",
        )
        .bind(agent_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MailStore, NewMessage};
    use crate::types::{new_thread_id, Priority};

    async fn message_with_recipient(store: &MailStore, priority: Priority) -> (MessageId, AgentId) {
        let sender = match store.agent_by_name("s").await.unwrap() {
            Some(a) => a,
            None => store.create_agent("s", None, None).await.unwrap(),
        };
        let recipient = match store.agent_by_name("r").await.unwrap() {
            Some(a) => a,
            None => store.create_agent("r", None, None).await.unwrap(),
        };
        let mut tx = store.begin().await.unwrap();
        let inbox = tx.get_or_create_agent_inbox(&recipient).await.unwrap();
        let offset = tx.next_log_offset(inbox.id).await.unwrap();
        let msg = tx
            .create_message(NewMessage {
                thread_id: new_thread_id(),
                topic_id: inbox.id,
                log_offset: offset,
                sender_id: sender.id,
                subject: "s".into(),
                body: "b".into(),
                priority,
                deadline_at: None,
                attachments: None,
                idempotency_key: None,
            })
            .await
            .unwrap();
        tx.create_recipient(msg.id, recipient.id).await.unwrap();
        tx.commit().await.unwrap();
        (msg.id, recipient.id)
    }

    #[tokio::test]
    async fn rows_start_unread() {
        let store = MailStore::open_memory().await.unwrap();
        let (message_id, agent_id) = message_with_recipient(&store, Priority::Normal).await;

        let row = store
            .get_recipient(message_id, agent_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.state, MessageState::Unread);
        assert!(row.read_at.is_none());
        assert!(row.acked_at.is_none());
    }

    #[tokio::test]
    async fn update_on_missing_row_affects_zero() {
        let store = MailStore::open_memory().await.unwrap();
        let mut tx = store.begin().await.unwrap();
        let affected = tx
            .mark_read(999, 888, Utc::now())
            .await
            .unwrap();
        assert_eq!(affected, 0);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn unread_counters_track_state_and_priority() {
        let store = MailStore::open_memory().await.unwrap();
        let (m1, agent) = message_with_recipient(&store, Priority::Urgent).await;
        let (_m2, _) = message_with_recipient(&store, Priority::Normal).await;

        assert_eq!(store.count_unread(agent).await.unwrap(), 2);
        assert_eq!(store.count_unread_urgent(agent).await.unwrap(), 1);

        let mut tx = store.begin().await.unwrap();
        tx.mark_read(m1, agent, Utc::now()).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.count_unread(agent).await.unwrap(), 1);
        assert_eq!(store.count_unread_urgent(agent).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn full_state_update_round_trips() {
        let store = MailStore::open_memory().await.unwrap();
        let (message_id, agent_id) = message_with_recipient(&store, Priority::Normal).await;

        let until = Utc::now() + chrono::Duration::hours(1);
        let mut tx = store.begin().await.unwrap();
        let affected = tx
            .update_recipient_state(
                message_id,
                agent_id,
                &RecipientStateUpdate {
                    state: MessageState::Snoozed,
                    snoozed_until: Some(until),
                    read_at: None,
                    acked_at: None,
                    purge_at: None,
                    was_read: true,
                    was_starred: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(affected, 1);
        tx.commit().await.unwrap();

        let row = store
            .get_recipient(message_id, agent_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.state, MessageState::Snoozed);
        assert_eq!(row.snoozed_until, Some(until));
        assert!(row.was_read);

        let pending = store.recipients_with_pending_timers().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].0.message_id, message_id);
        assert!(!pending[0].1.is_empty());
    }

    #[tokio::test]
    async fn bulk_recipient_lookup() {
        let store = MailStore::open_memory().await.unwrap();
        let (m1, _) = message_with_recipient(&store, Priority::Normal).await;
        let (m2, _) = message_with_recipient(&store, Priority::Normal).await;

        let rows = store.get_recipients_bulk(&[m1, m2]).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(store.get_recipients_bulk(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn purge_deletes_row_and_counts_remaining() {
        let store = MailStore::open_memory().await.unwrap();
        let (message_id, agent_id) = message_with_recipient(&store, Priority::Normal).await;

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.count_recipients(message_id).await.unwrap(), 1);
        assert!(tx.delete_recipient(message_id, agent_id).await.unwrap());
        assert_eq!(tx.count_recipients(message_id).await.unwrap(), 0);
        assert!(tx.delete_message(message_id).await.unwrap());
        tx.commit().await.unwrap();

        assert!(store.get_message(message_id).await.unwrap().is_none());
    }
}
