//! SQLite-backed mail store.
//!
//! Owns every piece of durable state: agents, topics, subscriptions,
//! messages, and per-recipient rows. Uses WAL mode for crash-safe writes
//! and concurrent readers. Mutating flows that must be atomic (sending a
//! message, moving a recipient row) run inside a [`MailTx`]; dropping a
//! transaction without committing rolls it back.
//!
//! Operation groups live in submodules: [`agents`], [`topics`],
//! [`messages`], [`recipients`].

mod agents;
mod messages;
mod recipients;
mod topics;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{FromRow, Sqlite, SqlitePool, Transaction};

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::types::{
    Agent, InboxMessage, Message, MessageRecipient, MessageState, Priority, Topic, TopicType,
};

pub use messages::NewMessage;
pub use recipients::RecipientStateUpdate;

/// The persistent mail store.
pub struct MailStore {
    pool: SqlitePool,
}

impl MailStore {
    /// Open (or create) the SQLite database and run migrations.
    pub async fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let opts = SqliteConnectOptions::new()
            .filename(&config.db_path)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Open an in-memory store (useful for tests). A single connection is
    /// used so every caller sees the same database.
    pub async fn open_memory() -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(":memory:")
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Begin a read-write transaction.
    pub async fn begin(&self) -> Result<MailTx, StoreError> {
        Ok(MailTx {
            tx: self.pool.begin().await?,
        })
    }

    /// Run the schema migrations.
    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                name                TEXT NOT NULL UNIQUE,
                project_key         TEXT,
                git_branch          TEXT,
                current_session_id  TEXT,
                created_at          TEXT NOT NULL,
                last_active_at      TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS topics (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                name            TEXT NOT NULL UNIQUE,
                topic_type      TEXT NOT NULL DEFAULT 'broadcast',
                retention_secs  INTEGER,
                created_at      TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS subscriptions (
                agent_id    INTEGER NOT NULL,
                topic_id    INTEGER NOT NULL,
                created_at  TEXT NOT NULL,
                PRIMARY KEY (agent_id, topic_id)
            );
            CREATE INDEX IF NOT EXISTS idx_subscriptions_topic
                ON subscriptions(topic_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                thread_id        TEXT NOT NULL,
                topic_id         INTEGER NOT NULL,
                log_offset       INTEGER NOT NULL,
                sender_id        INTEGER NOT NULL,
                subject          TEXT NOT NULL DEFAULT '',
                body             TEXT NOT NULL DEFAULT '',
                priority         TEXT NOT NULL DEFAULT 'normal',
                deadline_at      TEXT,
                attachments      TEXT,
                idempotency_key  TEXT UNIQUE,
                created_at       TEXT NOT NULL,
                UNIQUE (topic_id, log_offset)
            );
            CREATE INDEX IF NOT EXISTS idx_messages_thread
                ON messages(thread_id);
            CREATE INDEX IF NOT EXISTS idx_messages_sender
                ON messages(sender_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS message_recipients (
                message_id     INTEGER NOT NULL,
                agent_id       INTEGER NOT NULL,
                state          TEXT NOT NULL DEFAULT 'unread',
                snoozed_until  TEXT,
                read_at        TEXT,
                acked_at       TEXT,
                purge_at       TEXT,
                was_read       INTEGER NOT NULL DEFAULT 0,
                was_starred    INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (message_id, agent_id)
            );
            CREATE INDEX IF NOT EXISTS idx_recipients_agent_state
                ON message_recipients(agent_id, state);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// A read-write transaction over the mail store. Exposes the same
/// operation groups as [`MailStore`]; changes become visible only after
/// [`commit`](Self::commit). Dropping the value rolls back.
pub struct MailTx {
    tx: Transaction<'static, Sqlite>,
}

impl MailTx {
    pub async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row shims — sqlx rows converted into domain types
// ---------------------------------------------------------------------------

#[derive(Debug, FromRow)]
struct AgentRow {
    id: i64,
    name: String,
    project_key: Option<String>,
    git_branch: Option<String>,
    current_session_id: Option<String>,
    created_at: DateTime<Utc>,
    last_active_at: Option<DateTime<Utc>>,
}

impl From<AgentRow> for Agent {
    fn from(r: AgentRow) -> Self {
        Agent {
            id: r.id,
            name: r.name,
            project_key: r.project_key,
            git_branch: r.git_branch,
            current_session_id: r.current_session_id,
            created_at: r.created_at,
            last_active_at: r.last_active_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct TopicRow {
    id: i64,
    name: String,
    topic_type: String,
    retention_secs: Option<i64>,
    created_at: DateTime<Utc>,
}

impl From<TopicRow> for Topic {
    fn from(r: TopicRow) -> Self {
        Topic {
            id: r.id,
            name: r.name,
            topic_type: TopicType::from_wire(&r.topic_type),
            retention_secs: r.retention_secs,
            created_at: r.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: i64,
    thread_id: String,
    topic_id: i64,
    log_offset: i64,
    sender_id: i64,
    subject: String,
    body: String,
    priority: String,
    deadline_at: Option<DateTime<Utc>>,
    attachments: Option<String>,
    idempotency_key: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<MessageRow> for Message {
    fn from(r: MessageRow) -> Self {
        Message {
            id: r.id,
            thread_id: r.thread_id,
            topic_id: r.topic_id,
            log_offset: r.log_offset,
            sender_id: r.sender_id,
            subject: r.subject,
            body: r.body,
            priority: Priority::from_wire(&r.priority),
            deadline_at: r.deadline_at,
            attachments: r.attachments,
            idempotency_key: r.idempotency_key,
            created_at: r.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct RecipientRow {
    message_id: i64,
    agent_id: i64,
    state: String,
    snoozed_until: Option<DateTime<Utc>>,
    read_at: Option<DateTime<Utc>>,
    acked_at: Option<DateTime<Utc>>,
    purge_at: Option<DateTime<Utc>>,
    was_read: bool,
    was_starred: bool,
}

impl From<RecipientRow> for MessageRecipient {
    fn from(r: RecipientRow) -> Self {
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
        }
    }
}

#[derive(Debug, FromRow)]
struct InboxRow {
    id: i64,
    thread_id: String,
    topic_id: i64,
    log_offset: i64,
    sender_id: i64,
    sender_name: String,
    sender_project_key: Option<String>,
    sender_git_branch: Option<String>,
    subject: String,
    body: String,
    priority: String,
    deadline_at: Option<DateTime<Utc>>,
    attachments: Option<String>,
    created_at: DateTime<Utc>,
    state: Option<String>,
    read_at: Option<DateTime<Utc>>,
    acked_at: Option<DateTime<Utc>>,
    snoozed_until: Option<DateTime<Utc>>,
}

impl From<InboxRow> for InboxMessage {
    fn from(r: InboxRow) -> Self {
        InboxMessage {
            id: r.id,
            thread_id: r.thread_id,
            topic_id: r.topic_id,
            log_offset: r.log_offset,
            sender_id: r.sender_id,
            sender_name: r.sender_name,
            sender_project_key: r.sender_project_key,
            sender_git_branch: r.sender_git_branch,
            subject: r.subject,
            body: r.body,
            priority: Priority::from_wire(&r.priority),
            deadline_at: r.deadline_at,
            attachments: r.attachments,
            created_at: r.created_at,
            state: r.state.as_deref().map(MessageState::from_wire),
            read_at: r.read_at,
            acked_at: r.acked_at,
            snoozed_until: r.snoozed_until,
        }
    }
}

/// Map unique-constraint violations onto [`StoreError::Conflict`]; every
/// other database error passes through.
fn map_unique_violation(e: sqlx::Error, what: &str) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation) {
            return StoreError::Conflict(format!("{what} already exists"));
        }
    }
    StoreError::Db(e)
}
