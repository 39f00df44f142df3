use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identity aliases
// ---------------------------------------------------------------------------

/// Row id of an agent. `0` is the wildcard used by global viewers.
pub type AgentId = i64;
/// Row id of a message.
pub type MessageId = i64;
/// Row id of a topic.
pub type TopicId = i64;

/// The agent id reserved for global inbox viewers. Every send notifies this
/// id in addition to the concrete recipients.
pub const GLOBAL_AGENT_ID: AgentId = 0;

/// Mint a fresh thread id. Thread ids are opaque; the only requirement is
/// collision resistance, which a v4 UUID satisfies.
pub fn new_thread_id() -> String {
    Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Message priority. Ordered so that `Urgent > Normal > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::Urgent => "urgent",
        }
    }

    /// Parse a wire-level priority string. Unknown values map to `Normal`
    /// so that rows written by a newer version still load.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "low" => Priority::Low,
            "urgent" => Priority::Urgent,
            _ => Priority::Normal,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Per-recipient message state
// ---------------------------------------------------------------------------

/// Wire-level state of a `(message, recipient)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Unread,
    Read,
    Starred,
    Snoozed,
    Archived,
    Trash,
}

impl MessageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageState::Unread => "unread",
            MessageState::Read => "read",
            MessageState::Starred => "starred",
            MessageState::Snoozed => "snoozed",
            MessageState::Archived => "archived",
            MessageState::Trash => "trash",
        }
    }

    /// Parse a wire-level state string, if recognized.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unread" => Some(MessageState::Unread),
            "read" => Some(MessageState::Read),
            "starred" => Some(MessageState::Starred),
            "snoozed" => Some(MessageState::Snoozed),
            "archived" => Some(MessageState::Archived),
            "trash" => Some(MessageState::Trash),
            _ => None,
        }
    }

    /// Parse a persisted state string. Unknown values load as `Unread` so
    /// rows written by a newer version remain usable.
    pub fn from_wire(s: &str) -> Self {
        Self::parse(s).unwrap_or(MessageState::Unread)
    }
}

impl std::fmt::Display for MessageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Topic type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicType {
    /// Per-agent inbox topic, auto-created as `inbox-<AgentName>`.
    Inbox,
    /// Named broadcast channel delivered to all subscribers.
    Broadcast,
    /// Point-to-point topic.
    Direct,
}

impl TopicType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicType::Inbox => "inbox",
            TopicType::Broadcast => "broadcast",
            TopicType::Direct => "direct",
        }
    }

    pub fn from_wire(s: &str) -> Self {
        match s {
            "inbox" => TopicType::Inbox,
            "direct" => TopicType::Direct,
            _ => TopicType::Broadcast,
        }
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// An addressable participant. Agents are registered by the surrounding
/// system; the mail core consumes them by id or name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub project_key: Option<String>,
    pub git_branch: Option<String>,
    pub current_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: Option<DateTime<Utc>>,
}

/// A named channel. Every message lives under exactly one topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    pub id: TopicId,
    pub name: String,
    pub topic_type: TopicType,
    /// Optional retention window, in seconds. `None` keeps forever.
    pub retention_secs: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// The inbox topic name for a given agent.
pub fn inbox_topic_name(agent_name: &str) -> String {
    format!("inbox-{agent_name}")
}

/// An immutable message row. Created in one transaction together with all
/// of its recipient rows; never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub thread_id: String,
    pub topic_id: TopicId,
    /// Strictly increasing per topic, assigned at commit.
    pub log_offset: i64,
    pub sender_id: AgentId,
    pub subject: String,
    pub body: String,
    pub priority: Priority,
    pub deadline_at: Option<DateTime<Utc>>,
    pub attachments: Option<String>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-recipient delivery state for one message. Exactly one row exists per
/// `(message, recipient)` pair; rows start out `unread`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecipient {
    pub message_id: MessageId,
    pub agent_id: AgentId,
    pub state: MessageState,
    pub snoozed_until: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub acked_at: Option<DateTime<Utc>>,
    /// When in `trash`, the scheduled permanent-deletion time.
    pub purge_at: Option<DateTime<Utc>>,
    /// True when the row had been read before it was snoozed.
    pub was_read: bool,
    /// True when the row was starred before it was archived.
    pub was_starred: bool,
}

// ---------------------------------------------------------------------------
// Inbox view
// ---------------------------------------------------------------------------

/// A message as seen from an inbox: the message itself, sender identity,
/// and (when the view is recipient-scoped) the recipient-state fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxMessage {
    pub id: MessageId,
    pub thread_id: String,
    pub topic_id: TopicId,
    pub log_offset: i64,
    pub sender_id: AgentId,
    pub sender_name: String,
    pub sender_project_key: Option<String>,
    pub sender_git_branch: Option<String>,
    pub subject: String,
    pub body: String,
    pub priority: Priority,
    pub deadline_at: Option<DateTime<Utc>>,
    pub attachments: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Recipient-state fields. Absent on sent/thread views, which carry no
    /// per-recipient state.
    pub state: Option<MessageState>,
    pub read_at: Option<DateTime<Utc>>,
    pub acked_at: Option<DateTime<Utc>>,
    pub snoozed_until: Option<DateTime<Utc>>,
}
