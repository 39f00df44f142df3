//! Error types for the mail core.
//!
//! Handlers never panic: every failure is carried back to the caller as a
//! [`MailError`] inside the response envelope. Storage failures are wrapped
//! with a diagnostic prefix and otherwise propagated verbatim.

use serde::{Deserialize, Serialize};

use crate::types::{AgentId, MessageId};

/// Errors originating from the storage collaborator.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("failed to create database directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures a mail operation can report.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    /// Carries the unresolved recipient name so callers can surface it.
    #[error("recipient not found: {0}")]
    RecipientNotFound(String),

    #[error("message not found: {0}")]
    MessageNotFound(MessageId),

    #[error("topic not found: {0}")]
    TopicNotFound(String),

    #[error("agent {agent_id} is not a recipient of message {message_id}")]
    NotARecipient {
        agent_id: AgentId,
        message_id: MessageId,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage: {0}")]
    Storage(#[from] StoreError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
}

/// Coarse error class, serialized into response envelopes so callers can
/// branch without parsing the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    InvalidArgument,
    Conflict,
    Storage,
    Cancelled,
    UnknownMessageType,
}

impl MailError {
    pub fn code(&self) -> ErrorCode {
        match self {
            MailError::AgentNotFound(_)
            | MailError::RecipientNotFound(_)
            | MailError::MessageNotFound(_)
            | MailError::TopicNotFound(_)
            | MailError::NotARecipient { .. } => ErrorCode::NotFound,
            MailError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            MailError::Conflict(_) => ErrorCode::Conflict,
            MailError::Storage(_) => ErrorCode::Storage,
            MailError::Cancelled => ErrorCode::Cancelled,
            MailError::UnknownMessageType(_) => ErrorCode::UnknownMessageType,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipient_not_found_names_the_recipient() {
        let err = MailError::RecipientNotFound("zoe".into());
        let text = err.to_string();
        assert!(text.contains("not found"));
        assert!(text.contains("zoe"));
    }

    #[test]
    fn codes_classify_variants() {
        assert_eq!(
            MailError::TopicNotFound("x".into()).code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            MailError::InvalidArgument("bad".into()).code(),
            ErrorCode::InvalidArgument
        );
        assert_eq!(MailError::Cancelled.code(), ErrorCode::Cancelled);
    }
}
