//! Tagged request/response protocol.
//!
//! Every operation is callable two ways: directly as a method on
//! [`MailService`], or as a tagged message handed to
//! [`receive`](MailService::receive), which dispatches into the same
//! handler and wraps the result in an [`Envelope`]. The JSON entry point
//! [`receive_value`](MailService::receive_value) additionally rejects
//! unrecognized tags with an unknown-message-type error.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::MailService;
use crate::error::{ErrorCode, MailError};
use crate::types::{
    AgentId, InboxMessage, MessageId, MessageState, Priority, Topic, TopicId,
};

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    pub sender_id: AgentId,
    /// Recipient agent names. May be empty when `topic` is given.
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub topic: Option<String>,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub deadline_at: Option<DateTime<Utc>>,
    /// Reply into an existing thread; a fresh thread id is minted when
    /// absent.
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub attachments: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRequest {
    pub sender_id: AgentId,
    pub topic: String,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub priority: Priority,
}

/// Filters for inbox fetches. `agent_id == 0` selects the global view.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchParams {
    pub agent_id: AgentId,
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub unread_only: bool,
    #[serde(default)]
    pub sent_only: bool,
    #[serde(default)]
    pub state: Option<MessageState>,
    #[serde(default)]
    pub sender_prefix: Option<String>,
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReceipt {
    pub message_id: MessageId,
    pub thread_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub message_id: MessageId,
    /// How many subscriber recipient rows were created.
    pub recipients: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSummary {
    pub agent_name: String,
    pub unread_count: i64,
    pub urgent_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollResult {
    pub messages: Vec<InboxMessage>,
    /// Highest log offset observed per topic during the poll.
    pub new_offsets: HashMap<TopicId, i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicInfo {
    pub topic: Topic,
    pub subscribed: bool,
    pub message_count: Option<i64>,
}

// ---------------------------------------------------------------------------
// Tagged unions
// ---------------------------------------------------------------------------

/// Every mail operation as a tagged message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MailRequest {
    Send(SendRequest),
    Publish(PublishRequest),
    FetchInbox(FetchParams),
    ReadMessage {
        agent_id: AgentId,
        message_id: MessageId,
    },
    UpdateState {
        agent_id: AgentId,
        message_id: MessageId,
        state: String,
        #[serde(default)]
        snoozed_until: Option<DateTime<Utc>>,
    },
    AckMessage {
        agent_id: AgentId,
        message_id: MessageId,
    },
    GetStatus {
        agent_id: AgentId,
    },
    PollChanges {
        agent_id: AgentId,
        #[serde(default)]
        offsets: HashMap<TopicId, i64>,
    },
    Subscribe {
        agent_id: AgentId,
        topic: String,
    },
    Unsubscribe {
        agent_id: AgentId,
        topic: String,
    },
    ListTopics {
        agent_id: AgentId,
        #[serde(default)]
        subscribed_only: bool,
        #[serde(default)]
        with_counts: bool,
    },
    Search {
        agent_id: AgentId,
        query: String,
        #[serde(default)]
        limit: i64,
    },
    GetThread {
        thread_id: String,
    },
}

const KNOWN_OPS: &[&str] = &[
    "send",
    "publish",
    "fetch_inbox",
    "read_message",
    "update_state",
    "ack_message",
    "get_status",
    "poll_changes",
    "subscribe",
    "unsubscribe",
    "list_topics",
    "search",
    "get_thread",
];

/// Typed results, mirroring [`MailRequest`] variant by variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MailResponse {
    Send(SendReceipt),
    Publish(PublishReceipt),
    FetchInbox { messages: Vec<InboxMessage> },
    ReadMessage { message: Box<InboxMessage> },
    UpdateState { updated: bool },
    AckMessage { acked: bool },
    GetStatus(StatusSummary),
    PollChanges(PollResult),
    Subscribe { topic_id: TopicId },
    Unsubscribe { topic_id: TopicId },
    ListTopics { topics: Vec<TopicInfo> },
    Search { messages: Vec<InboxMessage> },
    GetThread { messages: Vec<InboxMessage> },
}

/// The always-well-formed response wrapper: either data or a typed error,
/// never an out-of-band failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<MailResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
}

impl Envelope {
    fn success(data: MailResponse) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            code: None,
        }
    }

    fn fail(err: &MailError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(err.to_string()),
            code: Some(err.code()),
        }
    }
}

fn wrap<T>(result: Result<T, MailError>, into: impl FnOnce(T) -> MailResponse) -> Envelope {
    match result {
        Ok(value) => Envelope::success(into(value)),
        Err(e) => Envelope::fail(&e),
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

impl MailService {
    /// Dispatch one tagged request into its handler.
    pub async fn receive(&self, request: MailRequest, cancel: &CancellationToken) -> Envelope {
        match request {
            MailRequest::Send(req) => wrap(self.send(req, cancel).await, MailResponse::Send),
            MailRequest::Publish(req) => {
                wrap(self.publish(req, cancel).await, MailResponse::Publish)
            }
            MailRequest::FetchInbox(params) => wrap(
                self.fetch_inbox(params, cancel).await,
                |messages| MailResponse::FetchInbox { messages },
            ),
            MailRequest::ReadMessage {
                agent_id,
                message_id,
            } => wrap(
                self.read_message(agent_id, message_id, cancel).await,
                |message| MailResponse::ReadMessage {
                    message: Box::new(message),
                },
            ),
            MailRequest::UpdateState {
                agent_id,
                message_id,
                state,
                snoozed_until,
            } => wrap(
                self.update_state(agent_id, message_id, &state, snoozed_until, cancel)
                    .await,
                |updated| MailResponse::UpdateState { updated },
            ),
            MailRequest::AckMessage {
                agent_id,
                message_id,
            } => wrap(
                self.ack_message(agent_id, message_id, cancel).await,
                |acked| MailResponse::AckMessage { acked },
            ),
            MailRequest::GetStatus { agent_id } => wrap(
                self.get_status(agent_id, cancel).await,
                MailResponse::GetStatus,
            ),
            MailRequest::PollChanges { agent_id, offsets } => wrap(
                self.poll_changes(agent_id, offsets, cancel).await,
                MailResponse::PollChanges,
            ),
            MailRequest::Subscribe { agent_id, topic } => wrap(
                self.subscribe(agent_id, &topic, cancel).await,
                |topic_id| MailResponse::Subscribe { topic_id },
            ),
            MailRequest::Unsubscribe { agent_id, topic } => wrap(
                self.unsubscribe(agent_id, &topic, cancel).await,
                |topic_id| MailResponse::Unsubscribe { topic_id },
            ),
            MailRequest::ListTopics {
                agent_id,
                subscribed_only,
                with_counts,
            } => wrap(
                self.list_topics(agent_id, subscribed_only, with_counts, cancel)
                    .await,
                |topics| MailResponse::ListTopics { topics },
            ),
            MailRequest::Search {
                agent_id,
                query,
                limit,
            } => wrap(
                self.search(agent_id, &query, limit, cancel).await,
                |messages| MailResponse::Search { messages },
            ),
            MailRequest::GetThread { thread_id } => wrap(
                self.get_thread(&thread_id, cancel).await,
                |messages| MailResponse::GetThread { messages },
            ),
        }
    }

    /// Dispatch a raw JSON message. A missing or unrecognized `op` tag is
    /// an unknown-message-type error; a known tag with malformed fields is
    /// an invalid argument.
    pub async fn receive_value(
        &self,
        value: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Envelope {
        let tag = value
            .get("op")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if !KNOWN_OPS.contains(&tag.as_str()) {
            return Envelope::fail(&MailError::UnknownMessageType(if tag.is_empty() {
                "<missing op>".into()
            } else {
                tag
            }));
        }

        match serde_json::from_value::<MailRequest>(value) {
            Ok(request) => self.receive(request, cancel).await,
            Err(e) => Envelope::fail(&MailError::InvalidArgument(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_round_trip_as_tagged_json() {
        let req = MailRequest::Send(SendRequest {
            sender_id: 1,
            to: vec!["alice".into()],
            topic: None,
            subject: "hi".into(),
            body: "there".into(),
            priority: Priority::Urgent,
            deadline_at: None,
            thread_id: None,
            attachments: None,
            idempotency_key: Some("k".into()),
        });

        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["op"], "send");
        assert_eq!(json["priority"], "urgent");

        let back: MailRequest = serde_json::from_value(json).unwrap();
        match back {
            MailRequest::Send(r) => assert_eq!(r.to, vec!["alice".to_string()]),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn every_request_tag_is_listed() {
        // Keep the dispatch allowlist in sync with the enum.
        let samples = [
            serde_json::json!({"op": "get_status", "agent_id": 1}),
            serde_json::json!({"op": "ack_message", "agent_id": 1, "message_id": 2}),
            serde_json::json!({"op": "poll_changes", "agent_id": 1}),
            serde_json::json!({"op": "list_topics", "agent_id": 1}),
            serde_json::json!({"op": "get_thread", "thread_id": "t"}),
        ];
        for sample in samples {
            let tag = sample["op"].as_str().unwrap();
            assert!(KNOWN_OPS.contains(&tag), "missing tag {tag}");
            serde_json::from_value::<MailRequest>(sample).unwrap();
        }
    }

    #[tokio::test]
    async fn unknown_tag_yields_unknown_message_type() {
        let service = MailService::open_memory().await.unwrap();
        let cancel = CancellationToken::new();

        let envelope = service
            .receive_value(serde_json::json!({"op": "reticulate"}), &cancel)
            .await;
        assert!(!envelope.ok);
        assert_eq!(envelope.code, Some(ErrorCode::UnknownMessageType));
        assert!(envelope.error.unwrap().contains("reticulate"));

        let envelope = service
            .receive_value(serde_json::json!({"hello": "world"}), &cancel)
            .await;
        assert_eq!(envelope.code, Some(ErrorCode::UnknownMessageType));
    }

    #[tokio::test]
    async fn known_tag_with_bad_fields_is_invalid_argument() {
        let service = MailService::open_memory().await.unwrap();
        let cancel = CancellationToken::new();

        let envelope = service
            .receive_value(
                serde_json::json!({"op": "get_status", "agent_id": "not-a-number"}),
                &cancel,
            )
            .await;
        assert!(!envelope.ok);
        assert_eq!(envelope.code, Some(ErrorCode::InvalidArgument));
    }

    #[tokio::test]
    async fn dispatch_and_direct_calls_share_handlers() {
        let service = MailService::open_memory().await.unwrap();
        let cancel = CancellationToken::new();
        let sender = service
            .store()
            .create_agent("sender", None, None)
            .await
            .unwrap();
        service
            .store()
            .create_agent("recipient", None, None)
            .await
            .unwrap();

        let envelope = service
            .receive_value(
                serde_json::json!({
                    "op": "send",
                    "sender_id": sender.id,
                    "to": ["recipient"],
                    "subject": "hello",
                    "body": "via the envelope",
                }),
                &cancel,
            )
            .await;
        assert!(envelope.ok, "send failed: {:?}", envelope.error);
        let message_id = match envelope.data {
            Some(MailResponse::Send(receipt)) => receipt.message_id,
            other => panic!("wrong response: {other:?}"),
        };

        // The directly-called handler sees what the dispatched one wrote.
        let recipient = service
            .store()
            .agent_by_name("recipient")
            .await
            .unwrap()
            .unwrap();
        let inbox = service
            .fetch_inbox(
                FetchParams {
                    agent_id: recipient.id,
                    ..Default::default()
                },
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].id, message_id);
        assert_eq!(inbox[0].subject, "hello");
    }

    #[tokio::test]
    async fn envelope_is_well_formed_on_failure() {
        let service = MailService::open_memory().await.unwrap();
        let cancel = CancellationToken::new();

        let envelope = service
            .receive(MailRequest::GetStatus { agent_id: 404 }, &cancel)
            .await;
        assert!(!envelope.ok);
        assert!(envelope.data.is_none());
        assert_eq!(envelope.code, Some(ErrorCode::NotFound));
        assert!(envelope.error.unwrap().contains("404"));
    }
}
