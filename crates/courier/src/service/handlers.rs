//! Operation bodies for the mail service.
//!
//! Every handler takes a cancellation token from the caller; cancellation
//! inside a transaction rolls it back, cancellation during notification
//! fan-out stops further sends without failing the committed operation.
//! Failures come back as typed [`MailError`]s; handlers never panic.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::requests::{
    FetchParams, PollResult, PublishReceipt, PublishRequest, SendReceipt, SendRequest,
    StatusSummary, TopicInfo,
};
use super::MailService;
use crate::error::MailError;
use crate::lifecycle::ThreadEvent;
use crate::store::NewMessage;
use crate::types::{
    new_thread_id, Agent, AgentId, InboxMessage, Message, MessageId, MessageState, TopicId,
    TopicType, GLOBAL_AGENT_ID,
};

const DEFAULT_LIMIT: i64 = 50;

fn clamp_limit(limit: i64) -> i64 {
    if limit <= 0 {
        DEFAULT_LIMIT
    } else {
        limit
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), MailError> {
    if cancel.is_cancelled() {
        Err(MailError::Cancelled)
    } else {
        Ok(())
    }
}

impl MailService {
    // -- send ----------------------------------------------------------------

    /// Deliver a message to one or more named recipients, or to a topic
    /// when no recipients are given. Runs in a single write transaction;
    /// subscribers are notified only after commit.
    pub async fn send(
        &self,
        req: SendRequest,
        cancel: &CancellationToken,
    ) -> Result<SendReceipt, MailError> {
        check_cancelled(cancel)?;
        let mut tx = self.store().begin().await?;

        // A replayed idempotency key returns the original message and has
        // no further side effects.
        if let Some(key) = req.idempotency_key.as_deref() {
            if let Some(original) = tx.message_by_idempotency_key(key).await? {
                debug!(key, message_id = original.id, "idempotent send replayed");
                return Ok(SendReceipt {
                    message_id: original.id,
                    thread_id: original.thread_id,
                });
            }
        }

        let sender = tx
            .get_agent(req.sender_id)
            .await?
            .ok_or_else(|| MailError::AgentNotFound(req.sender_id.to_string()))?;

        let mut recipients = Vec::with_capacity(req.to.len());
        for name in &req.to {
            let agent = tx
                .agent_by_name(name)
                .await?
                .ok_or_else(|| MailError::RecipientNotFound(name.clone()))?;
            recipients.push(agent);
        }

        let topic = if let Some(first) = recipients.first() {
            tx.get_or_create_agent_inbox(first).await?
        } else if let Some(name) = req.topic.as_deref() {
            tx.topic_by_name(name)
                .await?
                .ok_or_else(|| MailError::TopicNotFound(name.to_string()))?
        } else {
            return Err(MailError::InvalidArgument(
                "no recipients or topic specified".into(),
            ));
        };

        let thread_id = req
            .thread_id
            .filter(|t| !t.is_empty())
            .unwrap_or_else(new_thread_id);

        let log_offset = tx.next_log_offset(topic.id).await?;
        let message = tx
            .create_message(NewMessage {
                thread_id,
                topic_id: topic.id,
                log_offset,
                sender_id: sender.id,
                subject: req.subject,
                body: req.body,
                priority: req.priority,
                deadline_at: req.deadline_at,
                attachments: req.attachments,
                idempotency_key: req.idempotency_key,
            })
            .await?;

        for recipient in &recipients {
            tx.create_recipient(message.id, recipient.id).await?;
        }

        check_cancelled(cancel)?;
        tx.commit().await?;

        info!(
            message_id = message.id,
            thread_id = %message.thread_id,
            sender = %sender.name,
            recipients = recipients.len(),
            "message sent"
        );

        let snapshot = unread_snapshot(&message, &sender);
        let recipient_ids: Vec<AgentId> = recipients.iter().map(|a| a.id).collect();
        self.fan_out(&snapshot, &recipient_ids, cancel);

        Ok(SendReceipt {
            message_id: message.id,
            thread_id: message.thread_id,
        })
    }

    /// Broadcast to every current subscriber of a topic.
    pub async fn publish(
        &self,
        req: PublishRequest,
        cancel: &CancellationToken,
    ) -> Result<PublishReceipt, MailError> {
        check_cancelled(cancel)?;
        let mut tx = self.store().begin().await?;

        let sender = tx
            .get_agent(req.sender_id)
            .await?
            .ok_or_else(|| MailError::AgentNotFound(req.sender_id.to_string()))?;
        let topic = tx
            .topic_by_name(&req.topic)
            .await?
            .ok_or_else(|| MailError::TopicNotFound(req.topic.clone()))?;

        let subscribers = tx.subscribers_of_topic(topic.id).await?;

        let log_offset = tx.next_log_offset(topic.id).await?;
        let message = tx
            .create_message(NewMessage {
                thread_id: new_thread_id(),
                topic_id: topic.id,
                log_offset,
                sender_id: sender.id,
                subject: req.subject,
                body: req.body,
                priority: req.priority,
                deadline_at: None,
                attachments: None,
                idempotency_key: None,
            })
            .await?;

        for agent_id in &subscribers {
            tx.create_recipient(message.id, *agent_id).await?;
        }

        check_cancelled(cancel)?;
        tx.commit().await?;

        info!(
            message_id = message.id,
            topic = %topic.name,
            subscribers = subscribers.len(),
            "message published"
        );

        let snapshot = unread_snapshot(&message, &sender);
        self.fan_out(&snapshot, &subscribers, cancel);

        Ok(PublishReceipt {
            message_id: message.id,
            recipients: subscribers.len() as i64,
        })
    }

    /// Best-effort hub notification for each recipient, plus exactly one
    /// for the global-viewer wildcard.
    fn fan_out(&self, snapshot: &InboxMessage, recipients: &[AgentId], cancel: &CancellationToken) {
        for agent_id in recipients {
            if cancel.is_cancelled() {
                return;
            }
            self.hub().tell_notify_agent(*agent_id, snapshot.clone());
        }
        if !cancel.is_cancelled() {
            self.hub()
                .tell_notify_agent(GLOBAL_AGENT_ID, snapshot.clone());
        }
    }

    // -- inbox reads ---------------------------------------------------------

    /// One query variant out of a small matrix: sender-prefix, sent-only,
    /// unread-only, one explicit state, or the plain inbox, each either
    /// agent-scoped or global (`agent_id == 0`).
    pub async fn fetch_inbox(
        &self,
        params: FetchParams,
        cancel: &CancellationToken,
    ) -> Result<Vec<InboxMessage>, MailError> {
        check_cancelled(cancel)?;
        let limit = clamp_limit(params.limit);
        let store = self.store();

        let messages = if params.agent_id == GLOBAL_AGENT_ID {
            if params.sent_only {
                store.list_sent_global(limit).await?
            } else {
                store.list_inbox_global(limit).await?
            }
        } else if let Some(prefix) = params.sender_prefix.as_deref() {
            store
                .list_by_sender_prefix(params.agent_id, prefix, limit)
                .await?
        } else if params.sent_only {
            store.list_sent(params.agent_id, limit).await?
        } else if params.unread_only {
            store.list_unread(params.agent_id, limit).await?
        } else if let Some(state) = params.state {
            store.list_by_state(params.agent_id, state, limit).await?
        } else {
            store.list_inbox(params.agent_id, limit).await?
        };

        Ok(messages)
    }

    /// Load one message for one recipient and mark it read if it was
    /// still unread. Load and transition happen in the same transaction.
    pub async fn read_message(
        &self,
        agent_id: AgentId,
        message_id: MessageId,
        cancel: &CancellationToken,
    ) -> Result<InboxMessage, MailError> {
        check_cancelled(cancel)?;
        let mut tx = self.store().begin().await?;

        let Some(message) = tx.inbox_message(agent_id, message_id).await? else {
            return if tx.get_message(message_id).await?.is_some() {
                Err(MailError::NotARecipient {
                    agent_id,
                    message_id,
                })
            } else {
                Err(MailError::MessageNotFound(message_id))
            };
        };

        if message.state != Some(MessageState::Unread) {
            // Already read (or beyond): nothing to transition, no
            // further notifications.
            return Ok(message);
        }

        let transition = self
            .transition_in_tx(&mut tx, agent_id, message_id, &ThreadEvent::Read)
            .await?;
        check_cancelled(cancel)?;
        tx.commit().await?;

        if let Some(transition) = transition {
            self.post_commit(&transition.outbox).await;
        }

        self.store()
            .inbox_message(agent_id, message_id)
            .await?
            .ok_or(MailError::MessageNotFound(message_id))
    }

    // -- state changes -------------------------------------------------------

    /// Move a recipient row toward a target state. `snoozed` requires a
    /// future `snoozed_until`. Mutating a row that does not exist is a
    /// silent success.
    pub async fn update_state(
        &self,
        agent_id: AgentId,
        message_id: MessageId,
        target: &str,
        snoozed_until: Option<chrono::DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> Result<bool, MailError> {
        check_cancelled(cancel)?;

        let target = MessageState::parse(target)
            .ok_or_else(|| MailError::InvalidArgument(format!("unknown state: {target}")))?;

        if target == MessageState::Snoozed {
            match snoozed_until {
                None => {
                    return Err(MailError::InvalidArgument(
                        "snoozed_until is required when snoozing".into(),
                    ))
                }
                Some(until) if until <= Utc::now() => {
                    return Err(MailError::InvalidArgument(
                        "snoozed_until must be in the future".into(),
                    ))
                }
                Some(_) => {}
            }
        }

        let mut tx = self.store().begin().await?;
        let Some(row) = tx.get_recipient(message_id, agent_id).await? else {
            return Ok(true);
        };

        // Re-snoozing reschedules; any other same-state update is a no-op.
        if row.state == target && target != MessageState::Snoozed {
            return Ok(true);
        }

        let event = event_for_target(row.state, target, snoozed_until);
        let transition = self
            .transition_in_tx(&mut tx, agent_id, message_id, &event)
            .await?;
        check_cancelled(cancel)?;
        tx.commit().await?;

        if let Some(transition) = transition {
            self.post_commit(&transition.outbox).await;
        }
        Ok(true)
    }

    /// Acknowledge a message. Rows in states with no acknowledge
    /// transition just get their `acked_at` stamped.
    pub async fn ack_message(
        &self,
        agent_id: AgentId,
        message_id: MessageId,
        cancel: &CancellationToken,
    ) -> Result<bool, MailError> {
        check_cancelled(cancel)?;
        let mut tx = self.store().begin().await?;

        let Some(row) = tx.get_recipient(message_id, agent_id).await? else {
            return Ok(true);
        };

        match row.state {
            MessageState::Unread | MessageState::Read | MessageState::Starred => {
                let transition = self
                    .transition_in_tx(&mut tx, agent_id, message_id, &ThreadEvent::Ack)
                    .await?;
                check_cancelled(cancel)?;
                tx.commit().await?;
                if let Some(transition) = transition {
                    self.post_commit(&transition.outbox).await;
                }
            }
            _ => {
                tx.ack_recipient(message_id, agent_id, Utc::now()).await?;
                check_cancelled(cancel)?;
                tx.commit().await?;
            }
        }
        Ok(true)
    }

    // -- status and polling --------------------------------------------------

    pub async fn get_status(
        &self,
        agent_id: AgentId,
        cancel: &CancellationToken,
    ) -> Result<StatusSummary, MailError> {
        check_cancelled(cancel)?;
        let agent = self
            .store()
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| MailError::AgentNotFound(agent_id.to_string()))?;

        Ok(StatusSummary {
            agent_name: agent.name,
            unread_count: self.store().count_unread(agent_id).await?,
            urgent_count: self.store().count_unread_urgent(agent_id).await?,
        })
    }

    /// Unread direct messages plus anything new on subscribed topics past
    /// the caller's offsets. A message reachable both ways appears once;
    /// the returned offsets always reflect the highest offset observed.
    pub async fn poll_changes(
        &self,
        agent_id: AgentId,
        offsets: HashMap<TopicId, i64>,
        cancel: &CancellationToken,
    ) -> Result<PollResult, MailError> {
        check_cancelled(cancel)?;
        let store = self.store();

        let mut messages = store.list_unread(agent_id, i64::MAX).await?;
        let mut seen: HashSet<MessageId> = messages.iter().map(|m| m.id).collect();
        let mut new_offsets = offsets.clone();

        for topic_id in store.subscriptions_by_agent(agent_id).await? {
            check_cancelled(cancel)?;
            let last = offsets.get(&topic_id).copied().unwrap_or(0);
            for message in store.messages_since_offset(topic_id, last, agent_id).await? {
                let entry = new_offsets.entry(topic_id).or_insert(last);
                *entry = (*entry).max(message.log_offset);
                if seen.insert(message.id) {
                    messages.push(message);
                }
            }
        }

        Ok(PollResult {
            messages,
            new_offsets,
        })
    }

    // -- topics --------------------------------------------------------------

    /// Subscribe an agent to a topic, creating the topic as a broadcast
    /// channel when it does not exist yet. Idempotent.
    pub async fn subscribe(
        &self,
        agent_id: AgentId,
        topic_name: &str,
        cancel: &CancellationToken,
    ) -> Result<TopicId, MailError> {
        check_cancelled(cancel)?;
        let topic = self
            .store()
            .get_or_create_topic(topic_name, TopicType::Broadcast)
            .await?;
        self.store().subscribe(agent_id, topic.id).await?;
        debug!(agent_id, topic = topic_name, "subscribed");
        Ok(topic.id)
    }

    /// Remove a subscription. Removing a membership that does not exist
    /// succeeds; an unknown topic is an error.
    pub async fn unsubscribe(
        &self,
        agent_id: AgentId,
        topic_name: &str,
        cancel: &CancellationToken,
    ) -> Result<TopicId, MailError> {
        check_cancelled(cancel)?;
        let topic = self
            .store()
            .topic_by_name(topic_name)
            .await?
            .ok_or_else(|| MailError::TopicNotFound(topic_name.to_string()))?;
        self.store().unsubscribe(agent_id, topic.id).await?;
        debug!(agent_id, topic = topic_name, "unsubscribed");
        Ok(topic.id)
    }

    pub async fn list_topics(
        &self,
        agent_id: AgentId,
        subscribed_only: bool,
        with_counts: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<TopicInfo>, MailError> {
        check_cancelled(cancel)?;
        let store = self.store();

        let subscribed: HashSet<TopicId> = store
            .subscriptions_by_agent(agent_id)
            .await?
            .into_iter()
            .collect();
        let counts: HashMap<TopicId, i64> = if with_counts {
            store.topic_message_counts().await?.into_iter().collect()
        } else {
            HashMap::new()
        };

        Ok(store
            .list_topics()
            .await?
            .into_iter()
            .filter(|t| !subscribed_only || subscribed.contains(&t.id))
            .map(|topic| TopicInfo {
                subscribed: subscribed.contains(&topic.id),
                message_count: with_counts.then(|| counts.get(&topic.id).copied().unwrap_or(0)),
                topic,
            })
            .collect())
    }

    // -- search and threads --------------------------------------------------

    pub async fn search(
        &self,
        agent_id: AgentId,
        query: &str,
        limit: i64,
        cancel: &CancellationToken,
    ) -> Result<Vec<InboxMessage>, MailError> {
        check_cancelled(cancel)?;
        let limit = clamp_limit(limit);
        let messages = if agent_id == GLOBAL_AGENT_ID {
            self.store().search_global(query, limit).await?
        } else {
            self.store().search_inbox(agent_id, query, limit).await?
        };
        Ok(messages)
    }

    /// All messages of a thread enriched with sender identity. Thread
    /// views carry no per-recipient read flags.
    pub async fn get_thread(
        &self,
        thread_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<InboxMessage>, MailError> {
        check_cancelled(cancel)?;
        Ok(self.store().messages_by_thread_with_sender(thread_id).await?)
    }
}

/// Select the lifecycle event that moves `current` toward `target`.
/// Impossible combinations fall through to the machine, which rejects them
/// as unexpected events.
fn event_for_target(
    current: MessageState,
    target: MessageState,
    snoozed_until: Option<chrono::DateTime<Utc>>,
) -> ThreadEvent {
    match target {
        MessageState::Unread => match current {
            MessageState::Snoozed => ThreadEvent::Wake,
            MessageState::Trash => ThreadEvent::Restore,
            _ => ThreadEvent::Wake,
        },
        MessageState::Read => match current {
            MessageState::Starred => ThreadEvent::Unstar,
            MessageState::Archived => ThreadEvent::Unarchive,
            _ => ThreadEvent::Read,
        },
        MessageState::Starred => ThreadEvent::Star,
        MessageState::Snoozed => ThreadEvent::Snooze {
            // Validated by the caller before we get here.
            until: snoozed_until.unwrap_or_else(Utc::now),
        },
        MessageState::Archived => ThreadEvent::Archive,
        MessageState::Trash => ThreadEvent::Trash,
    }
}

/// The hub snapshot of a freshly inserted message: every recipient sees it
/// as unread.
fn unread_snapshot(message: &Message, sender: &Agent) -> InboxMessage {
    InboxMessage {
        id: message.id,
        thread_id: message.thread_id.clone(),
        topic_id: message.topic_id,
        log_offset: message.log_offset,
        sender_id: sender.id,
        sender_name: sender.name.clone(),
        sender_project_key: sender.project_key.clone(),
        sender_git_branch: sender.git_branch.clone(),
        subject: message.subject.clone(),
        body: message.body.clone(),
        priority: message.priority,
        deadline_at: message.deadline_at,
        attachments: message.attachments.clone(),
        created_at: message.created_at,
        state: Some(MessageState::Unread),
        read_at: None,
        acked_at: None,
        snoozed_until: None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
