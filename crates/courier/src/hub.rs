//! In-process notification hub.
//!
//! Fans freshly sent messages out to live subscribers. All subscription
//! mutations and notify fan-outs run one at a time on a single dispatcher
//! task draining a command queue, so the tables need no locks. Delivery is
//! best-effort and non-blocking: a subscriber whose channel is full is
//! silently skipped and must reconcile through durable polling.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::types::{AgentId, InboxMessage, TopicId};

/// A registered delivery target: an opaque subscriber id plus the bounded
/// channel messages are pushed into.
struct Subscriber {
    id: String,
    chan: mpsc::Sender<InboxMessage>,
}

enum HubCommand {
    SubscribeAgent {
        agent_id: AgentId,
        subscriber_id: String,
        chan: mpsc::Sender<InboxMessage>,
        reply: oneshot::Sender<()>,
    },
    UnsubscribeAgent {
        agent_id: AgentId,
        subscriber_id: String,
        reply: oneshot::Sender<()>,
    },
    NotifyAgent {
        agent_id: AgentId,
        message: Box<InboxMessage>,
        /// Absent for fire-and-forget notifications.
        reply: Option<oneshot::Sender<usize>>,
    },
    NotifyTopic {
        topic_id: TopicId,
        agent_ids: Vec<AgentId>,
        message: Box<InboxMessage>,
        reply: Option<oneshot::Sender<usize>>,
    },
}

// ---------------------------------------------------------------------------
// NotificationHub — cheap cloneable handle
// ---------------------------------------------------------------------------

/// Handle to the hub dispatcher. Cloning shares the same dispatcher; the
/// dispatcher exits once every handle is dropped.
#[derive(Clone)]
pub struct NotificationHub {
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl NotificationHub {
    /// Spawn the dispatcher task and return a handle to it.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(rx));
        Self { tx }
    }

    /// Register a delivery channel for an agent. Re-subscribing with a
    /// subscriber id that is already registered is a no-op success.
    pub async fn subscribe_agent(
        &self,
        agent_id: AgentId,
        subscriber_id: impl Into<String>,
        chan: mpsc::Sender<InboxMessage>,
    ) {
        let (reply, done) = oneshot::channel();
        let _ = self.tx.send(HubCommand::SubscribeAgent {
            agent_id,
            subscriber_id: subscriber_id.into(),
            chan,
            reply,
        });
        let _ = done.await;
    }

    /// Remove a subscriber. Unknown agent or subscriber ids succeed.
    pub async fn unsubscribe_agent(&self, agent_id: AgentId, subscriber_id: impl Into<String>) {
        let (reply, done) = oneshot::channel();
        let _ = self.tx.send(HubCommand::UnsubscribeAgent {
            agent_id,
            subscriber_id: subscriber_id.into(),
            reply,
        });
        let _ = done.await;
    }

    /// Deliver a message to every subscriber of an agent. Returns how many
    /// subscribers accepted it; full channels are skipped.
    pub async fn notify_agent(&self, agent_id: AgentId, message: InboxMessage) -> usize {
        let (reply, count) = oneshot::channel();
        let _ = self.tx.send(HubCommand::NotifyAgent {
            agent_id,
            message: Box::new(message),
            reply: Some(reply),
        });
        count.await.unwrap_or(0)
    }

    /// Fire-and-forget variant of [`notify_agent`](Self::notify_agent),
    /// used on the send hot path.
    pub fn tell_notify_agent(&self, agent_id: AgentId, message: InboxMessage) {
        let _ = self.tx.send(HubCommand::NotifyAgent {
            agent_id,
            message: Box::new(message),
            reply: None,
        });
    }

    /// Deliver a message to the subscribers of each listed agent. The topic
    /// id tags the fan-out; routing is by the supplied agent ids.
    pub async fn notify_topic(
        &self,
        topic_id: TopicId,
        agent_ids: Vec<AgentId>,
        message: InboxMessage,
    ) -> usize {
        let (reply, count) = oneshot::channel();
        let _ = self.tx.send(HubCommand::NotifyTopic {
            topic_id,
            agent_ids,
            message: Box::new(message),
            reply: Some(reply),
        });
        count.await.unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

async fn dispatch(mut rx: mpsc::UnboundedReceiver<HubCommand>) {
    let mut agents: HashMap<AgentId, Vec<Subscriber>> = HashMap::new();
    // Topic-keyed subscriptions. Nothing registers here yet; topic
    // notifications route by the agent ids supplied at notify time.
    let _topics: HashMap<TopicId, Vec<Subscriber>> = HashMap::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            HubCommand::SubscribeAgent {
                agent_id,
                subscriber_id,
                chan,
                reply,
            } => {
                let subs = agents.entry(agent_id).or_default();
                if !subs.iter().any(|s| s.id == subscriber_id) {
                    debug!(agent_id, subscriber_id, "hub subscriber added");
                    subs.push(Subscriber {
                        id: subscriber_id,
                        chan,
                    });
                }
                let _ = reply.send(());
            }

            HubCommand::UnsubscribeAgent {
                agent_id,
                subscriber_id,
                reply,
            } => {
                if let Some(subs) = agents.get_mut(&agent_id) {
                    subs.retain(|s| s.id != subscriber_id);
                    if subs.is_empty() {
                        agents.remove(&agent_id);
                    }
                }
                debug!(agent_id, subscriber_id, "hub subscriber removed");
                let _ = reply.send(());
            }

            HubCommand::NotifyAgent {
                agent_id,
                message,
                reply,
            } => {
                let delivered = deliver(&mut agents, agent_id, &message);
                if let Some(reply) = reply {
                    let _ = reply.send(delivered);
                }
            }

            HubCommand::NotifyTopic {
                topic_id,
                agent_ids,
                message,
                reply,
            } => {
                let mut delivered = 0;
                for agent_id in agent_ids {
                    delivered += deliver(&mut agents, agent_id, &message);
                }
                trace!(topic_id, delivered, "topic fan-out complete");
                if let Some(reply) = reply {
                    let _ = reply.send(delivered);
                }
            }
        }
    }
}

/// Push one message to every subscriber of `agent_id` without blocking.
/// Subscribers whose channel has been closed are dropped from the table.
fn deliver(
    agents: &mut HashMap<AgentId, Vec<Subscriber>>,
    agent_id: AgentId,
    message: &InboxMessage,
) -> usize {
    let Some(subs) = agents.get_mut(&agent_id) else {
        return 0;
    };

    let mut delivered = 0;
    subs.retain(|sub| match sub.chan.try_send(message.clone()) {
        Ok(()) => {
            delivered += 1;
            true
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
            trace!(agent_id, subscriber_id = sub.id, "subscriber busy, skipped");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(agent_id, subscriber_id = sub.id, "subscriber gone, pruned");
            false
        }
    });
    if subs.is_empty() {
        agents.remove(&agent_id);
    }
    delivered
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::types::Priority;

    fn sample_message(id: i64) -> InboxMessage {
        InboxMessage {
            id,
            thread_id: "t-1".into(),
            topic_id: 1,
            log_offset: id,
            sender_id: 1,
            sender_name: "sender".into(),
            sender_project_key: None,
            sender_git_branch: None,
            subject: "subject".into(),
            body: "body".into(),
            priority: Priority::Normal,
            deadline_at: None,
            attachments: None,
            created_at: Utc::now(),
            state: None,
            read_at: None,
            acked_at: None,
            snoozed_until: None,
        }
    }

    #[tokio::test]
    async fn notify_reaches_subscriber() {
        let hub = NotificationHub::spawn();
        let (tx, mut rx) = mpsc::channel(8);
        hub.subscribe_agent(1, "sub-a", tx).await;

        let delivered = hub.notify_agent(1, sample_message(10)).await;
        assert_eq!(delivered, 1);
        assert_eq!(rx.recv().await.unwrap().id, 10);
    }

    #[tokio::test]
    async fn notify_without_subscribers_delivers_zero() {
        let hub = NotificationHub::spawn();
        assert_eq!(hub.notify_agent(99, sample_message(1)).await, 0);
    }

    #[tokio::test]
    async fn resubscribe_same_id_is_noop() {
        let hub = NotificationHub::spawn();
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        hub.subscribe_agent(1, "sub-a", tx1).await;
        // Same subscriber id: the original channel stays registered.
        hub.subscribe_agent(1, "sub-a", tx2).await;

        let delivered = hub.notify_agent(1, sample_message(5)).await;
        assert_eq!(delivered, 1);
        assert_eq!(rx1.recv().await.unwrap().id, 5);
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_unknown_ids_succeed() {
        let hub = NotificationHub::spawn();
        hub.unsubscribe_agent(42, "ghost").await;
        let (tx, _rx) = mpsc::channel(8);
        hub.subscribe_agent(1, "sub-a", tx).await;
        hub.unsubscribe_agent(1, "other").await;
        // The real subscriber is still there.
        assert_eq!(hub.notify_agent(1, sample_message(1)).await, 1);
    }

    #[tokio::test]
    async fn full_channel_is_skipped_not_blocked() {
        let hub = NotificationHub::spawn();
        let (tx, mut rx) = mpsc::channel(1);
        hub.subscribe_agent(1, "slow", tx).await;

        let mut total = 0;
        for i in 0..5 {
            total += hub.notify_agent(1, sample_message(i)).await;
        }
        // Only the first send fit; the rest were skipped without blocking.
        assert_eq!(total, 1);
        assert_eq!(rx.recv().await.unwrap().id, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_subscriber_is_pruned() {
        let hub = NotificationHub::spawn();
        let (tx, rx) = mpsc::channel(1);
        hub.subscribe_agent(1, "gone", tx).await;
        drop(rx);

        assert_eq!(hub.notify_agent(1, sample_message(1)).await, 0);
        // A fresh subscriber under the same agent works fine afterwards.
        let (tx2, mut rx2) = mpsc::channel(1);
        hub.subscribe_agent(1, "alive", tx2).await;
        assert_eq!(hub.notify_agent(1, sample_message(2)).await, 1);
        assert_eq!(rx2.recv().await.unwrap().id, 2);
    }

    #[tokio::test]
    async fn topic_notify_routes_by_agent_ids() {
        let hub = NotificationHub::spawn();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        hub.subscribe_agent(1, "a", tx_a).await;
        hub.subscribe_agent(2, "b", tx_b).await;

        let delivered = hub.notify_topic(9, vec![1, 2, 3], sample_message(7)).await;
        assert_eq!(delivered, 2);
        assert_eq!(rx_a.recv().await.unwrap().id, 7);
        assert_eq!(rx_b.recv().await.unwrap().id, 7);
    }

    #[tokio::test]
    async fn tell_variant_delivers_eventually() {
        let hub = NotificationHub::spawn();
        let (tx, mut rx) = mpsc::channel(8);
        hub.subscribe_agent(1, "sub", tx).await;

        hub.tell_notify_agent(1, sample_message(3));
        assert_eq!(rx.recv().await.unwrap().id, 3);
    }
}
