//! Inbox subscriptions: a polled stream of fresh inbox messages.
//!
//! Each subscription runs its own poller task at the configured cadence
//! (about one second). The poller watermarks on the highest message id it
//! has emitted, so a message is emitted at most once per subscription.
//! Emission never blocks: when the consumer's buffer is full the message
//! is skipped, not queued. Durable polling is the catch-up path.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::MailService;
use crate::error::MailError;
use crate::types::{AgentId, InboxMessage, MessageId};

/// A live inbox subscription: a finite sequence of messages plus the
/// handle that ends it. Dropping the subscription cancels the poller.
pub struct InboxSubscription {
    rx: mpsc::Receiver<InboxMessage>,
    cancel: CancellationToken,
}

impl InboxSubscription {
    /// Next message, or `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<InboxMessage> {
        self.rx.recv().await
    }

    /// The cancellation handle. Invoking it stops the poller
    /// deterministically; `recv` then drains whatever was already
    /// buffered and returns `None`.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for InboxSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl MailService {
    /// Start streaming an agent's inbox. Only messages that arrive after
    /// the subscription starts are emitted.
    pub async fn subscribe_inbox(
        &self,
        agent_id: AgentId,
    ) -> Result<InboxSubscription, MailError> {
        let watermark = self.store().max_message_id().await?;
        let (tx, rx) = mpsc::channel(self.config().subscription_buffer);
        let cancel = CancellationToken::new();

        tokio::spawn(poll_inbox(
            self.clone(),
            agent_id,
            watermark,
            tx,
            cancel.clone(),
        ));

        Ok(InboxSubscription { rx, cancel })
    }
}

async fn poll_inbox(
    service: MailService,
    agent_id: AgentId,
    mut watermark: MessageId,
    tx: mpsc::Sender<InboxMessage>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(service.config().poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let batch = match service.store().inbox_messages_after(agent_id, watermark).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(agent_id, error = %e, "inbox poll failed");
                continue;
            }
        };

        for message in batch {
            // The watermark advances even when the consumer is busy: a
            // skipped message is dropped, never queued.
            watermark = watermark.max(message.id);
            match tx.try_send(message) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(m)) => {
                    debug!(agent_id, message_id = m.id, "consumer busy, message skipped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        }
    }

    debug!(agent_id, "inbox subscription ended");
}
