//! The mail service.
//!
//! Validates, persists, and dispatches messages, and drives the
//! per-recipient lifecycle machines. Handlers live in [`handlers`]; the
//! tagged request/response protocol in [`requests`]; the inbox
//! subscription poller in [`stream`]. This module owns construction, the
//! timer registry for wakes and purges, and restart recovery.

mod handlers;
mod requests;
mod stream;

pub use requests::{
    Envelope, FetchParams, MailRequest, MailResponse, PollResult, PublishReceipt, PublishRequest,
    SendReceipt, SendRequest, StatusSummary, TopicInfo,
};
pub use stream::InboxSubscription;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::config::MailConfig;
use crate::error::MailError;
use crate::hub::NotificationHub;
use crate::lifecycle::{OutboxEvent, ThreadEvent, ThreadLifecycle, Transition};
use crate::store::{MailStore, MailTx, RecipientStateUpdate};
use crate::types::{AgentId, MessageId, MessageState};

/// The request-serving core. Cheap to clone; all clones share one store,
/// one hub, and one timer registry.
#[derive(Clone)]
pub struct MailService {
    inner: Arc<Inner>,
}

struct Inner {
    store: MailStore,
    hub: NotificationHub,
    config: MailConfig,
    timers: TimerRegistry,
}

impl MailService {
    /// Open the durable store, spawn the hub, and rebuild pending timers.
    pub async fn open(config: MailConfig) -> Result<Self, MailError> {
        let config = config.normalize();
        let store = MailStore::open(&config.store).await?;
        let service = Self::with_store(store, config);
        service.resume_threads().await?;
        Ok(service)
    }

    /// An in-memory service (useful for tests).
    pub async fn open_memory() -> Result<Self, MailError> {
        let store = MailStore::open_memory().await?;
        Ok(Self::with_store(store, MailConfig::default()))
    }

    /// Wire a service around an already-open store.
    pub fn with_store(store: MailStore, config: MailConfig) -> Self {
        let config = config.normalize();
        Self {
            inner: Arc::new(Inner {
                store,
                hub: NotificationHub::spawn(),
                config,
                timers: TimerRegistry::default(),
            }),
        }
    }

    pub fn store(&self) -> &MailStore {
        &self.inner.store
    }

    pub fn hub(&self) -> &NotificationHub {
        &self.inner.hub
    }

    pub fn config(&self) -> &MailConfig {
        &self.inner.config
    }

    // -- lifecycle driving ---------------------------------------------------

    /// Load a recipient row, apply one lifecycle event, and persist the
    /// result, all inside `tx`. The caller commits, then runs
    /// [`post_commit`](Self::post_commit) with the returned outbox.
    ///
    /// Returns `Ok(None)` when the recipient row does not exist: mutating a
    /// missing row is a silent success, per the storage contract that zero
    /// affected rows is not an error.
    pub(crate) async fn transition_in_tx(
        &self,
        tx: &mut MailTx,
        agent_id: AgentId,
        message_id: MessageId,
        event: &ThreadEvent,
    ) -> Result<Option<Transition>, MailError> {
        let Some(row) = tx.get_recipient(message_id, agent_id).await? else {
            return Ok(None);
        };
        let Some(message) = tx.get_message(message_id).await? else {
            return Err(MailError::MessageNotFound(message_id));
        };

        let machine = ThreadLifecycle::from_recipient(&row, message.thread_id);
        let transition = machine
            .apply(event, Utc::now(), self.inner.config.trash_retention)
            .map_err(|e| MailError::InvalidArgument(e.to_string()))?;

        for event in &transition.outbox {
            if let OutboxEvent::PersistStateChange {
                new_state,
                read_at,
                acked_at,
                snoozed_until,
                purge_at,
                was_read,
                was_starred,
                ..
            } = event
            {
                tx.update_recipient_state(
                    message_id,
                    agent_id,
                    &RecipientStateUpdate {
                        state: *new_state,
                        snoozed_until: *snoozed_until,
                        read_at: *read_at,
                        acked_at: *acked_at,
                        purge_at: *purge_at,
                        was_read: *was_read,
                        was_starred: *was_starred,
                    },
                )
                .await?;
            }
        }

        Ok(Some(transition))
    }

    /// One-shot wrapper: own transaction, commit, post-commit effects.
    pub(crate) async fn apply_event(
        &self,
        agent_id: AgentId,
        message_id: MessageId,
        event: &ThreadEvent,
    ) -> Result<Option<MessageState>, MailError> {
        let mut tx = self.inner.store.begin().await?;
        let Some(transition) = self
            .transition_in_tx(&mut tx, agent_id, message_id, event)
            .await?
        else {
            return Ok(None);
        };
        tx.commit().await?;
        self.post_commit(&transition.outbox).await;
        Ok(Some(transition.next.wire()))
    }

    /// Run the non-persistence outbox events of a committed transition:
    /// timer scheduling and cancellation, then the state-change
    /// notification.
    pub(crate) async fn post_commit(&self, outbox: &[OutboxEvent]) {
        for event in outbox {
            match event {
                OutboxEvent::PersistStateChange { .. } => {}

                OutboxEvent::CancelScheduledWake {
                    agent_id,
                    message_id,
                } => self.inner.timers.cancel((*agent_id, *message_id)),

                OutboxEvent::ScheduleWake {
                    agent_id,
                    message_id,
                    wake_at,
                } => self.schedule_wake(*agent_id, *message_id, *wake_at),

                OutboxEvent::SchedulePurge {
                    agent_id,
                    message_id,
                    purge_at,
                } => self.schedule_purge(*agent_id, *message_id, *purge_at),

                OutboxEvent::NotifyStateChange {
                    agent_id,
                    message_id,
                    old_state,
                    new_state,
                    ..
                } => {
                    debug!(
                        agent_id,
                        message_id,
                        old = %old_state,
                        new = %new_state,
                        "recipient state changed"
                    );
                    match self.inner.store.inbox_message(*agent_id, *message_id).await {
                        Ok(Some(snapshot)) => {
                            self.inner.hub.tell_notify_agent(*agent_id, snapshot);
                        }
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "state-change notification skipped"),
                    }
                }
            }
        }
    }

    // -- timers --------------------------------------------------------------

    fn schedule_wake(&self, agent_id: AgentId, message_id: MessageId, wake_at: DateTime<Utc>) {
        let service = self.clone();
        let handle = tokio::spawn(async move {
            sleep_until(wake_at).await;
            service.inner.timers.forget((agent_id, message_id));
            match service
                .apply_event(agent_id, message_id, &ThreadEvent::Wake)
                .await
            {
                Ok(Some(_)) => info!(agent_id, message_id, "snoozed message woke up"),
                Ok(None) => {}
                // The row moved on while we slept; nothing to wake.
                Err(e) => debug!(agent_id, message_id, error = %e, "wake skipped"),
            }
        });
        self.inner
            .timers
            .register((agent_id, message_id), handle.abort_handle());
    }

    fn schedule_purge(&self, agent_id: AgentId, message_id: MessageId, purge_at: DateTime<Utc>) {
        let service = self.clone();
        let handle = tokio::spawn(async move {
            sleep_until(purge_at).await;
            service.inner.timers.forget((agent_id, message_id));
            if let Err(e) = service.purge_recipient(agent_id, message_id).await {
                warn!(agent_id, message_id, error = %e, "purge failed");
            }
        });
        self.inner
            .timers
            .register((agent_id, message_id), handle.abort_handle());
    }

    /// Permanently delete one trashed recipient row; the message row goes
    /// with it once its last recipient is gone.
    pub(crate) async fn purge_recipient(
        &self,
        agent_id: AgentId,
        message_id: MessageId,
    ) -> Result<(), MailError> {
        let mut tx = self.inner.store.begin().await?;
        let deleted = tx.delete_recipient(message_id, agent_id).await?;
        let mut message_gone = false;
        if deleted && tx.count_recipients(message_id).await? == 0 {
            message_gone = tx.delete_message(message_id).await?;
        }
        tx.commit().await?;
        if deleted {
            info!(agent_id, message_id, message_gone, "trashed message purged");
        }
        Ok(())
    }

    /// Rebuild pending wake and purge timers from durable state. This is
    /// the sole mechanism by which timers survive a restart.
    pub async fn resume_threads(&self) -> Result<usize, MailError> {
        let rows = self.inner.store.recipients_with_pending_timers().await?;
        let now = Utc::now();
        let mut rebuilt = 0;

        for (row, thread_id) in rows {
            let machine = ThreadLifecycle::from_recipient(&row, thread_id);
            match machine.apply(
                &ThreadEvent::Resume,
                now,
                self.inner.config.trash_retention,
            ) {
                Ok(transition) => {
                    rebuilt += transition.outbox.len();
                    self.post_commit(&transition.outbox).await;
                }
                Err(e) => debug!(
                    agent_id = row.agent_id,
                    message_id = row.message_id,
                    error = %e,
                    "resume skipped"
                ),
            }
        }

        if rebuilt > 0 {
            info!(rebuilt, "pending timers rebuilt from durable state");
        }
        Ok(rebuilt)
    }

    /// Whether a wake or purge timer is currently pending for a row.
    pub fn has_pending_timer(&self, agent_id: AgentId, message_id: MessageId) -> bool {
        self.inner.timers.contains((agent_id, message_id))
    }
}

/// Sleep until a wall-clock instant; past instants return immediately.
async fn sleep_until(at: DateTime<Utc>) {
    let delay = (at - Utc::now()).to_std().unwrap_or_default();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

// ---------------------------------------------------------------------------
// TimerRegistry
// ---------------------------------------------------------------------------

/// Abortable timer tasks keyed by `(agent, message)`. Registering over an
/// existing key aborts the previous task, so a re-schedule can never leave
/// two timers racing for the same row.
#[derive(Default)]
struct TimerRegistry {
    timers: Mutex<HashMap<(AgentId, MessageId), AbortHandle>>,
}

impl TimerRegistry {
    fn register(&self, key: (AgentId, MessageId), handle: AbortHandle) {
        let mut timers = self.timers.lock().unwrap();
        if let Some(previous) = timers.insert(key, handle) {
            previous.abort();
        }
    }

    fn cancel(&self, key: (AgentId, MessageId)) {
        let mut timers = self.timers.lock().unwrap();
        if let Some(handle) = timers.remove(&key) {
            handle.abort();
        }
    }

    /// Drop the registration without aborting — used by a timer task that
    /// has just fired.
    fn forget(&self, key: (AgentId, MessageId)) {
        self.timers.lock().unwrap().remove(&key);
    }

    fn contains(&self, key: (AgentId, MessageId)) -> bool {
        self.timers.lock().unwrap().contains_key(&key)
    }
}
