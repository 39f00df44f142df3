//! Per-recipient message lifecycle.
//!
//! Each `(message, recipient)` pair moves through a small state machine:
//! `unread` → `read`/`starred`/`snoozed`/`archived` → `trash` (terminal).
//! Transitions are pure value-level computations: the machine is rebuilt
//! from the stored recipient row, handed one event, and returns the next
//! state plus an ordered outbox of side-effect descriptors. The mail
//! service applies the outbox (persist, timers, notifications); the machine
//! itself touches nothing.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::types::{AgentId, MessageId, MessageRecipient, MessageState};

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// Lifecycle state of one recipient row, carrying the side data needed to
/// re-emit pending timers after a restart.
#[derive(Debug, Clone, PartialEq)]
pub enum ThreadState {
    Unread,
    Read {
        read_at: Option<DateTime<Utc>>,
        acked_at: Option<DateTime<Utc>>,
    },
    Starred {
        read_at: Option<DateTime<Utc>>,
        acked_at: Option<DateTime<Utc>>,
    },
    Snoozed {
        snoozed_until: DateTime<Utc>,
        read_at: Option<DateTime<Utc>>,
        acked_at: Option<DateTime<Utc>>,
        was_read: bool,
    },
    Archived {
        read_at: Option<DateTime<Utc>>,
        acked_at: Option<DateTime<Utc>>,
        was_starred: bool,
    },
    /// Terminal. The row is permanently deleted once `purge_at` elapses.
    Trash { purge_at: DateTime<Utc> },
}

impl ThreadState {
    /// The wire-level state name this lifecycle state persists as.
    pub fn wire(&self) -> MessageState {
        match self {
            ThreadState::Unread => MessageState::Unread,
            ThreadState::Read { .. } => MessageState::Read,
            ThreadState::Starred { .. } => MessageState::Starred,
            ThreadState::Snoozed { .. } => MessageState::Snoozed,
            ThreadState::Archived { .. } => MessageState::Archived,
            ThreadState::Trash { .. } => MessageState::Trash,
        }
    }

    fn name(&self) -> &'static str {
        self.wire().as_str()
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ThreadEvent {
    Read,
    Star,
    Unstar,
    Snooze { until: DateTime<Utc> },
    Wake,
    Archive,
    Unarchive,
    Trash,
    Restore,
    Ack,
    /// Emitted by the host after a restart to rebuild pending timers.
    /// Never changes state.
    Resume,
}

impl ThreadEvent {
    fn name(&self) -> &'static str {
        match self {
            ThreadEvent::Read => "read",
            ThreadEvent::Star => "star",
            ThreadEvent::Unstar => "unstar",
            ThreadEvent::Snooze { .. } => "snooze",
            ThreadEvent::Wake => "wake",
            ThreadEvent::Archive => "archive",
            ThreadEvent::Unarchive => "unarchive",
            ThreadEvent::Trash => "trash",
            ThreadEvent::Restore => "restore",
            ThreadEvent::Ack => "ack",
            ThreadEvent::Resume => "resume",
        }
    }
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

/// A side-effect descriptor produced by a transition. Ordered: persistence
/// first, then timer cancellation before any re-schedule, then the
/// notification (only when the state name actually changed).
#[derive(Debug, Clone, PartialEq)]
pub enum OutboxEvent {
    PersistStateChange {
        agent_id: AgentId,
        message_id: MessageId,
        new_state: MessageState,
        read_at: Option<DateTime<Utc>>,
        acked_at: Option<DateTime<Utc>>,
        snoozed_until: Option<DateTime<Utc>>,
        purge_at: Option<DateTime<Utc>>,
        was_read: bool,
        was_starred: bool,
    },
    ScheduleWake {
        agent_id: AgentId,
        message_id: MessageId,
        wake_at: DateTime<Utc>,
    },
    /// Cancels a pending wake. Also doubles as purge cancellation when a
    /// trashed row is restored.
    CancelScheduledWake {
        agent_id: AgentId,
        message_id: MessageId,
    },
    SchedulePurge {
        agent_id: AgentId,
        message_id: MessageId,
        purge_at: DateTime<Utc>,
    },
    NotifyStateChange {
        agent_id: AgentId,
        message_id: MessageId,
        thread_id: String,
        old_state: MessageState,
        new_state: MessageState,
    },
}

/// Signalled for `(state, event)` pairs with no defined transition. The
/// attempted transition is abandoned; state is untouched.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unexpected event {event} in state {state}")]
pub struct UnexpectedEvent {
    pub state: &'static str,
    pub event: &'static str,
}

/// Result of applying one event: the next state plus the outbox to run.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: ThreadState,
    pub outbox: Vec<OutboxEvent>,
}

// ---------------------------------------------------------------------------
// ThreadLifecycle
// ---------------------------------------------------------------------------

/// The lifecycle machine for one `(message, recipient)` pair.
#[derive(Debug, Clone)]
pub struct ThreadLifecycle {
    pub agent_id: AgentId,
    pub message_id: MessageId,
    pub thread_id: String,
    pub state: ThreadState,
}

impl ThreadLifecycle {
    /// Rebuild the machine from a stored recipient row. Unknown persisted
    /// state strings have already been mapped to `unread` by the store, so
    /// this cannot fail.
    pub fn from_recipient(row: &MessageRecipient, thread_id: impl Into<String>) -> Self {
        let state = match row.state {
            MessageState::Unread => ThreadState::Unread,
            MessageState::Read => ThreadState::Read {
                read_at: row.read_at,
                acked_at: row.acked_at,
            },
            MessageState::Starred => ThreadState::Starred {
                read_at: row.read_at,
                acked_at: row.acked_at,
            },
            MessageState::Snoozed => ThreadState::Snoozed {
                // A snoozed row without a wake time wakes immediately.
                snoozed_until: row.snoozed_until.unwrap_or(DateTime::<Utc>::MIN_UTC),
                read_at: row.read_at,
                acked_at: row.acked_at,
                was_read: row.was_read,
            },
            MessageState::Archived => ThreadState::Archived {
                read_at: row.read_at,
                acked_at: row.acked_at,
                was_starred: row.was_starred,
            },
            MessageState::Trash => ThreadState::Trash {
                purge_at: row.purge_at.unwrap_or(DateTime::<Utc>::MIN_UTC),
            },
        };
        Self {
            agent_id: row.agent_id,
            message_id: row.message_id,
            thread_id: thread_id.into(),
            state,
        }
    }

    /// Apply one event at time `now`. `trash_retention` determines the purge
    /// horizon when a row enters trash.
    pub fn apply(
        &self,
        event: &ThreadEvent,
        now: DateTime<Utc>,
        trash_retention: Duration,
    ) -> Result<Transition, UnexpectedEvent> {
        use ThreadEvent as E;
        use ThreadState as S;

        let purge_horizon = now + trash_retention;

        let (next, pending): (S, Pending) = match (&self.state, event) {
            // -- resume: stay everywhere, re-emit pending timers ------------
            (S::Snoozed { snoozed_until, .. }, E::Resume) => {
                let wake_at = *snoozed_until;
                return Ok(Transition {
                    next: self.state.clone(),
                    outbox: vec![OutboxEvent::ScheduleWake {
                        agent_id: self.agent_id,
                        message_id: self.message_id,
                        wake_at,
                    }],
                });
            }
            (S::Trash { purge_at }, E::Resume) => {
                let purge_at = *purge_at;
                return Ok(Transition {
                    next: self.state.clone(),
                    outbox: vec![OutboxEvent::SchedulePurge {
                        agent_id: self.agent_id,
                        message_id: self.message_id,
                        purge_at,
                    }],
                });
            }
            (_, E::Resume) => return Ok(self.stay()),

            // -- from unread ------------------------------------------------
            (S::Unread, E::Read) => (
                S::Read {
                    read_at: Some(now),
                    acked_at: None,
                },
                Pending::none(),
            ),
            (S::Unread, E::Star) => (
                S::Starred {
                    read_at: None,
                    acked_at: None,
                },
                Pending::none(),
            ),
            (S::Unread, E::Snooze { until }) => (
                S::Snoozed {
                    snoozed_until: *until,
                    read_at: None,
                    acked_at: None,
                    was_read: false,
                },
                Pending::wake(*until),
            ),
            (S::Unread, E::Archive) => (
                S::Archived {
                    read_at: None,
                    acked_at: None,
                    was_starred: false,
                },
                Pending::none(),
            ),
            (S::Unread, E::Trash) => (
                S::Trash {
                    purge_at: purge_horizon,
                },
                Pending::purge(purge_horizon),
            ),
            // Acknowledging an unread row also marks it read.
            (S::Unread, E::Ack) => (
                S::Read {
                    read_at: Some(now),
                    acked_at: Some(now),
                },
                Pending::none(),
            ),

            // -- from read --------------------------------------------------
            (S::Read { .. }, E::Read) => return Ok(self.stay()),
            (S::Read { read_at, acked_at }, E::Star) => (
                S::Starred {
                    read_at: *read_at,
                    acked_at: *acked_at,
                },
                Pending::none(),
            ),
            (S::Read { read_at, acked_at }, E::Snooze { until }) => (
                S::Snoozed {
                    snoozed_until: *until,
                    read_at: *read_at,
                    acked_at: *acked_at,
                    was_read: true,
                },
                Pending::wake(*until),
            ),
            (S::Read { .. }, E::Archive) => {
                let (read_at, acked_at) = self.read_fields();
                (
                    S::Archived {
                        read_at,
                        acked_at,
                        was_starred: false,
                    },
                    Pending::none(),
                )
            }
            (S::Read { .. }, E::Trash) => (
                S::Trash {
                    purge_at: purge_horizon,
                },
                Pending::purge(purge_horizon),
            ),
            (S::Read { read_at, .. }, E::Ack) => (
                S::Read {
                    read_at: *read_at,
                    acked_at: Some(now),
                },
                Pending::none(),
            ),

            // -- from starred -----------------------------------------------
            (S::Starred { .. }, E::Read) | (S::Starred { .. }, E::Star) => {
                return Ok(self.stay())
            }
            (S::Starred { read_at, acked_at }, E::Unstar) => (
                S::Read {
                    read_at: *read_at,
                    acked_at: *acked_at,
                },
                Pending::none(),
            ),
            (S::Starred { read_at, acked_at }, E::Archive) => (
                S::Archived {
                    read_at: *read_at,
                    acked_at: *acked_at,
                    was_starred: true,
                },
                Pending::none(),
            ),
            (S::Starred { .. }, E::Trash) => (
                S::Trash {
                    purge_at: purge_horizon,
                },
                Pending::purge(purge_horizon),
            ),
            (S::Starred { read_at, .. }, E::Ack) => (
                S::Starred {
                    read_at: *read_at,
                    acked_at: Some(now),
                },
                Pending::none(),
            ),

            // -- from snoozed -----------------------------------------------
            (S::Snoozed { acked_at, .. }, E::Read) => (
                S::Read {
                    read_at: Some(now),
                    acked_at: *acked_at,
                },
                Pending::cancel(),
            ),
            (
                S::Snoozed {
                    read_at,
                    acked_at,
                    was_read,
                    ..
                },
                E::Snooze { until },
            ) => (
                S::Snoozed {
                    snoozed_until: *until,
                    read_at: *read_at,
                    acked_at: *acked_at,
                    was_read: *was_read,
                },
                Pending::cancel_then_wake(*until),
            ),
            (S::Snoozed { .. }, E::Wake) => (S::Unread, Pending::cancel()),
            (S::Snoozed { .. }, E::Trash) => (
                S::Trash {
                    purge_at: purge_horizon,
                },
                Pending::cancel_then_purge(purge_horizon),
            ),

            // -- from archived ----------------------------------------------
            (
                S::Archived {
                    read_at, acked_at, ..
                },
                E::Unarchive,
            ) => (
                S::Read {
                    read_at: *read_at,
                    acked_at: *acked_at,
                },
                Pending::none(),
            ),
            (S::Archived { .. }, E::Trash) => (
                S::Trash {
                    purge_at: purge_horizon,
                },
                Pending::purge(purge_horizon),
            ),

            // -- from trash -------------------------------------------------
            (S::Trash { .. }, E::Restore) => (S::Unread, Pending::cancel()),

            (state, event) => {
                return Err(UnexpectedEvent {
                    state: state.name(),
                    event: event.name(),
                })
            }
        };

        Ok(self.transition_to(next, pending))
    }

    /// A self-transition with an empty outbox.
    fn stay(&self) -> Transition {
        Transition {
            next: self.state.clone(),
            outbox: Vec::new(),
        }
    }

    fn read_fields(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        match &self.state {
            ThreadState::Read { read_at, acked_at }
            | ThreadState::Starred { read_at, acked_at } => (*read_at, *acked_at),
            _ => (None, None),
        }
    }

    /// Assemble the ordered outbox for a transition into `next`.
    fn transition_to(&self, next: ThreadState, pending: Pending) -> Transition {
        let mut outbox = vec![self.persist_event(&next)];

        if pending.cancel {
            outbox.push(OutboxEvent::CancelScheduledWake {
                agent_id: self.agent_id,
                message_id: self.message_id,
            });
        }
        if let Some(wake_at) = pending.wake_at {
            outbox.push(OutboxEvent::ScheduleWake {
                agent_id: self.agent_id,
                message_id: self.message_id,
                wake_at,
            });
        }
        if let Some(purge_at) = pending.purge_at {
            outbox.push(OutboxEvent::SchedulePurge {
                agent_id: self.agent_id,
                message_id: self.message_id,
                purge_at,
            });
        }

        let old = self.state.wire();
        let new = next.wire();
        if old != new {
            outbox.push(OutboxEvent::NotifyStateChange {
                agent_id: self.agent_id,
                message_id: self.message_id,
                thread_id: self.thread_id.clone(),
                old_state: old,
                new_state: new,
            });
        }

        Transition { next, outbox }
    }

    /// Map a lifecycle state onto the persistence descriptor for its row.
    fn persist_event(&self, next: &ThreadState) -> OutboxEvent {
        let (read_at, acked_at, snoozed_until, purge_at, was_read, was_starred) = match next {
            ThreadState::Unread => (None, None, None, None, false, false),
            ThreadState::Read { read_at, acked_at } => {
                (*read_at, *acked_at, None, None, false, false)
            }
            ThreadState::Starred { read_at, acked_at } => {
                (*read_at, *acked_at, None, None, false, false)
            }
            ThreadState::Snoozed {
                snoozed_until,
                read_at,
                acked_at,
                was_read,
            } => (
                *read_at,
                *acked_at,
                Some(*snoozed_until),
                None,
                *was_read,
                false,
            ),
            ThreadState::Archived {
                read_at,
                acked_at,
                was_starred,
            } => (*read_at, *acked_at, None, None, false, *was_starred),
            ThreadState::Trash { purge_at } => (None, None, None, Some(*purge_at), false, false),
        };

        OutboxEvent::PersistStateChange {
            agent_id: self.agent_id,
            message_id: self.message_id,
            new_state: next.wire(),
            read_at,
            acked_at,
            snoozed_until,
            purge_at,
            was_read,
            was_starred,
        }
    }
}

/// Timer side effects accumulated while matching a transition.
struct Pending {
    cancel: bool,
    wake_at: Option<DateTime<Utc>>,
    purge_at: Option<DateTime<Utc>>,
}

impl Pending {
    fn none() -> Self {
        Self {
            cancel: false,
            wake_at: None,
            purge_at: None,
        }
    }

    fn wake(at: DateTime<Utc>) -> Self {
        Self {
            wake_at: Some(at),
            ..Self::none()
        }
    }

    fn purge(at: DateTime<Utc>) -> Self {
        Self {
            purge_at: Some(at),
            ..Self::none()
        }
    }

    fn cancel() -> Self {
        Self {
            cancel: true,
            ..Self::none()
        }
    }

    fn cancel_then_wake(at: DateTime<Utc>) -> Self {
        Self {
            cancel: true,
            wake_at: Some(at),
            purge_at: None,
        }
    }

    fn cancel_then_purge(at: DateTime<Utc>) -> Self {
        Self {
            cancel: true,
            wake_at: None,
            purge_at: Some(at),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

    fn machine(state: ThreadState) -> ThreadLifecycle {
        ThreadLifecycle {
            agent_id: 7,
            message_id: 42,
            thread_id: "t-1".into(),
            state,
        }
    }

    fn persists_as(outbox: &[OutboxEvent]) -> MessageState {
        match &outbox[0] {
            OutboxEvent::PersistStateChange { new_state, .. } => *new_state,
            other => panic!("first outbox event is not a persist: {other:?}"),
        }
    }

    fn count_cancels(outbox: &[OutboxEvent]) -> usize {
        outbox
            .iter()
            .filter(|e| matches!(e, OutboxEvent::CancelScheduledWake { .. }))
            .count()
    }

    #[test]
    fn unread_read_sets_read_at() {
        let now = Utc::now();
        let t = machine(ThreadState::Unread)
            .apply(&ThreadEvent::Read, now, RETENTION)
            .unwrap();
        assert_eq!(
            t.next,
            ThreadState::Read {
                read_at: Some(now),
                acked_at: None
            }
        );
        assert_eq!(persists_as(&t.outbox), MessageState::Read);
        // Persist + notify, nothing else.
        assert_eq!(t.outbox.len(), 2);
        assert!(matches!(
            t.outbox[1],
            OutboxEvent::NotifyStateChange {
                old_state: MessageState::Unread,
                new_state: MessageState::Read,
                ..
            }
        ));
    }

    #[test]
    fn read_is_idempotent() {
        let now = Utc::now();
        let read = ThreadState::Read {
            read_at: Some(now),
            acked_at: None,
        };
        let t = machine(read.clone())
            .apply(&ThreadEvent::Read, now, RETENTION)
            .unwrap();
        assert_eq!(t.next, read);
        assert!(t.outbox.is_empty());
    }

    #[test]
    fn ack_from_unread_sets_read_at_equal_to_acked_at() {
        let now = Utc::now();
        let t = machine(ThreadState::Unread)
            .apply(&ThreadEvent::Ack, now, RETENTION)
            .unwrap();
        match t.next {
            ThreadState::Read { read_at, acked_at } => {
                assert_eq!(read_at, Some(now));
                assert_eq!(acked_at, Some(now));
            }
            other => panic!("expected read, got {other:?}"),
        }
    }

    #[test]
    fn ack_on_read_updates_acked_at_without_notify() {
        let earlier = Utc::now() - chrono::Duration::hours(1);
        let now = Utc::now();
        let t = machine(ThreadState::Read {
            read_at: Some(earlier),
            acked_at: None,
        })
        .apply(&ThreadEvent::Ack, now, RETENTION)
        .unwrap();
        assert_eq!(
            t.next,
            ThreadState::Read {
                read_at: Some(earlier),
                acked_at: Some(now)
            }
        );
        // State name unchanged: persist only.
        assert_eq!(t.outbox.len(), 1);
        assert_eq!(persists_as(&t.outbox), MessageState::Read);
    }

    #[test]
    fn snooze_then_wake_returns_to_unread() {
        let now = Utc::now();
        let until = now + chrono::Duration::hours(1);

        let snoozed = machine(ThreadState::Unread)
            .apply(&ThreadEvent::Snooze { until }, now, RETENTION)
            .unwrap();
        assert!(matches!(
            snoozed.next,
            ThreadState::Snoozed { snoozed_until, was_read: false, .. } if snoozed_until == until
        ));
        assert!(snoozed
            .outbox
            .iter()
            .any(|e| matches!(e, OutboxEvent::ScheduleWake { wake_at, .. } if *wake_at == until)));
        assert_eq!(count_cancels(&snoozed.outbox), 0);

        let woke = machine(snoozed.next)
            .apply(&ThreadEvent::Wake, now, RETENTION)
            .unwrap();
        assert_eq!(woke.next, ThreadState::Unread);
        assert_eq!(count_cancels(&woke.outbox), 1);
        match &woke.outbox[0] {
            OutboxEvent::PersistStateChange { snoozed_until, .. } => {
                assert!(snoozed_until.is_none())
            }
            other => panic!("first outbox event is not a persist: {other:?}"),
        }
    }

    #[test]
    fn resnooze_cancels_before_rescheduling() {
        let now = Utc::now();
        let first = now + chrono::Duration::hours(1);
        let second = now + chrono::Duration::hours(2);

        let snoozed = ThreadState::Snoozed {
            snoozed_until: first,
            read_at: None,
            acked_at: None,
            was_read: false,
        };
        let t = machine(snoozed)
            .apply(&ThreadEvent::Snooze { until: second }, now, RETENTION)
            .unwrap();

        let cancel_pos = t
            .outbox
            .iter()
            .position(|e| matches!(e, OutboxEvent::CancelScheduledWake { .. }))
            .expect("cancel present");
        let sched_pos = t
            .outbox
            .iter()
            .position(|e| matches!(e, OutboxEvent::ScheduleWake { wake_at, .. } if *wake_at == second))
            .expect("schedule present");
        assert!(cancel_pos < sched_pos);
        // Same state name, so no notification.
        assert!(!t
            .outbox
            .iter()
            .any(|e| matches!(e, OutboxEvent::NotifyStateChange { .. })));
    }

    #[test]
    fn snooze_from_read_remembers_it_was_read() {
        let now = Utc::now();
        let until = now + chrono::Duration::minutes(30);
        let t = machine(ThreadState::Read {
            read_at: Some(now),
            acked_at: None,
        })
        .apply(&ThreadEvent::Snooze { until }, now, RETENTION)
        .unwrap();
        assert!(matches!(
            t.next,
            ThreadState::Snoozed { was_read: true, .. }
        ));
    }

    #[test]
    fn trash_schedules_purge_in_the_future() {
        let now = Utc::now();
        for state in [
            ThreadState::Unread,
            ThreadState::Read {
                read_at: Some(now),
                acked_at: None,
            },
            ThreadState::Starred {
                read_at: None,
                acked_at: None,
            },
            ThreadState::Archived {
                read_at: None,
                acked_at: None,
                was_starred: false,
            },
        ] {
            let t = machine(state)
                .apply(&ThreadEvent::Trash, now, RETENTION)
                .unwrap();
            let purges: Vec<_> = t
                .outbox
                .iter()
                .filter_map(|e| match e {
                    OutboxEvent::SchedulePurge { purge_at, .. } => Some(*purge_at),
                    _ => None,
                })
                .collect();
            assert_eq!(purges.len(), 1);
            assert!(purges[0] > now);
        }
    }

    #[test]
    fn trash_from_snoozed_cancels_the_wake_first() {
        let now = Utc::now();
        let t = machine(ThreadState::Snoozed {
            snoozed_until: now + chrono::Duration::hours(1),
            read_at: None,
            acked_at: None,
            was_read: false,
        })
        .apply(&ThreadEvent::Trash, now, RETENTION)
        .unwrap();

        let cancel_pos = t
            .outbox
            .iter()
            .position(|e| matches!(e, OutboxEvent::CancelScheduledWake { .. }))
            .expect("cancel present");
        let purge_pos = t
            .outbox
            .iter()
            .position(|e| matches!(e, OutboxEvent::SchedulePurge { .. }))
            .expect("purge present");
        assert!(cancel_pos < purge_pos);
    }

    #[test]
    fn restore_from_trash_cancels_purge_and_returns_to_unread() {
        let now = Utc::now();
        let t = machine(ThreadState::Trash {
            purge_at: now + chrono::Duration::days(30),
        })
        .apply(&ThreadEvent::Restore, now, RETENTION)
        .unwrap();
        assert_eq!(t.next, ThreadState::Unread);
        assert_eq!(count_cancels(&t.outbox), 1);
        assert!(t
            .outbox
            .iter()
            .any(|e| matches!(e, OutboxEvent::NotifyStateChange { .. })));
    }

    #[test]
    fn star_carries_read_and_ack_timestamps() {
        let read_at = Some(Utc::now() - chrono::Duration::minutes(5));
        let acked_at = Some(Utc::now() - chrono::Duration::minutes(4));
        let t = machine(ThreadState::Read { read_at, acked_at })
            .apply(&ThreadEvent::Star, Utc::now(), RETENTION)
            .unwrap();
        assert_eq!(t.next, ThreadState::Starred { read_at, acked_at });

        let back = machine(t.next)
            .apply(&ThreadEvent::Unstar, Utc::now(), RETENTION)
            .unwrap();
        assert_eq!(back.next, ThreadState::Read { read_at, acked_at });
    }

    #[test]
    fn archive_from_starred_remembers_the_star() {
        let t = machine(ThreadState::Starred {
            read_at: None,
            acked_at: None,
        })
        .apply(&ThreadEvent::Archive, Utc::now(), RETENTION)
        .unwrap();
        assert!(matches!(
            t.next,
            ThreadState::Archived {
                was_starred: true,
                ..
            }
        ));
    }

    #[test]
    fn unarchive_goes_to_read() {
        let read_at = Some(Utc::now());
        let t = machine(ThreadState::Archived {
            read_at,
            acked_at: None,
            was_starred: false,
        })
        .apply(&ThreadEvent::Unarchive, Utc::now(), RETENTION)
        .unwrap();
        assert_eq!(
            t.next,
            ThreadState::Read {
                read_at,
                acked_at: None
            }
        );
    }

    #[test]
    fn resume_reemits_pending_timers_only() {
        let now = Utc::now();
        let until = now + chrono::Duration::hours(2);

        let t = machine(ThreadState::Snoozed {
            snoozed_until: until,
            read_at: None,
            acked_at: None,
            was_read: false,
        })
        .apply(&ThreadEvent::Resume, now, RETENTION)
        .unwrap();
        assert_eq!(
            t.outbox,
            vec![OutboxEvent::ScheduleWake {
                agent_id: 7,
                message_id: 42,
                wake_at: until
            }]
        );

        let purge_at = now + chrono::Duration::days(3);
        let t = machine(ThreadState::Trash { purge_at })
            .apply(&ThreadEvent::Resume, now, RETENTION)
            .unwrap();
        assert_eq!(
            t.outbox,
            vec![OutboxEvent::SchedulePurge {
                agent_id: 7,
                message_id: 42,
                purge_at
            }]
        );

        let t = machine(ThreadState::Unread)
            .apply(&ThreadEvent::Resume, now, RETENTION)
            .unwrap();
        assert!(t.outbox.is_empty());
    }

    #[test]
    fn undefined_pairs_are_rejected_without_state_change() {
        let now = Utc::now();
        let cases: Vec<(ThreadState, ThreadEvent)> = vec![
            (ThreadState::Unread, ThreadEvent::Unstar),
            (ThreadState::Unread, ThreadEvent::Wake),
            (ThreadState::Unread, ThreadEvent::Restore),
            (
                ThreadState::Read {
                    read_at: None,
                    acked_at: None,
                },
                ThreadEvent::Wake,
            ),
            (
                ThreadState::Starred {
                    read_at: None,
                    acked_at: None,
                },
                ThreadEvent::Snooze {
                    until: now + chrono::Duration::hours(1),
                },
            ),
            (
                ThreadState::Snoozed {
                    snoozed_until: now,
                    read_at: None,
                    acked_at: None,
                    was_read: false,
                },
                ThreadEvent::Star,
            ),
            (
                ThreadState::Archived {
                    read_at: None,
                    acked_at: None,
                    was_starred: false,
                },
                ThreadEvent::Read,
            ),
            (
                ThreadState::Trash { purge_at: now },
                ThreadEvent::Read,
            ),
            (ThreadState::Trash { purge_at: now }, ThreadEvent::Trash),
        ];

        for (state, event) in cases {
            let m = machine(state.clone());
            let err = m.apply(&event, now, RETENTION).unwrap_err();
            assert_eq!(err.state, state.name());
            // State is untouched: the machine still holds the original.
            assert_eq!(m.state, state);
        }
    }

    #[test]
    fn rebuild_from_row_round_trips_side_data() {
        let now = Utc::now();
        let row = MessageRecipient {
            message_id: 42,
            agent_id: 7,
            state: MessageState::Snoozed,
            snoozed_until: Some(now + chrono::Duration::hours(1)),
            read_at: Some(now - chrono::Duration::hours(1)),
            acked_at: None,
            purge_at: None,
            was_read: true,
            was_starred: false,
        };
        let m = ThreadLifecycle::from_recipient(&row, "t-9");
        assert!(matches!(
            m.state,
            ThreadState::Snoozed {
                was_read: true,
                ..
            }
        ));
        assert_eq!(m.thread_id, "t-9");
    }
}
