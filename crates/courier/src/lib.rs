//! Courier — durable, multi-recipient mail for autonomous agents.
//!
//! Agents exchange direct messages and broadcast topic events through
//! three cooperating pieces:
//!
//! - the [`MailService`](service::MailService): validates, persists, and
//!   dispatches messages, and serves every query and state-change
//!   operation,
//! - the per-recipient [lifecycle machine](lifecycle): a pure state
//!   machine producing an outbox of side-effect descriptors for each
//!   transition,
//! - the [`NotificationHub`](hub::NotificationHub): best-effort,
//!   non-blocking fan-out of fresh messages to live subscribers.
//!
//! Durable state lives in SQLite via the [`store`] module. Delivery
//! through the hub is a wake-up signal, not a guarantee: consumers
//! reconcile by polling the store.

pub mod config;
pub mod error;
pub mod hub;
pub mod lifecycle;
pub mod service;
pub mod store;
pub mod types;

pub use config::MailConfig;
pub use error::{ErrorCode, MailError, StoreError};
pub use hub::NotificationHub;
pub use service::{InboxSubscription, MailService};
pub use store::MailStore;
