//! # sync-core
//!
//! Pure logic for walletsync (no I/O, instant tests).
//!
//! This crate implements the state machines and bookkeeping for wallet sync
//! without any network or disk I/O, enabling fast unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects:
//! - [`state`] decides how the RPC channel moves between connection phases
//! - [`reconcile`] decides which single action a sync performs
//! - [`pending`] and [`subscriptions`] are the channel's bookkeeping tables
//!
//! The actual I/O (network, disk, crypto) is performed by `sync-client`,
//! which interprets the decisions produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod pending;
pub mod reconcile;
pub mod state;
pub mod subscriptions;

pub use pending::{PendingError, PendingRequest, PendingTable};
pub use reconcile::{decide, SyncAction};
pub use state::{Action, BackoffPolicy, ChannelState, Event};
pub use subscriptions::{Registration, Subscription, SubscriptionRegistry};
