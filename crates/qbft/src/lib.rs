//! QBFT consensus engine.
//!
//! This crate drives a single decision per duty to finality across an
//! operator committee:
//!
//! - [`Instance`]: the single-decision state machine
//!   (Preprepare → Prepare → Commit → RoundChange)
//! - [`Controller`]: owns instances keyed by height, routes inbound
//!   messages, persists decided instances
//! - [`RoundTimers`]: per-instance round timeouts feeding the controller
//!   mailbox
//!
//! # Architecture
//!
//! Instances are synchronous: they process one message at a time and return
//! [`Action`]s describing what to broadcast, which timers to arm, and what
//! was decided. All instance mutation happens on the controller's task,
//! which drains a single mailbox of network messages and timer fires in
//! arrival order. That mailbox is the linearization point for consensus.
//!
//! Timers never hold references into instance state: they hold the
//! controller's mailbox sender plus `(height, round)` and are guarded
//! against stale fires by round equality on delivery.

mod container;
mod controller;
mod error;
mod instance;
mod store;
mod timer;

pub use container::MessageContainer;
pub use controller::{
    Controller, ControllerCommand, ControllerConfig, ControllerHandle, DecidedEvent,
};
pub use error::QbftError;
pub use instance::{Action, Instance, InstanceConfig, InstanceState, Stage, ValueCheck};
pub use store::{decode_operators, encode_operators, QbftStore, StoredInstance};
pub use timer::{round_timeout, RoundTimers, QUICK_TIMEOUT, QUICK_TIMEOUT_THRESHOLD, SLOW_TIMEOUT};
