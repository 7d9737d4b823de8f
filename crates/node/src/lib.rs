//! Node assembly.
//!
//! Everything above the protocol crates: configuration, telemetry,
//! metrics, the HTTP surface, and the wiring that connects the scheduler,
//! controllers and runners into a running operator node.

pub mod api;
pub mod cluster;
pub mod config;
pub mod metrics;
pub mod node;
pub mod prober;
pub mod telemetry;

pub use config::{Config, LogFormat, NetworkPreset};
pub use node::{Node, NodeError};
