//! Per-role duty handlers.
//!
//! Each handler is a task consuming a merged stream of slot ticks, beacon
//! events, validator-set changes and shutdown. Shutdown is always
//! selectable; a handler never blocks a slot tick on background work.

mod committee;
mod exit;
mod proposer;
mod registration;

pub(crate) use committee::CommitteeHandler;
pub(crate) use exit::VoluntaryExitHandler;
pub use exit::ExitRequest;
pub(crate) use proposer::ProposerHandler;
pub(crate) use registration::RegistrationHandler;

use crate::scheduler::DutiesExecutor;
use crate::slot_oracle::SlotOracle;
use crate::store::DutyStore;
use dv_beacon::{BeaconClient, BeaconEvent};
use dv_types::{NetworkConfig, ValidatorStore};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Everything a handler needs; one context per handler task.
pub(crate) struct HandlerContext {
    pub name: &'static str,
    pub network: NetworkConfig,
    pub beacon: Arc<dyn BeaconClient>,
    pub validators: Arc<ValidatorStore>,
    pub duty_store: Arc<DutyStore>,
    pub executor: Arc<dyn DutiesExecutor>,
    pub oracle: SlotOracle,
    pub events: broadcast::Receiver<BeaconEvent>,
    pub indices: broadcast::Receiver<()>,
    pub shutdown: CancellationToken,
}
