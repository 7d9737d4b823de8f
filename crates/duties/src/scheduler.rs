//! The duty scheduler: fans out one handler task per role.

use crate::handlers::{
    CommitteeHandler, ExitRequest, HandlerContext, ProposerHandler, RegistrationHandler,
    VoluntaryExitHandler,
};
use crate::slot_oracle::SlotOracle;
use crate::store::DutyStore;
use async_trait::async_trait;
use dv_beacon::{BeaconClient, BeaconEvent};
use dv_types::{CommitteeDuty, Duty, NetworkConfig, ValidatorStore};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Receives ready duties from the scheduler. The node implements this by
/// routing each duty to its role runner.
#[async_trait]
pub trait DutiesExecutor: Send + Sync {
    /// Execute a batched committee duty (attester + sync committee).
    async fn execute_committee_duty(&self, duty: CommitteeDuty);
    /// Execute a single per-validator duty.
    async fn execute_duty(&self, duty: Duty);
}

#[derive(Clone)]
pub struct SchedulerConfig {
    pub network: NetworkConfig,
}

/// Builds and spawns the per-role handler tasks.
pub struct Scheduler {
    config: SchedulerConfig,
    beacon: Arc<dyn BeaconClient>,
    validators: Arc<ValidatorStore>,
    duty_store: Arc<DutyStore>,
    executor: Arc<dyn DutiesExecutor>,
    indices_tx: broadcast::Sender<()>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        beacon: Arc<dyn BeaconClient>,
        validators: Arc<ValidatorStore>,
        duty_store: Arc<DutyStore>,
        executor: Arc<dyn DutiesExecutor>,
        shutdown: CancellationToken,
    ) -> Self {
        let (indices_tx, _) = broadcast::channel(16);
        Scheduler {
            config,
            beacon,
            validators,
            duty_store,
            executor,
            indices_tx,
            shutdown,
        }
    }

    /// Signal that the validator set changed; handlers refetch their duties.
    pub fn indices_change_sender(&self) -> broadcast::Sender<()> {
        self.indices_tx.clone()
    }

    /// Spawn every handler plus the beacon-event fan-out. `exit_requests`
    /// feeds the voluntary-exit handler.
    pub fn start(self, exit_requests: mpsc::Receiver<ExitRequest>) -> Vec<JoinHandle<()>> {
        let (event_tx, _) = broadcast::channel(64);
        let mut handles = Vec::new();

        // Fan beacon events out to every handler.
        {
            let mut events = self.beacon.subscribe_events();
            let event_tx = event_tx.clone();
            let shutdown = self.shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        event = events.recv() => match event {
                            Some(event) => {
                                if let BeaconEvent::HeadReorg { slot, epoch } = &event {
                                    warn!(slot, epoch, "beacon reorg observed");
                                }
                                let _ = event_tx.send(event);
                            }
                            None => break,
                        },
                    }
                }
            }));
        }

        let ctx = |name: &'static str| HandlerContext {
            name,
            network: self.config.network.clone(),
            beacon: Arc::clone(&self.beacon),
            validators: Arc::clone(&self.validators),
            duty_store: Arc::clone(&self.duty_store),
            executor: Arc::clone(&self.executor),
            oracle: SlotOracle::new(&self.config.network),
            events: event_tx.subscribe(),
            indices: self.indices_tx.subscribe(),
            shutdown: self.shutdown.clone(),
        };

        info!("starting duty handlers");
        handles.push(tokio::spawn(CommitteeHandler::new(ctx("committee")).run()));
        handles.push(tokio::spawn(ProposerHandler::new(ctx("proposer")).run()));
        handles.push(tokio::spawn(
            RegistrationHandler::new(ctx("validator_registration")).run(),
        ));
        handles.push(tokio::spawn(
            VoluntaryExitHandler::new(ctx("voluntary_exit"), exit_requests).run(),
        ));
        handles
    }
}
