//! Voluntary-exit handler.
//!
//! Exits are operator-initiated rather than epoch-scheduled: requests arrive
//! on a channel (from the CLI or API surface) and are dispatched as duties
//! at the current slot.

use super::HandlerContext;
use dv_types::{BeaconRole, BlsPublicKey, Duty, Epoch};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// A request to exit one validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitRequest {
    pub pubkey: BlsPublicKey,
    pub epoch: Epoch,
}

pub(crate) struct VoluntaryExitHandler {
    ctx: HandlerContext,
    requests: mpsc::Receiver<ExitRequest>,
}

impl VoluntaryExitHandler {
    pub(crate) fn new(ctx: HandlerContext, requests: mpsc::Receiver<ExitRequest>) -> Self {
        VoluntaryExitHandler { ctx, requests }
    }

    pub(crate) async fn run(mut self) {
        info!(handler = self.ctx.name, "duty handler started");
        loop {
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break,
                // Keep the oracle advancing so dispatched exits carry a
                // fresh slot.
                _ = self.ctx.oracle.next() => {}
                request = self.requests.recv() => match request {
                    Some(request) => self.on_request(request).await,
                    None => break,
                },
            }
        }
        info!(handler = self.ctx.name, "duty handler stopped");
    }

    async fn on_request(&mut self, request: ExitRequest) {
        let Some(share) = self.ctx.validators.get(&request.pubkey) else {
            warn!(pubkey = %request.pubkey, "exit requested for unknown validator");
            return;
        };
        let slot = self.ctx.oracle.slot();
        info!(
            validator = share.validator_index,
            epoch = request.epoch,
            "dispatching voluntary exit"
        );
        self.ctx
            .executor
            .execute_duty(Duty {
                role: BeaconRole::VoluntaryExit,
                slot,
                epoch: request.epoch,
                validator_index: share.validator_index,
                committee_index: 0,
                committee_length: 0,
                committee_position: 0,
                pubkey: request.pubkey,
                stopped: false,
            })
            .await;
    }
}
