//! Validator-registration handler.
//!
//! Registrations are re-broadcast once per epoch per validator, spread over
//! the epoch's slots by validator index so a large cluster does not submit
//! them all in one slot.

use super::HandlerContext;
use dv_types::{BeaconRole, Duty, Slot};
use tracing::{debug, info};

pub(crate) struct RegistrationHandler {
    ctx: HandlerContext,
}

impl RegistrationHandler {
    pub(crate) fn new(ctx: HandlerContext) -> Self {
        RegistrationHandler { ctx }
    }

    pub(crate) async fn run(mut self) {
        info!(handler = self.ctx.name, "duty handler started");
        loop {
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break,
                slot = self.ctx.oracle.next() => self.on_slot(slot).await,
                event = self.ctx.events.recv() => { let _ = event; }
                changed = self.ctx.indices.recv() => { let _ = changed; }
            }
        }
        info!(handler = self.ctx.name, "duty handler stopped");
    }

    async fn on_slot(&mut self, slot: Slot) {
        let epoch = self.ctx.network.epoch_at_slot(slot);
        let spe = self.ctx.network.slots_per_epoch;

        for share in self.ctx.validators.all() {
            if share.validator_index % spe != slot % spe {
                continue;
            }
            debug!(slot, validator = share.validator_index, "dispatching registration duty");
            self.ctx
                .executor
                .execute_duty(Duty {
                    role: BeaconRole::ValidatorRegistration,
                    slot,
                    epoch,
                    validator_index: share.validator_index,
                    committee_index: 0,
                    committee_length: 0,
                    committee_position: 0,
                    pubkey: share.validator_pubkey,
                    stopped: false,
                })
                .await;
        }
    }
}
