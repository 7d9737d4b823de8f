//! Proposer handler.

use super::HandlerContext;
use crate::store::DutyDescriptor;
use dv_beacon::{retry_with_backoff, BeaconEvent, RetryPolicy};
use dv_types::{BeaconRole, Duty, Epoch, Slot};
use tracing::{debug, error, info};

pub(crate) struct ProposerHandler {
    ctx: HandlerContext,
}

impl ProposerHandler {
    pub(crate) fn new(ctx: HandlerContext) -> Self {
        ProposerHandler { ctx }
    }

    pub(crate) async fn run(mut self) {
        info!(handler = self.ctx.name, "duty handler started");
        loop {
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break,
                slot = self.ctx.oracle.next() => self.on_slot(slot).await,
                event = self.ctx.events.recv() => {
                    if let Ok(event) = event {
                        self.on_event(event).await;
                    }
                }
                changed = self.ctx.indices.recv() => {
                    if changed.is_ok() {
                        let epoch = self.ctx.network.epoch_at_slot(self.ctx.oracle.slot());
                        self.ctx.duty_store.proposer.reset_epoch(epoch);
                        self.fetch_epoch(epoch).await;
                    }
                }
            }
        }
        info!(handler = self.ctx.name, "duty handler stopped");
    }

    async fn on_slot(&mut self, slot: Slot) {
        let epoch = self.ctx.network.epoch_at_slot(slot);
        if !self.ctx.duty_store.proposer.has_epoch(epoch) {
            self.fetch_epoch(epoch).await;
        }

        for info in self.ctx.duty_store.proposer.committee_slot_duties(epoch, slot) {
            debug!(slot, validator = info.validator_index, "dispatching proposer duty");
            self.ctx
                .executor
                .execute_duty(Duty {
                    role: BeaconRole::Proposer,
                    slot,
                    epoch,
                    validator_index: info.validator_index,
                    committee_index: 0,
                    committee_length: 0,
                    committee_position: 0,
                    pubkey: info.pubkey,
                    stopped: false,
                })
                .await;
        }
    }

    async fn on_event(&mut self, event: BeaconEvent) {
        match event {
            BeaconEvent::HeadReorg { epoch, .. } => {
                // Proposer assignments move with the head.
                self.ctx.duty_store.proposer.reset_epoch(epoch);
                self.fetch_epoch(epoch).await;
            }
            BeaconEvent::FinalizedCheckpoint { epoch } => {
                self.ctx
                    .duty_store
                    .proposer
                    .reset_epoch(epoch.saturating_sub(2));
            }
        }
    }

    /// Proposer duties come back for the whole epoch; only our validators
    /// are marked in-committee.
    async fn fetch_epoch(&self, epoch: Epoch) {
        let known: std::collections::HashSet<_> =
            self.ctx.validators.validator_indices().into_iter().collect();
        if known.is_empty() {
            return;
        }

        let result = retry_with_backoff(RetryPolicy::default(), || {
            self.ctx.beacon.proposer_duties(epoch)
        })
        .await;
        match result {
            Ok(duties) => {
                let descriptors: Vec<DutyDescriptor<_>> = duties
                    .into_iter()
                    .map(|duty| DutyDescriptor {
                        slot: duty.slot,
                        validator_index: duty.validator_index,
                        in_committee: known.contains(&duty.validator_index),
                        duty,
                    })
                    .collect();
                debug!(epoch, count = descriptors.len(), "stored proposer duties");
                self.ctx.duty_store.proposer.set_epoch(epoch, descriptors);
            }
            Err(err) => error!(epoch, %err, "failed to fetch proposer duties"),
        }
    }
}
