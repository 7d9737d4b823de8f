//! Committee handler: attester and sync-committee duties.
//!
//! The committee handler keeps attester and sync-committee duties warm for
//! the current and next epoch, and on every slot tick batches the slot's
//! duties into one [`CommitteeDuty`] — the consensus unit. Aggregation-side
//! duties (aggregator, sync-committee contribution) are dispatched alongside:
//! whether the validator actually aggregates is settled by its selection
//! proof in the runner.

use super::HandlerContext;
use crate::store::DutyDescriptor;
use dv_beacon::{retry_with_backoff, BeaconEvent, RetryPolicy};
use dv_types::{BeaconRole, CommitteeDuty, Duty, Epoch, Slot};
use tracing::{debug, error, info, warn};

pub(crate) struct CommitteeHandler {
    ctx: HandlerContext,
}

impl CommitteeHandler {
    pub(crate) fn new(ctx: HandlerContext) -> Self {
        CommitteeHandler { ctx }
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
                        self.on_indices_change().await;
                    }
                }
            }
        }
        info!(handler = self.ctx.name, "duty handler stopped");
    }

    async fn on_slot(&mut self, slot: Slot) {
        let epoch = self.ctx.network.epoch_at_slot(slot);

        if !self.ctx.duty_store.attester.has_epoch(epoch) {
            self.fetch_epoch(epoch).await;
        }

        if slot == self.ctx.network.first_slot_of_epoch(epoch) {
            // Two epochs of history is the retention target.
            self.ctx.duty_store.reset_epoch(epoch.saturating_sub(2));
            self.preload_next_epoch(epoch + 1);
        }

        self.dispatch(epoch, slot).await;
    }

    async fn on_event(&mut self, event: BeaconEvent) {
        match event {
            BeaconEvent::HeadReorg { epoch, .. } => {
                // Duties computed from the reorged chain are suspect.
                self.ctx.duty_store.attester.reset_epoch(epoch);
                self.ctx.duty_store.attester.reset_epoch(epoch + 1);
                self.ctx.duty_store.sync_committee.reset_epoch(epoch);
                self.fetch_epoch(epoch).await;
            }
            BeaconEvent::FinalizedCheckpoint { epoch } => {
                self.ctx.duty_store.reset_epoch(epoch.saturating_sub(2));
            }
        }
    }

    async fn on_indices_change(&mut self) {
        let epoch = self.ctx.network.epoch_at_slot(self.ctx.oracle.slot());
        debug!(handler = self.ctx.name, epoch, "validator set changed, refetching");
        self.ctx.duty_store.attester.reset_epoch(epoch);
        self.ctx.duty_store.attester.reset_epoch(epoch + 1);
        self.ctx.duty_store.sync_committee.reset_epoch(epoch);
        self.fetch_epoch(epoch).await;
        self.preload_next_epoch(epoch + 1);
    }

    /// Fetch attester and sync duties for an epoch into the store.
    async fn fetch_epoch(&self, epoch: Epoch) {
        let indices = self.ctx.validators.validator_indices();
        if indices.is_empty() {
            return;
        }

        let attester = retry_with_backoff(RetryPolicy::default(), || {
            self.ctx.beacon.attester_duties(epoch, &indices)
        })
        .await;
        match attester {
            Ok(duties) => {
                let descriptors = duties
                    .into_iter()
                    .map(|duty| DutyDescriptor {
                        slot: duty.slot,
                        validator_index: duty.validator_index,
                        in_committee: true,
                        duty,
                    })
                    .collect::<Vec<_>>();
                debug!(epoch, count = descriptors.len(), "stored attester duties");
                self.ctx.duty_store.attester.set_epoch(epoch, descriptors);
            }
            Err(err) => error!(epoch, %err, "failed to fetch attester duties"),
        }

        let sync = retry_with_backoff(RetryPolicy::default(), || {
            self.ctx.beacon.sync_committee_duties(epoch, &indices)
        })
        .await;
        match sync {
            Ok(duties) => {
                debug!(epoch, count = duties.len(), "stored sync-committee duties");
                self.ctx.duty_store.sync_committee.set_epoch(epoch, duties);
            }
            Err(err) => error!(epoch, %err, "failed to fetch sync-committee duties"),
        }
    }

    /// Preload the next epoch without blocking this slot's dispatch.
    fn preload_next_epoch(&self, epoch: Epoch) {
        if self.ctx.duty_store.attester.has_epoch(epoch) {
            return;
        }
        let beacon = self.ctx.beacon.clone();
        let validators = self.ctx.validators.clone();
        let duty_store = self.ctx.duty_store.clone();
        let shutdown = self.ctx.shutdown.clone();
        tokio::spawn(async move {
            let indices = validators.validator_indices();
            if indices.is_empty() {
                return;
            }
            let fetch = async {
                let attester = retry_with_backoff(RetryPolicy::default(), || {
                    beacon.attester_duties(epoch, &indices)
                })
                .await;
                match attester {
                    Ok(duties) => {
                        let descriptors = duties
                            .into_iter()
                            .map(|duty| DutyDescriptor {
                                slot: duty.slot,
                                validator_index: duty.validator_index,
                                in_committee: true,
                                duty,
                            })
                            .collect();
                        duty_store.attester.set_epoch(epoch, descriptors);
                    }
                    Err(err) => warn!(epoch, %err, "next-epoch attester preload failed"),
                }
                let sync = retry_with_backoff(RetryPolicy::default(), || {
                    beacon.sync_committee_duties(epoch, &indices)
                })
                .await;
                match sync {
                    Ok(duties) => duty_store.sync_committee.set_epoch(epoch, duties),
                    Err(err) => warn!(epoch, %err, "next-epoch sync preload failed"),
                }
            };
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = fetch => {}
            }
        });
    }

    /// Batch the slot's duties into a committee duty and hand it to the
    /// executor, plus the aggregation-side duties derived from it.
    async fn dispatch(&self, epoch: Epoch, slot: Slot) {
        let mut batch = CommitteeDuty::new(slot);

        for info in self.ctx.duty_store.attester.committee_slot_duties(epoch, slot) {
            batch.duties.push(Duty {
                role: BeaconRole::Attester,
                slot,
                epoch,
                validator_index: info.validator_index,
                committee_index: info.committee_index,
                committee_length: info.committee_length,
                committee_position: info.validator_committee_index,
                pubkey: info.pubkey,
                stopped: false,
            });
        }
        for info in self.ctx.duty_store.sync_committee.epoch_duties(epoch) {
            batch.duties.push(Duty {
                role: BeaconRole::SyncCommittee,
                slot,
                epoch,
                validator_index: info.validator_index,
                committee_index: 0,
                committee_length: 0,
                committee_position: 0,
                pubkey: info.pubkey,
                stopped: false,
            });
        }

        if batch.is_empty() {
            return;
        }
        debug!(slot, duties = batch.duties.len(), "dispatching committee duty");

        // Aggregation duties ride along; selection proofs decide in the
        // runner whether this validator actually aggregates.
        for duty in &batch.duties {
            let role = match duty.role {
                BeaconRole::Attester => BeaconRole::Aggregator,
                BeaconRole::SyncCommittee => BeaconRole::SyncCommitteeContribution,
                _ => continue,
            };
            let mut side_duty = duty.clone();
            side_duty.role = role;
            self.ctx.executor.execute_duty(side_duty).await;
        }

        self.ctx.executor.execute_committee_duty(batch).await;
    }
}
