//! In-memory duty store with epoch-level eviction.

use dv_beacon::{AttesterDutyInfo, ProposerDutyInfo, SyncDutyInfo};
use dv_types::{Epoch, Slot, ValidatorIndex};
use parking_lot::RwLock;
use std::collections::HashMap;

/// One stored duty with its committee membership flag.
#[derive(Debug, Clone)]
pub struct DutyDescriptor<D> {
    pub slot: Slot,
    pub validator_index: ValidatorIndex,
    pub duty: D,
    pub in_committee: bool,
}

/// Nested mapping `epoch → slot → validator → descriptor` for one duty
/// kind. Readers (the handlers, every slot) dominate writers (epoch
/// refresh), hence the reader-writer lock.
#[derive(Debug)]
pub struct Duties<D> {
    map: RwLock<HashMap<Epoch, HashMap<Slot, HashMap<ValidatorIndex, DutyDescriptor<D>>>>>,
}

impl<D> Default for Duties<D> {
    fn default() -> Self {
        Duties {
            map: RwLock::new(HashMap::new()),
        }
    }
}

impl<D: Clone> Duties<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored duties for an epoch.
    pub fn set_epoch(&self, epoch: Epoch, descriptors: Vec<DutyDescriptor<D>>) {
        let mut map = self.map.write();
        let epoch_map: &mut HashMap<_, HashMap<_, _>> = map.entry(epoch).or_default();
        epoch_map.clear();
        for descriptor in descriptors {
            epoch_map
                .entry(descriptor.slot)
                .or_default()
                .insert(descriptor.validator_index, descriptor);
        }
    }

    /// Drop everything stored for an epoch.
    pub fn reset_epoch(&self, epoch: Epoch) {
        self.map.write().remove(&epoch);
    }

    /// Duties at `(epoch, slot)` whose validators are in-committee.
    pub fn committee_slot_duties(&self, epoch: Epoch, slot: Slot) -> Vec<D> {
        let map = self.map.read();
        let Some(slot_map) = map.get(&epoch).and_then(|m| m.get(&slot)) else {
            return Vec::new();
        };
        slot_map
            .values()
            .filter(|d| d.in_committee)
            .map(|d| d.duty.clone())
            .collect()
    }

    /// The duty of one validator at `(epoch, slot)`.
    pub fn validator_duty(
        &self,
        epoch: Epoch,
        slot: Slot,
        validator_index: ValidatorIndex,
    ) -> Option<D> {
        self.map
            .read()
            .get(&epoch)?
            .get(&slot)?
            .get(&validator_index)
            .map(|d| d.duty.clone())
    }

    /// Whether any duties are stored for the epoch.
    pub fn has_epoch(&self, epoch: Epoch) -> bool {
        self.map.read().contains_key(&epoch)
    }
}

/// Sync-committee duties are stable for a whole epoch span, so they are
/// stored per epoch rather than per slot.
#[derive(Debug, Default)]
pub struct SyncDuties {
    map: RwLock<HashMap<Epoch, HashMap<ValidatorIndex, SyncDutyInfo>>>,
}

impl SyncDuties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_epoch(&self, epoch: Epoch, duties: Vec<SyncDutyInfo>) {
        let mut map = self.map.write();
        let epoch_map = map.entry(epoch).or_default();
        epoch_map.clear();
        for duty in duties {
            epoch_map.insert(duty.validator_index, duty);
        }
    }

    pub fn reset_epoch(&self, epoch: Epoch) {
        self.map.write().remove(&epoch);
    }

    /// Every sync-committee duty active in the epoch.
    pub fn epoch_duties(&self, epoch: Epoch) -> Vec<SyncDutyInfo> {
        self.map
            .read()
            .get(&epoch)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_epoch(&self, epoch: Epoch) -> bool {
        self.map.read().contains_key(&epoch)
    }
}

/// All duty kinds the scheduler tracks.
#[derive(Debug, Default)]
pub struct DutyStore {
    pub attester: Duties<AttesterDutyInfo>,
    pub proposer: Duties<ProposerDutyInfo>,
    pub sync_committee: SyncDuties,
}

impl DutyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evict every kind's records for the epoch.
    pub fn reset_epoch(&self, epoch: Epoch) {
        self.attester.reset_epoch(epoch);
        self.proposer.reset_epoch(epoch);
        self.sync_committee.reset_epoch(epoch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dv_types::test_utils::test_pubkey;

    fn descriptor(slot: Slot, index: ValidatorIndex, in_committee: bool) -> DutyDescriptor<AttesterDutyInfo> {
        DutyDescriptor {
            slot,
            validator_index: index,
            duty: AttesterDutyInfo {
                pubkey: test_pubkey(),
                validator_index: index,
                slot,
                committee_index: 3,
                committee_length: 128,
                validator_committee_index: 7,
            },
            in_committee,
        }
    }

    #[test]
    fn committee_slot_duties_filters_membership() {
        let duties = Duties::new();
        duties.set_epoch(
            5,
            vec![
                descriptor(160, 1, true),
                descriptor(160, 2, false),
                descriptor(161, 3, true),
            ],
        );

        let at_160 = duties.committee_slot_duties(5, 160);
        assert_eq!(at_160.len(), 1);
        assert_eq!(at_160[0].validator_index, 1);
        assert!(duties.committee_slot_duties(5, 162).is_empty());
        assert!(duties.committee_slot_duties(6, 160).is_empty());
    }

    #[test]
    fn validator_duty_lookup() {
        let duties = Duties::new();
        duties.set_epoch(5, vec![descriptor(160, 1, true)]);
        assert!(duties.validator_duty(5, 160, 1).is_some());
        assert!(duties.validator_duty(5, 160, 2).is_none());
    }

    #[test]
    fn set_epoch_replaces_and_reset_evicts() {
        let duties = Duties::new();
        duties.set_epoch(5, vec![descriptor(160, 1, true)]);
        duties.set_epoch(5, vec![descriptor(161, 2, true)]);
        assert!(duties.committee_slot_duties(5, 160).is_empty());
        assert_eq!(duties.committee_slot_duties(5, 161).len(), 1);

        duties.reset_epoch(5);
        assert!(!duties.has_epoch(5));
    }
}
