//! Network configuration.
//!
//! Everything slot-math and domain related flows from this struct; it is
//! threaded through constructors rather than held in process-global state.

use crate::beacon::{Domain, DomainType};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-network constants: genesis anchoring, slot arithmetic, the consensus
/// message domain, and registry coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    /// Unix seconds of slot 0.
    pub genesis_time: u64,
    pub slot_duration: Duration,
    pub slots_per_epoch: u64,
    /// 4-byte domain tag for consensus messages on this network.
    pub domain_type: DomainType,
    pub registry_contract_addr: String,
    pub bootnodes: Vec<String>,
}

impl NetworkConfig {
    pub fn mainnet() -> Self {
        NetworkConfig {
            name: "mainnet".into(),
            genesis_time: 1_606_824_023,
            slot_duration: Duration::from_secs(12),
            slots_per_epoch: 32,
            domain_type: [0x00, 0x00, 0x30, 0x01],
            registry_contract_addr: "0xDD9BC35aE942eF0cFa76930954a156B3fF30a4E1".into(),
            bootnodes: vec![
                "enr:-Li4QHEPYASj5ZY3BXXKXAoWcoIw0ChgUlTtfOSxgNlYxlmpEWUR".into(),
                "enr:-Li4QDwrOuhEq5gBJBzFUPkezoYiy56SXZUwkSD7bxYo8RAhPnHyS".into(),
            ],
        }
    }

    pub fn holesky() -> Self {
        NetworkConfig {
            name: "holesky".into(),
            genesis_time: 1_695_902_400,
            slot_duration: Duration::from_secs(12),
            slots_per_epoch: 32,
            domain_type: [0x00, 0x00, 0x50, 0x02],
            registry_contract_addr: "0x38A4794cCEd47d3baf7370CcC43B560D3a1beEFA".into(),
            bootnodes: vec!["enr:-Li4QFIQzamdvTxGJhvcXG_DFmCeyggSffDnllY5DiU47pd_K_1MRnSaJimWtfKJ".into()],
        }
    }

    pub fn epoch_at_slot(&self, slot: u64) -> u64 {
        slot / self.slots_per_epoch
    }

    pub fn first_slot_of_epoch(&self, epoch: u64) -> u64 {
        epoch * self.slots_per_epoch
    }

    pub fn last_slot_of_epoch(&self, epoch: u64) -> u64 {
        self.first_slot_of_epoch(epoch + 1) - 1
    }

    /// Full 32-byte signing domain for consensus messages: the 4-byte domain
    /// type zero-extended (fork data does not apply to operator messages).
    pub fn message_domain(&self) -> Domain {
        let mut domain = [0u8; 32];
        domain[..4].copy_from_slice(&self.domain_type);
        domain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_epoch_arithmetic() {
        let cfg = NetworkConfig::mainnet();
        assert_eq!(cfg.epoch_at_slot(0), 0);
        assert_eq!(cfg.epoch_at_slot(31), 0);
        assert_eq!(cfg.epoch_at_slot(32), 1);
        assert_eq!(cfg.first_slot_of_epoch(3), 96);
        assert_eq!(cfg.last_slot_of_epoch(3), 127);
    }

    #[test]
    fn domains_differ_between_networks() {
        assert_ne!(
            NetworkConfig::mainnet().message_domain(),
            NetworkConfig::holesky().message_domain()
        );
    }
}
