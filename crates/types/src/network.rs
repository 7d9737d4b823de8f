//! The injected P2P boundary.
//!
//! Consensus traffic is gossiped on topics derived from the message
//! identifier; the transport itself (discovery, scoring, the gossip mesh)
//! lives outside this workspace.

use crate::identifiers::MessageId;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Opaque peer identifier as reported by the transport.
pub type PeerId = String;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("broadcast failed: {0}")]
    Broadcast(String),
    #[error("not subscribed to topic {0}")]
    NotSubscribed(String),
}

/// Gossip transport contract.
///
/// `subscribe` hands back a bounded channel; when the node falls behind the
/// transport drops messages rather than buffering without limit.
pub trait Network: Send + Sync {
    fn broadcast(&self, topic: &str, data: Vec<u8>) -> Result<(), NetworkError>;
    fn subscribe(&self, topic: &str) -> mpsc::Receiver<(PeerId, Vec<u8>)>;
    fn peers(&self) -> Vec<PeerId>;
    fn peers_by_topic(&self) -> HashMap<String, Vec<PeerId>>;
}

/// Gossip topic for a consensus stream.
pub fn topic_for(id: &MessageId) -> String {
    format!("dv.consensus.{}", hex::encode(&id.as_bytes()[..16]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::duty::BeaconRole;
    use crate::hash::Hash;

    #[test]
    fn topics_separate_clusters() {
        let domain = [0, 0, 0x30, 0x1];
        let a = MessageId::new(domain, BeaconRole::Attester, Hash::digest(b"cluster-a"));
        let b = MessageId::new(domain, BeaconRole::Attester, Hash::digest(b"cluster-b"));
        assert_ne!(topic_for(&a), topic_for(&b));
    }
}
