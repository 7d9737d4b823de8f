//! Slot-keyed attestation-data cache.
//!
//! The beacon node returns identical attestation data to every caller for a
//! given slot; only the `index` field is a local tag. The cache serves reads
//! from many runners while guaranteeing that concurrent cold reads for the
//! same slot share at most one network call: requests for a slot serialize
//! on a striped lock and re-check the cache after acquiring it.

use crate::client::{BeaconClient, BeaconError};
use dv_types::{AttestationData, CommitteeIndex, Slot};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Number of request-lock stripes; slots map to stripes by modulo.
const LOCK_STRIPES: usize = 32;

/// How many recent slots the pruner retains (5 epochs on mainnet).
const RETAIN_EPOCHS: u64 = 5;

/// Pruner cadence.
const PRUNE_INTERVAL: Duration = Duration::from_secs(600);

/// Deduplicating cache in front of `attestation_data`.
pub struct AttestationDataCache {
    client: Arc<dyn BeaconClient>,
    cache: RwLock<HashMap<Slot, AttestationData>>,
    request_locks: Vec<Mutex<()>>,
    /// Highest slot fetched; only needs to grow over time so the pruner
    /// knows what is stale.
    recent_slot: AtomicU64,
}

impl AttestationDataCache {
    pub fn new(client: Arc<dyn BeaconClient>) -> Self {
        AttestationDataCache {
            client,
            cache: RwLock::new(HashMap::new()),
            request_locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            recent_slot: AtomicU64::new(0),
        }
    }

    /// Attestation data for `slot`, fetched at most once per slot no matter
    /// how many runners ask concurrently. The returned copy carries the
    /// caller's `committee_index` and must be treated read-only.
    pub async fn get_or_fetch(
        &self,
        slot: Slot,
        committee_index: CommitteeIndex,
    ) -> Result<AttestationData, BeaconError> {
        if let Some(data) = self.cache.read().get(&slot) {
            return Ok(tagged_copy(data, committee_index));
        }

        // Cold path: requests for the same slot serialize on one stripe.
        let stripe = &self.request_locks[(slot as usize) % LOCK_STRIPES];
        let _guard = stripe.lock().await;

        // Someone may have fetched while we waited for the stripe.
        if let Some(data) = self.cache.read().get(&slot) {
            return Ok(tagged_copy(data, committee_index));
        }

        let data = self.client.attestation_data(slot).await?;
        self.cache.write().insert(slot, data.clone());
        self.recent_slot.fetch_max(slot, Ordering::Relaxed);

        Ok(tagged_copy(&data, committee_index))
    }

    /// Entries cached right now (for tests and metrics).
    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }

    fn prune(&self, slots_per_epoch: u64) {
        let retain = RETAIN_EPOCHS * slots_per_epoch;
        let recent = self.recent_slot.load(Ordering::Relaxed);
        let cutoff = recent.saturating_sub(retain);
        let mut cache = self.cache.write();
        let before = cache.len();
        cache.retain(|slot, _| *slot >= cutoff);
        if cache.len() != before {
            debug!(
                removed = before - cache.len(),
                cutoff, "pruned stale attestation data"
            );
        }
    }

    /// Spawn the background pruner; it deletes entries older than five
    /// epochs every ten minutes until `shutdown` is cancelled.
    pub fn spawn_pruner(
        self: Arc<Self>,
        slots_per_epoch: u64,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => cache.prune(slots_per_epoch),
                }
            }
        })
    }
}

/// Shallow copy with the caller's committee index.
fn tagged_copy(data: &AttestationData, committee_index: CommitteeIndex) -> AttestationData {
    let mut copy = data.clone();
    copy.index = committee_index;
    copy
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dv_types::{
        Attestation, BeaconBlock, BlsSignature, Checkpoint, Domain, DomainType, Epoch, Hash,
        SignedAggregateAndProof, SignedBeaconBlock, SignedContributionAndProof,
        SignedValidatorRegistration, SignedVoluntaryExit, SyncCommitteeContribution,
        SyncCommitteeMessage, ValidatorIndex,
    };
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    /// Client stub that counts `attestation_data` calls.
    struct CountingClient {
        calls: AtomicUsize,
    }

    impl CountingClient {
        fn new() -> Self {
            CountingClient {
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl BeaconClient for CountingClient {
        async fn attester_duties(
            &self,
            _: Epoch,
            _: &[ValidatorIndex],
        ) -> Result<Vec<crate::AttesterDutyInfo>, BeaconError> {
            Ok(Vec::new())
        }

        async fn proposer_duties(&self, _: Epoch) -> Result<Vec<crate::ProposerDutyInfo>, BeaconError> {
            Ok(Vec::new())
        }

        async fn sync_committee_duties(
            &self,
            _: Epoch,
            _: &[ValidatorIndex],
        ) -> Result<Vec<crate::SyncDutyInfo>, BeaconError> {
            Ok(Vec::new())
        }

        async fn attestation_data(&self, slot: Slot) -> Result<AttestationData, BeaconError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Simulate request latency so concurrent callers pile up.
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(AttestationData {
                slot,
                index: 0,
                beacon_block_root: Hash::digest(b"head"),
                source: Checkpoint {
                    epoch: 5,
                    root: Hash::digest(b"source"),
                },
                target: Checkpoint {
                    epoch: 6,
                    root: Hash::digest(b"target"),
                },
            })
        }

        async fn submit_attestations(&self, _: Vec<Attestation>) -> Result<(), BeaconError> {
            Ok(())
        }

        async fn submit_sync_committee_messages(
            &self,
            _: Vec<SyncCommitteeMessage>,
        ) -> Result<(), BeaconError> {
            Ok(())
        }

        async fn domain_data(&self, _: Epoch, _: DomainType) -> Result<Domain, BeaconError> {
            Ok([0u8; 32])
        }

        async fn produce_block(
            &self,
            _: Slot,
            _: BlsSignature,
        ) -> Result<BeaconBlock, BeaconError> {
            Err(BeaconError::Rejected("not implemented".into()))
        }

        async fn submit_block(&self, _: SignedBeaconBlock) -> Result<(), BeaconError> {
            Ok(())
        }

        async fn aggregate_attestation(
            &self,
            _: Slot,
            _: Hash,
        ) -> Result<Attestation, BeaconError> {
            Err(BeaconError::Rejected("not implemented".into()))
        }

        async fn submit_aggregates(
            &self,
            _: Vec<SignedAggregateAndProof>,
        ) -> Result<(), BeaconError> {
            Ok(())
        }

        async fn sync_committee_contribution(
            &self,
            _: Slot,
            _: u64,
            _: Hash,
        ) -> Result<SyncCommitteeContribution, BeaconError> {
            Err(BeaconError::Rejected("not implemented".into()))
        }

        async fn submit_contributions(
            &self,
            _: Vec<SignedContributionAndProof>,
        ) -> Result<(), BeaconError> {
            Ok(())
        }

        async fn submit_registrations(
            &self,
            _: Vec<SignedValidatorRegistration>,
        ) -> Result<(), BeaconError> {
            Ok(())
        }

        async fn submit_voluntary_exit(&self, _: SignedVoluntaryExit) -> Result<(), BeaconError> {
            Ok(())
        }

        fn subscribe_events(&self) -> mpsc::Receiver<crate::BeaconEvent> {
            mpsc::channel(1).1
        }
    }

    #[tokio::test]
    async fn stampede_results_in_one_fetch() {
        let client = Arc::new(CountingClient::new());
        let cache = Arc::new(AttestationDataCache::new(client.clone()));

        let mut handles = Vec::new();
        for i in 0..100u64 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache.get_or_fetch(200, i % 64).await.unwrap()
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        // Same data everywhere, only the local index differs.
        for (i, data) in results.iter().enumerate() {
            assert_eq!(data.slot, 200);
            assert_eq!(data.index, (i as u64) % 64);
            assert_eq!(data.beacon_block_root, results[0].beacon_block_root);
            assert_eq!(data.source, results[0].source);
            assert_eq!(data.target, results[0].target);
        }
    }

    #[tokio::test]
    async fn warm_reads_skip_the_network() {
        let client = Arc::new(CountingClient::new());
        let cache = AttestationDataCache::new(client.clone());

        cache.get_or_fetch(300, 1).await.unwrap();
        cache.get_or_fetch(300, 2).await.unwrap();
        cache.get_or_fetch(300, 3).await.unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);

        cache.get_or_fetch(301, 1).await.unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn pruner_drops_stale_slots() {
        let client = Arc::new(CountingClient::new());
        let cache = AttestationDataCache::new(client);

        cache.get_or_fetch(10, 0).await.unwrap();
        cache.get_or_fetch(1000, 0).await.unwrap();
        assert_eq!(cache.len(), 2);

        // With 32-slot epochs the retain window is 160 slots below 1000.
        cache.prune(32);
        assert_eq!(cache.len(), 1);
        // Slot 1000 survives, slot 10 is gone: a fresh read refetches.
        assert!(cache.cache.read().contains_key(&1000));
        assert!(!cache.cache.read().contains_key(&10));
    }
}
