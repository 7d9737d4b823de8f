//! Committee runner flow: decided value → partial signatures → quorum →
//! reconstruction → bulk submission.

use async_trait::async_trait;
use dv_beacon::{
    AttestationDataCache, AttesterDutyInfo, BeaconClient, BeaconError, BeaconEvent,
    ProposerDutyInfo, SyncDutyInfo,
};
use dv_qbft::{Controller, ControllerConfig, DecidedEvent, InstanceConfig};
use dv_runner::{CommitteeRunner, LocalShareSigner, RunnerBase, ShareSigner};
use dv_storage::MemDb;
use dv_types::test_utils::test_committee;
use dv_types::{
    compute_signing_root, Attestation, AttestationData, BeaconBlock, BeaconRole, BeaconVote,
    BlsSignature, Checkpoint, CommitteeDuty, Domain, DomainType, Duty, Epoch, Hash, MessageKind,
    Network, NetworkConfig, NetworkError, PartialSignatureKind, PartialSignatureMessage,
    PartialSignatureMessages, PeerId, QbftMessage, SignedAggregateAndProof, SignedBeaconBlock,
    SignedContributionAndProof, SignedQbftMessage, SignedValidatorRegistration,
    SignedVoluntaryExit, Slot, SyncCommitteeContribution, SyncCommitteeMessage, ValidatorIndex,
    DOMAIN_ATTESTER, DOMAIN_SYNC_COMMITTEE,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct MockBeacon {
    attestations: Mutex<Vec<Attestation>>,
    sync_messages: Mutex<Vec<SyncCommitteeMessage>>,
}

#[async_trait]
impl BeaconClient for MockBeacon {
    async fn attester_duties(
        &self,
        _: Epoch,
        _: &[ValidatorIndex],
    ) -> Result<Vec<AttesterDutyInfo>, BeaconError> {
        Ok(Vec::new())
    }

    async fn proposer_duties(&self, _: Epoch) -> Result<Vec<ProposerDutyInfo>, BeaconError> {
        Ok(Vec::new())
    }

    async fn sync_committee_duties(
        &self,
        _: Epoch,
        _: &[ValidatorIndex],
    ) -> Result<Vec<SyncDutyInfo>, BeaconError> {
        Ok(Vec::new())
    }

    async fn attestation_data(&self, slot: Slot) -> Result<AttestationData, BeaconError> {
        Ok(AttestationData {
            slot,
            index: 0,
            beacon_block_root: Hash::digest(b"head"),
            source: Checkpoint {
                epoch: 9,
                root: Hash::digest(b"source"),
            },
            target: Checkpoint {
                epoch: 10,
                root: Hash::digest(b"target"),
            },
        })
    }

    async fn submit_attestations(&self, atts: Vec<Attestation>) -> Result<(), BeaconError> {
        self.attestations.lock().extend(atts);
        Ok(())
    }

    async fn submit_sync_committee_messages(
        &self,
        msgs: Vec<SyncCommitteeMessage>,
    ) -> Result<(), BeaconError> {
        self.sync_messages.lock().extend(msgs);
        Ok(())
    }

    async fn domain_data(&self, _: Epoch, domain_type: DomainType) -> Result<Domain, BeaconError> {
        let mut domain = [0u8; 32];
        domain[..4].copy_from_slice(&domain_type);
        Ok(domain)
    }

    async fn produce_block(&self, _: Slot, _: BlsSignature) -> Result<BeaconBlock, BeaconError> {
        Err(BeaconError::Rejected("unused".into()))
    }

    async fn submit_block(&self, _: SignedBeaconBlock) -> Result<(), BeaconError> {
        Ok(())
    }

    async fn aggregate_attestation(&self, _: Slot, _: Hash) -> Result<Attestation, BeaconError> {
        Err(BeaconError::Rejected("unused".into()))
    }

    async fn submit_aggregates(&self, _: Vec<SignedAggregateAndProof>) -> Result<(), BeaconError> {
        Ok(())
    }

    async fn sync_committee_contribution(
        &self,
        _: Slot,
        _: u64,
        _: Hash,
    ) -> Result<SyncCommitteeContribution, BeaconError> {
        Err(BeaconError::Rejected("unused".into()))
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

    fn subscribe_events(&self) -> mpsc::Receiver<BeaconEvent> {
        mpsc::channel(1).1
    }
}

#[derive(Default)]
struct MockNetwork {
    broadcasts: Mutex<Vec<(String, Vec<u8>)>>,
}

impl Network for MockNetwork {
    fn broadcast(&self, topic: &str, data: Vec<u8>) -> Result<(), NetworkError> {
        self.broadcasts.lock().push((topic.to_string(), data));
        Ok(())
    }

    fn subscribe(&self, _: &str) -> mpsc::Receiver<(PeerId, Vec<u8>)> {
        mpsc::channel(1).1
    }

    fn peers(&self) -> Vec<PeerId> {
        Vec::new()
    }

    fn peers_by_topic(&self) -> HashMap<String, Vec<PeerId>> {
        HashMap::new()
    }
}

const SLOT: Slot = 320;

#[tokio::test]
async fn committee_duty_submits_reconstructed_signatures() {
    let fixture = test_committee(&[1, 2, 3, 4]);
    let our_share = Arc::new(fixture.share_for(1));
    let beacon = Arc::new(MockBeacon::default());
    let network = Arc::new(MockNetwork::default());
    let cache = Arc::new(AttestationDataCache::new(beacon.clone()));
    let shutdown = CancellationToken::new();

    let mut signer = LocalShareSigner::new();
    signer.add_share(fixture.validator_pubkey(), fixture.share_keys[&1].clone());
    let signer: Arc<dyn ShareSigner> = Arc::new(signer);

    let instance_config = InstanceConfig {
        share: our_share.clone(),
        signer: Arc::new(fixture.share_keys[&1].clone()),
        domain: fixture.domain,
        value_check: Arc::new(|_, _: &[u8]| Ok(())),
    };
    let (decided_tx, _decided_rx) = mpsc::channel(8);
    let (controller, _join) = Controller::spawn(
        ControllerConfig::new(fixture.message_id(), instance_config),
        dv_qbft::QbftStore::new(Arc::new(MemDb::new())),
        network.clone(),
        decided_tx,
        shutdown.clone(),
    );

    let base = RunnerBase {
        role: BeaconRole::Attester,
        network_config: NetworkConfig::mainnet(),
        message_id: fixture.message_id(),
        cluster_share: our_share.clone(),
        signer,
        network: network.clone(),
        beacon: beacon.clone(),
        controller,
    };
    let shares: HashMap<_, _> = [(1u64, our_share.clone())].into_iter().collect();
    let mut runner = CommitteeRunner::new(base, shares, cache);

    // One attester duty plus one sync-committee duty for the same validator.
    let mut duty = CommitteeDuty::new(SLOT);
    duty.duties.push(Duty {
        role: BeaconRole::Attester,
        slot: SLOT,
        epoch: 10,
        validator_index: 1,
        committee_index: 7,
        committee_length: 64,
        committee_position: 3,
        pubkey: fixture.validator_pubkey(),
        stopped: false,
    });
    duty.duties.push(Duty {
        role: BeaconRole::SyncCommittee,
        slot: SLOT,
        epoch: 10,
        validator_index: 1,
        committee_index: 0,
        committee_length: 0,
        committee_position: 0,
        pubkey: fixture.validator_pubkey(),
        stopped: false,
    });
    runner.execute_duty(duty).await.unwrap();

    // Simulate the controller deciding the vote the beacon data implies.
    let vote = BeaconVote {
        block_root: Hash::digest(b"head"),
        source: Checkpoint {
            epoch: 9,
            root: Hash::digest(b"source"),
        },
        target: Checkpoint {
            epoch: 10,
            root: Hash::digest(b"target"),
        },
    };
    let decided_msg = SignedQbftMessage::sign(
        QbftMessage::new(
            MessageKind::Commit,
            SLOT,
            1,
            fixture.message_id(),
            vote.encode(),
        ),
        1,
        &fixture.share_keys[&1],
        fixture.domain,
    );
    runner
        .on_decided(DecidedEvent {
            identifier: fixture.message_id(),
            height: SLOT,
            round: 1,
            value: vote.encode(),
            decided_message: decided_msg,
        })
        .await
        .unwrap();

    // Nothing submitted yet: only our own partial is in.
    assert!(beacon.attestations.lock().is_empty());

    // Peers 2 and 3 deliver their partials over both signing roots.
    let mut attester_domain = [0u8; 32];
    attester_domain[..4].copy_from_slice(&DOMAIN_ATTESTER);
    let mut sync_domain = [0u8; 32];
    sync_domain[..4].copy_from_slice(&DOMAIN_SYNC_COMMITTEE);

    let att_data = AttestationData {
        slot: SLOT,
        index: 7,
        beacon_block_root: vote.block_root,
        source: vote.source,
        target: vote.target,
    };
    let att_root = compute_signing_root(att_data.tree_root(), attester_domain);
    let sync_root = compute_signing_root(vote.block_root, sync_domain);

    for peer in [2u64, 3] {
        let key = &fixture.share_keys[&peer];
        let batch = PartialSignatureMessages {
            kind: PartialSignatureKind::PostConsensus,
            slot: SLOT,
            messages: vec![
                PartialSignatureMessage {
                    partial_signature: key.sign(att_root.as_bytes()),
                    signing_root: att_root,
                    signer: peer,
                    validator_index: 1,
                },
                PartialSignatureMessage {
                    partial_signature: key.sign(sync_root.as_bytes()),
                    signing_root: sync_root,
                    signer: peer,
                    validator_index: 1,
                },
            ],
        };
        runner.on_partial_signatures(batch).await.unwrap();
    }

    // 3-of-4 partials per root: both objects reconstructed and submitted.
    let attestations = beacon.attestations.lock();
    assert_eq!(attestations.len(), 1);
    let attestation = &attestations[0];
    assert_eq!(attestation.data.index, 7);
    assert!(attestation.aggregation_bits.is_set(3));
    assert!(fixture
        .validator_pubkey()
        .verify(att_root.as_bytes(), &attestation.signature));

    let sync_messages = beacon.sync_messages.lock();
    assert_eq!(sync_messages.len(), 1);
    assert!(fixture
        .validator_pubkey()
        .verify(sync_root.as_bytes(), &sync_messages[0].signature));

    assert!(!runner.has_running_duty());
    shutdown.cancel();
}
