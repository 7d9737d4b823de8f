//! Single-decision QBFT instance state machine.
//!
//! The instance is synchronous and performs no I/O: every inbound message or
//! timer fire is handled on the controller task and produces a list of
//! [`Action`]s (messages to broadcast, timers to arm, the decided value).
//! The controller executes the actions and loops self-broadcast messages
//! back through the instance, mirroring gossip loopback.

use crate::container::MessageContainer;
use crate::error::QbftError;
use dv_types::{
    BlsPublicKey, BlsSecretKey, Domain, Height, MessageId, MessageKind, OperatorId, QbftMessage,
    Round, Share, SignedQbftMessage,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Predicate applied to every proposed value before it is accepted. The
/// height (the duty slot) is passed so checks can reason about timing.
pub type ValueCheck = Arc<dyn Fn(Height, &[u8]) -> Result<(), String> + Send + Sync>;

/// What an instance wants the controller to do after processing one input.
#[derive(Debug, Clone)]
pub enum Action {
    /// Gossip a signed message (and loop it back into this instance).
    Broadcast(SignedQbftMessage),
    /// Arm the round timer for the given round.
    ScheduleTimeout { round: Round },
    /// Stop the round timer.
    StopTimer,
    /// The instance decided; the payload is the aggregated commit message.
    Decide(SignedQbftMessage),
}

/// Instance lifecycle stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    NotStarted,
    Preprepare,
    Prepare,
    Commit,
    Decided,
    Stopped,
}

/// The serializable core of an instance, persisted on decide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceState {
    pub identifier: MessageId,
    pub height: Height,
    pub round: Round,
    pub stage: Stage,
    pub input_value: Vec<u8>,
    pub prepared_round: Option<Round>,
    pub prepared_value: Option<Vec<u8>>,
    pub decided_value: Option<Vec<u8>>,
    pub proposal_accepted_for_round: Option<Round>,
}

/// Static inputs shared by every instance of one consensus stream.
#[derive(Clone)]
pub struct InstanceConfig {
    /// This operator's view of the cluster (committee, own operator id).
    pub share: Arc<Share>,
    /// The operator's share key, used to sign consensus messages.
    pub signer: Arc<BlsSecretKey>,
    pub domain: Domain,
    pub value_check: ValueCheck,
}

/// A single QBFT decision at one height.
pub struct Instance {
    config: InstanceConfig,
    state: InstanceState,
    /// The proposal accepted for the current round, if any.
    accepted_proposal: Option<QbftMessage>,
    /// Guards against re-broadcasting commit/proposal within a round.
    commit_sent_for_round: Option<Round>,
    proposal_sent_for_round: Option<Round>,
    preprepares: MessageContainer,
    prepares: MessageContainer,
    commits: MessageContainer,
    round_changes: MessageContainer,
    decided_message: Option<SignedQbftMessage>,
}

impl Instance {
    pub fn new(config: InstanceConfig, identifier: MessageId, height: Height) -> Self {
        Instance {
            config,
            state: InstanceState {
                identifier,
                height,
                round: 1,
                stage: Stage::NotStarted,
                input_value: Vec::new(),
                prepared_round: None,
                prepared_value: None,
                decided_value: None,
                proposal_accepted_for_round: None,
            },
            accepted_proposal: None,
            commit_sent_for_round: None,
            proposal_sent_for_round: None,
            preprepares: MessageContainer::new(),
            prepares: MessageContainer::new(),
            commits: MessageContainer::new(),
            round_changes: MessageContainer::new(),
            decided_message: None,
        }
    }

    pub fn state(&self) -> &InstanceState {
        &self.state
    }

    pub fn height(&self) -> Height {
        self.state.height
    }

    pub fn current_round(&self) -> Round {
        self.state.round
    }

    pub fn is_decided(&self) -> bool {
        self.state.stage == Stage::Decided
    }

    pub fn decided_value(&self) -> Option<&[u8]> {
        self.state.decided_value.as_deref()
    }

    pub fn decided_message(&self) -> Option<&SignedQbftMessage> {
        self.decided_message.as_ref()
    }

    fn operator_id(&self) -> OperatorId {
        self.config.share.operator_id
    }

    /// Leader rotation: position `(height + round - 1) mod n` in the ordered
    /// committee.
    pub fn leader_of(&self, round: Round) -> OperatorId {
        let n = self.config.share.committee.size() as u64;
        let position = (self.state.height.wrapping_add(round).wrapping_sub(1)) % n;
        self.config
            .share
            .committee
            .member_at(position as usize)
            .operator_id
    }

    fn is_leader(&self, round: Round) -> bool {
        self.leader_of(round) == self.operator_id()
    }

    /// Begin consensus on `input_value`. The round-1 leader proposes; every
    /// operator arms the round-1 timer.
    pub fn start(&mut self, input_value: Vec<u8>) -> Result<Vec<Action>, QbftError> {
        if self.state.stage != Stage::NotStarted {
            return Err(QbftError::InvalidMessage("instance already started"));
        }
        self.state.input_value = input_value;

        let mut actions = vec![Action::ScheduleTimeout { round: 1 }];
        if self.is_leader(1) {
            (self.config.value_check)(self.state.height, &self.state.input_value)
                .map_err(QbftError::InvalidValue)?;
            self.state.stage = Stage::Preprepare;
            self.proposal_sent_for_round = Some(1);
            let proposal = QbftMessage::new(
                MessageKind::Preprepare,
                self.state.height,
                1,
                self.state.identifier,
                self.state.input_value.clone(),
            );
            debug!(
                height = self.state.height,
                operator = self.operator_id(),
                "proposing as round-1 leader"
            );
            actions.push(Action::Broadcast(self.sign(proposal)));
        }
        Ok(actions)
    }

    /// Externally requested stop; the instance absorbs nothing further.
    pub fn stop(&mut self) {
        if self.state.stage != Stage::Decided {
            self.state.stage = Stage::Stopped;
        }
    }

    /// Process one inbound signed message through the validation pipeline
    /// and the stage transitions.
    pub fn process_message(
        &mut self,
        signed: &SignedQbftMessage,
    ) -> Result<Vec<Action>, QbftError> {
        if self.state.stage == Stage::Stopped {
            return Ok(Vec::new());
        }
        self.validate(signed)?;

        match signed.message.kind {
            MessageKind::Preprepare => self.on_preprepare(signed),
            MessageKind::Prepare => self.on_prepare(signed),
            MessageKind::Commit => self.on_commit(signed),
            MessageKind::RoundChange => self.on_round_change(signed),
        }
    }

    /// Round timer fired. Stale fires (round moved on, instance finished)
    /// are dropped.
    pub fn on_timeout(&mut self, round: Round) -> Result<Vec<Action>, QbftError> {
        if matches!(self.state.stage, Stage::Decided | Stage::Stopped) {
            return Ok(Vec::new());
        }
        if round != self.state.round {
            return Ok(Vec::new());
        }

        let new_round = self.state.round + 1;
        info!(
            height = self.state.height,
            from_round = self.state.round,
            to_round = new_round,
            "round timed out"
        );
        self.enter_round(new_round);

        let round_change = self.create_round_change(new_round);
        Ok(vec![
            Action::ScheduleTimeout { round: new_round },
            Action::Broadcast(round_change),
        ])
    }

    // ── validation pipeline ──────────────────────────────────────────────

    fn validate(&self, signed: &SignedQbftMessage) -> Result<(), QbftError> {
        signed.validate_signers()?;
        let msg = &signed.message;
        if msg.identifier != self.state.identifier {
            return Err(QbftError::InvalidMessage("wrong identifier"));
        }
        if msg.height != self.state.height {
            return Err(QbftError::InvalidMessage("wrong height"));
        }
        if msg.round < self.state.round {
            return Err(QbftError::InvalidMessage("message from past round"));
        }
        self.verify_signature(signed)
    }

    fn verify_signature(&self, signed: &SignedQbftMessage) -> Result<(), QbftError> {
        let committee = &self.config.share.committee;
        let mut pubkeys = Vec::with_capacity(signed.signers.len());
        for signer in &signed.signers {
            let member = committee
                .member(*signer)
                .ok_or(QbftError::NotAuthorized { operator: *signer })?;
            pubkeys.push(member.share_pubkey);
        }
        let pubkey = BlsPublicKey::aggregate(&pubkeys).map_err(dv_types::MessageError::Bls)?;
        let root = signed.message.signing_root(self.config.domain);
        if !pubkey.verify(root.as_bytes(), &signed.signature) {
            return Err(QbftError::InvalidMessage("invalid signature"));
        }
        Ok(())
    }

    // ── transitions ──────────────────────────────────────────────────────

    fn on_preprepare(&mut self, signed: &SignedQbftMessage) -> Result<Vec<Action>, QbftError> {
        let msg = &signed.message;
        if !signed.is_single_signer() {
            return Err(QbftError::InvalidMessage("proposal must be single-signer"));
        }
        if signed.signers[0] != self.leader_of(msg.round) {
            return Err(QbftError::InvalidMessage("proposer is not round leader"));
        }

        // The container traps a leader proposing two values in one round.
        self.preprepares.add(signed.clone())?;

        if self.state.proposal_accepted_for_round == Some(msg.round) {
            return Ok(Vec::new());
        }

        if msg.round > 1 {
            self.validate_preprepare_justification(msg)?;
        }
        (self.config.value_check)(self.state.height, &msg.value)
            .map_err(QbftError::InvalidValue)?;

        let mut actions = Vec::new();
        if msg.round > self.state.round {
            // Justified proposal for a higher round catches us up.
            self.enter_round(msg.round);
            actions.push(Action::ScheduleTimeout { round: msg.round });
        }
        self.state.proposal_accepted_for_round = Some(msg.round);
        self.accepted_proposal = Some(msg.clone());
        self.state.stage = Stage::Prepare;

        debug!(
            height = self.state.height,
            round = msg.round,
            proposer = signed.signers[0],
            "accepted proposal"
        );

        let prepare = QbftMessage::new(
            MessageKind::Prepare,
            self.state.height,
            msg.round,
            self.state.identifier,
            msg.value.clone(),
        );
        actions.push(Action::Broadcast(self.sign(prepare)));
        Ok(actions)
    }

    fn on_prepare(&mut self, signed: &SignedQbftMessage) -> Result<Vec<Action>, QbftError> {
        if !signed.is_single_signer() {
            return Err(QbftError::InvalidMessage("prepare must be single-signer"));
        }
        self.prepares.add(signed.clone())?;

        let round = signed.message.round;
        let value = &signed.message.value;
        let (quorum, count, size) =
            self.prepares
                .quorum_for(round, value, &self.config.share.committee);
        if !quorum {
            return Ok(Vec::new());
        }
        if self.commit_sent_for_round == Some(round) {
            return Ok(Vec::new());
        }

        // Prepared state is monotone: never regress to an older round.
        if self.state.prepared_round.map_or(true, |pr| round >= pr) {
            self.state.prepared_round = Some(round);
            self.state.prepared_value = Some(value.clone());
        }
        self.commit_sent_for_round = Some(round);
        if self.state.stage != Stage::Decided {
            self.state.stage = Stage::Commit;
        }

        debug!(
            height = self.state.height,
            round,
            prepares = count,
            committee = size,
            "prepare quorum reached"
        );

        let commit = QbftMessage::new(
            MessageKind::Commit,
            self.state.height,
            round,
            self.state.identifier,
            value.clone(),
        );
        Ok(vec![
            Action::StopTimer,
            Action::Broadcast(self.sign(commit)),
        ])
    }

    fn on_commit(&mut self, signed: &SignedQbftMessage) -> Result<Vec<Action>, QbftError> {
        // Multi-signer commits are decided aggregates; they must carry a
        // quorum on their own.
        if !signed.is_single_signer()
            && !self.config.share.committee.has_quorum(signed.signers.len())
        {
            return Err(QbftError::InvalidMessage(
                "aggregated commit below quorum size",
            ));
        }

        if self.state.stage == Stage::Decided {
            self.absorb_late_commit(signed);
            return Ok(Vec::new());
        }

        self.commits.add(signed.clone())?;

        let round = signed.message.round;
        let value = &signed.message.value;
        let (quorum, count, size) =
            self.commits
                .quorum_for(round, value, &self.config.share.committee);
        if !quorum {
            return Ok(Vec::new());
        }

        self.state.decided_value = Some(value.clone());
        self.state.stage = Stage::Decided;

        let decided = self.aggregate_commits(round, value)?;
        self.decided_message = Some(decided.clone());

        info!(
            height = self.state.height,
            round,
            commits = count,
            committee = size,
            "instance decided"
        );

        Ok(vec![Action::StopTimer, Action::Decide(decided)])
    }

    fn on_round_change(&mut self, signed: &SignedQbftMessage) -> Result<Vec<Action>, QbftError> {
        if !signed.is_single_signer() {
            return Err(QbftError::InvalidMessage("round change must be single-signer"));
        }
        self.validate_round_change_prepared(&signed.message)?;
        self.round_changes.add(signed.clone())?;

        let round = signed.message.round;
        let mut actions = Vec::new();

        // f+1 round changes for a higher round drag a lagging operator
        // forward before its own timer fires.
        if let Some(target) = self.fast_forward_round() {
            self.enter_round(target);
            actions.push(Action::ScheduleTimeout { round: target });
            actions.push(Action::Broadcast(self.create_round_change(target)));
        }

        // The leader of the new round proposes once a full quorum asks for it.
        if self.is_leader(round)
            && round >= self.state.round
            && self.proposal_sent_for_round.map_or(true, |r| round > r)
        {
            let count = self.round_changes.signer_count(round);
            if self.config.share.committee.has_quorum(count) {
                let value = self.choose_round_change_value(round)?;
                (self.config.value_check)(self.state.height, &value)
                    .map_err(QbftError::InvalidValue)?;
                self.proposal_sent_for_round = Some(round);

                let mut proposal = QbftMessage::new(
                    MessageKind::Preprepare,
                    self.state.height,
                    round,
                    self.state.identifier,
                    value,
                );
                proposal.round_change_justification =
                    self.round_changes.by_round(round).to_vec();

                info!(
                    height = self.state.height,
                    round,
                    round_changes = count,
                    "proposing after round-change quorum"
                );
                actions.push(Action::Broadcast(self.sign(proposal)));
            }
        }

        Ok(actions)
    }

    // ── round-change support ─────────────────────────────────────────────

    fn enter_round(&mut self, round: Round) {
        self.state.round = round;
        self.state.proposal_accepted_for_round = None;
        self.accepted_proposal = None;
    }

    /// The smallest round above the current one backed by f+1 distinct
    /// round-change signers, if any.
    fn fast_forward_round(&self) -> Option<Round> {
        self.round_changes
            .rounds_above(self.state.round)
            .into_iter()
            .find(|r| {
                self.config
                    .share
                    .committee
                    .has_partial_quorum(self.round_changes.signer_count(*r))
            })
    }

    /// Pick the proposal value after a round-change quorum: the prepared
    /// value of the highest prepared round among the received round changes,
    /// else this instance's input value.
    fn choose_round_change_value(&self, round: Round) -> Result<Vec<u8>, QbftError> {
        let mut best: Option<(Round, &[u8])> = None;
        for rc in self.round_changes.by_round(round) {
            if let (Some(pr), Some(pv)) =
                (rc.message.prepared_round, rc.message.prepared_value.as_deref())
            {
                if best.map_or(true, |(existing, _)| pr > existing) {
                    best = Some((pr, pv));
                }
            }
        }
        Ok(match best {
            Some((_, value)) => value.to_vec(),
            None => self.state.input_value.clone(),
        })
    }

    fn create_round_change(&mut self, round: Round) -> SignedQbftMessage {
        let mut msg = QbftMessage::new(
            MessageKind::RoundChange,
            self.state.height,
            round,
            self.state.identifier,
            Vec::new(),
        );
        msg.prepared_round = self.state.prepared_round;
        msg.prepared_value = self.state.prepared_value.clone();
        if let (Some(pr), Some(pv)) = (self.state.prepared_round, &self.state.prepared_value) {
            msg.prepare_justification = self
                .prepares
                .by_round_and_value(pr, pv)
                .into_iter()
                .cloned()
                .collect();
        }
        self.sign(msg)
    }

    /// A Preprepare for round > 1 must carry 2f+1 round changes for that
    /// round, and its value must match the highest prepared value among them
    /// if any claimed one.
    fn validate_preprepare_justification(&self, msg: &QbftMessage) -> Result<(), QbftError> {
        let mut signers = std::collections::HashSet::new();
        let mut best: Option<(Round, &[u8])> = None;

        for rc in &msg.round_change_justification {
            if rc.message.kind != MessageKind::RoundChange
                || rc.message.height != self.state.height
                || rc.message.round != msg.round
                || !rc.is_single_signer()
            {
                return Err(QbftError::InvalidMessage("malformed round-change justification"));
            }
            self.verify_signature(rc)?;
            self.validate_round_change_prepared(&rc.message)?;
            signers.insert(rc.signers[0]);
            if let (Some(pr), Some(pv)) =
                (rc.message.prepared_round, rc.message.prepared_value.as_deref())
            {
                if best.map_or(true, |(existing, _)| pr > existing) {
                    best = Some((pr, pv));
                }
            }
        }

        if !self.config.share.committee.has_quorum(signers.len()) {
            return Err(QbftError::InvalidMessage(
                "insufficient round-change justification",
            ));
        }
        if let Some((_, prepared_value)) = best {
            if msg.value != prepared_value {
                return Err(QbftError::InvalidMessage(
                    "proposal ignores highest prepared value",
                ));
            }
        }
        Ok(())
    }

    /// A round change claiming a prepared value must prove it with 2f+1
    /// prepares for that round and value.
    fn validate_round_change_prepared(&self, msg: &QbftMessage) -> Result<(), QbftError> {
        let (prepared_round, prepared_value) = match (&msg.prepared_round, &msg.prepared_value) {
            (None, None) => return Ok(()),
            (Some(pr), Some(pv)) => (*pr, pv),
            _ => return Err(QbftError::InvalidMessage("half-claimed prepared state")),
        };
        if prepared_round >= msg.round {
            return Err(QbftError::InvalidMessage("prepared round not below round"));
        }

        let mut signers = std::collections::HashSet::new();
        for prepare in &msg.prepare_justification {
            if prepare.message.kind != MessageKind::Prepare
                || prepare.message.height != self.state.height
                || prepare.message.round != prepared_round
                || prepare.message.value != *prepared_value
                || !prepare.is_single_signer()
            {
                return Err(QbftError::InvalidMessage("malformed prepare justification"));
            }
            self.verify_signature(prepare)?;
            signers.insert(prepare.signers[0]);
        }
        if !self.config.share.committee.has_quorum(signers.len()) {
            return Err(QbftError::InvalidMessage("insufficient prepare justification"));
        }
        Ok(())
    }

    // ── decided aggregation ──────────────────────────────────────────────

    /// Merge every commit for the decided (round, value) into one signed
    /// message with the union of signer sets.
    fn aggregate_commits(
        &self,
        round: Round,
        value: &[u8],
    ) -> Result<SignedQbftMessage, QbftError> {
        let matching = self.commits.by_round_and_value(round, value);
        let mut iter = matching.into_iter();
        let mut aggregate = iter
            .next()
            .ok_or(QbftError::InvalidMessage("no commits to aggregate"))?
            .clone();
        for msg in iter {
            if let Err(err) = aggregate.aggregate(msg) {
                // Overlapping signer sets can occur when a decided aggregate
                // arrived alongside individual commits; skip those.
                debug!(?err, "skipping commit during aggregation");
            }
        }
        Ok(aggregate)
    }

    /// Commits arriving after the decision grow the recorded signer set
    /// (useful for exporters); they never re-trigger the decide hook.
    fn absorb_late_commit(&mut self, signed: &SignedQbftMessage) {
        if Some(&signed.message.value) != self.state.decided_value.as_ref() {
            warn!(
                height = self.state.height,
                signers = ?signed.signers,
                "late commit for a different value"
            );
            return;
        }
        if let Some(decided) = &mut self.decided_message {
            if let Err(err) = decided.aggregate(signed) {
                debug!(?err, "late commit not absorbed");
            }
        }
    }

    fn sign(&self, message: QbftMessage) -> SignedQbftMessage {
        SignedQbftMessage::sign(
            message,
            self.operator_id(),
            &self.config.signer,
            self.config.domain,
        )
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("height", &self.state.height)
            .field("round", &self.state.round)
            .field("stage", &self.state.stage)
            .finish()
    }
}
