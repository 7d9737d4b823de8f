//! QBFT controller: owns instances, routes messages, persists decisions.
//!
//! One controller task runs per consensus stream (cluster × role). Inbound
//! network messages, timer fires and start requests all arrive on a single
//! bounded mailbox and are processed in arrival order — this task is the
//! linearization point for consensus. Instances are owned exclusively by the
//! controller; runners observe decisions through [`DecidedEvent`]s and the
//! `decided` query.

use crate::error::QbftError;
use crate::instance::{Action, Instance, InstanceConfig};
use crate::store::{QbftStore, StoredInstance};
use crate::timer::RoundTimers;
use dv_types::{topic_for, Height, MessageId, Network, Round, SignedQbftMessage, WireMessage};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Commands accepted on the controller mailbox.
#[derive(Debug)]
pub enum ControllerCommand {
    /// Begin consensus at `height` on `input_value`.
    StartInstance { height: Height, input_value: Vec<u8> },
    /// An inbound signed consensus message.
    Message(SignedQbftMessage),
    /// A round timer fired.
    Timeout { height: Height, round: Round },
    /// Query the decided value at a height (memory first, then storage).
    Decided {
        height: Height,
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
    /// Externally stop the instance at a height.
    StopInstance { height: Height },
}

/// Emitted to the owning runner when an instance decides.
#[derive(Debug, Clone)]
pub struct DecidedEvent {
    pub identifier: MessageId,
    pub height: Height,
    pub round: Round,
    pub value: Vec<u8>,
    pub decided_message: SignedQbftMessage,
}

/// Controller configuration.
#[derive(Clone)]
pub struct ControllerConfig {
    pub identifier: MessageId,
    pub instance_config: InstanceConfig,
    /// Mailbox capacity; overflowing peer messages are dropped.
    pub mailbox_capacity: usize,
}

impl ControllerConfig {
    pub fn new(identifier: MessageId, instance_config: InstanceConfig) -> Self {
        ControllerConfig {
            identifier,
            instance_config,
            mailbox_capacity: 1024,
        }
    }
}

/// Cheap handle for talking to a running controller.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<ControllerCommand>,
}

impl ControllerHandle {
    pub async fn start_instance(&self, height: Height, input_value: Vec<u8>) -> bool {
        self.tx
            .send(ControllerCommand::StartInstance {
                height,
                input_value,
            })
            .await
            .is_ok()
    }

    /// Enqueue an inbound peer message without blocking. Returns `false`
    /// when the mailbox is full and the message was shed.
    pub fn try_enqueue(&self, msg: SignedQbftMessage) -> bool {
        self.tx.try_send(ControllerCommand::Message(msg)).is_ok()
    }

    pub async fn process_message(&self, msg: SignedQbftMessage) -> bool {
        self.tx
            .send(ControllerCommand::Message(msg))
            .await
            .is_ok()
    }

    pub async fn decided(&self, height: Height) -> Option<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ControllerCommand::Decided { height, reply })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn stop_instance(&self, height: Height) -> bool {
        self.tx
            .send(ControllerCommand::StopInstance { height })
            .await
            .is_ok()
    }

    pub fn sender(&self) -> mpsc::Sender<ControllerCommand> {
        self.tx.clone()
    }
}

/// The controller task state.
pub struct Controller {
    config: ControllerConfig,
    instances: BTreeMap<Height, Instance>,
    highest_height: Option<Height>,
    store: QbftStore,
    network: Arc<dyn Network>,
    timers: RoundTimers,
    decided_tx: mpsc::Sender<DecidedEvent>,
    rx: mpsc::Receiver<ControllerCommand>,
    shutdown: CancellationToken,
}

impl Controller {
    /// Spawn the controller task. The returned handle feeds its mailbox;
    /// decided events arrive on `decided_tx`. Cancelling `shutdown` stops
    /// the task and releases all timers. Fatal storage errors also cancel
    /// `shutdown`, halting the node's duty pipeline.
    pub fn spawn(
        config: ControllerConfig,
        store: QbftStore,
        network: Arc<dyn Network>,
        decided_tx: mpsc::Sender<DecidedEvent>,
        shutdown: CancellationToken,
    ) -> (ControllerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.mailbox_capacity);
        let controller = Controller {
            timers: RoundTimers::new(tx.clone()),
            config,
            instances: BTreeMap::new(),
            highest_height: None,
            store,
            network,
            decided_tx,
            rx,
            shutdown,
        };
        let handle = ControllerHandle { tx };
        let join = tokio::spawn(controller.run());
        (handle, join)
    }

    async fn run(mut self) {
        info!(identifier = %self.config.identifier, "qbft controller started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
            }
        }
        self.timers.stop_all();
        info!(identifier = %self.config.identifier, "qbft controller stopped");
    }

    async fn handle(&mut self, cmd: ControllerCommand) {
        match cmd {
            ControllerCommand::StartInstance {
                height,
                input_value,
            } => self.handle_start(height, input_value).await,
            ControllerCommand::Message(msg) => self.handle_message(msg).await,
            ControllerCommand::Timeout { height, round } => {
                self.handle_timeout(height, round).await
            }
            ControllerCommand::Decided { height, reply } => {
                let _ = reply.send(self.lookup_decided(height));
            }
            ControllerCommand::StopInstance { height } => {
                if let Some(instance) = self.instances.get_mut(&height) {
                    instance.stop();
                    self.timers.stop(height);
                }
            }
        }
    }

    async fn handle_start(&mut self, height: Height, input_value: Vec<u8>) {
        if self.instances.contains_key(&height) {
            warn!(height, "instance already running, ignoring start");
            return;
        }
        // Undecided instances cease at the next height; decided ones are
        // already persisted.
        let stale: Vec<Height> = self
            .instances
            .range(..height)
            .map(|(h, _)| *h)
            .collect();
        for h in stale {
            self.instances.remove(&h);
            self.timers.stop(h);
        }

        let mut instance = Instance::new(
            self.config.instance_config.clone(),
            self.config.identifier,
            height,
        );
        let actions = match instance.start(input_value) {
            Ok(actions) => actions,
            Err(err) => {
                warn!(height, %err, "failed to start instance");
                return;
            }
        };
        self.instances.insert(height, instance);
        self.highest_height = Some(self.highest_height.map_or(height, |h| h.max(height)));
        self.execute(height, actions).await;
    }

    async fn handle_message(&mut self, msg: SignedQbftMessage) {
        if msg.message.identifier != self.config.identifier {
            debug!("dropping message for foreign identifier");
            return;
        }
        let height = msg.message.height;
        if !self.instances.contains_key(&height) {
            debug!(height, "no running instance for message height");
            return;
        }
        let result = self
            .instances
            .get_mut(&height)
            .map(|i| i.process_message(&msg));
        match result {
            Some(Ok(actions)) => self.execute(height, actions).await,
            Some(Err(err)) => log_dropped_message(height, &err),
            None => {}
        }
    }

    async fn handle_timeout(&mut self, height: Height, round: Round) {
        let result = self
            .instances
            .get_mut(&height)
            .map(|i| i.on_timeout(round));
        match result {
            Some(Ok(actions)) => self.execute(height, actions).await,
            Some(Err(err)) => warn!(height, round, %err, "timeout handling failed"),
            None => debug!(height, round, "timeout for finished instance"),
        }
    }

    /// Execute instance actions, looping self-broadcast messages back into
    /// the instance exactly like gossip loopback would. The explicit work
    /// queue keeps processing iterative.
    async fn execute(&mut self, height: Height, initial: Vec<Action>) {
        let mut queue: VecDeque<Action> = initial.into();
        while let Some(action) = queue.pop_front() {
            match action {
                Action::ScheduleTimeout { round } => self.timers.start(height, round),
                Action::StopTimer => self.timers.stop(height),
                Action::Broadcast(msg) => {
                    let topic = topic_for(&self.config.identifier);
                    let wire = WireMessage::Consensus(msg.clone()).encode();
                    if let Err(err) = self.network.broadcast(&topic, wire) {
                        warn!(height, %err, "broadcast failed");
                    }
                    if let Some(instance) = self.instances.get_mut(&height) {
                        match instance.process_message(&msg) {
                            Ok(more) => queue.extend(more),
                            Err(err) => log_dropped_message(height, &err),
                        }
                    }
                }
                Action::Decide(decided) => self.on_decided(height, decided).await,
            }
        }
    }

    async fn on_decided(&mut self, height: Height, decided: SignedQbftMessage) {
        let Some(instance) = self.instances.get(&height) else {
            return;
        };
        let stored = StoredInstance {
            state: instance.state().clone(),
            decided_message: decided.clone(),
        };

        if let Err(err) = self.persist_decided(&stored, &decided) {
            if err.is_transient() {
                warn!(height, %err, "transient storage error persisting decision");
            } else {
                error!(height, %err, "fatal storage error, halting");
                self.shutdown.cancel();
                return;
            }
        }

        let event = DecidedEvent {
            identifier: self.config.identifier,
            height,
            round: decided.message.round,
            value: decided.message.value.clone(),
            decided_message: decided,
        };
        if self.decided_tx.send(event).await.is_err() {
            debug!(height, "no listener for decided event");
        }
    }

    fn persist_decided(
        &self,
        stored: &StoredInstance,
        decided: &SignedQbftMessage,
    ) -> Result<(), dv_storage::StorageError> {
        // One retry for transient failures before giving up.
        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = self
                .store
                .save_highest_and_historical(&self.config.identifier, stored)
                .and_then(|()| {
                    self.store.save_participants(
                        &self.config.identifier,
                        stored.state.height,
                        &decided.signers,
                    )
                });
            match result {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() && attempts < 3 => continue,
                Err(err) => return Err(err),
            }
        }
    }

    fn lookup_decided(&self, height: Height) -> Option<Vec<u8>> {
        if let Some(instance) = self.instances.get(&height) {
            if let Some(value) = instance.decided_value() {
                return Some(value.to_vec());
            }
        }
        self.store
            .instance(&self.config.identifier, height)
            .ok()
            .flatten()
            .and_then(|stored| stored.state.decided_value)
    }
}

fn log_dropped_message(height: Height, err: &QbftError) {
    match err {
        QbftError::EquivocationDetected { operator } => {
            warn!(height, operator, "equivocation detected, dropping message");
        }
        QbftError::NotAuthorized { operator } => {
            warn!(height, operator, "unauthorized signer, dropping message");
        }
        err => debug!(height, %err, "dropping message"),
    }
}
