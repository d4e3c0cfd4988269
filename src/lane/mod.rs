//! A lane is one worker thread. It owns a subset of connections and every instance
//! they play in; nothing else touches that state. Other threads reach it only through
//! the bounded queues behind a [`LaneHandle`].

mod control_queue;

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::constants::{
    tick_duration_ms, CLOSE_CODE_PROTOCOL, CLOSE_CODE_REJECTED, CLOSE_CODE_SERVER,
    DEFAULT_MAX_CLIENTS, DEFAULT_QUEUE_CAPACITY, TICK_RATE,
};
use crate::error::{ProtocolError, QueueError};
use crate::instance::{Instance, InstanceCommand, InstanceContext, InstanceSettings, InstanceSpec};
use crate::outbox::{Outbox, Outgoing, QueuePolicy};
use crate::protocol::{encode_server_message, parse_client_message, ClientMessage, FrameDecoder};
use crate::registry::ConnectionRegistry;
use crate::scheduler::Steppable;
use crate::transport::Transport;
use crate::types::{
    AccountContext, ConnectionHandle, ControlMessage, Destination, InstanceKey, LaneId,
};

pub use control_queue::{ControlEnvelope, ControlQueue};

#[derive(Clone, Debug, PartialEq)]
pub struct ConnectRequest {
    pub handle: ConnectionHandle,
    pub account: AccountContext,
    pub instance: InstanceKey,
    /// Raw bytes already read for the connection elsewhere, fed to the decoder first.
    pub pending: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferRequest {
    pub handle: ConnectionHandle,
    pub destination: Destination,
}

/// Lane to coordinator notifications.
#[derive(Clone, Debug, PartialEq)]
pub enum LaneEvent {
    Attached {
        handle: ConnectionHandle,
        lane: LaneId,
        instance: InstanceKey,
    },
    TransferredOut {
        handle: ConnectionHandle,
        lane: LaneId,
        destination: Destination,
        pending: Vec<u8>,
    },
    /// The lane closed the connection itself.
    Detached {
        handle: ConnectionHandle,
        lane: LaneId,
    },
}

#[derive(Clone, Debug)]
pub struct LaneConfig {
    pub tick_rate: u32,
    pub max_clients: usize,
    pub queue_capacity: usize,
    pub instance: InstanceSettings,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            tick_rate: TICK_RATE,
            max_clients: DEFAULT_MAX_CLIENTS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            instance: InstanceSettings::default(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaneStats {
    pub lane: usize,
    pub tick: u64,
    pub connections: usize,
    pub instances: usize,
    pub last_tick_us: u64,
}

/// Producer side of a lane's queues. Cheap to clone and safe to use from any thread.
#[derive(Clone, Debug)]
pub struct LaneHandle {
    id: LaneId,
    connect_tx: mpsc::Sender<ConnectRequest>,
    disconnect_tx: mpsc::Sender<ConnectionHandle>,
    transfer_tx: mpsc::Sender<TransferRequest>,
    control: Arc<ControlQueue<ControlEnvelope>>,
    stats: Arc<Mutex<LaneStats>>,
}

fn queued<T>(
    lane: LaneId,
    queue: &'static str,
    result: Result<(), mpsc::error::TrySendError<T>>,
) -> Result<(), QueueError> {
    result.map_err(|err| match err {
        mpsc::error::TrySendError::Full(_) => QueueError::Full { lane, queue },
        mpsc::error::TrySendError::Closed(_) => QueueError::Closed { lane, queue },
    })
}

impl LaneHandle {
    pub fn id(&self) -> LaneId {
        self.id
    }

    pub fn connect(&self, request: ConnectRequest) -> Result<(), QueueError> {
        queued(self.id, "connect", self.connect_tx.try_send(request))
    }

    pub fn disconnect(&self, handle: ConnectionHandle) -> Result<(), QueueError> {
        queued(self.id, "disconnect", self.disconnect_tx.try_send(handle))
    }

    pub fn transfer(
        &self,
        handle: ConnectionHandle,
        destination: Destination,
    ) -> Result<(), QueueError> {
        let request = TransferRequest {
            handle,
            destination,
        };
        queued(self.id, "transfer", self.transfer_tx.try_send(request))
    }

    pub fn control(&self, envelope: ControlEnvelope) -> Result<(), QueueError> {
        self.control.push(envelope).map_err(|_| QueueError::Full {
            lane: self.id,
            queue: "control",
        })
    }

    pub fn stats(&self) -> LaneStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LinkStatus {
    Attached,
    /// A transfer was requested; the connection leaves at the next transfer drain.
    TransferringOut,
}

#[derive(Debug)]
struct LaneConnection {
    instance: InstanceKey,
    status: LinkStatus,
    decoder: FrameDecoder,
}

pub struct Lane {
    id: LaneId,
    config: LaneConfig,
    dt_ms: u64,
    tick: u64,
    spawned: u64,
    connections: ConnectionRegistry<LaneConnection>,
    instances: BTreeMap<InstanceKey, Instance>,
    transport: Arc<dyn Transport>,
    events: mpsc::Sender<LaneEvent>,
    /// Events the coordinator channel had no room for, oldest first.
    unsent_events: VecDeque<LaneEvent>,
    connect_rx: mpsc::Receiver<ConnectRequest>,
    disconnect_rx: mpsc::Receiver<ConnectionHandle>,
    transfer_rx: mpsc::Receiver<TransferRequest>,
    transfer_tx: mpsc::Sender<TransferRequest>,
    control: Arc<ControlQueue<ControlEnvelope>>,
    control_front: Vec<ControlEnvelope>,
    outbox: Outbox,
    pending_commands: Vec<(InstanceKey, InstanceCommand)>,
    doomed: BTreeSet<InstanceKey>,
    closed_this_tick: HashSet<ConnectionHandle>,
    stats: Arc<Mutex<LaneStats>>,
}

impl Lane {
    pub fn new(
        id: LaneId,
        config: LaneConfig,
        transport: Arc<dyn Transport>,
        events: mpsc::Sender<LaneEvent>,
    ) -> (Self, LaneHandle) {
        let capacity = config.queue_capacity.max(1);
        let (connect_tx, connect_rx) = mpsc::channel(capacity);
        // Each handle is enqueued for disconnect at most once.
        let (disconnect_tx, disconnect_rx) = mpsc::channel(config.max_clients.max(1));
        let (transfer_tx, transfer_rx) = mpsc::channel(capacity);
        let control = Arc::new(ControlQueue::new(capacity));
        let stats = Arc::new(Mutex::new(LaneStats {
            lane: id.0,
            ..LaneStats::default()
        }));

        let handle = LaneHandle {
            id,
            connect_tx,
            disconnect_tx,
            transfer_tx: transfer_tx.clone(),
            control: Arc::clone(&control),
            stats: Arc::clone(&stats),
        };
        let lane = Self {
            id,
            dt_ms: tick_duration_ms(config.tick_rate),
            connections: ConnectionRegistry::with_capacity(config.max_clients),
            config,
            tick: 0,
            spawned: 0,
            instances: BTreeMap::new(),
            transport,
            events,
            unsent_events: VecDeque::new(),
            connect_rx,
            disconnect_rx,
            transfer_rx,
            transfer_tx,
            control,
            control_front: Vec::new(),
            outbox: Outbox::new(),
            pending_commands: Vec::new(),
            doomed: BTreeSet::new(),
            closed_this_tick: HashSet::new(),
            stats,
        };
        (lane, handle)
    }

    pub fn id(&self) -> LaneId {
        self.id
    }

    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    pub fn owns(&self, handle: ConnectionHandle) -> bool {
        self.connections.contains(handle)
    }

    pub fn owned_handles(&self) -> Vec<ConnectionHandle> {
        self.connections.handles()
    }

    pub fn instance_of(&self, handle: ConnectionHandle) -> Option<InstanceKey> {
        self.connections.get(handle).map(|connection| connection.instance)
    }

    pub fn instance(&self, key: InstanceKey) -> Option<&Instance> {
        self.instances.get(&key)
    }

    pub fn instance_keys(&self) -> Vec<InstanceKey> {
        self.instances.keys().copied().collect()
    }

    /// One lane tick: disconnects, connects, transfers, packets, control, updates.
    pub fn tick(&mut self) {
        let started = Instant::now();
        self.tick += 1;

        self.resend_events();
        self.drain_disconnects();
        self.drain_connects();
        self.drain_transfers();
        self.drain_packets();
        self.drain_control();
        self.update_instances();
        self.flush();

        self.apply_commands();
        self.reap_instances();
        self.flush();

        self.resend_events();
        self.closed_this_tick.clear();
        self.publish_stats(started.elapsed());
    }

    fn with_instance<R>(
        &mut self,
        key: InstanceKey,
        f: impl FnOnce(&mut Instance, &mut InstanceContext<'_>) -> R,
    ) -> Option<R> {
        let instance = self.instances.get_mut(&key)?;
        let mut commands = Vec::new();
        let mut ctx = InstanceContext {
            lane: self.id,
            tick: self.tick,
            dt_ms: self.dt_ms,
            outbox: &mut self.outbox,
            commands: &mut commands,
        };
        let result = f(instance, &mut ctx);
        self.pending_commands
            .extend(commands.into_iter().map(|command| (key, command)));
        Some(result)
    }

    /// Queues `event` for the coordinator. Events the channel cannot take yet are kept
    /// and resent in order; nothing is emitted past an older unsent event.
    fn emit(&mut self, event: LaneEvent) {
        if !self.unsent_events.is_empty() {
            self.unsent_events.push_back(event);
            return;
        }
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(lane = %self.id, ?event, "coordinator event channel full; holding event");
                self.unsent_events.push_back(event);
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                debug!(lane = %self.id, ?event, "coordinator gone; lane event dropped");
            }
        }
    }

    fn resend_events(&mut self) {
        while let Some(event) = self.unsent_events.pop_front() {
            match self.events.try_send(event) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(event)) => {
                    self.unsent_events.push_front(event);
                    return;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.unsent_events.clear();
                    return;
                }
            }
        }
    }

    fn drain_disconnects(&mut self) {
        while let Ok(handle) = self.disconnect_rx.try_recv() {
            self.closed_this_tick.insert(handle);
            let Some(connection) = self.connections.detach(handle) else {
                debug!(lane = %self.id, %handle, "disconnect for connection not on this lane");
                continue;
            };
            self.with_instance(connection.instance, |instance, ctx| {
                instance.on_client_left(ctx, handle)
            });
            debug!(lane = %self.id, %handle, instance = %connection.instance, "connection left lane");
        }
    }

    fn drain_connects(&mut self) {
        while let Ok(request) = self.connect_rx.try_recv() {
            self.connect(request);
        }
    }

    fn connect(&mut self, request: ConnectRequest) {
        let ConnectRequest {
            handle,
            account,
            instance: key,
            pending,
        } = request;

        if self.closed_this_tick.contains(&handle) {
            debug!(lane = %self.id, %handle, "connect cancelled by disconnect");
            return;
        }
        if let Some(existing) = self.connections.get(handle) {
            let instance = existing.instance;
            self.emit(LaneEvent::Attached {
                handle,
                lane: self.id,
                instance,
            });
            return;
        }
        if key == InstanceKey::Hub && !self.instances.contains_key(&key) {
            self.spawn_instance(InstanceSpec::Hub);
        }
        if !self.instances.contains_key(&key) {
            warn!(lane = %self.id, %handle, instance = %key, "connect target does not exist; dropped");
            return;
        }

        let mut decoder = FrameDecoder::new();
        if let Err(err) = decoder.extend(&pending) {
            warn!(lane = %self.id, %handle, %err, "pending bytes rejected");
            self.reject(handle, CLOSE_CODE_PROTOCOL, "malformed packet");
            return;
        }
        let connection = LaneConnection {
            instance: key,
            status: LinkStatus::Attached,
            decoder,
        };
        if let Err(err) = self.connections.attach(handle, connection) {
            warn!(lane = %self.id, %handle, %err, "lane cannot take more connections");
            self.reject(handle, CLOSE_CODE_SERVER, "server full");
            return;
        }

        let joined = self.with_instance(key, move |instance, ctx| {
            instance.on_client_joined(ctx, handle, account)
        });
        match joined {
            Some(Ok(())) => {
                info!(lane = %self.id, %handle, instance = %key, "connection joined instance");
                self.emit(LaneEvent::Attached {
                    handle,
                    lane: self.id,
                    instance: key,
                });
                self.receive(handle, &[]);
            }
            Some(Err(err)) => {
                warn!(lane = %self.id, %handle, instance = %key, %err, "instance refused connection");
                self.connections.detach(handle);
                self.reject(handle, CLOSE_CODE_REJECTED, &err.to_string());
            }
            None => {
                self.connections.detach(handle);
            }
        }
    }

    fn reject(&mut self, handle: ConnectionHandle, code: u16, reason: &str) {
        self.transport.disconnect(handle, code, reason);
        self.closed_this_tick.insert(handle);
        self.emit(LaneEvent::Detached {
            handle,
            lane: self.id,
        });
    }

    fn drop_connection(&mut self, handle: ConnectionHandle, code: u16, reason: &str) {
        let Some(connection) = self.connections.detach(handle) else {
            return;
        };
        self.with_instance(connection.instance, |instance, ctx| {
            instance.on_client_left(ctx, handle)
        });
        info!(lane = %self.id, %handle, code, reason, "lane closed connection");
        self.reject(handle, code, reason);
    }

    fn drain_transfers(&mut self) {
        while let Ok(TransferRequest {
            handle,
            destination,
        }) = self.transfer_rx.try_recv()
        {
            let Some(mut connection) = self.connections.detach(handle) else {
                debug!(lane = %self.id, %handle, "transfer for connection not on this lane dropped");
                continue;
            };
            self.with_instance(connection.instance, |instance, ctx| {
                instance.on_client_left(ctx, handle)
            });
            info!(lane = %self.id, %handle, from = %connection.instance, to = %destination.key, "connection transferred out");
            self.emit(LaneEvent::TransferredOut {
                handle,
                lane: self.id,
                destination,
                pending: connection.decoder.take_remaining(),
            });
        }
    }

    fn drain_packets(&mut self) {
        let handles: Vec<ConnectionHandle> = self
            .connections
            .iter()
            .filter(|(_, connection)| connection.status == LinkStatus::Attached)
            .map(|(handle, _)| handle)
            .collect();
        if handles.is_empty() {
            return;
        }
        for (handle, bytes) in self.transport.poll_received(&handles) {
            self.receive(handle, &bytes);
        }
    }

    fn receive(&mut self, handle: ConnectionHandle, bytes: &[u8]) {
        let Some(connection) = self.connections.get_mut(handle) else {
            return;
        };
        let key = connection.instance;
        let messages = match decode_messages(&mut connection.decoder, handle, bytes) {
            Ok(messages) => messages,
            Err(err) => {
                warn!(lane = %self.id, %handle, %err, "framing error");
                self.drop_connection(handle, CLOSE_CODE_PROTOCOL, "malformed packet");
                return;
            }
        };
        for message in messages {
            self.with_instance(key, |instance, ctx| instance.on_packet(ctx, handle, message));
        }
    }

    fn drain_control(&mut self) {
        let mut front = std::mem::take(&mut self.control_front);
        self.control.swap_into(&mut front);
        for envelope in front.drain(..) {
            self.dispatch_control(envelope);
        }
        self.control_front = front;
    }

    fn dispatch_control(&mut self, envelope: ControlEnvelope) {
        let ControlEnvelope { target, message } = envelope;
        match message {
            ControlMessage::CreateMatch { spec } => self.spawn_instance(InstanceSpec::Match(spec)),
            ControlMessage::CreateRoom { spec } => self.spawn_instance(InstanceSpec::Room(spec)),
            message => match target {
                Some(handle) => {
                    let Some(key) = self.instance_of(handle) else {
                        debug!(lane = %self.id, %handle, "control message for connection not on this lane");
                        return;
                    };
                    self.with_instance(key, |instance, ctx| {
                        instance.on_control(ctx, Some(handle), &message)
                    });
                }
                None => {
                    for key in self.instance_keys() {
                        self.with_instance(key, |instance, ctx| {
                            instance.on_control(ctx, None, &message)
                        });
                    }
                }
            },
        }
    }

    fn spawn_instance(&mut self, spec: InstanceSpec) {
        let key = spec.key();
        if self.instances.contains_key(&key) {
            warn!(lane = %self.id, instance = %key, "instance already exists");
            return;
        }
        let mut settings = self.config.instance.clone();
        settings.seed = settings
            .seed
            .wrapping_add((self.id.0 as u64) << 32)
            .wrapping_add(self.spawned);
        self.spawned += 1;
        self.instances.insert(key, Instance::create(spec, settings));

        match self.with_instance(key, |instance, ctx| instance.init(ctx)) {
            Some(Err(err)) => {
                error!(lane = %self.id, instance = %key, %err, "instance failed to start");
                self.instances.remove(&key);
            }
            _ => info!(lane = %self.id, instance = %key, "instance created"),
        }
    }

    fn update_instances(&mut self) {
        for key in self.instance_keys() {
            match self.with_instance(key, |instance, ctx| instance.update(ctx)) {
                Some(Err(err)) if err.is_fatal() => {
                    error!(lane = %self.id, instance = %key, %err, "instance failed; tearing it down");
                    self.doomed.insert(key);
                }
                Some(Err(err)) => warn!(lane = %self.id, instance = %key, %err, "instance update error"),
                _ => {}
            }
        }
    }

    fn apply_commands(&mut self) {
        while !self.pending_commands.is_empty() {
            for (key, command) in std::mem::take(&mut self.pending_commands) {
                match command {
                    InstanceCommand::Transfer {
                        handle,
                        destination,
                    } => self.begin_transfer(key, handle, destination),
                    InstanceCommand::Disconnect { handle, reason } => {
                        self.drop_connection(handle, CLOSE_CODE_PROTOCOL, &reason)
                    }
                    InstanceCommand::Spawn(spec) => self.spawn_instance(spec),
                    InstanceCommand::Terminate => {
                        self.doomed.insert(key);
                    }
                }
            }
        }
    }

    fn begin_transfer(&mut self, key: InstanceKey, handle: ConnectionHandle, destination: Destination) {
        let Some(connection) = self.connections.get_mut(handle) else {
            debug!(lane = %self.id, %handle, "transfer for connection that already left");
            return;
        };
        if connection.instance != key || connection.status != LinkStatus::Attached {
            debug!(lane = %self.id, %handle, instance = %key, "transfer ignored");
            return;
        }
        connection.status = LinkStatus::TransferringOut;
        let request = TransferRequest {
            handle,
            destination,
        };
        if let Err(err) = self.transfer_tx.try_send(request) {
            warn!(lane = %self.id, %handle, %err, "transfer queue full");
            self.drop_connection(handle, CLOSE_CODE_SERVER, "transfer failed");
        }
    }

    fn reap_instances(&mut self) {
        let mut doomed = std::mem::take(&mut self.doomed);
        doomed.extend(
            self.instances
                .iter()
                .filter(|(_, instance)| instance.is_terminated())
                .map(|(key, _)| *key),
        );
        for key in doomed {
            if self.instances.remove(&key).is_none() {
                continue;
            }
            let stranded: Vec<ConnectionHandle> = self
                .connections
                .iter()
                .filter(|(_, connection)| {
                    connection.instance == key && connection.status == LinkStatus::Attached
                })
                .map(|(handle, _)| handle)
                .collect();
            for handle in stranded {
                self.drop_connection(handle, CLOSE_CODE_SERVER, "instance closed");
            }
            info!(lane = %self.id, instance = %key, "instance removed");
        }
    }

    /// Sends everything in the outbox. Dropping a connection whose reliable send failed
    /// can queue more messages (leave broadcasts); those go out in the same call.
    fn flush(&mut self) {
        while !self.outbox.is_empty() {
            let mut failed: Vec<ConnectionHandle> = Vec::new();
            for Outgoing {
                handle,
                message,
                policy,
            } in self.outbox.take()
            {
                if failed.contains(&handle) {
                    continue;
                }
                let bytes = match encode_server_message(&message) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        error!(lane = %self.id, %handle, %err, "failed to encode server message");
                        continue;
                    }
                };
                if let Err(err) = self.transport.send(handle, bytes) {
                    match policy {
                        QueuePolicy::DropOnFull => {
                            debug!(lane = %self.id, %handle, %err, "dropped message")
                        }
                        QueuePolicy::DisconnectOnFull => {
                            warn!(lane = %self.id, %handle, %err, "reliable send failed");
                            failed.push(handle);
                        }
                    }
                }
            }
            for handle in failed {
                self.drop_connection(handle, CLOSE_CODE_SERVER, "send failed");
            }
        }
    }

    fn publish_stats(&self, elapsed: Duration) {
        let stats = LaneStats {
            lane: self.id.0,
            tick: self.tick,
            connections: self.connections.len(),
            instances: self.instances.len(),
            last_tick_us: elapsed.as_micros() as u64,
        };
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner) = stats;
    }

    #[cfg(test)]
    pub(crate) fn adopt(&mut self, instance: Instance) {
        self.instances.insert(instance.key(), instance);
    }
}

impl Steppable for Lane {
    fn step(&mut self, _now: Instant) {
        self.tick();
    }
}

fn decode_messages(
    decoder: &mut FrameDecoder,
    handle: ConnectionHandle,
    bytes: &[u8],
) -> Result<Vec<ClientMessage>, ProtocolError> {
    decoder.extend(bytes)?;
    let mut messages = Vec::new();
    while let Some(frame) = decoder.next_frame()? {
        match parse_client_message(frame.net_id, &frame.payload) {
            Some(message) => messages.push(message),
            None => warn!(%handle, net_id = frame.net_id, "unparseable client message ignored"),
        }
    }
    Ok(messages)
}
