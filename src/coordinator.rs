//! The coordinator thread: accepts connections, authenticates them, decides which lane
//! owns each one and routes control-plane traffic. It never touches instance state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::{Authenticator, Credentials};
use crate::config::ServerRole;
use crate::constants::{
    CLOSE_CODE_NORMAL, CLOSE_CODE_PROTOCOL, CLOSE_CODE_REJECTED, CLOSE_CODE_SERVER,
    CLOSE_CODE_SUPERSEDED, COORDINATOR_TICK_RATE, DEFAULT_MAX_CLIENTS,
    DEFAULT_MAX_PLACEMENT_ATTEMPTS, DEFAULT_PLACEMENT_TIMEOUT_MS, DEFAULT_QUEUE_CAPACITY,
};
use crate::error::{AuthError, ProtocolError};
use crate::lane::{ConnectRequest, ControlEnvelope, LaneEvent, LaneHandle};
use crate::protocol::{encode_server_message, parse_client_message, ClientMessage, FrameDecoder, ServerMessage};
use crate::registry::ConnectionRegistry;
use crate::scheduler::Steppable;
use crate::transport::{Transport, TransportEvent};
use crate::types::{
    AccountContext, AccountId, ConnectionHandle, ControlMessage, ControlScope, Destination,
    InstanceKey, LaneId, MatchSpec, RoomSpec,
};

/// Picks the lane for a new session or a new match.
pub trait PlacementPolicy: Send {
    fn choose_lane(&mut self, lane_count: usize) -> LaneId;
}

/// Always lane 0. Placeholder until real load balancing exists.
#[derive(Clone, Copy, Debug, Default)]
pub struct FirstLane;

impl PlacementPolicy for FirstLane {
    fn choose_lane(&mut self, _lane_count: usize) -> LaneId {
        LaneId(0)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RoundRobin {
    next: usize,
}

impl PlacementPolicy for RoundRobin {
    fn choose_lane(&mut self, lane_count: usize) -> LaneId {
        let lane = LaneId(self.next % lane_count.max(1));
        self.next = self.next.wrapping_add(1);
        lane
    }
}

/// Requests other threads (HTTP handlers, tooling) make of the coordinator.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlRequest {
    Route {
        scope: ControlScope,
        message: ControlMessage,
    },
    CreateMatch(MatchSpec),
    CreateRoom(RoomSpec),
    Transfer {
        handle: ConnectionHandle,
        destination: Destination,
    },
}

pub type ControlSender = mpsc::Sender<ControlRequest>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    Unauthenticated,
    ConnectingIn {
        lane: LaneId,
        destination: InstanceKey,
        since: Instant,
        attempts: u32,
    },
    Owned {
        lane: LaneId,
        instance: InstanceKey,
    },
    TransferringOut {
        lane: LaneId,
    },
}

impl Placement {
    pub fn lane(&self) -> Option<LaneId> {
        match *self {
            Self::Unauthenticated => None,
            Self::ConnectingIn { lane, .. }
            | Self::Owned { lane, .. }
            | Self::TransferringOut { lane } => Some(lane),
        }
    }
}

#[derive(Debug)]
struct Session {
    account: Option<AccountContext>,
    placement: Placement,
    decoder: FrameDecoder,
}

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    pub role: ServerRole,
    pub tick_rate: u32,
    pub max_clients: usize,
    pub queue_capacity: usize,
    pub placement_timeout_ms: u64,
    pub max_placement_attempts: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            role: ServerRole::Hub,
            tick_rate: COORDINATOR_TICK_RATE,
            max_clients: DEFAULT_MAX_CLIENTS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            placement_timeout_ms: DEFAULT_PLACEMENT_TIMEOUT_MS,
            max_placement_attempts: DEFAULT_MAX_PLACEMENT_ATTEMPTS,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorStats {
    pub tick: u64,
    pub sessions: usize,
    pub unauthenticated: usize,
    pub connecting: usize,
    pub owned: usize,
    pub transferring: usize,
    pub pending_matches: usize,
}

enum PreAuth {
    Waiting,
    Hello(Credentials),
    Unexpected(u16),
}

fn read_hello(decoder: &mut FrameDecoder, bytes: &[u8]) -> Result<PreAuth, ProtocolError> {
    decoder.extend(bytes)?;
    let Some(frame) = decoder.next_frame()? else {
        return Ok(PreAuth::Waiting);
    };
    match parse_client_message(frame.net_id, &frame.payload) {
        Some(ClientMessage::Hello {
            nickname,
            leader_class,
            session_token,
        }) => Ok(PreAuth::Hello(Credentials {
            nickname,
            leader_class,
            session_token,
        })),
        _ => Ok(PreAuth::Unexpected(frame.net_id)),
    }
}

pub struct Coordinator {
    config: CoordinatorConfig,
    tick: u64,
    sessions: ConnectionRegistry<Session>,
    by_account: HashMap<AccountId, ConnectionHandle>,
    lanes: Vec<LaneHandle>,
    placement: Box<dyn PlacementPolicy>,
    auth: Box<dyn Authenticator>,
    transport: Arc<dyn Transport>,
    events: mpsc::Receiver<LaneEvent>,
    requests: mpsc::Receiver<ControlRequest>,
    pending_matches: HashMap<AccountId, Destination>,
    stats: Arc<Mutex<CoordinatorStats>>,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        lanes: Vec<LaneHandle>,
        transport: Arc<dyn Transport>,
        auth: Box<dyn Authenticator>,
        placement: Box<dyn PlacementPolicy>,
        events: mpsc::Receiver<LaneEvent>,
    ) -> (Self, ControlSender) {
        let (requests_tx, requests) = mpsc::channel(config.queue_capacity.max(1));
        let coordinator = Self {
            sessions: ConnectionRegistry::with_capacity(config.max_clients),
            config,
            tick: 0,
            by_account: HashMap::new(),
            lanes,
            placement,
            auth,
            transport,
            events,
            requests,
            pending_matches: HashMap::new(),
            stats: Arc::new(Mutex::new(CoordinatorStats::default())),
        };
        (coordinator, requests_tx)
    }

    pub fn stats_handle(&self) -> Arc<Mutex<CoordinatorStats>> {
        Arc::clone(&self.stats)
    }

    pub fn placement_of(&self, handle: ConnectionHandle) -> Option<Placement> {
        self.sessions.get(handle).map(|session| session.placement)
    }

    pub fn account_of(&self, handle: ConnectionHandle) -> Option<&AccountContext> {
        self.sessions.get(handle)?.account.as_ref()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn tick(&mut self, now: Instant) {
        self.tick += 1;
        self.poll_transport();
        self.poll_unauthenticated(now);
        self.drain_lane_events(now);
        self.drain_requests();
        self.check_placement_timeouts(now);
        self.publish_stats();
    }

    fn poll_transport(&mut self) {
        for event in self.transport.poll_events() {
            match event {
                TransportEvent::Connected(handle) => {
                    let session = Session {
                        account: None,
                        placement: Placement::Unauthenticated,
                        decoder: FrameDecoder::new(),
                    };
                    if let Err(err) = self.sessions.attach(handle, session) {
                        warn!(%handle, %err, "refusing connection");
                        self.transport.disconnect(handle, CLOSE_CODE_SERVER, "server full");
                        continue;
                    }
                    debug!(%handle, "connection opened");
                }
                TransportEvent::Closed(handle) => self.on_connection_closed(handle),
            }
        }
    }

    /// Forgets the session and asks the owning lane, if any, to let go of it.
    pub fn on_connection_closed(&mut self, handle: ConnectionHandle) {
        let Some(session) = self.sessions.detach(handle) else {
            debug!(%handle, "close for unknown connection");
            return;
        };
        if let Some(account) = &session.account {
            if self.by_account.get(&account.account_id) == Some(&handle) {
                self.by_account.remove(&account.account_id);
            }
        }
        if let Some(lane) = session.placement.lane() {
            if let Err(err) = self.lanes[lane.0].disconnect(handle) {
                warn!(%handle, %err, "could not enqueue disconnect");
            }
        }
        info!(%handle, "connection closed");
    }

    fn poll_unauthenticated(&mut self, now: Instant) {
        let handles: Vec<ConnectionHandle> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.placement == Placement::Unauthenticated)
            .map(|(handle, _)| handle)
            .collect();
        if handles.is_empty() {
            return;
        }
        for (handle, bytes) in self.transport.poll_received(&handles) {
            self.on_pre_auth_bytes(handle, &bytes, now);
        }
    }

    fn on_pre_auth_bytes(&mut self, handle: ConnectionHandle, bytes: &[u8], now: Instant) {
        let Some(session) = self.sessions.get_mut(handle) else {
            return;
        };
        match read_hello(&mut session.decoder, bytes) {
            Ok(PreAuth::Waiting) => {}
            Ok(PreAuth::Hello(credentials)) => self.authenticate(handle, credentials, now),
            Ok(PreAuth::Unexpected(net_id)) => {
                warn!(%handle, net_id, "message before hello");
                self.drop_session(handle, CLOSE_CODE_PROTOCOL, "expected hello");
            }
            Err(err) => {
                warn!(%handle, %err, "framing error before hello");
                self.drop_session(handle, CLOSE_CODE_PROTOCOL, "malformed packet");
            }
        }
    }

    fn authenticate(&mut self, handle: ConnectionHandle, credentials: Credentials, now: Instant) {
        let grant = match self.auth.authenticate(handle, &credentials) {
            Ok(grant) => grant,
            Err(err) => return self.reject(handle, &err),
        };
        let destination = match self.entry_destination(grant.account.account_id) {
            Ok(destination) => destination,
            Err(err) => return self.reject(handle, &err),
        };

        let account_id = grant.account.account_id;
        if let Some(previous) = self.by_account.insert(account_id, handle) {
            if previous != handle {
                info!(%previous, %handle, account = account_id.0, "superseding older connection");
                self.drop_session(previous, CLOSE_CODE_SUPERSEDED, "superseded by new connection");
            }
        }

        self.send_direct(
            handle,
            &ServerMessage::AuthAccepted {
                account_id,
                nickname: grant.account.nickname.clone(),
                session_token: grant.session_token,
            },
        );
        let Some(session) = self.sessions.get_mut(handle) else {
            return;
        };
        let pending = session.decoder.take_remaining();
        session.account = Some(grant.account);
        info!(%handle, account = account_id.0, "connection authenticated");
        self.place(handle, destination, pending, now, 1);
    }

    fn reject(&mut self, handle: ConnectionHandle, err: &AuthError) {
        warn!(%handle, %err, "authentication failed");
        self.send_direct(
            handle,
            &ServerMessage::AuthRejected {
                reason: err.to_string(),
            },
        );
        self.drop_session(handle, CLOSE_CODE_REJECTED, &err.to_string());
    }

    fn entry_destination(&self, account_id: AccountId) -> Result<Destination, AuthError> {
        match self.config.role {
            ServerRole::Hub => Ok(Destination::hub()),
            ServerRole::Play => self
                .pending_matches
                .get(&account_id)
                .copied()
                .ok_or(AuthError::NoPendingMatch),
        }
    }

    fn send_direct(&self, handle: ConnectionHandle, message: &ServerMessage) {
        match encode_server_message(message) {
            Ok(bytes) => {
                if let Err(err) = self.transport.send(handle, bytes) {
                    debug!(%handle, %err, "direct send failed");
                }
            }
            Err(err) => warn!(%handle, %err, "failed to encode direct message"),
        }
    }

    fn drop_session(&mut self, handle: ConnectionHandle, code: u16, reason: &str) {
        self.transport.disconnect(handle, code, reason);
        self.on_connection_closed(handle);
    }

    fn place(
        &mut self,
        handle: ConnectionHandle,
        destination: Destination,
        pending: Vec<u8>,
        now: Instant,
        attempts: u32,
    ) {
        let Some(account) = self.account_of(handle).cloned() else {
            debug!(%handle, "placement for unknown session dropped");
            return;
        };
        let lane = match destination.lane {
            Some(lane) if lane.0 < self.lanes.len() => lane,
            _ => self.placement.choose_lane(self.lanes.len()),
        };
        let request = ConnectRequest {
            handle,
            account,
            instance: destination.key,
            pending,
        };
        if let Err(err) = self.lanes[lane.0].connect(request) {
            warn!(%handle, %err, "could not enqueue connect");
            self.drop_session(handle, CLOSE_CODE_SERVER, "no lane available");
            return;
        }
        if let Some(session) = self.sessions.get_mut(handle) {
            session.placement = Placement::ConnectingIn {
                lane,
                destination: destination.key,
                since: now,
                attempts,
            };
        }
        debug!(%handle, %lane, instance = %destination.key, attempts, "connect requested");
    }

    fn drain_lane_events(&mut self, now: Instant) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                LaneEvent::Attached {
                    handle,
                    lane,
                    instance,
                } => self.on_attached(handle, lane, instance),
                LaneEvent::TransferredOut {
                    handle,
                    lane,
                    destination,
                    pending,
                } => self.on_transferred_out(handle, lane, destination, pending, now),
                LaneEvent::Detached { handle, lane } => {
                    let Some(session) = self.sessions.detach(handle) else {
                        continue;
                    };
                    if let Some(account) = session.account {
                        if self.by_account.get(&account.account_id) == Some(&handle) {
                            self.by_account.remove(&account.account_id);
                        }
                    }
                    debug!(%handle, %lane, "lane detached connection");
                }
            }
        }
    }

    fn on_attached(&mut self, handle: ConnectionHandle, lane: LaneId, instance: InstanceKey) {
        let Some(session) = self.sessions.get_mut(handle) else {
            debug!(%handle, %lane, "attach for closed session");
            return;
        };
        session.placement = Placement::Owned { lane, instance };
        if self.config.role == ServerRole::Hub && matches!(instance, InstanceKey::Match(_)) {
            if let Some(account) = &session.account {
                self.pending_matches.remove(&account.account_id);
            }
        }
        debug!(%handle, %lane, %instance, "connection owned by lane");
    }

    fn on_transferred_out(
        &mut self,
        handle: ConnectionHandle,
        lane: LaneId,
        destination: Destination,
        pending: Vec<u8>,
        now: Instant,
    ) {
        if !self.sessions.contains(handle) {
            debug!(%handle, %lane, "transfer for closed session");
            return;
        }
        if self.config.role == ServerRole::Play && destination.key == InstanceKey::Hub {
            info!(%handle, "match over; closing play connection");
            // The lane already let go of it.
            if let Some(session) = self.sessions.get_mut(handle) {
                session.placement = Placement::Unauthenticated;
            }
            self.drop_session(handle, CLOSE_CODE_NORMAL, "match finished");
            return;
        }
        self.place(handle, destination, pending, now, 1);
    }

    fn drain_requests(&mut self) {
        while let Ok(request) = self.requests.try_recv() {
            match request {
                ControlRequest::Route { scope, message } => self.route_control_message(scope, message),
                ControlRequest::CreateMatch(spec) => self.create_match(spec),
                ControlRequest::CreateRoom(spec) => self.create_room(spec),
                ControlRequest::Transfer {
                    handle,
                    destination,
                } => self.request_transfer(handle, destination),
            }
        }
    }

    pub fn route_control_message(&mut self, scope: ControlScope, message: ControlMessage) {
        match scope {
            ControlScope::Connection(handle) => {
                let Some(lane) = self.placement_of(handle).and_then(|placement| placement.lane()) else {
                    debug!(%handle, "control message for unplaced connection dropped");
                    return;
                };
                let envelope = ControlEnvelope {
                    target: Some(handle),
                    message,
                };
                if let Err(err) = self.lanes[lane.0].control(envelope) {
                    warn!(%handle, %err, "control message dropped");
                }
            }
            ControlScope::Broadcast => {
                for lane in &self.lanes {
                    let envelope = ControlEnvelope {
                        target: None,
                        message: message.clone(),
                    };
                    if let Err(err) = lane.control(envelope) {
                        warn!(%err, "control broadcast dropped");
                    }
                }
            }
        }
    }

    /// Creates the match on a lane chosen by the placement policy and, on a hub server,
    /// sends the listed players that are online over to it.
    pub fn create_match(&mut self, spec: MatchSpec) {
        let lane = self.placement.choose_lane(self.lanes.len());
        let destination = Destination::on_lane(lane, InstanceKey::Match(spec.match_id));
        let accounts: Vec<AccountId> = spec.seats.iter().map(|seat| seat.account_id).collect();
        info!(match_id = spec.match_id, %lane, players = accounts.len(), "creating match");

        let envelope = ControlEnvelope {
            target: None,
            message: ControlMessage::CreateMatch { spec },
        };
        if let Err(err) = self.lanes[lane.0].control(envelope) {
            warn!(%err, "match creation dropped");
            return;
        }
        self.invite(&accounts, destination);
    }

    pub fn create_room(&mut self, spec: RoomSpec) {
        let lane = self.placement.choose_lane(self.lanes.len());
        let destination = Destination::on_lane(lane, InstanceKey::Room(spec.room_id));
        let accounts = spec.accounts.clone();
        info!(room_id = spec.room_id, %lane, players = accounts.len(), "creating room");

        let envelope = ControlEnvelope {
            target: None,
            message: ControlMessage::CreateRoom { spec },
        };
        if let Err(err) = self.lanes[lane.0].control(envelope) {
            warn!(%err, "room creation dropped");
            return;
        }
        self.invite(&accounts, destination);
    }

    fn invite(&mut self, accounts: &[AccountId], destination: Destination) {
        for account_id in accounts {
            self.pending_matches.insert(*account_id, destination);
            if self.config.role != ServerRole::Hub {
                continue;
            }
            let Some(handle) = self.by_account.get(account_id).copied() else {
                continue;
            };
            if matches!(self.placement_of(handle), Some(Placement::Owned { .. })) {
                self.route_control_message(
                    ControlScope::Connection(handle),
                    ControlMessage::MatchFound { destination },
                );
            }
        }
    }

    pub fn request_transfer(&mut self, handle: ConnectionHandle, destination: Destination) {
        let Some(Placement::Owned { lane, .. }) = self.placement_of(handle) else {
            debug!(%handle, "transfer for connection that is not owned dropped");
            return;
        };
        if let Err(err) = self.lanes[lane.0].transfer(handle, destination) {
            warn!(%handle, %err, "transfer dropped");
            return;
        }
        if let Some(session) = self.sessions.get_mut(handle) {
            session.placement = Placement::TransferringOut { lane };
        }
    }

    fn check_placement_timeouts(&mut self, now: Instant) {
        let timeout = Duration::from_millis(self.config.placement_timeout_ms);
        let stuck: Vec<(ConnectionHandle, LaneId, InstanceKey, u32)> = self
            .sessions
            .iter()
            .filter_map(|(handle, session)| match session.placement {
                Placement::ConnectingIn {
                    lane,
                    destination,
                    since,
                    attempts,
                } if now.saturating_duration_since(since) >= timeout => {
                    Some((handle, lane, destination, attempts))
                }
                _ => None,
            })
            .collect();

        for (handle, lane, destination, attempts) in stuck {
            if attempts >= self.config.max_placement_attempts {
                warn!(%handle, %lane, attempts, "placement timed out");
                self.drop_session(handle, CLOSE_CODE_SERVER, "placement timed out");
                continue;
            }
            let key = match self.config.role {
                ServerRole::Hub => InstanceKey::Hub,
                ServerRole::Play => destination,
            };
            debug!(%handle, %lane, attempts, "re-issuing connect");
            self.place(handle, Destination::on_lane(lane, key), Vec::new(), now, attempts + 1);
        }
    }

    fn publish_stats(&self) {
        let mut stats = CoordinatorStats {
            tick: self.tick,
            sessions: self.sessions.len(),
            pending_matches: self.pending_matches.len(),
            ..CoordinatorStats::default()
        };
        for (_, session) in self.sessions.iter() {
            match session.placement {
                Placement::Unauthenticated => stats.unauthenticated += 1,
                Placement::ConnectingIn { .. } => stats.connecting += 1,
                Placement::Owned { .. } => stats.owned += 1,
                Placement::TransferringOut { .. } => stats.transferring += 1,
            }
        }
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner) = stats;
    }
}

impl Steppable for Coordinator {
    fn step(&mut self, now: Instant) {
        self.tick(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::DevAuthenticator;
    use crate::lane::tests::{lane_config, received};
    use crate::lane::Lane;
    use crate::protocol::encode_client_message;
    use crate::transport::MemoryTransport;
    use crate::types::MatchSeat;
    use serde_json::Value;

    struct Fixture {
        transport: Arc<MemoryTransport>,
        coordinator: Coordinator,
        lanes: Vec<Lane>,
        now: Instant,
    }

    impl Fixture {
        fn new(config: CoordinatorConfig, lane_count: usize) -> Self {
            let transport = Arc::new(MemoryTransport::new(256));
            let (events_tx, events_rx) = mpsc::channel(64);
            let mut lanes = Vec::new();
            let mut handles = Vec::new();
            for index in 0..lane_count {
                let (lane, handle) =
                    Lane::new(LaneId(index), lane_config(), transport.clone(), events_tx.clone());
                lanes.push(lane);
                handles.push(handle);
            }
            let (coordinator, _control) = Coordinator::new(
                config,
                handles,
                transport.clone(),
                Box::new(DevAuthenticator::new()),
                Box::new(FirstLane),
                events_rx,
            );
            Self {
                transport,
                coordinator,
                lanes,
                now: Instant::now(),
            }
        }

        fn hub() -> Self {
            Self::new(CoordinatorConfig::default(), 2)
        }

        fn send(&self, handle: ConnectionHandle, message: &ClientMessage) {
            let bytes = encode_client_message(message).expect("encode should succeed");
            assert!(self.transport.client_send(handle, &bytes));
        }

        fn hello(&self, nickname: &str, session_token: Option<String>) -> ConnectionHandle {
            let handle = self.transport.open();
            self.send(
                handle,
                &ClientMessage::Hello {
                    nickname: nickname.to_string(),
                    leader_class: 2,
                    session_token,
                },
            );
            handle
        }

        fn step(&mut self) {
            self.coordinator.tick(self.now);
            for lane in &mut self.lanes {
                lane.tick();
            }
            self.coordinator.tick(self.now);
        }

        fn owned(&mut self, nickname: &str) -> ConnectionHandle {
            let handle = self.hello(nickname, None);
            self.step();
            assert!(matches!(
                self.coordinator.placement_of(handle),
                Some(Placement::Owned {
                    instance: InstanceKey::Hub,
                    ..
                })
            ));
            handle
        }
    }

    #[test]
    fn hello_authenticates_and_places_on_first_lane() {
        let mut fixture = Fixture::hub();
        let client = fixture.hello("Alice", None);

        fixture.coordinator.tick(fixture.now);
        assert!(matches!(
            fixture.coordinator.placement_of(client),
            Some(Placement::ConnectingIn {
                lane: LaneId(0),
                destination: InstanceKey::Hub,
                attempts: 1,
                ..
            })
        ));
        assert_eq!(
            fixture.coordinator.account_of(client).map(|a| a.nickname.as_str()),
            Some("Alice")
        );

        fixture.step();
        assert_eq!(
            fixture.coordinator.placement_of(client),
            Some(Placement::Owned {
                lane: LaneId(0),
                instance: InstanceKey::Hub,
            })
        );
        assert!(fixture.lanes[0].owns(client));
        assert!(!fixture.lanes[1].owns(client));

        let bodies = received(&fixture.transport, client);
        assert_eq!(bodies[0]["type"], "auth_accepted");
        assert_eq!(bodies[1]["type"], "enter_instance");
        assert_eq!(fixture.coordinator.stats_handle().lock().expect("stats lock").owned, 1);
    }

    #[test]
    fn bytes_after_hello_reach_the_lane() {
        let mut fixture = Fixture::hub();
        let client = fixture.transport.open();
        let mut stream = encode_client_message(&ClientMessage::Hello {
            nickname: "Alice".to_string(),
            leader_class: 0,
            session_token: None,
        })
        .expect("encode should succeed");
        stream.extend(encode_client_message(&ClientMessage::MapLoaded).expect("encode should succeed"));
        assert!(fixture.transport.client_send(client, &stream));

        fixture.step();
        fixture.step();
        let types: Vec<Value> = received(&fixture.transport, client)
            .into_iter()
            .map(|body| body["type"].clone())
            .collect();
        assert!(types.contains(&Value::from("initial_frame_complete")));
    }

    #[test]
    fn first_message_other_than_hello_closes_connection() {
        let mut fixture = Fixture::hub();
        let client = fixture.transport.open();
        fixture.send(client, &ClientMessage::Chat { text: "hi".to_string() });
        fixture.coordinator.tick(fixture.now);

        assert_eq!(
            fixture.transport.close_code(client).map(|(code, _)| code),
            Some(CLOSE_CODE_PROTOCOL)
        );
        assert_eq!(fixture.coordinator.session_count(), 0);
    }

    #[test]
    fn garbage_before_hello_closes_connection() {
        let mut fixture = Fixture::hub();
        let client = fixture.transport.open();
        assert!(fixture.transport.client_send(client, &[1, 0, 0, 0]));
        fixture.coordinator.tick(fixture.now);
        assert_eq!(
            fixture.transport.close_code(client).map(|(code, _)| code),
            Some(CLOSE_CODE_PROTOCOL)
        );
    }

    #[test]
    fn second_login_supersedes_the_first() {
        let mut fixture = Fixture::hub();
        let first = fixture.owned("Alice");
        let token = received(&fixture.transport, first)[0]["session_token"]
            .as_str()
            .expect("token should be present")
            .to_string();

        let second = fixture.hello("", Some(token));
        fixture.step();
        fixture.step();

        assert_eq!(
            fixture.transport.close_code(first).map(|(code, _)| code),
            Some(CLOSE_CODE_SUPERSEDED)
        );
        assert!(fixture.coordinator.placement_of(first).is_none());
        assert!(!fixture.lanes[0].owns(first));
        assert!(matches!(
            fixture.coordinator.placement_of(second),
            Some(Placement::Owned { .. })
        ));
    }

    #[test]
    fn stuck_placement_is_retried_then_closed() {
        let config = CoordinatorConfig {
            placement_timeout_ms: 10,
            max_placement_attempts: 2,
            ..CoordinatorConfig::default()
        };
        let mut fixture = Fixture::new(config, 1);
        let client = fixture.hello("Alice", None);
        let start = fixture.now;

        fixture.coordinator.tick(start);
        fixture.coordinator.tick(start + Duration::from_millis(20));
        assert!(matches!(
            fixture.coordinator.placement_of(client),
            Some(Placement::ConnectingIn { attempts: 2, .. })
        ));

        fixture.coordinator.tick(start + Duration::from_millis(40));
        assert!(fixture.coordinator.placement_of(client).is_none());
        assert_eq!(
            fixture.transport.close_code(client).map(|(code, _)| code),
            Some(CLOSE_CODE_SERVER)
        );
    }

    #[test]
    fn play_role_requires_pending_match() {
        let config = CoordinatorConfig {
            role: ServerRole::Play,
            ..CoordinatorConfig::default()
        };
        let mut fixture = Fixture::new(config, 1);
        let client = fixture.hello("Alice", None);
        fixture.coordinator.tick(fixture.now);

        let bodies = received(&fixture.transport, client);
        assert_eq!(bodies[0]["type"], "auth_rejected");
        assert_eq!(
            fixture.transport.close_code(client).map(|(code, _)| code),
            Some(CLOSE_CODE_REJECTED)
        );
    }

    #[test]
    fn client_close_releases_lane_ownership() {
        let mut fixture = Fixture::hub();
        let client = fixture.owned("Alice");
        fixture.transport.client_close(client);
        fixture.step();

        assert!(fixture.coordinator.placement_of(client).is_none());
        assert!(!fixture.lanes[0].owns(client));
        assert_eq!(fixture.coordinator.session_count(), 0);
    }

    #[test]
    fn created_match_pulls_online_players_over() {
        let mut fixture = Fixture::hub();
        let client = fixture.owned("Alice");
        let account_id = fixture
            .coordinator
            .account_of(client)
            .expect("account should be known")
            .account_id;

        fixture.coordinator.create_match(MatchSpec {
            match_id: 42,
            seats: vec![MatchSeat {
                account_id,
                team: 0,
                class_type: 1,
            }],
            bots: 0,
        });
        for _ in 0..4 {
            fixture.step();
        }

        assert_eq!(
            fixture.coordinator.placement_of(client),
            Some(Placement::Owned {
                lane: LaneId(0),
                instance: InstanceKey::Match(42),
            })
        );
        assert_eq!(fixture.lanes[0].instance_of(client), Some(InstanceKey::Match(42)));
        assert_eq!(
            fixture.coordinator.stats_handle().lock().expect("stats lock").pending_matches,
            0
        );
    }

    #[test]
    fn control_transfer_moves_connection_between_lanes() {
        let mut fixture = Fixture::hub();
        let client = fixture.owned("Alice");
        fixture
            .coordinator
            .request_transfer(client, Destination::on_lane(LaneId(1), InstanceKey::Hub));
        assert_eq!(
            fixture.coordinator.placement_of(client),
            Some(Placement::TransferringOut { lane: LaneId(0) })
        );
        fixture.step();
        fixture.step();

        assert_eq!(
            fixture.coordinator.placement_of(client),
            Some(Placement::Owned {
                lane: LaneId(1),
                instance: InstanceKey::Hub,
            })
        );
        assert!(!fixture.lanes[0].owns(client));
        assert!(fixture.lanes[1].owns(client));
    }

    #[test]
    fn round_robin_cycles_lanes() {
        let mut policy = RoundRobin::default();
        let picks: Vec<usize> = (0..5).map(|_| policy.choose_lane(3).0).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1]);
        assert_eq!(FirstLane.choose_lane(3), LaneId(0));
    }
}
