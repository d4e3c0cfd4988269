//! Isolated worlds hosted on a lane. Every variant owns one `World` and one
//! `ReplicationEngine` and follows the same lifecycle.

mod hub;
mod pvp;
mod room;

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::constants::{
    DEFAULT_MATCH_CONNECT_TIMEOUT_MS, DEFAULT_MATCH_DURATION_MS, DEFAULT_MAX_CLIENTS,
    DEFAULT_MAX_CONTRACT_VIOLATIONS, LOCAL_ID_SELF_FIRST,
};
use crate::error::InstanceError;
use crate::outbox::{Outbox, QueuePolicy};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::replication::ReplicationEngine;
use crate::types::{
    AccountContext, ConnectionHandle, ConnectionState, ControlMessage, Destination, EntityUid,
    InstanceKey, LaneId, LocalId, MatchSpec, RoomSpec,
};
use crate::world::{SandboxWorld, World};

pub use hub::HubInstance;
pub use pvp::PvpMatchInstance;
pub use room::RoomInstance;

/// Requests an instance makes of its lane. Applied at the end of the lane tick.
#[derive(Clone, Debug, PartialEq)]
pub enum InstanceCommand {
    Transfer {
        handle: ConnectionHandle,
        destination: Destination,
    },
    Disconnect {
        handle: ConnectionHandle,
        reason: String,
    },
    Spawn(InstanceSpec),
    Terminate,
}

#[derive(Clone, Debug, PartialEq)]
pub enum InstanceSpec {
    Hub,
    Room(RoomSpec),
    Match(MatchSpec),
}

impl InstanceSpec {
    pub fn key(&self) -> InstanceKey {
        match self {
            Self::Hub => InstanceKey::Hub,
            Self::Room(spec) => InstanceKey::Room(spec.room_id),
            Self::Match(spec) => InstanceKey::Match(spec.match_id),
        }
    }
}

#[derive(Clone, Debug)]
pub struct InstanceSettings {
    pub max_clients: usize,
    pub max_contract_violations: u32,
    pub match_duration_ms: u64,
    pub match_connect_timeout_ms: u64,
    pub seed: u64,
}

impl Default for InstanceSettings {
    fn default() -> Self {
        Self {
            max_clients: DEFAULT_MAX_CLIENTS,
            max_contract_violations: DEFAULT_MAX_CONTRACT_VIOLATIONS,
            match_duration_ms: DEFAULT_MATCH_DURATION_MS,
            match_connect_timeout_ms: DEFAULT_MATCH_CONNECT_TIMEOUT_MS,
            seed: 0,
        }
    }
}

pub struct InstanceContext<'a> {
    pub lane: LaneId,
    pub tick: u64,
    pub dt_ms: u64,
    pub outbox: &'a mut Outbox,
    pub commands: &'a mut Vec<InstanceCommand>,
}

#[derive(Clone, Debug)]
pub(crate) struct Member {
    pub account: AccountContext,
    pub avatar: Option<EntityUid>,
    pub violations: u32,
}

/// State and behaviour shared by every instance variant.
pub(crate) struct InstanceCore {
    pub key: InstanceKey,
    pub engine: ReplicationEngine,
    pub world: Box<dyn World>,
    pub members: BTreeMap<ConnectionHandle, Member>,
    pub settings: InstanceSettings,
}

impl InstanceCore {
    pub fn new(key: InstanceKey, world: Box<dyn World>, settings: InstanceSettings) -> Self {
        Self {
            key,
            engine: ReplicationEngine::new(settings.max_clients),
            world,
            members: BTreeMap::new(),
            settings,
        }
    }

    /// Registers with the engine before anything else is sent to the connection.
    pub fn join(
        &mut self,
        ctx: &mut InstanceContext<'_>,
        handle: ConnectionHandle,
        account: AccountContext,
        with_avatar: bool,
    ) -> Result<(), InstanceError> {
        self.engine.event_connect(handle)?;
        ctx.outbox
            .reliable(handle, ServerMessage::EnterInstance { instance: self.key });

        let avatar = if with_avatar {
            let uid = self.world.spawn_avatar(handle, &account);
            self.engine
                .preassign_local_id(handle, uid, LocalId(LOCAL_ID_SELF_FIRST))?;
            Some(uid)
        } else {
            None
        };
        self.members.insert(
            handle,
            Member {
                account,
                avatar,
                violations: 0,
            },
        );
        Ok(())
    }

    pub fn leave(&mut self, handle: ConnectionHandle) -> Option<Member> {
        self.engine.event_disconnect(handle);
        let member = self.members.remove(&handle)?;
        if let Some(avatar) = member.avatar {
            self.world.despawn(avatar);
        }
        Some(member)
    }

    /// Handles the messages every variant treats the same way. Anything else is handed
    /// back to the caller.
    pub fn handle_common(
        &mut self,
        ctx: &mut InstanceContext<'_>,
        handle: ConnectionHandle,
        message: ClientMessage,
    ) -> Result<Option<ClientMessage>, InstanceError> {
        if !self.members.contains_key(&handle) {
            return Err(InstanceError::NotMember {
                handle,
                instance: self.key,
            });
        }
        match message {
            ClientMessage::MapLoaded => {
                self.engine.advance_state(handle, ConnectionState::InGame)?;
            }
            ClientMessage::LoadingComplete => {
                self.engine.advance_state(handle, ConnectionState::Loaded)?;
            }
            ClientMessage::UpdatePosition {
                local_id,
                transform,
            } => {
                let uid = self.engine.entity_of(handle, local_id)?;
                self.world.apply_transform(handle, uid, transform)?;
            }
            ClientMessage::SyncActionState { local_id, action } => {
                let uid = self.engine.entity_of(handle, local_id)?;
                self.world.apply_action(handle, uid, action)?;
            }
            ClientMessage::Rtt { t } => {
                ctx.outbox
                    .push(handle, ServerMessage::Pong { t }, QueuePolicy::DropOnFull);
            }
            ClientMessage::GetEntityInfo { local_id } => {
                let uid = self.engine.entity_of(handle, local_id)?;
                if let Some(description) = self.world.describe(uid) {
                    ctx.outbox.reliable(
                        handle,
                        ServerMessage::EntityInfo {
                            local_id,
                            kind: description.kind,
                            nickname: description.nickname,
                        },
                    );
                }
            }
            ClientMessage::Hello { .. } => {
                debug!(%handle, instance = %self.key, "ignoring hello from authenticated connection");
            }
            other => return Ok(Some(other)),
        }
        Ok(None)
    }

    /// Counts a rejected message against the connection; past the limit it is disconnected.
    pub fn record_violation(
        &mut self,
        ctx: &mut InstanceContext<'_>,
        handle: ConnectionHandle,
        error: &InstanceError,
    ) {
        warn!(%handle, instance = %self.key, %error, "rejected client message");
        let Some(member) = self.members.get_mut(&handle) else {
            return;
        };
        member.violations += 1;
        if member.violations == self.settings.max_contract_violations {
            ctx.outbox
                .reliable(handle, ServerMessage::error("too many invalid messages"));
            ctx.commands.push(InstanceCommand::Disconnect {
                handle,
                reason: format!("{} contract violations", member.violations),
            });
        }
    }

    pub fn broadcast(&self, ctx: &mut InstanceContext<'_>, message: ServerMessage) {
        for handle in self.members.keys() {
            ctx.outbox.reliable(*handle, message.clone());
        }
    }

    pub fn transfer_all(&self, ctx: &mut InstanceContext<'_>, destination: Destination) {
        for handle in self.members.keys() {
            ctx.commands.push(InstanceCommand::Transfer {
                handle: *handle,
                destination,
            });
        }
    }

    /// Advances the world and runs exactly one replication pass.
    pub fn step(&mut self, ctx: &mut InstanceContext<'_>) -> Result<(), InstanceError> {
        let key = self.key;
        let records = self
            .world
            .update(ctx.tick, ctx.dt_ms)
            .map_err(|err| InstanceError::Fatal {
                instance: key,
                reason: err.to_string(),
            })?;
        for record in records {
            self.engine
                .push(record)
                .map_err(|err| InstanceError::Fatal {
                    instance: key,
                    reason: err.to_string(),
                })?;
        }
        self.engine.frame_end(ctx.outbox);
        Ok(())
    }
}

pub enum Instance {
    Hub(HubInstance),
    Room(RoomInstance),
    Match(PvpMatchInstance),
}

impl Instance {
    pub fn create(spec: InstanceSpec, settings: InstanceSettings) -> Self {
        let world: Box<dyn World> = match &spec {
            InstanceSpec::Hub => Box::new(SandboxWorld::hub(settings.seed)),
            InstanceSpec::Room(_) => Box::new(SandboxWorld::new(settings.seed)),
            InstanceSpec::Match(match_spec) => {
                Box::new(SandboxWorld::arena(settings.seed, match_spec.bots))
            }
        };
        Self::with_world(spec, settings, world)
    }

    pub fn with_world(spec: InstanceSpec, settings: InstanceSettings, world: Box<dyn World>) -> Self {
        let core = InstanceCore::new(spec.key(), world, settings);
        match spec {
            InstanceSpec::Hub => Self::Hub(HubInstance::new(core)),
            InstanceSpec::Room(room) => Self::Room(RoomInstance::new(core, room)),
            InstanceSpec::Match(spec) => Self::Match(PvpMatchInstance::new(core, spec)),
        }
    }

    fn core(&self) -> &InstanceCore {
        match self {
            Self::Hub(hub) => &hub.core,
            Self::Room(room) => &room.core,
            Self::Match(pvp) => &pvp.core,
        }
    }

    fn core_mut(&mut self) -> &mut InstanceCore {
        match self {
            Self::Hub(hub) => &mut hub.core,
            Self::Room(room) => &mut room.core,
            Self::Match(pvp) => &mut pvp.core,
        }
    }

    pub fn key(&self) -> InstanceKey {
        self.core().key
    }

    pub fn engine(&self) -> &ReplicationEngine {
        &self.core().engine
    }

    pub fn members(&self) -> Vec<ConnectionHandle> {
        self.core().members.keys().copied().collect()
    }

    pub fn member_count(&self) -> usize {
        self.core().members.len()
    }

    pub fn is_terminated(&self) -> bool {
        match self {
            Self::Hub(_) => false,
            Self::Room(room) => room.is_terminated(),
            Self::Match(pvp) => pvp.is_terminated(),
        }
    }

    pub fn init(&mut self, ctx: &mut InstanceContext<'_>) -> Result<(), InstanceError> {
        match self {
            Self::Hub(hub) => hub.init(ctx),
            Self::Room(room) => room.init(ctx),
            Self::Match(pvp) => pvp.init(ctx),
        }
    }

    pub fn on_client_joined(
        &mut self,
        ctx: &mut InstanceContext<'_>,
        handle: ConnectionHandle,
        account: AccountContext,
    ) -> Result<(), InstanceError> {
        match self {
            Self::Hub(hub) => hub.core.join(ctx, handle, account, true),
            Self::Room(room) => room.on_client_joined(ctx, handle, account),
            Self::Match(pvp) => pvp.on_client_joined(ctx, handle, account),
        }
    }

    pub fn on_client_left(&mut self, ctx: &mut InstanceContext<'_>, handle: ConnectionHandle) {
        let left = self.core_mut().leave(handle);
        if left.is_none() {
            debug!(%handle, instance = %self.key(), "client left but was not a member");
            return;
        }
        if let Self::Match(pvp) = self {
            pvp.on_client_left(ctx, handle);
        }
    }

    pub fn on_packet(
        &mut self,
        ctx: &mut InstanceContext<'_>,
        handle: ConnectionHandle,
        message: ClientMessage,
    ) {
        let common = self.core_mut().handle_common(ctx, handle, message);
        let result = match common {
            Ok(None) => Ok(()),
            Ok(Some(specific)) => match self {
                Self::Hub(hub) => hub.on_packet(ctx, handle, specific),
                Self::Room(room) => room.on_packet(ctx, handle, specific),
                Self::Match(pvp) => pvp.on_packet(ctx, handle, specific),
            },
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            self.core_mut().record_violation(ctx, handle, &err);
        }
    }

    pub fn on_control(
        &mut self,
        ctx: &mut InstanceContext<'_>,
        target: Option<ConnectionHandle>,
        message: &ControlMessage,
    ) {
        if let ControlMessage::Announcement { text } = message {
            let notice = ServerMessage::SystemNotice { text: text.clone() };
            match target {
                Some(handle) => ctx.outbox.reliable(handle, notice),
                None => self.core().broadcast(ctx, notice),
            }
            return;
        }
        match self {
            Self::Hub(hub) => hub.on_control(ctx, target, message),
            _ => debug!(instance = %self.key(), ?message, "control message ignored"),
        }
    }

    pub fn update(&mut self, ctx: &mut InstanceContext<'_>) -> Result<(), InstanceError> {
        match self {
            Self::Hub(hub) => hub.update(ctx),
            Self::Room(room) => room.update(ctx),
            Self::Match(pvp) => pvp.update(ctx),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::WorldError;
    use crate::frame::EntityRecord;
    use crate::types::{AccountId, ActionState, Transform};
    use crate::world::EntityDescription;
    use serde_json::Value;

    pub(crate) struct Harness {
        pub outbox: Outbox,
        pub commands: Vec<InstanceCommand>,
        pub tick: u64,
    }

    impl Harness {
        pub fn new() -> Self {
            Self {
                outbox: Outbox::new(),
                commands: Vec::new(),
                tick: 0,
            }
        }

        pub fn ctx(&mut self) -> InstanceContext<'_> {
            InstanceContext {
                lane: LaneId(0),
                tick: self.tick,
                dt_ms: 50,
                outbox: &mut self.outbox,
                commands: &mut self.commands,
            }
        }

        pub fn update(&mut self, instance: &mut Instance) -> Result<(), InstanceError> {
            self.tick += 1;
            let mut ctx = self.ctx();
            instance.update(&mut ctx)
        }
    }

    pub(crate) fn account(id: u64) -> AccountContext {
        AccountContext {
            account_id: AccountId(id),
            nickname: format!("player{id}"),
            leader_class: 1,
        }
    }

    pub(crate) fn settings() -> InstanceSettings {
        InstanceSettings {
            max_clients: 16,
            max_contract_violations: 3,
            match_duration_ms: 500,
            match_connect_timeout_ms: 1_000,
            seed: 5,
        }
    }

    #[test]
    fn join_announces_instance_before_any_entity() {
        let mut harness = Harness::new();
        let mut hub = Instance::create(InstanceSpec::Hub, settings());
        hub.init(&mut harness.ctx()).expect("init should succeed");
        hub.on_client_joined(&mut harness.ctx(), ConnectionHandle(1), account(1))
            .expect("join should succeed");
        hub.on_packet(&mut harness.ctx(), ConnectionHandle(1), ClientMessage::MapLoaded);
        harness.update(&mut hub).expect("update should succeed");

        let messages = harness.outbox.messages_for(ConnectionHandle(1));
        assert_eq!(
            messages[0],
            &ServerMessage::EnterInstance {
                instance: InstanceKey::Hub
            }
        );
        assert!(messages.iter().any(|message| matches!(
            message,
            ServerMessage::SpawnAvatar { is_self: true, local_id, .. } if local_id.0 == LOCAL_ID_SELF_FIRST
        )));
    }

    #[test]
    fn repeated_violations_disconnect() {
        let mut harness = Harness::new();
        let mut hub = Instance::create(InstanceSpec::Hub, settings());
        hub.init(&mut harness.ctx()).expect("init should succeed");
        let handle = ConnectionHandle(2);
        hub.on_client_joined(&mut harness.ctx(), handle, account(2))
            .expect("join should succeed");

        for _ in 0..3 {
            hub.on_packet(
                &mut harness.ctx(),
                handle,
                ClientMessage::UpdatePosition {
                    local_id: LocalId(5555),
                    transform: Transform::default(),
                },
            );
        }
        assert_eq!(harness.commands.len(), 1);
        assert!(matches!(
            harness.commands[0],
            InstanceCommand::Disconnect { handle: h, .. } if h == handle
        ));
    }

    #[test]
    fn moving_own_avatar_through_local_id() {
        let mut harness = Harness::new();
        let mut hub = Instance::create(InstanceSpec::Hub, settings());
        hub.init(&mut harness.ctx()).expect("init should succeed");
        let handle = ConnectionHandle(3);
        hub.on_client_joined(&mut harness.ctx(), handle, account(3))
            .expect("join should succeed");
        hub.on_packet(&mut harness.ctx(), handle, ClientMessage::MapLoaded);
        harness.update(&mut hub).expect("update should succeed");

        hub.on_packet(
            &mut harness.ctx(),
            handle,
            ClientMessage::SyncActionState {
                local_id: LocalId(LOCAL_ID_SELF_FIRST),
                action: ActionState {
                    state: 2,
                    param1: 0,
                    param2: 0,
                },
            },
        );
        assert!(harness.commands.is_empty());
        let Instance::Hub(inner) = &hub else {
            panic!("expected hub");
        };
        assert!(inner.core.members.values().all(|member| member.violations == 0));
    }

    #[test]
    fn packets_from_strangers_are_violations_without_panic() {
        let mut harness = Harness::new();
        let mut hub = Instance::create(InstanceSpec::Hub, settings());
        hub.on_packet(&mut harness.ctx(), ConnectionHandle(77), ClientMessage::MapLoaded);
        assert!(harness.commands.is_empty());
    }

    struct BrokenWorld;

    impl World for BrokenWorld {
        fn update(&mut self, _tick: u64, _dt_ms: u64) -> Result<Vec<EntityRecord>, WorldError> {
            Err(WorldError::Simulation("physics exploded".to_string()))
        }
        fn spawn_avatar(&mut self, _owner: ConnectionHandle, _account: &AccountContext) -> EntityUid {
            EntityUid::next()
        }
        fn spawn_service(&mut self, _service: &str, _body: Value) -> EntityUid {
            EntityUid::next()
        }
        fn update_service(&mut self, uid: EntityUid, _body: Value) -> Result<u64, WorldError> {
            Err(WorldError::UnknownEntity { uid })
        }
        fn despawn(&mut self, _uid: EntityUid) -> bool {
            false
        }
        fn apply_transform(
            &mut self,
            _owner: ConnectionHandle,
            uid: EntityUid,
            _transform: Transform,
        ) -> Result<(), WorldError> {
            Err(WorldError::UnknownEntity { uid })
        }
        fn apply_action(
            &mut self,
            _owner: ConnectionHandle,
            uid: EntityUid,
            _action: ActionState,
        ) -> Result<(), WorldError> {
            Err(WorldError::UnknownEntity { uid })
        }
        fn describe(&self, _uid: EntityUid) -> Option<EntityDescription> {
            None
        }
    }

    pub(crate) fn broken_hub() -> Instance {
        Instance::with_world(InstanceSpec::Hub, settings(), Box::new(BrokenWorld))
    }

    #[test]
    fn world_failure_is_fatal() {
        let mut harness = Harness::new();
        let mut hub = broken_hub();
        let err = harness
            .update(&mut hub)
            .expect_err("broken world should fail");
        assert!(err.is_fatal());
    }
}
