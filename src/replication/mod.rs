//! Per-instance replication: double-buffered frames, interest diff and per-connection
//! local id virtualization.

mod local_ids;

use std::collections::BTreeSet;

use tracing::warn;

use crate::error::{FrameError, ReplicationError};
use crate::frame::{EntityPayload, EntityRecord, FieldChanges, Frame};
use crate::outbox::{Outbox, QueuePolicy};
use crate::protocol::ServerMessage;
use crate::registry::ConnectionRegistry;
use crate::types::{ConnectionHandle, ConnectionState, EntityUid, LocalId};

pub use local_ids::{is_reserved, LocalIdTable};

#[derive(Debug)]
struct ClientReplica {
    state: ConnectionState,
    /// State as of the last `frame_end`; transitions are actioned when they differ.
    applied: ConnectionState,
    observed: BTreeSet<EntityUid>,
    local_ids: LocalIdTable,
}

impl ClientReplica {
    fn new() -> Self {
        Self {
            state: ConnectionState::Connected,
            applied: ConnectionState::Connected,
            observed: BTreeSet::new(),
            local_ids: LocalIdTable::new(),
        }
    }
}

#[derive(Debug)]
pub struct ReplicationEngine {
    current: Frame,
    previous: Frame,
    replicas: ConnectionRegistry<ClientReplica>,
}

impl ReplicationEngine {
    pub fn new(max_connections: usize) -> Self {
        Self {
            current: Frame::new(),
            previous: Frame::new(),
            replicas: ConnectionRegistry::with_capacity(max_connections),
        }
    }

    pub fn event_connect(&mut self, handle: ConnectionHandle) -> Result<(), ReplicationError> {
        self.replicas.attach(handle, ClientReplica::new())?;
        Ok(())
    }

    /// Forgets the connection and its local id table at once.
    pub fn event_disconnect(&mut self, handle: ConnectionHandle) -> bool {
        self.replicas.detach(handle).is_some()
    }

    pub fn is_connected(&self, handle: ConnectionHandle) -> bool {
        self.replicas.contains(handle)
    }

    pub fn connection_count(&self) -> usize {
        self.replicas.len()
    }

    pub fn state_of(&self, handle: ConnectionHandle) -> Option<ConnectionState> {
        self.replicas.get(handle).map(|replica| replica.state)
    }

    /// Moves the connection one step forward. Repeating the current state is a no-op and
    /// returns `false`; skipping or going back is a contract violation.
    pub fn advance_state(
        &mut self,
        handle: ConnectionHandle,
        to: ConnectionState,
    ) -> Result<bool, ReplicationError> {
        let replica = self
            .replicas
            .get_mut(handle)
            .ok_or(ReplicationError::UnknownConnection { handle })?;
        if replica.state == to {
            return Ok(false);
        }
        if replica.state.successor() != Some(to) {
            return Err(ReplicationError::InvalidTransition {
                handle,
                from: replica.state,
                to,
            });
        }
        replica.state = to;
        Ok(true)
    }

    /// Promises `local` (from the reserved range) to `uid` for this connection.
    pub fn preassign_local_id(
        &mut self,
        handle: ConnectionHandle,
        uid: EntityUid,
        local: LocalId,
    ) -> Result<(), ReplicationError> {
        if !is_reserved(local) {
            return Err(ReplicationError::NotReserved { local });
        }
        let replica = self
            .replicas
            .get_mut(handle)
            .ok_or(ReplicationError::UnknownConnection { handle })?;
        if replica.local_ids.is_claimed(local) {
            return Err(ReplicationError::LocalIdTaken { handle, local });
        }
        replica.local_ids.reserve(uid, local);
        Ok(())
    }

    pub fn push(&mut self, record: EntityRecord) -> Result<(), FrameError> {
        self.current.push(record)
    }

    /// The last committed frame.
    pub fn latest(&self) -> &Frame {
        &self.previous
    }

    pub fn observed(&self, handle: ConnectionHandle) -> Option<&BTreeSet<EntityUid>> {
        self.replicas.get(handle).map(|replica| &replica.observed)
    }

    pub fn local_id_of(
        &self,
        handle: ConnectionHandle,
        uid: EntityUid,
    ) -> Result<LocalId, ReplicationError> {
        let replica = self
            .replicas
            .get(handle)
            .ok_or(ReplicationError::UnknownConnection { handle })?;
        replica
            .local_ids
            .local_of(uid)
            .ok_or(ReplicationError::NotObserved { handle, uid })
    }

    pub fn entity_of(
        &self,
        handle: ConnectionHandle,
        local: LocalId,
    ) -> Result<EntityUid, ReplicationError> {
        let replica = self
            .replicas
            .get(handle)
            .ok_or(ReplicationError::UnknownConnection { handle })?;
        replica
            .local_ids
            .uid_of(local)
            .ok_or(ReplicationError::UnknownLocalId { handle, local })
    }

    pub fn check_bijection(&self, handle: ConnectionHandle) -> bool {
        self.replicas
            .get(handle)
            .map(|replica| replica.local_ids.matches(&replica.observed))
            .unwrap_or(false)
    }

    pub fn in_game(&self) -> Vec<ConnectionHandle> {
        self.replicas
            .iter()
            .filter(|(_, replica)| replica.state >= ConnectionState::InGame)
            .map(|(handle, _)| handle)
            .collect()
    }

    /// Queues a direct message for a connection registered with this engine.
    pub fn send_to(&self, outbox: &mut Outbox, handle: ConnectionHandle, message: ServerMessage) -> bool {
        if !self.replicas.contains(handle) {
            return false;
        }
        outbox.reliable(handle, message);
        true
    }

    pub fn send_to_all_in_game(&self, outbox: &mut Outbox, message: &ServerMessage) {
        for handle in self.in_game() {
            outbox.reliable(handle, message.clone());
        }
    }

    /// Diffs the current frame against every in-game connection's observed set, queues
    /// destroys, spawns and field updates in that order, then swaps the frames.
    pub fn frame_end(&mut self, outbox: &mut Outbox) {
        let current = &self.current;
        let previous = &self.previous;
        let changed: Vec<(EntityUid, FieldChanges)> = current
            .iter()
            .filter_map(|record| {
                let before = previous.get(record.uid)?;
                let changes = FieldChanges::between(before, record);
                changes.any().then_some((record.uid, changes))
            })
            .collect();

        for (handle, replica) in self.replicas.iter_mut() {
            if replica.state == ConnectionState::Connected {
                continue;
            }
            let view = current.view_for(handle);

            let removed: Vec<EntityUid> = replica.observed.difference(&view).copied().collect();
            for uid in removed {
                match replica.local_ids.release(uid) {
                    Some(local_id) => {
                        outbox.reliable(handle, ServerMessage::Destroy { local_id });
                    }
                    None => warn!(%handle, %uid, "observed entity had no local id"),
                }
            }

            let added: Vec<EntityUid> = view.difference(&replica.observed).copied().collect();
            for uid in &added {
                let Some(record) = current.get(*uid) else {
                    continue;
                };
                let local_id = replica.local_ids.bind(*uid);
                outbox.reliable(handle, spawn_message(record, local_id, handle));
            }

            for (uid, changes) in &changed {
                if !view.contains(uid) || added.binary_search(uid).is_ok() {
                    continue;
                }
                let Some(record) = current.get(*uid) else {
                    continue;
                };
                if record.owner == Some(handle) {
                    continue;
                }
                let Some(local_id) = replica.local_ids.local_of(*uid) else {
                    continue;
                };
                push_updates(outbox, handle, local_id, record, changes);
            }

            replica.observed = view;

            if replica.applied < ConnectionState::InGame {
                outbox.reliable(handle, ServerMessage::InitialFrameComplete);
            }
            if replica.applied < ConnectionState::Loaded
                && replica.state == ConnectionState::Loaded
            {
                outbox.reliable(handle, ServerMessage::LoadingComplete);
            }
            replica.applied = replica.state;
            replica.local_ids.end_frame();

            debug_assert!(
                replica.local_ids.matches(&replica.observed),
                "local id table diverged from observed set for {handle}"
            );
        }

        std::mem::swap(&mut self.previous, &mut self.current);
        self.current.clear();
    }
}

fn spawn_message(record: &EntityRecord, local_id: LocalId, to: ConnectionHandle) -> ServerMessage {
    match &record.payload {
        EntityPayload::Avatar {
            nickname,
            class_type,
        } => ServerMessage::SpawnAvatar {
            local_id,
            nickname: nickname.clone(),
            class_type: *class_type,
            transform: record.transform,
            action: record.action,
            is_self: record.owner == Some(to),
        },
        EntityPayload::Npc { npc_type } => ServerMessage::SpawnNpc {
            local_id,
            npc_type: *npc_type,
            transform: record.transform,
            action: record.action,
        },
        EntityPayload::Prop { prop_type } => ServerMessage::SpawnProp {
            local_id,
            prop_type: *prop_type,
            transform: record.transform,
        },
        EntityPayload::Service(service) => ServerMessage::SpawnService {
            local_id,
            service: service.service.clone(),
            revision: service.revision,
            body: service.body.clone(),
        },
    }
}

fn push_updates(
    outbox: &mut Outbox,
    handle: ConnectionHandle,
    local_id: LocalId,
    record: &EntityRecord,
    changes: &FieldChanges,
) {
    if changes.transform {
        outbox.push(
            handle,
            ServerMessage::UpdateTransform {
                local_id,
                transform: record.transform,
            },
            QueuePolicy::DropOnFull,
        );
    }
    if changes.action {
        outbox.reliable(
            handle,
            ServerMessage::UpdateAction {
                local_id,
                action: record.action,
            },
        );
    }
    if changes.service {
        if let EntityPayload::Service(service) = &record.payload {
            outbox.reliable(
                handle,
                ServerMessage::UpdateService {
                    local_id,
                    revision: service.revision,
                    body: service.body.clone(),
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{LOCAL_ID_DYNAMIC_FIRST, LOCAL_ID_SELF_FIRST};
    use crate::frame::tests::npc;
    use crate::frame::Interest;
    use crate::types::{ActionState, Transform, Vec3};

    const A: ConnectionHandle = ConnectionHandle(1);
    const B: ConnectionHandle = ConnectionHandle(2);

    fn in_game(engine: &mut ReplicationEngine, handle: ConnectionHandle) {
        engine.event_connect(handle).expect("connect should succeed");
        engine
            .advance_state(handle, ConnectionState::InGame)
            .expect("transition should succeed");
    }

    fn run(engine: &mut ReplicationEngine, records: &[EntityRecord]) -> Outbox {
        for record in records {
            engine.push(record.clone()).expect("push should succeed");
        }
        let mut outbox = Outbox::new();
        engine.frame_end(&mut outbox);
        outbox
    }

    fn local(engine: &ReplicationEngine, handle: ConnectionHandle, uid: u32) -> LocalId {
        engine
            .local_id_of(handle, EntityUid(uid))
            .expect("entity should be observed")
    }

    fn moved(uid: u32, x: f32) -> EntityRecord {
        let mut record = npc(uid);
        record.transform = Transform {
            pos: Vec3::new(x, 0.0, 0.0),
            ..Transform::default()
        };
        record
    }

    #[test]
    fn direct_messages_skip_unknown_and_loading_connections() {
        let mut engine = ReplicationEngine::new(8);
        in_game(&mut engine, A);
        engine.event_connect(B).expect("connect should succeed");
        let mut outbox = Outbox::new();
        assert!(engine.send_to(&mut outbox, B, ServerMessage::error("hi")));
        assert!(!engine.send_to(&mut outbox, ConnectionHandle(99), ServerMessage::error("hi")));
        engine.send_to_all_in_game(&mut outbox, &ServerMessage::SystemNotice { text: "x".to_string() });
        assert_eq!(outbox.len(), 2);
        assert_eq!(outbox.messages_for(A).len(), 1);
    }

    #[test]
    fn new_entity_spawns_once_and_unchanged_stays_quiet() {
        let mut engine = ReplicationEngine::new(8);
        in_game(&mut engine, A);
        run(&mut engine, &[npc(1)]);

        let outbox = run(&mut engine, &[npc(1), npc(2)]);
        let messages = outbox.messages_for(A);
        assert_eq!(messages.len(), 1);
        assert!(matches!(
            messages[0],
            ServerMessage::SpawnNpc { local_id, .. } if *local_id == local(&engine, A, 2)
        ));
    }

    #[test]
    fn removed_entity_is_destroyed_before_new_one_spawns() {
        let mut engine = ReplicationEngine::new(8);
        in_game(&mut engine, A);
        run(&mut engine, &[npc(1), npc(2)]);
        let b_local = local(&engine, A, 2);

        let outbox = run(&mut engine, &[npc(1), npc(3)]);
        let messages = outbox.messages_for(A);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], &ServerMessage::Destroy { local_id: b_local });
        assert!(matches!(messages[1], ServerMessage::SpawnNpc { .. }));
        assert!(engine.local_id_of(A, EntityUid(2)).is_err());
        assert!(engine.check_bijection(A));
    }

    #[test]
    fn connections_have_independent_namespaces() {
        let mut engine = ReplicationEngine::new(8);
        in_game(&mut engine, A);
        run(&mut engine, &[npc(10)]);
        in_game(&mut engine, B);
        let mut only_b = npc(11);
        only_b.interest = Interest::Only(BTreeSet::from([B]));
        run(&mut engine, &[npc(10), only_b.clone()]);
        run(&mut engine, &[npc(10), only_b, npc(12)]);

        assert_eq!(local(&engine, A, 10), LocalId(LOCAL_ID_DYNAMIC_FIRST));
        assert_eq!(local(&engine, B, 10), LocalId(LOCAL_ID_DYNAMIC_FIRST));
        assert_eq!(local(&engine, A, 12), LocalId(LOCAL_ID_DYNAMIC_FIRST + 1));
        assert_eq!(local(&engine, B, 12), LocalId(LOCAL_ID_DYNAMIC_FIRST + 2));
        assert!(engine.check_bijection(A));
        assert!(engine.check_bijection(B));
    }

    #[test]
    fn unchanged_frame_is_idempotent() {
        let mut engine = ReplicationEngine::new(8);
        in_game(&mut engine, A);
        run(&mut engine, &[npc(1), moved(2, 5.0)]);
        let outbox = run(&mut engine, &[npc(1), moved(2, 5.0)]);
        assert!(outbox.is_empty());
    }

    #[test]
    fn field_changes_produce_updates_beyond_epsilon() {
        let mut engine = ReplicationEngine::new(8);
        in_game(&mut engine, A);
        run(&mut engine, &[moved(1, 0.0)]);

        assert!(run(&mut engine, &[moved(1, 0.2)]).is_empty());

        let mut acting = moved(1, 3.0);
        acting.action = ActionState {
            state: 4,
            param1: 1,
            param2: 0,
        };
        let outbox = run(&mut engine, &[acting]);
        let messages = outbox.messages_for(A);
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0], ServerMessage::UpdateTransform { .. }));
        assert!(matches!(messages[1], ServerMessage::UpdateAction { .. }));
    }

    #[test]
    fn owner_does_not_receive_own_updates() {
        let mut engine = ReplicationEngine::new(8);
        in_game(&mut engine, A);
        in_game(&mut engine, B);
        let mut avatar = moved(1, 0.0);
        avatar.owner = Some(A);
        run(&mut engine, &[avatar.clone()]);

        avatar.transform.pos.x = 10.0;
        let outbox = run(&mut engine, &[avatar]);
        assert!(outbox.messages_for(A).is_empty());
        assert_eq!(outbox.messages_for(B).len(), 1);
    }

    #[test]
    fn entity_spawned_this_tick_gets_no_update() {
        let mut engine = ReplicationEngine::new(8);
        in_game(&mut engine, A);
        run(&mut engine, &[moved(1, 0.0)]);
        engine.event_connect(B).expect("connect should succeed");
        engine
            .advance_state(B, ConnectionState::InGame)
            .expect("transition should succeed");

        let outbox = run(&mut engine, &[moved(1, 9.0)]);
        let for_b = outbox.messages_for(B);
        assert!(matches!(for_b[0], ServerMessage::SpawnNpc { .. }));
        assert!(!for_b
            .iter()
            .any(|message| matches!(message, ServerMessage::UpdateTransform { .. })));
        assert_eq!(outbox.messages_for(A).len(), 1);
    }

    #[test]
    fn connected_state_receives_nothing() {
        let mut engine = ReplicationEngine::new(8);
        engine.event_connect(A).expect("connect should succeed");
        let outbox = run(&mut engine, &[npc(1)]);
        assert!(outbox.is_empty());
        assert_eq!(engine.observed(A).map(BTreeSet::len), Some(0));
    }

    #[test]
    fn initial_frame_and_loading_complete_fire_once() {
        let mut engine = ReplicationEngine::new(8);
        in_game(&mut engine, A);
        let outbox = run(&mut engine, &[npc(1)]);
        let messages = outbox.messages_for(A);
        assert!(matches!(messages[0], ServerMessage::SpawnNpc { .. }));
        assert_eq!(messages[1], &ServerMessage::InitialFrameComplete);

        engine
            .advance_state(A, ConnectionState::Loaded)
            .expect("transition should succeed");
        let outbox = run(&mut engine, &[npc(1)]);
        assert_eq!(
            outbox.messages_for(A),
            vec![&ServerMessage::LoadingComplete]
        );

        assert!(run(&mut engine, &[npc(1)]).is_empty());
    }

    #[test]
    fn state_transitions_are_strict() {
        let mut engine = ReplicationEngine::new(8);
        engine.event_connect(A).expect("connect should succeed");
        assert!(matches!(
            engine.advance_state(A, ConnectionState::Loaded),
            Err(ReplicationError::InvalidTransition { .. })
        ));
        assert_eq!(engine.advance_state(A, ConnectionState::InGame), Ok(true));
        assert_eq!(engine.advance_state(A, ConnectionState::InGame), Ok(false));
        assert!(engine.advance_state(A, ConnectionState::Connected).is_err());
    }

    #[test]
    fn reverse_lookup_of_unobserved_local_is_violation() {
        let mut engine = ReplicationEngine::new(8);
        in_game(&mut engine, A);
        run(&mut engine, &[npc(1)]);
        assert_eq!(
            engine.entity_of(A, LocalId(LOCAL_ID_DYNAMIC_FIRST)),
            Ok(EntityUid(1))
        );
        assert_eq!(
            engine.entity_of(A, LocalId(4242)),
            Err(ReplicationError::UnknownLocalId {
                handle: A,
                local: LocalId(4242)
            })
        );
        assert!(matches!(
            engine.entity_of(B, LocalId(1)),
            Err(ReplicationError::UnknownConnection { .. })
        ));
    }

    #[test]
    fn preassigned_self_id_is_used_on_spawn() {
        let mut engine = ReplicationEngine::new(8);
        engine.event_connect(A).expect("connect should succeed");
        engine
            .preassign_local_id(A, EntityUid(50), LocalId(LOCAL_ID_SELF_FIRST))
            .expect("preassign should succeed");
        assert!(matches!(
            engine.preassign_local_id(A, EntityUid(51), LocalId(LOCAL_ID_SELF_FIRST)),
            Err(ReplicationError::LocalIdTaken { .. })
        ));
        assert!(matches!(
            engine.preassign_local_id(A, EntityUid(51), LocalId(LOCAL_ID_DYNAMIC_FIRST)),
            Err(ReplicationError::NotReserved { .. })
        ));

        engine
            .advance_state(A, ConnectionState::InGame)
            .expect("transition should succeed");
        let mut avatar = npc(50);
        avatar.owner = Some(A);
        avatar.payload = EntityPayload::Avatar {
            nickname: "me".to_string(),
            class_type: 2,
        };
        let outbox = run(&mut engine, &[avatar]);
        assert!(matches!(
            outbox.messages_for(A)[0],
            ServerMessage::SpawnAvatar { local_id, is_self: true, .. }
                if *local_id == LocalId(LOCAL_ID_SELF_FIRST)
        ));
    }

    #[test]
    fn disconnect_drops_table_immediately() {
        let mut engine = ReplicationEngine::new(8);
        in_game(&mut engine, A);
        run(&mut engine, &[npc(1)]);
        assert!(engine.event_disconnect(A));
        assert!(engine.local_id_of(A, EntityUid(1)).is_err());
        assert!(!engine.event_disconnect(A));
        assert!(run(&mut engine, &[npc(1)]).is_empty());
    }

    #[test]
    fn freed_local_is_not_reused_within_the_same_frame() {
        let mut engine = ReplicationEngine::new(8);
        in_game(&mut engine, A);
        run(&mut engine, &[npc(1)]);
        let freed = local(&engine, A, 1);

        run(&mut engine, &[npc(2)]);
        assert_ne!(local(&engine, A, 2), freed);

        run(&mut engine, &[npc(2), npc(3)]);
        assert_eq!(local(&engine, A, 3), freed);
    }

    #[test]
    fn duplicate_entity_in_frame_is_error() {
        let mut engine = ReplicationEngine::new(8);
        engine.push(npc(1)).expect("push should succeed");
        assert!(engine.push(npc(1)).is_err());
    }
}
