use std::collections::{BTreeMap, BTreeSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;

use crate::constants::{HUB_HALF_EXTENT, HUB_NPC_COUNT, HUB_NPC_VIEW_RADIUS, NPC_WANDER_SPEED};
use crate::error::WorldError;
use crate::frame::{EntityPayload, EntityRecord, Interest, ServiceState};
use crate::types::{
    AccountContext, ActionState, ConnectionHandle, EntityKind, EntityUid, Transform, Vec3,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntityDescription {
    pub kind: EntityKind,
    pub nickname: Option<String>,
}

/// Simulation behind one instance. `update` is the pull source for each tick's frame;
/// entity creation and removal are inferred from presence across frames.
pub trait World: Send {
    fn update(&mut self, tick: u64, dt_ms: u64) -> Result<Vec<EntityRecord>, WorldError>;

    fn spawn_avatar(&mut self, owner: ConnectionHandle, account: &AccountContext) -> EntityUid;

    fn spawn_service(&mut self, service: &str, body: Value) -> EntityUid;

    /// Replaces a service object's body and returns its new revision.
    fn update_service(&mut self, uid: EntityUid, body: Value) -> Result<u64, WorldError>;

    fn despawn(&mut self, uid: EntityUid) -> bool;

    fn apply_transform(
        &mut self,
        owner: ConnectionHandle,
        uid: EntityUid,
        transform: Transform,
    ) -> Result<(), WorldError>;

    fn apply_action(
        &mut self,
        owner: ConnectionHandle,
        uid: EntityUid,
        action: ActionState,
    ) -> Result<(), WorldError>;

    fn describe(&self, uid: EntityUid) -> Option<EntityDescription>;
}

#[derive(Clone, Debug)]
struct SimEntity {
    owner: Option<ConnectionHandle>,
    transform: Transform,
    action: ActionState,
    payload: EntityPayload,
    wander_target: Option<Vec3>,
    view_radius: Option<f32>,
}

/// Small stand-in simulation: wandering NPCs, static props, client-driven avatars and
/// service objects.
pub struct SandboxWorld {
    entities: BTreeMap<EntityUid, SimEntity>,
    rng: StdRng,
    half_extent: f32,
}

impl SandboxWorld {
    pub fn new(seed: u64) -> Self {
        Self {
            entities: BTreeMap::new(),
            rng: StdRng::seed_from_u64(seed),
            half_extent: HUB_HALF_EXTENT,
        }
    }

    /// Social space: NPCs only show up for avatars within their view radius.
    pub fn hub(seed: u64) -> Self {
        let mut world = Self::new(seed);
        for index in 0..HUB_NPC_COUNT {
            let pos = world.random_point();
            world.spawn_npc((index % 3) as u16 + 1, pos, Some(HUB_NPC_VIEW_RADIUS));
        }
        world.spawn_prop(1, Vec3::ZERO);
        world
    }

    /// Match arena: props plus `bots` wandering NPCs visible to everyone.
    pub fn arena(seed: u64, bots: u8) -> Self {
        let mut world = Self::new(seed);
        world.spawn_prop(10, Vec3::new(-50.0, 0.0, 0.0));
        world.spawn_prop(10, Vec3::new(50.0, 0.0, 0.0));
        for _ in 0..bots {
            let pos = world.random_point();
            world.spawn_npc(100, pos, None);
        }
        world
    }

    pub fn spawn_npc(&mut self, npc_type: u16, pos: Vec3, view_radius: Option<f32>) -> EntityUid {
        let uid = EntityUid::next();
        self.entities.insert(
            uid,
            SimEntity {
                owner: None,
                transform: Transform {
                    pos,
                    ..Transform::default()
                },
                action: ActionState::default(),
                payload: EntityPayload::Npc { npc_type },
                wander_target: Some(pos),
                view_radius,
            },
        );
        uid
    }

    pub fn spawn_prop(&mut self, prop_type: u16, pos: Vec3) -> EntityUid {
        let uid = EntityUid::next();
        self.entities.insert(
            uid,
            SimEntity {
                owner: None,
                transform: Transform {
                    pos,
                    ..Transform::default()
                },
                action: ActionState::default(),
                payload: EntityPayload::Prop { prop_type },
                wander_target: None,
                view_radius: None,
            },
        );
        uid
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    fn random_point(&mut self) -> Vec3 {
        let extent = self.half_extent;
        Vec3::new(
            self.rng.random_range(-extent..extent),
            0.0,
            self.rng.random_range(-extent..extent),
        )
    }

    fn owned_mut(
        &mut self,
        owner: ConnectionHandle,
        uid: EntityUid,
    ) -> Result<&mut SimEntity, WorldError> {
        let entity = self
            .entities
            .get_mut(&uid)
            .ok_or(WorldError::UnknownEntity { uid })?;
        if entity.owner != Some(owner) {
            return Err(WorldError::NotOwner { handle: owner, uid });
        }
        Ok(entity)
    }

    fn wander(&mut self, dt_ms: u64) {
        let step = NPC_WANDER_SPEED * dt_ms as f32 / 1000.0;
        let uids: Vec<EntityUid> = self
            .entities
            .iter()
            .filter(|(_, entity)| entity.wander_target.is_some())
            .map(|(uid, _)| *uid)
            .collect();
        for uid in uids {
            let next_target = self.random_point();
            let Some(entity) = self.entities.get_mut(&uid) else {
                continue;
            };
            let Some(target) = entity.wander_target else {
                continue;
            };
            let pos = entity.transform.pos;
            let distance = pos.distance(target);
            if distance <= step {
                entity.transform.pos = target;
                entity.transform.speed = 0.0;
                entity.wander_target = Some(next_target);
                continue;
            }
            let dir = Vec3::new(
                (target.x - pos.x) / distance,
                (target.y - pos.y) / distance,
                (target.z - pos.z) / distance,
            );
            entity.transform.pos = Vec3::new(
                pos.x + dir.x * step,
                pos.y + dir.y * step,
                pos.z + dir.z * step,
            );
            entity.transform.dir = dir;
            entity.transform.rotate = dir.x.atan2(dir.z);
            entity.transform.speed = NPC_WANDER_SPEED;
        }
    }
}

impl World for SandboxWorld {
    fn update(&mut self, _tick: u64, dt_ms: u64) -> Result<Vec<EntityRecord>, WorldError> {
        self.wander(dt_ms);

        let avatars: Vec<(ConnectionHandle, Vec3)> = self
            .entities
            .values()
            .filter_map(|entity| entity.owner.map(|owner| (owner, entity.transform.pos)))
            .collect();

        let records = self
            .entities
            .iter()
            .map(|(uid, entity)| {
                let interest = match entity.view_radius {
                    None => Interest::Everyone,
                    Some(radius) => Interest::Only(
                        avatars
                            .iter()
                            .filter(|(_, pos)| pos.distance(entity.transform.pos) <= radius)
                            .map(|(owner, _)| *owner)
                            .collect::<BTreeSet<_>>(),
                    ),
                };
                EntityRecord {
                    uid: *uid,
                    owner: entity.owner,
                    interest,
                    transform: entity.transform,
                    action: entity.action,
                    payload: entity.payload.clone(),
                }
            })
            .collect();
        Ok(records)
    }

    fn spawn_avatar(&mut self, owner: ConnectionHandle, account: &AccountContext) -> EntityUid {
        let uid = EntityUid::next();
        let pos = Vec3::new(
            self.rng.random_range(-10.0..10.0),
            0.0,
            self.rng.random_range(-10.0..10.0),
        );
        self.entities.insert(
            uid,
            SimEntity {
                owner: Some(owner),
                transform: Transform {
                    pos,
                    ..Transform::default()
                },
                action: ActionState::default(),
                payload: EntityPayload::Avatar {
                    nickname: account.nickname.clone(),
                    class_type: account.leader_class,
                },
                wander_target: None,
                view_radius: None,
            },
        );
        uid
    }

    fn spawn_service(&mut self, service: &str, body: Value) -> EntityUid {
        let uid = EntityUid::next();
        self.entities.insert(
            uid,
            SimEntity {
                owner: None,
                transform: Transform::default(),
                action: ActionState::default(),
                payload: EntityPayload::Service(ServiceState {
                    service: service.to_string(),
                    revision: 1,
                    body,
                }),
                wander_target: None,
                view_radius: None,
            },
        );
        uid
    }

    fn update_service(&mut self, uid: EntityUid, body: Value) -> Result<u64, WorldError> {
        let entity = self
            .entities
            .get_mut(&uid)
            .ok_or(WorldError::UnknownEntity { uid })?;
        let EntityPayload::Service(state) = &mut entity.payload else {
            return Err(WorldError::UnknownEntity { uid });
        };
        state.revision += 1;
        state.body = body;
        Ok(state.revision)
    }

    fn despawn(&mut self, uid: EntityUid) -> bool {
        self.entities.remove(&uid).is_some()
    }

    fn apply_transform(
        &mut self,
        owner: ConnectionHandle,
        uid: EntityUid,
        transform: Transform,
    ) -> Result<(), WorldError> {
        if !transform.pos.is_finite() || !transform.dir.is_finite() {
            return Err(WorldError::InvalidTransform { uid });
        }
        let extent = self.half_extent;
        let entity = self.owned_mut(owner, uid)?;
        entity.transform = Transform {
            pos: Vec3::new(
                transform.pos.x.clamp(-extent, extent),
                transform.pos.y,
                transform.pos.z.clamp(-extent, extent),
            ),
            ..transform
        };
        Ok(())
    }

    fn apply_action(
        &mut self,
        owner: ConnectionHandle,
        uid: EntityUid,
        action: ActionState,
    ) -> Result<(), WorldError> {
        let entity = self.owned_mut(owner, uid)?;
        entity.action = action;
        Ok(())
    }

    fn describe(&self, uid: EntityUid) -> Option<EntityDescription> {
        let entity = self.entities.get(&uid)?;
        let nickname = match &entity.payload {
            EntityPayload::Avatar { nickname, .. } => Some(nickname.clone()),
            _ => None,
        };
        Some(EntityDescription {
            kind: entity.payload.kind(),
            nickname,
        })
    }
}
