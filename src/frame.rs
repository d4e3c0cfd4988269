use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::Value;

use crate::constants::{DIRECTION_EPSILON, POSITION_EPSILON, ROTATION_EPSILON, SPEED_EPSILON};
use crate::error::FrameError;
use crate::types::{ActionState, ConnectionHandle, EntityKind, EntityUid, Transform, Vec3};

/// Which connections may see an entity this tick.
#[derive(Clone, Debug, PartialEq)]
pub enum Interest {
    Everyone,
    Only(BTreeSet<ConnectionHandle>),
}

impl Interest {
    pub fn includes(&self, handle: ConnectionHandle) -> bool {
        match self {
            Self::Everyone => true,
            Self::Only(handles) => handles.contains(&handle),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ServiceState {
    pub service: String,
    pub revision: u64,
    pub body: Value,
}

/// Kind-specific public fields. The variant selects the spawn message shape.
#[derive(Clone, Debug, PartialEq)]
pub enum EntityPayload {
    Avatar { nickname: String, class_type: u8 },
    Npc { npc_type: u16 },
    Prop { prop_type: u16 },
    Service(ServiceState),
}

impl EntityPayload {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Avatar { .. } => EntityKind::PlayerAvatar,
            Self::Npc { .. } => EntityKind::NonPlayerCharacter,
            Self::Prop { .. } => EntityKind::StaticProp,
            Self::Service(_) => EntityKind::ServiceObject,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EntityRecord {
    pub uid: EntityUid,
    pub owner: Option<ConnectionHandle>,
    pub interest: Interest,
    pub transform: Transform,
    pub action: ActionState,
    pub payload: EntityPayload,
}

impl EntityRecord {
    pub fn kind(&self) -> EntityKind {
        self.payload.kind()
    }
}

/// Field-level changes between two snapshots of the same entity.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FieldChanges {
    pub transform: bool,
    pub action: bool,
    pub service: bool,
}

impl FieldChanges {
    pub fn between(previous: &EntityRecord, current: &EntityRecord) -> Self {
        let service = match (&previous.payload, &current.payload) {
            (EntityPayload::Service(before), EntityPayload::Service(after)) => {
                before.revision != after.revision
            }
            _ => false,
        };
        Self {
            transform: transform_changed(&previous.transform, &current.transform),
            action: previous.action != current.action,
            service,
        }
    }

    pub fn any(&self) -> bool {
        self.transform || self.action || self.service
    }
}

fn vec_changed(a: Vec3, b: Vec3, epsilon: f32) -> bool {
    (a.x - b.x).abs() > epsilon || (a.y - b.y).abs() > epsilon || (a.z - b.z).abs() > epsilon
}

pub fn transform_changed(previous: &Transform, current: &Transform) -> bool {
    vec_changed(previous.pos, current.pos, POSITION_EPSILON)
        || vec_changed(previous.dir, current.dir, DIRECTION_EPSILON)
        || (previous.rotate - current.rotate).abs() > ROTATION_EPSILON
        || (previous.speed - current.speed).abs() > SPEED_EPSILON
}

/// One tick's snapshot of every replicable entity in an instance.
#[derive(Clone, Debug, Default)]
pub struct Frame {
    entities: BTreeMap<EntityUid, EntityRecord>,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: EntityRecord) -> Result<(), FrameError> {
        if self.entities.contains_key(&record.uid) {
            return Err(FrameError::DuplicateEntity { uid: record.uid });
        }
        self.entities.insert(record.uid, record);
        Ok(())
    }

    pub fn get(&self, uid: EntityUid) -> Option<&EntityRecord> {
        self.entities.get(&uid)
    }

    pub fn contains(&self, uid: EntityUid) -> bool {
        self.entities.contains_key(&uid)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn clear(&mut self) {
        self.entities.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityRecord> {
        self.entities.values()
    }

    /// Interest-filtered set of entities `handle` may see.
    pub fn view_for(&self, handle: ConnectionHandle) -> BTreeSet<EntityUid> {
        self.entities
            .values()
            .filter(|record| record.interest.includes(handle))
            .map(|record| record.uid)
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn npc(uid: u32) -> EntityRecord {
        EntityRecord {
            uid: EntityUid(uid),
            owner: None,
            interest: Interest::Everyone,
            transform: Transform::default(),
            action: ActionState::default(),
            payload: EntityPayload::Npc { npc_type: 1 },
        }
    }

    #[test]
    fn duplicate_push_is_rejected() {
        let mut frame = Frame::new();
        frame.push(npc(1)).expect("first push should succeed");
        assert_eq!(
            frame.push(npc(1)),
            Err(FrameError::DuplicateEntity { uid: EntityUid(1) })
        );
        assert_eq!(frame.len(), 1);
    }

    #[test]
    fn view_applies_interest() {
        let mut frame = Frame::new();
        frame.push(npc(1)).expect("push should succeed");
        let mut hidden = npc(2);
        hidden.interest = Interest::Only(BTreeSet::from([ConnectionHandle(7)]));
        frame.push(hidden).expect("push should succeed");

        assert_eq!(
            frame.view_for(ConnectionHandle(7)),
            BTreeSet::from([EntityUid(1), EntityUid(2)])
        );
        assert_eq!(
            frame.view_for(ConnectionHandle(8)),
            BTreeSet::from([EntityUid(1)])
        );
    }

    #[test]
    fn transform_changes_respect_epsilon() {
        let before = Transform::default();
        let mut small = before;
        small.pos.x = 0.4;
        assert!(!transform_changed(&before, &small));

        let mut large = before;
        large.pos.x = 0.6;
        assert!(transform_changed(&before, &large));

        let mut turned = before;
        turned.dir.y = 0.01;
        assert!(transform_changed(&before, &turned));
    }

    #[test]
    fn service_changes_follow_revision() {
        let service = |revision| EntityRecord {
            payload: EntityPayload::Service(ServiceState {
                service: "jukebox".to_string(),
                revision,
                body: Value::Null,
            }),
            ..npc(3)
        };
        let changes = FieldChanges::between(&service(1), &service(2));
        assert!(changes.service);
        assert!(!changes.transform);
        assert!(!FieldChanges::between(&service(2), &service(2)).any());
    }
}
