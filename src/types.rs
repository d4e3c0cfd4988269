use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);
static NEXT_ENTITY: AtomicU32 = AtomicU32::new(1);

/// Opaque identifier of one network session. The only connection value that crosses threads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionHandle(pub u64);

impl ConnectionHandle {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Process-wide entity identifier. 1-based and never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityUid(pub u32);

impl EntityUid {
    pub fn next() -> Self {
        Self(NEXT_ENTITY.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for EntityUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uid#{}", self.0)
    }
}

/// Identifier of an entity inside one connection's namespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    PlayerAvatar,
    NonPlayerCharacter,
    StaticProp,
    ServiceObject,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    InGame,
    Loaded,
}

impl ConnectionState {
    pub fn successor(self) -> Option<Self> {
        match self {
            Self::Connected => Some(Self::InGame),
            Self::InGame => Some(Self::Loaded),
            Self::Loaded => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LaneId(pub usize);

impl fmt::Display for LaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lane-{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum InstanceKey {
    Hub,
    Room(u64),
    Match(u64),
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hub => write!(f, "hub"),
            Self::Room(id) => write!(f, "room-{id}"),
            Self::Match(id) => write!(f, "match-{id}"),
        }
    }
}

/// Where a connection should be placed next. `lane: None` lets the coordinator choose.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub lane: Option<LaneId>,
    pub key: InstanceKey,
}

impl Destination {
    pub fn hub() -> Self {
        Self {
            lane: None,
            key: InstanceKey::Hub,
        }
    }

    pub fn on_lane(lane: LaneId, key: InstanceKey) -> Self {
        Self {
            lane: Some(lane),
            key,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AccountContext {
    pub account_id: AccountId,
    pub nickname: String,
    pub leader_class: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn distance(self, other: Vec3) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub pos: Vec3,
    pub dir: Vec3,
    pub rotate: f32,
    pub speed: f32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionState {
    pub state: u16,
    pub param1: u32,
    pub param2: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPhase {
    WaitingForPlayers,
    Playing,
    Finished,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MatchSeat {
    pub account_id: AccountId,
    pub team: u8,
    pub class_type: u8,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MatchSpec {
    pub match_id: u64,
    pub seats: Vec<MatchSeat>,
    pub bots: u8,
}

impl MatchSpec {
    pub fn expects(&self, account_id: AccountId) -> bool {
        self.seats.iter().any(|seat| seat.account_id == account_id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RoomSpec {
    pub room_id: u64,
    pub match_id: u64,
    pub accounts: Vec<AccountId>,
}

/// Out-of-band request delivered to lanes through their control queue.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    CreateMatch { spec: MatchSpec },
    CreateRoom { spec: RoomSpec },
    MatchFound { destination: Destination },
    Announcement { text: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlScope {
    Connection(ConnectionHandle),
    Broadcast,
}
