//! Wire framing and message bodies.
//!
//! Every packet starts with a 4-byte header: `size: u16 LE` (header included) and
//! `net_id: u16 LE`. Bodies are JSON objects.

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::constants::{MAX_BUFFERED_INBOUND, MAX_FRAME_LEN, NET_HEADER_LEN};
use crate::error::ProtocolError;
use crate::types::{
    AccountId, ActionState, EntityKind, InstanceKey, LocalId, MatchPhase, Transform, Vec3,
};

pub mod net_id {
    pub const HELLO: u16 = 1;
    pub const MAP_LOADED: u16 = 10;
    pub const LOADING_COMPLETE: u16 = 11;
    pub const UPDATE_POSITION: u16 = 20;
    pub const SYNC_ACTION_STATE: u16 = 21;
    pub const CHAT: u16 = 30;
    pub const RTT: u16 = 31;
    pub const PICK_CLASS: u16 = 40;
    pub const READY: u16 = 41;
    pub const JUKEBOX_QUEUE_SONG: u16 = 50;
    pub const GET_ENTITY_INFO: u16 = 51;

    pub const AUTH_ACCEPTED: u16 = 101;
    pub const AUTH_REJECTED: u16 = 102;
    pub const ENTER_INSTANCE: u16 = 103;
    pub const SPAWN_AVATAR: u16 = 110;
    pub const SPAWN_NPC: u16 = 111;
    pub const SPAWN_PROP: u16 = 112;
    pub const SPAWN_SERVICE: u16 = 113;
    pub const DESTROY: u16 = 114;
    pub const UPDATE_TRANSFORM: u16 = 120;
    pub const UPDATE_ACTION: u16 = 121;
    pub const UPDATE_SERVICE: u16 = 122;
    pub const INITIAL_FRAME_COMPLETE: u16 = 130;
    pub const LOADING_COMPLETE_ACK: u16 = 131;
    pub const CHAT_RELAY: u16 = 140;
    pub const SYSTEM_NOTICE: u16 = 141;
    pub const PONG: u16 = 142;
    pub const MATCH_FOUND: u16 = 150;
    pub const MATCH_PHASE: u16 = 151;
    pub const ENTITY_INFO: u16 = 152;
    pub const ERROR: u16 = 199;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetHeader {
    pub size: u16,
    pub net_id: u16,
}

impl NetHeader {
    pub fn read(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < NET_HEADER_LEN {
            return None;
        }
        Some(Self {
            size: u16::from_le_bytes([bytes[0], bytes[1]]),
            net_id: u16::from_le_bytes([bytes[2], bytes[3]]),
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.net_id.to_le_bytes());
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawFrame {
    pub net_id: u16,
    pub payload: Vec<u8>,
}

/// Reassembles frames from a byte stream that may split or merge packets.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let buffered = self.buffer.len() + bytes.len();
        if buffered > MAX_BUFFERED_INBOUND {
            return Err(ProtocolError::BufferOverflow { buffered });
        }
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    pub fn next_frame(&mut self) -> Result<Option<RawFrame>, ProtocolError> {
        let Some(header) = NetHeader::read(&self.buffer) else {
            return Ok(None);
        };
        let size = header.size as usize;
        if size < NET_HEADER_LEN {
            return Err(ProtocolError::TooSmall { size });
        }
        if size > MAX_FRAME_LEN {
            return Err(ProtocolError::TooLarge {
                size,
                max: MAX_FRAME_LEN,
            });
        }
        if self.buffer.len() < size {
            return Ok(None);
        }
        let payload = self.buffer[NET_HEADER_LEN..size].to_vec();
        self.buffer.drain(..size);
        Ok(Some(RawFrame {
            net_id: header.net_id,
            payload,
        }))
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Hands over whatever bytes have not formed a complete frame yet.
    pub fn take_remaining(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }
}

pub fn encode_frame(net_id: u16, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let size = NET_HEADER_LEN + payload.len();
    if size > MAX_FRAME_LEN {
        return Err(ProtocolError::TooLarge {
            size,
            max: MAX_FRAME_LEN,
        });
    }
    let mut out = Vec::with_capacity(size);
    NetHeader {
        size: size as u16,
        net_id,
    }
    .write(&mut out);
    out.extend_from_slice(payload);
    Ok(out)
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthAccepted {
        account_id: AccountId,
        nickname: String,
        session_token: String,
    },
    AuthRejected {
        reason: String,
    },
    EnterInstance {
        instance: InstanceKey,
    },
    SpawnAvatar {
        local_id: LocalId,
        nickname: String,
        class_type: u8,
        transform: Transform,
        action: ActionState,
        is_self: bool,
    },
    SpawnNpc {
        local_id: LocalId,
        npc_type: u16,
        transform: Transform,
        action: ActionState,
    },
    SpawnProp {
        local_id: LocalId,
        prop_type: u16,
        transform: Transform,
    },
    SpawnService {
        local_id: LocalId,
        service: String,
        revision: u64,
        body: Value,
    },
    Destroy {
        local_id: LocalId,
    },
    UpdateTransform {
        local_id: LocalId,
        transform: Transform,
    },
    UpdateAction {
        local_id: LocalId,
        action: ActionState,
    },
    UpdateService {
        local_id: LocalId,
        revision: u64,
        body: Value,
    },
    InitialFrameComplete,
    LoadingComplete,
    Chat {
        sender: String,
        text: String,
    },
    SystemNotice {
        text: String,
    },
    Pong {
        t: f64,
    },
    MatchFound {
        instance: InstanceKey,
    },
    MatchPhase {
        phase: MatchPhase,
        remaining_ms: u64,
    },
    EntityInfo {
        local_id: LocalId,
        kind: EntityKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        nickname: Option<String>,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn net_id(&self) -> u16 {
        match self {
            Self::AuthAccepted { .. } => net_id::AUTH_ACCEPTED,
            Self::AuthRejected { .. } => net_id::AUTH_REJECTED,
            Self::EnterInstance { .. } => net_id::ENTER_INSTANCE,
            Self::SpawnAvatar { .. } => net_id::SPAWN_AVATAR,
            Self::SpawnNpc { .. } => net_id::SPAWN_NPC,
            Self::SpawnProp { .. } => net_id::SPAWN_PROP,
            Self::SpawnService { .. } => net_id::SPAWN_SERVICE,
            Self::Destroy { .. } => net_id::DESTROY,
            Self::UpdateTransform { .. } => net_id::UPDATE_TRANSFORM,
            Self::UpdateAction { .. } => net_id::UPDATE_ACTION,
            Self::UpdateService { .. } => net_id::UPDATE_SERVICE,
            Self::InitialFrameComplete => net_id::INITIAL_FRAME_COMPLETE,
            Self::LoadingComplete => net_id::LOADING_COMPLETE_ACK,
            Self::Chat { .. } => net_id::CHAT_RELAY,
            Self::SystemNotice { .. } => net_id::SYSTEM_NOTICE,
            Self::Pong { .. } => net_id::PONG,
            Self::MatchFound { .. } => net_id::MATCH_FOUND,
            Self::MatchPhase { .. } => net_id::MATCH_PHASE,
            Self::EntityInfo { .. } => net_id::ENTITY_INFO,
            Self::Error { .. } => net_id::ERROR,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

pub fn encode_server_message(message: &ServerMessage) -> Result<Vec<u8>, ProtocolError> {
    let payload =
        serde_json::to_vec(message).map_err(|err| ProtocolError::Encode(err.to_string()))?;
    encode_frame(message.net_id(), &payload)
}

#[derive(Clone, Debug, PartialEq)]
pub enum ClientMessage {
    Hello {
        nickname: String,
        leader_class: u8,
        session_token: Option<String>,
    },
    MapLoaded,
    LoadingComplete,
    UpdatePosition {
        local_id: LocalId,
        transform: Transform,
    },
    SyncActionState {
        local_id: LocalId,
        action: ActionState,
    },
    Chat {
        text: String,
    },
    Rtt {
        t: f64,
    },
    PickClass {
        class_type: u8,
    },
    Ready {
        ready: bool,
    },
    JukeboxQueueSong {
        song_id: u32,
    },
    GetEntityInfo {
        local_id: LocalId,
    },
}

impl ClientMessage {
    pub fn net_id(&self) -> u16 {
        match self {
            Self::Hello { .. } => net_id::HELLO,
            Self::MapLoaded => net_id::MAP_LOADED,
            Self::LoadingComplete => net_id::LOADING_COMPLETE,
            Self::UpdatePosition { .. } => net_id::UPDATE_POSITION,
            Self::SyncActionState { .. } => net_id::SYNC_ACTION_STATE,
            Self::Chat { .. } => net_id::CHAT,
            Self::Rtt { .. } => net_id::RTT,
            Self::PickClass { .. } => net_id::PICK_CLASS,
            Self::Ready { .. } => net_id::READY,
            Self::JukeboxQueueSong { .. } => net_id::JUKEBOX_QUEUE_SONG,
            Self::GetEntityInfo { .. } => net_id::GET_ENTITY_INFO,
        }
    }

    fn body(&self) -> Value {
        match self {
            Self::Hello {
                nickname,
                leader_class,
                session_token,
            } => json!({
                "nickname": nickname,
                "leaderClass": leader_class,
                "sessionToken": session_token,
            }),
            Self::MapLoaded | Self::LoadingComplete => json!({}),
            Self::UpdatePosition {
                local_id,
                transform,
            } => json!({
                "localId": local_id.0,
                "pos": transform.pos,
                "dir": transform.dir,
                "rotate": transform.rotate,
                "speed": transform.speed,
            }),
            Self::SyncActionState { local_id, action } => json!({
                "localId": local_id.0,
                "state": action.state,
                "param1": action.param1,
                "param2": action.param2,
            }),
            Self::Chat { text } => json!({ "text": text }),
            Self::Rtt { t } => json!({ "t": t }),
            Self::PickClass { class_type } => json!({ "classType": class_type }),
            Self::Ready { ready } => json!({ "ready": ready }),
            Self::JukeboxQueueSong { song_id } => json!({ "songId": song_id }),
            Self::GetEntityInfo { local_id } => json!({ "localId": local_id.0 }),
        }
    }
}

/// Client-side encoding, used by bots and tests.
pub fn encode_client_message(message: &ClientMessage) -> Result<Vec<u8>, ProtocolError> {
    let payload = serde_json::to_vec(&message.body())
        .map_err(|err| ProtocolError::Encode(err.to_string()))?;
    encode_frame(message.net_id(), &payload)
}

pub fn parse_client_message(net_id: u16, payload: &[u8]) -> Option<ClientMessage> {
    match net_id {
        net_id::MAP_LOADED => return Some(ClientMessage::MapLoaded),
        net_id::LOADING_COMPLETE => return Some(ClientMessage::LoadingComplete),
        _ => {}
    }

    let value: Value = serde_json::from_slice(payload).ok()?;
    let object = value.as_object()?;

    match net_id {
        net_id::HELLO => {
            let nickname = object.get("nickname")?.as_str()?.to_string();
            let leader_class = match object.get("leaderClass") {
                None | Some(Value::Null) => 0,
                Some(value) => u8::try_from(value.as_u64()?).ok()?,
            };
            let session_token = match object.get("sessionToken") {
                None | Some(Value::Null) => None,
                Some(value) => Some(value.as_str()?.to_string()),
            };
            Some(ClientMessage::Hello {
                nickname,
                leader_class,
                session_token,
            })
        }
        net_id::UPDATE_POSITION => {
            let local_id = parse_local_id(object)?;
            let transform = Transform {
                pos: parse_vec3(object.get("pos")?)?,
                dir: parse_vec3(object.get("dir")?)?,
                rotate: parse_finite(object.get("rotate")?)?,
                speed: parse_finite(object.get("speed")?)?,
            };
            Some(ClientMessage::UpdatePosition {
                local_id,
                transform,
            })
        }
        net_id::SYNC_ACTION_STATE => {
            let local_id = parse_local_id(object)?;
            let action = ActionState {
                state: u16::try_from(object.get("state")?.as_u64()?).ok()?,
                param1: parse_optional_u32(object.get("param1"))?,
                param2: parse_optional_u32(object.get("param2"))?,
            };
            Some(ClientMessage::SyncActionState { local_id, action })
        }
        net_id::CHAT => {
            let text = object.get("text")?.as_str()?.to_string();
            Some(ClientMessage::Chat { text })
        }
        net_id::RTT => {
            let t = object.get("t")?.as_f64()?;
            if !t.is_finite() {
                return None;
            }
            Some(ClientMessage::Rtt { t })
        }
        net_id::PICK_CLASS => {
            let class_type = u8::try_from(object.get("classType")?.as_u64()?).ok()?;
            Some(ClientMessage::PickClass { class_type })
        }
        net_id::READY => {
            let ready = object.get("ready")?.as_bool()?;
            Some(ClientMessage::Ready { ready })
        }
        net_id::JUKEBOX_QUEUE_SONG => {
            let song_id = u32::try_from(object.get("songId")?.as_u64()?).ok()?;
            Some(ClientMessage::JukeboxQueueSong { song_id })
        }
        net_id::GET_ENTITY_INFO => {
            let local_id = parse_local_id(object)?;
            Some(ClientMessage::GetEntityInfo { local_id })
        }
        _ => None,
    }
}

fn parse_local_id(object: &Map<String, Value>) -> Option<LocalId> {
    let raw = object.get("localId")?.as_u64()?;
    u32::try_from(raw).ok().map(LocalId)
}

fn parse_finite(value: &Value) -> Option<f32> {
    let number = value.as_f64()? as f32;
    number.is_finite().then_some(number)
}

fn parse_vec3(value: &Value) -> Option<Vec3> {
    let object = value.as_object()?;
    Some(Vec3 {
        x: parse_finite(object.get("x")?)?,
        y: parse_finite(object.get("y")?)?,
        z: parse_finite(object.get("z")?)?,
    })
}

fn parse_optional_u32(value: Option<&Value>) -> Option<u32> {
    match value {
        None => Some(0),
        Some(value) => u32::try_from(value.as_u64()?).ok(),
    }
}
