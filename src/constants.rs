pub const TICK_RATE: u32 = 20;
pub const TICK_MS: u64 = 1000 / TICK_RATE as u64;
pub const COORDINATOR_TICK_RATE: u32 = 120;
pub const MAX_TICK_RATE: u32 = 1000;
/// Ticks a runner may fall behind before it stops catching up and resyncs.
pub const MAX_CATCHUP_TICKS: u32 = 5;

pub const DEFAULT_LANE_COUNT: usize = 4;
pub const DEFAULT_MAX_CLIENTS: usize = 4096;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

pub const DEFAULT_PLACEMENT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_MAX_PLACEMENT_ATTEMPTS: u32 = 3;
pub const DEFAULT_MAX_CONTRACT_VIOLATIONS: u32 = 8;
pub const DEFAULT_MATCH_DURATION_MS: u64 = 5 * 60 * 1000;
pub const DEFAULT_MATCH_CONNECT_TIMEOUT_MS: u64 = 30_000;

pub const NET_HEADER_LEN: usize = 4;
pub const MAX_FRAME_LEN: usize = 8 * 1024;
pub const MAX_BUFFERED_INBOUND: usize = 64 * 1024;

pub const LOCAL_ID_SELF_FIRST: u32 = 1;
pub const LOCAL_ID_SELF_LAST: u32 = 100;
pub const LOCAL_ID_DYNAMIC_FIRST: u32 = 1000;

pub const POSITION_EPSILON: f32 = 0.5;
pub const ROTATION_EPSILON: f32 = 0.1;
pub const DIRECTION_EPSILON: f32 = 0.001;
pub const SPEED_EPSILON: f32 = 0.001;

pub const HUB_NPC_COUNT: usize = 6;
pub const HUB_HALF_EXTENT: f32 = 200.0;
pub const HUB_NPC_VIEW_RADIUS: f32 = 120.0;
pub const NPC_WANDER_SPEED: f32 = 40.0;
pub const JUKEBOX_MAX_QUEUE: usize = 16;
pub const JUKEBOX_SONG_MS: u64 = 30_000;

pub const NICKNAME_MAX_LEN: usize = 16;
pub const CHAT_MAX_LEN: usize = 200;
pub const SESSION_TOKEN_LEN: usize = 48;

pub const CLOSE_CODE_NORMAL: u16 = 1000;
pub const CLOSE_CODE_SUPERSEDED: u16 = 4001;
pub const CLOSE_CODE_REJECTED: u16 = 4003;
pub const CLOSE_CODE_PROTOCOL: u16 = 4004;
pub const CLOSE_CODE_SERVER: u16 = 4005;

pub fn tick_duration_ms(tick_rate: u32) -> u64 {
    if tick_rate == 0 {
        return TICK_MS;
    }
    (1000 / tick_rate as u64).max(1)
}
