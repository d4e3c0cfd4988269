use thiserror::Error;

use crate::types::{ConnectionHandle, ConnectionState, EntityUid, InstanceKey, LaneId, LocalId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("connection registry is full (capacity {capacity})")]
    Full { capacity: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("entity {uid} was pushed twice into the same frame")]
    DuplicateEntity { uid: EntityUid },
}

/// Contract violations raised by the replication engine. The offending message is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicationError {
    #[error("{handle} is not registered with this engine")]
    UnknownConnection { handle: ConnectionHandle },
    #[error("{handle} has no entity behind local id {local:?}")]
    UnknownLocalId {
        handle: ConnectionHandle,
        local: LocalId,
    },
    #[error("{handle} does not observe entity {uid}")]
    NotObserved {
        handle: ConnectionHandle,
        uid: EntityUid,
    },
    #[error("{handle} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        handle: ConnectionHandle,
        from: ConnectionState,
        to: ConnectionState,
    },
    #[error("local id {local:?} is outside the reserved range")]
    NotReserved { local: LocalId },
    #[error("local id {local:?} is already bound for {handle}")]
    LocalIdTaken {
        handle: ConnectionHandle,
        local: LocalId,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("packet too small: header claims {size} bytes")]
    TooSmall { size: usize },
    #[error("packet of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },
    #[error("inbound buffer overflow ({buffered} bytes pending)")]
    BufferOverflow { buffered: usize },
    #[error("failed to encode message: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("{handle} is not connected")]
    NotConnected { handle: ConnectionHandle },
    #[error("outbound queue for {handle} is full")]
    QueueFull { handle: ConnectionHandle },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorldError {
    #[error("entity {uid} does not exist")]
    UnknownEntity { uid: EntityUid },
    #[error("entity {uid} is not controlled by {handle}")]
    NotOwner {
        handle: ConnectionHandle,
        uid: EntityUid,
    },
    #[error("rejected non-finite transform for {uid}")]
    InvalidTransform { uid: EntityUid },
    #[error("simulation failed: {0}")]
    Simulation(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstanceError {
    /// The message is rejected and counted against the connection.
    #[error("contract violation: {0}")]
    Contract(#[from] ReplicationError),
    #[error("rejected: {0}")]
    Rejected(#[from] WorldError),
    #[error("{handle} is not a member of {instance}")]
    NotMember {
        handle: ConnectionHandle,
        instance: InstanceKey,
    },
    #[error("account is not expected in {instance}")]
    Unexpected { instance: InstanceKey },
    /// The instance cannot continue and is torn down at the tick boundary.
    #[error("instance {instance} failed: {reason}")]
    Fatal {
        instance: InstanceKey,
        reason: String,
    },
}

impl InstanceError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}

/// A cross-thread queue refused a request. The sender decides whether to retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("{queue} queue of {lane} is full")]
    Full { lane: LaneId, queue: &'static str },
    #[error("{queue} queue of {lane} is closed")]
    Closed { lane: LaneId, queue: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing credentials")]
    MissingCredentials,
    #[error("session token is not recognised")]
    UnknownToken,
    #[error("no pending match for this account")]
    NoPendingMatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("lane count must be at least 1")]
    NoLanes,
    #[error("{name} must be between 1 and {max} (got {value})")]
    TickRate {
        name: &'static str,
        value: u32,
        max: u32,
    },
    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },
    #[error("invalid log filter: {0}")]
    LogFilter(String),
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}
