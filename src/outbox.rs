use crate::protocol::ServerMessage;
use crate::types::ConnectionHandle;

/// What to do when a connection's outbound queue cannot take a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueuePolicy {
    DropOnFull,
    DisconnectOnFull,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Outgoing {
    pub handle: ConnectionHandle,
    pub message: ServerMessage,
    pub policy: QueuePolicy,
}

/// Ordered per-tick buffer of messages waiting to be flushed to the transport.
#[derive(Debug, Default)]
pub struct Outbox {
    entries: Vec<Outgoing>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handle: ConnectionHandle, message: ServerMessage, policy: QueuePolicy) {
        self.entries.push(Outgoing {
            handle,
            message,
            policy,
        });
    }

    pub fn reliable(&mut self, handle: ConnectionHandle, message: ServerMessage) {
        self.push(handle, message, QueuePolicy::DisconnectOnFull);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Outgoing> {
        self.entries.iter()
    }

    pub fn take(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.entries)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Messages queued for `handle`, in emission order.
    pub fn messages_for(&self, handle: ConnectionHandle) -> Vec<&ServerMessage> {
        self.entries
            .iter()
            .filter(|entry| entry.handle == handle)
            .map(|entry| &entry.message)
            .collect()
    }
}
