//! Network seam. The coordinator polls connection events; whichever thread owns a
//! connection polls its bytes and sends to it.

mod memory;
mod ws;

use crate::error::TransportError;
use crate::types::ConnectionHandle;

pub use memory::MemoryTransport;
pub use ws::{handle_socket, WsTransport};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Connected(ConnectionHandle),
    Closed(ConnectionHandle),
}

pub trait Transport: Send + Sync {
    fn poll_events(&self) -> Vec<TransportEvent>;

    /// Bytes received since the last poll for each of `handles` that has any.
    fn poll_received(&self, handles: &[ConnectionHandle]) -> Vec<(ConnectionHandle, Vec<u8>)>;

    fn send(&self, handle: ConnectionHandle, bytes: Vec<u8>) -> Result<(), TransportError>;

    fn disconnect(&self, handle: ConnectionHandle, code: u16, reason: &str);
}
