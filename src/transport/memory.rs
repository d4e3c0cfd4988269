use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::constants::{CLOSE_CODE_PROTOCOL, MAX_BUFFERED_INBOUND};
use crate::error::TransportError;
use crate::types::ConnectionHandle;

use super::{Transport, TransportEvent};

#[derive(Default)]
struct MemoryState {
    events: VecDeque<TransportEvent>,
    open: HashSet<ConnectionHandle>,
    inbound: HashMap<ConnectionHandle, Vec<u8>>,
    outbound: HashMap<ConnectionHandle, VecDeque<Vec<u8>>>,
    close_codes: HashMap<ConnectionHandle, (u16, String)>,
}

/// In-process transport. The `client_*` methods play the remote side.
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
    outbound_limit: usize,
}

impl MemoryTransport {
    pub fn new(outbound_limit: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            outbound_limit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn open(&self) -> ConnectionHandle {
        let handle = ConnectionHandle::next();
        let mut state = self.lock();
        state.open.insert(handle);
        state.outbound.insert(handle, VecDeque::new());
        state.events.push_back(TransportEvent::Connected(handle));
        handle
    }

    /// Returns `false` once the connection is gone. A backlog over `MAX_BUFFERED_INBOUND`
    /// closes the connection the way the websocket transport does.
    pub fn client_send(&self, handle: ConnectionHandle, bytes: &[u8]) -> bool {
        let mut state = self.lock();
        if !state.open.contains(&handle) {
            return false;
        }
        let buffered = state.inbound.get(&handle).map_or(0, Vec::len);
        if buffered + bytes.len() > MAX_BUFFERED_INBOUND {
            Self::close_locked(&mut state, handle, CLOSE_CODE_PROTOCOL, "inbound backlog over limit");
            return false;
        }
        state.inbound.entry(handle).or_default().extend_from_slice(bytes);
        true
    }

    fn close_locked(state: &mut MemoryState, handle: ConnectionHandle, code: u16, reason: &str) {
        if state.open.remove(&handle) {
            state.inbound.remove(&handle);
            state.close_codes.insert(handle, (code, reason.to_string()));
            state.events.push_back(TransportEvent::Closed(handle));
        }
    }

    /// Drains everything the server queued for `handle`.
    pub fn client_receive(&self, handle: ConnectionHandle) -> Vec<Vec<u8>> {
        let mut state = self.lock();
        state
            .outbound
            .get_mut(&handle)
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn client_close(&self, handle: ConnectionHandle) {
        let mut state = self.lock();
        if state.open.remove(&handle) {
            state.inbound.remove(&handle);
            state.events.push_back(TransportEvent::Closed(handle));
        }
    }

    pub fn is_open(&self, handle: ConnectionHandle) -> bool {
        self.lock().open.contains(&handle)
    }

    pub fn close_code(&self, handle: ConnectionHandle) -> Option<(u16, String)> {
        self.lock().close_codes.get(&handle).cloned()
    }
}

impl Transport for MemoryTransport {
    fn poll_events(&self) -> Vec<TransportEvent> {
        self.lock().events.drain(..).collect()
    }

    fn poll_received(&self, handles: &[ConnectionHandle]) -> Vec<(ConnectionHandle, Vec<u8>)> {
        let mut state = self.lock();
        handles
            .iter()
            .filter_map(|handle| {
                let bytes = state.inbound.get_mut(handle)?;
                if bytes.is_empty() {
                    return None;
                }
                Some((*handle, std::mem::take(bytes)))
            })
            .collect()
    }

    fn send(&self, handle: ConnectionHandle, bytes: Vec<u8>) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.open.contains(&handle) {
            return Err(TransportError::NotConnected { handle });
        }
        let limit = self.outbound_limit;
        let queue = state.outbound.entry(handle).or_default();
        if queue.len() >= limit {
            return Err(TransportError::QueueFull { handle });
        }
        queue.push_back(bytes);
        Ok(())
    }

    fn disconnect(&self, handle: ConnectionHandle, code: u16, reason: &str) {
        let mut state = self.lock();
        Self::close_locked(&mut state, handle, code, reason);
    }
}
