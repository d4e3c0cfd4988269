use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::constants::{CLOSE_CODE_PROTOCOL, MAX_BUFFERED_INBOUND};
use crate::error::TransportError;
use crate::types::ConnectionHandle;

use super::{Transport, TransportEvent};

#[derive(Clone, Debug)]
enum OutboundFrame {
    Binary(Vec<u8>),
    Close { code: u16, reason: String },
}

struct WsConnection {
    tx: mpsc::Sender<OutboundFrame>,
    inbound: Vec<u8>,
    closing: bool,
}

#[derive(Default)]
struct WsState {
    events: VecDeque<TransportEvent>,
    connections: HashMap<ConnectionHandle, WsConnection>,
}

/// WebSocket transport. Each socket gets a writer task fed by a bounded channel; inbound
/// binary messages are buffered until the owning thread polls them.
pub struct WsTransport {
    state: Mutex<WsState>,
    outbound_capacity: usize,
}

impl WsTransport {
    pub fn new(outbound_capacity: usize) -> Self {
        Self {
            state: Mutex::new(WsState::default()),
            outbound_capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, WsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    fn register(&self, handle: ConnectionHandle, tx: mpsc::Sender<OutboundFrame>) {
        let mut state = self.lock();
        state.connections.insert(
            handle,
            WsConnection {
                tx,
                inbound: Vec::new(),
                closing: false,
            },
        );
        state.events.push_back(TransportEvent::Connected(handle));
    }

    fn unregister(&self, handle: ConnectionHandle) {
        let mut state = self.lock();
        if state.connections.remove(&handle).is_some() {
            state.events.push_back(TransportEvent::Closed(handle));
        }
    }

    /// Buffers bytes for the owning thread. A connection whose unpolled backlog would
    /// pass `MAX_BUFFERED_INBOUND` is closed with a protocol error.
    fn append_inbound(&self, handle: ConnectionHandle, bytes: &[u8]) -> bool {
        let mut state = self.lock();
        let Some(connection) = state.connections.get_mut(&handle) else {
            return false;
        };
        if connection.closing {
            return false;
        }
        if connection.inbound.len() + bytes.len() > MAX_BUFFERED_INBOUND {
            warn!(
                %handle,
                buffered = connection.inbound.len(),
                incoming = bytes.len(),
                "inbound backlog over limit; closing"
            );
            connection.closing = true;
            connection.inbound.clear();
            let close = OutboundFrame::Close {
                code: CLOSE_CODE_PROTOCOL,
                reason: "inbound backlog over limit".to_string(),
            };
            if let Err(err) = connection.tx.try_send(close) {
                debug!(%handle, %err, "close frame not queued");
            }
            return false;
        }
        connection.inbound.extend_from_slice(bytes);
        true
    }
}

impl Transport for WsTransport {
    fn poll_events(&self) -> Vec<TransportEvent> {
        self.lock().events.drain(..).collect()
    }

    fn poll_received(&self, handles: &[ConnectionHandle]) -> Vec<(ConnectionHandle, Vec<u8>)> {
        let mut state = self.lock();
        handles
            .iter()
            .filter_map(|handle| {
                let connection = state.connections.get_mut(handle)?;
                if connection.inbound.is_empty() {
                    return None;
                }
                Some((*handle, std::mem::take(&mut connection.inbound)))
            })
            .collect()
    }

    fn send(&self, handle: ConnectionHandle, bytes: Vec<u8>) -> Result<(), TransportError> {
        let state = self.lock();
        let Some(connection) = state.connections.get(&handle) else {
            return Err(TransportError::NotConnected { handle });
        };
        if connection.closing {
            return Err(TransportError::NotConnected { handle });
        }
        connection
            .tx
            .try_send(OutboundFrame::Binary(bytes))
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => TransportError::QueueFull { handle },
                mpsc::error::TrySendError::Closed(_) => TransportError::NotConnected { handle },
            })
    }

    fn disconnect(&self, handle: ConnectionHandle, code: u16, reason: &str) {
        let mut state = self.lock();
        let Some(connection) = state.connections.get_mut(&handle) else {
            return;
        };
        if connection.closing {
            return;
        }
        connection.closing = true;
        let close = OutboundFrame::Close {
            code,
            reason: reason.to_string(),
        };
        if let Err(err) = connection.tx.try_send(close) {
            // The writer task ends once the socket errors or the peer goes away.
            debug!(%handle, %err, "close frame not queued");
        }
    }
}

pub async fn handle_socket(transport: Arc<WsTransport>, socket: WebSocket) {
    let handle = ConnectionHandle::next();
    let (tx, mut rx) = mpsc::channel::<OutboundFrame>(transport.outbound_capacity);
    transport.register(handle, tx);
    info!(%handle, "websocket connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let should_close = matches!(outbound, OutboundFrame::Close { .. });
            let result = match outbound {
                OutboundFrame::Binary(bytes) => ws_sender.send(Message::Binary(bytes.into())).await,
                OutboundFrame::Close { code, reason } => {
                    let frame = CloseFrame {
                        code,
                        reason: reason.into(),
                    };
                    ws_sender.send(Message::Close(Some(frame))).await
                }
            };
            if result.is_err() || should_close {
                break;
            }
        }
    });

    while let Some(received) = ws_receiver.next().await {
        let Ok(message) = received else {
            break;
        };
        match message {
            Message::Binary(raw) => {
                if !transport.append_inbound(handle, &raw) {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    transport.unregister(handle);
    debug!(%handle, "websocket closed");
    let _ = writer.await;
}
