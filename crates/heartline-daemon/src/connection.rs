//! Individual member connection on the hub side.
//!
//! Each accepted WebSocket runs in its own task: inbound frames are
//! classified and handed to the hub, outbound frames arrive over an
//! unbounded channel so the heartbeat loop never waits on socket I/O.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use heartline_core::{ConnectionId, ControlMessage};

/// Frame queued for a connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    /// Send a close frame, then drop the socket
    Close { code: u16, reason: String },
    /// Drop the socket without a close handshake
    Terminate,
}

/// Normal closure status code.
pub const NORMAL_CLOSE: u16 = 1000;

/// Sending half of a connection task's outbound queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a text frame. Returns false if the connection task is gone.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.tx.send(Outbound::Text(text.into())).is_ok()
    }

    pub fn send_control(&self, message: ControlMessage) -> bool {
        self.send_text(message.encode())
    }

    pub fn close(&self, code: u16, reason: impl Into<String>) -> bool {
        self.tx
            .send(Outbound::Close {
                code,
                reason: reason.into(),
            })
            .is_ok()
    }

    pub fn terminate(&self) -> bool {
        self.tx.send(Outbound::Terminate).is_ok()
    }
}

/// How a connection task ended.
#[derive(Debug, Clone, Default)]
pub struct CloseInfo {
    pub code: Option<u16>,
    pub reason: String,
}

/// Drive one socket until it closes.
///
/// `on_text` receives every inbound text frame, control tokens included.
pub async fn run_socket(
    id: ConnectionId,
    socket: WebSocket,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    on_text: impl Fn(&str) + Send,
) -> CloseInfo {
    let (mut sink, mut stream) = socket.split();
    let mut info = CloseInfo::default();

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => on_text(text.as_str()),
                Some(Ok(Message::Binary(data))) => {
                    debug!("Ignoring {} byte binary frame from {}", data.len(), id);
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("Received close frame from {}", id);
                    if let Some(frame) = frame {
                        info.code = Some(frame.code);
                        info.reason = frame.reason.to_string();
                    }
                    break;
                }
                // Protocol-level ping/pong is answered by the transport
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("WebSocket error on {}: {}", id, e);
                    info.reason = e.to_string();
                    break;
                }
                None => {
                    debug!("Connection {} stream ended", id);
                    break;
                }
            },
            queued = outbound.recv() => match queued {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        debug!("Failed to send to {}: {}", id, e);
                        info.reason = e.to_string();
                        break;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code,
                        reason: reason.clone().into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    info.code = Some(code);
                    info.reason = reason;
                    break;
                }
                Some(Outbound::Terminate) | None => {
                    info.reason = "terminated".to_string();
                    break;
                }
            },
        }
    }

    info
}
