//! WebSocket handler — one session per connected canvas client.
//!
//! DESIGN
//! ======
//! On upgrade, the session registers an outbound queue with the broadcaster,
//! sends the `init` snapshot, announces the new online count and enters a
//! `select!` loop:
//! - Incoming client frames → decode + dispatch → replies to this client
//! - Broadcast frames from the queue → forward to client
//!
//! Registration happens before the snapshot is taken, so an edit accepted in
//! between reaches the client twice at worst (snapshot and update), never zero
//! times.
//!
//! LIFECYCLE
//! =========
//! `Connecting → Active → Closing → Closed`, tracked by [`SessionGuard`].
//! The guard's finalizer (deregister, forget cooldown, re-announce count)
//! runs exactly once on every exit path, including task cancellation, because
//! it lives in `Drop`.

use axum::extract::State;
use axum::extract::ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::{ClientMessage, ProtocolError, ServerMessage, now_ms};
use crate::services::broadcast::Outbound;
use crate::services::pixel::apply_edit;
use crate::state::AppState;

/// Per-connection outbound queue depth. A client this far behind is pruned.
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_ws(socket, state))
}

// =============================================================================
// SESSION STATE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Owns a connection's registration and runs its cleanup exactly once.
pub struct SessionGuard {
    state: AppState,
    client_id: Uuid,
    phase: SessionPhase,
}

impl SessionGuard {
    /// Register `tx` with the broadcaster and enter `Connecting`.
    pub fn connect(state: &AppState, client_id: Uuid, tx: Outbound) -> Self {
        state.broadcaster.register(client_id, tx);
        Self { state: state.clone(), client_id, phase: SessionPhase::Connecting }
    }

    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// `Connecting → Active`, once the init snapshot was delivered.
    pub fn activate(&mut self) {
        if self.phase == SessionPhase::Connecting {
            self.phase = SessionPhase::Active;
        }
    }

    /// Run the finalizer. Later calls (and the eventual drop) are no-ops.
    pub fn close(&mut self) {
        if matches!(self.phase, SessionPhase::Closing | SessionPhase::Closed) {
            return;
        }
        self.phase = SessionPhase::Closing;

        let client_id = self.client_id;
        self.state.broadcaster.deregister(client_id);
        self.state.rate_limiter.forget(client_id);
        let online = self.state.broadcaster.count();
        self.state.broadcaster.fanout(&ServerMessage::UserCount { count: online });

        self.phase = SessionPhase::Closed;
        info!(%client_id, online, "ws: client disconnected");
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// CONNECTION
// =============================================================================

pub async fn run_ws(mut socket: WebSocket, state: AppState) {
    let client_id = Uuid::new_v4();
    let (client_tx, mut client_rx) = mpsc::channel::<Utf8Bytes>(OUTBOUND_QUEUE_CAPACITY);
    let mut session = SessionGuard::connect(&state, client_id, client_tx);

    if send_message(&mut socket, &init_message(&state)).await.is_err() {
        warn!(%client_id, "ws: failed to deliver init snapshot");
        return;
    }
    session.activate();

    let online = state.broadcaster.count();
    info!(%client_id, online, "ws: client connected");
    state.broadcaster.fanout(&ServerMessage::UserCount { count: online });

    'session: loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                let replies = match msg {
                    Message::Text(text) => process_inbound_text(&state, client_id, text.as_str(), now_ms()),
                    Message::Binary(_) => vec![ServerMessage::error(&ProtocolError::Binary)],
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                };
                for reply in &replies {
                    if send_message(&mut socket, reply).await.is_err() {
                        break 'session;
                    }
                }
            }
            outbound = client_rx.recv() => {
                // The broadcaster dropped our sender: pruned or shutting down.
                let Some(text) = outbound else {
                    debug!(%client_id, "ws: outbound queue closed");
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        }
    }

    debug!(%client_id, phase = ?session.phase(), "ws: session loop ended");
    session.close();
}

fn init_message(state: &AppState) -> ServerMessage {
    let pixels = state.lock_canvas().active_pixels();
    ServerMessage::Init { pixels, online_users: state.broadcaster.count(), canvas_info: state.canvas_info() }
}

// =============================================================================
// DISPATCH
// =============================================================================

/// Decode and handle one inbound text frame; returns replies for the sender.
///
/// Broadcasts happen inside the edit pipeline, not through the return value.
pub fn process_inbound_text(state: &AppState, client_id: Uuid, text: &str, now: i64) -> Vec<ServerMessage> {
    let message = match ClientMessage::decode(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(%client_id, error = %e, "ws: rejected inbound frame");
            return vec![ServerMessage::error(&e)];
        }
    };

    match message {
        ClientMessage::PixelUpdate(edit) => match apply_edit(state, client_id, &edit, now) {
            Ok(outcome) => {
                debug!(%client_id, x = edit.x, y = edit.y, ?outcome, "ws: pixel edit accepted");
                Vec::new()
            }
            Err(e) => {
                debug!(%client_id, x = edit.x, y = edit.y, error = %e, "ws: pixel edit rejected");
                vec![ServerMessage::error(&e)]
            }
        },
        ClientMessage::Ping { timestamp } => vec![ServerMessage::Pong { timestamp }],
        ClientMessage::GetStats => vec![ServerMessage::StatsResponse { stats: state.session_stats(Some(client_id)) }],
    }
}

async fn send_message(socket: &mut WebSocket, message: &ServerMessage) -> Result<(), ()> {
    let json = match message.encode() {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize message");
            return Err(());
        }
    };
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
