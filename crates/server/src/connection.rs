//! The `Connection` entity (spec §3) and its writer pump (spec §4.1).
//!
//! A `Connection` is one live WebSocket endpoint. Exactly one writer task
//! ever writes to the underlying socket, draining `send_queue`; the reader
//! side lives in [`crate::ingress`]. Both sides share the connection only
//! through this struct's atomics and channel — never a raw socket handle.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use gatehouse_protocol::{HeartbeatConfig, Message};
use tokio::sync::mpsc;

/// One live WebSocket endpoint. `session_id` is set at most once per
/// connection lifetime (monotonic assignment, guarded by `session_id_lock`).
pub struct Connection {
    pub connection_id: String,
    pub user_id: String,
    pub name: String,
    pub roles: Vec<String>,
    session_id: Mutex<String>,
    sender: mpsc::Sender<Message>,
    closing: AtomicBool,
}

impl Connection {
    pub fn new(
        connection_id: String,
        user_id: String,
        name: String,
        roles: Vec<String>,
        capacity: usize,
    ) -> (std::sync::Arc<Self>, mpsc::Receiver<Message>) {
        let (sender, receiver) = mpsc::channel(capacity);
        let connection = std::sync::Arc::new(Self {
            connection_id,
            user_id,
            name,
            roles,
            session_id: Mutex::new(String::new()),
            sender,
            closing: AtomicBool::new(false),
        });
        (connection, receiver)
    }

    pub fn session_id(&self) -> String {
        self.session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Set `session_id` iff it is still empty. Returns `true` if this call
    /// performed the assignment, `false` if a session was already set.
    pub fn set_session_id_if_empty(&self, session_id: &str) -> bool {
        let mut guard = self.session_id.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_empty() {
            *guard = session_id.to_string();
            true
        } else {
            false
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn mark_closing(&self) {
        self.closing.store(true, Ordering::Release);
    }

    /// Non-blocking enqueue, used by every writer except the router. Drops
    /// the message and returns `false` if closing or the queue is full.
    pub fn try_enqueue(&self, message: Message) -> bool {
        if self.is_closing() {
            return false;
        }
        self.sender.try_send(message).is_ok()
    }

    /// Blocking enqueue for router use only (spec §5: "the router ... is
    /// allowed to block on its own backpressure budget").
    pub async fn enqueue_blocking(&self, message: Message) -> bool {
        if self.is_closing() {
            return false;
        }
        self.sender.send(message).await.is_ok()
    }
}

/// `user_id-nanosecondTimestamp-hex(random8)`, falling back to
/// `user_id-nanosecondTimestamp` if random-byte generation fails. Always
/// begins with `user_id` for traceability (spec §4.1, testable property 1).
pub fn generate_connection_id(user_id: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    match random_hex8() {
        Ok(hex) => format!("{user_id}-{nanos}-{hex}"),
        Err(e) => {
            tracing::warn!(%user_id, error = %e, "failed to generate random connection id suffix, falling back to timestamp-only id");
            format!("{user_id}-{nanos}")
        }
    }
}

fn random_hex8() -> std::io::Result<String> {
    use std::fmt::Write;
    let mut bytes = [0u8; 8];
    let mut f = std::fs::File::open("/dev/urandom")?;
    f.read_exact(&mut bytes)?;
    let mut hex = String::with_capacity(16);
    for b in &bytes {
        write!(hex, "{b:02x}").expect("writing to a String never fails");
    }
    Ok(hex)
}

/// Drain `receiver` onto the socket, one text frame per queued [`Message`]
/// (spec's framing contract: no coalescing, no newline concatenation), and
/// emit a ping every `ping_period_secs`. Returns when the queue closes or a
/// write fails.
pub async fn run_writer(
    connection_id: &str,
    user_id: &str,
    mut ws_sender: SplitSink<WebSocket, WsMessage>,
    mut receiver: mpsc::Receiver<Message>,
    heartbeat: HeartbeatConfig,
) {
    let write_wait = Duration::from_secs(heartbeat.write_wait_secs);
    let ping_period = Duration::from_secs(heartbeat.ping_period_secs);
    let mut ticker = tokio::time::interval(ping_period);
    ticker.tick().await; // first tick fires immediately; consume it

    loop {
        tokio::select! {
            maybe_msg = receiver.recv() => {
                let Some(message) = maybe_msg else {
                    tracing::debug!(%connection_id, %user_id, "send queue closed, writer exiting");
                    break;
                };
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(%connection_id, %user_id, error = %e, "failed to serialize outbound message, dropping");
                        continue;
                    }
                };
                let send = tokio::time::timeout(write_wait, ws_sender.send(WsMessage::Text(text.into())));
                if let Err(_) | Ok(Err(_)) = send.await {
                    tracing::warn!(%connection_id, %user_id, "write failed or timed out, writer exiting");
                    break;
                }
            }
            _ = ticker.tick() => {
                let send = tokio::time::timeout(write_wait, ws_sender.send(WsMessage::Ping(Vec::new().into())));
                if let Err(_) | Ok(Err(_)) = send.await {
                    tracing::warn!(%connection_id, %user_id, "ping failed or timed out, writer exiting");
                    break;
                }
            }
        }
    }
}
