//! Server-Sent Events wire framing.
//!
//! Frames travel from the broadcast side to a response body over an
//! unbounded channel, so handlers never block on a slow client while holding
//! session state.

use bytes::Bytes;
use serde_json::json;
use tokio::sync::mpsc;

/// One item on a stream slot's channel.
#[derive(Debug, Clone)]
pub enum SseFrame {
    /// A fully rendered `id:`/`data:` event.
    Event(Bytes),
    /// End the response body; the session itself stays alive.
    Close,
}

pub type SseSender = mpsc::UnboundedSender<SseFrame>;
pub type SseReceiver = mpsc::UnboundedReceiver<SseFrame>;

/// Render an event frame: `id: <n>\ndata: <json>\n\n`.
pub fn event_frame(event_id: u64, data: &str) -> Bytes {
    Bytes::from(format!("id: {}\ndata: {}\n\n", event_id, data))
}

/// Render the prologue frame sent on every newly opened GET stream. It
/// carries no `id:` line, so it never interferes with resume bookkeeping.
pub fn connected_frame(session_id: &str) -> Bytes {
    Bytes::from(format!(
        "event: connected\ndata: {}\n\n",
        json!({ "sessionId": session_id })
    ))
}
