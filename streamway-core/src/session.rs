//! Session registry and per-session correlation state.
//!
//! A session is the unit of client affinity: it owns the response slots a
//! child reply can land on, the table of requests still waiting for that
//! reply, and the bounded history that backs `Last-Event-ID` resume. All of
//! it sits behind one mutex per session so that a pending entry and its
//! response slot always appear and disappear together. The lock is never
//! held across an await; writing to a response handle is a channel send.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::sse::{self, SseFrame, SseReceiver, SseSender};

/// Upper bound on the per-session broadcast history kept for resume.
pub const MESSAGE_HISTORY_LIMIT: usize = 100;

/// A live HTTP response waiting for data.
///
/// Batch slots are keyed by the stringified request id and resolve a single
/// POST with one JSON body. Stream slots are keyed by a random UUID and
/// receive SSE frames until closed. Request-id lookups only ever match batch
/// slots, so client-chosen ids cannot capture someone's stream.
pub enum ResponseSlot {
    Batch(oneshot::Sender<Value>),
    Stream(SseSender),
}

impl ResponseSlot {
    fn is_ended(&self) -> bool {
        match self {
            ResponseSlot::Batch(tx) => tx.is_closed(),
            ResponseSlot::Stream(tx) => tx.is_closed(),
        }
    }
}

struct SessionInner {
    responses: HashMap<String, ResponseSlot>,
    pending_requests: HashMap<String, Value>,
    message_history: VecDeque<String>,
    last_event_id: u64,
}

pub struct Session {
    pub id: String,
    inner: Mutex<SessionInner>,
}

impl Session {
    fn new(id: String) -> Self {
        Self {
            id,
            inner: Mutex::new(SessionInner {
                responses: HashMap::new(),
                pending_requests: HashMap::new(),
                message_history: VecDeque::new(),
                last_event_id: 0,
            }),
        }
    }

    /// Register a batch POST: pending entry plus a batch slot under the same
    /// key. The returned receiver resolves with the reply body, or errors if
    /// the slot is ended without one (session deleted).
    pub fn register_batch(&self, key: String, request: Value) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().unwrap();
        inner.pending_requests.insert(key.clone(), request);
        inner.responses.insert(key, ResponseSlot::Batch(tx));
        rx
    }

    /// Register a pending request with no batch slot (stream mode, where the
    /// reply fans out to the session's streams instead).
    pub fn register_pending(&self, key: String, request: Value) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending_requests.insert(key, request);
    }

    /// Open a stream slot under a fresh key. When `replay_from` is given the
    /// matching history suffix is rendered with positional replay ids
    /// `replay_from, replay_from + 1, ...` in the same critical section, so
    /// a concurrent broadcast can never be duplicated or lost around the
    /// replay boundary.
    pub fn open_stream(&self, replay_from: Option<u64>) -> (String, Vec<Bytes>, SseReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stream_key = Uuid::new_v4().to_string();
        let mut inner = self.inner.lock().unwrap();
        let mut replay = Vec::new();
        if let Some(from) = replay_from {
            for (offset, data) in inner.message_history.iter().skip(from as usize).enumerate() {
                replay.push(sse::event_frame(from + offset as u64, data));
            }
        }
        inner
            .responses
            .insert(stream_key.clone(), ResponseSlot::Stream(tx));
        (stream_key, replay, rx)
    }

    /// Remove a single response slot, leaving the rest of the session alone.
    pub fn remove_response(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.responses.remove(key);
    }

    /// Remove a request's pending entry and its response slot together.
    /// Returns whether the pending entry was still there, which is how
    /// timeout and disconnect decide if they won the race against the reply.
    pub fn remove_request(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let had_pending = inner.pending_requests.remove(key).is_some();
        inner.responses.remove(key);
        had_pending
    }

    /// Route a child reply keyed by `key` into this session.
    ///
    /// A live batch slot under the key wins outright. Otherwise, if the
    /// session originated the request, the reply is fanned out to its
    /// streams (stream mode) or falls back to the first live handle of any
    /// kind (batch mode); with no live handle left the reply is dropped.
    pub fn deliver_reply(&self, key: &str, reply: &Value, stream_mode: bool) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        let direct = matches!(
            inner.responses.get(key),
            Some(ResponseSlot::Batch(tx)) if !tx.is_closed()
        );
        if direct {
            inner.pending_requests.remove(key);
            if let Some(ResponseSlot::Batch(tx)) = inner.responses.remove(key) {
                let _ = tx.send(reply.clone());
            }
            return;
        }

        if inner.pending_requests.remove(key).is_none() {
            // Not a request this session originated.
            return;
        }

        if stream_mode {
            Self::broadcast_locked(inner, reply);
            return;
        }

        // The original response handle is gone (client closed mid-flight).
        // First live handle in the session wins the reply.
        let fallback = inner
            .responses
            .iter()
            .find(|(_, slot)| !slot.is_ended())
            .map(|(slot_key, slot)| (slot_key.clone(), matches!(slot, ResponseSlot::Stream(_))));
        match fallback {
            Some((_, true)) => {
                // The surviving handle is a stream, so the reply goes out
                // like any other broadcast, history append included.
                Self::broadcast_locked(inner, reply);
                debug!(
                    "Reply {} in session {} rerouted to open streams",
                    key, self.id
                );
            }
            Some((slot_key, false)) => {
                if let Some(ResponseSlot::Batch(tx)) = inner.responses.remove(&slot_key) {
                    let _ = tx.send(reply.clone());
                }
                debug!(
                    "Reply {} in session {} rerouted to response {}",
                    key, self.id, slot_key
                );
            }
            None => {
                warn!(
                    "No open response handle in session {} for reply {}, dropping it",
                    self.id, key
                );
            }
        }
    }

    /// Append a payload to the history and send it to every live stream in
    /// the session. Returns how many streams received it. Slots whose client
    /// is gone are pruned on the way.
    pub fn broadcast(&self, payload: &Value) -> usize {
        let mut guard = self.inner.lock().unwrap();
        Self::broadcast_locked(&mut guard, payload)
    }

    fn broadcast_locked(inner: &mut SessionInner, payload: &Value) -> usize {
        let data = payload.to_string();
        inner.message_history.push_back(data.clone());
        while inner.message_history.len() > MESSAGE_HISTORY_LIMIT {
            inner.message_history.pop_front();
        }
        inner.last_event_id += 1;
        let frame = sse::event_frame(inner.last_event_id, &data);

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (key, slot) in inner.responses.iter() {
            if let ResponseSlot::Stream(tx) = slot {
                if tx.send(SseFrame::Event(frame.clone())).is_ok() {
                    delivered += 1;
                } else {
                    dead.push(key.clone());
                }
            }
        }
        for key in dead {
            inner.responses.remove(&key);
        }
        delivered
    }

    /// Expire a stream-mode request: if it is still pending, write the error
    /// body as a final event on the request's own stream and end it. Returns
    /// false when the reply already arrived and there is nothing to do.
    pub fn expire_stream_request(&self, key: &str, stream_key: &str, error_body: &Value) -> bool {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        if inner.pending_requests.remove(key).is_none() {
            return false;
        }
        inner.last_event_id += 1;
        let frame = sse::event_frame(inner.last_event_id, &error_body.to_string());
        if let Some(ResponseSlot::Stream(tx)) = inner.responses.get(stream_key) {
            let _ = tx.send(SseFrame::Event(frame));
            let _ = tx.send(SseFrame::Close);
        }
        inner.responses.remove(stream_key);
        true
    }

    /// End every live response handle. Batch waiters resolve empty, streams
    /// get a close frame. Used when the session is deleted.
    pub fn end_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending_requests.clear();
        for (_, slot) in inner.responses.drain() {
            match slot {
                // Dropping the sender wakes the waiting handler.
                ResponseSlot::Batch(_) => {}
                ResponseSlot::Stream(tx) => {
                    let _ = tx.send(SseFrame::Close);
                }
            }
        }
    }

    #[cfg(test)]
    fn counts(&self) -> (usize, usize, usize, u64) {
        let inner = self.inner.lock().unwrap();
        (
            inner.responses.len(),
            inner.pending_requests.len(),
            inner.message_history.len(),
            inner.last_event_id,
        )
    }
}

/// Removes a request's correlation state when the owning response goes away.
///
/// Held by the handler (batch) or the response body stream, so client
/// disconnects clean up exactly what they registered. Removal is idempotent;
/// on the normal reply path the correlator has already emptied the entries.
pub struct SlotGuard {
    session: Arc<Session>,
    response_key: String,
    pending_key: Option<String>,
}

impl SlotGuard {
    pub fn new(session: Arc<Session>, response_key: String, pending_key: Option<String>) -> Self {
        Self {
            session,
            response_key,
            pending_key,
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(key) = &self.pending_key {
            if self.session.remove_request(key) {
                debug!(
                    "Dropped pending request {} in session {} after its response closed",
                    key, self.session.id
                );
            }
        }
        self.session.remove_response(&self.response_key);
    }
}

/// Thread-safe map of session id to session. The registry is the only owner
/// of sessions; everything else holds `Arc` clones scoped to one operation.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Resolve the session a request belongs to, creating a fresh one when
    /// the header is absent or names a session we do not know.
    pub fn get_or_create(&self, header_value: Option<&str>) -> (Arc<Session>, bool) {
        if let Some(id) = header_value {
            if let Some(existing) = self.sessions.get(id) {
                return (existing.clone(), false);
            }
        }
        let id = Uuid::new_v4().to_string();
        let session = Arc::new(Session::new(id.clone()));
        self.sessions.insert(id, session.clone());
        (session, true)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    /// Copy out the current sessions so reply routing never holds registry
    /// shards while it takes session locks.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
