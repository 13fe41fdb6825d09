//! Session and per-stream state for the client-facing transport (C5).
//!
//! A [`Session`] is the unit of SSE replay: it buffers the last
//! `HISTORY_SIZE` events so a client that reconnects with `Last-Event-ID`
//! can pick up where it left off, and broadcasts live events to whichever
//! streams are currently subscribed. Idle sessions are reaped by a
//! background sweeper (`server::sweeper`), not by this module.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::response::sse::Event;
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};

pub const HISTORY_SIZE: usize = 100;
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(3_600);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);
/// Max concurrent sessions before the sweeper starts evicting the oldest
/// ones, per spec.md §4.5's "sessions exceeding a max cap, oldest first."
pub const MAX_SESSIONS: usize = 10_000;

/// One event queued for a session: either a JSON-RPC response/notification
/// or a progress update, tagged with a monotonic id for `Last-Event-ID`
/// replay.
#[derive(Debug, Clone)]
pub struct BufferedEvent {
    pub id: u64,
    pub event_type: &'static str,
    pub data: Value,
    pub created_at: Instant,
}

impl BufferedEvent {
    #[must_use]
    pub fn to_sse_event(&self) -> Event {
        Event::default()
            .id(self.id.to_string())
            .event(self.event_type)
            .data(self.data.to_string())
    }
}

/// A single client session: a ring-buffered event history plus a
/// broadcast channel for live delivery to however many streams currently
/// subscribe to it (normally one, briefly two across a reconnect).
pub struct Session {
    pub id: String,
    tx: broadcast::Sender<BufferedEvent>,
    history: RwLock<VecDeque<BufferedEvent>>,
    next_event_id: AtomicU64,
    pub created_at: Instant,
    last_active: RwLock<Instant>,
    /// Streams belonging to this session, keyed by a hub-assigned stream
    /// id, used to scope notification broadcast to "this session only"
    /// per the spec's broadcast-scoping resolution.
    pub stream_ids: RwLock<Vec<String>>,
}

impl Session {
    #[must_use]
    pub fn new(id: String) -> Self {
        let (tx, _) = broadcast::channel(HISTORY_SIZE.max(16));
        let now = Instant::now();
        Self {
            id,
            tx,
            history: RwLock::new(VecDeque::with_capacity(HISTORY_SIZE)),
            next_event_id: AtomicU64::new(1),
            created_at: now,
            last_active: RwLock::new(now),
            stream_ids: RwLock::new(Vec::new()),
        }
    }

    /// Push a new event: assign it the next id, evict the oldest buffered
    /// event if at capacity, broadcast it to live subscribers (a lagging
    /// or absent subscriber is not an error — it will replay via
    /// `Last-Event-ID` on reconnect), and touch the session.
    pub async fn push_event(&self, event_type: &'static str, data: Value) -> u64 {
        let id = self.next_event_id.fetch_add(1, Ordering::SeqCst);
        let event = BufferedEvent {
            id,
            event_type,
            data,
            created_at: Instant::now(),
        };
        {
            let mut history = self.history.write().await;
            if history.len() == HISTORY_SIZE {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        let _ = self.tx.send(event);
        self.touch().await;
        id
    }

    /// Every buffered event after `last_seen_id` (exclusive), oldest
    /// first, for SSE reconnect replay.
    pub async fn events_after(&self, last_seen_id: u64) -> Vec<BufferedEvent> {
        self.history
            .read()
            .await
            .iter()
            .filter(|e| e.id > last_seen_id)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BufferedEvent> {
        self.tx.subscribe()
    }

    pub async fn touch(&self) {
        *self.last_active.write().await = Instant::now();
    }

    pub async fn is_stale(&self) -> bool {
        self.last_active.read().await.elapsed() > SESSION_TIMEOUT
    }

    pub async fn current_event_id(&self) -> u64 {
        self.next_event_id.load(Ordering::SeqCst).saturating_sub(1)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Owns every live session. A single `RwLock<HashMap>` is the coarse-lock
/// form the hub chose for the four C5 maps (see `server::transport`
/// module docs for the full rationale).
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn create_session(&self) -> Arc<Session> {
        let id = uuid::Uuid::new_v4().to_string();
        let session = Arc::new(Session::new(id.clone()));
        self.sessions.write().await.insert(id, Arc::clone(&session));
        session
    }

    pub async fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn get_or_create_session(&self, id: Option<&str>) -> Arc<Session> {
        if let Some(id) = id {
            if let Some(session) = self.get_session(id).await {
                session.touch().await;
                return session;
            }
            let session = Arc::new(Session::new(id.to_string()));
            self.sessions
                .write()
                .await
                .insert(id.to_string(), Arc::clone(&session));
            return session;
        }
        self.create_session().await
    }

    pub async fn remove_session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.write().await.remove(id)
    }

    /// Remove every session idle past [`SESSION_TIMEOUT`]. Called by the
    /// periodic sweeper, not inline with request handling.
    pub async fn cleanup_stale_sessions(&self) -> usize {
        let mut stale = Vec::new();
        for (id, session) in self.sessions.read().await.iter() {
            if session.is_stale().await {
                stale.push(id.clone());
            }
        }
        let mut sessions = self.sessions.write().await;
        for id in &stale {
            sessions.remove(id);
        }
        stale.len()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Evict the oldest sessions past `max_sessions`, per spec.md §4.5's
    /// cap rule. Returns the number removed.
    pub async fn enforce_capacity(&self, max_sessions: usize) -> usize {
        let mut sessions = self.sessions.write().await;
        if sessions.len() <= max_sessions {
            return 0;
        }
        let mut by_age: Vec<(String, Instant)> =
            sessions.iter().map(|(id, session)| (id.clone(), session.created_at)).collect();
        by_age.sort_by_key(|(_, created_at)| *created_at);

        let excess = sessions.len() - max_sessions;
        for (id, _) in by_age.into_iter().take(excess) {
            sessions.remove(&id);
        }
        excess
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn session_creation_assigns_a_uuid() {
        let manager = SessionManager::new();
        let session = manager.create_session().await;
        assert_eq!(session.id.len(), 36);
        assert_eq!(manager.session_count().await, 1);
    }

    #[tokio::test]
    async fn event_push_and_replay() {
        let session = Session::new("s1".to_string());
        session.push_event("message", json!({"n": 1})).await;
        let second_id = session.push_event("message", json!({"n": 2})).await;
        let replay = session.events_after(second_id - 1).await;
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].data, json!({"n": 2}));
    }

    #[tokio::test]
    async fn session_lookup_returns_none_for_unknown_id() {
        let manager = SessionManager::new();
        assert!(manager.get_session("nope").await.is_none());
    }

    #[tokio::test]
    async fn enforce_capacity_evicts_oldest_sessions_first() {
        let manager = SessionManager::new();
        let first = manager.create_session().await;
        manager.create_session().await;
        manager.create_session().await;

        let removed = manager.enforce_capacity(2).await;

        assert_eq!(removed, 1);
        assert_eq!(manager.session_count().await, 2);
        assert!(manager.get_session(&first.id).await.is_none());
    }

    #[tokio::test]
    async fn enforce_capacity_is_a_no_op_under_the_cap() {
        let manager = SessionManager::new();
        manager.create_session().await;
        assert_eq!(manager.enforce_capacity(10).await, 0);
        assert_eq!(manager.session_count().await, 1);
    }

    #[tokio::test]
    async fn ring_buffer_overflow_evicts_oldest() {
        let session = Session::new("s1".to_string());
        for n in 0..HISTORY_SIZE + 10 {
            session.push_event("message", json!({"n": n})).await;
        }
        let replay = session.events_after(0).await;
        assert_eq!(replay.len(), HISTORY_SIZE);
        assert_eq!(replay[0].data, json!({"n": 10}));
    }
}
