//! Per-stream routing state for the client-facing transport (C5): the four
//! maps spec.md's SSE flow names — `streams`, `requestToStream`,
//! `progressTokenToStream`, and the response path that stands in for
//! `responseBuffer` — held behind one coarse lock per spec.md §5's
//! "an implementation must choose between a coarse registry lock or a
//! single registry-owning task; both are acceptable" permission.
//!
//! Outside code reaches these maps only through [`StreamRegistry`]'s
//! methods, matching spec.md §5's "mutated only by the transport" rule.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

/// Frame channel capacity for one SSE stream: enough to absorb a burst of
/// progress notifications between polls of the receiver without blocking
/// the task that's routing them.
const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Hard deadline for a request dispatched over the SSE flow, per spec.md
/// §4.5 step 4 ("bounded by a hard deadline (default 120 s)").
pub const REQUEST_DEADLINE: Duration = Duration::from_secs(120);

/// TTL after which an idle stream is swept even if never explicitly
/// closed, per spec.md §4.5's periodic-sweeper rule. Must exceed the SSE
/// heartbeat interval.
pub const STREAM_TTL: Duration = Duration::from_secs(120);

struct StreamState {
    sender: mpsc::Sender<Value>,
    last_active: Instant,
    closed: bool,
}

#[derive(Default)]
struct TransportMaps {
    streams: HashMap<String, StreamState>,
    request_to_stream: HashMap<String, String>,
    progress_token_to_stream: HashMap<String, String>,
}

/// Owns every currently-open SSE stream opened by a POST request, and the
/// routing from request id / progress token back to the stream that should
/// receive its frames.
pub struct StreamRegistry {
    maps: Mutex<TransportMaps>,
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            maps: Mutex::new(TransportMaps::default()),
        }
    }

    /// Open a new stream, returning its id and the receiving half of its
    /// frame channel.
    pub async fn open_stream(&self) -> (String, mpsc::Receiver<Value>) {
        let id = uuid::Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let mut maps = self.maps.lock().await;
        maps.streams.insert(
            id.clone(),
            StreamState {
                sender,
                last_active: Instant::now(),
                closed: false,
            },
        );
        (id, receiver)
    }

    /// Record that `request_id` (and, if set, `progress_token`) belongs to
    /// `stream_id`, per spec.md §4.5 step 2.
    pub async fn bind_request(&self, stream_id: &str, request_id: &str, progress_token: Option<&Value>) {
        let mut maps = self.maps.lock().await;
        maps.request_to_stream.insert(request_id.to_string(), stream_id.to_string());
        if let Some(token) = progress_token {
            maps.progress_token_to_stream
                .insert(token.to_string(), stream_id.to_string());
        }
    }

    /// Write a response/error frame to the stream owning `request_id`. A
    /// stream that is closed, or no longer present, silently drops the
    /// write — per the backpressure rule, this is not an error.
    pub async fn route_response(&self, request_id: &str, frame: Value) {
        let maps = self.maps.lock().await;
        if let Some(stream_id) = maps.request_to_stream.get(request_id) {
            send_if_open(&maps, stream_id, frame);
        }
    }

    /// Write a progress frame to the single stream owning `token`. Per
    /// spec.md §4.5's progress-isolation rule this never broadcasts: a
    /// token no open stream claims is silently dropped, not queued.
    pub async fn route_progress(&self, token: &Value, frame: Value) {
        let maps = self.maps.lock().await;
        if let Some(stream_id) = maps.progress_token_to_stream.get(&token.to_string()) {
            send_if_open(&maps, stream_id, frame);
        }
    }

    /// Write a frame directly to `stream_id`, bypassing request/token
    /// lookup — used for the synthetic `-32001` timeout frame, which is
    /// addressed to the stream itself rather than to one of its requests.
    pub async fn send_to_stream(&self, stream_id: &str, frame: Value) {
        let maps = self.maps.lock().await;
        send_if_open(&maps, stream_id, frame);
    }

    /// Remove the `requestToStream`/`progressTokenToStream` entries for one
    /// request, per spec.md §4.5 step 6's cleanup.
    pub async fn forget_request(&self, request_id: &str, progress_token: Option<&Value>) {
        let mut maps = self.maps.lock().await;
        maps.request_to_stream.remove(request_id);
        if let Some(token) = progress_token {
            maps.progress_token_to_stream.remove(&token.to_string());
        }
    }

    /// Mark a stream closed. Routing to it becomes a no-op; the sweeper
    /// reaps the entry on its next pass.
    pub async fn close_stream(&self, stream_id: &str) {
        let mut maps = self.maps.lock().await;
        if let Some(stream) = maps.streams.get_mut(stream_id) {
            stream.closed = true;
        }
    }

    /// Periodic sweep: drop streams that are closed or past `ttl` since
    /// their last write, then drop any request/token entry left pointing
    /// at a stream that no longer exists. Returns the number of streams
    /// removed.
    pub async fn sweep(&self, ttl: Duration) -> usize {
        let mut maps = self.maps.lock().await;
        let dead: Vec<String> = maps
            .streams
            .iter()
            .filter(|(_, state)| state.closed || state.last_active.elapsed() > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &dead {
            maps.streams.remove(id);
        }
        let live: HashSet<String> = maps.streams.keys().cloned().collect();
        maps.request_to_stream.retain(|_, stream_id| live.contains(stream_id));
        maps.progress_token_to_stream
            .retain(|_, stream_id| live.contains(stream_id));
        dead.len()
    }

    pub async fn stream_count(&self) -> usize {
        self.maps.lock().await.streams.len()
    }
}

fn send_if_open(maps: &TransportMaps, stream_id: &str, frame: Value) {
    if let Some(stream) = maps.streams.get(stream_id) {
        if !stream.closed {
            let _ = stream.sender.try_send(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn response_routes_only_to_the_owning_stream() {
        let registry = StreamRegistry::new();
        let (stream_a, mut rx_a) = registry.open_stream().await;
        let (_stream_b, mut rx_b) = registry.open_stream().await;
        registry.bind_request(&stream_a, "1", None).await;

        registry.route_response("1", json!({"ok": true})).await;

        assert_eq!(rx_a.try_recv().unwrap(), json!({"ok": true}));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn progress_never_reaches_a_stream_that_does_not_own_the_token() {
        let registry = StreamRegistry::new();
        let (stream_a, mut rx_a) = registry.open_stream().await;
        let (stream_b, mut rx_b) = registry.open_stream().await;
        let token = json!("t1");
        registry.bind_request(&stream_a, "1", Some(&token)).await;
        let other_token = json!("t2");
        registry.bind_request(&stream_b, "2", Some(&other_token)).await;

        registry.route_progress(&token, json!({"pct": 50})).await;

        assert_eq!(rx_a.try_recv().unwrap(), json!({"pct": 50}));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn sweep_removes_closed_streams_and_their_orphaned_bindings() {
        let registry = StreamRegistry::new();
        let (stream_id, _rx) = registry.open_stream().await;
        registry.bind_request(&stream_id, "1", None).await;
        registry.close_stream(&stream_id).await;

        let removed = registry.sweep(Duration::from_secs(120)).await;

        assert_eq!(removed, 1);
        assert_eq!(registry.stream_count().await, 0);
        // The orphaned requestToStream entry is gone too: routing to it is a no-op.
        registry.route_response("1", json!({"late": true})).await;
    }

    #[tokio::test]
    async fn progress_to_an_unknown_token_is_silently_dropped() {
        let registry = StreamRegistry::new();
        registry.route_progress(&json!("ghost"), json!({"pct": 10})).await;
        assert_eq!(registry.stream_count().await, 0);
    }
}
