//! Periodic sweeper: every [`super::session::SWEEP_INTERVAL`], reaps idle
//! sessions, closed/expired streams, the orphaned request/token bindings
//! they leave behind, and trims sessions over the configured cap.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::session::{SessionManager, MAX_SESSIONS, SWEEP_INTERVAL};
use super::stream::{StreamRegistry, STREAM_TTL};

pub fn spawn(
    sessions: Arc<SessionManager>,
    streams: Arc<StreamRegistry>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let stale_sessions = sessions.cleanup_stale_sessions().await;
                    let evicted = sessions.enforce_capacity(MAX_SESSIONS).await;
                    let swept_streams = streams.sweep(STREAM_TTL).await;
                    if stale_sessions > 0 || evicted > 0 || swept_streams > 0 {
                        debug!(stale_sessions, evicted, swept_streams, "sweep pass");
                    }
                }
            }
        }
    })
}
