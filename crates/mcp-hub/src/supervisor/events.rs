//! Lifecycle events a [`super::BackendSupervisor`] broadcasts for
//! observers (the hub's logging, and eventually a status endpoint) to
//! subscribe to without polling `state()`.

use serde_json::Value;

use crate::models::{BackendId, BackendState};

#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    Starting { backend: BackendId },
    Started { backend: BackendId },
    Stopping { backend: BackendId },
    Stopped { backend: BackendId },
    Crashed { backend: BackendId, message: String },
    ToolsDiscovered { backend: BackendId, count: usize },
    AutoRestart { backend: BackendId, attempt: u32 },
    StateChanged { backend: BackendId, state: BackendState },
    /// A `notifications/progress` frame from the backend, destined for
    /// whichever client stream owns its `progressToken`.
    Progress { backend: BackendId, params: Value },
}
