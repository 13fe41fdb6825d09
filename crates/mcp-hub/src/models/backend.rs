//! Backend identity, launch parameters, and lifecycle state.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Opaque stable identifier for a backend, chosen by configuration.
///
/// Used verbatim in public tool names, so it is restricted to
/// `[A-Za-z0-9_-]+` at construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BackendId(String);

impl BackendId {
    /// Validate and wrap a raw backend id.
    ///
    /// # Errors
    ///
    /// Returns an error if `raw` is empty or contains a character outside
    /// `[A-Za-z0-9_-]`.
    pub fn new(raw: impl Into<String>) -> Result<Self, BackendIdError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(BackendIdError::Empty);
        }
        if let Some(bad) = raw.chars().find(|c| !is_valid_char(*c)) {
            return Err(BackendIdError::InvalidChar(bad));
        }
        Ok(Self(raw))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_valid_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

impl TryFrom<String> for BackendId {
    type Error = BackendIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BackendId> for String {
    fn from(value: BackendId) -> Self {
        value.0
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Error returned when a [`BackendId`] fails validation.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendIdError {
    #[error("backend id must not be empty")]
    Empty,
    #[error("backend id contains invalid character '{0}' (allowed: [A-Za-z0-9_-])")]
    InvalidChar(char),
}

/// How a backend is reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendKind {
    /// Long-lived child process with a stdio pipe.
    Local(ProcessLaunch),
    /// Short-lived spawn of a package runner; has a first-run install phase.
    Package(ProcessLaunch),
    /// HTTP/SSE/WebSocket endpoint.
    Remote(RemoteEndpoint),
}

impl BackendKind {
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::Package(_) => "package",
            Self::Remote(_) => "remote",
        }
    }
}

/// Launch parameters for a child-process backend (`local` or `package`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessLaunch {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    /// Environment overrides, merged over the hub's inherited environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Optional auth for a remote endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum RemoteAuth {
    Bearer { token: String },
    Basic { username: String, password: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteTransportKind {
    Http,
    Sse,
    WebSocket,
}

/// Connection parameters for a `remote` backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteEndpoint {
    pub url: String,
    pub transport: RemoteTransportKind,
    #[serde(default)]
    pub auth: Option<RemoteAuth>,
}

/// Whether a lazy backend is connected eagerly at hub startup or only on
/// first use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartMode {
    Eager,
    Lazy,
}

/// Per-backend phase timeouts and restart policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendTimeouts {
    #[serde(default = "default_init_timeout")]
    pub init_ms: u64,
    /// Longer init timeout used on a `package` backend's first run, while
    /// dependencies are being installed.
    #[serde(default = "default_install_timeout")]
    pub install_ms: u64,
    #[serde(default = "default_restart_delay")]
    pub restart_delay_ms: u64,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default)]
    pub healthcheck_ms: Option<u64>,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_health_failures: u32,
}

const fn default_init_timeout() -> u64 {
    30_000
}
const fn default_install_timeout() -> u64 {
    120_000
}
const fn default_restart_delay() -> u64 {
    1_000
}
const fn default_max_restarts() -> u32 {
    5
}
const fn default_max_consecutive_failures() -> u32 {
    3
}

impl Default for BackendTimeouts {
    fn default() -> Self {
        Self {
            init_ms: default_init_timeout(),
            install_ms: default_install_timeout(),
            restart_delay_ms: default_restart_delay(),
            max_restarts: default_max_restarts(),
            healthcheck_ms: None,
            max_consecutive_health_failures: default_max_consecutive_failures(),
        }
    }
}

impl BackendTimeouts {
    #[must_use]
    pub const fn init(&self) -> Duration {
        Duration::from_millis(self.init_ms)
    }

    #[must_use]
    pub const fn install(&self) -> Duration {
        Duration::from_millis(self.install_ms)
    }

    #[must_use]
    pub const fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

/// Full definition of one configured backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub id: BackendId,
    #[serde(flatten)]
    pub kind: BackendKind,
    #[serde(default = "default_start_mode")]
    pub start_mode: StartMode,
    #[serde(default)]
    pub timeouts: BackendTimeouts,
    #[serde(default)]
    pub tools_include: Vec<String>,
    #[serde(default)]
    pub tools_exclude: Vec<String>,
    #[serde(default)]
    pub concurrency: Option<usize>,
}

const fn default_start_mode() -> StartMode {
    StartMode::Eager
}

/// Lifecycle state of one backend supervisor.
///
/// Forward transitions are strict (see module docs on [`crate::supervisor`]
/// for the enforced graph); only `Stopped`/`Crashed` may re-enter `Starting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendState {
    Stopped,
    Starting,
    Initialized,
    ToolsDiscovering,
    ToolsReady,
    Running,
    Stopping,
    /// Terminal but re-enterable: a subsequent `start()` moves back to
    /// `Starting`.
    Crashed,
}

impl BackendState {
    /// Whether `start()` may be called from this state.
    #[must_use]
    pub const fn can_start(self) -> bool {
        matches!(self, Self::Stopped | Self::Crashed)
    }

    /// Whether this state is a legal successor of `self` in one strict
    /// forward transition (ignores the `Crashed`/`Stopping` escapes, which
    /// are driven by events rather than the happy-path sequence).
    #[must_use]
    pub const fn next_in_sequence(self) -> Option<Self> {
        match self {
            Self::Stopped => Some(Self::Starting),
            Self::Starting => Some(Self::Initialized),
            Self::Initialized => Some(Self::ToolsDiscovering),
            Self::ToolsDiscovering => Some(Self::ToolsReady),
            Self::ToolsReady => Some(Self::Running),
            Self::Running => Some(Self::Stopping),
            Self::Stopping => Some(Self::Stopped),
            Self::Crashed => None,
        }
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Initialized => "initialized",
            Self::ToolsDiscovering => "tools_discovering",
            Self::ToolsReady => "tools_ready",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Crashed => "crashed",
        };
        f.write_str(s)
    }
}
