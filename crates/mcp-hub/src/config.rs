//! Hub configuration: the already-validated value the core runs against,
//! plus enough loading machinery (`from_env`, `from_file`) to run the hub
//! standalone.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::models::{BackendConfig, BackendId, NamingStrategy};

pub mod defaults {
    pub const HTTP_HOST: &str = "127.0.0.1";
    pub const HTTP_PORT: u16 = 7800;
    pub const GLOBAL_CONCURRENCY: usize = 64;
    pub const SPAWN_MS: u64 = 30_000;
    pub const HEALTHCHECK_MS: u64 = 30_000;
    pub const TOOL_CALL_MS: u64 = 60_000;
    pub const SESSION_HISTORY_SIZE: usize = 100;
    pub const SESSION_TIMEOUT_SECS: u64 = 3_600;
    pub const SWEEP_INTERVAL_SECS: u64 = 10;
}

fn default_separator() -> String {
    "__".to_string()
}

fn default_format_template() -> String {
    "{backend}{separator}{tool}".to_string()
}

/// Naming configuration: how the registry derives and resolves public tool
/// names, plus explicit alias overrides that win regardless of `strategy`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamingConfig {
    #[serde(default)]
    pub strategy: NamingStrategy,
    /// Joins `{backend}` and `{tool}` inside `format_template`, and
    /// replaces any character in `{tool}` illegal in an MCP tool name.
    #[serde(default = "default_separator")]
    pub separator: String,
    /// Template for a qualified public name. Recognizes the placeholders
    /// `{backend}`, `{tool}`, and `{separator}`.
    #[serde(default = "default_format_template")]
    pub format_template: String,
    /// Explicit `(backend_id, backend_tool_name) -> public_name` overrides.
    #[serde(default)]
    pub aliases: HashMap<String, String>,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            strategy: NamingStrategy::default(),
            separator: default_separator(),
            format_template: default_format_template(),
            aliases: HashMap::new(),
        }
    }
}

impl NamingConfig {
    #[must_use]
    pub fn alias_for(&self, backend_id: &BackendId, tool_name: &str) -> Option<&str> {
        self.aliases
            .get(&format!("{backend_id}/{tool_name}"))
            .map(String::as_str)
    }

    /// Qualify `tool_name` for `backend_id` per `format_template`, with any
    /// character in `tool_name` illegal in an MCP tool name replaced by
    /// `separator`, per spec.md §4.3's `namespace` rule.
    #[must_use]
    pub fn qualify(&self, backend_id: &BackendId, tool_name: &str) -> String {
        let sanitized_tool = sanitize_tool_segment(tool_name, &self.separator);
        self.format_template
            .replace("{backend}", backend_id.as_str())
            .replace("{tool}", &sanitized_tool)
            .replace("{separator}", &self.separator)
    }
}

/// Replace every character in `segment` outside `[A-Za-z0-9_-]` with
/// `separator`, since those are the only characters an MCP tool name may
/// safely contain once qualified.
fn sanitize_tool_segment(segment: &str, separator: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for c in segment.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            out.push(c);
        } else {
            out.push_str(separator);
        }
    }
    out
}

/// Global and per-backend concurrency gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    #[serde(default = "defaults_global")]
    pub global: usize,
    #[serde(default)]
    pub per_backend: HashMap<BackendId, usize>,
}

const fn defaults_global() -> usize {
    defaults::GLOBAL_CONCURRENCY
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            global: defaults::GLOBAL_CONCURRENCY,
            per_backend: HashMap::new(),
        }
    }
}

/// Phase timeouts shared across all backends (per-backend overrides live on
/// `BackendConfig::timeouts`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "defaults_spawn_ms")]
    pub spawn_ms: u64,
    #[serde(default = "defaults_healthcheck_ms")]
    pub healthcheck_ms: u64,
    #[serde(default = "defaults_tool_call_ms")]
    pub tool_call_ms: u64,
}

const fn defaults_spawn_ms() -> u64 {
    defaults::SPAWN_MS
}
const fn defaults_healthcheck_ms() -> u64 {
    defaults::HEALTHCHECK_MS
}
const fn defaults_tool_call_ms() -> u64 {
    defaults::TOOL_CALL_MS
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            spawn_ms: defaults::SPAWN_MS,
            healthcheck_ms: defaults::HEALTHCHECK_MS,
            tool_call_ms: defaults::TOOL_CALL_MS,
        }
    }
}

/// Where the client-facing HTTP server binds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "defaults_host")]
    pub host: String,
    #[serde(default = "defaults_port")]
    pub port: u16,
}

fn defaults_host() -> String {
    defaults::HTTP_HOST.to_string()
}
const fn defaults_port() -> u16 {
    defaults::HTTP_PORT
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: defaults_host(),
            port: defaults::HTTP_PORT,
        }
    }
}

/// Fully-validated hub configuration; the value the core is constructed
/// from. Loading from environment/file is this crate's stand-in for the
/// fuller external config/profile-merging collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub naming: NamingConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

/// Error produced while loading or validating a [`HubConfig`].
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl HubConfig {
    /// Load from a TOML file at `path`, then validate.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read,
    /// [`ConfigError::Parse`] if it is not valid TOML for this shape, or
    /// [`ConfigError::Invalid`] if it fails [`HubConfig::validate`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let raw = std::fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_ref.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path_ref.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Construct a minimal config suitable for integration tests: no
    /// configured backends, defaults otherwise, optionally overriding the
    /// HTTP port so tests can bind an ephemeral one.
    #[must_use]
    pub fn for_testing(port: u16) -> Self {
        Self {
            http: HttpConfig {
                host: "127.0.0.1".to_string(),
                port,
            },
            ..Self::default()
        }
    }

    /// Checks invariants `from_file`/deserialization alone can't express:
    /// backend ids are unique, and every alias key refers to a configured
    /// backend.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first violation
    /// found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for backend in &self.backends {
            if !seen.insert(backend.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate backend id '{}'",
                    backend.id
                )));
            }
        }
        for key in self.naming.aliases.keys() {
            let backend_id = key.split('/').next().unwrap_or_default();
            if !self.backends.iter().any(|b| b.id.as_str() == backend_id) {
                return Err(ConfigError::Invalid(format!(
                    "alias key '{key}' references unconfigured backend '{backend_id}'"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(HubConfig::default().validate().is_ok());
    }

    #[test]
    fn for_testing_binds_given_port() {
        let config = HubConfig::for_testing(0);
        assert_eq!(config.http.port, 0);
        assert!(config.backends.is_empty());
    }

    #[test]
    fn duplicate_backend_ids_are_rejected() {
        let backend = BackendConfig {
            id: BackendId::new("dup").unwrap(),
            kind: crate::models::BackendKind::Remote(crate::models::RemoteEndpoint {
                url: "http://localhost:9".to_string(),
                transport: crate::models::RemoteTransportKind::Http,
                auth: None,
            }),
            start_mode: crate::models::StartMode::Lazy,
            timeouts: crate::models::BackendTimeouts::default(),
            tools_include: vec![],
            tools_exclude: vec![],
            concurrency: None,
        };
        let config = HubConfig {
            backends: vec![backend.clone(), backend],
            ..HubConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn qualify_joins_backend_and_tool_with_the_separator() {
        let naming = NamingConfig::default();
        let backend = BackendId::new("files").unwrap();
        assert_eq!(naming.qualify(&backend, "read"), "files__read");
    }

    #[test]
    fn qualify_replaces_illegal_characters_with_the_separator() {
        let naming = NamingConfig::default();
        let backend = BackendId::new("files").unwrap();
        assert_eq!(naming.qualify(&backend, "read file"), "files__read__file");
    }

    #[test]
    fn qualify_honors_a_custom_template_and_separator() {
        let naming = NamingConfig {
            separator: ".".to_string(),
            format_template: "{backend}{separator}{tool}".to_string(),
            ..NamingConfig::default()
        };
        let backend = BackendId::new("files").unwrap();
        assert_eq!(naming.qualify(&backend, "read"), "files.read");
    }

    #[test]
    fn alias_referencing_unknown_backend_is_rejected() {
        let mut config = HubConfig::default();
        config
            .naming
            .aliases
            .insert("ghost/read".to_string(), "ghost_read".to_string());
        assert!(config.validate().is_err());
    }
}
