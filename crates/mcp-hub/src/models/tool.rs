//! Tool descriptors and the public/backend name split.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::backend::BackendId;

/// A tool as advertised by a backend during `tools/list`, before the hub
/// has touched its name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// A tool as registered in the hub and exposed to clients.
///
/// `public_name` is what clients see in `tools/list` and must pass back in
/// `tools/call`; it is immutable for the lifetime of the registration. A
/// backend restart that returns the same `backend_name` reuses the same
/// `public_name`, but a rename on the backend side creates a new entry
/// rather than mutating this one.
#[derive(Debug, Clone, Serialize)]
pub struct RegisteredTool {
    pub public_name: String,
    pub backend_id: BackendId,
    pub backend_name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

impl RegisteredTool {
    #[must_use]
    pub fn new(backend_id: BackendId, tool: BackendTool, public_name: String) -> Self {
        Self {
            public_name,
            backend_id,
            backend_name: tool.name,
            description: tool.description,
            input_schema: tool.input_schema,
        }
    }

    /// The shape sent out over `tools/list`, with the hub's public name
    /// substituted for the backend's own.
    #[must_use]
    pub fn to_mcp_tool_info(&self) -> McpToolInfo {
        McpToolInfo {
            name: self.public_name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }
}

/// Wire representation of a tool in an MCP `tools/list` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// How the hub derives a tool's public name from its backend id and the
/// backend's own tool name, per spec.md §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamingStrategy {
    /// Always qualify every tool, even when the bare name is free.
    Namespace,
    /// Use the bare name if it's free; otherwise qualify, the same way
    /// `Namespace` always does.
    Alias,
    /// Use the bare name if it's free; otherwise fail the whole batch.
    Error,
}

impl Default for NamingStrategy {
    fn default() -> Self {
        Self::Namespace
    }
}

/// Outcome of deriving a public name for one tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameResolution {
    Name(String),
    /// `strategy` was `Error` and the bare name was already taken.
    Rejected,
}

/// Pure function deriving a public tool name, per spec.md §4.3's three
/// strategies. Separated from the registry so naming behavior is unit- and
/// property-testable without any async machinery.
///
/// `bare_name_taken` tells the function whether `tool_name` is already
/// registered under another backend — irrelevant to `Namespace`, which
/// always qualifies, but decisive for `Alias`/`Error`. An explicit `alias`
/// overrides derivation regardless of strategy or collision, per spec.md.
#[must_use]
pub fn derive_public_name(
    naming: &crate::config::NamingConfig,
    backend_id: &BackendId,
    tool_name: &str,
    alias: Option<&str>,
    bare_name_taken: bool,
) -> NameResolution {
    if let Some(alias) = alias {
        return NameResolution::Name(alias.to_string());
    }
    match naming.strategy {
        NamingStrategy::Namespace => NameResolution::Name(naming.qualify(backend_id, tool_name)),
        NamingStrategy::Alias => {
            if bare_name_taken {
                NameResolution::Name(naming.qualify(backend_id, tool_name))
            } else {
                NameResolution::Name(tool_name.to_string())
            }
        }
        NamingStrategy::Error => {
            if bare_name_taken {
                NameResolution::Rejected
            } else {
                NameResolution::Name(tool_name.to_string())
            }
        }
    }
}
