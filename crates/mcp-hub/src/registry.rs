//! Tool Registry (C3): maps public tool names to the backend that serves
//! them, deriving each tool's public name per the configured naming
//! strategy.
//!
//! A single-writer `RwLock<RegistryState>` holds two maps — public name to
//! entry, and `(backend, backend tool name)` to public name — so both
//! lookup directions are O(1). `register_backend_tools` builds the new
//! entries into a scratch vector first and swaps them in under one write
//! acquisition, so readers never observe a partially-registered backend.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::config::NamingConfig;
use crate::error::HubError;
use crate::models::{derive_public_name, BackendId, BackendTool, McpToolInfo, NameResolution, RegisteredTool};

#[derive(Default)]
struct RegistryState {
    by_public_name: HashMap<String, RegisteredTool>,
    by_backend_tool: HashMap<(BackendId, String), String>,
}

/// Owns the public-name -> backend mapping for every registered tool.
pub struct ToolRegistry {
    state: RwLock<RegistryState>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Register every tool a backend just discovered, replacing whatever
    /// that backend had registered before (a restart that returns the same
    /// `backend_name` set reuses the same public names it's keyed under;
    /// any tool present before but absent now is dropped).
    ///
    /// # Errors
    ///
    /// Returns [`HubError::ToolNameCollision`] if `naming.strategy` is
    /// `Error` and a name collides. On error, nothing from this call is
    /// registered — the caller (the supervisor) transitions only the
    /// offending backend to `Crashed`, leaving every other backend's
    /// registration untouched.
    pub async fn register_backend_tools(
        &self,
        backend_id: &BackendId,
        tools: Vec<BackendTool>,
        naming: &NamingConfig,
    ) -> Result<(), HubError> {
        let mut state = self.state.write().await;

        let mut scratch_public: HashMap<String, RegisteredTool> = HashMap::new();
        let mut scratch_lookup: HashMap<(BackendId, String), String> = HashMap::new();

        // Entries from other backends survive untouched; only this
        // backend's previous entries are superseded.
        for (public_name, entry) in &state.by_public_name {
            if entry.backend_id != *backend_id {
                scratch_public.insert(public_name.clone(), entry.clone());
            }
        }
        for (key, public_name) in &state.by_backend_tool {
            if key.0 != *backend_id {
                scratch_lookup.insert(key.clone(), public_name.clone());
            }
        }

        for tool in tools {
            let alias = naming.alias_for(backend_id, &tool.name);
            let bare_name_taken = scratch_public.contains_key(&tool.name);
            let public_name = match derive_public_name(naming, backend_id, &tool.name, alias, bare_name_taken) {
                NameResolution::Name(name) => name,
                NameResolution::Rejected => {
                    let existing = scratch_public
                        .get(&tool.name)
                        .map(|e| e.backend_id.clone())
                        .unwrap_or_else(|| backend_id.clone());
                    return Err(HubError::ToolNameCollision {
                        tool: tool.name.clone(),
                        existing,
                        incoming: backend_id.clone(),
                    });
                }
            };

            let backend_tool_name = tool.name.clone();
            let entry = RegisteredTool::new(backend_id.clone(), tool, public_name.clone());
            scratch_lookup.insert((backend_id.clone(), backend_tool_name), public_name.clone());
            scratch_public.insert(public_name, entry);
        }

        state.by_public_name = scratch_public;
        state.by_backend_tool = scratch_lookup;
        Ok(())
    }

    /// Remove every tool registered for `backend_id` (used when a backend
    /// stops or crashes so stale entries don't answer `tools/call`).
    pub async fn clear_backend(&self, backend_id: &BackendId) {
        let mut state = self.state.write().await;
        state
            .by_public_name
            .retain(|_, entry| entry.backend_id != *backend_id);
        state.by_backend_tool.retain(|key, _| key.0 != *backend_id);
    }

    /// Resolve a public tool name to its owning backend and original
    /// backend-local tool name.
    pub async fn resolve_tool(&self, public_name: &str) -> Option<(BackendId, String)> {
        let state = self.state.read().await;
        state
            .by_public_name
            .get(public_name)
            .map(|entry| (entry.backend_id.clone(), entry.backend_name.clone()))
    }

    /// Every currently-registered tool, sorted by public name for
    /// deterministic `tools/list` ordering.
    pub async fn list_public_tools(&self) -> Vec<McpToolInfo> {
        let state = self.state.read().await;
        let mut tools: Vec<McpToolInfo> = state
            .by_public_name
            .values()
            .map(RegisteredTool::to_mcp_tool_info)
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.state.read().await.by_public_name.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NamingStrategy;
    use serde_json::json;

    fn tool(name: &str) -> BackendTool {
        BackendTool {
            name: name.to_string(),
            description: None,
            input_schema: json!({}),
        }
    }

    fn id(s: &str) -> BackendId {
        BackendId::new(s).unwrap()
    }

    fn alias_naming() -> NamingConfig {
        NamingConfig {
            strategy: NamingStrategy::Alias,
            ..NamingConfig::default()
        }
    }

    #[tokio::test]
    async fn register_and_resolve_round_trip() {
        let registry = ToolRegistry::new();
        registry
            .register_backend_tools(&id("files"), vec![tool("read")], &alias_naming())
            .await
            .unwrap();
        let (backend, backend_tool) = registry.resolve_tool("read").await.unwrap();
        assert_eq!(backend, id("files"));
        assert_eq!(backend_tool, "read");
    }

    #[tokio::test]
    async fn clear_backend_removes_only_that_backends_tools() {
        let registry = ToolRegistry::new();
        let naming = alias_naming();
        registry
            .register_backend_tools(&id("files"), vec![tool("read")], &naming)
            .await
            .unwrap();
        registry
            .register_backend_tools(&id("search"), vec![tool("query")], &naming)
            .await
            .unwrap();

        registry.clear_backend(&id("files")).await;

        assert!(registry.resolve_tool("read").await.is_none());
        assert!(registry.resolve_tool("query").await.is_some());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn namespace_strategy_always_qualifies_even_the_first_registration() {
        let registry = ToolRegistry::new();
        let naming = NamingConfig {
            strategy: NamingStrategy::Namespace,
            ..NamingConfig::default()
        };
        registry
            .register_backend_tools(&id("a"), vec![tool("read")], &naming)
            .await
            .unwrap();
        registry
            .register_backend_tools(&id("b"), vec![tool("read")], &naming)
            .await
            .unwrap();

        assert!(registry.resolve_tool("read").await.is_none());
        assert!(registry.resolve_tool("a__read").await.is_some());
        assert!(registry.resolve_tool("b__read").await.is_some());
    }

    #[tokio::test]
    async fn alias_strategy_qualifies_only_the_losing_registration() {
        let registry = ToolRegistry::new();
        let naming = alias_naming();
        registry
            .register_backend_tools(&id("a"), vec![tool("read")], &naming)
            .await
            .unwrap();
        registry
            .register_backend_tools(&id("b"), vec![tool("read")], &naming)
            .await
            .unwrap();

        assert!(registry.resolve_tool("read").await.is_some());
        assert!(registry.resolve_tool("b__read").await.is_some());
    }

    #[tokio::test]
    async fn error_strategy_rejects_and_registers_nothing_from_losing_call() {
        let registry = ToolRegistry::new();
        let naming = NamingConfig {
            strategy: NamingStrategy::Error,
            ..NamingConfig::default()
        };
        registry
            .register_backend_tools(&id("a"), vec![tool("read")], &naming)
            .await
            .unwrap();
        let err = registry
            .register_backend_tools(&id("b"), vec![tool("read"), tool("write")], &naming)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::ToolNameCollision { .. }));
        // Nothing from b's batch was registered, not even the non-colliding `write`.
        assert!(registry.resolve_tool("write").await.is_none());
    }

    #[tokio::test]
    async fn listing_is_sorted_by_public_name() {
        let registry = ToolRegistry::new();
        let naming = alias_naming();
        registry
            .register_backend_tools(&id("a"), vec![tool("zeta"), tool("alpha")], &naming)
            .await
            .unwrap();
        let listed = registry.list_public_tools().await;
        let names: Vec<_> = listed.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    proptest::proptest! {
        #[test]
        fn derive_public_name_is_identity_for_non_colliding_under_alias(tool_name in "[a-z][a-z0-9_]{0,20}") {
            let backend = id("b");
            let naming = alias_naming();
            let derived = crate::models::derive_public_name(&naming, &backend, &tool_name, None, false);
            proptest::prop_assert_eq!(derived, crate::models::NameResolution::Name(tool_name));
        }
    }
}
