//! Hub Router (C4): resolves a public tool name, lazily connects its
//! backend if needed, and races the call against the configured
//! `tool_call_ms` timeout. Concurrency is gated by one global semaphore and
//! one per-backend semaphore, both acquired FIFO before dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::config::{ConcurrencyConfig, TimeoutConfig};
use crate::error::{HubError, HubResult};
use crate::models::{BackendId, BackendState};
use crate::registry::ToolRegistry;
use crate::supervisor::BackendSupervisor;

/// Dispatches `tools/call` to the backend that owns the named tool,
/// starting it first if it's configured `lazy` and not yet running.
pub struct HubRouter {
    registry: Arc<ToolRegistry>,
    backends: Arc<DashMap<BackendId, Arc<BackendSupervisor>>>,
    timeouts: TimeoutConfig,
    global_limit: Arc<Semaphore>,
    per_backend_limits: HashMap<BackendId, Arc<Semaphore>>,
}

impl HubRouter {
    #[must_use]
    pub fn new(
        registry: Arc<ToolRegistry>,
        backends: Arc<DashMap<BackendId, Arc<BackendSupervisor>>>,
        concurrency: &ConcurrencyConfig,
        timeouts: TimeoutConfig,
    ) -> Self {
        let per_backend_limits = concurrency
            .per_backend
            .iter()
            .map(|(id, n)| (id.clone(), Arc::new(Semaphore::new(*n))))
            .collect();
        Self {
            registry,
            backends,
            timeouts,
            global_limit: Arc::new(Semaphore::new(concurrency.global)),
            per_backend_limits,
        }
    }

    /// Resolve `tool_name`, lazily start its backend if needed, and call
    /// it, returning the result verbatim — including an `isError: true`
    /// tool-result body, which is not itself a dispatch failure.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::UnknownTool`] if no backend registers that
    /// name, [`HubError::BackendUnavailable`] if the backend can't be
    /// lazily started, or [`HubError::CallTimeout`] if the call outlasts
    /// `tool_call_ms`.
    pub async fn call_tool(&self, tool_name: &str, arguments: Option<Value>) -> HubResult<Value> {
        let (backend_id, backend_tool_name) = self
            .registry
            .resolve_tool(tool_name)
            .await
            .ok_or_else(|| HubError::UnknownTool {
                tool: tool_name.to_string(),
            })?;

        let supervisor = self
            .backends
            .get(&backend_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| HubError::UnknownBackend {
                backend: backend_id.clone(),
            })?;

        self.ensure_started(&supervisor).await?;

        let _global_permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| HubError::ConcurrencyLimitExhausted)?;
        let _backend_permit = match self.per_backend_limits.get(&backend_id) {
            Some(sem) => Some(
                sem.acquire()
                    .await
                    .map_err(|_| HubError::ConcurrencyLimitExhausted)?,
            ),
            None => None,
        };

        let timeout = Duration::from_millis(self.timeouts.tool_call_ms);
        let call = supervisor.call_tool(&backend_tool_name, arguments);
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(backend = %backend_id, tool = %backend_tool_name, "tool call timed out");
                Err(HubError::CallTimeout {
                    backend: backend_id,
                    tool: backend_tool_name,
                })
            }
        }
    }

    /// Resolve a public tool name to the backend supervisor that would
    /// serve it, without dispatching a call. Used by the client-facing
    /// transport to subscribe to a backend's progress events *before*
    /// issuing the call that will emit them, so no early progress frame
    /// is missed.
    pub async fn resolve_backend(&self, tool_name: &str) -> Option<Arc<BackendSupervisor>> {
        let (backend_id, _) = self.registry.resolve_tool(tool_name).await?;
        self.backends.get(&backend_id).map(|entry| Arc::clone(entry.value()))
    }

    /// If the backend is `lazy` and not yet running, start it. A
    /// non-`lazy` backend that isn't `Running` is a configuration/lifecycle
    /// problem the router must not paper over by starting it on demand, so
    /// it fails the call with `backend-unavailable` instead. Two concurrent
    /// triggers on a lazy backend share one spawn because `BackendSupervisor::
    /// start` itself is single-flight; this method just decides whether a
    /// start is warranted at all.
    async fn ensure_started(&self, supervisor: &Arc<BackendSupervisor>) -> HubResult<()> {
        if supervisor.state().await == BackendState::Running {
            return Ok(());
        }
        if supervisor.start_mode() != crate::models::StartMode::Lazy {
            return Err(HubError::BackendUnavailable {
                backend: supervisor.id().clone(),
            });
        }
        // Stopped/Crashed/mid-transition: start() is single-flight and
        // safe to call again; it no-ops if we're already past Starting, or
        // joins the in-progress attempt otherwise.
        info!(backend = %supervisor.id(), "lazily starting backend for call");
        supervisor.start().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NamingConfig;
    use crate::models::{BackendConfig, BackendKind, BackendTimeouts, BackendTool, NamingStrategy, ProcessLaunch, StartMode};
    use serde_json::json;

    fn alias_naming() -> NamingConfig {
        NamingConfig {
            strategy: NamingStrategy::Alias,
            ..NamingConfig::default()
        }
    }

    fn backend_config(id: &str) -> BackendConfig {
        BackendConfig {
            id: BackendId::new(id).unwrap(),
            kind: BackendKind::Local(ProcessLaunch {
                command: "true".to_string(),
                args: vec![],
                cwd: None,
                env: HashMap::new(),
            }),
            start_mode: StartMode::Lazy,
            timeouts: BackendTimeouts::default(),
            tools_include: vec![],
            tools_exclude: vec![],
            concurrency: None,
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_rejected_before_touching_any_backend() {
        let registry = Arc::new(ToolRegistry::new());
        let backends = Arc::new(DashMap::new());
        let router = HubRouter::new(
            Arc::clone(&registry),
            backends,
            &ConcurrencyConfig::default(),
            TimeoutConfig::default(),
        );
        let err = router.call_tool("missing", None).await.unwrap_err();
        assert!(matches!(err, HubError::UnknownTool { .. }));
    }

    #[tokio::test]
    async fn resolved_tool_with_missing_backend_entry_is_unknown_backend() {
        let registry = Arc::new(ToolRegistry::new());
        registry
            .register_backend_tools(
                &BackendId::new("ghost").unwrap(),
                vec![BackendTool {
                    name: "read".to_string(),
                    description: None,
                    input_schema: json!({}),
                }],
                &alias_naming(),
            )
            .await
            .unwrap();
        let backends = Arc::new(DashMap::new());
        let router = HubRouter::new(registry, backends, &ConcurrencyConfig::default(), TimeoutConfig::default());
        let err = router.call_tool("read", None).await.unwrap_err();
        assert!(matches!(err, HubError::UnknownBackend { .. }));
    }

    #[test]
    fn backend_config_helper_constructs_local_kind() {
        let cfg = backend_config("x");
        assert_eq!(cfg.kind.label(), "local");
    }

    #[tokio::test]
    async fn eager_backend_not_running_is_unavailable_without_autostart() {
        let registry = Arc::new(ToolRegistry::new());
        registry
            .register_backend_tools(
                &BackendId::new("eager").unwrap(),
                vec![BackendTool {
                    name: "read".to_string(),
                    description: None,
                    input_schema: json!({}),
                }],
                &alias_naming(),
            )
            .await
            .unwrap();

        let backends = Arc::new(DashMap::new());
        let mut eager_config = backend_config("eager");
        eager_config.start_mode = StartMode::Eager;
        let supervisor = BackendSupervisor::new(eager_config);
        backends.insert(BackendId::new("eager").unwrap(), supervisor);

        let router = HubRouter::new(registry, backends, &ConcurrencyConfig::default(), TimeoutConfig::default());
        let err = router.call_tool("read", None).await.unwrap_err();
        assert!(matches!(err, HubError::BackendUnavailable { .. }));
    }
}
