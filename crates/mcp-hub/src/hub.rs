//! Aggregate root: wires the backend supervisors (C2), the tool registry
//! (C3), the router (C4), and the client-facing transport (C5) together,
//! and owns graceful shutdown.

use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::HubConfig;
use crate::error::{HubError, HubResult};
use crate::models::{BackendId, StartMode};
use crate::registry::ToolRegistry;
use crate::router::HubRouter;
use crate::server::{self, session::SessionManager, HubState, StreamRegistry};
use crate::supervisor::BackendSupervisor;

pub struct Hub {
    config: HubConfig,
    registry: Arc<ToolRegistry>,
    backends: Arc<DashMap<BackendId, Arc<BackendSupervisor>>>,
    router: Arc<HubRouter>,
    sessions: Arc<SessionManager>,
    streams: Arc<StreamRegistry>,
    cancel: CancellationToken,
}

impl Hub {
    /// Construct a hub from validated configuration: build one supervisor
    /// per configured backend, start every `eager` one (package/local
    /// backends may fail to spawn at all — that failure is logged, not
    /// fatal to the hub as a whole, per the "fail only the offending
    /// backend" decision), and register their tools.
    ///
    /// # Errors
    ///
    /// Currently infallible; returns `Result` so construction can grow a
    /// genuine failure mode (e.g. a config-time backend validation) without
    /// changing the public signature.
    pub async fn new(config: HubConfig) -> HubResult<Self> {
        let registry = Arc::new(ToolRegistry::new());
        let backends = Arc::new(DashMap::new());

        for backend_config in &config.backends {
            let supervisor = BackendSupervisor::new(backend_config.clone());
            backends.insert(backend_config.id.clone(), Arc::clone(&supervisor));
        }

        let router = Arc::new(HubRouter::new(
            Arc::clone(&registry),
            Arc::clone(&backends),
            &config.concurrency,
            config.timeouts.clone(),
        ));

        let hub = Self {
            config,
            registry,
            backends,
            router,
            sessions: Arc::new(SessionManager::new()),
            streams: Arc::new(StreamRegistry::new()),
            cancel: CancellationToken::new(),
        };

        hub.start_eager_backends().await;
        Ok(hub)
    }

    async fn start_eager_backends(&self) {
        let mut handles = Vec::new();
        for entry in self.backends.iter() {
            let backend_config = self
                .config
                .backends
                .iter()
                .find(|b| b.id == *entry.key())
                .expect("every supervisor is built from a config entry");
            if backend_config.start_mode != StartMode::Eager {
                continue;
            }
            let supervisor = Arc::clone(entry.value());
            let registry = Arc::clone(&self.registry);
            let naming = self.config.naming.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = supervisor.start().await {
                    error!(backend = %supervisor.id(), error = %e, "eager start failed");
                    return;
                }
                let tools = supervisor.tools().await;
                if let Err(e) = registry
                    .register_backend_tools(supervisor.id(), tools, &naming)
                    .await
                {
                    warn!(backend = %supervisor.id(), error = %e, "tool registration failed, crashing backend");
                    let _ = supervisor.stop().await;
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Run the HTTP server until shutdown is requested (Ctrl-C or SIGTERM).
    ///
    /// # Errors
    ///
    /// Returns the error `axum::serve` produced, typically a bind failure.
    pub async fn serve(self: Arc<Self>) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.config.http.host, self.config.http.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(%addr, "mcp-hub listening");

        let sweeper = server::sweeper::spawn(
            Arc::clone(&self.sessions),
            Arc::clone(&self.streams),
            self.cancel.child_token(),
        );

        let state = HubState {
            router: Arc::clone(&self.router),
            registry: Arc::clone(&self.registry),
            sessions: Arc::clone(&self.sessions),
            streams: Arc::clone(&self.streams),
        };
        let app = server::create_router(state);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        self.cancel.cancel();
        sweeper.abort();
        self.stop_all_backends().await;
        Ok(())
    }

    async fn stop_all_backends(&self) {
        let mut handles = Vec::new();
        for entry in self.backends.iter() {
            let supervisor = Arc::clone(entry.value());
            handles.push(tokio::spawn(async move {
                let _ = supervisor.stop().await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    #[must_use]
    pub fn router(&self) -> Arc<HubRouter> {
        Arc::clone(&self.router)
    }

    #[must_use]
    pub fn registry(&self) -> Arc<ToolRegistry> {
        Arc::clone(&self.registry)
    }

    pub async fn add_backend(&self, backend_config: crate::models::BackendConfig) -> HubResult<()> {
        if self.backends.contains_key(&backend_config.id) {
            if let Some(existing) = self.backends.get(&backend_config.id) {
                let _ = existing.stop().await;
            }
        }
        let id = backend_config.id.clone();
        let eager = backend_config.start_mode == StartMode::Eager;
        let supervisor = BackendSupervisor::new(backend_config);
        self.backends.insert(id.clone(), Arc::clone(&supervisor));
        if eager {
            supervisor.start().await?;
            let tools = supervisor.tools().await;
            self.registry
                .register_backend_tools(&id, tools, &self.config.naming)
                .await?;
        }
        Ok(())
    }

    pub async fn remove_backend(&self, id: &BackendId) -> HubResult<()> {
        if let Some((_, supervisor)) = self.backends.remove(id) {
            supervisor.stop().await?;
        }
        self.registry.clear_backend(id).await;
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("shutdown signal received");
}
