//! Backend Supervisor (C2): owns one backend's lifecycle end to end —
//! spawn/connect, tool discovery, health probing, crash detection with
//! doubling-delay auto-restart, and demultiplexing `tools/call` responses
//! back to their caller by JSON-RPC id.
//!
//! The transport is owned exclusively by a background task (`run_io_loop`)
//! so `send`/`recv` never need external locking; callers talk to it over
//! channels. This mirrors the "single task owns the resource" shape the
//! client-facing transport (C5) uses for its session maps.

mod events;

pub use events::SupervisorEvent;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{HubError, HubResult};
use crate::jsonrpc::{JsonRpcMessage, JsonRpcRequest};
use crate::models::{BackendConfig, BackendId, BackendKind, BackendState, BackendTool};
use crate::transport::{BackendTransport, HttpTransport, PipeTransport, SseTransport, WebSocketTransport};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// Protocol version the hub advertises to backends during its own outbound
/// `initialize`, matching what it advertises to clients
/// (`server::transport::PROTOCOL_VERSION`).
const BACKEND_PROTOCOL_VERSION: &str = "2025-06-18";

/// Extra CLI flags appended to a `package` backend's launch so the runner
/// never blocks on an interactive prompt and prefers whatever it already
/// has cached (modeled on `npx`'s `--yes`/`--prefer-offline`).
const PACKAGE_AUTO_CONFIRM_ARG: &str = "--yes";
const PACKAGE_PREFER_CACHE_ARG: &str = "--prefer-offline";

/// Env vars suppressing a package runner's own progress bar / update-nagging
/// output, which would otherwise land in the stderr diagnostic channel
/// alongside (and drowning out) the install-phase pattern we scan for.
fn package_env_overrides() -> [(String, String); 2] {
    [
        ("NO_UPDATE_NOTIFIER".to_string(), "1".to_string()),
        ("npm_config_progress".to_string(), "false".to_string()),
    ]
}

/// Build the launch for a `package` backend: the configured command/args
/// plus the auto-confirm/prefer-cache flags and the progress-suppressing
/// env, both MUST per spec for this kind.
fn package_launch(launch: &crate::models::ProcessLaunch) -> crate::models::ProcessLaunch {
    let mut launch = launch.clone();
    launch.args.push(PACKAGE_AUTO_CONFIRM_ARG.to_string());
    launch.args.push(PACKAGE_PREFER_CACHE_ARG.to_string());
    for (key, value) in package_env_overrides() {
        launch.env.entry(key).or_insert(value);
    }
    launch
}

fn build_transport(id: &BackendId, kind: &BackendKind) -> Box<dyn BackendTransport> {
    match kind {
        BackendKind::Local(launch) => Box::new(PipeTransport::new(id.to_string(), launch.clone())),
        BackendKind::Package(launch) => {
            Box::new(PipeTransport::new(id.to_string(), package_launch(launch)))
        }
        BackendKind::Remote(endpoint) => match endpoint.transport {
            crate::models::RemoteTransportKind::Http => Box::new(HttpTransport::new(endpoint.clone())),
            crate::models::RemoteTransportKind::Sse => Box::new(SseTransport::new(endpoint.clone())),
            crate::models::RemoteTransportKind::WebSocket => {
                Box::new(WebSocketTransport::new(endpoint.clone()))
            }
        },
    }
}

struct PendingCall {
    responder: oneshot::Sender<Result<Value, HubError>>,
    tool: String,
}

/// Owns one backend end to end. Constructed once per configured backend by
/// the hub aggregate root and kept for the hub's lifetime; `Crashed` and
/// `Stopped` are both re-enterable via `start()`.
pub struct BackendSupervisor {
    id: BackendId,
    config: BackendConfig,
    state: RwLock<BackendState>,
    /// Guards the start/stop critical section: the first caller performs
    /// the work, later concurrent callers block on this lock and then
    /// observe the resulting state/`last_lifecycle_error`, which is this
    /// crate's single-flight shape (the pack's `Shared`-future pattern,
    /// adapted so [`BackendTransport`] doesn't need `Clone`).
    lifecycle_lock: Mutex<()>,
    last_lifecycle_error: Mutex<Option<Arc<HubError>>>,
    outbound: Mutex<Option<mpsc::Sender<JsonRpcRequest>>>,
    pending: Mutex<HashMap<u64, PendingCall>>,
    next_request_id: AtomicU64,
    tools: RwLock<Vec<BackendTool>>,
    events_tx: broadcast::Sender<SupervisorEvent>,
    io_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    health_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    consecutive_health_failures: AtomicU32,
    restart_count: AtomicU32,
    /// Whether a prior start's stderr ever showed the package-install
    /// pattern. `false` until then, so a `package` backend's first start
    /// uses the long install timeout; once a start has actually shown the
    /// pattern, later starts (cache warm) use the normal one.
    package_install_seen: std::sync::atomic::AtomicBool,
    cancel: CancellationToken,
}

impl BackendSupervisor {
    #[must_use]
    pub fn new(config: BackendConfig) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            id: config.id.clone(),
            config,
            state: RwLock::new(BackendState::Stopped),
            lifecycle_lock: Mutex::new(()),
            last_lifecycle_error: Mutex::new(None),
            outbound: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            tools: RwLock::new(Vec::new()),
            events_tx,
            io_task: Mutex::new(None),
            health_task: Mutex::new(None),
            consecutive_health_failures: AtomicU32::new(0),
            restart_count: AtomicU32::new(0),
            package_install_seen: std::sync::atomic::AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn id(&self) -> &BackendId {
        &self.id
    }

    #[must_use]
    pub fn start_mode(&self) -> crate::models::StartMode {
        self.config.start_mode
    }

    pub async fn state(&self) -> BackendState {
        *self.state.read().await
    }

    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events_tx.subscribe()
    }

    pub async fn tools(&self) -> Vec<BackendTool> {
        self.tools.read().await.clone()
    }

    async fn set_state(&self, state: BackendState) {
        *self.state.write().await = state;
        let _ = self.events_tx.send(SupervisorEvent::StateChanged {
            backend: self.id.clone(),
            state,
        });
    }

    /// Start sequence (spec step 1-7): spawn/connect, discover tools,
    /// transition through to `Running`. Single-flight: a concurrent second
    /// caller blocks on `lifecycle_lock` and then inherits the first
    /// caller's outcome rather than starting a second transport.
    ///
    /// # Errors
    ///
    /// Returns the error the start sequence failed with; on failure the
    /// backend is left in `Crashed`, not `Stopped`, so callers can tell a
    /// never-started backend from one whose first start attempt failed.
    pub async fn start(self: &Arc<Self>) -> HubResult<()> {
        let _guard = self.lifecycle_lock.lock().await;

        let current = self.state().await;
        if current == BackendState::Running {
            return Ok(());
        }
        if !current.can_start() {
            // Another path (e.g. a racing stop()) left us mid-transition;
            // treat as success if we're already past Starting.
            return Ok(());
        }

        match self.start_inner().await {
            Ok(()) => {
                *self.last_lifecycle_error.lock().await = None;
                Ok(())
            }
            Err(err) => {
                let shared = Arc::new(err);
                *self.last_lifecycle_error.lock().await = Some(Arc::clone(&shared));
                self.set_state(BackendState::Crashed).await;
                let _ = self.events_tx.send(SupervisorEvent::Crashed {
                    backend: self.id.clone(),
                    message: shared.to_string(),
                });
                Err(HubError::StartFailed {
                    backend: self.id.clone(),
                    message: shared.to_string(),
                })
            }
        }
    }

    async fn start_inner(self: &Arc<Self>) -> HubResult<()> {
        self.set_state(BackendState::Starting).await;
        let _ = self.events_tx.send(SupervisorEvent::Starting {
            backend: self.id.clone(),
        });

        let mut transport = build_transport(&self.id, &self.config.kind);
        let is_package = matches!(self.config.kind, BackendKind::Package(_));
        let init_timeout = if is_package && !self.package_install_seen.load(Ordering::SeqCst) {
            self.config.timeouts.install()
        } else {
            self.config.timeouts.init()
        };

        tokio::time::timeout(init_timeout, transport.open())
            .await
            .map_err(|_| HubError::StartFailed {
                backend: self.id.clone(),
                message: "timed out opening transport".to_string(),
            })?
            .map_err(|e| HubError::StartFailed {
                backend: self.id.clone(),
                message: e.to_string(),
            })?;

        if is_package && transport.saw_install_pattern() {
            self.package_install_seen.store(true, Ordering::SeqCst);
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        *self.outbound.lock().await = Some(outbound_tx);

        let io_handle = tokio::spawn(Self::run_io_loop(
            Arc::clone(self),
            transport,
            outbound_rx,
            self.cancel.child_token(),
        ));
        *self.io_task.lock().await = Some(io_handle);

        self.send_request("initialize", Some(Self::initialize_params()))
            .await
            .map_err(|e| HubError::StartFailed {
                backend: self.id.clone(),
                message: format!("initialize handshake failed: {e}"),
            })?;
        self.set_state(BackendState::Initialized).await;

        self.set_state(BackendState::ToolsDiscovering).await;
        let tools = self.discover_tools_inner().await?;
        *self.tools.write().await = tools;
        let _ = self.events_tx.send(SupervisorEvent::ToolsDiscovered {
            backend: self.id.clone(),
            count: self.tools.read().await.len(),
        });

        self.set_state(BackendState::ToolsReady).await;
        self.set_state(BackendState::Running).await;
        self.restart_count.store(0, Ordering::SeqCst);
        self.consecutive_health_failures.store(0, Ordering::SeqCst);

        if let Some(healthcheck_ms) = self.config.timeouts.healthcheck_ms {
            let handle = tokio::spawn(Self::run_health_loop(
                Arc::clone(self),
                Duration::from_millis(healthcheck_ms),
                self.cancel.child_token(),
            ));
            *self.health_task.lock().await = Some(handle);
        }

        let _ = self.events_tx.send(SupervisorEvent::Started {
            backend: self.id.clone(),
        });
        Ok(())
    }

    /// The `initialize` request params sent to every backend: a protocol
    /// version, the hub's own client-info block, and the capabilities the
    /// hub supports as an MCP client.
    fn initialize_params() -> Value {
        serde_json::json!({
            "protocolVersion": BACKEND_PROTOCOL_VERSION,
            "clientInfo": { "name": "mcp-hub", "version": env!("CARGO_PKG_VERSION") },
            "capabilities": {},
        })
    }

    async fn discover_tools_inner(self: &Arc<Self>) -> HubResult<Vec<BackendTool>> {
        let result = self.send_request("tools/list", None).await?;
        let tools = result
            .get("tools")
            .cloned()
            .unwrap_or_else(|| Value::Array(vec![]));
        serde_json::from_value(tools).map_err(HubError::Serialization)
    }

    /// Stop sequence: cancel the io/health tasks, fail every pending call,
    /// and transition to `Stopped`. Single-flight via the same
    /// `lifecycle_lock` as `start()`.
    ///
    /// # Errors
    ///
    /// This method does not currently fail; it returns `Result` to match
    /// `start()`'s shape and leave room for a future transport-level
    /// graceful-close failure to propagate.
    pub async fn stop(&self) -> HubResult<()> {
        let _guard = self.lifecycle_lock.lock().await;
        if self.state().await == BackendState::Stopped {
            return Ok(());
        }
        self.set_state(BackendState::Stopping).await;
        let _ = self.events_tx.send(SupervisorEvent::Stopping {
            backend: self.id.clone(),
        });

        self.cancel.cancel();
        if let Some(handle) = self.io_task.lock().await.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.health_task.lock().await.take() {
            handle.abort();
        }
        self.fail_all_pending(HubError::BackendUnavailable {
            backend: self.id.clone(),
        })
        .await;
        *self.outbound.lock().await = None;

        self.set_state(BackendState::Stopped).await;
        let _ = self.events_tx.send(SupervisorEvent::Stopped {
            backend: self.id.clone(),
        });
        Ok(())
    }

    /// Stop then start, preserving the restart counter (unlike an
    /// operator-triggered `start()` after `Stopped`, which resets it).
    ///
    /// # Errors
    ///
    /// Propagates `start()`'s error.
    pub async fn restart(self: &Arc<Self>) -> HubResult<()> {
        let carried = self.restart_count.load(Ordering::SeqCst);
        self.stop().await?;
        self.restart_count.store(carried, Ordering::SeqCst);
        self.start().await
    }

    /// Call a tool on this backend and wait for its result, demuxed off
    /// the io loop by request id. The caller (the router, C4) is
    /// responsible for racing this against the per-call timeout; this
    /// method itself waits indefinitely for either a response or the
    /// backend dying.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::BackendUnavailable`] if not `Running`, or
    /// whatever error the backend's response carried.
    pub async fn call_tool(&self, tool: &str, arguments: Option<Value>) -> HubResult<Value> {
        if self.state().await != BackendState::Running {
            return Err(HubError::BackendUnavailable {
                backend: self.id.clone(),
            });
        }

        let mut params = serde_json::json!({ "name": tool });
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }

        self.send_request("tools/call", Some(params)).await
    }

    /// Send one request and await its matching response via the pending
    /// map. Used both by `call_tool` and internally by `discover_tools`.
    async fn send_request(&self, method: &str, params: Option<Value>) -> HubResult<Value> {
        let outbound = self
            .outbound
            .lock()
            .await
            .clone()
            .ok_or_else(|| HubError::BackendUnavailable {
                backend: self.id.clone(),
            })?;

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(
            request_id,
            PendingCall {
                responder: tx,
                tool: method.to_string(),
            },
        );

        let request = JsonRpcRequest {
            jsonrpc: std::borrow::Cow::Borrowed(crate::jsonrpc::VERSION),
            method: method.to_string(),
            params,
            id: Some(Value::from(request_id)),
        };

        if outbound.send(request).await.is_err() {
            self.pending.lock().await.remove(&request_id);
            return Err(HubError::BackendUnavailable {
                backend: self.id.clone(),
            });
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(HubError::TransportClosed {
                backend: self.id.clone(),
                message: "backend disconnected before responding".to_string(),
            }),
        }
    }

    async fn fail_all_pending(&self, err: HubError) {
        let mut pending = self.pending.lock().await;
        for (_, call) in pending.drain() {
            debug!(backend = %self.id, tool = %call.tool, "dropping pending call on state exit");
            let _ = call.responder.send(Err(HubError::BackendUnavailable {
                backend: self.id.clone(),
            }));
        }
        let _ = err;
    }

    /// Background task owning the transport exclusively. Reads responses
    /// and demuxes them by id; reads the outbound channel and forwards
    /// sends. On clean EOF or a protocol error while `Running`, this is a
    /// crash: fail all pending calls, transition to `Crashed`, and — if
    /// restarts remain — schedule an auto-restart with a doubling delay.
    async fn run_io_loop(
        self_arc: Arc<Self>,
        mut transport: Box<dyn BackendTransport>,
        mut outbound_rx: mpsc::Receiver<JsonRpcRequest>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                frame = transport.recv() => {
                    match frame {
                        Ok(Some(JsonRpcMessage::Response(response))) => {
                            self_arc.dispatch_response(response).await;
                        }
                        Ok(Some(JsonRpcMessage::Request(request))) => {
                            self_arc.handle_backend_notification(request);
                        }
                        Ok(None) => {
                            warn!(backend = %self_arc.id, "backend transport closed (clean EOF)");
                            self_arc.handle_crash("transport closed").await;
                            break;
                        }
                        Err(e) => {
                            error!(backend = %self_arc.id, error = %e, "backend transport failed");
                            self_arc.handle_crash(&e.to_string()).await;
                            break;
                        }
                    }
                }
                outbound = outbound_rx.recv() => {
                    match outbound {
                        Some(request) => {
                            if let Err(e) = transport.send(&request).await {
                                error!(backend = %self_arc.id, error = %e, "failed to send to backend");
                                self_arc.handle_crash(&e.to_string()).await;
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        let _ = transport.close().await;
    }

    async fn dispatch_response(&self, response: crate::jsonrpc::JsonRpcResponse) {
        let Some(id) = response.id.as_ref().and_then(serde_json::Value::as_u64) else {
            return;
        };
        let Some(call) = self.pending.lock().await.remove(&id) else {
            return;
        };
        let result = match response.error {
            Some(err) => Err(HubError::ToolCallFailed {
                backend: self.id.clone(),
                tool: call.tool,
                message: err.message,
            }),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        let _ = call.responder.send(result);
    }

    fn handle_backend_notification(&self, request: JsonRpcRequest) {
        if request.method == "notifications/progress" {
            if let Some(params) = request.params {
                let _ = self.events_tx.send(SupervisorEvent::Progress {
                    backend: self.id.clone(),
                    params,
                });
            }
        }
    }

    async fn handle_crash(self: &Arc<Self>, message: &str) {
        if self.state().await == BackendState::Stopping {
            return;
        }
        self.fail_all_pending(HubError::BackendCrashed {
            backend: self.id.clone(),
            message: message.to_string(),
        })
        .await;
        self.set_state(BackendState::Crashed).await;
        let _ = self.events_tx.send(SupervisorEvent::Crashed {
            backend: self.id.clone(),
            message: message.to_string(),
        });

        let attempt = self.restart_count.fetch_add(1, Ordering::SeqCst);
        if attempt >= self.config.timeouts.max_restarts {
            warn!(backend = %self.id, attempt, "giving up on auto-restart");
            return;
        }
        let delay = self.config.timeouts.restart_delay() * 2u32.pow(attempt.min(6));
        let backend = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = backend.events_tx.send(SupervisorEvent::AutoRestart {
                backend: backend.id.clone(),
                attempt: attempt + 1,
            });
            if let Err(e) = backend.start().await {
                error!(backend = %backend.id, error = %e, "auto-restart failed");
            }
        });
    }

    /// Periodic health probe: a lightweight `tools/list` ping. Three
    /// consecutive failures trigger the same crash/auto-restart path a
    /// transport failure would.
    async fn run_health_loop(self_arc: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if self_arc.state().await != BackendState::Running {
                        continue;
                    }
                    match self_arc.send_request("ping", None).await {
                        Ok(_) => {
                            self_arc.consecutive_health_failures.store(0, Ordering::SeqCst);
                        }
                        Err(e) => {
                            let failures = self_arc.consecutive_health_failures.fetch_add(1, Ordering::SeqCst) + 1;
                            warn!(backend = %self_arc.id, failures, error = %e, "health probe failed");
                            if failures >= self_arc.config.timeouts.max_consecutive_health_failures {
                                self_arc.handle_crash("health probe failed repeatedly").await;
                                break;
                            }
                        }
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for BackendSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSupervisor")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
