//! `local`/`package` backend transport: a child process speaking
//! line-delimited JSON-RPC over its stdin/stdout.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::debug;

use crate::jsonrpc::{JsonRpcMessage, JsonRpcRequest};
use crate::models::ProcessLaunch;

use super::{BackendTransport, TransportFailure};

/// Substrings a package runner's stderr prints while resolving and
/// installing a package for the first time (e.g. `npx`'s "installing" and
/// `npm`'s post-install "audited N packages"). Seeing either marks the
/// first-run install phase as detected, so the supervisor knows the long
/// install timeout was warranted rather than wasted on a cache hit.
const INSTALL_PATTERNS: [&str; 2] = ["installing", "audited"];

/// Process-backed transport. `open` spawns the process; `send`/`recv`
/// write/read one newline-delimited JSON line at a time. stderr is piped
/// and drained on a background task as a best-effort diagnostic channel —
/// never parsed as protocol, only logged and scanned for the package
/// install-phase pattern.
pub struct PipeTransport {
    label: String,
    launch: ProcessLaunch,
    child: Option<Child>,
    stdin: Option<BufWriter<ChildStdin>>,
    stdout: Option<BufReader<ChildStdout>>,
    stderr_task: Option<tokio::task::JoinHandle<()>>,
    saw_install_pattern: Arc<AtomicBool>,
}

impl PipeTransport {
    #[must_use]
    pub fn new(label: impl Into<String>, launch: ProcessLaunch) -> Self {
        Self {
            label: label.into(),
            launch,
            child: None,
            stdin: None,
            stdout: None,
            stderr_task: None,
            saw_install_pattern: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The child's exit status, if it has already exited. Used by the
    /// supervisor's reaper task to distinguish a clean stop from a crash.
    pub fn try_wait(&mut self) -> std::io::Result<Option<std::process::ExitStatus>> {
        self.child.as_mut().map_or(Ok(None), Child::try_wait)
    }

    fn spawn_stderr_drain(&mut self, stderr: ChildStderr) {
        let label = self.label.clone();
        let flag = Arc::clone(&self.saw_install_pattern);
        self.stderr_task = Some(tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(backend = %label, "stderr: {line}");
                let lower = line.to_ascii_lowercase();
                if INSTALL_PATTERNS.iter().any(|p| lower.contains(p)) {
                    flag.store(true, Ordering::SeqCst);
                }
            }
        }));
    }
}

#[async_trait]
impl BackendTransport for PipeTransport {
    async fn open(&mut self) -> Result<(), TransportFailure> {
        let mut command = Command::new(&self.launch.command);
        command
            .args(&self.launch.args)
            .envs(&self.launch.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.launch.cwd {
            command.current_dir(cwd);
        }

        let mut child = command
            .spawn()
            .map_err(|e| TransportFailure::SpawnFailed(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportFailure::SpawnFailed("no stdin handle".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportFailure::SpawnFailed("no stdout handle".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransportFailure::SpawnFailed("no stderr handle".to_string()))?;

        self.stdin = Some(BufWriter::new(stdin));
        self.stdout = Some(BufReader::new(stdout));
        self.spawn_stderr_drain(stderr);
        self.child = Some(child);
        Ok(())
    }

    async fn send(&mut self, request: &JsonRpcRequest) -> Result<(), TransportFailure> {
        let stdin = self.stdin.as_mut().ok_or(TransportFailure::WriteAfterClose)?;
        let mut line = serde_json::to_string(request)
            .map_err(|e| TransportFailure::ProtocolParseError(e.to_string()))?;
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(TransportFailure::Io)?;
        stdin.flush().await.map_err(TransportFailure::Io)?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<JsonRpcMessage>, TransportFailure> {
        let stdout = match self.stdout.as_mut() {
            Some(stdout) => stdout,
            None => return Ok(None),
        };
        loop {
            let mut line = String::new();
            let n = stdout.read_line(&mut line).await.map_err(TransportFailure::Io)?;
            if n == 0 {
                return Ok(None);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return JsonRpcMessage::parse_line(trimmed)
                .map(Some)
                .map_err(|e| TransportFailure::ProtocolParseError(e.to_string()));
        }
    }

    async fn close(&mut self) -> Result<(), TransportFailure> {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.flush().await;
        }
        self.stdout = None;
        if let Some(handle) = self.stderr_task.take() {
            handle.abort();
        }
        if let Some(mut child) = self.child.take() {
            let _ = child.kill().await;
        }
        Ok(())
    }

    fn saw_install_pattern(&self) -> bool {
        self.saw_install_pattern.load(Ordering::SeqCst)
    }
}
