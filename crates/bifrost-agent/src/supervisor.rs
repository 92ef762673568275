// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Agent process supervision.
//!
//! Two registries keyed by channel id: oneshot runs (one fresh agent per
//! message) and persistent agents (one long-lived process serving many turns
//! over stdin).  Combined they uphold two invariants: at most one agent per
//! channel, and process close is the single cleanup point — it removes the
//! registry entry, drains the trailing partial stdout line, and resolves or
//! rejects any in-flight turn.
//!
//! Timers: the idle timer re-arms on every stdout/stderr chunk; the absolute
//! timer is a 12-hour safety net from spawn.  Both terminate with SIGTERM.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use bifrost_config::{ProcessMode, ResolvedChannelConfig};

use crate::events::{parse_stream_line, AgentResult, StreamEvent};
use crate::session::{clear_session_artifacts, session_artifact_paths_in};

/// Safety net: no agent process outlives this, ever.
pub const ABSOLUTE_TIMEOUT: Duration = Duration::from_secs(12 * 60 * 60);

/// Most-recent-prompt preview length in the process registry.
const PROMPT_PREFIX_CHARS: usize = 80;

/// Suffix appended to a oneshot prompt when image attachments are present.
const IMAGE_PROMPT_SUFFIX: &str = "\n\n[Attached image files — use your Read tool to view them]\n";

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to spawn claude: {0}")]
    SpawnFailed(String),
    #[error("Claude exited with code {code}: {stderr}")]
    AgentExit { code: i32, stderr: String },
    #[error("idle timeout: no agent output within the configured window")]
    IdleTimeout,
    #[error("absolute timeout: agent exceeded the 12h process lifetime")]
    AbsoluteTimeout,
    #[error("channel {0} already has an active agent process")]
    ChannelBusy(String),
    #[error("agent I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Snapshot of one live agent invocation, for `!ps` and kill targeting.
#[derive(Debug, Clone)]
pub struct ActiveProcess {
    pub channel_id: String,
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub prompt_prefix: String,
    pub message_count: u64,
    pub total_cost: f64,
    pub total_tokens: u64,
    /// True while a turn is in flight; oneshot runs are always active.
    pub is_active: bool,
    pub mode: ProcessMode,
}

/// One message dispatched to a fresh agent process.
#[derive(Debug, Clone)]
pub struct OneshotRequest {
    pub channel_id: String,
    pub config: ResolvedChannelConfig,
    pub prompt: String,
    pub image_paths: Vec<PathBuf>,
    /// `stream-json` output (deltas) vs plain `json` (single document).
    pub streaming: bool,
}

/// One turn fed to a long-lived agent over stdin.
#[derive(Debug, Clone)]
pub struct PersistentRequest {
    pub channel_id: String,
    pub config: ResolvedChannelConfig,
    pub prompt: String,
}

// ── Registries ────────────────────────────────────────────────────────────────

struct OneshotEntry {
    pid: Option<u32>,
    session_id: Uuid,
    started_at: DateTime<Utc>,
    prompt_prefix: String,
}

struct PersistentProc {
    channel_id: String,
    session_id: Uuid,
    started_at: DateTime<Utc>,
    pid: Mutex<Option<u32>>,
    stdin_tx: mpsc::UnboundedSender<String>,
    state: Mutex<PersistentState>,
}

#[derive(Default)]
struct PersistentState {
    current_turn: Option<Turn>,
    prompt_prefix: String,
    message_count: u64,
    total_cost: f64,
    total_tokens: u64,
}

/// Completion slot for the turn currently in flight on a persistent agent.
struct Turn {
    delta_tx: mpsc::UnboundedSender<String>,
    done_tx: Option<oneshot::Sender<Result<String, SupervisorError>>>,
    full_text: String,
}

#[derive(Default)]
struct Registries {
    oneshot: HashMap<String, OneshotEntry>,
    persistent: HashMap<String, Arc<PersistentProc>>,
}

/// Owner of all agent child processes.
pub struct ProcessSupervisor {
    binary: String,
    home_override: Option<PathBuf>,
    registries: Mutex<Registries>,
}

/// Lock that shrugs off poisoning: registry state stays usable even if a
/// panicking task died mid-update elsewhere.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn prompt_prefix(prompt: &str) -> String {
    prompt.chars().take(PROMPT_PREFIX_CHARS).collect()
}

fn signal(pid: u32, sig: libc::c_int) {
    unsafe {
        libc::kill(pid as libc::pid_t, sig);
    }
}

enum Chunk {
    Out(Vec<u8>),
    Err(Vec<u8>),
}

impl ProcessSupervisor {
    pub fn new() -> Arc<Self> {
        Self::with_options("claude", None)
    }

    /// Explicit agent binary and home directory; the latter redirects both
    /// the child's `HOME` and the session artifact lookups (used by tests
    /// and by deployments that sandbox the agent's dotfiles).
    pub fn with_options(binary: impl Into<String>, home_override: Option<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            binary: binary.into(),
            home_override,
            registries: Mutex::new(Registries::default()),
        })
    }

    fn home(&self) -> PathBuf {
        self.home_override
            .clone()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("/"))
    }

    // ── Control surface ───────────────────────────────────────────────────────

    /// Union snapshot of both registries, oldest process first.
    pub fn get_active_processes(&self) -> Vec<ActiveProcess> {
        let reg = lock(&self.registries);
        let mut out = Vec::new();
        for (channel, e) in &reg.oneshot {
            out.push(ActiveProcess {
                channel_id: channel.clone(),
                session_id: e.session_id,
                started_at: e.started_at,
                prompt_prefix: e.prompt_prefix.clone(),
                message_count: 1,
                total_cost: 0.0,
                total_tokens: 0,
                is_active: true,
                mode: ProcessMode::Oneshot,
            });
        }
        for (channel, p) in &reg.persistent {
            let st = lock(&p.state);
            out.push(ActiveProcess {
                channel_id: channel.clone(),
                session_id: p.session_id,
                started_at: p.started_at,
                prompt_prefix: st.prompt_prefix.clone(),
                message_count: st.message_count,
                total_cost: st.total_cost,
                total_tokens: st.total_tokens,
                is_active: st.current_turn.is_some(),
                mode: ProcessMode::Persistent,
            });
        }
        out.sort_by_key(|p| p.started_at);
        out
    }

    /// SIGTERM the agent in `channel_id`; returns whether one was found.
    /// Cleanup itself happens in the close handler of the owning task.
    pub fn kill_process(&self, channel_id: &str) -> bool {
        self.signal_channel(channel_id, libc::SIGTERM)
    }

    /// SIGINT the agent in `channel_id` — a prod, not a kill: timers and the
    /// registry entry are left alone and the agent may keep going.
    pub fn nudge_process(&self, channel_id: &str) -> bool {
        self.signal_channel(channel_id, libc::SIGINT)
    }

    /// SIGTERM everything; returns the affected channel ids.
    pub fn kill_all_processes(&self) -> Vec<String> {
        let reg = lock(&self.registries);
        let mut killed = Vec::new();
        for (channel, e) in &reg.oneshot {
            if let Some(pid) = e.pid {
                signal(pid, libc::SIGTERM);
                killed.push(channel.clone());
            }
        }
        for (channel, p) in &reg.persistent {
            if let Some(pid) = *lock(&p.pid) {
                signal(pid, libc::SIGTERM);
                killed.push(channel.clone());
            }
        }
        killed.sort();
        killed
    }

    fn signal_channel(&self, channel_id: &str, sig: libc::c_int) -> bool {
        let reg = lock(&self.registries);
        if let Some(pid) = reg.oneshot.get(channel_id).and_then(|e| e.pid) {
            signal(pid, sig);
            return true;
        }
        if let Some(pid) = reg.persistent.get(channel_id).and_then(|p| *lock(&p.pid)) {
            signal(pid, sig);
            return true;
        }
        false
    }

    // ── Oneshot flow ──────────────────────────────────────────────────────────

    /// Spawn a fresh agent for one message and wait for it to finish.
    ///
    /// Text deltas go out through `delta_tx` as they arrive (streaming mode
    /// only).  On a "session already in use" failure the session artifacts
    /// are cleared and the run retried exactly once with a fresh
    /// `--session-id`.
    pub async fn run_oneshot(
        self: &Arc<Self>,
        req: OneshotRequest,
        delta_tx: mpsc::UnboundedSender<String>,
    ) -> Result<AgentResult, SupervisorError> {
        let session_id = crate::derive_session_id(&req.channel_id, &req.config.folder);

        {
            let mut reg = lock(&self.registries);
            if reg.oneshot.contains_key(&req.channel_id)
                || reg.persistent.contains_key(&req.channel_id)
            {
                return Err(SupervisorError::ChannelBusy(req.channel_id));
            }
            reg.oneshot.insert(
                req.channel_id.clone(),
                OneshotEntry {
                    pid: None,
                    session_id,
                    started_at: Utc::now(),
                    prompt_prefix: prompt_prefix(&req.prompt),
                },
            );
        }

        let mut result = self
            .oneshot_attempt(&req, session_id, false, &delta_tx)
            .await;

        // The agent refuses a --resume of a session another process holds.
        // Clearing the artifacts and starting over with --session-id is the
        // documented recovery; one retry only.
        if let Err(SupervisorError::AgentExit { ref stderr, .. }) = result {
            if stderr.contains("already in use") {
                warn!(channel = %req.channel_id, "session in use; clearing artifacts and retrying");
                clear_session_artifacts(&self.home(), &session_id, &req.config.folder).await;
                result = self.oneshot_attempt(&req, session_id, true, &delta_tx).await;
            }
        }

        lock(&self.registries).oneshot.remove(&req.channel_id);
        result
    }

    async fn oneshot_attempt(
        self: &Arc<Self>,
        req: &OneshotRequest,
        session_id: Uuid,
        force_new_session: bool,
        delta_tx: &mpsc::UnboundedSender<String>,
    ) -> Result<AgentResult, SupervisorError> {
        let mut prompt = req.prompt.clone();
        if !req.image_paths.is_empty() {
            prompt.push_str(IMAGE_PROMPT_SUFFIX);
            let joined: Vec<String> = req
                .image_paths
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            prompt.push_str(&joined.join("\n"));
        }

        let mut cmd = self.agent_command(
            &req.config,
            session_id,
            false,
            req.streaming,
            force_new_session,
            Some(&prompt),
        );
        let (mut child, mut chunk_rx) = spawn_with_io(&mut cmd)?;
        {
            let mut reg = lock(&self.registries);
            if let Some(e) = reg.oneshot.get_mut(&req.channel_id) {
                e.pid = child.id();
            }
        }
        info!(channel = %req.channel_id, session = %session_id, "oneshot agent spawned");

        let idle = Duration::from_millis(req.config.timeout_ms);
        let mut line_buf = String::new();
        let mut raw_stdout = String::new();
        let mut stderr_buf = String::new();
        let mut full_text = String::new();
        let mut final_result: Option<AgentResult> = None;
        let mut timeout_err: Option<SupervisorError> = None;

        let absolute = tokio::time::sleep(ABSOLUTE_TIMEOUT);
        tokio::pin!(absolute);

        loop {
            tokio::select! {
                maybe = chunk_rx.recv() => match maybe {
                    Some(Chunk::Out(bytes)) => {
                        let s = String::from_utf8_lossy(&bytes);
                        raw_stdout.push_str(&s);
                        if req.streaming {
                            line_buf.push_str(&s);
                            while let Some(i) = line_buf.find('\n') {
                                let line: String = line_buf.drain(..=i).collect();
                                handle_oneshot_line(&line, &mut full_text, &mut final_result, delta_tx);
                            }
                        }
                    }
                    Some(Chunk::Err(bytes)) => {
                        stderr_buf.push_str(&String::from_utf8_lossy(&bytes));
                    }
                    None => break,
                },
                _ = &mut absolute, if timeout_err.is_none() => {
                    timeout_err = Some(SupervisorError::AbsoluteTimeout);
                    terminate(&child);
                }
                _ = tokio::time::sleep(idle), if timeout_err.is_none() => {
                    timeout_err = Some(SupervisorError::IdleTimeout);
                    terminate(&child);
                }
            }
        }

        // Trailing partial line, if the stream ended without a newline.
        if req.streaming {
            handle_oneshot_line(&line_buf, &mut full_text, &mut final_result, delta_tx);
        }

        let status = child.wait().await?;
        if let Some(e) = timeout_err {
            return Err(e);
        }
        if !status.success() {
            return Err(SupervisorError::AgentExit {
                code: status.code().unwrap_or(-1),
                stderr: stderr_buf.trim().to_string(),
            });
        }

        if req.streaming {
            Ok(final_result.unwrap_or(AgentResult {
                text: full_text,
                session_id: None,
                cost: None,
                tokens: None,
            }))
        } else {
            Ok(parse_batch_output(&raw_stdout))
        }
    }

    // ── Persistent flow ───────────────────────────────────────────────────────

    /// Run one turn on the channel's long-lived agent, spawning it first if
    /// none is running.  Resolves with the turn's final text.
    pub async fn run_persistent_turn(
        self: &Arc<Self>,
        req: PersistentRequest,
        delta_tx: mpsc::UnboundedSender<String>,
    ) -> Result<String, SupervisorError> {
        let entry = {
            let mut reg = lock(&self.registries);
            if reg.oneshot.contains_key(&req.channel_id) {
                return Err(SupervisorError::ChannelBusy(req.channel_id));
            }
            let alive = reg
                .persistent
                .get(&req.channel_id)
                .filter(|p| lock(&p.pid).is_some())
                .cloned();
            match alive {
                Some(p) => p,
                None => {
                    // Dead or absent: respawn transparently for this turn.
                    reg.persistent.remove(&req.channel_id);
                    let p = self.spawn_persistent(&req)?;
                    reg.persistent.insert(req.channel_id.clone(), p.clone());
                    p
                }
            }
        };

        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut st = lock(&entry.state);
            if st.current_turn.is_some() {
                return Err(SupervisorError::ChannelBusy(req.channel_id));
            }
            st.current_turn = Some(Turn {
                delta_tx,
                done_tx: Some(done_tx),
                full_text: String::new(),
            });
            st.prompt_prefix = prompt_prefix(&req.prompt);
        }

        let line = serde_json::json!({
            "type": "user",
            "message": { "role": "user", "content": req.prompt },
        })
        .to_string();
        if entry.stdin_tx.send(line).is_err() {
            // The writer is gone: the process died between lookup and send.
            // Complete the turn ourselves — nobody else will.
            lock(&entry.state).current_turn = None;
            lock(&self.registries).persistent.remove(&req.channel_id);
            return Err(SupervisorError::SpawnFailed("agent stdin closed".into()));
        }

        done_rx.await.unwrap_or(Err(SupervisorError::AgentExit {
            code: -1,
            stderr: "agent terminated without completing the turn".into(),
        }))
    }

    fn spawn_persistent(
        self: &Arc<Self>,
        req: &PersistentRequest,
    ) -> Result<Arc<PersistentProc>, SupervisorError> {
        let session_id = crate::derive_session_id(&req.channel_id, &req.config.folder);
        let mut cmd = self.agent_command(&req.config, session_id, true, true, false, None);
        let (mut child, chunk_rx) = spawn_with_io(&mut cmd)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SupervisorError::SpawnFailed("agent stdin unavailable".into()))?;
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(stdin_writer(stdin, stdin_rx));

        let entry = Arc::new(PersistentProc {
            channel_id: req.channel_id.clone(),
            session_id,
            started_at: Utc::now(),
            pid: Mutex::new(child.id()),
            stdin_tx,
            state: Mutex::new(PersistentState::default()),
        });
        info!(channel = %req.channel_id, session = %session_id, "persistent agent spawned");

        tokio::spawn(persistent_read_loop(
            self.clone(),
            entry.clone(),
            child,
            chunk_rx,
            Duration::from_millis(req.config.timeout_ms),
        ));

        Ok(entry)
    }

    // ── Spawning ──────────────────────────────────────────────────────────────

    /// Assemble the agent command line.
    ///
    /// Flag order follows the agent's CLI contract; the prompt is always the
    /// final argument (oneshot only — persistent turns arrive over stdin).
    fn agent_command(
        &self,
        config: &ResolvedChannelConfig,
        session_id: Uuid,
        persistent: bool,
        streaming: bool,
        force_new_session: bool,
        prompt: Option<&str>,
    ) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-p");
        cmd.args(["--output-format", if streaming { "stream-json" } else { "json" }]);
        if streaming {
            cmd.args(["--verbose", "--include-partial-messages"]);
        }
        if persistent {
            cmd.args(["--input-format", "stream-json", "--replay-user-messages"]);
        }
        cmd.args(["--model", &config.model]);

        let artifacts = session_artifact_paths_in(&self.home(), &session_id, &config.folder);
        if !force_new_session && artifacts.log_file.exists() {
            cmd.args(["--resume", &session_id.to_string()]);
        } else {
            cmd.args(["--session-id", &session_id.to_string()]);
        }

        cmd.args(["--append-system-prompt", &config.system_prompt]);
        cmd.arg("--dangerously-skip-permissions");

        // An mcp.json next to the gateway itself configures extra tool
        // servers for every channel.
        if let Ok(cwd) = std::env::current_dir() {
            let mcp = cwd.join("mcp.json");
            if mcp.is_file() {
                cmd.arg("--mcp-config").arg(mcp);
            }
        }

        if let Some(p) = prompt {
            cmd.arg(p);
        }

        cmd.current_dir(&config.folder);
        // The agent refuses to run when it believes it is nested inside
        // another agent invocation.
        cmd.env_remove("CLAUDECODE");
        if let Some(home) = &self.home_override {
            cmd.env("HOME", home);
        } else if std::env::var_os("HOME").is_none() {
            if let Ok(user) = std::env::var("USER") {
                let home = if cfg!(target_os = "macos") {
                    format!("/Users/{user}")
                } else {
                    format!("/home/{user}")
                };
                cmd.env("HOME", home);
            }
        }

        cmd.stdin(if persistent { Stdio::piped() } else { Stdio::null() });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }
}

/// Spawn the child and wire its stdout/stderr into a single chunk channel.
fn spawn_with_io(cmd: &mut Command) -> Result<(Child, mpsc::Receiver<Chunk>), SupervisorError> {
    let mut child = cmd
        .spawn()
        .map_err(|e| SupervisorError::SpawnFailed(e.to_string()))?;
    let (tx, rx) = mpsc::channel::<Chunk>(64);

    if let Some(mut stdout) = child.stdout.take() {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 8192];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(Chunk::Out(buf[..n].to_vec())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }
    if let Some(mut stderr) = child.stderr.take() {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 8192];
            loop {
                match stderr.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(Chunk::Err(buf[..n].to_vec())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }
    drop(tx);
    Ok((child, rx))
}

async fn stdin_writer(
    mut stdin: tokio::process::ChildStdin,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    while let Some(line) = rx.recv().await {
        if stdin.write_all(line.as_bytes()).await.is_err() {
            break;
        }
        if stdin.write_all(b"\n").await.is_err() {
            break;
        }
        let _ = stdin.flush().await;
    }
}

fn terminate(child: &Child) {
    if let Some(pid) = child.id() {
        signal(pid, libc::SIGTERM);
    }
}

fn handle_oneshot_line(
    line: &str,
    full_text: &mut String,
    final_result: &mut Option<AgentResult>,
    delta_tx: &mpsc::UnboundedSender<String>,
) {
    match parse_stream_line(line) {
        Some(StreamEvent::TextDelta { text }) => {
            full_text.push_str(&text);
            let _ = delta_tx.send(text);
        }
        Some(StreamEvent::Result(r)) => *final_result = Some(r),
        Some(StreamEvent::UserReceipt) | None => {}
    }
}

/// Batch (`--output-format json`) runs emit one JSON document on stdout.
fn parse_batch_output(stdout: &str) -> AgentResult {
    match serde_json::from_str::<serde_json::Value>(stdout.trim()) {
        Ok(v) => AgentResult {
            text: v
                .get("result")
                .and_then(|r| r.as_str())
                .unwrap_or_else(|| stdout.trim())
                .to_string(),
            session_id: v
                .get("session_id")
                .and_then(|s| s.as_str())
                .map(str::to_string),
            cost: v
                .get("cost_usd")
                .and_then(|c| c.as_f64())
                .or_else(|| v.get("total_cost_usd").and_then(|c| c.as_f64())),
            tokens: v.get("usage").map(|u| {
                u.get("input_tokens").and_then(|t| t.as_u64()).unwrap_or(0)
                    + u.get("output_tokens").and_then(|t| t.as_u64()).unwrap_or(0)
            }),
        },
        Err(_) => AgentResult {
            text: stdout.trim().to_string(),
            session_id: None,
            cost: None,
            tokens: None,
        },
    }
}

/// Per-process read loop for a persistent agent.  Owns the child handle,
/// the line buffer and both timers; on close it removes the registry entry
/// and settles any pending turn — nobody else cleans up.
async fn persistent_read_loop(
    supervisor: Arc<ProcessSupervisor>,
    entry: Arc<PersistentProc>,
    mut child: Child,
    mut chunk_rx: mpsc::Receiver<Chunk>,
    idle: Duration,
) {
    let mut line_buf = String::new();
    let mut stderr_buf = String::new();
    let mut timeout_err: Option<SupervisorError> = None;

    let absolute = tokio::time::sleep(ABSOLUTE_TIMEOUT);
    tokio::pin!(absolute);

    loop {
        tokio::select! {
            maybe = chunk_rx.recv() => match maybe {
                Some(Chunk::Out(bytes)) => {
                    line_buf.push_str(&String::from_utf8_lossy(&bytes));
                    while let Some(i) = line_buf.find('\n') {
                        let line: String = line_buf.drain(..=i).collect();
                        handle_persistent_line(&entry, &line);
                    }
                }
                Some(Chunk::Err(bytes)) => {
                    stderr_buf.push_str(&String::from_utf8_lossy(&bytes));
                }
                None => break,
            },
            _ = &mut absolute, if timeout_err.is_none() => {
                warn!(channel = %entry.channel_id, "persistent agent hit absolute timeout");
                timeout_err = Some(SupervisorError::AbsoluteTimeout);
                terminate(&child);
            }
            _ = tokio::time::sleep(idle), if timeout_err.is_none() => {
                info!(channel = %entry.channel_id, "persistent agent idle timeout");
                timeout_err = Some(SupervisorError::IdleTimeout);
                terminate(&child);
            }
        }
    }
    handle_persistent_line(&entry, &line_buf);

    let status = child.wait().await;
    debug!(channel = %entry.channel_id, ?status, "persistent agent closed");

    // Single cleanup point.
    lock(&supervisor.registries)
        .persistent
        .remove(&entry.channel_id);
    *lock(&entry.pid) = None;

    let pending = lock(&entry.state).current_turn.take();
    if let Some(mut turn) = pending {
        let outcome = if let Some(e) = timeout_err {
            Err(e)
        } else {
            match status {
                Ok(s) if s.success() => Ok(std::mem::take(&mut turn.full_text)),
                Ok(s) => Err(SupervisorError::AgentExit {
                    code: s.code().unwrap_or(-1),
                    stderr: stderr_buf.trim().to_string(),
                }),
                Err(e) => Err(SupervisorError::Io(e)),
            }
        };
        if let Some(tx) = turn.done_tx.take() {
            let _ = tx.send(outcome);
        }
    }
}

fn handle_persistent_line(entry: &PersistentProc, line: &str) {
    match parse_stream_line(line) {
        Some(StreamEvent::TextDelta { text }) => {
            let mut st = lock(&entry.state);
            if let Some(turn) = st.current_turn.as_mut() {
                turn.full_text.push_str(&text);
                let _ = turn.delta_tx.send(text);
            }
        }
        Some(StreamEvent::Result(r)) => {
            let mut st = lock(&entry.state);
            st.message_count += 1;
            if let Some(c) = r.cost {
                st.total_cost += c;
            }
            if let Some(t) = r.tokens {
                st.total_tokens += t;
            }
            if let Some(mut turn) = st.current_turn.take() {
                let text = if r.text.is_empty() {
                    std::mem::take(&mut turn.full_text)
                } else {
                    r.text
                };
                if let Some(tx) = turn.done_tx.take() {
                    let _ = tx.send(Ok(text));
                }
            }
        }
        Some(StreamEvent::UserReceipt) => {
            debug!(channel = %entry.channel_id, "agent acknowledged stdin turn");
        }
        None => {}
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
