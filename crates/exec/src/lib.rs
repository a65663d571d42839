//! The execution engine: runs one whitelisted tool as an isolated,
//! time-bounded child process and reports its terminal outcome exactly
//! once.
//!
//! The engine never fails across the session boundary at run time — a
//! crashed tool, a missing binary, or a blown wall-clock limit are all
//! expected outcomes, captured as terminal `Execution` state and
//! delivered as data over the handle's completion channel.  Only
//! acceptance-time problems (empty command, a file argument escaping the
//! workspace) surface as errors, before anything has been spawned.

pub mod paths;
pub mod rlimits;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use hireling_billing::execution_cost;
use hireling_store::{modify, Store, StoreError};
use hireling_tools::{ArgValue, ResourceCaps, ToolDefinition, ValidatedArgs};
use hireling_types::{Cents, Execution, ExecutionStatus};

/// Per-stream capture ceiling.  Output beyond this is drained and
/// discarded so the child never blocks on a full pipe.
const CAPTURE_CAP: usize = 32 * 1024;

/// How long a SIGTERM'd child gets to exit before the SIGKILL follow-up.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Restricted environment for tool children: a fixed search path and
/// nothing inherited from the daemon.
const CHILD_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

// ── Acceptance-time errors ───────────────────────────────────────────────────

/// Problems detected while assembling the command, before any spawn.
#[derive(Debug, thiserror::Error)]
pub enum PrepareError {
    #[error("tool command is empty")]
    EmptyCommand,
    #[error("argument '{arg}' resolves outside the session workspace: {path}")]
    PathEscape { arg: String, path: String },
}

// ── Prepared command ─────────────────────────────────────────────────────────

/// A fully resolved invocation: program, argv, environment root, limits.
/// Produced by [`prepare`]; consumed by [`ExecutionEngine::start`].
#[derive(Debug, Clone)]
pub struct PreparedCommand {
    pub tool_id: String,
    pub program: String,
    pub argv: Vec<String>,
    pub workdir: PathBuf,
    pub max_duration: Duration,
    pub price_per_minute: Cents,
    pub caps: ResourceCaps,
    /// Validated argument values, kept for the execution record.
    pub args_json: serde_json::Value,
}

/// Resolve file-typed arguments against the workspace and build the argv
/// in the tool's declared argument order.  Unsupplied optional arguments
/// are simply omitted.
pub fn prepare(
    tool: &ToolDefinition,
    args: &ValidatedArgs,
    workdir: &Path,
) -> Result<PreparedCommand, PrepareError> {
    let mut tokens = tool.command.split_whitespace();
    let program = tokens.next().ok_or(PrepareError::EmptyCommand)?.to_string();
    let mut argv: Vec<String> = tokens.map(str::to_string).collect();

    for (name, value) in args.iter() {
        match value {
            ArgValue::FilePath(rel) => {
                let resolved = paths::resolve_in_workdir(workdir, name, rel)?;
                argv.push(resolved.display().to_string());
            }
            other => argv.push(other.render()),
        }
    }

    if tool.caps.max_cpu_percent.is_some() {
        // No portable enforcement mechanism; the cap is advisory.
        debug!(tool = %tool.id, "cpu cap is advisory and not enforced");
    }

    Ok(PreparedCommand {
        tool_id: tool.id.clone(),
        program,
        argv,
        workdir: workdir.to_path_buf(),
        max_duration: Duration::from_secs(tool.max_duration_secs),
        price_per_minute: tool.price_per_minute,
        caps: tool.caps.clone(),
        args_json: args.to_json(),
    })
}

// ── Outcome & handle ─────────────────────────────────────────────────────────

/// Terminal result delivered over the completion channel.  `billed_ms` is
/// capped at the tool's wall-clock limit so kill latency is never
/// charged; `cost` is the ceiling-rounded price of that billed time.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub execution_id: Uuid,
    pub session_id: Uuid,
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub billed_ms: u64,
    pub cost: Cents,
}

/// Returned by `start` at acceptance.  The caller resumes immediately;
/// the oneshot fires exactly once with the terminal outcome.
pub struct ExecutionHandle {
    pub execution_id: Uuid,
    pub outcome: oneshot::Receiver<ExecutionOutcome>,
}

/// Gauge snapshot for the health endpoint.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionCounts {
    pub in_flight: u64,
    pub total_started: u64,
}

// ── Engine ───────────────────────────────────────────────────────────────────

pub struct ExecutionEngine {
    executions: Arc<dyn Store<Execution>>,
    in_flight: Arc<AtomicU64>,
    total_started: AtomicU64,
}

impl ExecutionEngine {
    pub fn new(executions: Arc<dyn Store<Execution>>) -> Self {
        Self {
            executions,
            in_flight: Arc::new(AtomicU64::new(0)),
            total_started: AtomicU64::new(0),
        }
    }

    /// Accept a prepared command for execution.  Non-blocking: the
    /// execution record is created (`pending`), a worker task is spawned,
    /// and the handle is returned immediately.  The worker serializes on
    /// `run_lock` — executions within one session share a workspace and
    /// must not interleave; cross-session locks are distinct so sessions
    /// proceed concurrently.
    pub async fn start(
        &self,
        session_id: Uuid,
        prepared: PreparedCommand,
        run_lock: Arc<Mutex<()>>,
    ) -> Result<ExecutionHandle, StoreError> {
        let execution = Execution::new(session_id, prepared.tool_id.clone(), prepared.args_json.clone());
        let execution_id = execution.id;
        self.executions.create(execution_id, execution).await?;

        self.total_started.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let store = Arc::clone(&self.executions);
        let in_flight = Arc::clone(&self.in_flight);

        tokio::spawn(async move {
            let _workspace_guard = run_lock.lock().await;
            let outcome = drive(store.as_ref(), execution_id, session_id, &prepared).await;
            in_flight.fetch_sub(1, Ordering::Relaxed);
            // Receiver may have been dropped; the record is authoritative.
            let _ = outcome_tx.send(outcome);
        });

        Ok(ExecutionHandle {
            execution_id,
            outcome: outcome_rx,
        })
    }

    /// Current snapshot of an execution record.
    pub async fn observe(&self, execution_id: Uuid) -> Result<Option<Execution>, StoreError> {
        self.executions.get(execution_id).await
    }

    pub fn counts(&self) -> ExecutionCounts {
        ExecutionCounts {
            in_flight: self.in_flight.load(Ordering::Relaxed),
            total_started: self.total_started.load(Ordering::Relaxed),
        }
    }
}

// ── Worker ───────────────────────────────────────────────────────────────────

/// Run one subprocess to its terminal state and record it.
async fn drive(
    store: &dyn Store<Execution>,
    execution_id: Uuid,
    session_id: Uuid,
    prepared: &PreparedCommand,
) -> ExecutionOutcome {
    let limit_ms = prepared.max_duration.as_millis() as u64;
    let started = Instant::now();

    let mut cmd = Command::new(&prepared.program);
    cmd.args(&prepared.argv)
        .current_dir(&prepared.workdir)
        .env_clear()
        .env("PATH", CHILD_PATH)
        .env("HOME", &prepared.workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    rlimits::apply(&mut cmd, &prepared.caps);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            // Spawn failure is terminal `failed` without ever reaching
            // `running`.
            warn!(execution = %execution_id, tool = %prepared.tool_id, error = %err, "spawn failed");
            let detail = format!("failed to spawn '{}': {err}", prepared.program);
            let outcome = ExecutionOutcome {
                execution_id,
                session_id,
                status: ExecutionStatus::Failed,
                exit_code: None,
                duration_ms: 0,
                billed_ms: 0,
                cost: 0,
            };
            write_terminal(store, execution_id, &outcome, String::new(), String::new(), Some(detail)).await;
            return outcome;
        }
    };

    info!(execution = %execution_id, tool = %prepared.tool_id, "subprocess spawned");
    mark_running(store, execution_id).await;

    let stdout_task = tokio::spawn(read_capped(child.stdout.take()));
    let stderr_task = tokio::spawn(read_capped(child.stderr.take()));

    // First-writer-wins guard for the timeout/exit race.  The timeout
    // wrapper below already yields a single winner, but the flag keeps
    // the exactly-once terminal write independent of task scheduling —
    // the same guard any added cancellation path must go through.
    let terminal_claimed = AtomicBool::new(false);
    let claim = || {
        terminal_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    };

    enum RunEnd {
        Exited(std::process::ExitStatus),
        WaitFailed,
        TimedOut,
    }

    let run_end = match tokio::time::timeout(prepared.max_duration, child.wait()).await {
        Ok(status) if !claim() => {
            // The timer won the race; this side is a no-op.
            let _ = status;
            RunEnd::TimedOut
        }
        Ok(Ok(status)) => RunEnd::Exited(status),
        Ok(Err(err)) => {
            // wait() failing is effectively a lost child; treat as a
            // failed run with no exit code.
            warn!(execution = %execution_id, error = %err, "wait failed");
            RunEnd::WaitFailed
        }
        Err(_elapsed) => {
            if claim() {
                terminate(&mut child, execution_id).await;
            }
            RunEnd::TimedOut
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    let duration_ms = started.elapsed().as_millis() as u64;
    let billed_ms = duration_ms.min(limit_ms);
    let cost = execution_cost(billed_ms, prepared.price_per_minute);

    let (status, exit_code, error) = match run_end {
        RunEnd::Exited(exit) if exit.success() => (ExecutionStatus::Completed, exit.code(), None),
        RunEnd::Exited(exit) => {
            let detail = if stderr.trim().is_empty() {
                format!("exited with status {}", exit.code().map_or_else(|| "unknown".into(), |c| c.to_string()))
            } else {
                excerpt(&stderr)
            };
            (ExecutionStatus::Failed, exit.code(), Some(detail))
        }
        RunEnd::WaitFailed => (
            ExecutionStatus::Failed,
            None,
            Some("child process was lost before its exit status could be read".to_string()),
        ),
        RunEnd::TimedOut => (
            ExecutionStatus::Timeout,
            None,
            Some(format!(
                "killed after exceeding the {}s wall-clock limit",
                prepared.max_duration.as_secs()
            )),
        ),
    };

    info!(
        execution = %execution_id,
        status = %status,
        duration_ms,
        billed_ms,
        cost,
        "execution finished"
    );

    let outcome = ExecutionOutcome {
        execution_id,
        session_id,
        status,
        exit_code,
        duration_ms,
        billed_ms,
        cost,
    };
    write_terminal(store, execution_id, &outcome, stdout, stderr, error).await;
    outcome
}

/// SIGTERM, a grace window, then SIGKILL.  Unix gets the polite signal
/// first; elsewhere we go straight to the hard kill.
async fn terminate(child: &mut Child, execution_id: Uuid) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        debug!(execution = %execution_id, pid, "sending SIGTERM");
        // SAFETY: plain kill(2) on a pid we own.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
        warn!(execution = %execution_id, pid, "grace window elapsed, sending SIGKILL");
    }

    if let Err(err) = child.kill().await {
        warn!(execution = %execution_id, error = %err, "kill failed");
    }
}

/// Transition the record to `running`.  Skipped silently if the record
/// vanished (store failures at this point must not kill the worker).
async fn mark_running(store: &dyn Store<Execution>, execution_id: Uuid) {
    let result = modify::<Execution, StoreError, _>(store, execution_id, |execution| {
        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(Utc::now());
        Ok(())
    })
    .await;
    if let Err(err) = result {
        warn!(execution = %execution_id, error = %err, "failed to mark running");
    }
}

/// Write the terminal fields exactly once.  The record-level guard skips
/// the write when a terminal status is somehow already present, keeping
/// first-writer-wins even across retries.
async fn write_terminal(
    store: &dyn Store<Execution>,
    execution_id: Uuid,
    outcome: &ExecutionOutcome,
    stdout: String,
    stderr: String,
    error: Option<String>,
) {
    let result = modify::<Execution, StoreError, _>(store, execution_id, |execution| {
        if execution.status.is_terminal() {
            return Ok(());
        }
        execution.status = outcome.status;
        execution.ended_at = Some(Utc::now());
        execution.stdout = stdout.clone();
        execution.stderr = stderr.clone();
        execution.exit_code = outcome.exit_code;
        execution.duration_ms = Some(outcome.duration_ms);
        execution.cost = Some(outcome.cost);
        execution.error = error.clone();
        Ok(())
    })
    .await;
    if let Err(err) = result {
        warn!(execution = %execution_id, error = %err, "failed to write terminal state");
    }
}

/// Read a child stream into a bounded buffer.  Bytes past the cap are
/// drained and discarded so the child can always make progress.
async fn read_capped<R>(reader: Option<R>) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut chunk = vec![0u8; 8192];
    let mut collected: Vec<u8> = Vec::new();
    let mut truncated = false;
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if collected.len() < CAPTURE_CAP {
                    let take = (CAPTURE_CAP - collected.len()).min(n);
                    collected.extend_from_slice(&chunk[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
        }
    }
    let mut text = String::from_utf8_lossy(&collected).into_owned();
    if truncated {
        text.push_str("…[truncated]");
    }
    text
}

/// First line of stderr, capped, for the error detail field.
fn excerpt(stderr: &str) -> String {
    let line = stderr.trim().lines().next().unwrap_or_default();
    let mut end = line.len().min(512);
    while end > 0 && !line.is_char_boundary(end) {
        end -= 1;
    }
    line[..end].to_string()
}
