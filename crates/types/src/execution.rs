//! The execution record: one tool invocation inside a session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Cents, Versioned};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Accepted, queued behind the session's run lock.
    Pending,
    /// Subprocess spawned and not yet terminal.
    Running,
    /// Exit code 0.
    Completed,
    /// Non-zero exit, or the spawn itself failed.
    Failed,
    /// Killed at the wall-clock limit.
    Timeout,
}

impl ExecutionStatus {
    /// Terminal states are written exactly once; `Completed`, `Failed` and
    /// `Timeout` are mutually exclusive by the engine's first-writer-wins
    /// guard.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Timeout
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Record of a single tool invocation.
///
/// Created when a run is accepted.  The terminal fields (`status`,
/// `ended_at`, `exit_code`, `duration_ms`, `cost`, `error`) are filled in
/// by whichever of {normal exit, spawn error, timeout} wins the race, and
/// only by that one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub session_id: Uuid,
    pub tool_id: String,
    /// Validated input arguments as supplied (post-validation values, not
    /// the raw caller bag).
    pub args: serde_json::Value,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Captured output, truncated to the engine's buffer cap.
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    /// Wall-clock elapsed milliseconds, spawn to terminal.
    pub duration_ms: Option<u64>,
    /// Billed cost in cents.  Billed time is capped at the tool's limit so
    /// kill latency is never charged.
    pub cost: Option<Cents>,
    /// Human-readable failure detail (stderr excerpt, spawn error, or
    /// timeout description).
    pub error: Option<String>,
    #[serde(default)]
    pub version: u64,
}

impl Execution {
    pub fn new(session_id: Uuid, tool_id: String, args: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            tool_id,
            args,
            status: ExecutionStatus::Pending,
            started_at: None,
            ended_at: None,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            duration_ms: None,
            cost: None,
            error: None,
            version: 0,
        }
    }
}

impl Versioned for Execution {
    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}
