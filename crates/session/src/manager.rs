//! Session orchestration: lifecycle transitions, execute dispatch, and
//! settlement handoff.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{error, info, warn};
use uuid::Uuid;

use hireling_billing::{execution_cost, meter, SettlementEngine, SettlementError, SplitBreakdown};
use hireling_exec::{prepare, ExecutionEngine, ExecutionOutcome};
use hireling_store::{modify, Store};
use hireling_tools::ToolRegistry;
use hireling_types::{Cents, Execution, ExecutionStatus, Session, SessionStatus, Settlement};

use crate::SessionError;

/// Acceptance acknowledgment for an execute request.  The caller resumed
/// as soon as the execution was accepted; `completion` fires once the
/// terminal outcome has been debited, for callers that prefer awaiting
/// over polling.
#[derive(Debug)]
pub struct ExecuteReceipt {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    /// Budget spendable after the worst-case reservation for this
    /// execution.
    pub remaining_budget: Cents,
    /// Worst-case cost reserved at acceptance (full wall-clock limit at
    /// the tool's rate).
    pub projected_cost: Cents,
    pub completion: oneshot::Receiver<ExecutionOutcome>,
}

pub struct SessionManager {
    sessions: Arc<dyn Store<Session>>,
    executions: Arc<dyn Store<Execution>>,
    registry: Arc<ToolRegistry>,
    engine: Arc<ExecutionEngine>,
    settlements: SettlementEngine,
    provider_id: String,
    workspace_root: PathBuf,
    /// One lock per session: executions sharing a workspace must not
    /// interleave.  Entries are dropped at workspace cleanup.
    run_locks: StdMutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
    /// Sessions between creation and `end` — the provider's busy gauge.
    active_sessions: AtomicU64,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sessions: Arc<dyn Store<Session>>,
        executions: Arc<dyn Store<Execution>>,
        registry: Arc<ToolRegistry>,
        engine: Arc<ExecutionEngine>,
        settlements: SettlementEngine,
        provider_id: String,
        workspace_root: PathBuf,
    ) -> Self {
        Self {
            sessions,
            executions,
            registry,
            engine,
            settlements,
            provider_id,
            workspace_root,
            run_locks: StdMutex::new(HashMap::new()),
            active_sessions: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    /// Sessions currently holding a provider slot (created, not yet
    /// ended).
    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    // ── Lifecycle ──────────────────────────────────────────────────────────

    /// Create a `pending` session with its budget fixed for life.
    pub async fn create_session(
        &self,
        agent_id: &str,
        budget_allowance: Cents,
    ) -> Result<Session, SessionError> {
        if agent_id.trim().is_empty() {
            return Err(SessionError::Invalid("agent_id must not be empty".into()));
        }
        if budget_allowance == 0 {
            return Err(SessionError::Invalid(
                "budget_allowance must be greater than zero".into(),
            ));
        }

        let session = Session::new(
            agent_id.to_string(),
            self.provider_id.clone(),
            budget_allowance,
        );
        self.sessions.create(session.id, session.clone()).await?;
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        info!(session = %session.id, agent = %session.agent_id, budget = budget_allowance, "session created");
        Ok(session)
    }

    /// `pending → active`.
    pub async fn start_session(&self, session_id: Uuid) -> Result<Session, SessionError> {
        let session = modify(self.sessions.as_ref(), session_id, |s: &mut Session| {
            if !s.status.may_become(SessionStatus::Active) {
                return Err(SessionError::State {
                    action: "start",
                    status: s.status,
                });
            }
            s.status = SessionStatus::Active;
            Ok(())
        })
        .await?;
        info!(session = %session_id, "session started");
        Ok(session)
    }

    /// `active → completed`: freeze the totals and release the provider
    /// slot.  Refused while executions are still in flight so the frozen
    /// numbers are unambiguous.
    pub async fn end_session(
        &self,
        session_id: Uuid,
    ) -> Result<(Session, SplitBreakdown), SessionError> {
        let session = modify(self.sessions.as_ref(), session_id, |s: &mut Session| {
            if !s.status.may_become(SessionStatus::Completed) {
                return Err(SessionError::State {
                    action: "end",
                    status: s.status,
                });
            }
            if s.reserved > 0 {
                return Err(SessionError::ExecutionsInFlight);
            }
            s.status = SessionStatus::Completed;
            s.ended_at = Some(Utc::now());
            Ok(())
        })
        .await?;

        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
        let preview = self.settlements.preview(session.consumed);
        info!(
            session = %session_id,
            consumed = session.consumed,
            effective_ms = session.effective_ms,
            "session completed"
        );
        Ok((session, preview))
    }

    /// `completed → settled`, exactly once.  Creates the settlement
    /// record first — its uniqueness constraint is the guard that makes a
    /// concurrent double-settle lose with `AlreadySettled`.
    pub async fn settle_session(&self, session_id: Uuid) -> Result<Settlement, SessionError> {
        let session = self.require_session(session_id).await?;
        match session.status {
            SessionStatus::Completed => {}
            SessionStatus::Settled => {
                return Err(SessionError::Settlement(SettlementError::AlreadySettled(
                    session_id,
                )));
            }
            other => {
                return Err(SessionError::State {
                    action: "settle",
                    status: other,
                });
            }
        }

        let settlement = self.settlements.settle(&session)?;

        modify::<Session, SessionError, _>(self.sessions.as_ref(), session_id, |s| {
            if s.status == SessionStatus::Settled {
                return Ok(());
            }
            s.status = SessionStatus::Settled;
            s.settled_at = Some(settlement.settled_at);
            Ok(())
        })
        .await?;

        info!(
            session = %session_id,
            total = settlement.total_amount,
            provider = settlement.provider_payout,
            platform = settlement.platform_fee,
            reserve = settlement.reserve_amount,
            "session settled"
        );
        Ok(settlement)
    }

    // ── Execute ────────────────────────────────────────────────────────────

    /// Run a whitelisted tool inside the session.
    ///
    /// The caller suspends only until acceptance.  Ordering matters here:
    /// lookup and validation first (cost-free rejections), then the
    /// worst-case reservation inside the session CAS (the pre-flight
    /// budget gate — on failure no process was or will be spawned), and
    /// only then the engine dispatch.  The terminal outcome is debited by
    /// a commit task exactly once.
    pub async fn execute(
        &self,
        session_id: Uuid,
        tool_id: &str,
        args: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<ExecuteReceipt, SessionError> {
        let tool = self
            .registry
            .lookup(tool_id)
            .ok_or_else(|| SessionError::UnknownTool(tool_id.to_string()))?;
        let validated = self.registry.validate_args(tool, args)?;

        let workdir = self.workspace_root.join(session_id.to_string());
        let prepared = prepare(tool, &validated, &workdir)?;
        let projected = execution_cost(tool.max_duration_ms(), tool.price_per_minute);

        let session = modify(self.sessions.as_ref(), session_id, |s: &mut Session| {
            if s.status != SessionStatus::Active {
                return Err(SessionError::State {
                    action: "execute in",
                    status: s.status,
                });
            }
            meter::reserve(s, projected)?;
            Ok(())
        })
        .await?;

        // Workspace is created on first use and kept until cleanup.  A
        // failure from here to dispatch must hand the reservation back.
        if let Err(err) = tokio::fs::create_dir_all(&workdir).await {
            self.release_reservation(session_id, projected).await;
            return Err(err.into());
        }

        let handle = match self
            .engine
            .start(session_id, prepared, self.run_lock(session_id))
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                self.release_reservation(session_id, projected).await;
                return Err(err.into());
            }
        };
        let execution_id = handle.execution_id;

        let (done_tx, done_rx) = oneshot::channel();
        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            match handle.outcome.await {
                Ok(outcome) => {
                    let debit = modify::<Session, SessionError, _>(
                        sessions.as_ref(),
                        session_id,
                        |s| {
                            meter::commit(s, projected, outcome.cost, outcome.billed_ms)?;
                            Ok(())
                        },
                    )
                    .await;
                    if let Err(err) = debit {
                        error!(session = %session_id, execution = %execution_id, error = %err, "debit commit failed");
                    }
                    let _ = done_tx.send(outcome);
                }
                Err(_) => {
                    // Worker vanished without an outcome; hand the
                    // reservation back so the budget is not leaked.
                    warn!(session = %session_id, execution = %execution_id, "execution worker dropped without outcome");
                    let released = modify::<Session, SessionError, _>(
                        sessions.as_ref(),
                        session_id,
                        |s| {
                            meter::release(s, projected)?;
                            Ok(())
                        },
                    )
                    .await;
                    if let Err(err) = released {
                        error!(session = %session_id, error = %err, "reservation release failed");
                    }
                }
            }
        });

        Ok(ExecuteReceipt {
            execution_id,
            status: ExecutionStatus::Pending,
            remaining_budget: session.remaining_budget(),
            projected_cost: projected,
            completion: done_rx,
        })
    }

    // ── Inspection ─────────────────────────────────────────────────────────

    pub async fn get_session(
        &self,
        session_id: Uuid,
    ) -> Result<(Session, Vec<Execution>), SessionError> {
        let session = self.require_session(session_id).await?;
        let mut executions: Vec<Execution> = self
            .executions
            .list()
            .await?
            .into_iter()
            .filter(|e| e.session_id == session_id)
            .collect();
        executions.sort_by_key(|e| e.started_at);
        Ok((session, executions))
    }

    pub async fn observe_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<Execution>, SessionError> {
        Ok(self.engine.observe(execution_id).await?)
    }

    pub fn settlement_for(&self, session_id: Uuid) -> Option<Settlement> {
        self.settlements.get_by_session(session_id)
    }

    // ── Teardown ───────────────────────────────────────────────────────────

    /// Delete the session's workspace directory.  Legal once the session
    /// is `completed` or later; idempotent, safe to call repeatedly.
    pub async fn cleanup_workspace(&self, session_id: Uuid) -> Result<(), SessionError> {
        let session = self.require_session(session_id).await?;
        if !session.status.is_over() {
            return Err(SessionError::State {
                action: "clean the workspace of",
                status: session.status,
            });
        }

        let workdir = self.workspace_root.join(session_id.to_string());
        match tokio::fs::remove_dir_all(&workdir).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let mut locks = self.run_locks.lock().expect("run lock table poisoned");
        locks.remove(&session_id);
        Ok(())
    }

    // ── Internals ──────────────────────────────────────────────────────────

    /// Best-effort reservation rollback for dispatch paths that failed
    /// after reserving.  Failures are logged, not propagated — the caller
    /// already has a more useful error in hand.
    async fn release_reservation(&self, session_id: Uuid, projected: Cents) {
        let released =
            modify::<Session, SessionError, _>(self.sessions.as_ref(), session_id, |s| {
                meter::release(s, projected)?;
                Ok(())
            })
            .await;
        if let Err(err) = released {
            error!(session = %session_id, error = %err, "reservation rollback failed");
        }
    }

    async fn require_session(&self, session_id: Uuid) -> Result<Session, SessionError> {
        self.sessions
            .get(session_id)
            .await?
            .ok_or(SessionError::NotFound(session_id))
    }

    fn run_lock(&self, session_id: Uuid) -> Arc<AsyncMutex<()>> {
        let mut locks = self.run_locks.lock().expect("run lock table poisoned");
        Arc::clone(locks.entry(session_id).or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hireling_billing::{MemSettlementStore, SplitPolicy};
    use hireling_store::MemStore;
    use hireling_tools::{ArgSpec, ArgType, ResourceCaps, ToolDefinition};
    use serde_json::json;

    fn tool(id: &str, command: &str, args: Vec<ArgSpec>, max_secs: u64, price: Cents) -> ToolDefinition {
        ToolDefinition {
            id: id.into(),
            name: id.into(),
            command: command.into(),
            args,
            max_duration_secs: max_secs,
            price_per_minute: price,
            caps: ResourceCaps::default(),
        }
    }

    fn default_tools() -> Vec<ToolDefinition> {
        vec![
            // Worst case 1s at 60¢/min → 1¢ projected.
            tool(
                "sh",
                "sh -c",
                vec![ArgSpec::required("script", ArgType::String)],
                1,
                60,
            ),
            // Worst case 1s limit at 60¢/min → projected 1¢.
            tool(
                "sleep",
                "sleep",
                vec![ArgSpec::required("seconds", ArgType::Number)],
                1,
                60,
            ),
            // Worst case 60s at $6.00/min → projected 600¢: too rich for a
            // small budget before anything spawns.
            tool(
                "pricey",
                "true",
                vec![],
                60,
                600,
            ),
        ]
    }

    struct Fixture {
        manager: SessionManager,
        _workspace: tempfile::TempDir,
    }

    fn fixture_with(tools: Vec<ToolDefinition>) -> Fixture {
        let workspace = tempfile::tempdir().unwrap();
        let executions: Arc<dyn Store<Execution>> = Arc::new(MemStore::new());
        let manager = SessionManager::new(
            Arc::new(MemStore::new()),
            Arc::clone(&executions),
            Arc::new(ToolRegistry::new(tools).unwrap()),
            Arc::new(ExecutionEngine::new(executions)),
            SettlementEngine::new(Arc::new(MemSettlementStore::new()), SplitPolicy::default())
                .unwrap(),
            "provider-test".into(),
            workspace.path().to_path_buf(),
        );
        Fixture {
            manager,
            _workspace: workspace,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(default_tools())
    }

    async fn active_session(manager: &SessionManager, budget: Cents) -> Session {
        let session = manager.create_session("agent-1", budget).await.unwrap();
        manager.start_session(session.id).await.unwrap()
    }

    fn args(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        value.as_object().unwrap().clone()
    }

    // ── lifecycle ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn create_start_end_settle_happy_path() {
        let f = fixture();
        let session = f.manager.create_session("agent-1", 1_000).await.unwrap();
        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(f.manager.active_sessions(), 1);

        let session = f.manager.start_session(session.id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Active);

        let (session, preview) = f.manager.end_session(session.id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(session.ended_at.is_some());
        assert_eq!(preview.total_amount, 0);
        assert_eq!(f.manager.active_sessions(), 0);

        let settlement = f.manager.settle_session(session.id).await.unwrap();
        assert_eq!(settlement.total_amount, 0);
        let (session, _) = f.manager.get_session(session.id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Settled);
        assert!(session.settled_at.is_some());
    }

    #[tokio::test]
    async fn create_rejects_empty_agent_and_zero_budget() {
        let f = fixture();
        assert!(matches!(
            f.manager.create_session("  ", 100).await,
            Err(SessionError::Invalid(_))
        ));
        assert!(matches!(
            f.manager.create_session("agent", 0).await,
            Err(SessionError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn end_on_pending_session_is_a_state_error() {
        let f = fixture();
        let session = f.manager.create_session("agent-1", 1_000).await.unwrap();

        let err = f.manager.end_session(session.id).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::State { status: SessionStatus::Pending, .. }
        ));

        // No mutation happened.
        let (session, _) = f.manager.get_session(session.id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Pending);
    }

    #[tokio::test]
    async fn double_start_is_a_state_error() {
        let f = fixture();
        let session = active_session(&f.manager, 1_000).await;
        let err = f.manager.start_session(session.id).await.unwrap_err();
        assert!(matches!(err, SessionError::State { .. }));
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let f = fixture();
        assert!(matches!(
            f.manager.start_session(Uuid::new_v4()).await,
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            f.manager.get_session(Uuid::new_v4()).await,
            Err(SessionError::NotFound(_))
        ));
    }

    // ── execute ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn execute_debits_actual_cost_and_tracks_effective_time() {
        let f = fixture();
        let session = active_session(&f.manager, 1_000).await;

        let receipt = f
            .manager
            .execute(session.id, "sh", &args(json!({"script": "echo done"})))
            .await
            .unwrap();
        // Acceptance: worst case (1¢) reserved, 999 spendable.
        assert_eq!(receipt.projected_cost, 1);
        assert_eq!(receipt.remaining_budget, 999);

        let outcome = receipt.completion.await.unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Completed);

        let (session, executions) = f.manager.get_session(session.id).await.unwrap();
        assert_eq!(session.reserved, 0, "reservation released at commit");
        assert_eq!(session.consumed, outcome.cost);
        assert_eq!(session.effective_ms, outcome.billed_ms);
        assert!(session.consumed <= session.budget_allowance);
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn execute_on_pending_session_is_a_state_error() {
        let f = fixture();
        let session = f.manager.create_session("agent-1", 1_000).await.unwrap();
        let err = f
            .manager
            .execute(session.id, "sh", &args(json!({"script": "true"})))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::State { .. }));
        assert_eq!(f.manager.engine().counts().total_started, 0);
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found_and_cost_free() {
        let f = fixture();
        let session = active_session(&f.manager, 1_000).await;
        let err = f
            .manager
            .execute(session.id, "nope", &args(json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::UnknownTool(_)));

        let (session, _) = f.manager.get_session(session.id).await.unwrap();
        assert_eq!(session.consumed, 0);
        assert_eq!(session.reserved, 0);
    }

    #[tokio::test]
    async fn invalid_args_are_rejected_before_any_reservation() {
        let f = fixture();
        let session = active_session(&f.manager, 1_000).await;
        let err = f
            .manager
            .execute(session.id, "sh", &args(json!({"script": 42})))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));

        let (session, _) = f.manager.get_session(session.id).await.unwrap();
        assert_eq!(session.reserved, 0);
        assert_eq!(f.manager.engine().counts().total_started, 0);
    }

    #[tokio::test]
    async fn unaffordable_projection_is_refused_with_zero_spawns() {
        let f = fixture();
        // pricey projects 600¢; the budget holds 500.
        let session = active_session(&f.manager, 500).await;

        let err = f
            .manager
            .execute(session.id, "pricey", &args(json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Budget(_)));
        assert_eq!(
            f.manager.engine().counts().total_started,
            0,
            "no subprocess may start for a rejected request"
        );

        let (session, executions) = f.manager.get_session(session.id).await.unwrap();
        assert_eq!(session.consumed, 0);
        assert_eq!(session.reserved, 0);
        assert!(executions.is_empty());
    }

    #[tokio::test]
    async fn concurrent_executes_jointly_over_budget_resolve_to_one_winner() {
        let f = fixture_with(vec![tool(
            "slowish",
            "sleep",
            vec![ArgSpec::required("seconds", ArgType::Number)],
            60,
            60, // projected: 60s * 60¢/min = 60¢
        )]);
        // Each alone fits (60 ≤ 100); together they need 120.
        let session = active_session(&f.manager, 100).await;

        let first_args = args(json!({"seconds": 0.1}));
        let second_args = args(json!({"seconds": 0.1}));
        let first = f
            .manager
            .execute(session.id, "slowish", &first_args);
        let second = f
            .manager
            .execute(session.id, "slowish", &second_args);
        let (first, second) = tokio::join!(first, second);

        let mut oks = 0;
        let mut exhausted = 0;
        for result in [first, second] {
            match result {
                Ok(receipt) => {
                    oks += 1;
                    let _ = receipt.completion.await;
                }
                Err(SessionError::Budget(_)) => exhausted += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!((oks, exhausted), (1, 1), "exactly one success, one refusal");

        let (session, _) = f.manager.get_session(session.id).await.unwrap();
        assert!(session.consumed <= session.budget_allowance);
        assert_eq!(session.reserved, 0);
    }

    #[tokio::test]
    async fn timed_out_execution_still_pays_for_its_limit() {
        let f = fixture();
        let session = active_session(&f.manager, 1_000).await;

        // 1s limit, 5s sleep: the engine kills it, the meter bills ~1s.
        let receipt = f
            .manager
            .execute(session.id, "sleep", &args(json!({"seconds": 5})))
            .await
            .unwrap();
        let outcome = receipt.completion.await.unwrap();

        assert_eq!(outcome.status, ExecutionStatus::Timeout);
        assert_eq!(outcome.billed_ms, 1_000);
        assert_eq!(outcome.cost, 1);

        let (session, _) = f.manager.get_session(session.id).await.unwrap();
        assert_eq!(session.consumed, 1);
        assert_eq!(session.effective_ms, 1_000);
    }

    #[tokio::test]
    async fn failed_execution_consumes_budget_for_elapsed_time() {
        let f = fixture();
        let session = active_session(&f.manager, 1_000).await;

        let receipt = f
            .manager
            .execute(session.id, "sh", &args(json!({"script": "exit 7"})))
            .await
            .unwrap();
        let outcome = receipt.completion.await.unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Failed);

        let (session, _) = f.manager.get_session(session.id).await.unwrap();
        // Compute time was genuinely spent, so the run is billed even
        // though it failed.
        assert_eq!(session.consumed, outcome.cost);
        assert_eq!(session.reserved, 0);
    }

    #[tokio::test]
    async fn end_refuses_while_executions_are_in_flight() {
        let f = fixture();
        let session = active_session(&f.manager, 1_000).await;

        let receipt = f
            .manager
            .execute(session.id, "sleep", &args(json!({"seconds": 0.5})))
            .await
            .unwrap();

        let err = f.manager.end_session(session.id).await.unwrap_err();
        assert!(matches!(err, SessionError::ExecutionsInFlight));

        let _ = receipt.completion.await;
        assert!(f.manager.end_session(session.id).await.is_ok());
    }

    // ── settlement ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn settle_splits_consumed_exactly_and_only_once() {
        let f = fixture();
        let session = active_session(&f.manager, 1_000).await;
        let receipt = f
            .manager
            .execute(session.id, "sh", &args(json!({"script": "true"})))
            .await
            .unwrap();
        let _ = receipt.completion.await;

        let (ended, preview) = f.manager.end_session(session.id).await.unwrap();
        assert_eq!(preview.total_amount, ended.consumed);

        let settlement = f.manager.settle_session(session.id).await.unwrap();
        assert_eq!(settlement.total_amount, ended.consumed);
        assert_eq!(
            settlement.provider_payout + settlement.platform_fee + settlement.reserve_amount,
            settlement.total_amount
        );

        // Second settle fails; the stored record is untouched.
        let err = f.manager.settle_session(session.id).await.unwrap_err();
        assert_eq!(err.kind(), "already_settled");
        assert_eq!(f.manager.settlement_for(session.id).unwrap(), settlement);
    }

    #[tokio::test]
    async fn settle_before_end_is_a_state_error() {
        let f = fixture();
        let session = active_session(&f.manager, 1_000).await;
        let err = f.manager.settle_session(session.id).await.unwrap_err();
        assert!(matches!(err, SessionError::State { .. }));
    }

    // ── workspace teardown ─────────────────────────────────────────────────

    #[tokio::test]
    async fn cleanup_is_gated_then_idempotent() {
        let f = fixture();
        let session = active_session(&f.manager, 1_000).await;

        let receipt = f
            .manager
            .execute(session.id, "sh", &args(json!({"script": "echo x > marker.txt"})))
            .await
            .unwrap();
        let _ = receipt.completion.await;

        let workdir = f._workspace.path().join(session.id.to_string());
        assert!(workdir.join("marker.txt").exists());

        // Not legal while the session is still active.
        let err = f.manager.cleanup_workspace(session.id).await.unwrap_err();
        assert!(matches!(err, SessionError::State { .. }));

        f.manager.end_session(session.id).await.unwrap();
        f.manager.cleanup_workspace(session.id).await.unwrap();
        assert!(!workdir.exists());

        // Second and third calls are no-ops, not errors.
        f.manager.cleanup_workspace(session.id).await.unwrap();
        f.manager.cleanup_workspace(session.id).await.unwrap();
    }
}
