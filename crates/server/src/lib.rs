//! HTTP surface of the provider daemon.
//!
//! Thin by design: handlers translate wire requests into
//! [`SessionManager`] calls and session errors into the JSON error
//! envelope.  Nothing here owns state beyond the uptime clock.

mod error;
mod routes;

pub use error::ApiError;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use hireling_billing::{MemSettlementStore, SettlementEngine, SplitPolicy};
use hireling_config::AppConfig;
use hireling_exec::ExecutionEngine;
use hireling_session::SessionManager;
use hireling_store::{MemStore, Store};
use hireling_types::{Execution, Session};

pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub provider_id: String,
    pub started_at: Instant,
}

/// Assemble the full stack from configuration: stores, engine, registry,
/// settlement, manager.
pub fn build_manager(config: &AppConfig) -> Result<Arc<SessionManager>> {
    let registry = Arc::new(config.build_registry()?);
    let executions: Arc<dyn Store<Execution>> = Arc::new(MemStore::new());
    let sessions: Arc<dyn Store<Session>> = Arc::new(MemStore::new());
    let policy = SplitPolicy {
        provider_pct: config.billing.provider_pct,
        platform_pct: config.billing.platform_pct,
        reserve_pct: config.billing.reserve_pct,
    };
    let settlements = SettlementEngine::new(Arc::new(MemSettlementStore::new()), policy)
        .context("invalid billing split")?;

    Ok(Arc::new(SessionManager::new(
        sessions,
        Arc::clone(&executions),
        registry,
        Arc::new(ExecutionEngine::new(executions)),
        settlements,
        config.provider.id.clone(),
        config.workspace.root.clone().into(),
    )))
}

pub fn build_router(manager: Arc<SessionManager>, provider_id: String) -> Router {
    let state = Arc::new(AppState {
        manager,
        provider_id,
        started_at: Instant::now(),
    });

    Router::new()
        .route("/sessions", post(routes::create_session))
        .route(
            "/sessions/{id}",
            get(routes::get_session).patch(routes::patch_session),
        )
        .route("/sessions/{id}/execute", post(routes::execute))
        .route("/tools", get(routes::list_tools))
        .route("/health", get(routes::health))
        .route("/payments", post(routes::settle))
        .with_state(state)
}

/// Run the provider daemon until ctrl-c.
pub async fn run(config: &AppConfig) -> Result<()> {
    config.validate()?;
    let manager = build_manager(config)?;
    let app = build_router(manager, config.provider.id.clone());

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "invalid listen address '{}:{}'",
                config.server.bind, config.server.port
            )
        })?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve listen address")?;

    info!(
        addr = %local_addr,
        provider = %config.provider.id,
        tools = config.tools.len(),
        workspace_root = %config.workspace.root,
        "provider daemon listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("server terminated abnormally")
}
