pub mod context;
mod reminders;
mod secrets;
mod tasks;

use crate::error::{AppError, AppResult};
use crate::reminder::{ReminderDispatcher, ReminderService};
use crate::task_manager::TaskManager;
use crate::vault::SecretVault;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;

pub use context::{ApiError, RequestContext};

/// Services the HTTP handlers call into.
#[derive(Clone)]
pub struct ApiState {
    pub tasks: TaskManager,
    pub reminders: ReminderService,
    pub dispatcher: ReminderDispatcher,
    pub vault: SecretVault,
}

#[derive(Debug, Default, Deserialize)]
struct LimitQuery {
    limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageQuery {
    page: Option<i64>,
    page_size: Option<i64>,
}

pub fn router(state: ApiState) -> Router {
    let v1 = Router::new()
        .merge(tasks::routes())
        .merge(reminders::routes())
        .merge(secrets::routes());

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", v1)
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Serves the API until `cancel` fires.
pub async fn serve(state: ApiState, bind: SocketAddr, cancel: CancellationToken) -> AppResult<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|e| AppError::configuration(format!("Failed to bind {}: {}", bind, e)))?;
    log::info!("HTTP API listening on {}", bind);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| AppError::internal(format!("HTTP server failed: {}", e)))
}
