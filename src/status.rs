//! Operator HTTP surface
//!
//! - `GET  /health`                  liveness
//! - `GET  /stats`                   pipeline counters and ledger occupancy
//! - `GET  /requests/:id`            ledger entry for one request
//! - `POST /requests/:id/resubmit`   re-send an unconfirmed fulfillment

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::models::{FailureReason, RequestId, RequestState};
use crate::oracle::{OracleContext, OracleStatsSnapshot};

pub struct StatusState {
    pub ctx: Arc<OracleContext>,
    pub started_at: DateTime<Utc>,
    /// In-flight re-submissions. `None` once draining has begun.
    resubmits: Mutex<Option<JoinSet<()>>>,
}

impl StatusState {
    pub fn new(ctx: Arc<OracleContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            started_at: Utc::now(),
            resubmits: Mutex::new(Some(JoinSet::new())),
        })
    }

    /// Refuse new re-submissions and wait up to `limit` for running ones.
    ///
    /// Returns how many were still running when `limit` expired. Those are
    /// aborted and their requests stay in `submitting`.
    pub async fn drain(&self, limit: Duration) -> usize {
        let Some(mut tasks) = self.resubmits.lock().take() else {
            return 0;
        };
        if tasks.is_empty() {
            return 0;
        }

        info!(in_flight = tasks.len(), "⏳ Waiting for re-submissions to finish");
        let finished = tokio::time::timeout(limit, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "❌ Re-submission task panicked");
                }
            }
        })
        .await;

        if finished.is_ok() {
            return 0;
        }
        let abandoned = tasks.len();
        warn!(
            abandoned,
            limit_secs = limit.as_secs(),
            "⚠️ Re-submissions still running at shutdown, leaving them in submitting"
        );
        tasks.shutdown().await;
        abandoned
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    started_at: DateTime<Utc>,
    uptime_secs: i64,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    counters: OracleStatsSnapshot,
    tracked_requests: usize,
    states: HashMap<&'static str, usize>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

pub fn router(state: Arc<StatusState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/requests/:id", get(request_status))
        .route("/requests/:id/resubmit", post(resubmit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<Arc<StatusState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        started_at: state.started_at,
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    })
}

async fn stats(State(state): State<Arc<StatusState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        counters: state.ctx.stats.snapshot(),
        tracked_requests: state.ctx.ledger.len(),
        states: state.ctx.ledger.state_counts(),
    })
}

async fn request_status(
    State(state): State<Arc<StatusState>>,
    Path(id): Path<String>,
) -> Response {
    let id: RequestId = match id.parse() {
        Ok(id) => id,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };
    match state.ctx.ledger.snapshot(&id) {
        Some(entry) => Json(entry).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("request {} not tracked", id)),
    }
}

/// Starts the re-submission in the background and answers `202 Accepted`.
/// Answers `503` once shutdown has started draining.
async fn resubmit(State(state): State<Arc<StatusState>>, Path(id): Path<String>) -> Response {
    let id: RequestId = match id.parse() {
        Ok(id) => id,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };
    match state.ctx.ledger.get(&id) {
        None => {
            return error_response(StatusCode::NOT_FOUND, format!("request {} not tracked", id))
        }
        Some(RequestState::Failed(FailureReason::Unconfirmed)) => {}
        Some(other) => {
            return error_response(
                StatusCode::CONFLICT,
                format!("request {} is {}, only unconfirmed requests can be re-submitted", id, other),
            )
        }
    }

    let mut guard = state.resubmits.lock();
    let Some(tasks) = guard.as_mut() else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "shutting down, re-submissions are no longer accepted",
        );
    };
    // reap finished tasks so the set only holds running ones
    while tasks.try_join_next().is_some() {}

    let ctx = state.ctx.clone();
    tasks.spawn(async move {
        match ctx.resubmit(&id).await {
            Ok(final_state) => info!(request_id = %id, state = %final_state, "🔁 Re-submission finished"),
            Err(e) => error!(request_id = %id, error = %e, "❌ Re-submission failed"),
        }
    });
    drop(guard);

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "request_id": id, "status": "resubmitting" })),
    )
        .into_response()
}

/// Serve until `shutdown` becomes true.
pub async fn serve(port: u16, state: Arc<StatusState>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind status port {}", port))?;

    info!(port, "📡 Status server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("status server failed")
}
