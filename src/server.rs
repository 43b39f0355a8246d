use axum::extract::{ConnectInfo, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use garde::Validate;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::config::Config;
use crate::data::DateRange;
use crate::dispatch::{self, BacktestRequest};
use crate::error::EngineError;
use crate::store::{Store, TaskResult};
use crate::throttle::{RateLimiter, EXECUTE_LIMIT, HEALTH_LIMIT, TASK_LIMIT};

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Store>,
    pub results: Arc<Store>,
    pub limiter: Arc<RateLimiter>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ExecutePayload {
    #[garde(dive)]
    backtest: BacktestBody,
}

#[derive(Debug, Deserialize, Validate)]
pub struct BacktestBody {
    /// Ticker symbol the series is fetched under.
    #[garde(length(min = 1, max = 20), pattern(r"^[A-Za-z0-9._-]+$"))]
    name: String,
    /// Strategy source. Checked by hand so its absence can produce the
    /// contract's `missing code` response instead of a decode error.
    #[garde(skip)]
    code: Option<String>,
    #[garde(skip)]
    #[serde(default)]
    params: HashMap<String, f64>,
    #[garde(dive)]
    range: RangeBody,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RangeBody {
    #[garde(custom(validate_iso_date))]
    from: String,
    #[garde(custom(validate_iso_date))]
    to: String,
}

fn validate_iso_date(value: &str, (): &()) -> garde::Result {
    chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map(|_| ())
        .map_err(|_| garde::Error::new("must be a YYYY-MM-DD calendar date"))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/engine/execute/", post(execute))
        .route("/engine/task/{task_id}/", get(task_status))
        .route("/engine/health/", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn execute(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(payload): Json<ExecutePayload>,
) -> Response {
    let client = addr.ip().to_string();
    if !state.limiter.check(&EXECUTE_LIMIT, &client).await {
        return throttled();
    }

    let Some(code) = payload
        .backtest
        .code
        .as_deref()
        .filter(|c| !c.trim().is_empty())
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "missing code"})),
        )
            .into_response();
    };

    if let Err(report) = payload.validate() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"error": report.to_string()})),
        )
            .into_response();
    }

    let request = BacktestRequest {
        symbol: payload.backtest.name.clone(),
        code: code.to_string(),
        params: payload.backtest.params.clone(),
        range: DateRange {
            from: payload.backtest.range.from.clone(),
            to: payload.backtest.range.to.clone(),
        },
    };

    match dispatch::submit(&state.broker, &state.results, request).await {
        Ok(task_id) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "task_id": task_id,
                "status_url": format!("/engine/task/{task_id}/"),
            })),
        )
            .into_response(),
        Err(EngineError::ServiceUnavailable(detail)) => {
            tracing::error!(%detail, "submission rejected, service unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "service unavailable", "detail": detail})),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "submission failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "processing failed"})),
            )
                .into_response()
        }
    }
}

/// Never blocks on the worker: an unpublished result is simply
/// `pending`.
async fn task_status(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(task_id): Path<String>,
) -> Response {
    let client = addr.ip().to_string();
    if !state.limiter.check(&TASK_LIMIT, &client).await {
        return throttled();
    }

    match state.results.fetch_result(&task_id).await {
        Ok(None) => (StatusCode::OK, Json(json!({"status": "pending"}))).into_response(),
        Ok(Some(TaskResult::Completed { stdout, .. })) => {
            match serde_json::from_str::<serde_json::Value>(&stdout) {
                Ok(report) => (
                    StatusCode::OK,
                    Json(json!({"status": "completed", "result": report})),
                )
                    .into_response(),
                Err(e) => {
                    tracing::error!(%task_id, error = %e, "stored report is not valid JSON");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(json!({"status": "error", "error": "malformed report payload"})),
                    )
                        .into_response()
                }
            }
        }
        Ok(Some(TaskResult::Error { error, stderr })) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"status": "error", "error": error, "stderr": stderr})),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(%task_id, error = %e, "result lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": format!("error checking task status: {e:#}")})),
            )
                .into_response()
        }
    }
}

async fn health(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let client = addr.ip().to_string();
    if !state.limiter.check(&HEALTH_LIMIT, &client).await {
        return throttled();
    }

    let redis = state.results.ping().await;
    let workers = state.broker.workers_alive().await;
    let status = if redis && workers {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(json!({"redis": redis, "workers": workers}))).into_response()
}

fn throttled() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({"error": "rate limit exceeded"})),
    )
        .into_response()
}

/// Server-process entry: bind the HTTP surface and serve until
/// interrupted.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let broker = Arc::new(Store::connect_with_retry(&config.broker_url, 5).await?);
    let results = if config.result_backend_url == config.broker_url {
        Arc::clone(&broker)
    } else {
        Arc::new(Store::connect_with_retry(&config.result_backend_url, 5).await?)
    };
    let limiter = Arc::new(RateLimiter::new(results.manager()));

    let app = router(AppState {
        broker,
        results,
        limiter,
    });

    tracing::info!(addr = %config.bind_addr, "starting engine HTTP server");
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;

    Ok(())
}
