//! HTTP lookup and health endpoints.

use crate::store::{BlocklistStore, StoreStatus};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info};

struct ApiState {
    store: Arc<BlocklistStore>,
    stale_after: Duration,
}

#[derive(Debug, Deserialize)]
struct LookupParams {
    address: Option<String>,
}

#[derive(Debug, Serialize)]
struct LookupResult {
    is_bad_ip: bool,
}

#[derive(Debug, Serialize)]
struct Message {
    message: &'static str,
}

#[derive(Debug, Serialize)]
struct HealthReport {
    healthy: bool,
    #[serde(flatten)]
    store: StoreStatus,
}

/// Build the lookup router.
///
/// - `GET /is-bad-ip?address=<ip>` answers whether the address is listed.
/// - `GET /health` reports 503 once the store has not been refreshed
///   within `stale_after`.
pub fn router(store: Arc<BlocklistStore>, stale_after: Duration) -> Router {
    let state = Arc::new(ApiState { store, stale_after });

    Router::new()
        .route("/is-bad-ip", get(is_bad_ip))
        .route("/health", get(health))
        .with_state(state)
}

/// Serve `app` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(address = %addr, "Lookup service listening");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn is_bad_ip(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<LookupParams>,
) -> Response {
    let address = params.address.as_deref().map(str::trim).unwrap_or_default();
    if address.is_empty() {
        return bad_request("missing address parameter value");
    }

    let ip: IpAddr = match address.parse() {
        Ok(ip) => ip,
        Err(_) => return bad_request("invalid IP address format"),
    };

    let is_bad_ip = state.store.contains(&ip);
    debug!(ip = %ip, is_bad_ip, "Lookup");

    Json(LookupResult { is_bad_ip }).into_response()
}

async fn health(State(state): State<Arc<ApiState>>) -> Response {
    let status = state.store.status();
    let healthy = is_fresh(status.last_refresh, state.stale_after, Utc::now());
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (code, Json(HealthReport { healthy, store: status })).into_response()
}

fn bad_request(message: &'static str) -> Response {
    (StatusCode::BAD_REQUEST, Json(Message { message })).into_response()
}

/// A store is fresh once refreshed and for `stale_after` afterwards.
fn is_fresh(last_refresh: Option<DateTime<Utc>>, stale_after: Duration, now: DateTime<Utc>) -> bool {
    let Some(last) = last_refresh else {
        return false;
    };
    match chrono::Duration::from_std(stale_after) {
        Ok(window) => now.signed_duration_since(last) <= window,
        Err(_) => true,
    }
}
