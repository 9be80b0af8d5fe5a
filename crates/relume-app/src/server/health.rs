//! Liveness and readiness probes.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

use crate::services::context::{AppContext, LatencySummary};

const UNAVAILABLE_RETRY_SECS: &str = "5";

#[derive(Debug, Serialize)]
struct ReadyResponse {
    status: &'static str,
    degraded: bool,
    checks: Checks,
    latency: LatencySummary,
}

#[derive(Debug, Serialize)]
struct Checks {
    document_store: &'static str,
    blob_store: &'static str,
    shared_kv: &'static str,
}

pub async fn live() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Hard dependencies (document store, blob store, a configured shared KV)
/// fail readiness; the in-process KV fallback only degrades it.
pub async fn ready(State(ctx): State<Arc<AppContext>>) -> Response {
    let document_store = match ctx.docs.probe() {
        Ok(()) => "ok",
        Err(error) => {
            tracing::error!(%error, "document store probe failed");
            "down"
        }
    };
    let blob_store = match ctx.blobs.healthy().await {
        Ok(()) => "ok",
        Err(error) => {
            tracing::error!(%error, "blob store probe failed");
            "down"
        }
    };
    let shared_kv = if ctx.kv_degraded {
        "degraded"
    } else {
        match ctx.kv.ping().await {
            Ok(()) => "ok",
            Err(error) => {
                tracing::error!(%error, "shared kv probe failed");
                "down"
            }
        }
    };

    let hard_down = document_store == "down" || blob_store == "down" || shared_kv == "down";
    let degraded = shared_kv == "degraded";
    let body = ReadyResponse {
        status: if hard_down {
            "unavailable"
        } else if degraded {
            "degraded"
        } else {
            "ok"
        },
        degraded,
        checks: Checks {
            document_store,
            blob_store,
            shared_kv,
        },
        latency: ctx.latency.summary(),
    };

    let mut response = Json(body).into_response();
    if hard_down {
        *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
        response.headers_mut().insert(
            header::RETRY_AFTER,
            HeaderValue::from_static(UNAVAILABLE_RETRY_SECS),
        );
    }
    response
}
