//! Signed upload targets.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::server::auth::{authenticate, request_id};
use crate::server::problem::{ErrorKind, Problem};
use crate::services::blob::ALLOWED_CONTENT_TYPES;
use crate::services::context::AppContext;

#[derive(Debug, Deserialize)]
pub struct SignedUrlQuery {
    #[serde(rename = "contentType")]
    content_type: String,
}

#[derive(Debug, Serialize)]
struct SignedUrlResponse {
    upload_url: String,
    object_name: String,
    expires_at: String,
    content_type: String,
}

pub async fn signed_upload_url(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<SignedUrlQuery>,
    headers: HeaderMap,
) -> Response {
    let rid = request_id(&headers);
    let user = match authenticate(&ctx, &headers).await {
        Ok(user) => user,
        Err(problem) => return problem.into_response(),
    };

    let content_type = query.content_type.trim().to_ascii_lowercase();
    if !ALLOWED_CONTENT_TYPES.contains(&content_type.as_str()) {
        return Problem::new(ErrorKind::UnsupportedMediaType)
            .with_detail(format!(
                "contentType must be one of {}",
                ALLOWED_CONTENT_TYPES.join(", ")
            ))
            .with_instance(rid)
            .into_response();
    }

    match ctx.blobs.issue_upload_url(&user.user_id, &content_type).await {
        Ok(target) => {
            let expires_at = Utc
                .timestamp_opt(target.expires_at_unix as i64, 0)
                .single()
                .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_default();
            Json(SignedUrlResponse {
                upload_url: target.upload_url,
                object_name: target.object_name,
                expires_at,
                content_type: target.content_type,
            })
            .into_response()
        }
        Err(error) => Problem::internal(error.to_string())
            .with_instance(rid)
            .into_response(),
    }
}
