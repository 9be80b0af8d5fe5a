//! RFC 7807 problem documents and the error taxonomy.

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::{Map, Value};

use crate::services::rate_limit::RateSnapshot;

pub const PROBLEM_CONTENT_TYPE: &str = "application/problem+json";

pub const RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
pub const RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
pub const RATELIMIT_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");

/// Error taxonomy, by kind rather than by exception type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unauthorized,
    Forbidden,
    NotFound,
    InvalidPayload,
    UnsupportedMediaType,
    IdempotencyKeyMissing,
    IdempotencyKeyInvalid,
    IdempotencyConflict,
    FileTooLarge,
    ModerationRejected,
    InsufficientCredits,
    RateLimitExceeded,
    NotImplemented,
    ServiceUnavailable,
    Internal,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        use ErrorKind::*;
        match self {
            Unauthorized => StatusCode::UNAUTHORIZED,
            Forbidden => StatusCode::FORBIDDEN,
            NotFound => StatusCode::NOT_FOUND,
            InvalidPayload => StatusCode::BAD_REQUEST,
            UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            IdempotencyKeyMissing | IdempotencyKeyInvalid => StatusCode::BAD_REQUEST,
            IdempotencyConflict => StatusCode::CONFLICT,
            FileTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ModerationRejected => StatusCode::UNPROCESSABLE_ENTITY,
            InsufficientCredits => StatusCode::PAYMENT_REQUIRED,
            RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            NotImplemented => StatusCode::NOT_IMPLEMENTED,
            ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn slug(self) -> &'static str {
        use ErrorKind::*;
        match self {
            Unauthorized => "unauthorized",
            Forbidden => "forbidden",
            NotFound => "not-found",
            InvalidPayload => "invalid-payload",
            UnsupportedMediaType => "unsupported-media-type",
            IdempotencyKeyMissing => "idempotency-key-missing",
            IdempotencyKeyInvalid => "idempotency-key-invalid",
            IdempotencyConflict => "idempotency-conflict",
            FileTooLarge => "file-too-large",
            ModerationRejected => "moderation-rejected",
            InsufficientCredits => "insufficient-credits",
            RateLimitExceeded => "rate-limit-exceeded",
            NotImplemented => "not-implemented",
            ServiceUnavailable => "service-unavailable",
            Internal => "internal",
        }
    }

    pub fn title(self) -> &'static str {
        use ErrorKind::*;
        match self {
            Unauthorized => "Unauthorized",
            Forbidden => "Forbidden",
            NotFound => "Not Found",
            InvalidPayload => "Invalid Payload",
            UnsupportedMediaType => "Unsupported Media Type",
            IdempotencyKeyMissing => "Idempotency Key Missing",
            IdempotencyKeyInvalid => "Idempotency Key Invalid",
            IdempotencyConflict => "Idempotency Conflict",
            FileTooLarge => "File Too Large",
            ModerationRejected => "Moderation Rejected",
            InsufficientCredits => "Insufficient Credits",
            RateLimitExceeded => "Rate Limit Exceeded",
            NotImplemented => "Not Implemented",
            ServiceUnavailable => "Service Unavailable",
            Internal => "Internal Server Error",
        }
    }
}

/// Problem document builder. `instance` echoes the request id.
#[derive(Debug, Clone)]
pub struct Problem {
    kind: ErrorKind,
    detail: Option<String>,
    instance: Option<String>,
    retry_after_secs: Option<u64>,
    rate: Option<RateSnapshot>,
    extensions: Map<String, Value>,
}

impl Problem {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            detail: None,
            instance: None,
            retry_after_secs: None,
            rate: None,
            extensions: Map::new(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_instance(mut self, request_id: Option<String>) -> Self {
        self.instance = request_id;
        self
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after_secs = Some(secs);
        self
    }

    pub fn with_rate(mut self, snapshot: RateSnapshot) -> Self {
        self.rate = Some(snapshot);
        self
    }

    pub fn with_extension(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extensions.insert(key.to_string(), value.into());
        self
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        tracing::error!(%detail, "internal error surfaced to client");
        // The detail stays in the log; clients get the generic document.
        Problem::new(ErrorKind::Internal)
    }
}

/// Stamp IETF draft rate-limit headers onto a response.
pub fn apply_rate_headers(headers: &mut HeaderMap, snapshot: &RateSnapshot) {
    debug_assert!(snapshot.remaining <= snapshot.limit);
    headers.insert(RATELIMIT_LIMIT, int_header(u64::from(snapshot.limit)));
    headers.insert(RATELIMIT_REMAINING, int_header(u64::from(snapshot.remaining)));
    headers.insert(RATELIMIT_RESET, int_header(snapshot.reset_secs));
}

fn int_header(value: u64) -> HeaderValue {
    HeaderValue::from_str(&value.to_string()).expect("integers are valid header values")
}

impl Problem {
    /// Canonical document bytes, also what the idempotency store records.
    pub fn body_bytes(&self) -> Vec<u8> {
        let status = self.kind.status();
        let mut body = Map::new();
        body.insert(
            "type".to_string(),
            Value::String(format!("urn:relume:{}", self.kind.slug())),
        );
        body.insert("title".to_string(), Value::String(self.kind.title().to_string()));
        body.insert("status".to_string(), Value::from(status.as_u16()));
        if let Some(detail) = &self.detail {
            body.insert("detail".to_string(), Value::String(detail.clone()));
        }
        if let Some(instance) = &self.instance {
            body.insert("instance".to_string(), Value::String(instance.clone()));
        }
        if let Some(secs) = self.retry_after_secs {
            body.insert("retry_after".to_string(), Value::from(secs));
        }
        for (key, value) in &self.extensions {
            body.insert(key.clone(), value.clone());
        }
        serde_json::to_vec(&Value::Object(body)).unwrap_or_default()
    }
}

impl IntoResponse for Problem {
    fn into_response(self) -> Response {
        let status = self.kind.status();
        let payload = self.body_bytes();
        let mut response = Response::new(payload.into());
        *response.status_mut() = status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(PROBLEM_CONTENT_TYPE),
        );
        if let Some(secs) = self.retry_after_secs {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, int_header(secs));
        }
        if let Some(snapshot) = &self.rate {
            apply_rate_headers(response.headers_mut(), snapshot);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_expected_statuses() {
        assert_eq!(ErrorKind::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorKind::InsufficientCredits.status(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(ErrorKind::ModerationRejected.status().as_u16(), 422);
        assert_eq!(ErrorKind::IdempotencyConflict.status(), StatusCode::CONFLICT);
        assert_eq!(ErrorKind::FileTooLarge.status().as_u16(), 413);
        assert_eq!(ErrorKind::RateLimitExceeded.status().as_u16(), 429);
    }

    #[test]
    fn renders_problem_json_with_extensions() {
        let response = Problem::new(ErrorKind::InsufficientCredits)
            .with_detail("not enough credits")
            .with_instance(Some("req-1".to_string()))
            .with_extension("remaining_credits", 0)
            .into_response();

        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
            Some(PROBLEM_CONTENT_TYPE)
        );
    }

    #[test]
    fn deny_response_carries_rate_and_retry_headers() {
        let snapshot = RateSnapshot {
            limit: 120,
            remaining: 0,
            reset_secs: 17,
        };
        let response = Problem::new(ErrorKind::RateLimitExceeded)
            .with_retry_after(17)
            .with_rate(snapshot)
            .into_response();

        let headers = response.headers();
        assert_eq!(headers.get(header::RETRY_AFTER).unwrap(), "17");
        assert_eq!(headers.get(RATELIMIT_LIMIT).unwrap(), "120");
        assert_eq!(headers.get(RATELIMIT_REMAINING).unwrap(), "0");
        assert_eq!(headers.get(RATELIMIT_RESET).unwrap(), "17");
    }
}
