//! W3C trace context carried between the API front and workers.
//!
//! The control plane does not export spans anywhere; it only preserves the
//! `traceparent`/`tracestate` pair across the queue boundary so worker spans
//! can be correlated with the admitting request by an external collector.

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

/// Parent trace identifiers attached to requests and queue tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    #[serde(default)]
    pub traceparent: Option<String>,
    #[serde(default)]
    pub tracestate: Option<String>,
}

impl TraceContext {
    /// Capture the incoming trace context, dropping malformed `traceparent`
    /// values instead of propagating garbage downstream.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let traceparent = headers
            .get("traceparent")
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| is_valid_traceparent(value))
            .map(str::to_string);
        let tracestate = headers
            .get("tracestate")
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        Self {
            traceparent,
            tracestate,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.traceparent.is_none() && self.tracestate.is_none()
    }
}

/// Validate the `00-<32 hex>-<16 hex>-<2 hex>` wire form.
pub fn is_valid_traceparent(value: &str) -> bool {
    let mut parts = value.split('-');
    let (Some(version), Some(trace_id), Some(parent_id), Some(flags), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return false;
    };

    is_lower_hex(version, 2)
        && version != "ff"
        && is_lower_hex(trace_id, 32)
        && trace_id.bytes().any(|b| b != b'0')
        && is_lower_hex(parent_id, 16)
        && parent_id.bytes().any(|b| b != b'0')
        && is_lower_hex(flags, 2)
}

fn is_lower_hex(value: &str, len: usize) -> bool {
    value.len() == len
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
