//! Idempotency entries: (owner, key) → the canonical admission response.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::services::backoff::current_timestamp_ms;
use crate::services::kv::{AtomicKv, KvError};

const ENTRY_TTL_SECS: u64 = 86_400;

/// Headers that frameworks recompute and must not be replayed.
const EXCLUDED_HEADERS: [&str; 3] = ["content-length", "transfer-encoding", "connection"];

/// Exactly what the API returned the first time: status, minimal headers,
/// body, and the payload fingerprint used to detect divergence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyEntry {
    pub fingerprint: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(with = "body_bytes")]
    pub body: Vec<u8>,
    pub created_at_ms: i64,
}

mod body_bytes {
    use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(raw)
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error("corrupt idempotency entry: {0}")]
    Corrupt(#[from] serde_json::Error),
}

pub struct IdempotencyStore {
    kv: Arc<dyn AtomicKv>,
}

impl IdempotencyStore {
    pub fn new(kv: Arc<dyn AtomicKv>) -> Self {
        Self { kv }
    }

    pub async fn get(
        &self,
        owner: &str,
        key: &str,
    ) -> Result<Option<IdempotencyEntry>, IdempotencyError> {
        let raw = self.kv.get(&entry_key(owner, key)).await?;
        raw.map(|raw| serde_json::from_slice(&raw))
            .transpose()
            .map_err(IdempotencyError::from)
    }

    /// Write the canonical response once. A concurrent duplicate admission
    /// loses the race and keeps the first writer's entry.
    pub async fn put(
        &self,
        owner: &str,
        key: &str,
        fingerprint: &str,
        status: u16,
        headers: &[(String, String)],
        body: &[u8],
    ) -> Result<bool, IdempotencyError> {
        let entry = IdempotencyEntry {
            fingerprint: fingerprint.to_string(),
            status,
            headers: headers
                .iter()
                .filter(|(name, _)| !EXCLUDED_HEADERS.contains(&name.to_ascii_lowercase().as_str()))
                .cloned()
                .collect(),
            body: body.to_vec(),
            created_at_ms: current_timestamp_ms(),
        };
        let raw = serde_json::to_vec(&entry)?;
        let written = self
            .kv
            .put_if_absent(&entry_key(owner, key), &raw, ENTRY_TTL_SECS)
            .await?;
        Ok(written)
    }
}

fn entry_key(owner: &str, key: &str) -> String {
    format!("idem:{owner}:{key}")
}

/// Validate the canonical 128-bit textual form: lowercase hyphenated UUID,
/// exactly as rendered. Anything else, including case variants, is rejected.
pub fn validate_idempotency_key(raw: &str) -> Option<&str> {
    let parsed = Uuid::parse_str(raw).ok()?;
    if parsed.as_hyphenated().to_string() == raw {
        Some(raw)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::kv::MemoryKv;

    const KEY: &str = "018f3a20-5a9e-7cc0-b1a5-4f2b9a1c0de3";

    fn store() -> IdempotencyStore {
        IdempotencyStore::new(Arc::new(MemoryKv::new()))
    }

    #[test]
    fn accepts_only_canonical_keys() {
        assert!(validate_idempotency_key(KEY).is_some());
        assert!(validate_idempotency_key(&KEY.to_uppercase()).is_none());
        assert!(validate_idempotency_key(&KEY.replace('-', "")).is_none());
        assert!(validate_idempotency_key(&KEY[..35]).is_none());
        assert!(validate_idempotency_key("not-a-key").is_none());
        assert!(validate_idempotency_key("").is_none());
    }

    #[tokio::test]
    async fn first_write_wins() {
        let store = store();
        let headers = vec![("location".to_string(), "/v1/jobs/1".to_string())];

        let wrote = store
            .put("user-1", KEY, "fp-1", 202, &headers, b"{\"job_id\":1}")
            .await
            .expect("put");
        assert!(wrote);

        let wrote_again = store
            .put("user-1", KEY, "fp-other", 202, &headers, b"other")
            .await
            .expect("put");
        assert!(!wrote_again);

        let entry = store
            .get("user-1", KEY)
            .await
            .expect("get")
            .expect("entry exists");
        assert_eq!(entry.fingerprint, "fp-1");
        assert_eq!(entry.status, 202);
        assert_eq!(entry.body, b"{\"job_id\":1}");
    }

    #[tokio::test]
    async fn recomputed_headers_are_not_replayed() {
        let store = store();
        let headers = vec![
            ("Content-Length".to_string(), "12".to_string()),
            ("location".to_string(), "/v1/jobs/1".to_string()),
        ];
        store
            .put("user-1", KEY, "fp", 202, &headers, b"body")
            .await
            .expect("put");

        let entry = store
            .get("user-1", KEY)
            .await
            .expect("get")
            .expect("entry exists");
        assert_eq!(entry.headers.len(), 1);
        assert_eq!(entry.headers[0].0, "location");
    }

    #[tokio::test]
    async fn entries_are_scoped_per_owner() {
        let store = store();
        store
            .put("user-1", KEY, "fp", 202, &[], b"body")
            .await
            .expect("put");
        assert!(store.get("user-2", KEY).await.expect("get").is_none());
    }
}
