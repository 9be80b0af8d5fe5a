//! Content moderation with a fail-closed policy.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::services::backoff::current_timestamp_ms;
use crate::services::store::{decode, encode, DocStore, DocStoreError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationVerdict {
    pub allowed: bool,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub rejection: Option<String>,
}

impl ModerationVerdict {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            flags: Vec::new(),
            rejection: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ModerationError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("moderation service returned {status}: {body}")]
    Status { status: u16, body: String },
}

#[async_trait]
pub trait ModerationClient: Send + Sync {
    async fn moderate(
        &self,
        image: &[u8],
        context: &str,
    ) -> Result<ModerationVerdict, ModerationError>;
}

/// Development implementation: everything passes.
pub struct PermissiveModeration;

#[async_trait]
impl ModerationClient for PermissiveModeration {
    async fn moderate(
        &self,
        _image: &[u8],
        _context: &str,
    ) -> Result<ModerationVerdict, ModerationError> {
        Ok(ModerationVerdict::allowed())
    }
}

pub struct HttpModerationClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct ModerationRequest<'a> {
    image: String,
    context: &'a str,
}

impl HttpModerationClient {
    pub fn new(endpoint: String, api_key: Option<String>) -> Result<Self, ModerationError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(20))
            .build()?;
        Ok(Self {
            http,
            endpoint,
            api_key,
        })
    }
}

#[async_trait]
impl ModerationClient for HttpModerationClient {
    async fn moderate(
        &self,
        image: &[u8],
        context: &str,
    ) -> Result<ModerationVerdict, ModerationError> {
        let body = ModerationRequest {
            image: BASE64_STANDARD.encode(image),
            context,
        };
        let mut request = self.http.post(&self.endpoint).json(&body);
        if let Some(key) = self.api_key.as_deref() {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModerationError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<ModerationVerdict>().await?)
    }
}

/// Audit row appended for every rejected submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationAudit {
    pub id: Uuid,
    pub owner: String,
    pub allowed: bool,
    pub flags: Vec<String>,
    #[serde(default)]
    pub rejection: Option<String>,
    pub created_at_ms: i64,
}

pub fn append_audit(
    docs: &DocStore,
    owner: &str,
    verdict: &ModerationVerdict,
) -> Result<(), DocStoreError> {
    let audit = ModerationAudit {
        id: Uuid::now_v7(),
        owner: owner.to_string(),
        allowed: verdict.allowed,
        flags: verdict.flags.clone(),
        rejection: verdict.rejection.clone(),
        created_at_ms: current_timestamp_ms(),
    };
    let mut wtxn = docs.write_txn()?;
    docs.moderation_audit
        .put(&mut wtxn, &audit.id.to_string(), &encode(&audit)?)?;
    wtxn.commit()?;
    Ok(())
}

pub fn list_audits(docs: &DocStore) -> Result<Vec<ModerationAudit>, DocStoreError> {
    let rtxn = docs.read_txn()?;
    let mut out = Vec::new();
    for entry in docs.moderation_audit.iter(&rtxn)? {
        let (_, raw) = entry?;
        out.push(decode::<ModerationAudit>(raw)?);
    }
    Ok(out)
}

/// Fail-closed wrapper: a moderation outage rejects the submission instead
/// of silently admitting unmoderated content.
pub async fn moderate_fail_closed(
    client: &dyn ModerationClient,
    image: &[u8],
    context: &str,
) -> ModerationVerdict {
    match client.moderate(image, context).await {
        Ok(verdict) => verdict,
        Err(error) => {
            tracing::warn!(%error, "moderation unavailable; rejecting submission");
            ModerationVerdict {
                allowed: false,
                flags: vec!["moderation-unavailable".to_string()],
                rejection: Some("content could not be verified".to_string()),
            }
        }
    }
}
