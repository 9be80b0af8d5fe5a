//! Token verification seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub user_id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub verified: bool,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credential")]
    InvalidCredential,
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("verifier returned status {0}")]
    Status(u16),
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, bearer: &str) -> Result<AuthenticatedUser, AuthError>;
}

/// Development verifier: accepts `dev-user-<id>` tokens and nothing else.
pub struct DevTokenVerifier;

#[async_trait]
impl TokenVerifier for DevTokenVerifier {
    async fn verify(&self, bearer: &str) -> Result<AuthenticatedUser, AuthError> {
        let id = bearer
            .strip_prefix("dev-user-")
            .filter(|suffix| !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
        match id {
            Some(_) => Ok(AuthenticatedUser {
                user_id: bearer.to_string(),
                email: None,
                verified: true,
            }),
            None => Err(AuthError::InvalidCredential),
        }
    }
}

/// Production verifier: posts the bearer to the configured identity endpoint.
pub struct HttpTokenVerifier {
    http: reqwest::Client,
    endpoint: String,
}

#[derive(Serialize)]
struct VerifyRequest<'a> {
    token: &'a str,
}

impl HttpTokenVerifier {
    pub fn new(endpoint: String) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self { http, endpoint })
    }
}

#[async_trait]
impl TokenVerifier for HttpTokenVerifier {
    async fn verify(&self, bearer: &str) -> Result<AuthenticatedUser, AuthError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&VerifyRequest { token: bearer })
            .send()
            .await?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(AuthError::InvalidCredential);
        }
        if !status.is_success() {
            return Err(AuthError::Status(status.as_u16()));
        }
        let user = response.json::<AuthenticatedUser>().await?;
        if user.user_id.is_empty() {
            return Err(AuthError::InvalidCredential);
        }
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dev_verifier_accepts_dev_tokens_only() {
        let verifier = DevTokenVerifier;
        let user = verifier.verify("dev-user-42").await.expect("accepted");
        assert_eq!(user.user_id, "dev-user-42");
        assert!(user.verified);

        assert!(verifier.verify("dev-user-").await.is_err());
        assert!(verifier.verify("user-42").await.is_err());
        assert!(verifier.verify("").await.is_err());
    }
}
