//! Blob storage abstraction.
//!
//! The control plane never serves image bytes itself; it mints time-limited
//! signed URLs that the external blob front validates, and reads/writes
//! objects through this narrow contract. Object names are owner-prefixed and
//! ownership is enforced on every operation.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::services::kv::now_unix;

pub const ALLOWED_CONTENT_TYPES: [&str; 3] = ["image/jpeg", "image/png", "image/webp"];

#[derive(Debug, Clone)]
pub struct UploadTarget {
    pub upload_url: String,
    pub object_name: String,
    pub expires_at_unix: u64,
    pub content_type: String,
}

#[derive(Debug, Clone)]
pub struct DownloadTarget {
    pub download_url: String,
    pub expires_at_unix: u64,
}

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("object not found")]
    NotFound,
    #[error("unsupported content type `{0}`")]
    UnsupportedContentType(String),
    #[error("invalid object name `{0}`")]
    InvalidObjectName(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Mint a signed upload URL for a fresh object owned by `owner`.
    async fn issue_upload_url(
        &self,
        owner: &str,
        content_type: &str,
    ) -> Result<UploadTarget, BlobError>;

    /// Mint a signed download URL with a filename disposition hint.
    async fn issue_download_url(
        &self,
        owner: &str,
        object_name: &str,
        filename: &str,
    ) -> Result<DownloadTarget, BlobError>;

    /// Fetch an object owned by `owner`. Foreign objects read as missing.
    async fn download(&self, owner: &str, object_name: &str) -> Result<Vec<u8>, BlobError>;

    /// Durably store an object owned by `owner`.
    async fn put(&self, owner: &str, object_name: &str, bytes: &[u8]) -> Result<(), BlobError>;

    /// Readiness probe; the default assumes the backend is healthy.
    async fn healthy(&self) -> Result<(), BlobError> {
        Ok(())
    }
}

/// Filesystem-backed store for single-node deployments and tests. Signed
/// URLs carry a keyed blake3 token over `(operation, object, expiry)`.
pub struct FsBlobStore {
    root: PathBuf,
    public_base_url: String,
    signing_key: [u8; 32],
    upload_ttl_secs: u64,
    download_ttl_secs: u64,
}

impl FsBlobStore {
    pub fn new(
        root: PathBuf,
        public_base_url: String,
        signing_key: [u8; 32],
        upload_ttl_secs: u64,
        download_ttl_secs: u64,
    ) -> Result<Self, BlobError> {
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            signing_key,
            upload_ttl_secs,
            download_ttl_secs,
        })
    }

    pub fn object_name_for(owner: &str, suffix: &str, extension: &str) -> String {
        format!("{owner}/{}-{suffix}.{extension}", Uuid::now_v7())
    }

    fn sign(&self, operation: &str, object_name: &str, expires: u64) -> String {
        let payload = format!("{operation}\n{object_name}\n{expires}");
        blake3::keyed_hash(&self.signing_key, payload.as_bytes())
            .to_hex()
            .to_string()
    }

    /// Token check used by the blob front when it serves a signed URL.
    pub fn verify(&self, operation: &str, object_name: &str, expires: u64, sig: &str) -> bool {
        expires > now_unix() && self.sign(operation, object_name, expires) == sig
    }

    fn signed_url(&self, operation: &str, object_name: &str, expires: u64) -> String {
        let sig = self.sign(operation, object_name, expires);
        format!(
            "{}/blobs/{object_name}?op={operation}&expires={expires}&sig={sig}",
            self.public_base_url
        )
    }

    fn object_path(&self, owner: &str, object_name: &str) -> Result<PathBuf, BlobError> {
        validate_object_name(owner, object_name)?;
        Ok(self.root.join(object_name))
    }

    pub fn probe(&self) -> Result<(), BlobError> {
        if self.root.is_dir() {
            Ok(())
        } else {
            Err(BlobError::NotFound)
        }
    }
}

fn extension_for(content_type: &str) -> Option<&'static str> {
    match content_type {
        "image/jpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        _ => None,
    }
}

/// Owner scoping plus path-traversal hygiene.
fn validate_object_name(owner: &str, object_name: &str) -> Result<(), BlobError> {
    debug_assert!(!owner.is_empty());
    let Some(rest) = object_name.strip_prefix(owner) else {
        return Err(BlobError::NotFound);
    };
    if !rest.starts_with('/') || rest.len() <= 1 {
        return Err(BlobError::NotFound);
    }
    let path = Path::new(object_name);
    let clean = path
        .components()
        .all(|part| matches!(part, Component::Normal(_)));
    if !clean {
        return Err(BlobError::InvalidObjectName(object_name.to_string()));
    }
    Ok(())
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn issue_upload_url(
        &self,
        owner: &str,
        content_type: &str,
    ) -> Result<UploadTarget, BlobError> {
        let Some(extension) = extension_for(content_type) else {
            return Err(BlobError::UnsupportedContentType(content_type.to_string()));
        };
        let object_name = Self::object_name_for(owner, "orig", extension);
        let expires = now_unix() + self.upload_ttl_secs;
        Ok(UploadTarget {
            upload_url: self.signed_url("put", &object_name, expires),
            object_name,
            expires_at_unix: expires,
            content_type: content_type.to_string(),
        })
    }

    async fn issue_download_url(
        &self,
        owner: &str,
        object_name: &str,
        filename: &str,
    ) -> Result<DownloadTarget, BlobError> {
        validate_object_name(owner, object_name)?;
        let expires = now_unix() + self.download_ttl_secs;
        let mut url = self.signed_url("get", object_name, expires);
        if !filename.is_empty() {
            url.push_str("&filename=");
            url.push_str(filename);
        }
        Ok(DownloadTarget {
            download_url: url,
            expires_at_unix: expires,
        })
    }

    async fn download(&self, owner: &str, object_name: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.object_path(owner, object_name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Err(BlobError::NotFound),
            Err(error) => Err(BlobError::Io(error)),
        }
    }

    async fn put(&self, owner: &str, object_name: &str, bytes: &[u8]) -> Result<(), BlobError> {
        let path = self.object_path(owner, object_name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write-then-rename so a crash never leaves a torn object.
        let staging = path.with_extension("tmp");
        tokio::fs::write(&staging, bytes).await?;
        tokio::fs::rename(&staging, &path).await?;
        Ok(())
    }

    async fn healthy(&self) -> Result<(), BlobError> {
        self.probe()
    }
}

/// Boxed handle used across the application.
pub type DynBlobStore = Arc<dyn BlobStore>;
