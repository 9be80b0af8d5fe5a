//! Application-level error type shared across binaries and services.

use thiserror::Error;

use crate::config::AppConfigError;
use crate::pipeline::preprocess::PreprocessError;
use crate::server::ServerError;
use crate::services::auth::AuthError;
use crate::services::blob::BlobError;
use crate::services::credits::CreditError;
use crate::services::dead_letter::DeadLetterError;
use crate::services::idempotency::IdempotencyError;
use crate::services::kv::KvError;
use crate::services::moderation::ModerationError;
use crate::services::provider::ProviderError;
use crate::services::queue::QueueError;
use crate::services::records::RecordError;
use crate::services::store::DocStoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] AppConfigError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error(transparent)]
    Store(#[from] DocStoreError),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Credit(#[from] CreditError),
    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),
    #[error(transparent)]
    DeadLetter(#[from] DeadLetterError),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    Moderation(#[from] ModerationError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
