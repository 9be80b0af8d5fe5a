//! Control-plane services.
//!
//! Modules here coordinate shared state and external collaborators (the
//! key-value store, the document store, blob storage, moderation, the
//! restoration provider). Pure transforms live under `crate::pipeline`.

pub mod auth;
pub mod backoff;
pub mod blob;
pub mod context;
pub mod credits;
pub mod dead_letter;
pub mod idempotency;
pub mod kv;
pub mod moderation;
pub mod provider;
pub mod queue;
pub mod rate_limit;
pub mod records;
pub mod store;

pub use auth::{AuthenticatedUser, TokenVerifier};
pub use backoff::backoff_delay_ms;
pub use blob::{BlobError, BlobStore, FsBlobStore, ALLOWED_CONTENT_TYPES};
pub use context::{build_context, AppContext, LatencySampler};
pub use credits::{CreditDecision, CreditService, DebitKind, LedgerEntry, RefundOutcome};
pub use dead_letter::{DeadLetterEntry, DeadLetterService};
pub use idempotency::{validate_idempotency_key, IdempotencyStore};
pub use kv::{AtomicKv, MemoryKv, RedisKv};
pub use moderation::{moderate_fail_closed, ModerationClient, ModerationVerdict};
pub use provider::{ProviderReceipt, RestorationProvider, RestoredImage};
pub use queue::{QueuePolicy, QueueTask, TaskQueue, TerminalFailure};
pub use rate_limit::{RateLimitService, RateOutcome, RateSnapshot};
pub use records::{JobRecord, JobStatus, RecordStore, StageTimings};
pub use store::DocStore;
