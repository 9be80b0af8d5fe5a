//! Job record lifecycle.
//!
//! The record is owned by the control plane: admission creates it, workers
//! advance it through merge-writes, and nothing ever transitions out of a
//! terminal status. Every applied write is broadcast for the SSE surface.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::services::backoff::current_timestamp_ms;
use crate::services::credits::DebitKind;
use crate::services::moderation::ModerationVerdict;
use crate::services::provider::ProviderReceipt;
use crate::services::store::{decode, encode, DocStore, DocStoreError};

const CHANGE_CHANNEL_CAPACITY: usize = 256;
const ERROR_MESSAGE_LIMIT: usize = 300;

/// Lifecycle state of a restoration job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// Wall-clock spent in each worker stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTimings {
    pub classify_ms: u64,
    pub prompt_ms: u64,
    pub restore_ms: u64,
    pub total_ms: u64,
}

/// Credit debit recorded at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebitRecord {
    pub amount: i64,
    pub kind: DebitKind,
}

/// Terminal failure attached to a failed record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub owner: String,
    pub status: JobStatus,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    #[serde(default)]
    pub started_at_ms: Option<i64>,
    #[serde(default)]
    pub attempts_made: u32,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub preprocess_ops: Vec<String>,
    #[serde(default)]
    pub moderation: Option<ModerationVerdict>,
    #[serde(default)]
    pub debit: Option<DebitRecord>,
    #[serde(default)]
    pub classification: Option<BTreeMap<String, f32>>,
    #[serde(default)]
    pub enhanced_prompt: Option<String>,
    #[serde(default)]
    pub timings: Option<StageTimings>,
    #[serde(default)]
    pub provider: Option<ProviderReceipt>,
    #[serde(default)]
    pub result_object: Option<String>,
    #[serde(default)]
    pub error: Option<JobError>,
}

impl JobRecord {
    pub fn new(id: Uuid, owner: impl Into<String>) -> Self {
        let now_ms = current_timestamp_ms();
        Self {
            id,
            owner: owner.into(),
            status: JobStatus::Queued,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            started_at_ms: None,
            attempts_made: 0,
            prompt: None,
            preprocess_ops: Vec::new(),
            moderation: None,
            debit: None,
            classification: None,
            enhanced_prompt: None,
            timings: None,
            provider: None,
            result_object: None,
            error: None,
        }
    }
}

/// Fields merged into the record when the pipeline completes.
#[derive(Debug, Clone)]
pub struct SuccessFields {
    pub timings: StageTimings,
    pub classification: BTreeMap<String, f32>,
    pub enhanced_prompt: String,
    pub provider: ProviderReceipt,
    pub result_object: String,
}

/// Result of a guarded merge-write.
#[derive(Debug, Clone)]
pub enum MarkOutcome {
    Applied(JobRecord),
    /// The record already reached a terminal status; nothing was written.
    AlreadyTerminal(JobRecord),
    NotFound,
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error(transparent)]
    Store(#[from] DocStoreError),
    #[error("job record `{0}` already exists")]
    Duplicate(Uuid),
}

pub struct RecordStore {
    docs: Arc<DocStore>,
    changes: broadcast::Sender<JobRecord>,
}

impl RecordStore {
    pub fn new(docs: Arc<DocStore>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { docs, changes }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobRecord> {
        self.changes.subscribe()
    }

    pub fn create(&self, record: &JobRecord) -> Result<(), RecordError> {
        debug_assert!(record.status == JobStatus::Queued);
        let key = record.id.to_string();
        let mut wtxn = self.docs.write_txn()?;
        if self.docs.jobs.get(&wtxn, &key).map_err(DocStoreError::from)?.is_some() {
            return Err(RecordError::Duplicate(record.id));
        }
        self.docs.jobs.put(&mut wtxn, &key, &encode(record)?).map_err(DocStoreError::from)?;
        wtxn.commit().map_err(DocStoreError::from)?;
        self.publish(record);
        Ok(())
    }

    pub fn get(&self, id: &Uuid) -> Result<Option<JobRecord>, RecordError> {
        let rtxn = self.docs.read_txn()?;
        let raw = self.docs.jobs.get(&rtxn, &id.to_string()).map_err(DocStoreError::from)?;
        raw.map(decode::<JobRecord>)
            .transpose()
            .map_err(RecordError::from)
    }

    /// Worker accepted the task. Merges status, start time, and the current
    /// attempt ordinal; a terminal record is left untouched.
    pub fn mark_running(&self, id: &Uuid, attempt: u32) -> Result<MarkOutcome, RecordError> {
        self.merge(id, |record| {
            record.status = JobStatus::Running;
            record.started_at_ms.get_or_insert(current_timestamp_ms());
            record.attempts_made = attempt;
        })
    }

    pub fn mark_succeeded(
        &self,
        id: &Uuid,
        fields: SuccessFields,
    ) -> Result<MarkOutcome, RecordError> {
        self.merge(id, move |record| {
            record.status = JobStatus::Succeeded;
            record.timings = Some(fields.timings);
            record.classification = Some(fields.classification.clone());
            record.enhanced_prompt = Some(fields.enhanced_prompt.clone());
            record.provider = Some(fields.provider.clone());
            record.result_object = Some(fields.result_object.clone());
            record.error = None;
        })
    }

    pub fn mark_failed(
        &self,
        id: &Uuid,
        kind: &str,
        message: &str,
    ) -> Result<MarkOutcome, RecordError> {
        let error = JobError {
            kind: kind.to_string(),
            message: truncate_message(message, ERROR_MESSAGE_LIMIT),
        };
        self.merge(id, move |record| {
            record.status = JobStatus::Failed;
            record.error = Some(error.clone());
            record.result_object = None;
        })
    }

    fn merge<F>(&self, id: &Uuid, apply: F) -> Result<MarkOutcome, RecordError>
    where
        F: Fn(&mut JobRecord),
    {
        let key = id.to_string();
        let mut wtxn = self.docs.write_txn()?;
        let Some(raw) = self.docs.jobs.get(&wtxn, &key).map_err(DocStoreError::from)? else {
            return Ok(MarkOutcome::NotFound);
        };
        let mut record: JobRecord = decode(raw)?;
        if record.status.is_terminal() {
            return Ok(MarkOutcome::AlreadyTerminal(record));
        }
        apply(&mut record);
        record.updated_at_ms = current_timestamp_ms();
        self.docs.jobs.put(&mut wtxn, &key, &encode(&record)?).map_err(DocStoreError::from)?;
        wtxn.commit().map_err(DocStoreError::from)?;
        self.publish(&record);
        Ok(MarkOutcome::Applied(record))
    }

    fn publish(&self, record: &JobRecord) {
        // Nobody listening is fine; the stream surface subscribes lazily.
        let _ = self.changes.send(record.clone());
    }
}

pub fn truncate_message(message: &str, limit: usize) -> String {
    if message.len() <= limit {
        return message.to_string();
    }
    let mut cut = limit;
    while !message.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &message[..cut])
}
