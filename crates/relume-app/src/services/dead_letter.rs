//! Dead-letter archive and operator replay.
//!
//! The writer is the single consumer of the queue's terminal-failure channel:
//! it marks the job record failed, refunds the recorded debit, and archives
//! the task under a key derived from the job id. Replay re-enqueues the
//! archived payload with a marker and never re-debits.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::services::backoff::current_timestamp_ms;
use crate::services::credits::{CreditError, CreditService};
use crate::services::queue::{QueueError, QueueTask, ReplayMarker, TaskQueue, TerminalFailure};
use crate::services::records::{truncate_message, RecordError, RecordStore};
use crate::services::store::{decode, encode, DocStore, DocStoreError};

const DEFAULT_RETENTION_MS: i64 = 30 * 24 * 3_600_000;
const DL_MESSAGE_LIMIT: usize = 1_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Predictable id (`dl:{job_id}`), so re-dead-lettering a replayed job
    /// overwrites rather than duplicates.
    pub id: String,
    pub task: QueueTask,
    pub error_kind: String,
    pub error_message: String,
    pub attempts_made: u32,
    pub failed_at_ms: i64,
    pub owner: String,
    pub expires_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayAudit {
    pub id: Uuid,
    pub dead_letter_id: String,
    pub job_id: Uuid,
    pub new_task_id: Uuid,
    pub actor: String,
    pub reason: String,
    pub replayed_at_ms: i64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct DeadLetterStats {
    pub total: usize,
    pub expired: usize,
    pub by_owner: BTreeMap<String, usize>,
    pub oldest_failed_at_ms: Option<i64>,
}

#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error(transparent)]
    Store(#[from] DocStoreError),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Credit(#[from] CreditError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("dead-letter entry `{0}` not found")]
    NotFound(String),
    #[error("job `{0}` already succeeded; refusing replay")]
    JobSucceeded(Uuid),
}

pub struct DeadLetterService {
    docs: Arc<DocStore>,
    records: Arc<RecordStore>,
    credits: Arc<CreditService>,
    queue: Arc<TaskQueue>,
    retention_ms: i64,
}

pub fn dead_letter_id(job_id: Uuid) -> String {
    format!("dl:{job_id}")
}

impl DeadLetterService {
    pub fn new(
        docs: Arc<DocStore>,
        records: Arc<RecordStore>,
        credits: Arc<CreditService>,
        queue: Arc<TaskQueue>,
    ) -> Self {
        Self {
            docs,
            records,
            credits,
            queue,
            retention_ms: DEFAULT_RETENTION_MS,
        }
    }

    #[cfg(test)]
    fn with_retention_ms(mut self, retention_ms: i64) -> Self {
        self.retention_ms = retention_ms;
        self
    }

    /// Terminal-failure handler: fail the record, refund, archive.
    pub async fn handle_failure(&self, failure: TerminalFailure) -> Result<(), DeadLetterError> {
        let envelope = failure.envelope;
        let task = envelope.task.clone();
        let (kind, message) = split_error(&failure.error);

        tracing::error!(
            job_id = %task.job_id,
            owner = %task.owner,
            attempts = envelope.attempts_made,
            error = %failure.error,
            "task exhausted its attempt budget; dead-lettering"
        );

        self.records.mark_failed(&task.job_id, kind, message)?;
        self.credits
            .refund(&task.owner, task.job_id, "restoration failed")
            .await?;

        let now_ms = current_timestamp_ms();
        let entry = DeadLetterEntry {
            id: dead_letter_id(task.job_id),
            owner: task.owner.clone(),
            task,
            error_kind: kind.to_string(),
            error_message: truncate_message(message, DL_MESSAGE_LIMIT),
            attempts_made: envelope.attempts_made,
            failed_at_ms: now_ms,
            expires_at_ms: now_ms + self.retention_ms,
        };

        let mut wtxn = self.docs.write_txn()?;
        self.docs
            .dead_letter
            .put(&mut wtxn, &entry.id, &encode(&entry)?).map_err(DocStoreError::from)?;
        wtxn.commit().map_err(DocStoreError::from)?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<DeadLetterEntry>, DeadLetterError> {
        let rtxn = self.docs.read_txn()?;
        let raw = self.docs.dead_letter.get(&rtxn, id).map_err(DocStoreError::from)?;
        raw.map(decode::<DeadLetterEntry>)
            .transpose()
            .map_err(DeadLetterError::from)
    }

    pub fn list(&self) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        let rtxn = self.docs.read_txn()?;
        let mut out = Vec::new();
        for entry in self.docs.dead_letter.iter(&rtxn).map_err(DocStoreError::from)? {
            let (_, raw) = entry.map_err(DocStoreError::from)?;
            out.push(decode::<DeadLetterEntry>(raw)?);
        }
        out.sort_by_key(|entry| entry.failed_at_ms);
        Ok(out)
    }

    pub fn stats(&self) -> Result<DeadLetterStats, DeadLetterError> {
        let now_ms = current_timestamp_ms();
        let mut stats = DeadLetterStats::default();
        for entry in self.list()? {
            stats.total += 1;
            if entry.expires_at_ms <= now_ms {
                stats.expired += 1;
            }
            *stats.by_owner.entry(entry.owner.clone()).or_default() += 1;
            stats.oldest_failed_at_ms = Some(match stats.oldest_failed_at_ms {
                None => entry.failed_at_ms,
                Some(ts) => ts.min(entry.failed_at_ms),
            });
        }
        Ok(stats)
    }

    /// Re-enqueue a dead-lettered task.
    ///
    /// Refuses when the job already succeeded. Credits are never re-debited:
    /// the dead-letter writer already refunded the original debit, which the
    /// replayed task's marker makes auditable. The archive entry is removed
    /// only after the new task is durably enqueued.
    pub async fn replay(
        &self,
        id: &str,
        actor: &str,
        reason: &str,
        max_attempts_override: Option<u32>,
    ) -> Result<ReplayAudit, DeadLetterError> {
        let entry = self.get(id)?.ok_or_else(|| DeadLetterError::NotFound(id.to_string()))?;
        let job_id = entry.task.job_id;

        if let Some(record) = self.records.get(&job_id)? {
            if record.status == crate::services::records::JobStatus::Succeeded {
                return Err(DeadLetterError::JobSucceeded(job_id));
            }
        }

        if self.credits.debit_refunded(job_id)? == Some(false) {
            tracing::warn!(%job_id, "replaying a job whose debit was never refunded");
        }

        let mut task = entry.task.clone();
        task.replay = Some(ReplayMarker {
            original_job_id: job_id,
            dead_letter_id: entry.id.clone(),
            previous_attempts: entry.attempts_made,
            reason: reason.to_string(),
        });
        let max_attempts = max_attempts_override.unwrap_or(self.queue.policy().max_attempts);
        let new_task_id = self.queue.enqueue_with(task, 0, max_attempts)?;

        let mut wtxn = self.docs.write_txn()?;
        self.docs.dead_letter.delete(&mut wtxn, &entry.id).map_err(DocStoreError::from)?;
        let audit = ReplayAudit {
            id: Uuid::now_v7(),
            dead_letter_id: entry.id.clone(),
            job_id,
            new_task_id,
            actor: actor.to_string(),
            reason: reason.to_string(),
            replayed_at_ms: current_timestamp_ms(),
        };
        self.docs
            .replay_audit
            .put(&mut wtxn, &audit.id.to_string(), &encode(&audit)?).map_err(DocStoreError::from)?;
        wtxn.commit().map_err(DocStoreError::from)?;

        tracing::info!(%job_id, dead_letter_id = %audit.dead_letter_id, %actor, "dead-letter replayed");
        Ok(audit)
    }

    pub async fn replay_all(
        &self,
        actor: &str,
        reason: &str,
    ) -> Result<Vec<ReplayAudit>, DeadLetterError> {
        let mut audits = Vec::new();
        for entry in self.list()? {
            match self.replay(&entry.id, actor, reason, None).await {
                Ok(audit) => audits.push(audit),
                Err(DeadLetterError::JobSucceeded(job_id)) => {
                    tracing::warn!(%job_id, "skipping replay of succeeded job");
                }
                Err(error) => return Err(error),
            }
        }
        Ok(audits)
    }

    pub async fn replay_user(
        &self,
        owner: &str,
        actor: &str,
        reason: &str,
    ) -> Result<Vec<ReplayAudit>, DeadLetterError> {
        let mut audits = Vec::new();
        for entry in self.list()? {
            if entry.owner != owner {
                continue;
            }
            match self.replay(&entry.id, actor, reason, None).await {
                Ok(audit) => audits.push(audit),
                Err(DeadLetterError::JobSucceeded(job_id)) => {
                    tracing::warn!(%job_id, "skipping replay of succeeded job");
                }
                Err(error) => return Err(error),
            }
        }
        Ok(audits)
    }

    /// Drop entries past their retention window. Returns how many were removed.
    pub fn cleanup(&self) -> Result<usize, DeadLetterError> {
        let now_ms = current_timestamp_ms();
        let mut wtxn = self.docs.write_txn()?;
        let expired: Vec<String> = {
            let mut out = Vec::new();
            for entry in self.docs.dead_letter.iter(&wtxn).map_err(DocStoreError::from)? {
                let (key, raw) = entry.map_err(DocStoreError::from)?;
                let entry: DeadLetterEntry = decode(raw)?;
                if entry.expires_at_ms <= now_ms {
                    out.push(key.to_string());
                }
            }
            out
        };
        for key in &expired {
            self.docs.dead_letter.delete(&mut wtxn, key).map_err(DocStoreError::from)?;
        }
        wtxn.commit().map_err(DocStoreError::from)?;
        Ok(expired.len())
    }

    pub fn audits(&self) -> Result<Vec<ReplayAudit>, DeadLetterError> {
        let rtxn = self.docs.read_txn()?;
        let mut out = Vec::new();
        for entry in self.docs.replay_audit.iter(&rtxn).map_err(DocStoreError::from)? {
            let (_, raw) = entry.map_err(DocStoreError::from)?;
            out.push(decode::<ReplayAudit>(raw)?);
        }
        Ok(out)
    }
}

/// Run the single dead-letter consumer until the queue side closes.
pub async fn run_writer(
    service: Arc<DeadLetterService>,
    mut failures: mpsc::UnboundedReceiver<TerminalFailure>,
) {
    while let Some(failure) = failures.recv().await {
        let job_id = failure.envelope.task.job_id;
        if let Err(error) = service.handle_failure(failure).await {
            tracing::error!(%job_id, %error, "dead-letter write failed");
        }
    }
}

fn split_error(error: &str) -> (&str, &str) {
    match error.split_once(": ") {
        Some((kind, message)) if !kind.is_empty() && !kind.contains(' ') => (kind, message),
        _ => ("task-failed", error),
    }
}
