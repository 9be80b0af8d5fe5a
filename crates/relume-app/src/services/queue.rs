//! Durable task queue with at-least-once delivery.
//!
//! Tasks are persisted before `enqueue` returns, leased to workers with a
//! visibility deadline, retried with jittered exponential backoff up to a
//! bounded attempt budget, and handed to a single terminal-failure consumer
//! when that budget is exhausted. A scheduler sweep redelivers tasks whose
//! lease expired without a heartbeat, preserving the attempt counter.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::services::backoff::{backoff_delay_ms, current_timestamp_ms};
use crate::services::records::DebitRecord;
use crate::services::store::{decode, encode, DocStore, DocStoreError};
use crate::trace::TraceContext;

/// Marker attached when an operator replays a dead-lettered task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayMarker {
    pub original_job_id: Uuid,
    pub dead_letter_id: String,
    pub previous_attempts: u32,
    pub reason: String,
}

/// Work handed to the restoration pipeline. Carries a blob reference only;
/// image bytes never travel through the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueTask {
    pub job_id: Uuid,
    pub owner: String,
    #[serde(default)]
    pub prompt: Option<String>,
    pub source_object: String,
    /// Sniffed format of the original upload, e.g. `jpeg`.
    pub source_format: String,
    #[serde(default)]
    pub moderation_flags: Vec<String>,
    #[serde(default)]
    pub classification_hints: Option<BTreeMap<String, f32>>,
    #[serde(default)]
    pub debit: Option<DebitRecord>,
    #[serde(default)]
    pub trace: TraceContext,
    #[serde(default)]
    pub replay: Option<ReplayMarker>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Leased,
    Completed,
    Failed,
}

/// Persisted task plus delivery bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: Uuid,
    pub task: QueueTask,
    pub state: TaskState,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub next_attempt_at_ms: i64,
    #[serde(default)]
    pub lease_deadline_ms: Option<i64>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub enqueued_at_ms: i64,
    pub updated_at_ms: i64,
    #[serde(default)]
    pub finished_at_ms: Option<i64>,
}

/// A claimed delivery. `attempt` is the 1-based ordinal of this delivery.
#[derive(Debug, Clone)]
pub struct LeasedTask {
    pub envelope: TaskEnvelope,
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying { next_attempt_at_ms: i64 },
    Exhausted,
    /// The envelope had already reached a terminal state; nothing changed.
    AlreadyTerminal,
}

/// Emitted once per task when the attempt budget is exhausted. Consumed by
/// the dead-letter writer alone.
#[derive(Debug, Clone)]
pub struct TerminalFailure {
    pub envelope: TaskEnvelope,
    pub error: String,
}

#[derive(Debug, Clone, Copy)]
pub struct QueuePolicy {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_jitter: f64,
    pub remove_on_complete: usize,
    pub remove_on_fail: usize,
    /// Visibility window: a leased task whose deadline passes without a
    /// heartbeat is redelivered.
    pub lease_ms: i64,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 1_000,
            backoff_jitter: 0.3,
            remove_on_complete: 100,
            remove_on_fail: 500,
            lease_ms: 10_000,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub leased: usize,
    pub completed: usize,
    pub failed: usize,
    pub oldest_queued_ms: Option<i64>,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] DocStoreError),
    #[error("task `{0}` not found")]
    NotFound(Uuid),
}

pub struct TaskQueue {
    docs: Arc<DocStore>,
    policy: QueuePolicy,
    notify: Notify,
    failures: mpsc::UnboundedSender<TerminalFailure>,
}

impl TaskQueue {
    /// Returns the queue and the terminal-failure stream. The receiver must
    /// be owned by exactly one consumer (the dead-letter writer).
    pub fn new(
        docs: Arc<DocStore>,
        policy: QueuePolicy,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TerminalFailure>) {
        debug_assert!(policy.max_attempts > 0);
        let (failures, failure_rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Self {
            docs,
            policy,
            notify: Notify::new(),
            failures,
        });
        (queue, failure_rx)
    }

    pub fn policy(&self) -> QueuePolicy {
        self.policy
    }

    /// Durable enqueue: the task is committed before this returns.
    pub fn enqueue(&self, task: QueueTask) -> Result<Uuid, QueueError> {
        self.enqueue_with(task, 0, self.policy.max_attempts)
    }

    /// Enqueue for replay: the attempt budget may be overridden and the
    /// previous attempt count is recorded on the marker, not the counter.
    pub fn enqueue_with(
        &self,
        task: QueueTask,
        attempts_made: u32,
        max_attempts: u32,
    ) -> Result<Uuid, QueueError> {
        debug_assert!(max_attempts > 0);
        let now_ms = current_timestamp_ms();
        let envelope = TaskEnvelope {
            task_id: Uuid::now_v7(),
            task,
            state: TaskState::Queued,
            attempts_made,
            max_attempts,
            next_attempt_at_ms: now_ms,
            lease_deadline_ms: None,
            last_error: None,
            enqueued_at_ms: now_ms,
            updated_at_ms: now_ms,
            finished_at_ms: None,
        };

        let mut wtxn = self.docs.write_txn()?;
        self.docs
            .tasks
            .put(&mut wtxn, &envelope.task_id.to_string(), &encode(&envelope)?).map_err(DocStoreError::from)?;
        wtxn.commit().map_err(DocStoreError::from)?;

        self.notify.notify_waiters();
        Ok(envelope.task_id)
    }

    /// Lease the oldest due task, if any. The lease must be refreshed with
    /// [`TaskQueue::heartbeat`] before its deadline or the scheduler will
    /// redeliver the task.
    pub fn claim(&self) -> Result<Option<LeasedTask>, QueueError> {
        let now_ms = current_timestamp_ms();
        let mut wtxn = self.docs.write_txn()?;

        let due = {
            let mut found = None;
            for entry in self.docs.tasks.iter(&wtxn).map_err(DocStoreError::from)? {
                let (_, raw) = entry.map_err(DocStoreError::from)?;
                let envelope: TaskEnvelope = decode(raw)?;
                if envelope.state == TaskState::Queued && envelope.next_attempt_at_ms <= now_ms {
                    found = Some(envelope);
                    break;
                }
            }
            found
        };

        let Some(mut envelope) = due else {
            return Ok(None);
        };
        envelope.state = TaskState::Leased;
        envelope.lease_deadline_ms = Some(now_ms + self.policy.lease_ms);
        envelope.updated_at_ms = now_ms;
        self.docs
            .tasks
            .put(&mut wtxn, &envelope.task_id.to_string(), &encode(&envelope)?).map_err(DocStoreError::from)?;
        wtxn.commit().map_err(DocStoreError::from)?;

        let attempt = envelope.attempts_made + 1;
        Ok(Some(LeasedTask { envelope, attempt }))
    }

    pub fn heartbeat(&self, task_id: Uuid) -> Result<(), QueueError> {
        let now_ms = current_timestamp_ms();
        self.update(task_id, |envelope| {
            if envelope.state == TaskState::Leased {
                envelope.lease_deadline_ms = Some(now_ms + self.policy.lease_ms);
                envelope.updated_at_ms = now_ms;
                true
            } else {
                false
            }
        })?;
        Ok(())
    }

    /// Acknowledge success. Idempotent under redelivery: acknowledging a task
    /// that already finished changes nothing.
    pub fn complete(&self, task_id: Uuid) -> Result<(), QueueError> {
        let now_ms = current_timestamp_ms();
        let changed = self.update(task_id, |envelope| {
            if matches!(envelope.state, TaskState::Completed | TaskState::Failed) {
                return false;
            }
            envelope.state = TaskState::Completed;
            envelope.lease_deadline_ms = None;
            envelope.finished_at_ms = Some(now_ms);
            envelope.updated_at_ms = now_ms;
            true
        })?;
        if changed {
            self.trim(TaskState::Completed, self.policy.remove_on_complete)?;
        }
        Ok(())
    }

    /// Report a delivery failure. Schedules a retry or, once the budget is
    /// spent, parks the task and emits the terminal-failure signal.
    pub fn fail(&self, task_id: Uuid, error: &str) -> Result<FailOutcome, QueueError> {
        let now_ms = current_timestamp_ms();
        let mut outcome = FailOutcome::AlreadyTerminal;
        let mut terminal: Option<TaskEnvelope> = None;

        self.update(task_id, |envelope| {
            if matches!(envelope.state, TaskState::Completed | TaskState::Failed) {
                return false;
            }
            envelope.attempts_made += 1;
            envelope.last_error = Some(error.to_string());
            envelope.lease_deadline_ms = None;
            envelope.updated_at_ms = now_ms;

            if envelope.attempts_made >= envelope.max_attempts {
                envelope.state = TaskState::Failed;
                envelope.finished_at_ms = Some(now_ms);
                outcome = FailOutcome::Exhausted;
                terminal = Some(envelope.clone());
            } else {
                let delay = backoff_delay_ms(
                    self.policy.backoff_base_ms,
                    envelope.attempts_made,
                    self.policy.backoff_jitter,
                ) as i64;
                envelope.state = TaskState::Queued;
                envelope.next_attempt_at_ms = now_ms + delay;
                outcome = FailOutcome::Retrying {
                    next_attempt_at_ms: envelope.next_attempt_at_ms,
                };
            }
            true
        })?;

        if let Some(envelope) = terminal {
            self.trim(TaskState::Failed, self.policy.remove_on_fail)?;
            let failure = TerminalFailure {
                envelope,
                error: error.to_string(),
            };
            if self.failures.send(failure).is_err() {
                tracing::error!(%task_id, "terminal failure emitted with no dead-letter consumer");
            }
        } else {
            self.notify.notify_waiters();
        }
        Ok(outcome)
    }

    /// Redeliver leased tasks whose deadline passed without a heartbeat. The
    /// attempt counter is preserved.
    pub fn recover_stalled(&self) -> Result<usize, QueueError> {
        let now_ms = current_timestamp_ms();
        let mut wtxn = self.docs.write_txn()?;

        let stalled: Vec<TaskEnvelope> = {
            let mut out = Vec::new();
            for entry in self.docs.tasks.iter(&wtxn).map_err(DocStoreError::from)? {
                let (_, raw) = entry.map_err(DocStoreError::from)?;
                let envelope: TaskEnvelope = decode(raw)?;
                if envelope.state == TaskState::Leased
                    && envelope.lease_deadline_ms.is_some_and(|at| at < now_ms)
                {
                    out.push(envelope);
                }
            }
            out
        };

        let recovered = stalled.len();
        for mut envelope in stalled {
            tracing::warn!(
                task_id = %envelope.task_id,
                job_id = %envelope.task.job_id,
                attempts = envelope.attempts_made,
                "redelivering stalled task"
            );
            envelope.state = TaskState::Queued;
            envelope.lease_deadline_ms = None;
            envelope.next_attempt_at_ms = now_ms;
            envelope.updated_at_ms = now_ms;
            self.docs
                .tasks
                .put(&mut wtxn, &envelope.task_id.to_string(), &encode(&envelope)?).map_err(DocStoreError::from)?;
        }
        wtxn.commit().map_err(DocStoreError::from)?;

        if recovered > 0 {
            self.notify.notify_waiters();
        }
        Ok(recovered)
    }

    pub fn get(&self, task_id: Uuid) -> Result<Option<TaskEnvelope>, QueueError> {
        let rtxn = self.docs.read_txn()?;
        let raw = self.docs.tasks.get(&rtxn, &task_id.to_string()).map_err(DocStoreError::from)?;
        raw.map(decode::<TaskEnvelope>)
            .transpose()
            .map_err(QueueError::from)
    }

    pub fn find_by_job(&self, job_id: Uuid) -> Result<Vec<TaskEnvelope>, QueueError> {
        let rtxn = self.docs.read_txn()?;
        let mut out = Vec::new();
        for entry in self.docs.tasks.iter(&rtxn).map_err(DocStoreError::from)? {
            let (_, raw) = entry.map_err(DocStoreError::from)?;
            let envelope: TaskEnvelope = decode(raw)?;
            if envelope.task.job_id == job_id {
                out.push(envelope);
            }
        }
        Ok(out)
    }

    pub fn stats(&self) -> Result<QueueStats, QueueError> {
        let rtxn = self.docs.read_txn()?;
        let mut stats = QueueStats::default();
        for entry in self.docs.tasks.iter(&rtxn).map_err(DocStoreError::from)? {
            let (_, raw) = entry.map_err(DocStoreError::from)?;
            let envelope: TaskEnvelope = decode(raw)?;
            match envelope.state {
                TaskState::Queued => {
                    stats.queued += 1;
                    stats.oldest_queued_ms = Some(match stats.oldest_queued_ms {
                        None => envelope.enqueued_at_ms,
                        Some(ts) => ts.min(envelope.enqueued_at_ms),
                    });
                }
                TaskState::Leased => stats.leased += 1,
                TaskState::Completed => stats.completed += 1,
                TaskState::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    /// Wait for new work. Paired with a poll interval by the worker loop so
    /// scheduled retries are picked up without a wakeup.
    pub async fn wait_for_work(&self) {
        self.notify.notified().await;
    }

    fn update<F>(&self, task_id: Uuid, apply: F) -> Result<bool, QueueError>
    where
        F: FnOnce(&mut TaskEnvelope) -> bool,
    {
        let key = task_id.to_string();
        let mut wtxn = self.docs.write_txn()?;
        let Some(raw) = self.docs.tasks.get(&wtxn, &key).map_err(DocStoreError::from)? else {
            return Err(QueueError::NotFound(task_id));
        };
        let mut envelope: TaskEnvelope = decode(raw)?;
        if !apply(&mut envelope) {
            return Ok(false);
        }
        self.docs.tasks.put(&mut wtxn, &key, &encode(&envelope)?).map_err(DocStoreError::from)?;
        wtxn.commit().map_err(DocStoreError::from)?;
        Ok(true)
    }

    /// Keep only the newest `keep` envelopes in the given terminal state.
    fn trim(&self, state: TaskState, keep: usize) -> Result<(), QueueError> {
        let mut wtxn = self.docs.write_txn()?;
        let mut finished: Vec<(i64, String)> = {
            let mut out = Vec::new();
            for entry in self.docs.tasks.iter(&wtxn).map_err(DocStoreError::from)? {
                let (key, raw) = entry.map_err(DocStoreError::from)?;
                let envelope: TaskEnvelope = decode(raw)?;
                if envelope.state == state {
                    out.push((envelope.finished_at_ms.unwrap_or(0), key.to_string()));
                }
            }
            out
        };
        if finished.len() <= keep {
            return Ok(());
        }
        finished.sort();
        let excess = finished.len() - keep;
        for (_, key) in finished.into_iter().take(excess) {
            self.docs.tasks.delete(&mut wtxn, &key).map_err(DocStoreError::from)?;
        }
        wtxn.commit().map_err(DocStoreError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn task(owner: &str) -> QueueTask {
        QueueTask {
            job_id: Uuid::now_v7(),
            owner: owner.to_string(),
            prompt: None,
            source_object: format!("{owner}/src.jpg"),
            source_format: "jpeg".to_string(),
            moderation_flags: Vec::new(),
            classification_hints: None,
            debit: None,
            trace: TraceContext::default(),
            replay: None,
        }
    }

    fn queue(
        policy: QueuePolicy,
    ) -> (TempDir, Arc<TaskQueue>, mpsc::UnboundedReceiver<TerminalFailure>) {
        let temp = TempDir::new().expect("temp dir");
        let docs = Arc::new(DocStore::open(temp.path()).expect("open store"));
        let (queue, failures) = TaskQueue::new(docs, policy);
        (temp, queue, failures)
    }

    #[tokio::test]
    async fn enqueue_then_claim_leases_fifo() {
        let (_temp, queue, _failures) = queue(QueuePolicy::default());
        let first = queue.enqueue(task("user-1")).expect("enqueue");
        let _second = queue.enqueue(task("user-2")).expect("enqueue");

        let lease = queue.claim().expect("claim").expect("task due");
        assert_eq!(lease.envelope.task_id, first);
        assert_eq!(lease.attempt, 1);
        assert_eq!(lease.envelope.state, TaskState::Leased);

        let lease2 = queue.claim().expect("claim").expect("second task due");
        assert_eq!(lease2.envelope.task.owner, "user-2");

        assert!(queue.claim().expect("claim").is_none());
    }

    #[tokio::test]
    async fn failed_task_is_rescheduled_with_backoff() {
        let policy = QueuePolicy {
            backoff_base_ms: 60_000,
            backoff_jitter: 0.0,
            ..QueuePolicy::default()
        };
        let (_temp, queue, _failures) = queue(policy);
        let task_id = queue.enqueue(task("user-1")).expect("enqueue");
        let lease = queue.claim().expect("claim").expect("task due");

        let before = current_timestamp_ms();
        let outcome = queue.fail(lease.envelope.task_id, "transient").expect("fail");
        let FailOutcome::Retrying { next_attempt_at_ms } = outcome else {
            panic!("expected retry scheduling");
        };
        assert!(next_attempt_at_ms >= before + 60_000);

        // Not due yet: nothing claimable.
        assert!(queue.claim().expect("claim").is_none());
        let envelope = queue.get(task_id).expect("get").expect("exists");
        assert_eq!(envelope.state, TaskState::Queued);
        assert_eq!(envelope.attempts_made, 1);
        assert_eq!(envelope.last_error.as_deref(), Some("transient"));
    }

    #[tokio::test]
    async fn exhausted_attempts_emit_terminal_failure() {
        let policy = QueuePolicy {
            max_attempts: 2,
            backoff_base_ms: 0,
            backoff_jitter: 0.0,
            ..QueuePolicy::default()
        };
        let (_temp, queue, mut failures) = queue(policy);
        queue.enqueue(task("user-1")).expect("enqueue");

        let lease = queue.claim().expect("claim").expect("due");
        assert!(matches!(
            queue.fail(lease.envelope.task_id, "boom 1").expect("fail"),
            FailOutcome::Retrying { .. }
        ));

        let lease = queue.claim().expect("claim").expect("due again");
        assert_eq!(lease.attempt, 2);
        assert_eq!(
            queue.fail(lease.envelope.task_id, "boom 2").expect("fail"),
            FailOutcome::Exhausted
        );

        let failure = failures.try_recv().expect("terminal failure emitted");
        assert_eq!(failure.error, "boom 2");
        assert_eq!(failure.envelope.attempts_made, 2);
        assert_eq!(failure.envelope.state, TaskState::Failed);

        // Terminal is sticky.
        assert_eq!(
            queue.fail(lease.envelope.task_id, "late").expect("fail"),
            FailOutcome::AlreadyTerminal
        );
    }

    #[tokio::test]
    async fn stalled_lease_is_redelivered_with_attempts_preserved() {
        let policy = QueuePolicy {
            lease_ms: -1, // expire immediately
            ..QueuePolicy::default()
        };
        let (_temp, queue, _failures) = queue(policy);
        queue.enqueue(task("user-1")).expect("enqueue");
        let lease = queue.claim().expect("claim").expect("due");
        assert_eq!(lease.envelope.attempts_made, 0);

        let recovered = queue.recover_stalled().expect("recover");
        assert_eq!(recovered, 1);

        let lease = queue.claim().expect("claim").expect("redelivered");
        assert_eq!(lease.envelope.attempts_made, 0, "attempt counter preserved");
        assert_eq!(lease.attempt, 1);
    }

    #[tokio::test]
    async fn completed_tasks_are_trimmed_to_retention() {
        let policy = QueuePolicy {
            remove_on_complete: 2,
            ..QueuePolicy::default()
        };
        let (_temp, queue, _failures) = queue(policy);
        for _ in 0..3 {
            let id = queue.enqueue(task("user-1")).expect("enqueue");
            let lease = queue.claim().expect("claim").expect("due");
            assert_eq!(lease.envelope.task_id, id);
            queue.complete(id).expect("complete");
        }

        let stats = queue.stats().expect("stats");
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.queued, 0);
    }

    #[tokio::test]
    async fn complete_is_idempotent_under_redelivery() {
        let (_temp, queue, _failures) = queue(QueuePolicy::default());
        let id = queue.enqueue(task("user-1")).expect("enqueue");
        queue.claim().expect("claim").expect("due");
        queue.complete(id).expect("complete");
        queue.complete(id).expect("second complete is a no-op");
        assert_eq!(
            queue.fail(id, "late failure").expect("fail"),
            FailOutcome::AlreadyTerminal
        );
    }
}
