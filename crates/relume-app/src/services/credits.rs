//! Credit accounting: free-tier daily counter, paid balance, append-only
//! ledger, and compensating refunds.
//!
//! The counters live in the shared key-value store and are only touched
//! through its atomic scripts. The ledger lives in the document store; the
//! transaction that appends a refund also marks the original debit refunded,
//! so a given debit can be compensated at most once.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::services::backoff::current_timestamp_ms;
use crate::services::kv::{AtomicKv, KvError};
use crate::services::store::{decode, encode, DocStore, DocStoreError};

const FREE_COUNTER_TTL_SECS: u64 = 86_400;
const FREE_SLOT_COST: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebitKind {
    Free,
    Paid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    Free,
    Paid,
    Refund,
    Purchase,
}

/// One append-only audit row. Negative amounts are debits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub owner: String,
    pub job_id: Option<Uuid>,
    pub amount: i64,
    pub kind: LedgerKind,
    pub reason: String,
    pub created_at_ms: i64,
    /// For refunds: the ledger id of the debit being compensated.
    #[serde(default)]
    pub refunds: Option<Uuid>,
}

/// Per-job pointer to the newest debit, with the refunded marker that makes
/// the compound refund exactly-once with respect to the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DebitRef {
    entry_id: Uuid,
    amount: i64,
    kind: DebitKind,
    counter_key: String,
    refunded: bool,
}

/// Durable mirror of the authoritative KV balance, advisory only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub owner: String,
    pub paid_balance: i64,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct CreditPolicy {
    pub daily_free_limit: u32,
    pub job_cost: i64,
}

/// Result of `check_and_deduct`.
#[derive(Debug, Clone, Copy)]
pub struct CreditDecision {
    pub allowed: bool,
    pub kind: Option<DebitKind>,
    pub amount: i64,
    /// Remaining free slots today plus the paid balance.
    pub remaining: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundOutcome {
    Refunded { amount: i64, kind: DebitKind },
    AlreadyRefunded,
    NoDebit,
}

#[derive(Debug, Error)]
pub enum CreditError {
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error(transparent)]
    Store(#[from] DocStoreError),
}

pub struct CreditService {
    kv: Arc<dyn AtomicKv>,
    docs: Arc<DocStore>,
    policy: CreditPolicy,
}

fn free_key(owner: &str, day: &str) -> String {
    format!("credits:free:{owner}:{day}")
}

fn balance_key(owner: &str) -> String {
    format!("credits:balance:{owner}")
}

fn utc_day() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

impl CreditService {
    pub fn new(kv: Arc<dyn AtomicKv>, docs: Arc<DocStore>, policy: CreditPolicy) -> Self {
        debug_assert!(policy.job_cost > 0);
        Self { kv, docs, policy }
    }

    pub fn policy(&self) -> CreditPolicy {
        self.policy
    }

    /// Consume one free slot for today, falling back to the paid balance.
    pub async fn check_and_deduct(
        &self,
        owner: &str,
        job_id: Uuid,
    ) -> Result<CreditDecision, CreditError> {
        let day = utc_day();
        let free = free_key(owner, &day);
        let take = self
            .kv
            .free_slot_take(&free, self.policy.daily_free_limit, FREE_COUNTER_TTL_SECS)
            .await?;
        if take.taken {
            self.append_debit(owner, job_id, DebitKind::Free, FREE_SLOT_COST, &free)?;
            let balance = self.kv.counter_get(&balance_key(owner)).await?;
            let free_left = i64::from(self.policy.daily_free_limit) - take.count;
            return Ok(CreditDecision {
                allowed: true,
                kind: Some(DebitKind::Free),
                amount: FREE_SLOT_COST,
                remaining: free_left.max(0) + balance,
            });
        }

        let balance = balance_key(owner);
        let debit = self.kv.balance_debit(&balance, self.policy.job_cost).await?;
        if debit.ok {
            self.append_debit(owner, job_id, DebitKind::Paid, self.policy.job_cost, &balance)?;
            self.mirror_balance(owner, debit.balance);
            return Ok(CreditDecision {
                allowed: true,
                kind: Some(DebitKind::Paid),
                amount: self.policy.job_cost,
                remaining: debit.balance,
            });
        }

        Ok(CreditDecision {
            allowed: false,
            kind: None,
            amount: 0,
            remaining: debit.balance,
        })
    }

    /// Compensate the newest unrefunded debit for `job_id`. Safe to call
    /// repeatedly; only the first call moves money.
    pub async fn refund(
        &self,
        owner: &str,
        job_id: Uuid,
        reason: &str,
    ) -> Result<RefundOutcome, CreditError> {
        let job_key = job_id.to_string();

        let debit = {
            let mut wtxn = self.docs.write_txn()?;
            let Some(raw) = self.docs.ledger_by_job.get(&wtxn, &job_key).map_err(DocStoreError::from)? else {
                return Ok(RefundOutcome::NoDebit);
            };
            let mut debit: DebitRef = decode(raw)?;
            if debit.refunded {
                return Ok(RefundOutcome::AlreadyRefunded);
            }
            debit.refunded = true;
            self.docs
                .ledger_by_job
                .put(&mut wtxn, &job_key, &encode(&debit)?).map_err(DocStoreError::from)?;

            let entry = LedgerEntry {
                id: Uuid::now_v7(),
                owner: owner.to_string(),
                job_id: Some(job_id),
                amount: debit.amount,
                kind: LedgerKind::Refund,
                reason: reason.to_string(),
                created_at_ms: current_timestamp_ms(),
                refunds: Some(debit.entry_id),
            };
            self.docs.ledger.put(
                &mut wtxn,
                &ledger_key(owner, &entry.id),
                &encode(&entry)?,
            ).map_err(DocStoreError::from)?;
            wtxn.commit().map_err(DocStoreError::from)?;
            debit
        };

        match debit.kind {
            DebitKind::Free => {
                self.kv.free_slot_release(&debit.counter_key).await?;
            }
            DebitKind::Paid => {
                let balance = self
                    .kv
                    .balance_credit(&debit.counter_key, debit.amount)
                    .await?;
                self.mirror_balance(owner, balance);
            }
        }

        Ok(RefundOutcome::Refunded {
            amount: debit.amount,
            kind: debit.kind,
        })
    }

    /// Credit purchased units to the paid balance. This is the input contract
    /// for the out-of-scope billing webhook.
    pub async fn purchase(
        &self,
        owner: &str,
        amount: i64,
        reference: &str,
    ) -> Result<i64, CreditError> {
        debug_assert!(amount > 0);
        let balance = self.kv.balance_credit(&balance_key(owner), amount).await?;

        let entry = LedgerEntry {
            id: Uuid::now_v7(),
            owner: owner.to_string(),
            job_id: None,
            amount,
            kind: LedgerKind::Purchase,
            reason: format!("purchase {reference}"),
            created_at_ms: current_timestamp_ms(),
            refunds: None,
        };
        let mut wtxn = self.docs.write_txn()?;
        self.docs.ledger.put(
            &mut wtxn,
            &ledger_key(owner, &entry.id),
            &encode(&entry)?,
        ).map_err(DocStoreError::from)?;
        wtxn.commit().map_err(DocStoreError::from)?;

        self.mirror_balance(owner, balance);
        Ok(balance)
    }

    /// Ledger rows for one user in append order.
    pub fn ledger_for(&self, owner: &str) -> Result<Vec<LedgerEntry>, CreditError> {
        let prefix = format!("{owner}:");
        let rtxn = self.docs.read_txn().map_err(CreditError::Store)?;
        let iter = self
            .docs
            .ledger
            .prefix_iter(&rtxn, &prefix)
            .map_err(DocStoreError::from)?;
        let mut out = Vec::new();
        for entry in iter {
            let (_, raw) = entry.map_err(DocStoreError::from)?;
            out.push(decode::<LedgerEntry>(raw)?);
        }
        Ok(out)
    }

    /// Whether the job's debit has already been compensated. Used by replay
    /// to avoid re-debiting.
    pub fn debit_refunded(&self, job_id: Uuid) -> Result<Option<bool>, CreditError> {
        let rtxn = self.docs.read_txn()?;
        let raw = self.docs.ledger_by_job.get(&rtxn, &job_id.to_string()).map_err(DocStoreError::from)?;
        raw.map(|raw| decode::<DebitRef>(raw).map(|d| d.refunded))
            .transpose()
            .map_err(CreditError::from)
    }

    fn append_debit(
        &self,
        owner: &str,
        job_id: Uuid,
        kind: DebitKind,
        amount: i64,
        counter_key: &str,
    ) -> Result<(), CreditError> {
        let entry = LedgerEntry {
            id: Uuid::now_v7(),
            owner: owner.to_string(),
            job_id: Some(job_id),
            amount: -amount,
            kind: match kind {
                DebitKind::Free => LedgerKind::Free,
                DebitKind::Paid => LedgerKind::Paid,
            },
            reason: match kind {
                DebitKind::Free => "free daily slot".to_string(),
                DebitKind::Paid => "paid restoration".to_string(),
            },
            created_at_ms: current_timestamp_ms(),
            refunds: None,
        };
        let debit_ref = DebitRef {
            entry_id: entry.id,
            amount,
            kind,
            counter_key: counter_key.to_string(),
            refunded: false,
        };

        let mut wtxn = self.docs.write_txn()?;
        self.docs.ledger.put(
            &mut wtxn,
            &ledger_key(owner, &entry.id),
            &encode(&entry)?,
        ).map_err(DocStoreError::from)?;
        self.docs
            .ledger_by_job
            .put(&mut wtxn, &job_id.to_string(), &encode(&debit_ref)?).map_err(DocStoreError::from)?;
        wtxn.commit().map_err(DocStoreError::from)?;
        Ok(())
    }

    fn mirror_balance(&self, owner: &str, balance: i64) {
        let docs = Arc::clone(&self.docs);
        let owner = owner.to_string();
        tokio::spawn(async move {
            let profile = UserProfile {
                owner: owner.clone(),
                paid_balance: balance,
                updated_at_ms: current_timestamp_ms(),
            };
            let result = (|| -> Result<(), DocStoreError> {
                let mut wtxn = docs.write_txn()?;
                docs.profiles.put(&mut wtxn, &owner, &encode(&profile)?)?;
                wtxn.commit()?;
                Ok(())
            })();
            if let Err(error) = result {
                tracing::warn!(%owner, %error, "failed to mirror paid balance");
            }
        });
    }
}

fn ledger_key(owner: &str, entry_id: &Uuid) -> String {
    // Uuid v7 renders time-ordered, so per-user prefix iteration yields
    // entries in append order.
    format!("{owner}:{entry_id}")
}
