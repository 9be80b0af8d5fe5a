//! LMDB-backed document store shared by the control-plane services.
//!
//! One environment, one named database per collection. Values are
//! bincode-encoded serde structs; every mutation commits inside a single
//! write transaction.

use std::fs;
use std::path::Path;

use bincode::config;
use bincode::error::{DecodeError, EncodeError};
use bincode::serde::{decode_from_slice, encode_to_vec};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

const DOC_ENV_MAP_SIZE_BYTES: usize = 1 << 30; // 1 GiB
const MAX_DBS: u32 = 8;

#[derive(Debug, Error)]
pub enum DocStoreError {
    #[error(transparent)]
    Heed(#[from] heed::Error),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Shared document-store handle. Collections: job records, user profiles,
/// the credit ledger (plus its per-job debit index), queue tasks, the
/// dead-letter archive, and replay audits.
#[derive(Debug)]
pub struct DocStore {
    env: Env,
    pub(crate) jobs: Database<Str, Bytes>,
    pub(crate) profiles: Database<Str, Bytes>,
    pub(crate) ledger: Database<Str, Bytes>,
    pub(crate) ledger_by_job: Database<Str, Bytes>,
    pub(crate) tasks: Database<Str, Bytes>,
    pub(crate) dead_letter: Database<Str, Bytes>,
    pub(crate) replay_audit: Database<Str, Bytes>,
    pub(crate) moderation_audit: Database<Str, Bytes>,
}

impl DocStore {
    pub fn open(dir: &Path) -> Result<Self, DocStoreError> {
        fs::create_dir_all(dir)?;

        let mut options = EnvOpenOptions::new();
        options.max_dbs(MAX_DBS);
        options.map_size(DOC_ENV_MAP_SIZE_BYTES);
        let env = unsafe {
            // SAFETY: LMDB requires callers to uphold environment lifetime invariants.
            options.open(dir)?
        };

        let mut wtxn = env.write_txn()?;
        let jobs = env.create_database(&mut wtxn, Some("jobs"))?;
        let profiles = env.create_database(&mut wtxn, Some("profiles"))?;
        let ledger = env.create_database(&mut wtxn, Some("ledger"))?;
        let ledger_by_job = env.create_database(&mut wtxn, Some("ledger_by_job"))?;
        let tasks = env.create_database(&mut wtxn, Some("tasks"))?;
        let dead_letter = env.create_database(&mut wtxn, Some("dead_letter"))?;
        let replay_audit = env.create_database(&mut wtxn, Some("replay_audit"))?;
        let moderation_audit = env.create_database(&mut wtxn, Some("moderation_audit"))?;
        wtxn.commit()?;

        Ok(Self {
            env,
            jobs,
            profiles,
            ledger,
            ledger_by_job,
            tasks,
            dead_letter,
            replay_audit,
            moderation_audit,
        })
    }

    pub(crate) fn read_txn(&self) -> Result<RoTxn<'_>, DocStoreError> {
        Ok(self.env.read_txn()?)
    }

    pub(crate) fn write_txn(&self) -> Result<RwTxn<'_>, DocStoreError> {
        Ok(self.env.write_txn()?)
    }

    /// Cheap liveness probe for the readiness endpoint.
    pub fn probe(&self) -> Result<(), DocStoreError> {
        let rtxn = self.env.read_txn()?;
        let _ = self.jobs.len(&rtxn)?;
        Ok(())
    }
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, DocStoreError> {
    Ok(encode_to_vec(value, config::standard())?)
}

pub(crate) fn decode<T: DeserializeOwned>(raw: &[u8]) -> Result<T, DocStoreError> {
    let (value, _) = decode_from_slice::<T, _>(raw, config::standard())?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        name: String,
        count: u32,
    }

    #[test]
    fn open_creates_all_databases() {
        let temp = TempDir::new().expect("temp dir");
        let store = DocStore::open(temp.path()).expect("open store");
        store.probe().expect("probe succeeds");
    }

    #[test]
    fn roundtrips_encoded_documents() {
        let temp = TempDir::new().expect("temp dir");
        let store = DocStore::open(temp.path()).expect("open store");

        let doc = Doc {
            name: "sample".to_string(),
            count: 7,
        };
        let mut wtxn = store.write_txn().expect("write txn");
        store
            .jobs
            .put(&mut wtxn, "doc-1", &encode(&doc).expect("encode"))
            .expect("put");
        wtxn.commit().expect("commit");

        let rtxn = store.read_txn().expect("read txn");
        let raw = store
            .jobs
            .get(&rtxn, "doc-1")
            .expect("get")
            .expect("present");
        let decoded: Doc = decode(raw).expect("decode");
        assert_eq!(decoded, doc);
    }
}
