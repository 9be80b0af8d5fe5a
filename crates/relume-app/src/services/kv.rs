//! Shared key-value store with atomic scripts.
//!
//! Every counter, rate bucket, and idempotency entry is mutated through one
//! of the operations below, each of which executes atomically: as a single
//! Lua script against Redis, or under one mutex in the in-process fallback.
//! Read-then-write sequences against this store are forbidden by design.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use thiserror::Error;

/// Outcome of consuming one slot from a bounded counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotTake {
    pub taken: bool,
    pub count: i64,
}

/// Outcome of a compare-and-decrement against a balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceDebit {
    pub ok: bool,
    pub balance: i64,
}

/// Outcome of a fixed-window bucket admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketDecision {
    pub admitted: bool,
    pub remaining: u32,
    pub reset_unix: u64,
}

#[derive(Debug, Error)]
pub enum KvError {
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
    #[error("unexpected script reply: {0}")]
    Reply(String),
}

/// Atomic operations shared by the Redis backend and the in-process fallback.
#[async_trait]
pub trait AtomicKv: Send + Sync {
    /// Consume one slot iff the counter is below `limit`. The key expires
    /// `ttl_secs` after its first increment.
    async fn free_slot_take(&self, key: &str, limit: u32, ttl_secs: u64)
        -> Result<SlotTake, KvError>;

    /// Release one slot, never going below zero. Returns the new count.
    async fn free_slot_release(&self, key: &str) -> Result<i64, KvError>;

    /// Decrement the balance iff it currently holds at least `amount`.
    async fn balance_debit(&self, key: &str, amount: i64) -> Result<BalanceDebit, KvError>;

    /// Increment the balance. Returns the new value.
    async fn balance_credit(&self, key: &str, amount: i64) -> Result<i64, KvError>;

    /// Read a counter or balance; missing keys read as zero.
    async fn counter_get(&self, key: &str) -> Result<i64, KvError>;

    /// Fixed-window token bucket admission (see the rate limiter).
    async fn bucket_admit(
        &self,
        key: &str,
        limit: u32,
        window_secs: u64,
        now_unix: u64,
    ) -> Result<BucketDecision, KvError>;

    /// Write a value only when the key is absent. Returns whether the write
    /// happened.
    async fn put_if_absent(&self, key: &str, value: &[u8], ttl_secs: u64)
        -> Result<bool, KvError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    async fn ping(&self) -> Result<(), KvError>;
}

pub(crate) fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

const FREE_TAKE_SCRIPT: &str = r#"
local count = tonumber(redis.call('GET', KEYS[1]) or '0')
if count >= tonumber(ARGV[1]) then
  return {0, count}
end
count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return {1, count}
"#;

const FREE_RELEASE_SCRIPT: &str = r#"
local count = tonumber(redis.call('GET', KEYS[1]) or '0')
if count <= 0 then
  return 0
end
return redis.call('DECR', KEYS[1])
"#;

const BALANCE_DEBIT_SCRIPT: &str = r#"
local balance = tonumber(redis.call('GET', KEYS[1]) or '0')
local amount = tonumber(ARGV[1])
if balance < amount then
  return {0, balance}
end
balance = redis.call('DECRBY', KEYS[1], amount)
return {1, balance}
"#;

const BUCKET_ADMIT_SCRIPT: &str = r#"
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local remaining = tonumber(redis.call('HGET', KEYS[1], 'remaining'))
local reset = tonumber(redis.call('HGET', KEYS[1], 'reset'))
if (not reset) or reset <= now then
  remaining = limit - 1
  reset = now + window
  redis.call('HSET', KEYS[1], 'remaining', remaining, 'reset', reset)
  redis.call('EXPIRE', KEYS[1], window * 2)
  return {1, remaining, reset}
end
if remaining <= 0 then
  return {0, 0, reset}
end
remaining = redis.call('HINCRBY', KEYS[1], 'remaining', -1)
return {1, remaining, reset}
"#;

/// Redis-backed implementation. All compound operations run as Lua scripts,
/// which Redis executes atomically.
pub struct RedisKv {
    conn: ConnectionManager,
    free_take: redis::Script,
    free_release: redis::Script,
    balance_debit: redis::Script,
    bucket_admit: redis::Script,
}

impl RedisKv {
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            free_take: redis::Script::new(FREE_TAKE_SCRIPT),
            free_release: redis::Script::new(FREE_RELEASE_SCRIPT),
            balance_debit: redis::Script::new(BALANCE_DEBIT_SCRIPT),
            bucket_admit: redis::Script::new(BUCKET_ADMIT_SCRIPT),
        })
    }
}

#[async_trait]
impl AtomicKv for RedisKv {
    async fn free_slot_take(
        &self,
        key: &str,
        limit: u32,
        ttl_secs: u64,
    ) -> Result<SlotTake, KvError> {
        let mut conn = self.conn.clone();
        let (taken, count): (i64, i64) = self
            .free_take
            .key(key)
            .arg(limit)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(SlotTake {
            taken: taken == 1,
            count,
        })
    }

    async fn free_slot_release(&self, key: &str) -> Result<i64, KvError> {
        let mut conn = self.conn.clone();
        let count: i64 = self.free_release.key(key).invoke_async(&mut conn).await?;
        Ok(count)
    }

    async fn balance_debit(&self, key: &str, amount: i64) -> Result<BalanceDebit, KvError> {
        debug_assert!(amount > 0);
        let mut conn = self.conn.clone();
        let (ok, balance): (i64, i64) = self
            .balance_debit
            .key(key)
            .arg(amount)
            .invoke_async(&mut conn)
            .await?;
        Ok(BalanceDebit {
            ok: ok == 1,
            balance,
        })
    }

    async fn balance_credit(&self, key: &str, amount: i64) -> Result<i64, KvError> {
        debug_assert!(amount > 0);
        let mut conn = self.conn.clone();
        let balance: i64 = redis::cmd("INCRBY")
            .arg(key)
            .arg(amount)
            .query_async(&mut conn)
            .await?;
        Ok(balance)
    }

    async fn counter_get(&self, key: &str) -> Result<i64, KvError> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value.unwrap_or(0))
    }

    async fn bucket_admit(
        &self,
        key: &str,
        limit: u32,
        window_secs: u64,
        now_unix: u64,
    ) -> Result<BucketDecision, KvError> {
        debug_assert!(limit > 0);
        debug_assert!(window_secs > 0);
        let mut conn = self.conn.clone();
        let (admitted, remaining, reset): (i64, i64, i64) = self
            .bucket_admit
            .key(key)
            .arg(limit)
            .arg(window_secs)
            .arg(now_unix)
            .invoke_async(&mut conn)
            .await?;
        Ok(BucketDecision {
            admitted: admitted == 1,
            remaining: remaining.max(0) as u32,
            reset_unix: reset.max(0) as u64,
        })
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl_secs: u64,
    ) -> Result<bool, KvError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn ping(&self) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(KvError::Reply(reply))
        }
    }
}

enum Slot {
    Counter { value: i64, expires_at: Option<u64> },
    Bucket { remaining: u32, reset: u64 },
    Blob { bytes: Vec<u8>, expires_at: u64 },
}

/// In-process fallback with the same operation semantics as [`RedisKv`].
///
/// A single mutex makes every operation atomic; distributed admission is
/// lost, which the readiness probe surfaces as `degraded`.
#[derive(Default)]
pub struct MemoryKv {
    slots: Mutex<HashMap<String, Slot>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter_entry(slots: &mut HashMap<String, Slot>, key: &str, now: u64) -> i64 {
        match slots.get(key) {
            Some(Slot::Counter { value, expires_at }) => {
                if expires_at.is_some_and(|at| at <= now) {
                    slots.remove(key);
                    0
                } else {
                    *value
                }
            }
            Some(_) => {
                slots.remove(key);
                0
            }
            None => 0,
        }
    }
}

#[async_trait]
impl AtomicKv for MemoryKv {
    async fn free_slot_take(
        &self,
        key: &str,
        limit: u32,
        ttl_secs: u64,
    ) -> Result<SlotTake, KvError> {
        let now = now_unix();
        let mut slots = self.slots.lock().expect("kv mutex poisoned");
        let current = Self::counter_entry(&mut slots, key, now);
        if current >= i64::from(limit) {
            return Ok(SlotTake {
                taken: false,
                count: current,
            });
        }
        let next = current + 1;
        let expires_at = match slots.get(key) {
            Some(Slot::Counter { expires_at, .. }) => *expires_at,
            _ => Some(now + ttl_secs),
        };
        slots.insert(
            key.to_string(),
            Slot::Counter {
                value: next,
                expires_at,
            },
        );
        Ok(SlotTake {
            taken: true,
            count: next,
        })
    }

    async fn free_slot_release(&self, key: &str) -> Result<i64, KvError> {
        let now = now_unix();
        let mut slots = self.slots.lock().expect("kv mutex poisoned");
        let current = Self::counter_entry(&mut slots, key, now);
        if current <= 0 {
            return Ok(0);
        }
        let next = current - 1;
        if let Some(Slot::Counter { value, .. }) = slots.get_mut(key) {
            *value = next;
        }
        Ok(next)
    }

    async fn balance_debit(&self, key: &str, amount: i64) -> Result<BalanceDebit, KvError> {
        debug_assert!(amount > 0);
        let now = now_unix();
        let mut slots = self.slots.lock().expect("kv mutex poisoned");
        let current = Self::counter_entry(&mut slots, key, now);
        if current < amount {
            return Ok(BalanceDebit {
                ok: false,
                balance: current,
            });
        }
        let next = current - amount;
        slots.insert(
            key.to_string(),
            Slot::Counter {
                value: next,
                expires_at: None,
            },
        );
        Ok(BalanceDebit {
            ok: true,
            balance: next,
        })
    }

    async fn balance_credit(&self, key: &str, amount: i64) -> Result<i64, KvError> {
        debug_assert!(amount > 0);
        let now = now_unix();
        let mut slots = self.slots.lock().expect("kv mutex poisoned");
        let current = Self::counter_entry(&mut slots, key, now);
        let next = current + amount;
        slots.insert(
            key.to_string(),
            Slot::Counter {
                value: next,
                expires_at: None,
            },
        );
        Ok(next)
    }

    async fn counter_get(&self, key: &str) -> Result<i64, KvError> {
        let now = now_unix();
        let mut slots = self.slots.lock().expect("kv mutex poisoned");
        Ok(Self::counter_entry(&mut slots, key, now))
    }

    async fn bucket_admit(
        &self,
        key: &str,
        limit: u32,
        window_secs: u64,
        now_unix: u64,
    ) -> Result<BucketDecision, KvError> {
        debug_assert!(limit > 0);
        let mut slots = self.slots.lock().expect("kv mutex poisoned");
        let bucket = match slots.get(key) {
            Some(Slot::Bucket { remaining, reset }) if *reset > now_unix => {
                Some((*remaining, *reset))
            }
            _ => None,
        };
        match bucket {
            None => {
                let reset = now_unix + window_secs;
                let remaining = limit.saturating_sub(1);
                slots.insert(key.to_string(), Slot::Bucket { remaining, reset });
                Ok(BucketDecision {
                    admitted: true,
                    remaining,
                    reset_unix: reset,
                })
            }
            Some((0, reset)) => Ok(BucketDecision {
                admitted: false,
                remaining: 0,
                reset_unix: reset,
            }),
            Some((remaining, reset)) => {
                let next = remaining - 1;
                slots.insert(
                    key.to_string(),
                    Slot::Bucket {
                        remaining: next,
                        reset,
                    },
                );
                Ok(BucketDecision {
                    admitted: true,
                    remaining: next,
                    reset_unix: reset,
                })
            }
        }
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: &[u8],
        ttl_secs: u64,
    ) -> Result<bool, KvError> {
        let now = now_unix();
        let mut slots = self.slots.lock().expect("kv mutex poisoned");
        if let Some(Slot::Blob { expires_at, .. }) = slots.get(key) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        slots.insert(
            key.to_string(),
            Slot::Blob {
                bytes: value.to_vec(),
                expires_at: now + ttl_secs,
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let now = now_unix();
        let slots = self.slots.lock().expect("kv mutex poisoned");
        match slots.get(key) {
            Some(Slot::Blob { bytes, expires_at }) if *expires_at > now => Ok(Some(bytes.clone())),
            _ => Ok(None),
        }
    }

    async fn ping(&self) -> Result<(), KvError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn free_slot_respects_limit() {
        let kv = MemoryKv::new();
        for expected in 1..=3 {
            let take = kv.free_slot_take("free", 3, 60).await.expect("take");
            assert!(take.taken);
            assert_eq!(take.count, expected);
        }
        let denied = kv.free_slot_take("free", 3, 60).await.expect("take");
        assert!(!denied.taken);
        assert_eq!(denied.count, 3);
    }

    #[tokio::test]
    async fn free_slot_release_floors_at_zero() {
        let kv = MemoryKv::new();
        assert_eq!(kv.free_slot_release("free").await.expect("release"), 0);
        kv.free_slot_take("free", 3, 60).await.expect("take");
        assert_eq!(kv.free_slot_release("free").await.expect("release"), 0);
        assert_eq!(kv.free_slot_release("free").await.expect("release"), 0);
    }

    #[tokio::test]
    async fn balance_debit_requires_funds() {
        let kv = MemoryKv::new();
        let denied = kv.balance_debit("bal", 1).await.expect("debit");
        assert!(!denied.ok);
        assert_eq!(denied.balance, 0);

        assert_eq!(kv.balance_credit("bal", 5).await.expect("credit"), 5);
        let debit = kv.balance_debit("bal", 2).await.expect("debit");
        assert!(debit.ok);
        assert_eq!(debit.balance, 3);
        assert_eq!(kv.counter_get("bal").await.expect("get"), 3);
    }

    #[tokio::test]
    async fn bucket_admits_until_empty_then_resets() {
        let kv = MemoryKv::new();
        let now = 1_000;

        let first = kv.bucket_admit("b", 2, 60, now).await.expect("admit");
        assert!(first.admitted);
        assert_eq!(first.remaining, 1);
        assert_eq!(first.reset_unix, now + 60);

        let second = kv.bucket_admit("b", 2, 60, now + 1).await.expect("admit");
        assert!(second.admitted);
        assert_eq!(second.remaining, 0);

        let denied = kv.bucket_admit("b", 2, 60, now + 2).await.expect("admit");
        assert!(!denied.admitted);
        assert_eq!(denied.reset_unix, now + 60);

        let after_reset = kv
            .bucket_admit("b", 2, 60, now + 61)
            .await
            .expect("admit");
        assert!(after_reset.admitted);
        assert_eq!(after_reset.remaining, 1);
    }

    #[tokio::test]
    async fn put_if_absent_writes_once() {
        let kv = MemoryKv::new();
        assert!(kv.put_if_absent("k", b"first", 60).await.expect("put"));
        assert!(!kv.put_if_absent("k", b"second", 60).await.expect("put"));
        assert_eq!(
            kv.get("k").await.expect("get").as_deref(),
            Some(b"first".as_ref())
        );
    }
}
