//! Fixed-window rate limiting over the shared key-value store.
//!
//! Two buckets are consulted in order: `(user, id)` then `(peer, address)`.
//! Admission runs as one atomic script per bucket; the in-process fallback
//! behind [`crate::services::kv::MemoryKv`] shares the algorithm.

use std::net::IpAddr;
use std::sync::Arc;

use thiserror::Error;

use crate::services::kv::{now_unix, AtomicKv, BucketDecision, KvError};

#[derive(Debug, Clone, Copy)]
pub struct WindowPolicy {
    pub limit: u32,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub user: WindowPolicy,
    pub peer: WindowPolicy,
}

/// Snapshot rendered into `RateLimit-*` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSnapshot {
    pub limit: u32,
    pub remaining: u32,
    /// Seconds until the window resets.
    pub reset_secs: u64,
}

#[derive(Debug, Clone, Copy)]
pub enum RateOutcome {
    Admitted(RateSnapshot),
    /// Denied by one of the buckets; carries that bucket's snapshot for the
    /// response headers and `Retry-After`.
    Denied(RateSnapshot),
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error(transparent)]
    Kv(#[from] KvError),
}

pub struct RateLimitService {
    kv: Arc<dyn AtomicKv>,
    policy: RateLimitPolicy,
}

impl RateLimitService {
    pub fn new(kv: Arc<dyn AtomicKv>, policy: RateLimitPolicy) -> Self {
        debug_assert!(policy.user.limit > 0);
        debug_assert!(policy.peer.limit > 0);
        Self { kv, policy }
    }

    pub async fn check(&self, user: &str, peer: IpAddr) -> Result<RateOutcome, RateLimitError> {
        let now = now_unix();

        let user_decision = self
            .admit(&format!("rl:user:{user}"), self.policy.user, now)
            .await?;
        if !user_decision.admitted {
            return Ok(RateOutcome::Denied(snapshot(
                self.policy.user,
                user_decision,
                now,
            )));
        }

        let peer_decision = self
            .admit(&format!("rl:peer:{peer}"), self.policy.peer, now)
            .await?;
        if !peer_decision.admitted {
            return Ok(RateOutcome::Denied(snapshot(
                self.policy.peer,
                peer_decision,
                now,
            )));
        }

        Ok(RateOutcome::Admitted(snapshot(
            self.policy.user,
            user_decision,
            now,
        )))
    }

    async fn admit(
        &self,
        key: &str,
        window: WindowPolicy,
        now: u64,
    ) -> Result<BucketDecision, RateLimitError> {
        Ok(self
            .kv
            .bucket_admit(key, window.limit, window.window_secs, now)
            .await?)
    }
}

fn snapshot(window: WindowPolicy, decision: BucketDecision, now: u64) -> RateSnapshot {
    RateSnapshot {
        limit: window.limit,
        remaining: decision.remaining,
        reset_secs: decision.reset_unix.saturating_sub(now).max(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::kv::MemoryKv;

    fn service(user_limit: u32, peer_limit: u32) -> RateLimitService {
        RateLimitService::new(
            Arc::new(MemoryKv::new()),
            RateLimitPolicy {
                user: WindowPolicy {
                    limit: user_limit,
                    window_secs: 60,
                },
                peer: WindowPolicy {
                    limit: peer_limit,
                    window_secs: 60,
                },
            },
        )
    }

    fn peer() -> IpAddr {
        IpAddr::from([127, 0, 0, 1])
    }

    #[tokio::test]
    async fn remaining_decreases_until_denied() {
        let limits = service(2, 100);

        let first = limits.check("user-1", peer()).await.expect("check");
        let RateOutcome::Admitted(snap) = first else {
            panic!("expected admission");
        };
        assert_eq!(snap.limit, 2);
        assert_eq!(snap.remaining, 1);

        let second = limits.check("user-1", peer()).await.expect("check");
        let RateOutcome::Admitted(snap) = second else {
            panic!("expected admission");
        };
        assert_eq!(snap.remaining, 0);

        let third = limits.check("user-1", peer()).await.expect("check");
        let RateOutcome::Denied(snap) = third else {
            panic!("expected denial");
        };
        assert_eq!(snap.remaining, 0);
        assert!(snap.reset_secs >= 1);
    }

    #[tokio::test]
    async fn peer_bucket_denies_independently() {
        let limits = service(100, 1);

        let first = limits.check("user-1", peer()).await.expect("check");
        assert!(matches!(first, RateOutcome::Admitted(_)));

        // Different user, same peer address: the peer bucket is exhausted.
        let second = limits.check("user-2", peer()).await.expect("check");
        let RateOutcome::Denied(snap) = second else {
            panic!("expected denial");
        };
        assert_eq!(snap.limit, 1);
    }

    #[tokio::test]
    async fn users_get_independent_buckets() {
        let limits = service(1, 100);
        assert!(matches!(
            limits.check("user-1", peer()).await.expect("check"),
            RateOutcome::Admitted(_)
        ));
        assert!(matches!(
            limits.check("user-2", peer()).await.expect("check"),
            RateOutcome::Admitted(_)
        ));
        assert!(matches!(
            limits.check("user-1", peer()).await.expect("check"),
            RateOutcome::Denied(_)
        ));
    }
}
