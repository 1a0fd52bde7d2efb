//! Resource arbiter: shared/exclusive locks on named resources.
//!
//! - `acquire` is all-or-nothing and deadline-bounded; a failed or timed-out
//!   request holds nothing.
//! - Writer preference: a shared request waits while any exclusive request
//!   for the same resource is queued. Exclusive requests queue FIFO.
//! - The wait-for graph is checked on every attempt; a requester that closes
//!   a cycle is aborted with [`ArbiterError::DeadlockAbort`].
//! - Grants may carry a lease. [`ResourceArbiter::revoke_expired`] strips
//!   expired grants and fires the holder's cancellation token.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::error::ErrorKind;
use crate::domain::task::{LockMode, ResourceClaim};
use crate::metrics::METRICS;
use crate::obs;

/// Errors from lock acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArbiterError {
    #[error("{instance} timed out acquiring [{resources}]")]
    AcquireTimeout { instance: String, resources: String },

    #[error("deadlock detected; {instance} aborted")]
    DeadlockAbort { instance: String },

    #[error("lease expired for {instance}")]
    LeaseExpired { instance: String },

    #[error("resource arbiter is closed")]
    Unavailable,
}

impl ArbiterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ArbiterError::AcquireTimeout { .. } => ErrorKind::AcquireTimeout,
            ArbiterError::DeadlockAbort { .. } => ErrorKind::DeadlockAbort,
            ArbiterError::LeaseExpired { .. } => ErrorKind::LeaseExpired,
            ArbiterError::Unavailable => ErrorKind::ResourceUnavailable,
        }
    }
}

/// A granted lock as seen from outside the arbiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLock {
    pub resource: String,
    pub holder: String,
    pub mode: LockMode,
    pub acquired_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct Grant {
    mode: LockMode,
    acquired_at: DateTime<Utc>,
    deadline: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Lease {
    expires: Instant,
    token: CancellationToken,
}

#[derive(Debug)]
struct Waiter {
    instance: String,
    claims: Vec<ResourceClaim>,
}

#[derive(Debug, Default)]
struct State {
    /// resource -> holder instance -> grant
    grants: HashMap<String, BTreeMap<String, Grant>>,
    /// Queued requests in arrival order.
    waiters: BTreeMap<u64, Waiter>,
    leases: HashMap<String, Lease>,
    next_seq: u64,
    closed: bool,
}

impl State {
    /// Instances that currently prevent request `seq` from being granted.
    fn blockers(&self, seq: u64, instance: &str, claims: &[ResourceClaim]) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for claim in claims {
            if let Some(holders) = self.grants.get(&claim.resource) {
                for (holder, grant) in holders {
                    if holder != instance
                        && (claim.mode == LockMode::Exclusive || grant.mode == LockMode::Exclusive)
                    {
                        out.insert(holder.clone());
                    }
                }
            }
            for (other_seq, waiter) in &self.waiters {
                if *other_seq == seq || waiter.instance == instance {
                    continue;
                }
                let queued_writer = waiter
                    .claims
                    .iter()
                    .any(|c| c.resource == claim.resource && c.mode == LockMode::Exclusive);
                if !queued_writer {
                    continue;
                }
                let blocks = match claim.mode {
                    LockMode::Shared => true,
                    LockMode::Exclusive => *other_seq < seq,
                };
                if blocks {
                    out.insert(waiter.instance.clone());
                }
            }
        }
        out
    }

    fn waiting_request(&self, instance: &str) -> Option<(u64, &Waiter)> {
        self.waiters
            .iter()
            .find(|(_, w)| w.instance == instance)
            .map(|(s, w)| (*s, w))
    }

    /// Whether `instance` (waiting as `seq`) can reach itself in the wait-for graph.
    fn closes_cycle(&self, seq: u64, instance: &str, claims: &[ResourceClaim]) -> bool {
        let mut stack: Vec<String> = self.blockers(seq, instance, claims).into_iter().collect();
        let mut seen = BTreeSet::new();
        while let Some(node) = stack.pop() {
            if node == instance {
                return true;
            }
            if !seen.insert(node.clone()) {
                continue;
            }
            if let Some((s, w)) = self.waiting_request(&node) {
                stack.extend(self.blockers(s, &w.instance, &w.claims));
            }
        }
        false
    }

    fn grant(&mut self, instance: &str, claims: &[ResourceClaim], deadline: Option<DateTime<Utc>>) -> Vec<ResourceLock> {
        let now = Utc::now();
        let mut locks = Vec::with_capacity(claims.len());
        for claim in claims {
            let holders = self.grants.entry(claim.resource.clone()).or_default();
            let grant = holders.entry(instance.to_string()).or_insert_with(|| Grant {
                mode: claim.mode,
                acquired_at: now,
                deadline,
            });
            grant.mode = grant.mode.max(claim.mode);
            grant.deadline = deadline;
            locks.push(ResourceLock {
                resource: claim.resource.clone(),
                holder: instance.to_string(),
                mode: grant.mode,
                acquired_at: grant.acquired_at,
                deadline,
            });
        }
        locks
    }

    fn strip(&mut self, instance: &str) -> usize {
        let mut released = 0;
        self.grants.retain(|_, holders| {
            if holders.remove(instance).is_some() {
                released += 1;
            }
            !holders.is_empty()
        });
        self.leases.remove(instance);
        released
    }
}

/// Collapse duplicate resources, keeping the strongest mode.
fn normalize(claims: &[ResourceClaim]) -> Vec<ResourceClaim> {
    let mut by_resource: BTreeMap<&str, LockMode> = BTreeMap::new();
    for c in claims {
        let mode = by_resource.entry(&c.resource).or_insert(c.mode);
        *mode = (*mode).max(c.mode);
    }
    by_resource
        .into_iter()
        .map(|(resource, mode)| ResourceClaim {
            resource: resource.to_string(),
            mode,
        })
        .collect()
}

fn describe(claims: &[ResourceClaim]) -> String {
    claims.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// Lock manager for named resources.
#[derive(Debug, Default)]
pub struct ResourceArbiter {
    state: Mutex<State>,
    changed: Notify,
}

/// Removes a queued request when its `acquire` future finishes or is dropped.
struct WaitGuard<'a> {
    arbiter: &'a ResourceArbiter,
    seq: u64,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        let removed = self.arbiter.state.lock().waiters.remove(&self.seq).is_some();
        if removed {
            self.arbiter.changed.notify_waiters();
        }
    }
}

impl ResourceArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire every claim for `instance` or nothing.
    ///
    /// Waits at most `wait`. With `lease`, the grant expires after that long
    /// and `lease_token` is cancelled when [`Self::revoke_expired`] strips it.
    pub async fn acquire(
        &self,
        instance: &str,
        claims: &[ResourceClaim],
        wait: Duration,
        lease: Option<Duration>,
        lease_token: CancellationToken,
    ) -> Result<Vec<ResourceLock>, ArbiterError> {
        let claims = normalize(claims);
        if claims.is_empty() {
            return Ok(Vec::new());
        }
        let give_up = Instant::now() + wait;

        let seq = {
            let mut st = self.state.lock();
            if st.closed {
                return Err(ArbiterError::Unavailable);
            }
            let seq = st.next_seq;
            st.next_seq += 1;
            st.waiters.insert(
                seq,
                Waiter {
                    instance: instance.to_string(),
                    claims: claims.clone(),
                },
            );
            seq
        };
        let _guard = WaitGuard { arbiter: self, seq };

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut st = self.state.lock();
                if st.closed {
                    return Err(ArbiterError::Unavailable);
                }
                if st.blockers(seq, instance, &claims).is_empty() {
                    st.waiters.remove(&seq);
                    let deadline = lease.and_then(|l| chrono::Duration::from_std(l).ok()).map(|l| Utc::now() + l);
                    let locks = st.grant(instance, &claims, deadline);
                    if let Some(l) = lease {
                        st.leases.insert(
                            instance.to_string(),
                            Lease {
                                expires: Instant::now() + l,
                                token: lease_token.clone(),
                            },
                        );
                    }
                    debug!(instance = %instance, resources = %describe(&claims), "locks granted");
                    drop(st);
                    // A removed writer may unblock queued readers.
                    self.changed.notify_waiters();
                    return Ok(locks);
                }
                if st.closes_cycle(seq, instance, &claims) {
                    METRICS.inc_deadlocks();
                    debug!(instance = %instance, "wait-for cycle; aborting requester");
                    return Err(ArbiterError::DeadlockAbort {
                        instance: instance.to_string(),
                    });
                }
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(give_up) => {
                    return Err(ArbiterError::AcquireTimeout {
                        instance: instance.to_string(),
                        resources: describe(&claims),
                    });
                }
            }
        }
    }

    /// Release everything `instance` holds. Returns the number of grants dropped.
    pub fn release_all(&self, instance: &str) -> usize {
        let released = self.state.lock().strip(instance);
        if released > 0 {
            debug!(instance = %instance, released, "locks released");
            self.changed.notify_waiters();
        }
        released
    }

    /// Current holders of `resource`, ordered by holder id.
    pub fn holders(&self, resource: &str) -> Vec<ResourceLock> {
        let st = self.state.lock();
        st.grants
            .get(resource)
            .map(|holders| {
                holders
                    .iter()
                    .map(|(holder, g)| ResourceLock {
                        resource: resource.to_string(),
                        holder: holder.clone(),
                        mode: g.mode,
                        acquired_at: g.acquired_at,
                        deadline: g.deadline,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Claims currently held by `instance`.
    pub fn held_by(&self, instance: &str) -> Vec<ResourceClaim> {
        let st = self.state.lock();
        let mut out: Vec<ResourceClaim> = st
            .grants
            .iter()
            .filter_map(|(resource, holders)| {
                holders.get(instance).map(|g| ResourceClaim {
                    resource: resource.clone(),
                    mode: g.mode,
                })
            })
            .collect();
        out.sort();
        out
    }

    /// Total number of grants across all resources.
    pub fn held_count(&self) -> usize {
        self.state.lock().grants.values().map(BTreeMap::len).sum()
    }

    /// Number of queued requests.
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Strip every grant whose lease ran out by `now` and cancel its holder.
    pub fn revoke_expired(&self, now: Instant) -> Vec<String> {
        let revoked: Vec<(String, usize, CancellationToken)> = {
            let mut st = self.state.lock();
            let expired: Vec<String> = st
                .leases
                .iter()
                .filter(|(_, lease)| lease.expires <= now)
                .map(|(instance, _)| instance.clone())
                .collect();
            expired
                .into_iter()
                .filter_map(|instance| {
                    let token = st.leases.get(&instance).map(|l| l.token.clone())?;
                    let n = st.strip(&instance);
                    Some((instance, n, token))
                })
                .collect()
        };

        if revoked.is_empty() {
            return Vec::new();
        }
        let mut ids = Vec::with_capacity(revoked.len());
        for (instance, n, token) in revoked {
            METRICS.inc_locks_revoked();
            obs::emit_lock_revoked(&instance, n);
            token.cancel();
            ids.push(instance);
        }
        self.changed.notify_waiters();
        ids
    }

    /// Periodically revoke expired leases until `shutdown` fires.
    pub fn spawn_reaper(self: &Arc<Self>, period: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let arbiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        arbiter.revoke_expired(Instant::now());
                    }
                }
            }
        })
    }

    /// Fail every pending and future `acquire` with `Unavailable`.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ex(r: &str) -> ResourceClaim {
        ResourceClaim::exclusive(r)
    }

    fn sh(r: &str) -> ResourceClaim {
        ResourceClaim::shared(r)
    }

    async fn take(a: &ResourceArbiter, who: &str, claims: &[ResourceClaim], wait_ms: u64) -> Result<Vec<ResourceLock>, ArbiterError> {
        a.acquire(who, claims, Duration::from_millis(wait_ms), None, CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn test_shared_locks_coexist() {
        let a = ResourceArbiter::new();
        take(&a, "i1", &[sh("fs:/src")], 10).await.unwrap();
        take(&a, "i2", &[sh("fs:/src")], 10).await.unwrap();
        assert_eq!(a.holders("fs:/src").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exclusive_times_out_and_holds_nothing() {
        let a = ResourceArbiter::new();
        take(&a, "i1", &[ex("fs:/out/report")], 10).await.unwrap();

        let err = take(&a, "i2", &[sh("fs:/other"), ex("fs:/out/report")], 50)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AcquireTimeout);
        assert!(a.held_by("i2").is_empty());
        assert!(a.holders("fs:/other").is_empty());
        assert_eq!(a.waiting(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_wakes_waiter() {
        let a = Arc::new(ResourceArbiter::new());
        take(&a, "i1", &[ex("r")], 10).await.unwrap();

        let a2 = Arc::clone(&a);
        let waiter = tokio::spawn(async move { take(&a2, "i2", &[ex("r")], 5_000).await });
        while a.waiting() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(a.release_all("i1"), 1);
        let locks = waiter.await.unwrap().unwrap();
        assert_eq!(locks[0].holder, "i2");
        assert_eq!(locks[0].mode, LockMode::Exclusive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_preference_blocks_new_readers() {
        let a = Arc::new(ResourceArbiter::new());
        take(&a, "reader-1", &[sh("r")], 10).await.unwrap();

        let a2 = Arc::clone(&a);
        let writer = tokio::spawn(async move { take(&a2, "writer", &[ex("r")], 5_000).await });
        while a.waiting() == 0 {
            tokio::task::yield_now().await;
        }

        let err = take(&a, "reader-2", &[sh("r")], 20).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AcquireTimeout);

        a.release_all("reader-1");
        writer.await.unwrap().unwrap();
        let holders = a.holders("r");
        assert_eq!(holders.len(), 1);
        assert_eq!(holders[0].holder, "writer");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadlock_aborts_requester() {
        let a = Arc::new(ResourceArbiter::new());
        take(&a, "A", &[ex("x")], 10).await.unwrap();
        take(&a, "B", &[ex("y")], 10).await.unwrap();

        let a2 = Arc::clone(&a);
        let a_waits = tokio::spawn(async move { take(&a2, "A", &[ex("y")], 5_000).await });
        while a.waiting() == 0 {
            tokio::task::yield_now().await;
        }

        let err = take(&a, "B", &[ex("x")], 5_000).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeadlockAbort);

        a.release_all("B");
        a_waits.await.unwrap().unwrap();
        assert_eq!(a.held_by("A"), vec![ex("x"), ex("y")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_revocation_cancels_holder() {
        let a = ResourceArbiter::new();
        let token = CancellationToken::new();
        let locks = a
            .acquire("i1", &[ex("r")], Duration::from_millis(10), Some(Duration::from_millis(100)), token.clone())
            .await
            .unwrap();
        assert!(locks[0].deadline.is_some());

        assert!(a.revoke_expired(Instant::now()).is_empty());
        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(a.revoke_expired(Instant::now()), vec!["i1".to_string()]);
        assert!(token.is_cancelled());
        assert_eq!(a.held_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_claims_collapse_to_strongest_mode() {
        let a = ResourceArbiter::new();
        let locks = take(&a, "i1", &[sh("r"), ex("r")], 10).await.unwrap();
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].mode, LockMode::Exclusive);
    }

    #[tokio::test]
    async fn test_closed_arbiter_is_unavailable() {
        let a = ResourceArbiter::new();
        a.close();
        let err = take(&a, "i1", &[sh("r")], 10).await.unwrap_err();
        assert_eq!(err, ArbiterError::Unavailable);
        assert_eq!(err.kind(), ErrorKind::ResourceUnavailable);
    }
}
