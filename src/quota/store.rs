//! Quota Store
//!
//! Owns the bucket map and the reservation registry. Buckets are created
//! from configuration and rebuilt on reload; reservations keep the bucket
//! `Arc` captured at grant time, so a reload never invalidates outstanding
//! holds.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::RouterConfig;
use crate::error::QuotaError;
use crate::lane::Lane;
use crate::quota::bucket::{BucketKey, BucketSnapshot, QuotaBucket};
use crate::quota::reservation::{
    AbandonedReservation, CommitReceipt, ReleaseReceipt, ReservationEntry, ReservationId,
    ReservationState,
};

/// Abandoned entries are retained this many grace periods so a late
/// commit can still find its bucket, then purged.
const ABANDON_RETENTION_FACTOR: i32 = 10;

/// Why a reservation was not granted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveDenied {
    /// No bucket configured for this (lane, model)
    UnknownBucket,
    /// Granting the estimate would exceed the window budget
    InsufficientBudget,
    /// Reservation estimates must be positive
    ZeroEstimate,
}

/// Per-(lane, model, window) token budget store
#[derive(Debug)]
pub struct QuotaStore {
    buckets: RwLock<HashMap<BucketKey, Arc<QuotaBucket>>>,
    reservations: Mutex<HashMap<ReservationId, ReservationEntry>>,
}

impl QuotaStore {
    /// Build buckets from a configuration snapshot
    pub fn from_config(config: &RouterConfig, now: DateTime<Utc>) -> Self {
        let store = Self {
            buckets: RwLock::new(HashMap::new()),
            reservations: Mutex::new(HashMap::new()),
        };
        store.reconfigure(config, now);
        store
    }

    /// Replace the bucket map from a new configuration snapshot
    ///
    /// Outstanding reservations keep the bucket object they were granted
    /// against; only future reserves see the new buckets.
    pub fn reconfigure(&self, config: &RouterConfig, now: DateTime<Utc>) {
        let window = config.window();
        let mut next = HashMap::new();
        for lane_cfg in &config.lanes {
            for (model, limit) in &lane_cfg.models {
                let key = BucketKey::new(lane_cfg.lane, model.clone());
                next.insert(key, Arc::new(QuotaBucket::new(*limit, window, now)));
            }
        }
        let mut buckets = self.buckets.write().expect("bucket map lock poisoned");
        *buckets = next;
    }

    /// Reserve an estimated token budget on one bucket
    ///
    /// Atomic per bucket: denied when `consumed + reserved + estimate`
    /// would exceed the limit, or when the estimate is zero.
    pub fn reserve(
        &self,
        lane: Lane,
        model: &str,
        estimate: u64,
        now: DateTime<Utc>,
    ) -> Result<ReservationId, ReserveDenied> {
        if estimate == 0 {
            return Err(ReserveDenied::ZeroEstimate);
        }
        let bucket = {
            let buckets = self.buckets.read().expect("bucket map lock poisoned");
            buckets
                .get(&BucketKey::new(lane, model))
                .cloned()
                .ok_or(ReserveDenied::UnknownBucket)?
        };

        if !bucket.try_reserve(estimate, now) {
            return Err(ReserveDenied::InsufficientBudget);
        }

        let id = ReservationId::new();
        let entry = ReservationEntry {
            lane,
            model: model.to_string(),
            estimate,
            granted_at: now,
            bucket,
            state: ReservationState::Reserved,
        };
        self.reservations
            .lock()
            .expect("reservation registry lock poisoned")
            .insert(id, entry);
        debug!(%id, %lane, model, estimate, "reservation granted");
        Ok(id)
    }

    /// Reconcile a reservation with actual usage
    ///
    /// Never fails a request retroactively: actuals above the estimate are
    /// accepted, and a commit arriving after abandonment is applied
    /// opportunistically (the estimate was already reclaimed by the sweep,
    /// so only the actual total is added; nothing is counted twice).
    pub fn commit(
        &self,
        id: ReservationId,
        actual_total: u64,
        now: DateTime<Utc>,
    ) -> Result<CommitReceipt, QuotaError> {
        let entry = self
            .reservations
            .lock()
            .expect("reservation registry lock poisoned")
            .remove(&id)
            .ok_or(QuotaError::UnknownReservation(id.0))?;

        let late = matches!(entry.state, ReservationState::Abandoned { .. });
        if late {
            warn!(%id, lane = %entry.lane, model = %entry.model, "late commit after expiry");
            entry.bucket.record_unreserved(actual_total, now);
        } else {
            entry.bucket.commit(entry.estimate, actual_total, now);
        }

        Ok(CommitReceipt {
            lane: entry.lane,
            model: entry.model,
            estimate: entry.estimate,
            late,
        })
    }

    /// Return a reservation's estimate without consuming anything
    ///
    /// Idempotent: unknown tokens and already-abandoned reservations are
    /// no-ops returning `None`.
    pub fn release(&self, id: ReservationId, now: DateTime<Utc>) -> Option<ReleaseReceipt> {
        let entry = {
            let mut registry = self
                .reservations
                .lock()
                .expect("reservation registry lock poisoned");
            match registry.get(&id) {
                Some(e) if e.state == ReservationState::Reserved => registry.remove(&id)?,
                // Abandoned: estimate was already reclaimed by the sweep.
                Some(_) | None => return None,
            }
        };

        entry.bucket.release(entry.estimate, now);
        debug!(%id, lane = %entry.lane, model = %entry.model, "reservation released");
        Some(ReleaseReceipt {
            lane: entry.lane,
            model: entry.model,
            estimate: entry.estimate,
        })
    }

    /// Sweep reservations past the grace period
    ///
    /// Each overdue reservation is reclaimed exactly once and marked
    /// abandoned; the entry is retained for a bounded horizon so a late
    /// commit can still be matched, then purged.
    pub fn expire_overdue(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Vec<AbandonedReservation> {
        let mut abandoned = Vec::new();
        let mut registry = self
            .reservations
            .lock()
            .expect("reservation registry lock poisoned");

        for (id, entry) in registry.iter_mut() {
            if entry.state == ReservationState::Reserved && entry.granted_at + grace <= now {
                entry.bucket.release(entry.estimate, now);
                entry.state = ReservationState::Abandoned { at: now };
                abandoned.push(AbandonedReservation {
                    id: *id,
                    lane: entry.lane,
                    model: entry.model.clone(),
                    estimate: entry.estimate,
                });
            }
        }

        let horizon = grace * ABANDON_RETENTION_FACTOR;
        registry.retain(|_, entry| match entry.state {
            ReservationState::Reserved => true,
            ReservationState::Abandoned { at } => at + horizon > now,
        });

        abandoned
    }

    /// Quota-visible usage with no reservation (dev harness path)
    ///
    /// Returns false when no bucket is configured for the pair.
    pub fn record_unreserved(
        &self,
        lane: Lane,
        model: &str,
        actual_total: u64,
        now: DateTime<Utc>,
    ) -> bool {
        let buckets = self.buckets.read().expect("bucket map lock poisoned");
        match buckets.get(&BucketKey::new(lane, model)) {
            Some(bucket) => {
                bucket.record_unreserved(actual_total, now);
                true
            }
            None => false,
        }
    }

    /// Snapshot one bucket
    pub fn snapshot(&self, lane: Lane, model: &str, now: DateTime<Utc>) -> Option<BucketSnapshot> {
        let buckets = self.buckets.read().expect("bucket map lock poisoned");
        buckets
            .get(&BucketKey::new(lane, model))
            .map(|b| b.snapshot(now))
    }

    /// Snapshot every configured bucket, sorted for stable rendering
    pub fn snapshots(&self, now: DateTime<Utc>) -> Vec<(BucketKey, BucketSnapshot)> {
        let buckets = self.buckets.read().expect("bucket map lock poisoned");
        let mut out: Vec<(BucketKey, BucketSnapshot)> = buckets
            .iter()
            .map(|(key, bucket)| (key.clone(), bucket.snapshot(now)))
            .collect();
        out.sort_by(|a, b| a.0.to_string().cmp(&b.0.to_string()));
        out
    }

    /// Number of reservations still holding budget
    pub fn outstanding(&self) -> usize {
        self.reservations
            .lock()
            .expect("reservation registry lock poisoned")
            .values()
            .filter(|e| e.state == ReservationState::Reserved)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, LaneConfig};
    use proptest::prelude::*;

    const MODEL: &str = "claude-haiku-4.5";

    fn config(limit: u64) -> RouterConfig {
        RouterConfig {
            lanes: vec![LaneConfig {
                lane: Lane::Anthropic,
                models: HashMap::from([(MODEL.to_string(), limit)]),
            }],
            window_secs: 3600,
            grace_secs: 120,
            breaker: BreakerConfig::default(),
            dev_harness_enabled: false,
            usage_log_path: "logs/usage.jsonl".into(),
        }
    }

    fn store(limit: u64) -> QuotaStore {
        QuotaStore::from_config(&config(limit), Utc::now())
    }

    #[test]
    fn test_scenario_reserve_commit_reserve() {
        // limit=1000: Reserve(800) ok, Reserve(300) denied, Commit(750),
        // Reserve(300) ok again.
        let store = store(1000);
        let now = Utc::now();

        let id = store.reserve(Lane::Anthropic, MODEL, 800, now).unwrap();
        assert_eq!(
            store.reserve(Lane::Anthropic, MODEL, 300, now),
            Err(ReserveDenied::InsufficientBudget)
        );

        let receipt = store.commit(id, 750, now).unwrap();
        assert!(!receipt.late);
        assert_eq!(receipt.estimate, 800);

        assert!(store.reserve(Lane::Anthropic, MODEL, 300, now).is_ok());
        let snap = store.snapshot(Lane::Anthropic, MODEL, now).unwrap();
        assert_eq!(snap.consumed, 750);
        assert_eq!(snap.reserved, 300);
    }

    #[test]
    fn test_unknown_bucket_denied() {
        let store = store(1000);
        let now = Utc::now();
        assert_eq!(
            store.reserve(Lane::Zai, MODEL, 10, now),
            Err(ReserveDenied::UnknownBucket)
        );
        assert_eq!(
            store.reserve(Lane::Anthropic, "claude-opus-4", 10, now),
            Err(ReserveDenied::UnknownBucket)
        );
    }

    #[test]
    fn test_zero_estimate_rejected() {
        let store = store(100);
        let now = Utc::now();

        assert_eq!(
            store.reserve(Lane::Anthropic, MODEL, 0, now),
            Err(ReserveDenied::ZeroEstimate)
        );

        // A full bucket must not hand out a phantom reservation either.
        store.reserve(Lane::Anthropic, MODEL, 100, now).unwrap();
        assert_eq!(
            store.reserve(Lane::Anthropic, MODEL, 0, now),
            Err(ReserveDenied::ZeroEstimate)
        );
        assert_eq!(store.outstanding(), 1);
    }

    #[test]
    fn test_release_is_idempotent() {
        let store = store(1000);
        let now = Utc::now();
        let id = store.reserve(Lane::Anthropic, MODEL, 400, now).unwrap();

        assert!(store.release(id, now).is_some());
        let snap = store.snapshot(Lane::Anthropic, MODEL, now).unwrap();
        assert_eq!(snap.reserved, 0);

        // Second release: no-op, counters unchanged.
        assert!(store.release(id, now).is_none());
        let snap = store.snapshot(Lane::Anthropic, MODEL, now).unwrap();
        assert_eq!(snap.reserved, 0);
        assert_eq!(snap.consumed, 0);
    }

    #[test]
    fn test_abandon_reclaims_exactly_once() {
        let store = store(1000);
        let start = Utc::now();
        let grace = Duration::seconds(120);
        let _id = store.reserve(Lane::Anthropic, MODEL, 500, start).unwrap();

        let later = start + Duration::seconds(121);
        let abandoned = store.expire_overdue(later, grace);
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].estimate, 500);

        // Tokens are back in the snapshot.
        let snap = store.snapshot(Lane::Anthropic, MODEL, later).unwrap();
        assert_eq!(snap.reserved, 0);
        assert_eq!(snap.remaining, 1000);

        // A second sweep reclaims nothing more.
        assert!(store.expire_overdue(later, grace).is_empty());
        let snap = store.snapshot(Lane::Anthropic, MODEL, later).unwrap();
        assert_eq!(snap.reserved, 0);
    }

    #[test]
    fn test_release_after_abandon_is_noop() {
        let store = store(1000);
        let start = Utc::now();
        let id = store.reserve(Lane::Anthropic, MODEL, 500, start).unwrap();

        let later = start + Duration::seconds(121);
        store.expire_overdue(later, Duration::seconds(120));

        assert!(store.release(id, later).is_none());
        let snap = store.snapshot(Lane::Anthropic, MODEL, later).unwrap();
        assert_eq!(snap.reserved, 0);
        assert_eq!(snap.consumed, 0);
    }

    #[test]
    fn test_late_commit_after_expiry_counts_once() {
        let store = store(1000);
        let start = Utc::now();
        let id = store.reserve(Lane::Anthropic, MODEL, 500, start).unwrap();

        let later = start + Duration::seconds(121);
        store.expire_overdue(later, Duration::seconds(120));

        let receipt = store.commit(id, 480, later).unwrap();
        assert!(receipt.late);

        // Only the actual total lands in consumed; the reclaimed estimate
        // is not re-subtracted or double-counted.
        let snap = store.snapshot(Lane::Anthropic, MODEL, later).unwrap();
        assert_eq!(snap.consumed, 480);
        assert_eq!(snap.reserved, 0);

        // The entry is gone: a second commit is rejected.
        assert!(store.commit(id, 480, later).is_err());
    }

    #[test]
    fn test_abandoned_entries_purged_after_horizon() {
        let store = store(1000);
        let start = Utc::now();
        let grace = Duration::seconds(120);
        let id = store.reserve(Lane::Anthropic, MODEL, 500, start).unwrap();

        store.expire_overdue(start + Duration::seconds(121), grace);
        // Past the retention horizon the entry disappears entirely.
        store.expire_overdue(start + grace * 20, grace);
        assert!(store.commit(id, 100, start + grace * 20).is_err());
    }

    #[test]
    fn test_reconfigure_keeps_inflight_reservations() {
        let store = store(1000);
        let now = Utc::now();
        let id = store.reserve(Lane::Anthropic, MODEL, 800, now).unwrap();

        // Shrink the limit; the new bucket starts clean.
        store.reconfigure(&config(100), now);
        let snap = store.snapshot(Lane::Anthropic, MODEL, now).unwrap();
        assert_eq!(snap.limit, 100);
        assert_eq!(snap.reserved, 0);

        // The old reservation still commits against its captured bucket.
        let receipt = store.commit(id, 750, now).unwrap();
        assert!(!receipt.late);
        // New bucket is unaffected by the old bucket's commit.
        let snap = store.snapshot(Lane::Anthropic, MODEL, now).unwrap();
        assert_eq!(snap.consumed, 0);
    }

    #[test]
    fn test_unrelated_buckets_do_not_interact() {
        let config = RouterConfig {
            lanes: vec![
                LaneConfig {
                    lane: Lane::Anthropic,
                    models: HashMap::from([(MODEL.to_string(), 100)]),
                },
                LaneConfig {
                    lane: Lane::Zai,
                    models: HashMap::from([(MODEL.to_string(), 100)]),
                },
            ],
            ..self::config(100)
        };
        let store = QuotaStore::from_config(&config, Utc::now());
        let now = Utc::now();

        assert!(store.reserve(Lane::Anthropic, MODEL, 100, now).is_ok());
        // Exhausting anthropic leaves zai untouched.
        assert!(store.reserve(Lane::Zai, MODEL, 100, now).is_ok());
    }

    proptest! {
        // Forces the abandon/late-commit race across arbitrary actuals:
        // the reclaimed estimate and the committed actual must never both
        // count against the budget.
        #[test]
        fn prop_late_commit_never_double_counts(
            estimate in 1u64..=1000,
            actual in 0u64..=2000,
        ) {
            let store = store(1_000_000);
            let start = Utc::now();
            let id = store.reserve(Lane::Anthropic, MODEL, estimate, start).unwrap();

            let later = start + Duration::seconds(121);
            let abandoned = store.expire_overdue(later, Duration::seconds(120));
            prop_assert_eq!(abandoned.len(), 1);

            let receipt = store.commit(id, actual, later).unwrap();
            prop_assert!(receipt.late);

            let snap = store.snapshot(Lane::Anthropic, MODEL, later).unwrap();
            prop_assert_eq!(snap.consumed, actual);
            prop_assert_eq!(snap.reserved, 0);
        }
    }
}
