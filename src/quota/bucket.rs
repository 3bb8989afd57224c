//! Quota Buckets
//!
//! A bucket tracks one (lane, model) token budget over a rolling window.
//! Reserve admission is atomic per bucket: a reservation is granted only
//! while `consumed + reserved + estimate <= limit`. Commit replaces the
//! estimate with actual usage and may push `consumed` past `limit`; that
//! overshoot is recorded, never retroactively rejected.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Mutex;

use crate::lane::Lane;

/// Key identifying one quota bucket
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize)]
pub struct BucketKey {
    /// Upstream lane
    pub lane: Lane,

    /// Model name
    pub model: String,
}

impl BucketKey {
    /// Create a new bucket key
    pub fn new(lane: Lane, model: impl Into<String>) -> Self {
        Self {
            lane,
            model: model.into(),
        }
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.lane, self.model)
    }
}

/// Read-only view of a bucket's counters
#[derive(Debug, Clone, Serialize)]
pub struct BucketSnapshot {
    /// Window token budget
    pub limit: u64,

    /// Tokens reconciled into the current window
    pub consumed: u64,

    /// Tokens held by outstanding reservations
    pub reserved: u64,

    /// Budget still grantable (`limit - consumed - reserved`, floored at 0)
    pub remaining: u64,

    /// When the current window resets
    pub window_end: DateTime<Utc>,
}

#[derive(Debug)]
struct BucketState {
    consumed: u64,
    reserved: u64,
    window_end: DateTime<Utc>,
}

/// One (lane, model) quota bucket
#[derive(Debug)]
pub struct QuotaBucket {
    limit: u64,
    window: Duration,
    state: Mutex<BucketState>,
}

impl QuotaBucket {
    /// Create a bucket whose first window starts at `now`
    pub fn new(limit: u64, window: Duration, now: DateTime<Utc>) -> Self {
        Self {
            limit,
            window,
            state: Mutex::new(BucketState {
                consumed: 0,
                reserved: 0,
                window_end: now + window,
            }),
        }
    }

    // Lazy rollover: reset consumed when the window has elapsed, skipping
    // any whole windows with no traffic. Reservations granted before the
    // rollover keep accounting against this bucket object.
    fn roll_window(&self, state: &mut BucketState, now: DateTime<Utc>) {
        if now < state.window_end {
            return;
        }
        while state.window_end <= now {
            state.window_end += self.window;
        }
        state.consumed = 0;
    }

    /// Try to reserve an estimated budget
    ///
    /// Returns false when granting would exceed the limit. The admission
    /// check and the `reserved` increment happen under one lock acquisition.
    pub fn try_reserve(&self, estimate: u64, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock().expect("bucket lock poisoned");
        self.roll_window(&mut state, now);

        let committed = state
            .consumed
            .saturating_add(state.reserved)
            .saturating_add(estimate);
        if committed > self.limit {
            return false;
        }
        state.reserved += estimate;
        true
    }

    /// Reconcile a reservation into consumed usage
    ///
    /// Moves `estimate` out of `reserved` and adds the actual total to
    /// `consumed`. Actuals above the estimate are accepted as-is.
    pub fn commit(&self, estimate: u64, actual_total: u64, now: DateTime<Utc>) {
        let mut state = self.state.lock().expect("bucket lock poisoned");
        self.roll_window(&mut state, now);
        state.reserved = state.reserved.saturating_sub(estimate);
        state.consumed = state.consumed.saturating_add(actual_total);
    }

    /// Return a reservation's estimate to the budget
    pub fn release(&self, estimate: u64, now: DateTime<Utc>) {
        let mut state = self.state.lock().expect("bucket lock poisoned");
        self.roll_window(&mut state, now);
        state.reserved = state.reserved.saturating_sub(estimate);
    }

    /// Record usage that never held a reservation
    ///
    /// Used for late commits after abandonment (the estimate was already
    /// reclaimed) and for synthetic dev-harness completions.
    pub fn record_unreserved(&self, actual_total: u64, now: DateTime<Utc>) {
        let mut state = self.state.lock().expect("bucket lock poisoned");
        self.roll_window(&mut state, now);
        state.consumed = state.consumed.saturating_add(actual_total);
    }

    /// Read-only counters, safe under concurrent mutation
    pub fn snapshot(&self, now: DateTime<Utc>) -> BucketSnapshot {
        let mut state = self.state.lock().expect("bucket lock poisoned");
        self.roll_window(&mut state, now);
        BucketSnapshot {
            limit: self.limit,
            consumed: state.consumed,
            reserved: state.reserved,
            remaining: self
                .limit
                .saturating_sub(state.consumed)
                .saturating_sub(state.reserved),
            window_end: state.window_end,
        }
    }
}
