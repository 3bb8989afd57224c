//! Reservations
//!
//! A reservation is an opaque token for an estimated budget held against
//! one bucket. It is terminated by exactly one of commit, release, or
//! abandonment (grace-period timeout).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::lane::Lane;
use crate::quota::bucket::QuotaBucket;

/// Opaque reservation token handed to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationId(pub Uuid);

impl ReservationId {
    /// Mint a fresh token
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ReservationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of a tracked reservation
///
/// `Reserved` is the only state with open quota exposure. Commit and
/// release remove the entry; abandonment keeps it around so a late commit
/// can still be matched to its bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReservationState {
    Reserved,
    Abandoned { at: DateTime<Utc> },
}

/// Registry entry for one outstanding or abandoned reservation
#[derive(Debug)]
pub(crate) struct ReservationEntry {
    pub lane: Lane,
    pub model: String,
    pub estimate: u64,
    pub granted_at: DateTime<Utc>,
    /// Bucket captured at grant time; survives config reloads
    pub bucket: Arc<QuotaBucket>,
    pub state: ReservationState,
}

/// Outcome of a successful commit
#[derive(Debug, Clone)]
pub struct CommitReceipt {
    pub lane: Lane,
    pub model: String,
    pub estimate: u64,
    /// True when the reservation had already been abandoned
    pub late: bool,
}

/// Outcome of a release that actually reclaimed budget
#[derive(Debug, Clone)]
pub struct ReleaseReceipt {
    pub lane: Lane,
    pub model: String,
    pub estimate: u64,
}

/// One reservation swept as abandoned
#[derive(Debug, Clone)]
pub struct AbandonedReservation {
    pub id: ReservationId,
    pub lane: Lane,
    pub model: String,
    pub estimate: u64,
}
