//! Quota Accounting
//!
//! Per-(lane, model) token budgets with atomic reserve/commit/release.
//! A reservation holds an estimated budget against one bucket until it is
//! reconciled with actual usage (commit), returned (release), or swept as
//! abandoned after the grace period.
//!
//! Each bucket carries its own lock, so reservations on unrelated
//! (lane, model) pairs never contend. The upstream call happens entirely
//! outside any bucket lock.

pub mod bucket;
pub mod reservation;
pub mod store;

pub use bucket::{BucketKey, BucketSnapshot, QuotaBucket};
pub use reservation::{AbandonedReservation, CommitReceipt, ReleaseReceipt, ReservationId};
pub use store::{QuotaStore, ReserveDenied};
