//! Request Router
//!
//! Chooses an upstream lane per request in configured priority order,
//! obtains a quota reservation on the first eligible lane, and emits the
//! decision/usage telemetry. Once a reservation is granted the decision is
//! final for that attempt; an upstream failure is surfaced to the caller,
//! never silently retried on another lane. A caller-level retry is a new,
//! independent attempt with its own decision event.

pub mod breaker;

pub use breaker::CircuitBreaker;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;
use tracing::{info, warn};

use crate::config::{ConfigHandle, RouterConfig};
use crate::error::{QuotaError, RouteDenied};
use crate::lane::Lane;
use crate::quota::{QuotaStore, ReservationId, ReserveDenied};
use crate::usage::{DecisionEvent, UsageEvent, UsageRecorder};

/// A granted routing decision
#[derive(Debug, Clone)]
pub struct RouteGrant {
    /// Chosen upstream lane
    pub lane: Lane,

    /// Reservation token to settle with commit or release
    pub reservation: ReservationId,

    /// Stable reason code recorded in the decision log
    pub reason: &'static str,
}

/// Quota-aware multi-upstream router
///
/// Owns the quota store and usage recorder injected at startup; no
/// ambient singletons, so tests run against fresh instances.
#[derive(Debug)]
pub struct Router {
    config: Arc<ConfigHandle>,
    store: Arc<QuotaStore>,
    recorder: Arc<UsageRecorder>,
    breakers: Mutex<HashMap<Lane, CircuitBreaker>>,
}

impl Router {
    /// Wire a router from its collaborators
    pub fn new(
        config: Arc<ConfigHandle>,
        store: Arc<QuotaStore>,
        recorder: Arc<UsageRecorder>,
    ) -> Self {
        let breakers = Self::build_breakers(&config.current());
        Self {
            config,
            store,
            recorder,
            breakers: Mutex::new(breakers),
        }
    }

    fn build_breakers(config: &RouterConfig) -> HashMap<Lane, CircuitBreaker> {
        config
            .lanes
            .iter()
            .map(|l| {
                (
                    l.lane,
                    CircuitBreaker::new(
                        config.breaker.failure_threshold,
                        chrono::Duration::from_std(config.breaker.cooldown())
                            .unwrap_or_else(|_| chrono::Duration::seconds(30)),
                    ),
                )
            })
            .collect()
    }

    /// Swap in a new configuration snapshot
    ///
    /// Rebuilds buckets and breakers; in-flight reservations keep the
    /// bucket they were granted against.
    pub fn reload(&self, config: RouterConfig, now: DateTime<Utc>) {
        self.store.reconfigure(&config, now);
        let mut breakers = self.breakers.lock().expect("breaker map lock poisoned");
        *breakers = Self::build_breakers(&config);
        drop(breakers);
        self.config.swap(config);
        info!("configuration reloaded");
    }

    /// Quota store handle (snapshots, metrics)
    pub fn store(&self) -> &Arc<QuotaStore> {
        &self.store
    }

    /// Usage recorder handle (aggregates, metrics)
    pub fn recorder(&self) -> &Arc<UsageRecorder> {
        &self.recorder
    }

    /// Current configuration snapshot
    pub fn config(&self) -> Arc<RouterConfig> {
        self.config.current()
    }

    /// Decide a lane and reserve the estimated budget
    ///
    /// Lanes are tried in priority order; breaker-open lanes are skipped.
    /// A decision event is written synchronously before returning, for
    /// grants and denials alike.
    pub fn decide_and_reserve(
        &self,
        request_id: &str,
        model: &str,
        est_input_tokens: u64,
        est_output_tokens: u64,
        now: DateTime<Utc>,
    ) -> Result<RouteGrant, RouteDenied> {
        let estimate = est_input_tokens.saturating_add(est_output_tokens);
        if estimate == 0 {
            // Caller bug, not a routing outcome; no decision event.
            warn!(request_id, model, "rejecting zero-token estimate");
            return Err(RouteDenied::InvalidEstimate);
        }

        let config = self.config.current();
        let lanes: Vec<Lane> = config.lanes_for_model(model).collect();
        if lanes.is_empty() {
            let denied = RouteDenied::UnknownModel {
                model: model.to_string(),
            };
            self.log_decision(request_id, model, None, denied.reason(), estimate, now);
            return Err(denied);
        }

        let mut saw_quota_denial = false;
        let mut saw_circuit_open = false;

        for (position, lane) in lanes.iter().copied().enumerate() {
            if self.breaker_open(lane, now) {
                saw_circuit_open = true;
                continue;
            }

            match self.store.reserve(lane, model, estimate, now) {
                Ok(reservation) => {
                    let reason = if position == 0 {
                        "primary"
                    } else if saw_quota_denial {
                        "primary_exhausted"
                    } else {
                        "primary_circuit_open"
                    };
                    self.log_decision(request_id, model, Some(lane), reason, estimate, now);
                    return Ok(RouteGrant {
                        lane,
                        reservation,
                        reason,
                    });
                }
                Err(ReserveDenied::InsufficientBudget) => saw_quota_denial = true,
                Err(ReserveDenied::UnknownBucket) => continue,
                // Unreachable behind the estimate check above.
                Err(ReserveDenied::ZeroEstimate) => return Err(RouteDenied::InvalidEstimate),
            }
        }

        let denied = if saw_quota_denial || !saw_circuit_open {
            RouteDenied::QuotaExhausted {
                model: model.to_string(),
            }
        } else {
            RouteDenied::AllLanesCircuitOpen {
                model: model.to_string(),
            }
        };
        self.log_decision(request_id, model, None, denied.reason(), estimate, now);
        Err(denied)
    }

    /// Reconcile a reservation with the actual token usage
    ///
    /// Never fails retroactively on quota grounds; a commit arriving
    /// after abandonment is accepted and tagged `late_commit_after_expiry`.
    /// The upstream status feeds the lane's circuit breaker.
    pub fn commit_usage(
        &self,
        request_id: &str,
        reservation: ReservationId,
        actual_input_tokens: u64,
        actual_output_tokens: u64,
        status: u16,
        now: DateTime<Utc>,
    ) -> Result<(), QuotaError> {
        let total = actual_input_tokens.saturating_add(actual_output_tokens);
        let receipt = self.store.commit(reservation, total, now)?;

        self.observe_status(receipt.lane, status, now);
        self.recorder.record_usage(&UsageEvent {
            ts: now,
            status,
            lane: receipt.lane,
            model: receipt.model,
            input_tokens: actual_input_tokens,
            output_tokens: actual_output_tokens,
            request_id: request_id.to_string(),
            reason: receipt.late.then_some("late_commit_after_expiry"),
        });
        Ok(())
    }

    /// Release a reservation after an upstream failure
    ///
    /// Idempotent: repeated releases and releases after abandonment are
    /// no-ops. A real release counts as a lane failure for the breaker.
    pub fn release_reservation(
        &self,
        request_id: &str,
        reservation: ReservationId,
        now: DateTime<Utc>,
    ) {
        let Some(receipt) = self.store.release(reservation, now) else {
            return;
        };

        self.record_failure(receipt.lane, now);
        self.recorder.record_usage(&UsageEvent {
            ts: now,
            status: 0,
            lane: receipt.lane,
            model: receipt.model,
            input_tokens: 0,
            output_tokens: 0,
            request_id: request_id.to_string(),
            reason: Some("released"),
        });
    }

    /// Sweep reservations past the grace period
    ///
    /// Abandonment reclaims each estimate exactly once and logs the
    /// terminal event with reason `timeout`. Abandons do not feed the
    /// breaker; a client hang says nothing about the upstream.
    pub fn abandon_expired(&self, now: DateTime<Utc>) -> usize {
        let grace = self.config.current().grace();
        let abandoned = self.store.expire_overdue(now, grace);
        for entry in &abandoned {
            warn!(
                id = %entry.id,
                lane = %entry.lane,
                model = %entry.model,
                estimate = entry.estimate,
                "reservation abandoned after grace period"
            );
            self.recorder.record_usage(&UsageEvent {
                ts: now,
                status: 0,
                lane: entry.lane,
                model: entry.model.clone(),
                input_tokens: 0,
                output_tokens: 0,
                request_id: entry.id.to_string(),
                reason: Some("timeout"),
            });
        }
        abandoned.len()
    }

    /// Record a synthetic completion through the production telemetry path
    ///
    /// Dev-harness entry: picks the highest-priority lane carrying the
    /// model and records the usage exactly as `commit_usage` would
    /// (aggregates, usage event, quota-visible consumption), without a
    /// prior reservation so the injector's count contract holds.
    pub fn synthetic_completion(
        &self,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        now: DateTime<Utc>,
    ) -> Result<(), RouteDenied> {
        let config = self.config.current();
        let lane = config
            .lanes_for_model(model)
            .next()
            .ok_or_else(|| RouteDenied::UnknownModel {
                model: model.to_string(),
            })?;

        let total = input_tokens.saturating_add(output_tokens);
        self.store.record_unreserved(lane, model, total, now);
        self.recorder.record_usage(&UsageEvent {
            ts: now,
            status: 200,
            lane,
            model: model.to_string(),
            input_tokens,
            output_tokens,
            request_id: format!("sim-{}", uuid::Uuid::new_v4()),
            reason: None,
        });
        Ok(())
    }

    fn log_decision(
        &self,
        request_id: &str,
        model: &str,
        upstream: Option<Lane>,
        reason: &str,
        estimated_tokens: u64,
        now: DateTime<Utc>,
    ) {
        self.recorder.record_decision(&DecisionEvent::new(
            now,
            request_id,
            model,
            upstream,
            reason,
            estimated_tokens,
        ));
    }

    fn breaker_open(&self, lane: Lane, now: DateTime<Utc>) -> bool {
        let breakers = self.breakers.lock().expect("breaker map lock poisoned");
        breakers.get(&lane).is_some_and(|b| b.is_open(now))
    }

    fn observe_status(&self, lane: Lane, status: u16, now: DateTime<Utc>) {
        // 0 (network error) and 5xx count as upstream failures.
        if status == 0 || status >= 500 {
            self.record_failure(lane, now);
        } else {
            self.record_success(lane);
        }
    }

    fn record_failure(&self, lane: Lane, now: DateTime<Utc>) {
        let breakers = self.breakers.lock().expect("breaker map lock poisoned");
        if let Some(breaker) = breakers.get(&lane) {
            breaker.record_failure(now);
        }
    }

    fn record_success(&self, lane: Lane) {
        let breakers = self.breakers.lock().expect("breaker map lock poisoned");
        if let Some(breaker) = breakers.get(&lane) {
            breaker.record_success();
        }
    }
}

/// Run the abandonment sweep on an interval until the task is dropped
pub fn spawn_sweeper(router: Arc<Router>, every: StdDuration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let swept = router.abandon_expired(Utc::now());
            if swept > 0 {
                info!(swept, "expired reservations swept");
            }
        }
    })
}
