//! Metrics Exporter
//!
//! Pull-based, read-only rendering of quota bucket snapshots and usage
//! aggregates in Prometheus text format. Each render builds a fresh
//! registry from current state; nothing here mutates the store or the
//! recorder, so it is safe under arbitrary concurrency.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use prometheus::{Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

use crate::quota::QuotaStore;
use crate::usage::UsageRecorder;

/// Read-only metrics view over the store and recorder
#[derive(Debug, Clone)]
pub struct MetricsExporter {
    store: Arc<QuotaStore>,
    recorder: Arc<UsageRecorder>,
}

impl MetricsExporter {
    /// Wire the exporter to its data sources
    pub fn new(store: Arc<QuotaStore>, recorder: Arc<UsageRecorder>) -> Self {
        Self { store, recorder }
    }

    /// Render all metrics as plaintext name/label/value lines
    pub fn render(&self, now: DateTime<Utc>) -> Result<String> {
        let registry = Registry::new();

        let quota_labels = &["lane", "model"];
        let limit = register_gauge_vec(
            &registry,
            "lanegate_quota_limit_tokens",
            "Window token budget per bucket",
            quota_labels,
        )?;
        let consumed = register_gauge_vec(
            &registry,
            "lanegate_quota_consumed_tokens",
            "Tokens reconciled into the current window",
            quota_labels,
        )?;
        let reserved = register_gauge_vec(
            &registry,
            "lanegate_quota_reserved_tokens",
            "Tokens held by outstanding reservations",
            quota_labels,
        )?;
        let remaining = register_gauge_vec(
            &registry,
            "lanegate_quota_remaining_tokens",
            "Budget still grantable per bucket",
            quota_labels,
        )?;

        for (key, snap) in self.store.snapshots(now) {
            let labels = &[key.lane.as_str(), key.model.as_str()];
            limit.with_label_values(labels).set(snap.limit as i64);
            consumed.with_label_values(labels).set(snap.consumed as i64);
            reserved.with_label_values(labels).set(snap.reserved as i64);
            remaining
                .with_label_values(labels)
                .set(snap.remaining as i64);
        }

        let requests = register_counter_vec(
            &registry,
            "lanegate_usage_requests_total",
            "Completions recorded per lane/model",
            quota_labels,
        )?;
        let input_tokens = register_counter_vec(
            &registry,
            "lanegate_usage_input_tokens_total",
            "Input tokens recorded per lane/model",
            quota_labels,
        )?;
        let output_tokens = register_counter_vec(
            &registry,
            "lanegate_usage_output_tokens_total",
            "Output tokens recorded per lane/model",
            quota_labels,
        )?;
        let errors = register_counter_vec(
            &registry,
            "lanegate_usage_errors_total",
            "Failed completions recorded per lane/model",
            quota_labels,
        )?;

        for agg in self.recorder.aggregates() {
            let labels = &[agg.lane.as_str(), agg.model.as_str()];
            requests.with_label_values(labels).inc_by(agg.requests);
            input_tokens
                .with_label_values(labels)
                .inc_by(agg.input_tokens);
            output_tokens
                .with_label_values(labels)
                .inc_by(agg.output_tokens);
            errors.with_label_values(labels).inc_by(agg.errors);
        }

        let dropped = IntGauge::new(
            "lanegate_usage_log_dropped_total",
            "Usage log events dropped because the sink was unavailable",
        )
        .context("failed to create drop counter metric")?;
        dropped.set(self.recorder.dropped_events() as i64);
        registry
            .register(Box::new(dropped))
            .context("failed to register drop counter metric")?;

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&registry.gather(), &mut buffer)
            .context("failed to encode metrics")?;
        String::from_utf8(buffer).context("invalid UTF-8 in metrics output")
    }
}

fn register_gauge_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntGaugeVec> {
    let vec = IntGaugeVec::new(Opts::new(name, help), labels)
        .with_context(|| format!("failed to create metric {name}"))?;
    registry
        .register(Box::new(vec.clone()))
        .with_context(|| format!("failed to register metric {name}"))?;
    Ok(vec)
}

fn register_counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec> {
    let vec = IntCounterVec::new(Opts::new(name, help), labels)
        .with_context(|| format!("failed to create metric {name}"))?;
    registry
        .register(Box::new(vec.clone()))
        .with_context(|| format!("failed to register metric {name}"))?;
    Ok(vec)
}
