//! Event Records
//!
//! One JSON object per log line. Field names are a stable contract with
//! downstream log analysis (lane-share and per-lane completion counts);
//! new fields may be added, existing ones never renamed. Decision lines
//! carry `"event":"decision"`; completion lines have no `event` field.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::lane::Lane;

/// Durable record of a routing decision
///
/// Written synchronously at decision time for both grants and denials,
/// before the upstream call begins. Denials omit `upstream` so lane-share
/// analysis only ever counts granted decisions.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionEvent {
    /// Event kind discriminator, always `"decision"`
    pub event: &'static str,

    /// Decision timestamp (ISO 8601)
    pub ts: DateTime<Utc>,

    /// Caller-supplied request id
    pub request_id: String,

    /// Requested model
    pub model: String,

    /// Chosen lane; absent when the request was denied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<Lane>,

    /// Stable reason code (`primary`, `primary_exhausted`,
    /// `primary_circuit_open`, `quota_exhausted`, ...)
    pub reason: String,

    /// Estimated token budget requested
    pub estimated_tokens: u64,
}

impl DecisionEvent {
    /// Build a decision record stamped at `ts`
    pub fn new(
        ts: DateTime<Utc>,
        request_id: impl Into<String>,
        model: impl Into<String>,
        upstream: Option<Lane>,
        reason: impl Into<String>,
        estimated_tokens: u64,
    ) -> Self {
        Self {
            event: "decision",
            ts,
            request_id: request_id.into(),
            model: model.into(),
            upstream,
            reason: reason.into(),
            estimated_tokens,
        }
    }
}

/// Durable record of a completed (or terminated) request
///
/// Written strictly after commit/release/abandon settles the reservation.
#[derive(Debug, Clone, Serialize)]
pub struct UsageEvent {
    /// Completion timestamp (ISO 8601)
    pub ts: DateTime<Utc>,

    /// Upstream HTTP status; 0 for releases and abandons
    pub status: u16,

    /// Lane the reservation was held on
    pub lane: Lane,

    /// Model name
    pub model: String,

    /// Actual input tokens reported by the caller
    pub input_tokens: u64,

    /// Actual output tokens reported by the caller
    pub output_tokens: u64,

    /// Caller-supplied request id
    pub request_id: String,

    /// Extra settlement context (`timeout`, `released`,
    /// `late_commit_after_expiry`); absent for ordinary commits
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_event_schema() {
        let event = DecisionEvent::new(
            Utc::now(),
            "req-1",
            "claude-haiku-4.5",
            Some(Lane::Zai),
            "primary_exhausted",
            1300,
        );
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();

        assert_eq!(value["event"], "decision");
        assert_eq!(value["upstream"], "zai");
        assert_eq!(value["reason"], "primary_exhausted");
        assert_eq!(value["model"], "claude-haiku-4.5");
        assert_eq!(value["estimated_tokens"], 1300);
        assert!(value["ts"].is_string());
    }

    #[test]
    fn test_denied_decision_omits_upstream() {
        let event = DecisionEvent::new(
            Utc::now(),
            "req-2",
            "claude-haiku-4.5",
            None,
            "quota_exhausted",
            500,
        );
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert!(value.get("upstream").is_none());
        assert_eq!(value["reason"], "quota_exhausted");
    }

    #[test]
    fn test_usage_event_schema() {
        let event = UsageEvent {
            ts: Utc::now(),
            status: 200,
            lane: Lane::Anthropic,
            model: "claude-haiku-4.5".to_string(),
            input_tokens: 500,
            output_tokens: 800,
            request_id: "req-3".to_string(),
            reason: None,
        };
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();

        assert!(value.get("event").is_none());
        assert_eq!(value["status"], 200);
        assert_eq!(value["lane"], "anthropic");
        assert_eq!(value["input_tokens"], 500);
        assert_eq!(value["output_tokens"], 800);
        assert!(value.get("reason").is_none());
    }
}
