//! Development Harness
//!
//! Synthetic usage replay for local testing. A replay injects completions
//! through the same recording path as real traffic, so quota consumption,
//! the usage log, and the aggregates all reflect the injected load with
//! exact counts. Mounted only when the configuration enables it.

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::RouteDenied;
use crate::router::Router;

fn default_repeat() -> u64 {
    1
}

/// One synthetic usage burst
#[derive(Debug, Clone, Deserialize)]
pub struct SimUsageRequest {
    pub model: String,

    /// Input tokens per injected completion
    #[serde(rename = "in")]
    pub input_tokens: u64,

    /// Output tokens per injected completion
    #[serde(rename = "out")]
    pub output_tokens: u64,

    /// Number of completions to inject
    #[serde(default = "default_repeat")]
    pub repeat: u64,

    /// Pause between injections in milliseconds
    #[serde(default)]
    pub interval_ms: u64,
}

/// Replay a synthetic burst through the router
///
/// Each iteration records exactly one completion; `repeat` iterations
/// yield exactly `repeat` usage lines and `repeat * (in + out)` tokens of
/// quota consumption. Stops early only if the model disappears from the
/// configuration mid-replay.
pub async fn replay(router: Arc<Router>, request: SimUsageRequest) -> Result<u64, RouteDenied> {
    info!(
        model = %request.model,
        repeat = request.repeat,
        interval_ms = request.interval_ms,
        "starting synthetic usage replay"
    );

    let mut injected = 0u64;
    for _ in 0..request.repeat {
        router.synthetic_completion(
            &request.model,
            request.input_tokens,
            request.output_tokens,
            chrono::Utc::now(),
        )?;
        injected += 1;
        if request.interval_ms > 0 {
            tokio::time::sleep(Duration::from_millis(request.interval_ms)).await;
        }
    }

    info!(injected, "synthetic usage replay complete");
    Ok(injected)
}
