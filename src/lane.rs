//! Upstream Lane Identifiers
//!
//! Lanes are the named upstream targets requests can be routed to. The set
//! is closed: configuration naming an unknown lane is rejected at load time
//! instead of failing per-request.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A named upstream provider lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    /// Primary Anthropic API lane
    Anthropic,
    /// Z.AI Anthropic-compatible offload lane
    Zai,
    /// Local mock upstream used in tests and staging
    Test,
}

impl Lane {
    /// Stable lowercase name, matching the serialized form
    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Anthropic => "anthropic",
            Lane::Zai => "zai",
            Lane::Test => "test",
        }
    }

    /// All known lanes
    pub fn all() -> &'static [Lane] {
        &[Lane::Anthropic, Lane::Zai, Lane::Test]
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Lane {
    type Err = UnknownLane;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "anthropic" => Ok(Lane::Anthropic),
            "zai" => Ok(Lane::Zai),
            "test" => Ok(Lane::Test),
            other => Err(UnknownLane(other.to_string())),
        }
    }
}

/// Error for a lane name outside the closed set
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown lane: {0}")]
pub struct UnknownLane(pub String);
