//! Lanegate Library
//!
//! Quota-aware request routing for an LLM API gateway that fans traffic
//! out over multiple upstream lanes. The router reserves estimated token
//! budget before a request dials out, reconciles to actual usage on
//! completion, skips lanes whose circuit is open, and records every
//! decision and completion to an append-only JSONL log.

pub mod config;
pub mod error;
pub mod harness;
pub mod lane;
pub mod metrics;
pub mod quota;
pub mod router;
pub mod server;
pub mod usage;

pub use config::{ConfigHandle, RouterConfig};
pub use error::{QuotaError, RouteDenied};
pub use lane::Lane;
pub use metrics::MetricsExporter;
pub use quota::{QuotaStore, ReservationId};
pub use router::{Router, RouteGrant};
pub use usage::UsageRecorder;
