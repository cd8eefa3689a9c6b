//! Synthetic telemetry workload
//!
//! Drives historical backfill and live ingestion through the shard router,
//! the same path real sensors would take.

mod generator;

pub use generator::{TelemetryGenerator, WriteReport};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Generator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Write history before going live
    pub backfill_on_start: bool,
    /// How much history to write
    pub backfill_days: u32,
    /// Spacing of historical points
    pub backfill_step_secs: u64,
    /// Spacing of live points
    pub live_interval_secs: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            backfill_on_start: true,
            backfill_days: 7,
            backfill_step_secs: 300,
            live_interval_secs: 30,
        }
    }
}

impl GeneratorConfig {
    pub fn backfill_span(&self) -> Duration {
        Duration::from_secs(u64::from(self.backfill_days) * 86_400)
    }

    pub fn backfill_step(&self) -> Duration {
        Duration::from_secs(self.backfill_step_secs)
    }

    pub fn live_interval(&self) -> Duration {
        Duration::from_secs(self.live_interval_secs)
    }
}
