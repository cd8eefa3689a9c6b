//! Create-if-absent for sensor series

use super::connection::with_timeout;
use super::{SensorSeriesKey, ShardConnection, ShardConnectionManager, ShardLocation};
use crate::store::SeriesMetadata;
use crate::{Error, Result};
use futures::future::join_all;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What [`SeriesProvisioner::ensure_series`] found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionOutcome {
    /// Series was already there; its metadata was left untouched
    Existing,
    /// Series was created
    Created,
}

/// Per-key outcome of a provisioning pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProvisionReport {
    pub created: Vec<String>,
    pub existing: Vec<String>,
    /// (series, error) for every key that could not be ensured
    pub failed: Vec<(String, String)>,
    /// Locations skipped because they had no live connection
    pub skipped_locations: Vec<String>,
}

impl ProvisionReport {
    fn record(&mut self, name: String, outcome: Result<ProvisionOutcome>) {
        match outcome {
            Ok(ProvisionOutcome::Created) => self.created.push(name),
            Ok(ProvisionOutcome::Existing) => self.existing.push(name),
            Err(e) => self.failed.push((name, e.to_string())),
        }
    }

    fn merge(&mut self, other: ProvisionReport) {
        self.created.extend(other.created);
        self.existing.extend(other.existing);
        self.failed.extend(other.failed);
        self.skipped_locations.extend(other.skipped_locations);
    }
}

/// Ensures series exist before first write
#[derive(Debug, Clone)]
pub struct SeriesProvisioner {
    op_timeout: Duration,
}

impl SeriesProvisioner {
    pub fn new(op_timeout: Duration) -> Self {
        Self { op_timeout }
    }

    /// Idempotent create-if-absent.
    ///
    /// Only a missing series leads to a create; any other error from the
    /// existence check propagates. Losing a create race to another writer
    /// counts as success.
    pub async fn ensure_series(
        &self,
        conn: &ShardConnection,
        key: &SensorSeriesKey,
        retention_ms: u64,
        labels: Vec<(String, String)>,
    ) -> Result<ProvisionOutcome> {
        let name = key.series_name();
        let store = conn.store();

        match with_timeout(self.op_timeout, store.info(&name)).await {
            Ok(_) => return Ok(ProvisionOutcome::Existing),
            Err(Error::SeriesNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let metadata = SeriesMetadata {
            retention_ms,
            labels,
        };
        match with_timeout(self.op_timeout, store.create_series(&name, &metadata)).await {
            Ok(()) => {
                debug!(series = %name, retention_ms, "Created series");
                Ok(ProvisionOutcome::Created)
            }
            Err(Error::SeriesExists(_)) => Ok(ProvisionOutcome::Existing),
            Err(e) => Err(e),
        }
    }

    /// Ensure every configured series of one location
    pub async fn provision_location(
        &self,
        manager: &ShardConnectionManager,
        location: &ShardLocation,
    ) -> ProvisionReport {
        let mut report = ProvisionReport::default();
        let Some(conn) = manager.connection_for(location.as_str()) else {
            warn!(location = %location, "Skipping provisioning: no live connection");
            report.skipped_locations.push(location.to_string());
            return report;
        };

        let registry = manager.registry();
        for key in registry.series_keys_for(location) {
            let outcome = self
                .ensure_series(&conn, &key, registry.retention_ms(), registry.labels_for(&key))
                .await;
            if let Err(e) = &outcome {
                warn!(series = %key, error = %e, "Failed to ensure series");
            }
            report.record(key.series_name(), outcome);
        }
        report
    }

    /// Ensure the full (location × type × id) space on every live shard,
    /// locations in parallel. A failure on one key never stops the others.
    pub async fn provision_all(&self, manager: &ShardConnectionManager) -> ProvisionReport {
        let locations = manager.registry().configured_locations();
        let reports = join_all(
            locations
                .iter()
                .map(|location| self.provision_location(manager, location)),
        )
        .await;

        let mut report = ProvisionReport::default();
        for partial in reports {
            report.merge(partial);
        }
        info!(
            created = report.created.len(),
            existing = report.existing.len(),
            failed = report.failed.len(),
            skipped = report.skipped_locations.len(),
            "Series provisioning complete"
        );
        report
    }
}
