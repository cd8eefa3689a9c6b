//! Long-term store interface

use crate::sharding::SensorSeriesKey;
use crate::store::DataPoint;
use crate::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

/// One point as the long-term store sees it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchivePoint {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, f64>,
    pub timestamp_ns: i64,
}

impl ArchivePoint {
    /// Measurement is the sensor type; tags carry location and sensor id
    pub fn from_sample(key: &SensorSeriesKey, point: &DataPoint) -> Self {
        let mut tags = BTreeMap::new();
        tags.insert("location".to_string(), key.location.to_string());
        tags.insert("sensor_id".to_string(), key.sensor_id.to_string());

        let mut fields = BTreeMap::new();
        fields.insert("value".to_string(), point.value);

        Self {
            measurement: key.sensor_type.as_str().to_string(),
            tags,
            fields,
            timestamp_ns: point.timestamp_ms.saturating_mul(1_000_000),
        }
    }

    /// Identity under which the sink upserts
    pub fn identity(&self) -> (String, BTreeMap<String, String>, i64) {
        (self.measurement.clone(), self.tags.clone(), self.timestamp_ns)
    }
}

/// Write side of the long-term store.
///
/// Writes must be idempotent per (measurement, tags, timestamp): writing the
/// same point twice leaves one point with the last value.
#[async_trait]
pub trait ArchiveSink: Send + Sync {
    /// Write the whole batch in one call
    async fn write(&self, batch: &[ArchivePoint]) -> Result<()>;

    /// Make the sink ready for writes: reachable, destination present.
    /// Called before the first flush and again after a failed one.
    async fn check(&self) -> Result<()> {
        Ok(())
    }
}

type PointIdentity = (String, BTreeMap<String, String>, i64);

/// Upserting in-memory sink
#[derive(Debug, Default)]
pub struct MemorySink {
    points: RwLock<HashMap<PointIdentity, BTreeMap<String, f64>>>,
    writes: AtomicU64,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct stored points
    pub fn len(&self) -> usize {
        self.points.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.read().is_empty()
    }

    /// Number of successful write calls
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Stored value of `field` for one point identity
    pub fn value(
        &self,
        measurement: &str,
        tags: &BTreeMap<String, String>,
        timestamp_ns: i64,
        field: &str,
    ) -> Option<f64> {
        self.points
            .read()
            .get(&(measurement.to_string(), tags.clone(), timestamp_ns))
            .and_then(|fields| fields.get(field).copied())
    }

    /// All stored points, ordered by identity
    pub fn points(&self) -> Vec<ArchivePoint> {
        let mut points: Vec<ArchivePoint> = self
            .points
            .read()
            .iter()
            .map(|((measurement, tags, timestamp_ns), fields)| ArchivePoint {
                measurement: measurement.clone(),
                tags: tags.clone(),
                fields: fields.clone(),
                timestamp_ns: *timestamp_ns,
            })
            .collect();
        points.sort_by(|a, b| a.identity().cmp(&b.identity()));
        points
    }
}

#[async_trait]
impl ArchiveSink for MemorySink {
    async fn write(&self, batch: &[ArchivePoint]) -> Result<()> {
        let mut points = self.points.write();
        for point in batch {
            points
                .entry(point.identity())
                .or_default()
                .extend(point.fields.iter().map(|(k, v)| (k.clone(), *v)));
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
