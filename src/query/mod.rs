//! Read-side operations over the sharded store
//!
//! Everything here goes through [`ShardRouter`]: single-series reads for one
//! sensor, per-location counts, key search across live shards, and fan-out
//! summaries that keep per-series failures visible.

use crate::clock::Clock;
use crate::sharding::{
    QueryFailure, SensorSeriesKey, SensorType, SeriesFilter, ShardKeyCodec, ShardRouter,
};
use crate::store::DataPoint;
use crate::{Error, Result};
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Look-back windows accepted by sensor data queries.
///
/// Deserialization is lenient: an unrecognised window falls back to the last
/// hour. [`FromStr`] stays strict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum TimeRange {
    #[default]
    #[serde(rename = "1h")]
    LastHour,
    #[serde(rename = "24h")]
    LastDay,
    #[serde(rename = "7d")]
    LastWeek,
    #[serde(rename = "30d")]
    LastMonth,
}

impl TimeRange {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LastHour => "1h",
            Self::LastDay => "24h",
            Self::LastWeek => "7d",
            Self::LastMonth => "30d",
        }
    }

    pub fn duration(&self) -> Duration {
        let hours = match self {
            Self::LastHour => 1,
            Self::LastDay => 24,
            Self::LastWeek => 7 * 24,
            Self::LastMonth => 30 * 24,
        };
        Duration::from_secs(hours * 3600)
    }
}

impl<'de> Deserialize<'de> for TimeRange {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(raw.parse().unwrap_or_else(|_| {
            debug!(time_range = %raw, "Unknown time range, using 1h");
            Self::LastHour
        }))
    }
}

impl FromStr for TimeRange {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "1h" => Ok(Self::LastHour),
            "24h" => Ok(Self::LastDay),
            "7d" => Ok(Self::LastWeek),
            "30d" => Ok(Self::LastMonth),
            other => Err(Error::Config(format!(
                "invalid time range '{}'; expected 1h, 24h, 7d or 30d",
                other
            ))),
        }
    }
}

/// Min, max, mean and count of a set of points
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub count: usize,
}

impl SeriesStats {
    /// `None` for an empty slice
    pub fn from_points(points: &[DataPoint]) -> Option<Self> {
        if points.is_empty() {
            return None;
        }
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        for point in points {
            min = min.min(point.value);
            max = max.max(point.value);
            sum += point.value;
        }
        Some(Self {
            min,
            max,
            avg: sum / points.len() as f64,
            count: points.len(),
        })
    }
}

/// Points and statistics of one sensor over a look-back window
#[derive(Debug, Clone, Serialize)]
pub struct SensorData {
    pub sensor_type: SensorType,
    pub location: String,
    pub sensor_id: u32,
    pub time_range: TimeRange,
    pub data: Vec<DataPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<SeriesStats>,
}

/// Sample count of one sensor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorCount {
    pub sensor_type: SensorType,
    pub sensor_id: u32,
    pub count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Sample counts of every sensor of one location
#[derive(Debug, Clone, Serialize)]
pub struct CountReport {
    pub location: String,
    /// Sensor type the counts were restricted to, or `all`
    pub sensor_type_filter: String,
    pub counts: Vec<SensorCount>,
}

/// One series matched by a key search
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub key: String,
    pub sensor_type: SensorType,
    pub location: String,
    pub sensor_id: u32,
    pub samples: u64,
    pub first_timestamp: String,
    pub last_timestamp: String,
}

/// Outcome of a key search across shards
#[derive(Debug, Clone, Serialize)]
pub struct SearchReport {
    pub query: String,
    pub keys_found: usize,
    pub keys_processed: usize,
    pub results: Vec<SearchHit>,
    /// Shards that could not be scanned
    pub unavailable_shards: Vec<String>,
}

/// First and last values of one series in a fan-out summary
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesSummary {
    pub location: String,
    pub sensor_type: SensorType,
    pub sensor_id: u32,
    pub points: usize,
    pub first_value: Option<f64>,
    pub last_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<QueryFailure>,
}

/// Per-series rows of a fan-out summary
#[derive(Debug, Clone, Serialize)]
pub struct SummaryReport {
    pub start_ms: i64,
    pub end_ms: i64,
    pub total_points: usize,
    pub rows: Vec<SeriesSummary>,
    pub degraded_locations: Vec<String>,
}

/// Query facade used by the HTTP API and the admin tool
#[derive(Clone)]
pub struct TelemetryQueries {
    router: ShardRouter,
    clock: Arc<dyn Clock>,
}

impl TelemetryQueries {
    pub fn new(router: ShardRouter, clock: Arc<dyn Clock>) -> Self {
        Self { router, clock }
    }

    pub fn router(&self) -> &ShardRouter {
        &self.router
    }

    /// Points and statistics of one sensor over `range`, ending now
    pub async fn sensor_data(
        &self,
        sensor_type: SensorType,
        location: &str,
        sensor_id: u32,
        range: TimeRange,
    ) -> Result<SensorData> {
        let location = self.router.registry().location(location)?;
        let key = SensorSeriesKey::new(sensor_type, location, sensor_id);

        let end = self.clock.now_millis();
        let start = end - range.duration().as_millis() as i64;
        let data = self.router.range_query(&key, start, end).await?;
        let stats = SeriesStats::from_points(&data);

        Ok(SensorData {
            sensor_type,
            location: key.location.to_string(),
            sensor_id,
            time_range: range,
            data,
            stats,
        })
    }

    /// Sample count of every sensor of `location`, optionally one type only.
    ///
    /// A sensor whose series does not exist is reported with a zero count and
    /// `sensor_not_found`; any other failure aborts the report.
    pub async fn sensor_counts(
        &self,
        location: &str,
        sensor_type: Option<SensorType>,
    ) -> Result<CountReport> {
        let registry = self.router.registry();
        let location = registry.location(location)?;
        let types: Vec<SensorType> = match sensor_type {
            Some(only) => vec![only],
            None => registry.sensor_types().to_vec(),
        };

        let mut counts = Vec::new();
        for t in types {
            for id in registry.sensor_ids() {
                let key = SensorSeriesKey::new(t, location.clone(), id);
                let entry = match self.router.series_info(&key).await {
                    Ok(info) => SensorCount {
                        sensor_type: t,
                        sensor_id: id,
                        count: info.total_samples,
                        error: None,
                    },
                    Err(Error::SeriesNotFound(_)) => SensorCount {
                        sensor_type: t,
                        sensor_id: id,
                        count: 0,
                        error: Some("sensor_not_found".to_string()),
                    },
                    Err(e) => return Err(e),
                };
                counts.push(entry);
            }
        }

        Ok(CountReport {
            location: location.to_string(),
            sensor_type_filter: sensor_type
                .map(|t| t.as_str().to_string())
                .unwrap_or_else(|| "all".to_string()),
            counts,
        })
    }

    /// Series whose key contains `query` (case-insensitive), across every
    /// shard that can be scanned. Shards that cannot are listed, not fatal.
    pub async fn search(&self, query: &str) -> SearchReport {
        let needle = query.to_lowercase();
        let mut report = SearchReport {
            query: needle.clone(),
            keys_found: 0,
            keys_processed: 0,
            results: Vec::new(),
            unavailable_shards: Vec::new(),
        };

        for location in self.router.registry().configured_locations() {
            let keys = match self.router.scan_series(location.as_str()).await {
                Ok(keys) => keys,
                Err(e) => {
                    debug!(location = %location, error = %e, "Shard skipped by search");
                    report.unavailable_shards.push(location.to_string());
                    continue;
                }
            };

            for name in keys.into_iter().filter(|k| k.contains(&needle)) {
                report.keys_found += 1;
                match self.search_hit(&name).await {
                    Ok(hit) => {
                        report.keys_processed += 1;
                        report.results.push(hit);
                    }
                    Err(e) => warn!(key = %name, error = %e, "Failed to describe series"),
                }
            }
        }
        report
    }

    async fn search_hit(&self, name: &str) -> Result<SearchHit> {
        let key = ShardKeyCodec::decode(name)?;
        let info = self.router.series_info(&key).await?;
        Ok(SearchHit {
            key: name.to_string(),
            sensor_type: key.sensor_type,
            location: key.location.to_string(),
            sensor_id: key.sensor_id,
            samples: info.total_samples,
            first_timestamp: format_timestamp(info.first_timestamp),
            last_timestamp: format_timestamp(info.last_timestamp),
        })
    }

    /// Every series of one room, optionally narrowed to one sensor type
    pub async fn query_location(
        &self,
        location: &str,
        sensor_type: Option<SensorType>,
        hours: u64,
    ) -> Result<SummaryReport> {
        self.router.registry().endpoint_for(location)?;
        let filter = match sensor_type {
            Some(t) => SeriesFilter::for_location_type(location, t),
            None => SeriesFilter::for_location(location),
        };
        self.summarize(&filter, hours).await
    }

    /// Every series measured in `unit`, across all rooms
    pub async fn query_by_unit(
        &self,
        unit: &str,
        sensor_type: Option<SensorType>,
        hours: u64,
    ) -> Result<SummaryReport> {
        let filter = SeriesFilter::by_unit(unit);
        let filter = match sensor_type {
            Some(t) => filter.with_type(t),
            None => filter,
        };
        self.summarize(&filter, hours).await
    }

    /// Fan-out over `filter` for the last `hours`, summarised per series
    pub async fn summarize(&self, filter: &SeriesFilter, hours: u64) -> Result<SummaryReport> {
        let end = self.clock.now_millis();
        let start = end - (hours as i64) * 3_600_000;
        let result = self.router.fan_out_query(filter, start, end).await?;

        let degraded_locations = result
            .degraded_locations()
            .into_iter()
            .map(|l| l.to_string())
            .collect();
        let total_points = result.total_points();

        let rows = result
            .into_entries()
            .into_iter()
            .map(|(key, outcome)| {
                let (points, first_value, last_value, failure) = match outcome {
                    Ok(points) => (
                        points.len(),
                        points.first().map(|p| p.value),
                        points.last().map(|p| p.value),
                        None,
                    ),
                    Err(failure) => (0, None, None, Some(failure)),
                };
                SeriesSummary {
                    location: key.location.to_string(),
                    sensor_type: key.sensor_type,
                    sensor_id: key.sensor_id,
                    points,
                    first_value,
                    last_value,
                    failure,
                }
            })
            .collect();

        Ok(SummaryReport {
            start_ms: start,
            end_ms: end,
            total_points,
            rows,
            degraded_locations,
        })
    }
}

/// `%Y-%m-%d %H:%M:%S` in UTC; empty for an out-of-range timestamp
pub fn format_timestamp(timestamp_ms: i64) -> String {
    DateTime::from_timestamp_millis(timestamp_ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}
