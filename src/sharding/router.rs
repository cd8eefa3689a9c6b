//! Shard-aware read/write routing
//!
//! Single-series operations resolve the owning shard from the key's location
//! and retry once through [`ShardConnectionManager::recover`] on a
//! connection-class error. Fan-out queries run one task per location and turn
//! every per-series outcome into a value: a shard that is down, slow or
//! broken only affects its own cells.

use super::connection::with_timeout;
use super::{
    SensorSeriesKey, SensorType, ShardConnection, ShardConnectionManager, ShardKeyCodec,
    ShardLocation, ShardRegistry,
};
use crate::store::{DataPoint, SeriesInfo};
use crate::{Error, Result};
use metrics::counter;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Why one series produced no data in a fan-out
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum QueryFailure {
    /// Series does not exist on its shard
    NotFound,
    /// Shard not connected, unreachable, or connection broke mid-query
    ConnectionError(String),
    /// Shard did not answer within the deadline
    Timeout,
    /// Engine rejected the query, or the shard task failed
    Engine(String),
}

impl QueryFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::ConnectionError(_) => "connection_error",
            Self::Timeout => "timeout",
            Self::Engine(_) => "engine_error",
        }
    }
}

impl fmt::Display for QueryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "series not found"),
            Self::ConnectionError(reason) => write!(f, "connection error: {}", reason),
            Self::Timeout => write!(f, "timed out"),
            Self::Engine(reason) => write!(f, "engine error: {}", reason),
        }
    }
}

impl From<Error> for QueryFailure {
    fn from(e: Error) -> Self {
        match e {
            Error::SeriesNotFound(_) => Self::NotFound,
            Error::QueryTimeout => Self::Timeout,
            Error::LocationUnavailable(_) => Self::ConnectionError(e.to_string()),
            e if e.is_connection_error() => Self::ConnectionError(e.to_string()),
            other => Self::Engine(other.to_string()),
        }
    }
}

/// Outcome of one series in a fan-out
pub type QueryResult = std::result::Result<Vec<DataPoint>, QueryFailure>;

/// Which part of the (location × type × id) space a fan-out covers
#[derive(Debug, Clone, Default)]
pub struct SeriesFilter {
    location: Option<String>,
    sensor_type: Option<SensorType>,
    unit: Option<String>,
}

impl SeriesFilter {
    /// Every configured series
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_location(location: impl Into<String>) -> Self {
        Self {
            location: Some(location.into()),
            ..Self::default()
        }
    }

    pub fn for_location_type(location: impl Into<String>, sensor_type: SensorType) -> Self {
        Self {
            location: Some(location.into()),
            sensor_type: Some(sensor_type),
            unit: None,
        }
    }

    /// Series of every type measured in `unit`, across all locations
    pub fn by_unit(unit: impl Into<String>) -> Self {
        Self {
            unit: Some(unit.into()),
            ..Self::default()
        }
    }

    pub fn with_type(mut self, sensor_type: SensorType) -> Self {
        self.sensor_type = Some(sensor_type);
        self
    }

    /// Expand into the concrete series per location. Unknown locations and
    /// units are caller errors and surface immediately.
    fn plan(&self, registry: &ShardRegistry) -> Result<Vec<(ShardLocation, Vec<SensorSeriesKey>)>> {
        let locations = match &self.location {
            Some(name) => vec![registry.location(name)?],
            None => registry.configured_locations(),
        };

        let mut types: Vec<SensorType> = match &self.unit {
            Some(unit) => {
                let types = registry.types_with_unit(unit);
                if types.is_empty() {
                    return Err(Error::UnknownUnit(unit.clone()));
                }
                types
            }
            None => registry.sensor_types().to_vec(),
        };
        if let Some(only) = self.sensor_type {
            types.retain(|t| *t == only);
        }

        Ok(locations
            .into_iter()
            .map(|location| {
                let keys = types
                    .iter()
                    .flat_map(|t| {
                        let location = location.clone();
                        registry
                            .sensor_ids()
                            .map(move |id| SensorSeriesKey::new(*t, location.clone(), id))
                    })
                    .collect();
                (location, keys)
            })
            .collect())
    }
}

/// Result of a fan-out: exactly one entry per series of the filtered space
#[derive(Debug, Clone, Default)]
pub struct FanOutResult {
    entries: BTreeMap<SensorSeriesKey, QueryResult>,
}

impl FanOutResult {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &SensorSeriesKey) -> Option<&QueryResult> {
        self.entries.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SensorSeriesKey, &QueryResult)> {
        self.entries.iter()
    }

    pub fn successes(&self) -> impl Iterator<Item = (&SensorSeriesKey, &Vec<DataPoint>)> {
        self.entries
            .iter()
            .filter_map(|(k, r)| r.as_ref().ok().map(|points| (k, points)))
    }

    pub fn failures(&self) -> impl Iterator<Item = (&SensorSeriesKey, &QueryFailure)> {
        self.entries
            .iter()
            .filter_map(|(k, r)| r.as_ref().err().map(|failure| (k, failure)))
    }

    pub fn total_points(&self) -> usize {
        self.successes().map(|(_, points)| points.len()).sum()
    }

    /// Locations with at least one connection-class or timeout failure
    pub fn degraded_locations(&self) -> BTreeSet<ShardLocation> {
        self.failures()
            .filter(|(_, f)| matches!(f, QueryFailure::ConnectionError(_) | QueryFailure::Timeout))
            .map(|(k, _)| k.location.clone())
            .collect()
    }

    pub fn into_entries(self) -> BTreeMap<SensorSeriesKey, QueryResult> {
        self.entries
    }
}

/// Central dispatch over the shard connections
#[derive(Debug, Clone)]
pub struct ShardRouter {
    manager: Arc<ShardConnectionManager>,
    fan_out_deadline: Option<Duration>,
}

impl ShardRouter {
    pub fn new(manager: Arc<ShardConnectionManager>) -> Self {
        Self {
            manager,
            fan_out_deadline: None,
        }
    }

    /// Bound every fan-out as a whole; shards still running at the deadline
    /// report [`QueryFailure::Timeout`]
    pub fn with_fan_out_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.fan_out_deadline = deadline;
        self
    }

    pub fn manager(&self) -> &Arc<ShardConnectionManager> {
        &self.manager
    }

    pub fn registry(&self) -> &Arc<ShardRegistry> {
        self.manager.registry()
    }

    fn resolve(&self, key: &SensorSeriesKey) -> Result<ShardLocation> {
        self.registry().location(key.location.as_str())
    }

    /// Run `op` on the live connection of `location`; on a connection-class
    /// error, recover the connection once and run it again
    async fn with_recovery<T, F, Fut>(&self, location: &ShardLocation, op: F) -> Result<T>
    where
        F: Fn(Arc<ShardConnection>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let conn = self
            .manager
            .acquire(location.as_str())
            .await
            .map_err(|e| match e {
                e @ Error::LocationUnavailable(_) => e,
                e => {
                    debug!(location = %location, error = %e, "Shard still unreachable");
                    Error::LocationUnavailable(location.to_string())
                }
            })?;

        match op(Arc::clone(&conn)).await {
            Err(e) if e.is_connection_error() => {
                warn!(location = %location, error = %e, "Connection-class error, reconnecting once");
                self.manager.mark_degraded(location.as_str());
                let fresh = self.manager.recover(location.as_str(), &conn).await?;
                op(fresh).await
            }
            other => other,
        }
    }

    /// Append one point to the series of `key`
    pub async fn write_point(&self, key: &SensorSeriesKey, timestamp_ms: i64, value: f64) -> Result<()> {
        let location = self.resolve(key)?;
        let name = key.series_name();
        let timeout = self.manager.op_timeout();
        let point = DataPoint::new(timestamp_ms, value);

        let outcome = self
            .with_recovery(&location, |conn| {
                let name = name.clone();
                async move { with_timeout(timeout, conn.store().append(&name, point)).await }
            })
            .await;

        let label = match &outcome {
            Ok(()) => "ok",
            Err(Error::LocationUnavailable(_)) => "unavailable",
            Err(_) => "failed",
        };
        counter!(
            "roomshard_writes_total",
            "location" => location.to_string(),
            "outcome" => label
        )
        .increment(1);

        outcome.map_err(|cause| match cause {
            e @ Error::LocationUnavailable(_) => e,
            cause => Error::WriteFailed {
                key: name,
                cause: Box::new(cause),
            },
        })
    }

    /// Inclusive range read of one series. An inverted range is empty.
    pub async fn range_query(
        &self,
        key: &SensorSeriesKey,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<DataPoint>> {
        let location = self.resolve(key)?;
        if start_ms > end_ms {
            return Ok(Vec::new());
        }
        let name = key.series_name();
        let timeout = self.manager.op_timeout();

        self.with_recovery(&location, |conn| {
            let name = name.clone();
            async move { with_timeout(timeout, conn.store().range(&name, start_ms, end_ms)).await }
        })
        .await
    }

    /// Engine metadata of one series
    pub async fn series_info(&self, key: &SensorSeriesKey) -> Result<SeriesInfo> {
        let location = self.resolve(key)?;
        let name = key.series_name();
        let timeout = self.manager.op_timeout();

        self.with_recovery(&location, |conn| {
            let name = name.clone();
            async move { with_timeout(timeout, conn.store().info(&name)).await }
        })
        .await
    }

    /// Names of every sensor series stored on `location`
    pub async fn scan_series(&self, location: &str) -> Result<Vec<String>> {
        let location = self.registry().location(location)?;
        let timeout = self.manager.op_timeout();

        self.with_recovery(&location, |conn| async move {
            with_timeout(timeout, conn.store().scan_keys(ShardKeyCodec::SCAN_PATTERN)).await
        })
        .await
    }

    /// Delete every sensor series on `location`; returns how many were removed
    pub async fn delete_all_series(&self, location: &str) -> Result<u64> {
        let keys = self.scan_series(location).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let location = self.registry().location(location)?;
        let timeout = self.manager.op_timeout();

        self.with_recovery(&location, |conn| {
            let keys = keys.clone();
            async move { with_timeout(timeout, conn.store().delete(&keys)).await }
        })
        .await
    }

    /// Range-query every series matching `filter` on every configured
    /// location, one concurrent task per location.
    ///
    /// Fails only for caller errors (unknown location or unit). Otherwise the
    /// result holds exactly one entry per series of the filtered space,
    /// whatever the state of the shards.
    pub async fn fan_out_query(
        &self,
        filter: &SeriesFilter,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<FanOutResult> {
        let plan = filter.plan(self.registry())?;
        let deadline = self
            .fan_out_deadline
            .map(|d| tokio::time::Instant::now() + d);

        let mut handles = Vec::with_capacity(plan.len());
        for (location, keys) in plan {
            let router = self.clone();
            let task_keys = keys.clone();
            let handle = tokio::spawn(async move {
                router.query_shard(&location, task_keys, start_ms, end_ms).await
            });
            handles.push((keys, handle));
        }

        let mut entries = BTreeMap::new();
        for (keys, mut handle) in handles {
            let joined = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, &mut handle).await {
                    Ok(joined) => Some(joined),
                    Err(_) => {
                        handle.abort();
                        None
                    }
                },
                None => Some(handle.await),
            };

            match joined {
                Some(Ok(results)) => entries.extend(results),
                Some(Err(join_err)) => {
                    warn!(error = %join_err, "Shard query task failed");
                    let failure = QueryFailure::Engine(format!("shard task failed: {}", join_err));
                    entries.extend(keys.into_iter().map(|k| (k, Err(failure.clone()))));
                }
                None => {
                    warn!("Shard query missed the fan-out deadline");
                    entries.extend(keys.into_iter().map(|k| (k, Err(QueryFailure::Timeout))));
                }
            }
        }

        let result = FanOutResult { entries };
        for (_, outcome) in result.iter() {
            let label = match outcome {
                Ok(_) => "ok",
                Err(failure) => failure.as_str(),
            };
            counter!("roomshard_fanout_cells_total", "outcome" => label).increment(1);
        }
        debug!(
            cells = result.len(),
            points = result.total_points(),
            failures = result.failures().count(),
            "Fan-out complete"
        );
        Ok(result)
    }

    /// Query every series of one location. Each series gets its own outcome;
    /// after one failed recovery the remaining series are not attempted.
    async fn query_shard(
        &self,
        location: &ShardLocation,
        keys: Vec<SensorSeriesKey>,
        start_ms: i64,
        end_ms: i64,
    ) -> Vec<(SensorSeriesKey, QueryResult)> {
        let timeout = self.manager.op_timeout();
        let mut down_reason = String::new();
        let mut conn = match self.manager.acquire(location.as_str()).await {
            Ok(conn) => Some(conn),
            Err(e) => {
                down_reason = e.to_string();
                None
            }
        };
        let mut recovered = false;
        let mut results = Vec::with_capacity(keys.len());

        for key in keys {
            let Some(current) = conn.clone() else {
                results.push((key, Err(QueryFailure::ConnectionError(down_reason.clone()))));
                continue;
            };
            if start_ms > end_ms {
                results.push((key, Ok(Vec::new())));
                continue;
            }

            let name = key.series_name();
            let mut outcome =
                with_timeout(timeout, current.store().range(&name, start_ms, end_ms)).await;

            if let Err(e) = &outcome {
                if e.is_connection_error() && !recovered {
                    recovered = true;
                    self.manager.mark_degraded(location.as_str());
                    match self.manager.recover(location.as_str(), &current).await {
                        Ok(fresh) => {
                            outcome =
                                with_timeout(timeout, fresh.store().range(&name, start_ms, end_ms))
                                    .await;
                            conn = Some(fresh);
                        }
                        Err(reconnect_err) => {
                            down_reason = reconnect_err.to_string();
                            conn = None;
                        }
                    }
                }
            }

            results.push((key, outcome.map_err(QueryFailure::from)));
        }
        results
    }
}
