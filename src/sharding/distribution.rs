//! Topology-wide data distribution

use super::{ShardLocation, ShardRegistry, ShardRouter};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Series and sample counts of one shard
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ShardDistribution {
    pub display_name: String,
    pub reachable: bool,
    pub sensor_count: u64,
    pub point_count: u64,
    /// Share of all points across the topology, 0-100
    pub percentage: f64,
}

/// Distribution of series and points across shards
#[derive(Debug, Clone, Serialize)]
pub struct DistributionReport {
    pub timestamp: DateTime<Utc>,
    pub total_sensors: u64,
    pub total_points: u64,
    /// Keyed by location; every configured location is present
    pub per_shard: BTreeMap<String, ShardDistribution>,
}

/// Count series and samples on every configured shard.
///
/// Shards are probed concurrently. A shard that cannot be connected
/// reports zero series; a series whose metadata read fails is logged and
/// left out of its shard's counts.
pub async fn compute_distribution(router: &ShardRouter, registry: &ShardRegistry) -> DistributionReport {
    let locations = registry.configured_locations();
    let per_location = join_all(
        locations
            .iter()
            .map(|location| shard_distribution(router, registry, location)),
    )
    .await;

    let mut per_shard: BTreeMap<String, ShardDistribution> = locations
        .iter()
        .map(ShardLocation::to_string)
        .zip(per_location)
        .collect();

    let total_sensors = per_shard.values().map(|s| s.sensor_count).sum();
    let total_points: u64 = per_shard.values().map(|s| s.point_count).sum();
    if total_points > 0 {
        for shard in per_shard.values_mut() {
            shard.percentage = shard.point_count as f64 * 100.0 / total_points as f64;
        }
    }

    DistributionReport {
        timestamp: Utc::now(),
        total_sensors,
        total_points,
        per_shard,
    }
}

async fn shard_distribution(
    router: &ShardRouter,
    registry: &ShardRegistry,
    location: &ShardLocation,
) -> ShardDistribution {
    let mut shard = ShardDistribution {
        display_name: registry
            .endpoint_for(location.as_str())
            .map(|e| e.display_name.clone())
            .unwrap_or_default(),
        ..ShardDistribution::default()
    };

    if let Err(e) = router.manager().acquire(location.as_str()).await {
        debug!(location = %location, error = %e, "Shard not connected, counting zero series");
        return shard;
    }
    shard.reachable = true;

    for key in registry.series_keys_for(location) {
        match router.series_info(&key).await {
            Ok(info) => {
                shard.sensor_count += 1;
                shard.point_count += info.total_samples;
            }
            Err(e) => {
                warn!(series = %key, error = %e, "Series metadata unavailable, omitted from distribution");
            }
        }
    }
    shard
}
