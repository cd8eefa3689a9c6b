//! Sensor value generator and ingestion loops

use super::GeneratorConfig;
use crate::clock::Clock;
use crate::sharding::{SensorType, SeriesProvisioner, ShardLocation, ShardRouter};
use futures::future::join_all;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Points written and failed by one or more ticks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteReport {
    pub written: u64,
    pub failed: u64,
}

impl AddAssign for WriteReport {
    fn add_assign(&mut self, other: Self) {
        self.written += other.written;
        self.failed += other.failed;
    }
}

/// Produces plausible readings and writes them to every live series
pub struct TelemetryGenerator {
    router: ShardRouter,
    provisioner: SeriesProvisioner,
    clock: Arc<dyn Clock>,
    config: GeneratorConfig,
    rng: Mutex<StdRng>,
}

impl TelemetryGenerator {
    pub fn new(router: ShardRouter, clock: Arc<dyn Clock>, config: GeneratorConfig) -> Self {
        let provisioner = SeriesProvisioner::new(router.manager().op_timeout());
        Self {
            router,
            provisioner,
            clock,
            config,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic values, for tests
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Random reading within the plausible range of `sensor_type`, one decimal
    pub fn generate_value(&self, sensor_type: SensorType) -> f64 {
        let (low, high) = match sensor_type {
            SensorType::Temperature => (15.0, 30.0),
            SensorType::Humidity => (30.0, 70.0),
            SensorType::AirQuality => (20.0, 150.0),
        };
        let raw: f64 = self.rng.lock().gen_range(low..=high);
        (raw * 10.0).round() / 10.0
    }

    /// Write one point at `timestamp_ms` to every series of every live
    /// location. Locations are written concurrently.
    pub async fn write_tick(&self, timestamp_ms: i64) -> WriteReport {
        let locations = self.router.manager().live_locations();
        let reports = join_all(
            locations
                .iter()
                .map(|location| self.write_location(location, timestamp_ms)),
        )
        .await;

        let mut total = WriteReport::default();
        for report in reports {
            total += report;
        }
        total
    }

    async fn write_location(&self, location: &ShardLocation, timestamp_ms: i64) -> WriteReport {
        let mut report = WriteReport::default();
        for key in self.router.registry().series_keys_for(location) {
            let value = self.generate_value(key.sensor_type);
            match self.router.write_point(&key, timestamp_ms, value).await {
                Ok(()) => report.written += 1,
                Err(e) => {
                    report.failed += 1;
                    debug!(series = %key, error = %e, "Write failed");
                }
            }
        }
        if report.failed > 0 {
            warn!(location = %location, failed = report.failed, "Some writes failed");
        }
        report
    }

    /// Write history from `now - span` to `now`, one tick every `step`
    pub async fn backfill(&self, span: Duration, step: Duration) -> WriteReport {
        let end = self.clock.now_millis();
        let start = end - span.as_millis() as i64;
        let step_ms = (step.as_millis() as i64).max(1);
        let ticks = (end - start) / step_ms + 1;

        info!(start_ms = start, end_ms = end, ticks, "Starting historical backfill");

        let mut total = WriteReport::default();
        let mut timestamp = start;
        let mut done = 0i64;
        while timestamp <= end {
            total += self.write_tick(timestamp).await;
            timestamp += step_ms;
            done += 1;
            if ticks >= 10 && done % (ticks / 10) == 0 {
                info!(done, ticks, written = total.written, "Backfill progress");
            }
        }

        info!(
            written = total.written,
            failed = total.failed,
            "Historical backfill complete"
        );
        total
    }

    /// Backfill using the configured span and step
    pub async fn backfill_configured(&self) -> WriteReport {
        self.backfill(self.config.backfill_span(), self.config.backfill_step())
            .await
    }

    /// Write one tick per interval until `shutdown` fires.
    ///
    /// Before each tick, shards without a connection get a reconnect attempt;
    /// a shard that comes back is provisioned before it is written to.
    pub async fn run_live(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for location in self.router.manager().connect_missing().await {
                        info!(location = %location, "Shard back online, provisioning series");
                        self.provisioner
                            .provision_location(self.router.manager(), &location)
                            .await;
                    }

                    let now = self.clock.now_millis();
                    let report = self.write_tick(now).await;
                    info!(
                        timestamp_ms = now,
                        written = report.written,
                        failed = report.failed,
                        shards = self.router.manager().live_locations().len(),
                        "Live tick"
                    );
                }
                _ = shutdown.cancelled() => {
                    info!("Live generation shutting down gracefully");
                    break;
                }
            }
        }
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ShardingConfig;
    use crate::sharding::{SensorSeriesKey, ShardConnectionManager, ShardRegistry};
    use crate::store::{MemoryCluster, ReplicationRole, ShardConnector};

    async fn setup(clock_ms: i64) -> (Arc<MemoryCluster>, TelemetryGenerator) {
        let config = ShardingConfig::default();
        let registry = Arc::new(ShardRegistry::new(&config).unwrap());
        let cluster = Arc::new(MemoryCluster::new());
        for endpoint in registry.endpoints() {
            cluster.add_node(&endpoint.addr(), ReplicationRole::Primary);
        }
        let manager = Arc::new(ShardConnectionManager::new(
            registry,
            Arc::clone(&cluster) as Arc<dyn ShardConnector>,
            &config.connection,
        ));
        manager.connect_all().await;
        let generator = TelemetryGenerator::new(
            ShardRouter::new(manager),
            Arc::new(ManualClock::new(clock_ms)),
            GeneratorConfig::default(),
        )
        .with_seed(7);
        (cluster, generator)
    }

    #[tokio::test]
    async fn test_values_stay_in_range() {
        let (_cluster, generator) = setup(0).await;
        for _ in 0..500 {
            let t = generator.generate_value(SensorType::Temperature);
            assert!((15.0..=30.0).contains(&t));
            let h = generator.generate_value(SensorType::Humidity);
            assert!((30.0..=70.0).contains(&h));
            let a = generator.generate_value(SensorType::AirQuality);
            assert!((20.0..=150.0).contains(&a));
            assert_eq!((a * 10.0).round() / 10.0, a);
        }
    }

    #[tokio::test]
    async fn test_tick_writes_every_live_series() {
        let (cluster, generator) = setup(0).await;
        let cuisine = generator.router.registry().endpoint_for("cuisine").unwrap().addr();
        generator.router.manager().disconnect("cuisine").await.unwrap();

        let report = generator.write_tick(1_000).await;
        assert_eq!(report, WriteReport { written: 4 * 9, failed: 0 });
        assert_eq!(cluster.node(&cuisine).unwrap().series_count(), 0);
    }

    #[tokio::test]
    async fn test_backfill_spacing() {
        let (_cluster, generator) = setup(3_600_000).await;
        let report = generator
            .backfill(Duration::from_secs(3_600), Duration::from_secs(300))
            .await;
        // 13 ticks: 0, 5, ..., 60 minutes
        assert_eq!(report.written, 13 * 45);

        let key = SensorSeriesKey::new(SensorType::Temperature, ShardLocation::new("salon"), 1);
        let points = generator.router.range_query(&key, 0, 3_600_000).await.unwrap();
        assert_eq!(points.len(), 13);
        assert_eq!(points[1].timestamp_ms - points[0].timestamp_ms, 300_000);
    }

    #[tokio::test]
    async fn test_failures_are_counted_not_fatal() {
        let (cluster, generator) = setup(0).await;
        let salon = generator.router.registry().endpoint_for("salon").unwrap().addr();
        cluster.node(&salon).unwrap().set_up(false);

        let report = generator.write_tick(1_000).await;
        assert_eq!(report.written, 4 * 9);
        assert!(report.failed >= 1);
    }
}
