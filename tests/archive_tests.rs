//! Archival pipeline against live shards

mod common;

use common::{key, TestTopology, NOW};
use roomshard::archive::{ArchivalPipeline, ArchiveConfig, ArchiveSink, MemorySink};
use roomshard::clock::Clock;
use roomshard::config::ShardingConfig;
use roomshard::sharding::SensorType;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn pipeline(topology: &TestTopology, sink: Arc<MemorySink>) -> ArchivalPipeline {
    ArchivalPipeline::new(
        topology.router.clone(),
        sink as Arc<dyn ArchiveSink>,
        topology.clock.clone() as Arc<dyn Clock>,
        ArchiveConfig::default(),
    )
}

fn tags(location: &str, sensor_id: u32) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("location".to_string(), location.to_string()),
        ("sensor_id".to_string(), sensor_id.to_string()),
    ])
}

#[tokio::test]
async fn test_first_cycle_archives_last_day() {
    let topology = TestTopology::start().await;
    let k = key(SensorType::Temperature, "salon", 1);
    // One point just outside the startup window, two inside
    topology.router.write_point(&k, NOW - 86_400_000 - 1, 15.0).await.unwrap();
    topology.router.write_point(&k, NOW - 3_600_000, 20.0).await.unwrap();
    topology.router.write_point(&k, NOW, 21.5).await.unwrap();

    let sink = Arc::new(MemorySink::new());
    let pipeline = pipeline(&topology, Arc::clone(&sink));
    let report = pipeline.run_cycle().await;

    assert!(report.flushed);
    assert_eq!(report.window.start_ms, NOW - 86_400_000);
    assert_eq!(report.points, 2);
    assert_eq!(pipeline.watermark(), Some(NOW));
    assert_eq!(
        sink.value("temperature", &tags("salon", 1), NOW * 1_000_000, "value"),
        Some(21.5)
    );
}

#[tokio::test]
async fn test_overlapping_windows_do_not_duplicate() {
    let topology = TestTopology::start().await;
    let sink = Arc::new(MemorySink::new());
    let pipeline = pipeline(&topology, Arc::clone(&sink));

    for (offset, location) in ["salon", "cuisine", "chambre1"].iter().enumerate() {
        let k = key(SensorType::Humidity, location, 2);
        topology
            .router
            .write_point(&k, NOW - 60_000 * offset as i64, 50.0)
            .await
            .unwrap();
    }
    pipeline.run_cycle().await;
    assert_eq!(sink.len(), 3);

    topology.clock.advance(Duration::from_secs(300));
    let k = key(SensorType::Humidity, "salon", 2);
    topology
        .router
        .write_point(&k, NOW + 120_000, 52.0)
        .await
        .unwrap();
    let second = pipeline.run_cycle().await;

    // The second window overlaps the first: it re-reads the same three points
    assert_eq!(second.window.start_ms, NOW - 8_640_000);
    assert_eq!(second.points, 4);
    assert_eq!(sink.len(), 4);
    assert_eq!(sink.write_count(), 2);
}

#[tokio::test]
async fn test_down_shard_is_skipped_not_fatal() {
    let topology = TestTopology::start().await;
    for location in ["salon", "salle_de_bain"] {
        topology
            .router
            .write_point(&key(SensorType::AirQuality, location, 1), NOW, 90.0)
            .await
            .unwrap();
    }
    topology.node("salle_de_bain").set_up(false);

    let sink = Arc::new(MemorySink::new());
    let pipeline = pipeline(&topology, Arc::clone(&sink));
    let report = pipeline.run_cycle().await;

    assert!(report.flushed);
    assert_eq!(report.points, 1);
    assert_eq!(report.failed_series, 9);
    assert_eq!(sink.points()[0].tags["location"], "salon");
}

#[tokio::test]
async fn test_slow_shard_rejoins_next_cycle() {
    let mut config = ShardingConfig::default();
    config.connection.op_timeout_ms = 50;
    let topology = TestTopology::start_with(config).await;
    let k = key(SensorType::Temperature, "salon", 1);
    topology.router.write_point(&k, NOW - 60_000, 21.0).await.unwrap();

    let sink = Arc::new(MemorySink::new());
    let pipeline = pipeline(&topology, Arc::clone(&sink));

    // Slow enough that both the read and the reconnect time out
    topology.node("salon").set_latency(Duration::from_millis(200));
    let first = pipeline.run_cycle().await;
    assert_eq!(first.failed_series, 9);
    assert!(topology.manager.connection_for("salon").is_none());

    topology.node("salon").set_latency(Duration::ZERO);
    topology.clock.advance(Duration::from_secs(300));
    let second = pipeline.run_cycle().await;

    assert_eq!(second.failed_series, 0);
    assert_eq!(second.points, 1);
    assert_eq!(
        sink.value("temperature", &tags("salon", 1), (NOW - 60_000) * 1_000_000, "value"),
        Some(21.0)
    );
    assert_eq!(
        topology.router.range_query(&k, NOW - 60_000, NOW).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_shutdown_stops_the_loop() {
    let topology = TestTopology::start().await;
    let sink = Arc::new(MemorySink::new());
    let pipeline = Arc::new(pipeline(&topology, Arc::clone(&sink)));
    let token = pipeline.shutdown_token();

    let runner = Arc::clone(&pipeline);
    let handle = tokio::spawn(async move { runner.run().await });
    token.cancel();

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("pipeline did not stop")
        .unwrap();
}
