//! Distribution reporting with healthy and failed shards

mod common;

use common::{key, TestTopology, NOW};
use roomshard::ingest::{GeneratorConfig, TelemetryGenerator};
use roomshard::clock::Clock;
use roomshard::sharding::{compute_distribution, SensorType};
use std::sync::Arc;

#[tokio::test]
async fn test_even_load_is_even() {
    let topology = TestTopology::start().await;
    let generator = TelemetryGenerator::new(
        topology.router.clone(),
        topology.clock.clone() as Arc<dyn Clock>,
        GeneratorConfig::default(),
    )
    .with_seed(42);
    for tick in 0..4 {
        generator.write_tick(NOW + tick * 30_000).await;
    }

    let report = compute_distribution(&topology.router, &topology.registry).await;
    assert_eq!(report.total_sensors, 45);
    assert_eq!(report.total_points, 45 * 4);
    for shard in report.per_shard.values() {
        assert!(shard.reachable);
        assert_eq!(shard.sensor_count, 9);
        assert_eq!(shard.point_count, 36);
        assert!((shard.percentage - 20.0).abs() < 1e-9);
    }
}

#[tokio::test]
async fn test_down_shard_counts_zero() {
    let topology = TestTopology::start().await;
    for location in ["salon", "chambre1", "chambre2", "cuisine", "salle_de_bain"] {
        for id in 1..=3 {
            let k = key(SensorType::Temperature, location, id);
            topology.router.write_point(&k, NOW, 20.0).await.unwrap();
        }
    }
    topology.node("cuisine").set_up(false);
    topology.manager.disconnect("cuisine").await.unwrap();

    let report = compute_distribution(&topology.router, &topology.registry).await;

    assert_eq!(report.per_shard.len(), 5);
    let cuisine = &report.per_shard["cuisine"];
    assert!(!cuisine.reachable);
    assert_eq!(cuisine.sensor_count, 0);
    assert_eq!(cuisine.point_count, 0);
    assert_eq!(cuisine.percentage, 0.0);
    assert_eq!(cuisine.display_name, "Cuisine");

    assert_eq!(report.total_sensors, 36);
    assert_eq!(report.total_points, 12);
    let salon = &report.per_shard["salon"];
    assert_eq!(salon.point_count, 3);
    assert!((salon.percentage - 25.0).abs() < 1e-9);
}
