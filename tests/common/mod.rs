//! Shared fixtures: a five-room topology over in-memory shards

#![allow(dead_code)]

use roomshard::clock::ManualClock;
use roomshard::config::ShardingConfig;
use roomshard::discovery::StaticDiscovery;
use roomshard::sharding::{
    SensorSeriesKey, SensorType, SeriesProvisioner, ShardAddr, ShardConnectionManager,
    ShardLocation, ShardRegistry, ShardRouter,
};
use roomshard::store::{MemoryCluster, MemoryShardStore, ReplicationRole, ShardConnector};
use std::sync::Arc;

pub const NOW: i64 = 1_700_000_000_000;

pub struct TestTopology {
    pub cluster: Arc<MemoryCluster>,
    pub registry: Arc<ShardRegistry>,
    pub manager: Arc<ShardConnectionManager>,
    pub router: ShardRouter,
    pub clock: Arc<ManualClock>,
}

impl TestTopology {
    /// Default five rooms, all primaries up, connected and provisioned
    pub async fn start() -> Self {
        Self::start_with(ShardingConfig::default()).await
    }

    pub async fn start_with(config: ShardingConfig) -> Self {
        let registry = Arc::new(ShardRegistry::new(&config).unwrap());
        let cluster = Arc::new(MemoryCluster::new());
        for endpoint in registry.endpoints() {
            cluster.add_node(&endpoint.addr(), ReplicationRole::Primary);
        }
        let manager = Arc::new(ShardConnectionManager::new(
            Arc::clone(&registry),
            Arc::clone(&cluster) as Arc<dyn ShardConnector>,
            &config.connection,
        ));
        Self::finish(cluster, registry, manager).await
    }

    async fn finish(
        cluster: Arc<MemoryCluster>,
        registry: Arc<ShardRegistry>,
        manager: Arc<ShardConnectionManager>,
    ) -> Self {
        manager.connect_all().await;
        SeriesProvisioner::new(manager.op_timeout())
            .provision_all(&manager)
            .await;
        let router = ShardRouter::new(Arc::clone(&manager));
        Self {
            cluster,
            registry,
            manager,
            router,
            clock: Arc::new(ManualClock::new(NOW)),
        }
    }

    pub fn node(&self, location: &str) -> Arc<MemoryShardStore> {
        let addr = self.registry.endpoint_for(location).unwrap().addr();
        self.cluster.node(&addr).unwrap()
    }
}

/// A topology whose primaries are found through discovery, with one replica
/// per room on `port + 1`
pub struct FailoverTopology {
    pub topology: TestTopology,
    pub discovery: Arc<StaticDiscovery>,
}

impl FailoverTopology {
    pub async fn start() -> Self {
        let config = ShardingConfig::default();
        let registry = Arc::new(ShardRegistry::new(&config).unwrap());
        let cluster = Arc::new(MemoryCluster::new());
        let discovery = Arc::new(StaticDiscovery::new());
        for endpoint in registry.endpoints() {
            cluster.add_node(&endpoint.addr(), ReplicationRole::Primary);
            cluster.add_node(&replica_addr(endpoint.port), ReplicationRole::Replica);
            discovery.set_primary(endpoint.master_name.clone(), endpoint.addr());
        }
        let manager = Arc::new(
            ShardConnectionManager::new(
                Arc::clone(&registry),
                Arc::clone(&cluster) as Arc<dyn ShardConnector>,
                &config.connection,
            )
            .with_discovery(Arc::clone(&discovery) as _),
        );
        let topology = TestTopology::finish(cluster, registry, manager).await;
        Self {
            topology,
            discovery,
        }
    }

    /// Crash the primary of `location` and promote its replica
    pub fn fail_over(&self, location: &str) -> ShardAddr {
        let endpoint = self.topology.registry.endpoint_for(location).unwrap();
        let replica = replica_addr(endpoint.port);
        self.topology.node(location).set_up(false);
        self.topology
            .cluster
            .node(&replica)
            .unwrap()
            .set_role(ReplicationRole::Primary);
        self.discovery
            .set_primary(endpoint.master_name.clone(), replica.clone());
        replica
    }
}

pub fn replica_addr(port: u16) -> ShardAddr {
    ShardAddr::new("localhost", port + 1)
}

pub fn key(sensor_type: SensorType, location: &str, id: u32) -> SensorSeriesKey {
    SensorSeriesKey::new(sensor_type, ShardLocation::new(location), id)
}
