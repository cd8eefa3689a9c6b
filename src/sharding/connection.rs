//! Live shard connections
//!
//! The manager owns exactly one slot per configured location, created at
//! startup and never added to or removed afterwards. A slot holds at most one
//! live [`ShardConnection`]. Connect, reconnect and drop on a slot are
//! serialised by that slot's own lock; different locations never contend.
//!
//! Health is pull-based: nothing probes in the background. A connection is
//! replaced when a caller reports a connection-class error, and status reports
//! probe on demand.

use super::{
    ConnectionState, ShardAddr, ShardEndpoint, ShardKeyCodec, ShardLocation, ShardRegistry,
    ShardStatusSnapshot,
};
use crate::config::ConnectionConfig;
use crate::discovery::PrimaryDiscovery;
use crate::store::{ReplicationRole, ShardConnector, ShardStore};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use metrics::counter;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Bound a shard call by `limit`; expiry becomes [`Error::QueryTimeout`]
pub(crate) async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, fut).await?
}

/// A verified connection to the writable primary of one location
#[derive(Debug)]
pub struct ShardConnection {
    location: ShardLocation,
    addr: ShardAddr,
    store: Arc<dyn ShardStore>,
    connected_at: DateTime<Utc>,
}

impl ShardConnection {
    pub fn location(&self) -> &ShardLocation {
        &self.location
    }

    /// Address actually connected to, which after a failover may differ from
    /// the configured endpoint
    pub fn addr(&self) -> &ShardAddr {
        &self.addr
    }

    pub fn store(&self) -> &dyn ShardStore {
        self.store.as_ref()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }
}

#[derive(Debug)]
struct ShardSlot {
    live: RwLock<Option<Arc<ShardConnection>>>,
    state: RwLock<ConnectionState>,
    transition: tokio::sync::Mutex<()>,
}

impl ShardSlot {
    fn new() -> Self {
        Self {
            live: RwLock::new(None),
            state: RwLock::new(ConnectionState::Unconnected),
            transition: tokio::sync::Mutex::new(()),
        }
    }

    fn current(&self) -> Option<Arc<ShardConnection>> {
        self.live.read().clone()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }
}

/// Owns the per-location connection table
pub struct ShardConnectionManager {
    registry: Arc<ShardRegistry>,
    connector: Arc<dyn ShardConnector>,
    discovery: Option<Arc<dyn PrimaryDiscovery>>,
    slots: HashMap<ShardLocation, ShardSlot>,
    connect_timeout: Duration,
    op_timeout: Duration,
}

impl ShardConnectionManager {
    pub fn new(
        registry: Arc<ShardRegistry>,
        connector: Arc<dyn ShardConnector>,
        config: &ConnectionConfig,
    ) -> Self {
        let slots = registry
            .configured_locations()
            .into_iter()
            .map(|location| (location, ShardSlot::new()))
            .collect();

        Self {
            registry,
            connector,
            discovery: None,
            slots,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            op_timeout: Duration::from_millis(config.op_timeout_ms),
        }
    }

    /// Resolve addresses through primary discovery instead of the static
    /// endpoints
    pub fn with_discovery(mut self, discovery: Arc<dyn PrimaryDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn registry(&self) -> &Arc<ShardRegistry> {
        &self.registry
    }

    pub fn op_timeout(&self) -> Duration {
        self.op_timeout
    }

    fn slot(&self, location: &str) -> Result<(&ShardSlot, &ShardEndpoint)> {
        let endpoint = self.registry.endpoint_for(location)?;
        let slot = self
            .slots
            .get(location)
            .ok_or_else(|| Error::UnknownLocation(location.to_string()))?;
        Ok((slot, endpoint))
    }

    /// Live connection for `location`, if any. Never fails.
    pub fn connection_for(&self, location: &str) -> Option<Arc<ShardConnection>> {
        self.slots.get(location).and_then(ShardSlot::current)
    }

    pub fn state(&self, location: &str) -> Option<ConnectionState> {
        self.slots.get(location).map(|slot| *slot.state.read())
    }

    /// Locations with a live connection, in configuration order
    pub fn live_locations(&self) -> Vec<ShardLocation> {
        self.registry
            .configured_locations()
            .into_iter()
            .filter(|l| self.connection_for(l.as_str()).is_some())
            .collect()
    }

    /// Connect to the primary of `location`, or return the live connection if
    /// one exists. A failed attempt leaves the slot empty.
    pub async fn connect(&self, location: &str) -> Result<Arc<ShardConnection>> {
        let (slot, endpoint) = self.slot(location)?;
        let _guard = slot.transition.lock().await;

        let existing = slot.current();
        if let Some(existing) = existing {
            return Ok(existing);
        }
        self.establish(slot, endpoint).await
    }

    /// Live connection for `location`, connecting on demand when the slot is
    /// empty. A slot closed through [`disconnect`](Self::disconnect) stays
    /// closed until an explicit connect.
    pub async fn acquire(&self, location: &str) -> Result<Arc<ShardConnection>> {
        if let Some(conn) = self.connection_for(location) {
            return Ok(conn);
        }
        if self.state(location) == Some(ConnectionState::Closed) {
            return Err(Error::LocationUnavailable(location.to_string()));
        }
        debug!(location, "No live connection, connecting on demand");
        self.connect(location).await
    }

    /// Tear down the current connection (if any) and connect again, picking up
    /// a newly elected primary
    pub async fn reconnect(&self, location: &str) -> Result<Arc<ShardConnection>> {
        let (slot, endpoint) = self.slot(location)?;
        let _guard = slot.transition.lock().await;

        self.teardown(slot).await;
        counter!("roomshard_reconnects_total", "location" => location.to_string()).increment(1);
        self.establish(slot, endpoint).await
    }

    /// Replace `failed` after a connection-class error.
    ///
    /// When several callers observe the same broken connection, only the first
    /// one reconnects; the others get the connection it established.
    pub async fn recover(
        &self,
        location: &str,
        failed: &Arc<ShardConnection>,
    ) -> Result<Arc<ShardConnection>> {
        let (slot, endpoint) = self.slot(location)?;
        let _guard = slot.transition.lock().await;

        let current = slot.current();
        if let Some(current) = current {
            if !Arc::ptr_eq(&current, failed) {
                debug!(location, "Connection already replaced by a concurrent caller");
                return Ok(current);
            }
        }

        self.teardown(slot).await;
        counter!("roomshard_reconnects_total", "location" => location.to_string()).increment(1);
        self.establish(slot, endpoint).await
    }

    /// Drop the connection for `location` without reconnecting
    pub async fn disconnect(&self, location: &str) -> Result<()> {
        let (slot, _) = self.slot(location)?;
        let _guard = slot.transition.lock().await;
        self.teardown(slot).await;
        slot.set_state(ConnectionState::Closed);
        info!(location, "Shard connection closed");
        Ok(())
    }

    /// Drop `failed` if it is still the live connection
    async fn drop_failed(&self, location: &str, failed: &Arc<ShardConnection>) {
        let Ok((slot, _)) = self.slot(location) else {
            return;
        };
        let _guard = slot.transition.lock().await;
        let current = slot.current();
        if current.is_some_and(|c| Arc::ptr_eq(&c, failed)) {
            self.teardown(slot).await;
            slot.set_state(ConnectionState::Unconnected);
            warn!(location, "Dropped shard connection after failed probe");
        }
    }

    /// Record that a caller saw a connection-class error on `location`
    pub fn mark_degraded(&self, location: &str) {
        if let Some(slot) = self.slots.get(location) {
            let mut state = slot.state.write();
            if *state == ConnectionState::Healthy {
                *state = ConnectionState::Degraded;
            }
        }
    }

    /// Connect every configured location concurrently
    pub async fn connect_all(&self) -> Vec<(ShardLocation, Result<()>)> {
        let locations = self.registry.configured_locations();
        let outcomes = join_all(
            locations
                .iter()
                .map(|location| self.connect(location.as_str())),
        )
        .await;

        let results: Vec<(ShardLocation, Result<()>)> = locations
            .into_iter()
            .zip(outcomes)
            .map(|(location, outcome)| (location, outcome.map(|_| ())))
            .collect();

        let connected = results.iter().filter(|(_, r)| r.is_ok()).count();
        info!(
            connected,
            configured = results.len(),
            "Shard connection pass complete"
        );
        results
    }

    /// Try to connect every location without a live connection; returns the
    /// locations that came back
    pub async fn connect_missing(&self) -> Vec<ShardLocation> {
        let missing: Vec<ShardLocation> = self
            .registry
            .configured_locations()
            .into_iter()
            .filter(|l| self.connection_for(l.as_str()).is_none())
            .collect();
        if missing.is_empty() {
            return Vec::new();
        }

        let outcomes = join_all(missing.iter().map(|l| self.connect(l.as_str()))).await;
        missing
            .into_iter()
            .zip(outcomes)
            .filter_map(|(location, outcome)| outcome.ok().map(|_| location))
            .collect()
    }

    /// Fresh status of one location. An absent connection is re-established
    /// first; a connection that fails its probe is dropped.
    pub async fn probe(&self, location: &str) -> Result<ShardStatusSnapshot> {
        let (_, endpoint) = self.slot(location)?;
        let mut snapshot = ShardStatusSnapshot {
            location: endpoint.location.clone(),
            display_name: endpoint.display_name.clone(),
            addr: endpoint.addr().to_string(),
            reachable: false,
            state: ConnectionState::Unconnected,
            role: None,
            used_memory: None,
            key_count: None,
            error: None,
        };

        let conn = match self.connection_for(location) {
            Some(conn) => conn,
            None => match self.connect(location).await {
                Ok(conn) => conn,
                Err(e) => {
                    snapshot.error = Some(e.to_string());
                    snapshot.state = self.state(location).unwrap_or(ConnectionState::Unconnected);
                    return Ok(snapshot);
                }
            },
        };
        snapshot.addr = conn.addr().to_string();

        match self.probe_connection(&conn).await {
            Ok((role, used_memory, key_count)) => {
                snapshot.reachable = true;
                snapshot.role = Some(role.as_str().to_string());
                snapshot.used_memory = Some(used_memory);
                snapshot.key_count = Some(key_count);
            }
            Err(e) => {
                self.drop_failed(location, &conn).await;
                snapshot.error = Some(e.to_string());
            }
        }
        snapshot.state = self.state(location).unwrap_or(ConnectionState::Unconnected);
        Ok(snapshot)
    }

    async fn probe_connection(
        &self,
        conn: &ShardConnection,
    ) -> Result<(ReplicationRole, String, u64)> {
        let store = conn.store();
        with_timeout(self.op_timeout, store.ping()).await?;
        let role = with_timeout(self.op_timeout, store.role()).await?;
        if role == ReplicationRole::Replica {
            return Err(Error::ShardReadOnly {
                location: conn.location().to_string(),
                addr: conn.addr().to_string(),
            });
        }
        let stats = with_timeout(self.op_timeout, store.server_stats()).await?;
        let keys =
            with_timeout(self.op_timeout, store.scan_keys(ShardKeyCodec::SCAN_PATTERN)).await?;
        Ok((role, stats.used_memory_human, keys.len() as u64))
    }

    /// Status of every configured location, probed concurrently
    pub async fn probe_all(&self) -> Vec<ShardStatusSnapshot> {
        let locations = self.registry.configured_locations();
        join_all(locations.iter().map(|l| self.probe(l.as_str())))
            .await
            .into_iter()
            .filter_map(Result::ok)
            .collect()
    }

    async fn teardown(&self, slot: &ShardSlot) {
        let previous = slot.live.write().take();
        if let Some(previous) = previous {
            previous.store().close().await;
        }
    }

    async fn establish(
        &self,
        slot: &ShardSlot,
        endpoint: &ShardEndpoint,
    ) -> Result<Arc<ShardConnection>> {
        slot.set_state(ConnectionState::Connecting);

        match self.open(endpoint).await {
            Ok(conn) => {
                let conn = Arc::new(conn);
                *slot.live.write() = Some(Arc::clone(&conn));
                slot.set_state(ConnectionState::Healthy);
                info!(
                    location = %endpoint.location,
                    addr = %conn.addr(),
                    "Connected to shard primary"
                );
                Ok(conn)
            }
            Err(e) => {
                slot.set_state(ConnectionState::Unconnected);
                warn!(location = %endpoint.location, error = %e, "Shard connection failed");
                Err(e)
            }
        }
    }

    async fn resolve_addr(&self, endpoint: &ShardEndpoint) -> Result<ShardAddr> {
        let Some(discovery) = &self.discovery else {
            return Ok(endpoint.addr());
        };
        with_timeout(
            self.connect_timeout,
            discovery.discover_primary(&endpoint.master_name),
        )
        .await
        .map_err(|e| Error::ShardUnreachable {
            location: endpoint.location.to_string(),
            reason: format!("primary discovery for '{}' failed: {}", endpoint.master_name, e),
        })
    }

    async fn open(&self, endpoint: &ShardEndpoint) -> Result<ShardConnection> {
        let location = &endpoint.location;
        let addr = self.resolve_addr(endpoint).await?;
        let unreachable = |reason: String| Error::ShardUnreachable {
            location: location.to_string(),
            reason,
        };

        let store = with_timeout(self.connect_timeout, self.connector.connect(location, &addr))
            .await
            .map_err(|e| match e {
                e @ Error::ShardUnreachable { .. } => e,
                other => unreachable(format!("{} ({})", other, addr)),
            })?;

        if let Err(e) = with_timeout(self.op_timeout, store.ping()).await {
            store.close().await;
            return Err(unreachable(format!("liveness probe failed: {}", e)));
        }

        let role = match with_timeout(self.op_timeout, store.role()).await {
            Ok(role) => role,
            Err(e) => {
                store.close().await;
                return Err(unreachable(format!("role probe failed: {}", e)));
            }
        };
        if role == ReplicationRole::Replica {
            store.close().await;
            return Err(Error::ShardReadOnly {
                location: location.to_string(),
                addr: addr.to_string(),
            });
        }

        Ok(ShardConnection {
            location: location.clone(),
            addr,
            store,
            connected_at: Utc::now(),
        })
    }
}

impl std::fmt::Debug for ShardConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardConnectionManager")
            .field("locations", &self.registry.configured_locations())
            .field("live", &self.live_locations())
            .field("discovery", &self.discovery.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShardingConfig;
    use crate::discovery::StaticDiscovery;
    use crate::store::MemoryCluster;

    fn setup() -> (Arc<MemoryCluster>, ShardConnectionManager) {
        let config = ShardingConfig::default();
        let registry = Arc::new(ShardRegistry::new(&config).unwrap());
        let cluster = Arc::new(MemoryCluster::new());
        for endpoint in registry.endpoints() {
            cluster.add_node(&endpoint.addr(), ReplicationRole::Primary);
        }
        let manager = ShardConnectionManager::new(
            registry,
            Arc::clone(&cluster) as Arc<dyn ShardConnector>,
            &config.connection,
        );
        (cluster, manager)
    }

    #[tokio::test]
    async fn test_connect_registers_live_connection() {
        let (_cluster, manager) = setup();
        assert!(manager.connection_for("salon").is_none());
        assert_eq!(manager.state("salon"), Some(ConnectionState::Unconnected));

        let conn = manager.connect("salon").await.unwrap();
        assert_eq!(conn.location().as_str(), "salon");
        assert_eq!(manager.state("salon"), Some(ConnectionState::Healthy));

        // A second connect returns the same object
        let again = manager.connect("salon").await.unwrap();
        assert!(Arc::ptr_eq(&conn, &again));
    }

    #[tokio::test]
    async fn test_failed_connect_is_not_registered() {
        let (cluster, manager) = setup();
        let cuisine = manager.registry().endpoint_for("cuisine").unwrap().addr();
        cluster.node(&cuisine).unwrap().set_up(false);

        let err = manager.connect("cuisine").await.unwrap_err();
        assert!(matches!(err, Error::ShardUnreachable { .. }));
        assert!(manager.connection_for("cuisine").is_none());
        assert_eq!(manager.state("cuisine"), Some(ConnectionState::Unconnected));
    }

    #[tokio::test]
    async fn test_replica_is_rejected() {
        let (cluster, manager) = setup();
        let salon = manager.registry().endpoint_for("salon").unwrap().addr();
        cluster.node(&salon).unwrap().set_role(ReplicationRole::Replica);

        let err = manager.connect("salon").await.unwrap_err();
        assert!(matches!(err, Error::ShardReadOnly { .. }));
        assert!(manager.connection_for("salon").is_none());
    }

    #[tokio::test]
    async fn test_unknown_location() {
        let (_cluster, manager) = setup();
        assert!(matches!(
            manager.connect("garage").await,
            Err(Error::UnknownLocation(_))
        ));
        assert!(manager.connection_for("garage").is_none());
    }

    #[tokio::test]
    async fn test_recover_only_reconnects_once() {
        let (_cluster, manager) = setup();
        let first = manager.connect("salon").await.unwrap();

        let second = manager.recover("salon", &first).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        // A caller still holding the old handle gets the replacement
        let third = manager.recover("salon", &first).await.unwrap();
        assert!(Arc::ptr_eq(&second, &third));
    }

    #[tokio::test]
    async fn test_disconnect_closes_slot() {
        let (_cluster, manager) = setup();
        manager.connect("chambre1").await.unwrap();
        manager.disconnect("chambre1").await.unwrap();
        assert!(manager.connection_for("chambre1").is_none());
        assert_eq!(manager.state("chambre1"), Some(ConnectionState::Closed));
    }

    #[tokio::test]
    async fn test_reconnect_follows_discovered_primary() {
        let config = ShardingConfig::default();
        let registry = Arc::new(ShardRegistry::new(&config).unwrap());
        let cluster = Arc::new(MemoryCluster::new());
        let node_a = ShardAddr::new("node-a", 6379);
        let node_b = ShardAddr::new("node-b", 6379);
        cluster.add_node(&node_a, ReplicationRole::Primary);
        let replica = cluster.add_node(&node_b, ReplicationRole::Replica);

        let discovery = Arc::new(StaticDiscovery::new());
        discovery.set_primary("salon-master", node_a.clone());

        let manager = ShardConnectionManager::new(
            registry,
            Arc::clone(&cluster) as Arc<dyn ShardConnector>,
            &config.connection,
        )
        .with_discovery(Arc::clone(&discovery) as Arc<dyn PrimaryDiscovery>);

        assert_eq!(manager.connect("salon").await.unwrap().addr(), &node_a);

        // External election promotes node-b
        replica.set_role(ReplicationRole::Primary);
        discovery.set_primary("salon-master", node_b.clone());

        assert_eq!(manager.reconnect("salon").await.unwrap().addr(), &node_b);
    }

    #[tokio::test]
    async fn test_probe_drops_dead_connection() {
        let (cluster, manager) = setup();
        manager.connect("salon").await.unwrap();
        let salon = manager.registry().endpoint_for("salon").unwrap().addr();
        cluster.node(&salon).unwrap().set_up(false);

        let snapshot = manager.probe("salon").await.unwrap();
        assert!(!snapshot.reachable);
        assert!(snapshot.error.is_some());
        assert!(manager.connection_for("salon").is_none());

        cluster.node(&salon).unwrap().set_up(true);
        let snapshot = manager.probe("salon").await.unwrap();
        assert!(snapshot.reachable);
        assert_eq!(snapshot.role.as_deref(), Some("master"));
        assert_eq!(snapshot.key_count, Some(0));
    }

    #[tokio::test]
    async fn test_connect_all_reports_each_location() {
        let (cluster, manager) = setup();
        let cuisine = manager.registry().endpoint_for("cuisine").unwrap().addr();
        cluster.node(&cuisine).unwrap().set_up(false);

        let outcomes = manager.connect_all().await;
        assert_eq!(outcomes.len(), 5);
        assert_eq!(outcomes.iter().filter(|(_, r)| r.is_err()).count(), 1);
        assert_eq!(manager.live_locations().len(), 4);

        cluster.node(&cuisine).unwrap().set_up(true);
        let revived = manager.connect_missing().await;
        assert_eq!(revived, vec![ShardLocation::new("cuisine")]);
    }
}
