//! In-process shard engine for development and testing
//!
//! [`MemoryCluster`] plays the role of the network: it maps addresses to
//! [`MemoryShardStore`] instances and refuses connections to instances that are
//! marked down. Instances can be demoted to replicas to exercise failover.

use super::{
    glob_match, DataPoint, ReplicationRole, SeriesInfo, SeriesMetadata, ServerStats,
    ShardConnector, ShardStore,
};
use crate::sharding::{ShardAddr, ShardLocation};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const READONLY_REPLY: &str = "READONLY You can't write against a read only replica.";

#[derive(Debug, Default)]
struct MemorySeries {
    metadata: Option<SeriesMetadata>,
    points: BTreeMap<i64, f64>,
}

impl MemorySeries {
    fn retention_ms(&self) -> u64 {
        self.metadata.as_ref().map(|m| m.retention_ms).unwrap_or(0)
    }

    fn enforce_retention(&mut self) {
        let retention = self.retention_ms() as i64;
        if retention == 0 {
            return;
        }
        if let Some((&last, _)) = self.points.iter().next_back() {
            let cutoff = last - retention;
            self.points = self.points.split_off(&cutoff);
        }
    }
}

/// One in-memory engine instance
#[derive(Debug)]
pub struct MemoryShardStore {
    series: DashMap<String, MemorySeries>,
    role: RwLock<ReplicationRole>,
    up: AtomicBool,
    latency: RwLock<Duration>,
}

impl MemoryShardStore {
    pub fn new(role: ReplicationRole) -> Self {
        Self {
            series: DashMap::new(),
            role: RwLock::new(role),
            up: AtomicBool::new(true),
            latency: RwLock::new(Duration::ZERO),
        }
    }

    /// Simulate the instance crashing (`false`) or coming back (`true`)
    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    /// Promote or demote the instance
    pub fn set_role(&self, role: ReplicationRole) {
        *self.role.write() = role;
    }

    /// Delay every operation, to exercise timeouts
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    async fn enter(&self) -> Result<()> {
        let latency = *self.latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if !self.is_up() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )));
        }
        Ok(())
    }

    async fn enter_write(&self) -> Result<()> {
        self.enter().await?;
        if *self.role.read() == ReplicationRole::Replica {
            return Err(Error::Protocol(READONLY_REPLY.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ShardStore for MemoryShardStore {
    async fn ping(&self) -> Result<()> {
        self.enter().await
    }

    async fn role(&self) -> Result<ReplicationRole> {
        self.enter().await?;
        Ok(self.role.read().clone())
    }

    async fn create_series(&self, key: &str, metadata: &SeriesMetadata) -> Result<()> {
        self.enter_write().await?;
        match self.series.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::SeriesExists(key.to_string())),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(MemorySeries {
                    metadata: Some(metadata.clone()),
                    points: BTreeMap::new(),
                });
                Ok(())
            }
        }
    }

    async fn append(&self, key: &str, point: DataPoint) -> Result<()> {
        self.enter_write().await?;
        // Appending to an absent series creates it without labels
        let mut series = self.series.entry(key.to_string()).or_default();
        series.points.insert(point.timestamp_ms, point.value);
        series.enforce_retention();
        Ok(())
    }

    async fn range(&self, key: &str, start_ms: i64, end_ms: i64) -> Result<Vec<DataPoint>> {
        self.enter().await?;
        let series = self
            .series
            .get(key)
            .ok_or_else(|| Error::SeriesNotFound(key.to_string()))?;
        if start_ms > end_ms {
            return Ok(Vec::new());
        }
        Ok(series
            .points
            .range(start_ms..=end_ms)
            .map(|(ts, value)| DataPoint::new(*ts, *value))
            .collect())
    }

    async fn info(&self, key: &str) -> Result<SeriesInfo> {
        self.enter().await?;
        let series = self
            .series
            .get(key)
            .ok_or_else(|| Error::SeriesNotFound(key.to_string()))?;

        let first_timestamp = series.points.keys().next().copied().unwrap_or(0);
        let last_timestamp = series.points.keys().next_back().copied().unwrap_or(0);
        let labels = series
            .metadata
            .as_ref()
            .map(|m| m.labels.iter().cloned().collect())
            .unwrap_or_default();

        Ok(SeriesInfo {
            total_samples: series.points.len() as u64,
            first_timestamp,
            last_timestamp,
            retention_ms: series.retention_ms(),
            labels,
        })
    }

    async fn server_stats(&self) -> Result<ServerStats> {
        self.enter().await?;
        let points: usize = self.series.iter().map(|s| s.points.len()).sum();
        let used_memory_bytes = (self.series.len() * 256 + points * 16) as u64;
        Ok(ServerStats {
            used_memory_bytes,
            used_memory_human: human_bytes(used_memory_bytes),
        })
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.enter().await?;
        let mut keys: Vec<String> = self
            .series
            .iter()
            .filter(|entry| glob_match(pattern, entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        self.enter_write().await?;
        Ok(keys
            .iter()
            .filter(|key| self.series.remove(key.as_str()).is_some())
            .count() as u64)
    }
}

/// Address book of in-memory instances, acting as a [`ShardConnector`]
#[derive(Debug, Default)]
pub struct MemoryCluster {
    nodes: DashMap<String, Arc<MemoryShardStore>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an instance listening on `addr`
    pub fn add_node(&self, addr: &ShardAddr, role: ReplicationRole) -> Arc<MemoryShardStore> {
        let node = Arc::new(MemoryShardStore::new(role));
        self.nodes.insert(addr.to_string(), Arc::clone(&node));
        node
    }

    pub fn node(&self, addr: &ShardAddr) -> Option<Arc<MemoryShardStore>> {
        self.nodes.get(&addr.to_string()).map(|n| Arc::clone(n.value()))
    }
}

#[async_trait]
impl ShardConnector for MemoryCluster {
    async fn connect(
        &self,
        location: &ShardLocation,
        addr: &ShardAddr,
    ) -> Result<Arc<dyn ShardStore>> {
        match self.node(addr) {
            Some(node) if node.is_up() => Ok(node as Arc<dyn ShardStore>),
            _ => Err(Error::ShardUnreachable {
                location: location.to_string(),
                reason: format!("connection refused at {}", addr),
            }),
        }
    }
}

/// Format a byte count the way the engine's INFO does (`1.50K`, `2.00M`)
pub(crate) fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["K", "M", "G", "T"];
    if bytes < 1024 {
        return format!("{}B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = "B";
    for next in UNITS {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    format!("{:.2}{}", value, unit)
}
