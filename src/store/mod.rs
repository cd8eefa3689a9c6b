//! Per-shard storage engine interface
//!
//! A shard is a time-series engine that supports create-series, append,
//! range-query and series-info. The engine itself is external; this module
//! defines the protocol boundary and ships two backends:
//!
//! - [`RespShardStore`]: Redis TimeSeries over RESP2
//! - [`MemoryShardStore`]: in-process engine for tests and local runs

mod memory;
mod resp;

pub use memory::{MemoryCluster, MemoryShardStore};
pub use resp::{
    decode_value, encode_command, RespConnection, RespConnector, RespShardStore, RespValue,
};

use crate::sharding::{ShardAddr, ShardLocation};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One sample of a series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub timestamp_ms: i64,
    pub value: f64,
}

impl DataPoint {
    pub fn new(timestamp_ms: i64, value: f64) -> Self {
        Self {
            timestamp_ms,
            value,
        }
    }
}

/// Creation-time metadata of a series; never altered afterwards
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesMetadata {
    pub retention_ms: u64,
    /// Ordered label pairs, e.g. `sensorId`, `type`, `location`, `unit_measure`
    pub labels: Vec<(String, String)>,
}

/// Series statistics as reported by the engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeriesInfo {
    pub total_samples: u64,
    pub first_timestamp: i64,
    pub last_timestamp: i64,
    pub retention_ms: u64,
    pub labels: BTreeMap<String, String>,
}

/// Replication role of the instance behind a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationRole {
    /// Writable primary
    Primary,
    /// Read-only replica
    Replica,
}

impl ReplicationRole {
    /// Name used by the engine's replication report
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "master",
            Self::Replica => "slave",
        }
    }
}

/// Instance-level statistics used in status reports
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStats {
    pub used_memory_bytes: u64,
    pub used_memory_human: String,
}

/// Operations a shard's storage engine must support.
///
/// Implementations report a missing series as [`crate::Error::SeriesNotFound`]
/// and a duplicate create as [`crate::Error::SeriesExists`], distinct from every
/// other failure.
#[async_trait]
pub trait ShardStore: Send + Sync + std::fmt::Debug {
    /// Liveness probe
    async fn ping(&self) -> Result<()>;

    /// Whether this instance is currently the writable primary
    async fn role(&self) -> Result<ReplicationRole>;

    /// CREATE(series, retention, labels)
    async fn create_series(&self, key: &str, metadata: &SeriesMetadata) -> Result<()>;

    /// APPEND(series, timestamp, value); duplicate timestamps overwrite
    async fn append(&self, key: &str, point: DataPoint) -> Result<()>;

    /// RANGE(series, start, end), both bounds inclusive, time ordered
    async fn range(&self, key: &str, start_ms: i64, end_ms: i64) -> Result<Vec<DataPoint>>;

    /// INFO(series)
    async fn info(&self, key: &str) -> Result<SeriesInfo>;

    /// Memory usage of the instance
    async fn server_stats(&self) -> Result<ServerStats>;

    /// Keys matching a glob pattern (`*` and `?`)
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Delete keys, returning how many existed
    async fn delete(&self, keys: &[String]) -> Result<u64>;

    /// Release the underlying connection
    async fn close(&self) {}
}

/// Opens connections to shard instances
#[async_trait]
pub trait ShardConnector: Send + Sync {
    async fn connect(&self, location: &ShardLocation, addr: &ShardAddr)
        -> Result<Arc<dyn ShardStore>>;
}

/// Glob match supporting `*` (any run) and `?` (any single char)
pub fn glob_match(pattern: &str, candidate: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let candidate: Vec<char> = candidate.chars().collect();

    let (mut p, mut c) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut star_match = 0usize;

    while c < candidate.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == candidate[c]) {
            p += 1;
            c += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            star_match = c;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            star_match += 1;
            c = star_match;
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }

    p == pattern.len()
}
