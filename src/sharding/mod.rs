//! Location-based sharding
//!
//! Every room owns one shard. This module maps sensor identities onto shards,
//! keeps one live connection per shard and fans reads out across them without
//! letting one unreachable shard fail the whole operation.

mod connection;
mod distribution;
mod key;
mod provisioner;
mod registry;
mod router;

pub use connection::{ShardConnection, ShardConnectionManager};
pub use distribution::{compute_distribution, DistributionReport, ShardDistribution};
pub use key::{SensorSeriesKey, SensorType, ShardKeyCodec};
pub use provisioner::{ProvisionOutcome, ProvisionReport, SeriesProvisioner};
pub use registry::{ShardAddr, ShardEndpoint, ShardRegistry};
pub use router::{FanOutResult, QueryFailure, QueryResult, SeriesFilter, ShardRouter};

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

/// Shard identifier: the room name, e.g. `salon`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardLocation(Arc<str>);

impl ShardLocation {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ShardLocation {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ShardLocation {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Lifecycle of a shard connection slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Never connected, or the last attempt failed
    Unconnected,
    /// Connect or reconnect in progress
    Connecting,
    /// Live and passed its probes
    Healthy,
    /// A connection-class error was observed; recovery pending
    Degraded,
    /// Explicitly torn down
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unconnected => "unconnected",
            Self::Connecting => "connecting",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Closed => "closed",
        }
    }
}

/// Point-in-time view of one shard, recomputed for every report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardStatusSnapshot {
    pub location: ShardLocation,
    pub display_name: String,
    pub addr: String,
    pub reachable: bool,
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_memory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
