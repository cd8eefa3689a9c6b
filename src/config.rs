//! Configuration and environment-based component factory
//!
//! [`Config`] is the parsed configuration file. [`ComponentFactory`] picks the
//! storage, discovery and sink backends from environment variables, so the
//! same binary runs against in-memory shards during development and real
//! Redis TimeSeries instances in production.

use crate::archive::{ArchiveConfig, ArchiveSink, LineProtocolSink, MemorySink, SinkConfig};
use crate::discovery::{PrimaryDiscovery, SentinelDiscovery};
use crate::ingest::GeneratorConfig;
use crate::sharding::{SensorType, ShardAddr, ShardRegistry};
use crate::store::{MemoryCluster, ReplicationRole, RespConnector, ShardConnector};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// One location's shard endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardEndpointConfig {
    pub location: String,
    pub host: String,
    pub port: u16,
    pub display_name: String,
    /// Name known to primary discovery (default: `<location>-master`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_name: Option<String>,
}

impl ShardEndpointConfig {
    pub fn new(
        location: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            location: location.into(),
            host: host.into(),
            port,
            display_name: display_name.into(),
            master_name: None,
        }
    }

    pub fn with_master_name(mut self, master_name: impl Into<String>) -> Self {
        self.master_name = Some(master_name.into());
        self
    }
}

/// Connection behaviour shared by every shard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// AUTH password, if the shards require one
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub connect_timeout_ms: u64,
    /// Bound on every single network call
    pub op_timeout_ms: u64,
    /// Optional bound on a whole fan-out
    pub fan_out_deadline_ms: Option<u64>,
    /// Sentinel addresses (`host:port`) used when discovery is enabled
    pub sentinels: Vec<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            password: None,
            connect_timeout_ms: 2_000,
            op_timeout_ms: 5_000,
            fan_out_deadline_ms: None,
            sentinels: Vec::new(),
        }
    }
}

impl ConnectionConfig {
    pub fn fan_out_deadline(&self) -> Option<Duration> {
        self.fan_out_deadline_ms.map(Duration::from_millis)
    }
}

/// Shard topology and the logical key space
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardingConfig {
    pub shards: Vec<ShardEndpointConfig>,
    pub sensor_types: Vec<SensorType>,
    /// Unit of measure per sensor type; types not listed use their default
    pub unit_measures: BTreeMap<SensorType, String>,
    /// Sensors per (location, type); ids run 1..=N
    pub sensors_per_type: u32,
    /// Retention applied when a series is created
    pub retention_ms: u64,
    pub connection: ConnectionConfig,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            shards: vec![
                ShardEndpointConfig::new("salon", "localhost", 6379, "Salon"),
                ShardEndpointConfig::new("chambre1", "localhost", 6381, "Chambre 1"),
                ShardEndpointConfig::new("chambre2", "localhost", 6383, "Chambre 2"),
                ShardEndpointConfig::new("cuisine", "localhost", 6385, "Cuisine"),
                ShardEndpointConfig::new("salle_de_bain", "localhost", 6387, "Salle de bain")
                    .with_master_name("sdb-master"),
            ],
            sensor_types: SensorType::ALL.to_vec(),
            unit_measures: SensorType::ALL
                .iter()
                .map(|t| (*t, t.default_unit().to_string()))
                .collect(),
            sensors_per_type: 3,
            // 30 days
            retention_ms: 2_592_000_000,
            connection: ConnectionConfig::default(),
        }
    }
}

/// Complete configuration of the service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sharding: ShardingConfig,
    pub archive: ArchiveConfig,
    pub sink: SinkConfig,
    pub generator: GeneratorConfig,
}

impl Config {
    /// Load from a JSON file; missing sections take their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        let config: Config = serde_json::from_str(&raw).map_err(|e| {
            Error::Config(format!("invalid config file {}: {}", path.display(), e))
        })?;
        info!(path = %path.display(), shards = config.sharding.shards.len(), "Loaded configuration");
        Ok(config)
    }

    /// Load from `path` if given, else defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}

pub struct ComponentFactory;

impl ComponentFactory {
    /// Create the shard connector from environment
    ///
    /// Environment variables:
    /// - STORE_BACKEND: "memory" (default) or "resp"
    /// - SHARD_PASSWORD: AUTH password for "resp" (overrides the config file)
    pub fn create_connector(
        registry: &ShardRegistry,
        connection: &ConnectionConfig,
    ) -> Result<Arc<dyn ShardConnector>> {
        let backend = std::env::var("STORE_BACKEND").unwrap_or_else(|_| "memory".to_string());

        match backend.as_str() {
            "memory" => {
                info!("Using in-memory shards (development mode)");
                let cluster = MemoryCluster::new();
                for endpoint in registry.endpoints() {
                    cluster.add_node(&endpoint.addr(), ReplicationRole::Primary);
                }
                Ok(Arc::new(cluster))
            }
            "resp" => {
                let password = std::env::var("SHARD_PASSWORD")
                    .ok()
                    .or_else(|| connection.password.clone());
                info!(
                    connect_timeout_ms = connection.connect_timeout_ms,
                    op_timeout_ms = connection.op_timeout_ms,
                    auth = password.is_some(),
                    "Using Redis TimeSeries shards"
                );
                Ok(Arc::new(RespConnector::new(
                    password,
                    Duration::from_millis(connection.connect_timeout_ms),
                    Duration::from_millis(connection.op_timeout_ms),
                )))
            }
            _ => Err(Error::Config(format!(
                "Unknown STORE_BACKEND: {}. Use 'memory' or 'resp'",
                backend
            ))),
        }
    }

    /// Create primary discovery from environment
    ///
    /// Environment variables:
    /// - DISCOVERY_BACKEND: "static" (default, use configured endpoints) or "sentinel"
    /// - SENTINELS: comma-separated `host:port` list (overrides the config file)
    pub fn create_discovery(
        connection: &ConnectionConfig,
    ) -> Result<Option<Arc<dyn PrimaryDiscovery>>> {
        let backend = std::env::var("DISCOVERY_BACKEND").unwrap_or_else(|_| "static".to_string());

        match backend.as_str() {
            "static" => {
                info!("Using static shard endpoints");
                Ok(None)
            }
            "sentinel" => {
                let raw: Vec<String> = match std::env::var("SENTINELS") {
                    Ok(list) => list
                        .split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect(),
                    Err(_) => connection.sentinels.clone(),
                };
                if raw.is_empty() {
                    return Err(Error::Config(
                        "SENTINELS or connection.sentinels required when DISCOVERY_BACKEND=sentinel"
                            .to_string(),
                    ));
                }
                let sentinels = raw
                    .iter()
                    .map(|s| ShardAddr::parse(s))
                    .collect::<Result<Vec<_>>>()?;

                info!(sentinels = ?raw, "Using sentinel primary discovery");
                Ok(Some(Arc::new(SentinelDiscovery::new(
                    sentinels,
                    Duration::from_millis(connection.connect_timeout_ms),
                    Duration::from_millis(connection.op_timeout_ms),
                ))))
            }
            _ => Err(Error::Config(format!(
                "Unknown DISCOVERY_BACKEND: {}. Use 'static' or 'sentinel'",
                backend
            ))),
        }
    }

    /// Create the archive sink from environment
    ///
    /// Environment variables:
    /// - SINK_BACKEND: "memory" (default) or "influx"
    /// - INFLUX_URL, INFLUX_ORG, INFLUX_BUCKET, INFLUX_TOKEN: override the config file
    pub fn create_sink(config: &SinkConfig) -> Result<Arc<dyn ArchiveSink>> {
        let backend = std::env::var("SINK_BACKEND").unwrap_or_else(|_| "memory".to_string());

        match backend.as_str() {
            "memory" => {
                info!("Using in-memory archive sink (development mode)");
                Ok(Arc::new(MemorySink::new()))
            }
            "influx" => {
                let mut config = config.clone();
                if let Ok(url) = std::env::var("INFLUX_URL") {
                    config.url = url;
                }
                if let Ok(org) = std::env::var("INFLUX_ORG") {
                    config.org = org;
                }
                if let Ok(bucket) = std::env::var("INFLUX_BUCKET") {
                    config.bucket = bucket;
                }
                if let Ok(token) = std::env::var("INFLUX_TOKEN") {
                    config.token = Some(token);
                }

                info!(
                    url = %config.url,
                    org = %config.org,
                    bucket = %config.bucket,
                    "Using line protocol archive sink"
                );
                Ok(Arc::new(LineProtocolSink::new(config)?))
            }
            _ => Err(Error::Config(format!(
                "Unknown SINK_BACKEND: {}. Use 'memory' or 'influx'",
                backend
            ))),
        }
    }
}
