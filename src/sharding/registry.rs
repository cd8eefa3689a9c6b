//! Static shard topology

use super::{SensorSeriesKey, SensorType, ShardLocation};
use crate::config::ShardingConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::ops::RangeInclusive;

/// Network address of a shard instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardAddr {
    pub host: String,
    pub port: u16,
}

impl ShardAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`
    pub fn parse(value: &str) -> Result<Self> {
        let (host, port) = value
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("address '{}' is not host:port", value)))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::Config(format!("address '{}' has an invalid port", value)))?;
        if host.is_empty() {
            return Err(Error::Config(format!("address '{}' has an empty host", value)));
        }
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for ShardAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Configured endpoint of one location's shard
#[derive(Debug, Clone, Serialize)]
pub struct ShardEndpoint {
    pub location: ShardLocation,
    pub host: String,
    pub port: u16,
    pub display_name: String,
    /// Name under which primary discovery knows this shard
    pub master_name: String,
}

impl ShardEndpoint {
    pub fn addr(&self) -> ShardAddr {
        ShardAddr::new(self.host.clone(), self.port)
    }
}

#[derive(Debug, Serialize)]
struct SnapshotEndpoint<'a> {
    host: &'a str,
    port: u16,
    display_name: &'a str,
}

/// Operator-facing view of the topology. Credentials are never included.
#[derive(Debug, Serialize)]
pub struct ConfigSnapshot<'a> {
    shards: BTreeMap<&'a str, SnapshotEndpoint<'a>>,
    locations: Vec<&'a str>,
    sensor_types: Vec<&'static str>,
    unit_measures: BTreeMap<&'static str, &'a str>,
}

/// Location → endpoint mapping plus the logical key space, fixed at startup
#[derive(Debug)]
pub struct ShardRegistry {
    endpoints: Vec<ShardEndpoint>,
    index: HashMap<ShardLocation, usize>,
    sensor_types: Vec<SensorType>,
    unit_measures: BTreeMap<SensorType, String>,
    sensors_per_type: u32,
    retention_ms: u64,
}

impl ShardRegistry {
    /// Build the registry from an already-parsed configuration
    pub fn new(config: &ShardingConfig) -> Result<Self> {
        if config.shards.is_empty() {
            return Err(Error::Config("no shards configured".to_string()));
        }
        if config.sensor_types.is_empty() {
            return Err(Error::Config("no sensor types configured".to_string()));
        }
        if config.sensors_per_type == 0 {
            return Err(Error::Config("sensors_per_type must be at least 1".to_string()));
        }

        let mut endpoints = Vec::with_capacity(config.shards.len());
        let mut index = HashMap::with_capacity(config.shards.len());

        for (position, shard) in config.shards.iter().enumerate() {
            let name = shard.location.trim();
            if name.is_empty() || name.contains(':') {
                return Err(Error::Config(format!(
                    "invalid location name '{}': must be non-empty and contain no ':'",
                    shard.location
                )));
            }
            let location = ShardLocation::new(name);
            if index.insert(location.clone(), position).is_some() {
                return Err(Error::Config(format!("location '{}' configured twice", name)));
            }
            endpoints.push(ShardEndpoint {
                location,
                host: shard.host.clone(),
                port: shard.port,
                display_name: shard.display_name.clone(),
                master_name: shard
                    .master_name
                    .clone()
                    .unwrap_or_else(|| format!("{}-master", name)),
            });
        }

        let mut seen = HashSet::new();
        let sensor_types: Vec<SensorType> = config
            .sensor_types
            .iter()
            .copied()
            .filter(|t| seen.insert(*t))
            .collect();

        Ok(Self {
            endpoints,
            index,
            sensor_types,
            unit_measures: config.unit_measures.clone(),
            sensors_per_type: config.sensors_per_type,
            retention_ms: config.retention_ms,
        })
    }

    /// Locations in configuration order
    pub fn configured_locations(&self) -> Vec<ShardLocation> {
        self.endpoints.iter().map(|e| e.location.clone()).collect()
    }

    pub fn endpoints(&self) -> &[ShardEndpoint] {
        &self.endpoints
    }

    pub fn endpoint_for(&self, location: &str) -> Result<&ShardEndpoint> {
        self.index
            .get(location)
            .map(|&i| &self.endpoints[i])
            .ok_or_else(|| Error::UnknownLocation(location.to_string()))
    }

    /// Canonical handle for a configured location
    pub fn location(&self, name: &str) -> Result<ShardLocation> {
        self.endpoint_for(name).map(|e| e.location.clone())
    }

    pub fn contains(&self, location: &str) -> bool {
        self.index.contains_key(location)
    }

    pub fn sensor_types(&self) -> &[SensorType] {
        &self.sensor_types
    }

    pub fn sensors_per_type(&self) -> u32 {
        self.sensors_per_type
    }

    pub fn sensor_ids(&self) -> RangeInclusive<u32> {
        1..=self.sensors_per_type
    }

    pub fn retention_ms(&self) -> u64 {
        self.retention_ms
    }

    pub fn unit_for(&self, sensor_type: SensorType) -> &str {
        self.unit_measures
            .get(&sensor_type)
            .map(String::as_str)
            .unwrap_or_else(|| sensor_type.default_unit())
    }

    /// Configured sensor types measured in `unit`
    pub fn types_with_unit(&self, unit: &str) -> Vec<SensorType> {
        self.sensor_types
            .iter()
            .copied()
            .filter(|t| self.unit_for(*t).eq_ignore_ascii_case(unit))
            .collect()
    }

    /// Every series of one location: types × ids
    pub fn series_keys_for(&self, location: &ShardLocation) -> Vec<SensorSeriesKey> {
        self.sensor_types
            .iter()
            .flat_map(|t| {
                self.sensor_ids()
                    .map(move |id| SensorSeriesKey::new(*t, location.clone(), id))
            })
            .collect()
    }

    /// The full configured key space: locations × types × ids
    pub fn series_keys(&self) -> Vec<SensorSeriesKey> {
        self.endpoints
            .iter()
            .flat_map(|e| self.series_keys_for(&e.location))
            .collect()
    }

    /// Creation labels of a series
    pub fn labels_for(&self, key: &SensorSeriesKey) -> Vec<(String, String)> {
        vec![
            ("sensorId".to_string(), key.sensor_id.to_string()),
            ("type".to_string(), key.sensor_type.as_str().to_string()),
            ("location".to_string(), key.location.to_string()),
            (
                "unit_measure".to_string(),
                self.unit_for(key.sensor_type).to_string(),
            ),
        ]
    }

    pub fn snapshot(&self) -> ConfigSnapshot<'_> {
        ConfigSnapshot {
            shards: self
                .endpoints
                .iter()
                .map(|e| {
                    (
                        e.location.as_str(),
                        SnapshotEndpoint {
                            host: &e.host,
                            port: e.port,
                            display_name: &e.display_name,
                        },
                    )
                })
                .collect(),
            locations: self.endpoints.iter().map(|e| e.location.as_str()).collect(),
            sensor_types: self.sensor_types.iter().map(|t| t.as_str()).collect(),
            unit_measures: self
                .sensor_types
                .iter()
                .map(|t| (t.as_str(), self.unit_for(*t)))
                .collect(),
        }
    }
}
