//! Logical sensor identity and its physical series name

use super::ShardLocation;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of sensor. The set is closed: every deployment records these three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    Temperature,
    Humidity,
    AirQuality,
}

impl SensorType {
    pub const ALL: [SensorType; 3] = [
        SensorType::Temperature,
        SensorType::Humidity,
        SensorType::AirQuality,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::AirQuality => "air_quality",
        }
    }

    /// Unit of measure used when the configuration does not override it
    pub fn default_unit(&self) -> &'static str {
        match self {
            Self::Temperature => "celsius",
            Self::Humidity => "percent",
            Self::AirQuality => "aqi",
        }
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SensorType {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "temperature" => Ok(Self::Temperature),
            "humidity" => Ok(Self::Humidity),
            "air_quality" => Ok(Self::AirQuality),
            other => Err(Error::MalformedKey(format!(
                "unknown sensor type '{}'; expected one of temperature, humidity, air_quality",
                other
            ))),
        }
    }
}

/// Identity of one sensor series: (type, location, id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SensorSeriesKey {
    pub sensor_type: SensorType,
    pub location: ShardLocation,
    pub sensor_id: u32,
}

impl SensorSeriesKey {
    pub fn new(sensor_type: SensorType, location: ShardLocation, sensor_id: u32) -> Self {
        Self {
            sensor_type,
            location,
            sensor_id,
        }
    }

    /// Physical series name on the shard
    pub fn series_name(&self) -> String {
        ShardKeyCodec::encode(self.sensor_type, &self.location, self.sensor_id)
    }
}

impl fmt::Display for SensorSeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            ShardKeyCodec::PREFIX,
            self.sensor_type,
            self.location,
            self.sensor_id
        )
    }
}

impl std::str::FromStr for SensorSeriesKey {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        ShardKeyCodec::decode(value)
    }
}

/// Bijective mapping between [`SensorSeriesKey`] and `sensor:{type}:{location}:{id}`
pub struct ShardKeyCodec;

impl ShardKeyCodec {
    pub const PREFIX: &'static str = "sensor";

    /// Pattern matching every series this system writes
    pub const SCAN_PATTERN: &'static str = "sensor:*";

    pub fn encode(sensor_type: SensorType, location: &ShardLocation, sensor_id: u32) -> String {
        format!(
            "{}:{}:{}:{}",
            Self::PREFIX,
            sensor_type.as_str(),
            location.as_str(),
            sensor_id
        )
    }

    pub fn decode(key: &str) -> Result<SensorSeriesKey> {
        let parts: Vec<&str> = key.split(':').collect();
        let [prefix, sensor_type, location, sensor_id] = parts.as_slice() else {
            return Err(Error::MalformedKey(format!(
                "'{}' has {} segments, expected 4",
                key,
                parts.len()
            )));
        };

        if *prefix != Self::PREFIX {
            return Err(Error::MalformedKey(format!(
                "'{}' does not start with '{}:'",
                key,
                Self::PREFIX
            )));
        }

        let sensor_type = sensor_type
            .parse::<SensorType>()
            .map_err(|_| Error::MalformedKey(format!("'{}' has unknown sensor type", key)))?;

        if location.is_empty() {
            return Err(Error::MalformedKey(format!("'{}' has an empty location", key)));
        }

        let sensor_id = sensor_id
            .parse::<u32>()
            .ok()
            .filter(|id| *id >= 1)
            .ok_or_else(|| Error::MalformedKey(format!("'{}' has invalid sensor id", key)))?;

        Ok(SensorSeriesKey {
            sensor_type,
            location: ShardLocation::new(*location),
            sensor_id,
        })
    }
}
