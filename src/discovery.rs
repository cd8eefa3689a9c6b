//! Primary discovery
//!
//! Primary election happens outside this system. Discovery only asks the
//! election mechanism where the writable primary of a shard currently lives.

use crate::sharding::ShardAddr;
use crate::store::{RespConnection, RespValue};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Resolves the current primary of a logical shard
#[async_trait]
pub trait PrimaryDiscovery: Send + Sync {
    async fn discover_primary(&self, shard_name: &str) -> Result<ShardAddr>;
}

/// Asks a list of Redis Sentinels, first answer wins
#[derive(Debug, Clone)]
pub struct SentinelDiscovery {
    sentinels: Vec<ShardAddr>,
    connect_timeout: Duration,
    op_timeout: Duration,
}

impl SentinelDiscovery {
    pub fn new(sentinels: Vec<ShardAddr>, connect_timeout: Duration, op_timeout: Duration) -> Self {
        Self {
            sentinels,
            connect_timeout,
            op_timeout,
        }
    }

    async fn ask(&self, sentinel: &ShardAddr, shard_name: &str) -> Result<ShardAddr> {
        let conn = RespConnection::open(sentinel, self.connect_timeout, self.op_timeout).await?;
        let reply = conn
            .call(&["SENTINEL", "get-master-addr-by-name", shard_name])
            .await?;
        parse_master_addr(shard_name, reply)
    }
}

fn parse_master_addr(shard_name: &str, reply: RespValue) -> Result<ShardAddr> {
    if matches!(reply, RespValue::Array(None) | RespValue::Bulk(None)) {
        return Err(Error::Discovery(format!(
            "sentinel does not know a primary named '{}'",
            shard_name
        )));
    }
    let parts = reply.into_array()?;
    match parts.as_slice() {
        [host, port] => {
            let host = host
                .as_text()
                .ok_or_else(|| Error::Discovery("primary host is not text".to_string()))?;
            let port = port
                .as_i64()
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| Error::Discovery("primary port is not a valid port".to_string()))?;
            Ok(ShardAddr::new(host, port))
        }
        _ => Err(Error::Discovery(format!(
            "unexpected sentinel reply for '{}'",
            shard_name
        ))),
    }
}

#[async_trait]
impl PrimaryDiscovery for SentinelDiscovery {
    async fn discover_primary(&self, shard_name: &str) -> Result<ShardAddr> {
        let mut last_error = None;
        for sentinel in &self.sentinels {
            match self.ask(sentinel, shard_name).await {
                Ok(addr) => {
                    debug!(shard = shard_name, sentinel = %sentinel, primary = %addr, "Primary resolved");
                    return Ok(addr);
                }
                Err(e) => {
                    warn!(shard = shard_name, sentinel = %sentinel, error = %e, "Sentinel query failed");
                    last_error = Some(e);
                }
            }
        }
        Err(Error::Discovery(match last_error {
            Some(e) => format!("no sentinel answered for '{}': {}", shard_name, e),
            None => "no sentinels configured".to_string(),
        }))
    }
}

/// Fixed shard → primary table that can be rewritten at runtime to simulate
/// a failover
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    primaries: RwLock<HashMap<String, ShardAddr>>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_primary(&self, shard_name: impl Into<String>, addr: ShardAddr) {
        self.primaries.write().insert(shard_name.into(), addr);
    }
}

#[async_trait]
impl PrimaryDiscovery for StaticDiscovery {
    async fn discover_primary(&self, shard_name: &str) -> Result<ShardAddr> {
        self.primaries
            .read()
            .get(shard_name)
            .cloned()
            .ok_or_else(|| Error::Discovery(format!("no primary registered for '{}'", shard_name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn bulk(s: &str) -> RespValue {
        RespValue::Bulk(Some(Bytes::copy_from_slice(s.as_bytes())))
    }

    #[test]
    fn test_parse_master_addr() {
        let reply = RespValue::Array(Some(vec![bulk("10.0.0.7"), bulk("6380")]));
        assert_eq!(
            parse_master_addr("salon-master", reply).unwrap(),
            ShardAddr::new("10.0.0.7", 6380)
        );
        assert!(matches!(
            parse_master_addr("salon-master", RespValue::Array(None)),
            Err(Error::Discovery(_))
        ));
        let bad_port = RespValue::Array(Some(vec![bulk("h"), bulk("99999")]));
        assert!(parse_master_addr("salon-master", bad_port).is_err());
    }

    #[tokio::test]
    async fn test_static_discovery_failover() {
        let discovery = StaticDiscovery::new();
        discovery.set_primary("salon-master", ShardAddr::new("node-a", 6379));
        assert_eq!(
            discovery.discover_primary("salon-master").await.unwrap().host,
            "node-a"
        );
        discovery.set_primary("salon-master", ShardAddr::new("node-b", 6379));
        assert_eq!(
            discovery.discover_primary("salon-master").await.unwrap().host,
            "node-b"
        );
        assert!(discovery.discover_primary("cuisine-master").await.is_err());
    }

    #[tokio::test]
    async fn test_sentinel_without_sentinels() {
        let discovery = SentinelDiscovery::new(
            Vec::new(),
            Duration::from_millis(100),
            Duration::from_millis(100),
        );
        assert!(matches!(
            discovery.discover_primary("salon-master").await,
            Err(Error::Discovery(_))
        ));
    }
}
