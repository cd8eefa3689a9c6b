//! # roomshard
//!
//! A room-sharded IoT time-series store.
//!
//! Every room of a building owns one storage shard. A sensor series
//! `sensor:{type}:{location}:{id}` lives on the shard of its location, so
//! writes never cross shards and a failed shard only takes its own room
//! offline.
//!
//! ## Architecture
//!
//! - **Sharding**: key codec, registry, connection manager with primary
//!   discovery and failover, provisioning, routing and fan-out queries
//! - **Store**: the per-shard engine interface, backed in memory or by Redis
//!   TimeSeries over RESP
//! - **Ingest**: synthetic backfill and live telemetry generation
//! - **Archive**: periodic drain of recent data into a line protocol sink
//! - **API**: HTTP endpoints over queries, status and distribution

pub mod api;
pub mod archive;
pub mod clock;
pub mod config;
pub mod discovery;
pub mod ingest;
pub mod query;
pub mod report;
pub mod sharding;
pub mod store;
pub mod telemetry;

mod error;

pub use config::Config;
pub use error::{Error, Result};
