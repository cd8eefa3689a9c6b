//! Timestamped JSON reports for operators

use crate::sharding::{DistributionReport, ShardRegistry, ShardStatusSnapshot};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

/// File name of the topology snapshot written at startup
pub const CONFIG_SNAPSHOT_FILE: &str = "sharding_config.json";

#[derive(Debug, Serialize)]
struct StatusReport<'a> {
    timestamp: DateTime<Utc>,
    shards: &'a [ShardStatusSnapshot],
}

/// Writes reports into one directory, creating it on first use
#[derive(Debug, Clone)]
pub struct ReportWriter {
    dir: PathBuf,
}

impl ReportWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `status_report_<YYYYmmdd_HHMMSS>.json`
    pub async fn write_status(
        &self,
        shards: &[ShardStatusSnapshot],
        at: DateTime<Utc>,
    ) -> Result<PathBuf> {
        let report = StatusReport {
            timestamp: at,
            shards,
        };
        self.write_json(&timestamped("status_report", at), &report).await
    }

    /// `distribution_report_<YYYYmmdd_HHMMSS>.json`
    pub async fn write_distribution(&self, report: &DistributionReport) -> Result<PathBuf> {
        self.write_json(&timestamped("distribution_report", report.timestamp), report)
            .await
    }

    /// Topology snapshot, overwritten on every startup
    pub async fn write_config_snapshot(&self, registry: &ShardRegistry) -> Result<PathBuf> {
        self.write_json(CONFIG_SNAPSHOT_FILE, &registry.snapshot()).await
    }

    async fn write_json<T: Serialize + ?Sized>(&self, file_name: &str, value: &T) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(file_name);
        let body = serde_json::to_vec_pretty(value)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        fs::write(&path, body).await?;
        info!(path = %path.display(), "Report written");
        Ok(path)
    }
}

fn timestamped(prefix: &str, at: DateTime<Utc>) -> String {
    format!("{}_{}.json", prefix, at.format("%Y%m%d_%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShardingConfig;
    use crate::sharding::{ConnectionState, ShardLocation};
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_status_report_file() {
        let dir = TempDir::new().unwrap();
        let writer = ReportWriter::new(dir.path().join("reports"));
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap();
        let shards = vec![ShardStatusSnapshot {
            location: ShardLocation::new("salon"),
            display_name: "Salon".to_string(),
            addr: "localhost:6379".to_string(),
            reachable: false,
            state: ConnectionState::Unconnected,
            role: None,
            used_memory: None,
            key_count: None,
            error: Some("connection refused".to_string()),
        }];

        let path = writer.write_status(&shards, at).await.unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "status_report_20240305_140709.json"
        );

        let body: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(body["shards"][0]["location"], "salon");
        assert_eq!(body["shards"][0]["reachable"], false);
    }

    #[tokio::test]
    async fn test_config_snapshot_has_no_password() {
        let dir = TempDir::new().unwrap();
        let writer = ReportWriter::new(dir.path());
        let mut config = ShardingConfig::default();
        config.connection.password = Some("hunter2".to_string());
        let registry = ShardRegistry::new(&config).unwrap();

        let path = writer.write_config_snapshot(&registry).await.unwrap();
        let raw = std::fs::read_to_string(path).unwrap();
        assert!(raw.contains("salle_de_bain"));
        assert!(!raw.contains("hunter2"));
    }
}
