//! InfluxDB 2.x line protocol sink

use super::sink::{ArchivePoint, ArchiveSink};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::time::Duration;
use tracing::{debug, info};

/// Where and how the archive is written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub url: String,
    pub org: String,
    pub bucket: String,
    #[serde(skip_serializing)]
    pub token: Option<String>,
    pub timeout_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8086".to_string(),
            org: "tp_iot".to_string(),
            bucket: "sensors_archive".to_string(),
            token: None,
            timeout_ms: 30_000,
        }
    }
}

/// Writes batches to `/api/v2/write` with nanosecond precision
#[derive(Debug, Clone)]
pub struct LineProtocolSink {
    http: Client,
    config: SinkConfig,
}

impl LineProtocolSink {
    pub fn new(config: SinkConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            http,
            config: SinkConfig {
                url: config.url.trim_end_matches('/').to_string(),
                ..config
            },
        })
    }

    fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.config.token {
            Some(token) => builder.header("Authorization", format!("Token {}", token)),
            None => builder,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BucketsResponse {
    #[serde(default)]
    buckets: Vec<Bucket>,
}

#[derive(Debug, Deserialize)]
struct Bucket {
    name: String,
}

#[derive(Debug, Deserialize)]
struct OrganizationsResponse {
    #[serde(default)]
    orgs: Vec<Organization>,
}

#[derive(Debug, Deserialize)]
struct Organization {
    id: String,
    name: String,
}

#[derive(Debug, Serialize)]
struct BucketCreateRequest<'a> {
    #[serde(rename = "orgID")]
    org_id: &'a str,
    name: &'a str,
    #[serde(rename = "retentionRules")]
    retention_rules: Vec<serde_json::Value>,
}

fn request_failed(context: &str, e: reqwest::Error) -> Error {
    Error::SinkWriteFailed(format!("{} failed: {}", context, e))
}

async fn rejected(context: &str, response: Response) -> Error {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    Error::SinkWriteFailed(format!("{} returned {}: {}", context, status, text))
}

async fn read_json<T: DeserializeOwned>(context: &str, response: Response) -> Result<T> {
    let text = response
        .text()
        .await
        .map_err(|e| request_failed(context, e))?;
    serde_json::from_str(&text)
        .map_err(|e| Error::SinkWriteFailed(format!("{} sent an unexpected body: {}", context, e)))
}

impl LineProtocolSink {
    /// Whether the configured bucket exists in the configured org
    pub async fn find_bucket(&self) -> Result<bool> {
        let buckets_url = format!("{}/api/v2/buckets", self.config.url);
        let response = self
            .request(Method::GET, &buckets_url)
            .query(&[
                ("name", self.config.bucket.as_str()),
                ("org", self.config.org.as_str()),
            ])
            .send()
            .await
            .map_err(|e| request_failed("bucket lookup", e))?;

        match response.status() {
            StatusCode::OK => {
                let found: BucketsResponse = read_json("bucket lookup", response).await?;
                Ok(found.buckets.iter().any(|b| b.name == self.config.bucket))
            }
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(rejected("bucket lookup", response).await),
        }
    }

    /// ID of the configured org
    pub async fn find_org_id(&self) -> Result<String> {
        let orgs_url = format!("{}/api/v2/orgs", self.config.url);
        let response = self
            .request(Method::GET, &orgs_url)
            .query(&[("org", self.config.org.as_str())])
            .send()
            .await
            .map_err(|e| request_failed("organization lookup", e))?;

        let orgs = match response.status() {
            StatusCode::OK => {
                read_json::<OrganizationsResponse>("organization lookup", response)
                    .await?
                    .orgs
            }
            StatusCode::NOT_FOUND => Vec::new(),
            _ => return Err(rejected("organization lookup", response).await),
        };
        orgs.into_iter()
            .find(|o| o.name == self.config.org)
            .map(|o| o.id)
            .ok_or_else(|| {
                Error::SinkWriteFailed(format!("organization '{}' not found", self.config.org))
            })
    }

    /// Create the configured bucket under the configured org unless it
    /// already exists
    pub async fn ensure_bucket(&self) -> Result<()> {
        if self.find_bucket().await? {
            debug!(bucket = %self.config.bucket, "Archive bucket present");
            return Ok(());
        }

        let org_id = self.find_org_id().await?;
        let body = BucketCreateRequest {
            org_id: &org_id,
            name: &self.config.bucket,
            retention_rules: Vec::new(),
        };
        let buckets_url = format!("{}/api/v2/buckets", self.config.url);
        let response = self
            .request(Method::POST, &buckets_url)
            .header(CONTENT_TYPE, "application/json")
            .body(serde_json::to_string(&body)?)
            .send()
            .await
            .map_err(|e| request_failed("bucket creation", e))?;

        match response.status() {
            StatusCode::CREATED | StatusCode::OK => {
                info!(
                    bucket = %self.config.bucket,
                    org = %self.config.org,
                    "Archive bucket created"
                );
                Ok(())
            }
            _ => Err(rejected("bucket creation", response).await),
        }
    }
}

#[async_trait]
impl ArchiveSink for LineProtocolSink {
    async fn write(&self, batch: &[ArchivePoint]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let body = encode_batch(batch);
        let write_url = format!("{}/api/v2/write", self.config.url);

        let response = self
            .request(Method::POST, &write_url)
            .query(&[
                ("bucket", self.config.bucket.as_str()),
                ("org", self.config.org.as_str()),
                ("precision", "ns"),
            ])
            .body(body)
            .send()
            .await
            .map_err(|e| Error::SinkWriteFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::SinkWriteFailed(format!("{}: {}", status, text)));
        }

        debug!(points = batch.len(), bucket = %self.config.bucket, "Batch written");
        Ok(())
    }

    async fn check(&self) -> Result<()> {
        let health_url = format!("{}/health", self.config.url);
        let response = self
            .request(Method::GET, &health_url)
            .send()
            .await
            .map_err(|e| request_failed("health check", e))?;
        if !response.status().is_success() {
            return Err(rejected("health check", response).await);
        }
        self.ensure_bucket().await
    }
}

/// Render points as newline-terminated line protocol
pub fn encode_batch(batch: &[ArchivePoint]) -> String {
    let mut out = String::with_capacity(batch.len() * 64);
    for point in batch {
        out.push_str(&escape(&point.measurement, &[',', ' ']));
        for (k, v) in &point.tags {
            let _ = write!(
                out,
                ",{}={}",
                escape(k, &[',', '=', ' ']),
                escape(v, &[',', '=', ' '])
            );
        }
        let mut separator = ' ';
        for (k, v) in &point.fields {
            let _ = write!(out, "{}{}={}", separator, escape(k, &[',', '=', ' ']), v);
            separator = ',';
        }
        let _ = writeln!(out, " {}", point.timestamp_ns);
    }
    out
}

fn escape(value: &str, special: &[char]) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '\\' || special.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharding::{SensorSeriesKey, SensorType, ShardLocation};
    use crate::store::DataPoint;
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn sample() -> Vec<ArchivePoint> {
        let salon = SensorSeriesKey::new(SensorType::Temperature, ShardLocation::new("salon"), 1);
        let cuisine = SensorSeriesKey::new(SensorType::Humidity, ShardLocation::new("cuisine"), 2);
        vec![
            ArchivePoint::from_sample(&salon, &DataPoint::new(1_700_000_000_000, 21.5)),
            ArchivePoint::from_sample(&cuisine, &DataPoint::new(1_700_000_000_000, 48.0)),
        ]
    }

    #[test]
    fn test_encode_batch() {
        assert_eq!(
            encode_batch(&sample()),
            "\
temperature,location=salon,sensor_id=1 value=21.5 1700000000000000000
humidity,location=cuisine,sensor_id=2 value=48 1700000000000000000
"
        );
    }

    #[test]
    fn test_escaping() {
        assert_eq!(escape("salle de bain", &[',', '=', ' ']), "salle\\ de\\ bain");
        assert_eq!(escape("a=b,c", &[',', '=', ' ']), "a\\=b\\,c");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn writing_points() {
        let mut mock_server = Server::new_async().await;
        let mock = mock_server
            .mock(
                "POST",
                "/api/v2/write?bucket=sensors_archive&org=tp_iot&precision=ns",
            )
            .match_header("Authorization", "Token some-token")
            .match_body(encode_batch(&sample()).as_str())
            .with_status(204)
            .create_async()
            .await;

        let sink = LineProtocolSink::new(SinkConfig {
            url: mock_server.url(),
            token: Some("some-token".to_string()),
            ..SinkConfig::default()
        })
        .unwrap();

        // Assert on the mock rather than with `?` so mismatches are explained
        let _result = sink.write(&sample()).await;

        mock.assert_async().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn rejected_write_is_sink_failure() {
        let mut mock_server = Server::new_async().await;
        let _mock = mock_server
            .mock(
                "POST",
                "/api/v2/write?bucket=sensors_archive&org=tp_iot&precision=ns",
            )
            .with_status(503)
            .with_body("unavailable")
            .create_async()
            .await;

        let sink = LineProtocolSink::new(SinkConfig {
            url: mock_server.url(),
            ..SinkConfig::default()
        })
        .unwrap();

        let err = sink.write(&sample()).await.unwrap_err();
        assert!(matches!(err, Error::SinkWriteFailed(_)));
        assert!(err.to_string().contains("503"));
    }

    fn sink_for(server: &Server) -> LineProtocolSink {
        LineProtocolSink::new(SinkConfig {
            url: server.url(),
            token: Some("some-token".to_string()),
            ..SinkConfig::default()
        })
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn existing_bucket_is_not_recreated() {
        let mut mock_server = Server::new_async().await;
        let health = mock_server
            .mock("GET", "/health")
            .with_status(200)
            .create_async()
            .await;
        let lookup = mock_server
            .mock("GET", "/api/v2/buckets?name=sensors_archive&org=tp_iot")
            .match_header("Authorization", "Token some-token")
            .with_status(200)
            .with_body(json!({"buckets": [{"id": "b1", "name": "sensors_archive"}]}).to_string())
            .create_async()
            .await;
        let create = mock_server
            .mock("POST", "/api/v2/buckets")
            .expect(0)
            .create_async()
            .await;

        sink_for(&mock_server).check().await.unwrap();

        health.assert_async().await;
        lookup.assert_async().await;
        create.assert_async().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn missing_bucket_is_created_in_org() {
        let mut mock_server = Server::new_async().await;
        let _lookup = mock_server
            .mock("GET", "/api/v2/buckets?name=sensors_archive&org=tp_iot")
            .with_status(200)
            .with_body(json!({"buckets": []}).to_string())
            .create_async()
            .await;
        let _orgs = mock_server
            .mock("GET", "/api/v2/orgs?org=tp_iot")
            .with_status(200)
            .with_body(json!({"orgs": [{"id": "0a1b2c", "name": "tp_iot"}]}).to_string())
            .create_async()
            .await;
        let create = mock_server
            .mock("POST", "/api/v2/buckets")
            .match_header("Authorization", "Token some-token")
            .match_body(Matcher::Json(json!({
                "orgID": "0a1b2c",
                "name": "sensors_archive",
                "retentionRules": []
            })))
            .with_status(201)
            .with_body(json!({"id": "b2", "name": "sensors_archive"}).to_string())
            .create_async()
            .await;

        sink_for(&mock_server).ensure_bucket().await.unwrap();

        create.assert_async().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn missing_org_refuses_to_archive() {
        let mut mock_server = Server::new_async().await;
        let _lookup = mock_server
            .mock("GET", "/api/v2/buckets?name=sensors_archive&org=tp_iot")
            .with_status(404)
            .with_body(json!({"code": "not found"}).to_string())
            .create_async()
            .await;
        let _orgs = mock_server
            .mock("GET", "/api/v2/orgs?org=tp_iot")
            .with_status(404)
            .create_async()
            .await;

        let err = sink_for(&mock_server).ensure_bucket().await.unwrap_err();
        assert!(matches!(err, Error::SinkWriteFailed(_)));
        assert!(err.to_string().contains("tp_iot"));
    }
}
