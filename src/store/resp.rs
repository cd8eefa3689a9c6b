//! Redis TimeSeries shard backend over RESP2
//!
//! One [`RespConnection`] is a single TCP stream with request/reply framing.
//! Calls are serialised on the stream and bounded by the operation timeout; a
//! call interrupted mid-reply leaves the stream unusable, so the connection is
//! poisoned and every later call fails with a connection-class error, which
//! makes the router reconnect.

use super::{
    DataPoint, ReplicationRole, SeriesInfo, SeriesMetadata, ServerStats, ShardConnector,
    ShardStore,
};
use crate::sharding::{ShardAddr, ShardLocation};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

const SCAN_BATCH: &str = "500";

/// A decoded RESP2 reply
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Bytes>),
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    pub fn as_text(&self) -> Option<String> {
        match self {
            RespValue::Simple(s) => Some(s.clone()),
            RespValue::Bulk(Some(b)) => std::str::from_utf8(b).ok().map(str::to_string),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RespValue::Integer(n) => Some(*n),
            other => other.as_text().and_then(|s| s.trim().parse().ok()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RespValue::Integer(n) => Some(*n as f64),
            other => other.as_text().and_then(|s| s.trim().parse().ok()),
        }
    }

    pub fn into_array(self) -> Result<Vec<RespValue>> {
        match self {
            RespValue::Array(Some(items)) => Ok(items),
            RespValue::Array(None) => Ok(Vec::new()),
            other => Err(Error::Protocol(format!("expected array reply, got {:?}", other))),
        }
    }
}

/// Encode a command as a RESP array of bulk strings
pub fn encode_command<A: AsRef<[u8]>>(args: &[A]) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        let arg = arg.as_ref();
        buf.put_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.put_slice(arg);
        buf.put_slice(b"\r\n");
    }
    buf
}

/// Decode one reply from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer holds an incomplete reply, otherwise the
/// value and the number of bytes it occupied.
pub fn decode_value(buf: &[u8]) -> Result<Option<(RespValue, usize)>> {
    decode_at(buf, 0)
}

fn decode_at(buf: &[u8], pos: usize) -> Result<Option<(RespValue, usize)>> {
    if pos >= buf.len() {
        return Ok(None);
    }
    let Some(line_end) = find_crlf(buf, pos + 1) else {
        return Ok(None);
    };
    let line = std::str::from_utf8(&buf[pos + 1..line_end])
        .map_err(|_| Error::Protocol("reply header is not utf-8".to_string()))?;
    let next = line_end + 2;

    match buf[pos] {
        b'+' => Ok(Some((RespValue::Simple(line.to_string()), next))),
        b'-' => Ok(Some((RespValue::Error(line.to_string()), next))),
        b':' => Ok(Some((RespValue::Integer(parse_header_int(line)?), next))),
        b'$' => {
            let len = parse_header_int(line)?;
            if len < 0 {
                return Ok(Some((RespValue::Bulk(None), next)));
            }
            let len = len as usize;
            if buf.len() < next + len + 2 {
                return Ok(None);
            }
            let data = Bytes::copy_from_slice(&buf[next..next + len]);
            Ok(Some((RespValue::Bulk(Some(data)), next + len + 2)))
        }
        b'*' => {
            let count = parse_header_int(line)?;
            if count < 0 {
                return Ok(Some((RespValue::Array(None), next)));
            }
            let mut items = Vec::with_capacity((count as usize).min(1024));
            let mut cursor = next;
            for _ in 0..count {
                match decode_at(buf, cursor)? {
                    Some((value, after)) => {
                        items.push(value);
                        cursor = after;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespValue::Array(Some(items)), cursor)))
        }
        other => Err(Error::Protocol(format!(
            "unexpected reply type byte 0x{:02x}",
            other
        ))),
    }
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    if from >= buf.len() {
        return None;
    }
    buf[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|offset| from + offset)
}

fn parse_header_int(line: &str) -> Result<i64> {
    line.parse::<i64>()
        .map_err(|_| Error::Protocol(format!("invalid integer in reply header: '{}'", line)))
}

#[derive(Debug)]
struct RespStream {
    stream: TcpStream,
    buf: BytesMut,
}

/// Single RESP connection with per-call timeout
#[derive(Debug)]
pub struct RespConnection {
    addr: ShardAddr,
    inner: Mutex<RespStream>,
    op_timeout: Duration,
    poisoned: AtomicBool,
}

impl RespConnection {
    pub async fn open(
        addr: &ShardAddr,
        connect_timeout: Duration,
        op_timeout: Duration,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(
            connect_timeout,
            TcpStream::connect((addr.host.as_str(), addr.port)),
        )
        .await??;
        stream.set_nodelay(true)?;

        debug!(addr = %addr, "RESP connection opened");

        Ok(Self {
            addr: addr.clone(),
            inner: Mutex::new(RespStream {
                stream,
                buf: BytesMut::with_capacity(8 * 1024),
            }),
            op_timeout,
            poisoned: AtomicBool::new(false),
        })
    }

    pub fn addr(&self) -> &ShardAddr {
        &self.addr
    }

    pub async fn authenticate(&self, password: &str) -> Result<()> {
        self.call(&["AUTH", password]).await.map(|_| ())
    }

    /// Send one command and wait for its reply. Error replies become
    /// [`Error::Protocol`] carrying the server message.
    ///
    /// The timeout starts once this caller owns the stream, so time spent
    /// queued behind another command does not count against it.
    pub async fn call<A: AsRef<[u8]> + Sync>(&self, args: &[A]) -> Result<RespValue> {
        let request = encode_command(args);
        let mut guard = self.inner.lock().await;
        if self.poisoned.load(Ordering::Acquire) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("connection to {} was interrupted mid-reply", self.addr),
            )));
        }

        // Stays set if the reply is never fully read, including when the
        // caller's future is dropped mid-flight
        self.poisoned.store(true, Ordering::Release);
        match tokio::time::timeout(self.op_timeout, self.round_trip(&mut guard, &request)).await {
            Ok(Ok(value)) => {
                self.poisoned.store(false, Ordering::Release);
                match value {
                    RespValue::Error(message) => Err(Error::Protocol(message)),
                    value => Ok(value),
                }
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::QueryTimeout),
        }
    }

    async fn round_trip(&self, conn: &mut RespStream, request: &[u8]) -> Result<RespValue> {
        let RespStream { stream, buf } = conn;

        stream.write_all(request).await?;

        loop {
            if let Some((value, consumed)) = decode_value(buf)? {
                buf.advance(consumed);
                return Ok(value);
            }
            let read = stream.read_buf(buf).await?;
            if read == 0 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("connection closed by {}", self.addr),
                )));
            }
        }
    }
}

/// Shard store speaking the Redis TimeSeries command set
#[derive(Debug)]
pub struct RespShardStore {
    conn: RespConnection,
}

impl RespShardStore {
    pub async fn connect(
        addr: &ShardAddr,
        connect_timeout: Duration,
        op_timeout: Duration,
        password: Option<&str>,
    ) -> Result<Self> {
        let conn = RespConnection::open(addr, connect_timeout, op_timeout).await?;
        if let Some(password) = password {
            conn.authenticate(password).await?;
        }
        Ok(Self { conn })
    }

    async fn series_call<A: AsRef<[u8]> + Sync>(&self, key: &str, args: &[A]) -> Result<RespValue> {
        self.conn.call(args).await.map_err(|e| match e {
            Error::Protocol(msg) if msg.contains("key does not exist") => {
                Error::SeriesNotFound(key.to_string())
            }
            Error::Protocol(msg) if msg.contains("already exists") => {
                Error::SeriesExists(key.to_string())
            }
            other => other,
        })
    }
}

#[async_trait]
impl ShardStore for RespShardStore {
    async fn ping(&self) -> Result<()> {
        match self.conn.call(&["PING"]).await? {
            RespValue::Simple(reply) if reply == "PONG" => Ok(()),
            other => Err(Error::Protocol(format!("unexpected PING reply: {:?}", other))),
        }
    }

    async fn role(&self) -> Result<ReplicationRole> {
        let reply = self.conn.call(&["INFO", "replication"]).await?;
        let text = reply
            .as_text()
            .ok_or_else(|| Error::Protocol("INFO replication returned no text".to_string()))?;
        match parse_info_section(&text).get("role").map(String::as_str) {
            Some("master") => Ok(ReplicationRole::Primary),
            Some("slave") | Some("replica") => Ok(ReplicationRole::Replica),
            other => Err(Error::Protocol(format!("unknown replication role: {:?}", other))),
        }
    }

    async fn create_series(&self, key: &str, metadata: &SeriesMetadata) -> Result<()> {
        let mut args = vec![
            "TS.CREATE".to_string(),
            key.to_string(),
            "RETENTION".to_string(),
            metadata.retention_ms.to_string(),
        ];
        if !metadata.labels.is_empty() {
            args.push("LABELS".to_string());
            for (name, value) in &metadata.labels {
                args.push(name.clone());
                args.push(value.clone());
            }
        }
        self.series_call(key, &args).await.map(|_| ())
    }

    async fn append(&self, key: &str, point: DataPoint) -> Result<()> {
        let args = [
            "TS.ADD".to_string(),
            key.to_string(),
            point.timestamp_ms.to_string(),
            point.value.to_string(),
        ];
        self.series_call(key, &args).await.map(|_| ())
    }

    async fn range(&self, key: &str, start_ms: i64, end_ms: i64) -> Result<Vec<DataPoint>> {
        let args = [
            "TS.RANGE".to_string(),
            key.to_string(),
            start_ms.to_string(),
            end_ms.to_string(),
        ];
        let reply = self.series_call(key, &args).await?;
        reply
            .into_array()?
            .into_iter()
            .map(|sample| {
                let pair = sample.into_array()?;
                match pair.as_slice() {
                    [ts, value] => match (ts.as_i64(), value.as_f64()) {
                        (Some(ts), Some(value)) => Ok(DataPoint::new(ts, value)),
                        _ => Err(Error::Protocol(format!("malformed sample in {}", key))),
                    },
                    _ => Err(Error::Protocol(format!("malformed sample in {}", key))),
                }
            })
            .collect()
    }

    async fn info(&self, key: &str) -> Result<SeriesInfo> {
        let reply = self.series_call(key, &["TS.INFO", key]).await?;
        parse_ts_info(reply)
    }

    async fn server_stats(&self) -> Result<ServerStats> {
        let reply = self.conn.call(&["INFO", "memory"]).await?;
        let text = reply
            .as_text()
            .ok_or_else(|| Error::Protocol("INFO memory returned no text".to_string()))?;
        let section = parse_info_section(&text);
        Ok(ServerStats {
            used_memory_bytes: section
                .get("used_memory")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            used_memory_human: section
                .get("used_memory_human")
                .cloned()
                .unwrap_or_else(|| "N/A".to_string()),
        })
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut cursor = "0".to_string();
        let mut keys = Vec::new();
        loop {
            let reply = self
                .conn
                .call(&["SCAN", cursor.as_str(), "MATCH", pattern, "COUNT", SCAN_BATCH])
                .await?;
            let mut parts = reply.into_array()?.into_iter();
            let (Some(next), Some(batch)) = (parts.next(), parts.next()) else {
                return Err(Error::Protocol("malformed SCAN reply".to_string()));
            };
            cursor = next
                .as_text()
                .ok_or_else(|| Error::Protocol("SCAN cursor is not text".to_string()))?;
            keys.extend(batch.into_array()?.iter().filter_map(RespValue::as_text));
            if cursor == "0" {
                break;
            }
        }
        // SCAN may return a key more than once
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut args = Vec::with_capacity(keys.len() + 1);
        args.push("DEL".to_string());
        args.extend(keys.iter().cloned());
        let reply = self.conn.call(&args).await?;
        reply
            .as_i64()
            .map(|n| n as u64)
            .ok_or_else(|| Error::Protocol("DEL returned a non-integer".to_string()))
    }
}

/// Parse a `TS.INFO` reply (alternating field names and values) into
/// [`SeriesInfo`]. This is the only place that interprets that layout.
pub fn parse_ts_info(reply: RespValue) -> Result<SeriesInfo> {
    let items = reply.into_array()?;
    if items.len() % 2 != 0 {
        return Err(Error::Protocol(format!(
            "TS.INFO returned {} items, expected name/value pairs",
            items.len()
        )));
    }

    let mut info = SeriesInfo::default();
    let mut fields = items.into_iter();
    while let (Some(name), Some(value)) = (fields.next(), fields.next()) {
        let Some(name) = name.as_text() else {
            continue;
        };
        match name.as_str() {
            "totalSamples" => info.total_samples = value.as_i64().unwrap_or(0).max(0) as u64,
            "firstTimestamp" => info.first_timestamp = value.as_i64().unwrap_or(0),
            "lastTimestamp" => info.last_timestamp = value.as_i64().unwrap_or(0),
            "retentionTime" => info.retention_ms = value.as_i64().unwrap_or(0).max(0) as u64,
            "labels" => {
                for label in value.into_array()? {
                    let pair = label.into_array()?;
                    if let [k, v] = pair.as_slice() {
                        if let (Some(k), Some(v)) = (k.as_text(), v.as_text()) {
                            info.labels.insert(k, v);
                        }
                    }
                }
            }
            _ => {}
        }
    }
    Ok(info)
}

/// Parse a `field:value` section of an `INFO` reply
pub fn parse_info_section(text: &str) -> HashMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Connects to Redis TimeSeries shards
#[derive(Debug, Clone)]
pub struct RespConnector {
    password: Option<String>,
    connect_timeout: Duration,
    op_timeout: Duration,
}

impl RespConnector {
    pub fn new(password: Option<String>, connect_timeout: Duration, op_timeout: Duration) -> Self {
        Self {
            password,
            connect_timeout,
            op_timeout,
        }
    }
}

#[async_trait]
impl ShardConnector for RespConnector {
    async fn connect(
        &self,
        location: &ShardLocation,
        addr: &ShardAddr,
    ) -> Result<Arc<dyn ShardStore>> {
        let store = RespShardStore::connect(
            addr,
            self.connect_timeout,
            self.op_timeout,
            self.password.as_deref(),
        )
        .await
        .map_err(|e| Error::ShardUnreachable {
            location: location.to_string(),
            reason: format!("{} ({})", e, addr),
        })?;
        Ok(Arc::new(store))
    }
}
