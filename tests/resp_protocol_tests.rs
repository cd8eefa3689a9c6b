//! RESP client and sentinel discovery against a scripted TCP server

use bytes::BytesMut;
use parking_lot::Mutex;
use roomshard::discovery::{PrimaryDiscovery, SentinelDiscovery};
use roomshard::sharding::{ShardAddr, ShardLocation};
use roomshard::store::{
    decode_value, DataPoint, ReplicationRole, RespConnector, RespShardStore, RespValue,
    SeriesMetadata, ShardConnector, ShardStore,
};
use roomshard::Error;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

type Series = Arc<Mutex<HashMap<String, BTreeMap<i64, String>>>>;

fn bulk(s: &str) -> Vec<u8> {
    format!("${}\r\n{}\r\n", s.len(), s).into_bytes()
}

fn array(items: Vec<Vec<u8>>) -> Vec<u8> {
    let mut out = format!("*{}\r\n", items.len()).into_bytes();
    for item in items {
        out.extend(item);
    }
    out
}

fn int(n: i64) -> Vec<u8> {
    format!(":{}\r\n", n).into_bytes()
}

/// Minimal Redis TimeSeries: enough of the command set for one shard
fn respond(series: &Series, args: &[String]) -> Option<Vec<u8>> {
    let command = args[0].to_ascii_uppercase();
    let reply = match command.as_str() {
        "PING" => b"+PONG\r\n".to_vec(),
        "AUTH" if args[1] == "secret" => b"+OK\r\n".to_vec(),
        "AUTH" => b"-WRONGPASS invalid username-password pair\r\n".to_vec(),
        "INFO" if args[1] == "replication" => bulk("# Replication\r\nrole:master\r\nconnected_slaves:1\r\n"),
        "INFO" => bulk("# Memory\r\nused_memory:1048576\r\nused_memory_human:1.00M\r\n"),
        "TS.CREATE" => {
            let mut series = series.lock();
            if series.contains_key(&args[1]) {
                b"-ERR TSDB: key already exists\r\n".to_vec()
            } else {
                series.insert(args[1].clone(), BTreeMap::new());
                b"+OK\r\n".to_vec()
            }
        }
        "TS.ADD" => {
            let ts: i64 = args[2].parse().ok()?;
            series
                .lock()
                .entry(args[1].clone())
                .or_default()
                .insert(ts, args[3].clone());
            int(ts)
        }
        "TS.RANGE" if args[1] == "sensor:temperature:slow:1" => return None,
        "TS.RANGE" => {
            let series = series.lock();
            let Some(points) = series.get(&args[1]) else {
                return Some(b"-ERR TSDB: the key does not exist\r\n".to_vec());
            };
            let start: i64 = args[2].parse().ok()?;
            let end: i64 = args[3].parse().ok()?;
            array(
                points
                    .range(start..=end)
                    .map(|(ts, v)| array(vec![int(*ts), bulk(v)]))
                    .collect(),
            )
        }
        "TS.INFO" => {
            let series = series.lock();
            let Some(points) = series.get(&args[1]) else {
                return Some(b"-ERR TSDB: the key does not exist\r\n".to_vec());
            };
            array(vec![
                bulk("totalSamples"),
                int(points.len() as i64),
                bulk("firstTimestamp"),
                int(points.keys().next().copied().unwrap_or(0)),
                bulk("lastTimestamp"),
                int(points.keys().next_back().copied().unwrap_or(0)),
                bulk("retentionTime"),
                int(2_592_000_000),
                bulk("labels"),
                array(vec![array(vec![bulk("location"), bulk("salon")])]),
            ])
        }
        "SCAN" => {
            // Two pages so the client has to follow the cursor
            let keys: Vec<String> = series.lock().keys().cloned().collect();
            let (cursor, page) = if args[1] == "0" {
                ("7", keys.iter().take(1).cloned().collect::<Vec<_>>())
            } else {
                ("0", keys.iter().skip(1).cloned().collect::<Vec<_>>())
            };
            array(vec![bulk(cursor), array(page.iter().map(|k| bulk(k)).collect())])
        }
        "DEL" => {
            let mut series = series.lock();
            int(args[1..].iter().filter(|k| series.remove(*k).is_some()).count() as i64)
        }
        "SENTINEL" if args[2] == "salon-master" => array(vec![bulk("10.0.0.7"), bulk("6380")]),
        "SENTINEL" => b"*-1\r\n".to_vec(),
        _ => b"-ERR unknown command\r\n".to_vec(),
    };
    Some(reply)
}

async fn serve_client(mut stream: TcpStream, series: Series) {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        while let Ok(Some((value, consumed))) = decode_value(&buf) {
            let _ = buf.split_to(consumed);
            let RespValue::Array(Some(items)) = value else {
                return;
            };
            let args: Vec<String> = items.iter().filter_map(RespValue::as_text).collect();
            if args.get(1).map(String::as_str) == Some("sensor:temperature:lagging:1") {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            match respond(&series, &args) {
                Some(reply) => {
                    if stream.write_all(&reply).await.is_err() {
                        return;
                    }
                }
                // Swallow the command and never answer it
                None => {}
            }
        }
        match stream.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

async fn fake_server() -> (ShardAddr, Series) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let series: Series = Arc::default();
    let shared = Arc::clone(&series);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_client(stream, Arc::clone(&shared)));
        }
    });
    (ShardAddr::new("127.0.0.1", port), series)
}

async fn connect(addr: &ShardAddr) -> RespShardStore {
    RespShardStore::connect(
        addr,
        Duration::from_secs(1),
        Duration::from_millis(300),
        Some("secret"),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_series_lifecycle() {
    let (addr, _series) = fake_server().await;
    let store = connect(&addr).await;

    store.ping().await.unwrap();
    assert_eq!(store.role().await.unwrap(), ReplicationRole::Primary);

    let key = "sensor:temperature:salon:1";
    let metadata = SeriesMetadata {
        retention_ms: 2_592_000_000,
        labels: vec![("location".to_string(), "salon".to_string())],
    };
    store.create_series(key, &metadata).await.unwrap();
    let err = store.create_series(key, &metadata).await.unwrap_err();
    assert!(matches!(err, Error::SeriesExists(_)));

    store
        .append(key, DataPoint::new(1_700_000_000_000, 21.5))
        .await
        .unwrap();
    store
        .append(key, DataPoint::new(1_700_000_030_000, 22.0))
        .await
        .unwrap();

    let points = store
        .range(key, 1_700_000_000_000, 1_700_000_000_000)
        .await
        .unwrap();
    assert_eq!(points, vec![DataPoint::new(1_700_000_000_000, 21.5)]);

    let info = store.info(key).await.unwrap();
    assert_eq!(info.total_samples, 2);
    assert_eq!(info.last_timestamp, 1_700_000_030_000);
    assert_eq!(info.labels["location"], "salon");

    let stats = store.server_stats().await.unwrap();
    assert_eq!(stats.used_memory_bytes, 1_048_576);
    assert_eq!(stats.used_memory_human, "1.00M");
}

#[tokio::test]
async fn test_missing_series_maps_to_not_found() {
    let (addr, _series) = fake_server().await;
    let store = connect(&addr).await;

    let err = store.range("sensor:humidity:salon:9", 0, 10).await.unwrap_err();
    assert!(matches!(err, Error::SeriesNotFound(_)));
    let err = store.info("sensor:humidity:salon:9").await.unwrap_err();
    assert!(matches!(err, Error::SeriesNotFound(_)));
}

#[tokio::test]
async fn test_scan_follows_cursor_and_delete() {
    let (addr, series) = fake_server().await;
    {
        let mut series = series.lock();
        for id in 1..=3 {
            series.insert(format!("sensor:humidity:salon:{}", id), BTreeMap::new());
        }
    }
    let store = connect(&addr).await;

    let keys = store.scan_keys("sensor:*").await.unwrap();
    assert_eq!(keys.len(), 3);
    assert!(keys.windows(2).all(|w| w[0] < w[1]));

    assert_eq!(store.delete(&keys).await.unwrap(), 3);
    assert!(store.scan_keys("sensor:*").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_timeout_poisons_connection() {
    let (addr, _series) = fake_server().await;
    let store = connect(&addr).await;

    let err = store.range("sensor:temperature:slow:1", 0, 10).await.unwrap_err();
    assert!(matches!(err, Error::QueryTimeout));
    assert!(err.is_connection_error());

    // A late reply could be mistaken for the next command's; the connection
    // refuses further use instead
    let err = store.ping().await.unwrap_err();
    assert!(matches!(err, Error::Io(_)));
    assert!(err.is_connection_error());
}

#[tokio::test]
async fn test_queued_caller_does_not_time_out() {
    let (addr, series) = fake_server().await;
    series
        .lock()
        .insert("sensor:temperature:lagging:1".to_string(), BTreeMap::new());
    let store = connect(&addr).await;

    // Each reply takes 200ms against a 300ms timeout; the second call waits
    // for the first before it is sent
    let (first, second) = tokio::join!(
        store.range("sensor:temperature:lagging:1", 0, 10),
        store.range("sensor:temperature:lagging:1", 0, 10),
    );
    assert!(first.unwrap().is_empty());
    assert!(second.unwrap().is_empty());

    store.ping().await.unwrap();
}

#[tokio::test]
async fn test_connector_rejects_bad_password() {
    let (addr, _series) = fake_server().await;
    let connector = RespConnector::new(
        Some("wrong".to_string()),
        Duration::from_secs(1),
        Duration::from_secs(1),
    );

    let err = connector
        .connect(&ShardLocation::new("salon"), &addr)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ShardUnreachable { .. }));
    assert!(err.to_string().contains("WRONGPASS"));
}

#[tokio::test]
async fn test_connector_reports_refused_connection() {
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let connector = RespConnector::new(None, Duration::from_secs(1), Duration::from_secs(1));

    let err = connector
        .connect(&ShardLocation::new("cuisine"), &ShardAddr::new("127.0.0.1", closed))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ShardUnreachable { .. }));
}

#[tokio::test]
async fn test_sentinel_discovery_skips_dead_sentinel() {
    let (sentinel, _series) = fake_server().await;
    let dead = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        ShardAddr::new("127.0.0.1", listener.local_addr().unwrap().port())
    };
    let discovery = SentinelDiscovery::new(
        vec![dead, sentinel],
        Duration::from_millis(500),
        Duration::from_millis(500),
    );

    assert_eq!(
        discovery.discover_primary("salon-master").await.unwrap(),
        ShardAddr::new("10.0.0.7", 6380)
    );

    let err = discovery.discover_primary("garage-master").await.unwrap_err();
    assert!(matches!(err, Error::Discovery(_)));
}
