//! Periodic archival of shard data into the long-term store
//!
//! Each cycle moves through `Idle -> Draining -> Flushing -> Idle`:
//! - Draining: fan-out range query over the whole configured key space
//! - Flushing: one sink call for the flattened batch
//!
//! The next window starts `overlap` before the end of the last successfully
//! flushed window, so a failed flush is simply covered again by the next
//! cycle. Points drained twice are written twice; the sink upserts them.

mod line_protocol;
mod sink;

pub use line_protocol::{encode_batch, LineProtocolSink, SinkConfig};
pub use sink::{ArchivePoint, ArchiveSink, MemorySink};

use crate::clock::Clock;
use crate::sharding::{QueryFailure, SeriesFilter, ShardRouter};
use crate::{Error, Result};
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Archival schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Time between cycles
    pub period_secs: u64,
    /// How far each window reaches back before the last flushed window end
    pub overlap_secs: u64,
    /// Window length of the first cycle after startup
    pub startup_backfill_secs: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            period_secs: 300,              // 5 minutes
            overlap_secs: 8_640,           // 0.1 day
            startup_backfill_secs: 86_400, // 1 day
        }
    }
}

impl ArchiveConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

/// Where a cycle currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveState {
    Idle,
    Draining,
    Flushing,
}

/// Inclusive time window in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveWindow {
    pub start_ms: i64,
    pub end_ms: i64,
}

/// Flattened result of a drain
#[derive(Debug, Clone)]
pub struct DrainedBatch {
    pub window: ArchiveWindow,
    pub points: Vec<ArchivePoint>,
    /// Series whose range query failed, with the reason
    pub failures: Vec<(String, QueryFailure)>,
}

/// Outcome of one archival cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub window: ArchiveWindow,
    pub points: usize,
    pub failed_series: usize,
    pub flushed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Drains shards into an [`ArchiveSink`] on a fixed period
pub struct ArchivalPipeline {
    router: ShardRouter,
    sink: Arc<dyn ArchiveSink>,
    clock: Arc<dyn Clock>,
    config: ArchiveConfig,
    state: RwLock<ArchiveState>,
    /// End of the last successfully flushed window
    watermark_ms: Mutex<Option<i64>>,
    /// Set once [`ArchiveSink::check`] passes; cleared by a failed write
    sink_ready: AtomicBool,
    cycle: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

impl ArchivalPipeline {
    pub fn new(
        router: ShardRouter,
        sink: Arc<dyn ArchiveSink>,
        clock: Arc<dyn Clock>,
        config: ArchiveConfig,
    ) -> Self {
        Self {
            router,
            sink,
            clock,
            config,
            state: RwLock::new(ArchiveState::Idle),
            watermark_ms: Mutex::new(None),
            sink_ready: AtomicBool::new(false),
            cycle: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> ArchiveState {
        *self.state.read()
    }

    pub fn watermark(&self) -> Option<i64> {
        *self.watermark_ms.lock()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn set_state(&self, state: ArchiveState) {
        *self.state.write() = state;
    }

    /// Window the next cycle will drain
    pub fn next_window(&self) -> ArchiveWindow {
        let now = self.clock.now_millis();
        let start = match self.watermark() {
            Some(watermark) => watermark - (self.config.overlap_secs as i64) * 1_000,
            None => now - (self.config.startup_backfill_secs as i64) * 1_000,
        };
        ArchiveWindow {
            start_ms: start.min(now),
            end_ms: now,
        }
    }

    /// Range-query every configured series over `window` and flatten the
    /// successes into one batch. Per-series failures are collected, not raised.
    pub async fn drain(&self, window: ArchiveWindow) -> Result<DrainedBatch> {
        self.set_state(ArchiveState::Draining);
        let result = self
            .router
            .fan_out_query(&SeriesFilter::all(), window.start_ms, window.end_ms)
            .await?;

        let mut points = Vec::with_capacity(result.total_points());
        let mut failures = Vec::new();
        for (key, outcome) in result.iter() {
            match outcome {
                Ok(samples) => {
                    points.extend(samples.iter().map(|p| ArchivePoint::from_sample(key, p)));
                }
                Err(failure) => {
                    warn!(series = %key, failure = %failure, "Series skipped in drain");
                    failures.push((key.series_name(), failure.clone()));
                }
            }
        }

        Ok(DrainedBatch {
            window,
            points,
            failures,
        })
    }

    /// Hand the batch to the sink in a single call. Nothing is written until
    /// the sink passes its readiness check.
    pub async fn flush(&self, batch: &DrainedBatch) -> Result<()> {
        self.set_state(ArchiveState::Flushing);
        if batch.points.is_empty() {
            return Ok(());
        }

        if !self.sink_ready.load(Ordering::Acquire) {
            if let Err(e) = self.sink.check().await {
                counter!("roomshard_archive_flush_failures_total").increment(1);
                return Err(sink_failure(e));
            }
            info!("Archive sink ready");
            self.sink_ready.store(true, Ordering::Release);
        }

        match self.sink.write(&batch.points).await {
            Ok(()) => {
                counter!("roomshard_archive_points_total").increment(batch.points.len() as u64);
                Ok(())
            }
            Err(e) => {
                counter!("roomshard_archive_flush_failures_total").increment(1);
                self.sink_ready.store(false, Ordering::Release);
                Err(sink_failure(e))
            }
        }
    }

    /// Drain and flush the next window. The watermark advances only when the
    /// flush succeeds.
    pub async fn run_cycle(&self) -> CycleReport {
        let _guard = self.cycle.lock().await;
        let window = self.next_window();

        let report = match self.drain(window).await {
            Ok(batch) => {
                let mut report = CycleReport {
                    window,
                    points: batch.points.len(),
                    failed_series: batch.failures.len(),
                    flushed: false,
                    error: None,
                };
                match self.flush(&batch).await {
                    Ok(()) => {
                        *self.watermark_ms.lock() = Some(window.end_ms);
                        report.flushed = true;
                        info!(
                            start_ms = window.start_ms,
                            end_ms = window.end_ms,
                            points = report.points,
                            failed_series = report.failed_series,
                            "Archival cycle complete"
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "Archive flush failed, window will be retried next cycle");
                        report.error = Some(e.to_string());
                    }
                }
                report
            }
            Err(e) => {
                error!(error = %e, "Archive drain failed");
                CycleReport {
                    window,
                    points: 0,
                    failed_series: 0,
                    flushed: false,
                    error: Some(e.to_string()),
                }
            }
        };

        self.set_state(ArchiveState::Idle);
        report
    }

    /// Run the startup backfill, then one cycle per period until shutdown
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.config.period());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_cycle().await;
                }
                _ = self.shutdown.cancelled() => {
                    info!("Archival pipeline shutting down gracefully");
                    break;
                }
            }
        }
    }
}

fn sink_failure(e: Error) -> Error {
    match e {
        e @ Error::SinkWriteFailed(_) => e,
        other => Error::SinkWriteFailed(other.to_string()),
    }
}
