//! Wall-clock sources for timestamps and archival windows
//!
//! [`SystemClock`] never goes backward, so archival windows and generated
//! timestamps stay ordered across NTP adjustments. [`ManualClock`] is driven by
//! hand in tests.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// Millisecond wall-clock source
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;

    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.now_millis()).unwrap_or_default()
    }
}

/// Wall clock that never returns a smaller value than it returned before
#[derive(Debug, Default)]
pub struct SystemClock {
    /// Largest timestamp handed out so far (ms)
    high_water_ms: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    /// If the wall clock stepped back, the previous high-water mark is
    /// returned instead.
    fn now_millis(&self) -> i64 {
        let wall = Utc::now().timestamp_millis();
        loop {
            let prev = self.high_water_ms.load(Ordering::Acquire);
            let ts = wall.max(prev);
            if ts == prev {
                return ts;
            }
            match self.high_water_ms.compare_exchange_weak(
                prev,
                ts,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return ts,
                Err(_) => continue,
            }
        }
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::Release);
    }

    pub fn advance(&self, by: std::time::Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as i64, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now_ms.load(Ordering::Acquire)
    }
}
