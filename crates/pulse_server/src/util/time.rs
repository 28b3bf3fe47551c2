#![forbid(unsafe_code)]

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};

/// Current Unix time in milliseconds.
#[inline]
pub fn unix_ms_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::from_secs(0))
		.as_millis() as i64
}

/// Convert Unix milliseconds to a UTC timestamp, clamping out-of-range values to the epoch.
#[inline]
pub fn from_unix_ms(ms: i64) -> DateTime<Utc> {
	DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Wall clock used for window bucketing and record stamps.
pub trait Clock: Send + Sync + fmt::Debug {
	fn now_ms(&self) -> i64;

	fn now(&self) -> DateTime<Utc> {
		from_unix_ms(self.now_ms())
	}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now_ms(&self) -> i64 {
		unix_ms_now()
	}
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
	ms: AtomicI64,
}

impl ManualClock {
	pub fn new(start_ms: i64) -> Self {
		Self {
			ms: AtomicI64::new(start_ms),
		}
	}

	pub fn set_ms(&self, ms: i64) {
		self.ms.store(ms, Ordering::SeqCst);
	}

	pub fn advance(&self, by: Duration) {
		self.ms.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
	}
}

impl Clock for ManualClock {
	fn now_ms(&self) -> i64 {
		self.ms.load(Ordering::SeqCst)
	}
}
