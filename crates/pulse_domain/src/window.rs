#![forbid(unsafe_code)]

use core::fmt;
use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::ValidatedEvent;

/// Window sizes maintained by default: 1 s, 5 s and 60 s.
pub const DEFAULT_WINDOWS_MS: [u64; 3] = [1_000, 5_000, 60_000];

/// Identity of one window bucket: `(window size, window start)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowKey {
	pub window_ms: u64,
	pub window_start_ms: i64,
}

impl WindowKey {
	/// Key of the bucket of size `window_ms` containing `now_ms`.
	///
	/// `window_start = floor(now / window) * window`, floored toward negative
	/// infinity so pre-epoch instants bucket consistently.
	pub fn containing(window_ms: u64, now_ms: i64) -> Self {
		let w = window_ms.max(1) as i64;
		Self {
			window_ms: w as u64,
			window_start_ms: now_ms.div_euclid(w) * w,
		}
	}

	/// Exclusive end of the bucket.
	pub fn window_end_ms(&self) -> i64 {
		self.window_start_ms.saturating_add(self.window_ms as i64)
	}
}

impl fmt::Display for WindowKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}-{}", self.window_ms, self.window_start_ms)
	}
}

/// Durable aggregate record. Unique counts are cardinalities only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateRecord {
	pub window: u64,
	pub window_start: DateTime<Utc>,
	pub timestamp: DateTime<Utc>,
	pub total_events: u64,
	pub unique_users: u64,
	pub unique_sessions: u64,
	pub routes: BTreeMap<String, u64>,
	pub actions: BTreeMap<String, u64>,
	pub errors: u64,
	/// Set when the record was seeded from a previous process and the unique
	/// counts only cover events seen since that restart.
	#[serde(default)]
	pub partial: bool,
}

impl AggregateRecord {
	pub fn key(&self) -> WindowKey {
		WindowKey {
			window_ms: self.window,
			window_start_ms: self.window_start.timestamp_millis(),
		}
	}
}

/// Mutable in-memory state for one window key.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowAccumulator {
	key: WindowKey,
	pub total_events: u64,
	pub unique_users: HashSet<String>,
	pub unique_sessions: HashSet<String>,
	pub routes: BTreeMap<String, u64>,
	pub actions: BTreeMap<String, u64>,
	pub errors: u64,
	pub last_updated: DateTime<Utc>,
	pub partial: bool,
}

impl WindowAccumulator {
	/// Zero-valued accumulator.
	pub fn new(key: WindowKey, now: DateTime<Utc>) -> Self {
		Self {
			key,
			total_events: 0,
			unique_users: HashSet::new(),
			unique_sessions: HashSet::new(),
			routes: BTreeMap::new(),
			actions: BTreeMap::new(),
			errors: 0,
			last_updated: now,
			partial: false,
		}
	}

	/// Seed from a durable record.
	///
	/// Scalar counters carry over. Unique user/session sets start empty because
	/// only their cardinality was stored; the accumulator is marked `partial`.
	pub fn seeded(record: &AggregateRecord) -> Self {
		Self {
			key: record.key(),
			total_events: record.total_events,
			unique_users: HashSet::new(),
			unique_sessions: HashSet::new(),
			routes: record.routes.clone(),
			actions: record.actions.clone(),
			errors: record.errors,
			last_updated: record.timestamp,
			partial: true,
		}
	}

	pub fn key(&self) -> WindowKey {
		self.key
	}

	/// Fold one event into the window.
	pub fn apply(&mut self, event: &ValidatedEvent, now: DateTime<Utc>) {
		self.total_events += 1;

		if let Some(user) = &event.user_id {
			self.unique_users.insert(user.clone());
		}
		if let Some(session) = &event.session_id {
			self.unique_sessions.insert(session.clone());
		}

		*self.routes.entry(event.route.clone()).or_insert(0) += 1;
		*self.actions.entry(event.action.clone()).or_insert(0) += 1;

		if event.is_error() {
			self.errors += 1;
		}

		self.last_updated = now;
	}

	/// `total_events == sum(routes) == sum(actions)`.
	pub fn is_conserved(&self) -> bool {
		let routes: u64 = self.routes.values().sum();
		let actions: u64 = self.actions.values().sum();
		routes == self.total_events && actions == self.total_events
	}

	/// Snapshot into the durable shape, stamped with `now`.
	pub fn to_record(&self, now: DateTime<Utc>) -> AggregateRecord {
		AggregateRecord {
			window: self.key.window_ms,
			window_start: DateTime::from_timestamp_millis(self.key.window_start_ms).unwrap_or_default(),
			timestamp: now,
			total_events: self.total_events,
			unique_users: self.unique_users.len() as u64,
			unique_sessions: self.unique_sessions.len() as u64,
			routes: self.routes.clone(),
			actions: self.actions.clone(),
			errors: self.errors,
			partial: self.partial,
		}
	}
}

/// Read model pushed to dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateView {
	pub window: u64,
	pub total_events: u64,
	pub unique_users: u64,
	pub unique_sessions: u64,
	pub routes: BTreeMap<String, u64>,
	pub actions: BTreeMap<String, u64>,
	pub errors: u64,
	pub events_per_second: f64,
	pub timestamp: DateTime<Utc>,
	pub partial: bool,
}

impl AggregateView {
	pub fn from_record(record: &AggregateRecord) -> Self {
		Self {
			window: record.window,
			total_events: record.total_events,
			unique_users: record.unique_users,
			unique_sessions: record.unique_sessions,
			routes: record.routes.clone(),
			actions: record.actions.clone(),
			errors: record.errors,
			events_per_second: events_per_second(record.total_events, record.window),
			timestamp: record.timestamp,
			partial: record.partial,
		}
	}

	/// Projection used before any record exists for `window`.
	pub fn empty(window: u64, now: DateTime<Utc>) -> Self {
		Self {
			window,
			total_events: 0,
			unique_users: 0,
			unique_sessions: 0,
			routes: BTreeMap::new(),
			actions: BTreeMap::new(),
			errors: 0,
			events_per_second: 0.0,
			timestamp: now,
			partial: false,
		}
	}
}

/// Latest view per window size, keyed by window milliseconds.
pub type LatestAggregates = BTreeMap<u64, AggregateView>;

#[inline]
fn events_per_second(total: u64, window_ms: u64) -> f64 {
	if window_ms == 0 {
		return 0.0;
	}
	total as f64 / (window_ms as f64 / 1000.0)
}
