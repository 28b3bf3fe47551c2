#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::server::aggregation::AggregationEngine;
use crate::server::event_store::EventStore;
use crate::util::time::Clock;

#[derive(Debug, Clone, Copy)]
pub struct MaintenanceConfig {
	pub sweep_interval: Duration,
	/// Raw events stored longer ago than this are purged.
	pub event_ttl: Duration,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
	pub evicted: usize,
	pub purged: u64,
}

/// Periodic accumulator eviction and raw event retention.
#[derive(Clone)]
pub struct Maintenance {
	cfg: MaintenanceConfig,
	engine: AggregationEngine,
	events: Arc<dyn EventStore>,
	clock: Arc<dyn Clock>,
}

impl Maintenance {
	pub fn new(cfg: MaintenanceConfig, engine: AggregationEngine, events: Arc<dyn EventStore>, clock: Arc<dyn Clock>) -> Self {
		Self {
			cfg,
			engine,
			events,
			clock,
		}
	}

	pub fn spawn(self) -> JoinHandle<()> {
		tokio::spawn(async move {
			let period = self.cfg.sweep_interval.max(Duration::from_millis(100));
			let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
			ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

			loop {
				ticker.tick().await;
				self.sweep().await;
			}
		})
	}

	pub async fn sweep(&self) -> SweepReport {
		let evicted = self.engine.evict_stale();

		let ttl = chrono::Duration::from_std(self.cfg.event_ttl).unwrap_or(chrono::Duration::MAX);
		let purged = match self.clock.now().checked_sub_signed(ttl) {
			Some(cutoff) => match self.events.purge_stored_before(cutoff).await {
				Ok(n) => n,
				Err(e) => {
					warn!(error = %e, "event retention purge failed");
					0
				}
			},
			None => 0,
		};

		if purged > 0 {
			metrics::counter!("pulse_server_events_purged_total").increment(purged);
		}
		debug!(evicted, purged, "maintenance sweep");
		SweepReport { evicted, purged }
	}
}

#[cfg(test)]
mod tests {
	use pulse_domain::{RawEvent, RawTimestamp};

	use super::*;
	use crate::server::aggregate_store::InMemoryAggregateStore;
	use crate::server::aggregation::AggregationConfig;
	use crate::server::event_store::InMemoryEventStore;
	use crate::util::time::ManualClock;

	fn raw(ts: i64) -> RawEvent {
		RawEvent {
			timestamp: Some(RawTimestamp::Millis(ts)),
			route: Some("/r".to_string()),
			action: Some("view".to_string()),
			..Default::default()
		}
	}

	#[tokio::test]
	async fn sweep_purges_expired_events_and_evicts_old_windows() {
		let clock = Arc::new(ManualClock::new(1_700_000_000_000));
		let events = Arc::new(InMemoryEventStore::default());
		let engine = AggregationEngine::new(
			AggregationConfig {
				windows_ms: vec![1_000],
				persist_debounce: Duration::from_millis(10),
				retention: Duration::from_secs(60),
			},
			Arc::new(InMemoryAggregateStore::default()),
			clock.clone(),
		);

		let validated = raw(1_700_000_000_000).validate(clock.now()).expect("valid");
		events.store(validated.clone(), clock.now()).await.expect("store");
		engine.process(&validated).await;
		engine.flush_all().await;

		let maintenance = Maintenance::new(
			MaintenanceConfig {
				sweep_interval: Duration::from_secs(30),
				event_ttl: Duration::from_secs(3_600),
			},
			engine.clone(),
			events.clone(),
			clock.clone(),
		);

		assert_eq!(maintenance.sweep().await, SweepReport::default());

		clock.advance(Duration::from_secs(3_601));
		let report = maintenance.sweep().await;
		assert_eq!(report, SweepReport { evicted: 1, purged: 1 });
		assert_eq!(events.len().await, 0);
		assert_eq!(engine.live_accumulators(), 0);
	}
}
