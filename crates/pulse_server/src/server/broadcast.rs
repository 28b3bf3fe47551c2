#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use pulse_protocol::AggregateUpdate;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::server::aggregation::AggregationEngine;
use crate::server::room_hub::{PublishStats, RoomHub, RoomHubItem};
use crate::util::time::Clock;

/// One repeating timer per window size, each publishing that window's latest
/// view to every room.
#[derive(Clone)]
pub struct BroadcastScheduler {
	engine: AggregationEngine,
	hub: RoomHub,
	clock: Arc<dyn Clock>,
}

/// Running broadcast timers. Dropping the handle leaves them running.
#[derive(Debug)]
pub struct BroadcastHandle {
	tasks: Vec<JoinHandle<()>>,
}

impl BroadcastHandle {
	pub fn shutdown(self) {
		for task in self.tasks {
			task.abort();
		}
	}
}

impl BroadcastScheduler {
	pub fn new(engine: AggregationEngine, hub: RoomHub, clock: Arc<dyn Clock>) -> Self {
		Self { engine, hub, clock }
	}

	/// Start a timer per configured window; the `w` ms window fires every `w` ms.
	pub fn spawn(&self) -> BroadcastHandle {
		let tasks = self
			.engine
			.windows_ms()
			.iter()
			.copied()
			.map(|window_ms| {
				let this = self.clone();
				tokio::spawn(async move { this.run(window_ms).await })
			})
			.collect::<Vec<_>>();

		info!(windows = ?self.engine.windows_ms(), "broadcast scheduler started");
		BroadcastHandle { tasks }
	}

	async fn run(&self, window_ms: u64) {
		let period = Duration::from_millis(window_ms.max(1));
		let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

		loop {
			ticker.tick().await;
			self.tick(window_ms).await;
		}
	}

	/// Publish the current view of one window.
	pub async fn tick(&self, window_ms: u64) -> PublishStats {
		let aggregates = self.engine.window_view(window_ms).await;
		let update = AggregateUpdate {
			window: window_ms,
			aggregates,
			timestamp: self.clock.now(),
		};

		let stats = self.hub.publish_all(RoomHubItem::Update(Arc::new(update))).await;

		metrics::counter!("pulse_server_broadcast_ticks_total").increment(1);
		debug!(window_ms, delivered = stats.delivered, dropped = stats.dropped, "aggregate broadcast");
		stats
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::server::aggregate_store::InMemoryAggregateStore;
	use crate::server::aggregation::AggregationConfig;
	use crate::server::room_hub::RoomHubConfig;
	use crate::util::time::ManualClock;

	fn scheduler() -> (BroadcastScheduler, RoomHub) {
		let clock = Arc::new(ManualClock::new(1_700_000_000_000));
		let engine = AggregationEngine::new(
			AggregationConfig {
				windows_ms: vec![1_000, 5_000],
				..Default::default()
			},
			Arc::new(InMemoryAggregateStore::default()),
			clock.clone(),
		);
		let hub = RoomHub::new(RoomHubConfig::default());
		(BroadcastScheduler::new(engine, hub.clone(), clock), hub)
	}

	#[tokio::test(start_paused = true)]
	async fn each_window_fires_at_its_own_cadence() {
		let (scheduler, hub) = scheduler();
		let mut rx = hub.subscribe_room("dashboard").await;
		let handle = scheduler.spawn();

		tokio::time::sleep(Duration::from_millis(5_500)).await;
		handle.shutdown();

		let mut by_window = std::collections::BTreeMap::<u64, usize>::new();
		while let Ok(item) = rx.try_recv() {
			if let RoomHubItem::Update(u) = item {
				assert_eq!(u.aggregates.window, u.window);
				*by_window.entry(u.window).or_default() += 1;
			}
		}

		assert_eq!(by_window.get(&1_000).copied(), Some(5));
		assert_eq!(by_window.get(&5_000).copied(), Some(1));
	}

	#[tokio::test]
	async fn tick_without_subscribers_is_harmless() {
		let (scheduler, _hub) = scheduler();
		let stats = scheduler.tick(1_000).await;
		assert_eq!(stats, PublishStats::default());
	}
}
