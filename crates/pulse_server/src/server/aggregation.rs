#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use pulse_domain::{AggregateView, DEFAULT_WINDOWS_MS, LatestAggregates, ValidatedEvent, WindowAccumulator, WindowKey};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::server::aggregate_store::AggregateStore;
use crate::server::recovery::RecoveryLoader;
use crate::util::time::Clock;

/// Default quiet period before an accumulator is written out.
pub const DEFAULT_PERSIST_DEBOUNCE: Duration = Duration::from_millis(800);

/// Default age past a window's end after which it may be evicted.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct AggregationConfig {
	/// Window sizes updated by every event.
	pub windows_ms: Vec<u64>,

	pub persist_debounce: Duration,

	pub retention: Duration,
}

impl Default for AggregationConfig {
	fn default() -> Self {
		Self {
			windows_ms: DEFAULT_WINDOWS_MS.to_vec(),
			persist_debounce: DEFAULT_PERSIST_DEBOUNCE,
			retention: DEFAULT_RETENTION,
		}
	}
}

/// Outcome of `AggregationEngine::flush_all`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
	pub persisted: usize,
	pub failed: usize,
}

/// In-memory multi-window aggregation with debounced persistence.
///
/// Each window key owns a slot behind its own async mutex; the index map is only
/// held long enough to look up or insert a slot handle, so keys never contend
/// with each other. The first caller to lock a fresh slot performs recovery.
///
/// Store writes run outside the slot lock, so a slow or failing write never holds
/// up new events for the same key. Writes for one key are serialized by a
/// separate lock and snapshot the accumulator only once they hold it.
#[derive(Clone)]
pub struct AggregationEngine {
	inner: Arc<EngineInner>,
}

struct EngineInner {
	cfg: AggregationConfig,
	clock: Arc<dyn Clock>,
	store: Arc<dyn AggregateStore>,
	recovery: RecoveryLoader,
	slots: parking_lot::Mutex<HashMap<WindowKey, SlotHandle>>,
	/// Set by `flush_all`; later mutations are written through instead of debounced.
	closing: AtomicBool,
}

type SlotHandle = Arc<SlotCell>;

#[derive(Default)]
struct SlotCell {
	state: tokio::sync::Mutex<Slot>,
	/// Held for the duration of a store write for this key.
	write: tokio::sync::Mutex<()>,
}

#[derive(Default)]
struct Slot {
	/// `None` until the first locker has run recovery.
	acc: Option<WindowAccumulator>,

	/// Pending debounced write.
	timer: Option<JoinHandle<()>>,

	/// Bumped on every mutation; a timer only writes if it still matches.
	generation: u64,

	/// Mutations not yet written to the store.
	dirty: bool,
}

impl AggregationEngine {
	pub fn new(cfg: AggregationConfig, store: Arc<dyn AggregateStore>, clock: Arc<dyn Clock>) -> Self {
		let recovery = RecoveryLoader::new(Arc::clone(&store));
		Self {
			inner: Arc::new(EngineInner {
				cfg,
				clock,
				store,
				recovery,
				slots: parking_lot::Mutex::new(HashMap::new()),
				closing: AtomicBool::new(false),
			}),
		}
	}

	pub fn windows_ms(&self) -> &[u64] {
		&self.inner.cfg.windows_ms
	}

	/// Fold one accepted event into every configured window.
	///
	/// Buckets are chosen by the server clock at processing time, not by the
	/// client-supplied event timestamp.
	pub async fn process(&self, event: &ValidatedEvent) {
		let now_ms = self.inner.clock.now_ms();

		for &window_ms in &self.inner.cfg.windows_ms {
			let key = WindowKey::containing(window_ms, now_ms);
			self.apply(key, event).await;
		}
	}

	async fn apply(&self, key: WindowKey, event: &ValidatedEvent) {
		let slot = self.inner.slot(key);

		let write_through = {
			let mut guard = slot.state.lock().await;

			let acc = match guard.acc.take() {
				Some(acc) => acc,
				None => self.inner.recover(key).await,
			};
			let acc = guard.acc.insert(acc);
			acc.apply(event, self.inner.clock.now());

			guard.generation = guard.generation.wrapping_add(1);
			guard.dirty = true;

			if self.inner.closing.load(Ordering::Acquire) {
				if let Some(prev) = guard.timer.take() {
					prev.abort();
				}
				true
			} else {
				self.schedule_persist(key, &slot, &mut guard);
				false
			}
		};

		// after a flush nothing is left to a timer that may never fire
		if write_through {
			self.inner.persist(key, &slot).await;
		}
	}

	/// Cancel any pending write for `key` and start a fresh quiet-period timer.
	fn schedule_persist(&self, key: WindowKey, slot: &SlotHandle, guard: &mut Slot) {
		if let Some(prev) = guard.timer.take() {
			prev.abort();
		}

		let generation = guard.generation;
		let inner = Arc::clone(&self.inner);
		let slot = Arc::clone(slot);
		let debounce = self.inner.cfg.persist_debounce;

		guard.timer = Some(tokio::spawn(async move {
			tokio::time::sleep(debounce).await;

			{
				let mut guard = slot.state.lock().await;
				if guard.generation != generation {
					return;
				}
				// past this point the write must not be aborted by a newer mutation
				drop(guard.timer.take());
			}

			inner.persist(key, &slot).await;
		}));
	}

	/// Latest durable record per configured window, projected into the read model.
	pub async fn get_latest_aggregates(&self) -> LatestAggregates {
		let mut out = LatestAggregates::new();
		for &window_ms in &self.inner.cfg.windows_ms {
			out.insert(window_ms, self.window_view(window_ms).await);
		}
		out
	}

	/// Latest durable record for one window, or a zero projection.
	pub async fn window_view(&self, window_ms: u64) -> AggregateView {
		match self.inner.store.latest(window_ms).await {
			Ok(Some(record)) => AggregateView::from_record(&record),
			Ok(None) => AggregateView::empty(window_ms, self.inner.clock.now()),
			Err(e) => {
				warn!(window_ms, error = %e, "reading latest aggregate failed");
				AggregateView::empty(window_ms, self.inner.clock.now())
			}
		}
	}

	/// Cancel every pending timer and write every in-memory accumulator.
	///
	/// Mutations arriving after this call are persisted before `process` returns.
	pub async fn flush_all(&self) -> FlushReport {
		self.inner.closing.store(true, Ordering::Release);

		let slots = self.inner.snapshot_slots();
		let mut report = FlushReport::default();

		for (key, slot) in slots {
			{
				let mut guard = slot.state.lock().await;
				if let Some(timer) = guard.timer.take() {
					timer.abort();
				}
				// a timer that already woke up and waits for this lock becomes stale
				guard.generation = guard.generation.wrapping_add(1);

				if guard.acc.is_none() {
					continue;
				}
			}
			if self.inner.persist(key, &slot).await {
				report.persisted += 1;
			} else {
				report.failed += 1;
			}
		}

		info!(persisted = report.persisted, failed = report.failed, "aggregation flush complete");
		report
	}

	/// Drop accumulators whose window ended more than `retention` ago.
	///
	/// Slots with unpersisted mutations, a pending timer, or a concurrent holder
	/// are kept for a later sweep.
	pub fn evict_stale(&self) -> usize {
		let retention_ms = i64::try_from(self.inner.cfg.retention.as_millis()).unwrap_or(i64::MAX);
		let horizon = self.inner.clock.now_ms().saturating_sub(retention_ms);

		let mut index = self.inner.slots.lock();
		let before = index.len();

		index.retain(|key, slot| {
			if key.window_end_ms() >= horizon {
				return true;
			}
			if slot.write.try_lock().is_err() {
				return true;
			}
			match slot.state.try_lock() {
				Ok(guard) => guard.dirty || guard.timer.is_some(),
				Err(_) => true,
			}
		});

		let evicted = before - index.len();
		metrics::gauge!("pulse_server_live_accumulators").set(index.len() as f64);
		if evicted > 0 {
			metrics::counter!("pulse_server_evicted_accumulators_total").increment(evicted as u64);
			debug!(evicted, live = index.len(), "evicted stale accumulators");
		}
		evicted
	}

	pub fn live_accumulators(&self) -> usize {
		self.inner.slots.lock().len()
	}

	/// Copy of the in-memory accumulator for `key`, if one exists.
	pub async fn accumulator(&self, key: WindowKey) -> Option<WindowAccumulator> {
		let slot = self.inner.slots.lock().get(&key).cloned()?;
		let guard = slot.state.lock().await;
		guard.acc.clone()
	}
}

impl EngineInner {
	fn slot(&self, key: WindowKey) -> SlotHandle {
		let mut index = self.slots.lock();
		let slot = index.entry(key).or_default();
		let slot = Arc::clone(slot);
		metrics::gauge!("pulse_server_live_accumulators").set(index.len() as f64);
		slot
	}

	fn snapshot_slots(&self) -> Vec<(WindowKey, SlotHandle)> {
		self.slots.lock().iter().map(|(k, s)| (*k, Arc::clone(s))).collect()
	}

	/// Seed from the durable store or start from zero.
	async fn recover(&self, key: WindowKey) -> WindowAccumulator {
		match self.recovery.load(key).await {
			Ok(Some(record)) => {
				debug!(window_ms = key.window_ms, window_start = key.window_start_ms, total = record.total_events, "seeded accumulator from store");
				WindowAccumulator::seeded(&record)
			}
			Ok(None) => WindowAccumulator::new(key, self.clock.now()),
			Err(e) => {
				metrics::counter!("pulse_server_recovery_failures_total").increment(1);
				warn!(window_ms = key.window_ms, window_start = key.window_start_ms, error = %e, "recovery failed; starting window from zero");
				// earlier counts for this key may exist but could not be read
				let mut acc = WindowAccumulator::new(key, self.clock.now());
				acc.partial = true;
				acc
			}
		}
	}

	/// Write the slot's current accumulator without holding the slot lock.
	///
	/// The snapshot is taken after acquiring the per-key write lock, so writes
	/// land in mutation order. Failures are logged; the next timer supersedes them.
	async fn persist(&self, key: WindowKey, slot: &SlotCell) -> bool {
		let _write = slot.write.lock().await;

		let (record, generation) = {
			let guard = slot.state.lock().await;
			let Some(acc) = guard.acc.as_ref() else {
				return true;
			};
			if !guard.dirty {
				return true;
			}
			(acc.to_record(self.clock.now()), guard.generation)
		};

		match self.store.upsert(&record).await {
			Ok(()) => {
				let mut guard = slot.state.lock().await;
				if guard.generation == generation {
					guard.dirty = false;
				}
				metrics::counter!("pulse_server_aggregate_persists_total").increment(1);
				debug!(window_ms = key.window_ms, window_start = key.window_start_ms, total = record.total_events, "aggregate persisted");
				true
			}
			Err(e) => {
				metrics::counter!("pulse_server_aggregate_persist_failures_total").increment(1);
				warn!(window_ms = key.window_ms, window_start = key.window_start_ms, error = %e, "aggregate persist failed");
				false
			}
		}
	}
}

impl std::fmt::Debug for AggregationEngine {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("AggregationEngine")
			.field("cfg", &self.inner.cfg)
			.field("live", &self.live_accumulators())
			.finish()
	}
}
