#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use pulse_domain::{AggregateRecord, EventValidationError, RawEvent, RawTimestamp, WindowKey};
use tokio::time::timeout;

use crate::server::aggregate_store::{AggregateStore, InMemoryAggregateStore};
use crate::server::aggregation::{AggregationConfig, AggregationEngine};
use crate::server::event_store::{EventStore, InMemoryEventStore};
use crate::server::gateway::{IngestError, IngestionGateway};
use crate::server::rate_limit::{RateGate, TokenBucket};
use crate::util::time::ManualClock;

const NOW_MS: i64 = 1_700_000_000_500;

/// Admits a fixed number of events and records how often it was asked.
struct CountingGate {
	remaining: usize,
	asked: usize,
}

impl CountingGate {
	fn new(remaining: usize) -> Self {
		Self { remaining, asked: 0 }
	}
}

impl RateGate for CountingGate {
	fn try_acquire(&mut self) -> bool {
		self.asked += 1;
		if self.remaining == 0 {
			return false;
		}
		self.remaining -= 1;
		true
	}
}

struct Fixture {
	gateway: IngestionGateway,
	engine: AggregationEngine,
	events: Arc<InMemoryEventStore>,
}

/// Point lookups take 20ms, so recovering three windows takes 60ms.
#[derive(Default)]
struct SlowLookupStore {
	inner: InMemoryAggregateStore,
}

#[async_trait::async_trait]
impl AggregateStore for SlowLookupStore {
	async fn upsert(&self, record: &AggregateRecord) -> anyhow::Result<()> {
		self.inner.upsert(record).await
	}

	async fn get(&self, key: WindowKey) -> anyhow::Result<Option<AggregateRecord>> {
		tokio::time::sleep(Duration::from_millis(20)).await;
		self.inner.get(key).await
	}

	async fn latest(&self, window_ms: u64) -> anyhow::Result<Option<AggregateRecord>> {
		self.inner.latest(window_ms).await
	}

	async fn ping(&self) -> anyhow::Result<()> {
		Ok(())
	}
}

fn fixture(max_payload_bytes: usize) -> Fixture {
	fixture_with(max_payload_bytes, Arc::new(InMemoryAggregateStore::default()))
}

fn fixture_with(max_payload_bytes: usize, aggregates: Arc<dyn AggregateStore>) -> Fixture {
	let clock = Arc::new(ManualClock::new(NOW_MS));
	let events = Arc::new(InMemoryEventStore::default());
	let engine = AggregationEngine::new(
		AggregationConfig {
			windows_ms: vec![1_000, 5_000, 60_000],
			persist_debounce: Duration::from_secs(60),
			retention: Duration::from_secs(300),
		},
		aggregates,
		clock.clone(),
	);
	let gateway = IngestionGateway::new(events.clone(), engine.clone(), clock, max_payload_bytes);
	Fixture { gateway, engine, events }
}

fn one_second_key() -> WindowKey {
	WindowKey::containing(1_000, NOW_MS)
}

fn raw(route: &str, action: &str) -> RawEvent {
	RawEvent {
		route: Some(route.to_string()),
		action: Some(action.to_string()),
		..Default::default()
	}
}

#[tokio::test]
async fn duplicate_client_event_id_is_counted_once() {
	let f = fixture(16 * 1024);
	let mut gate = TokenBucket::new(50, 100);

	let body = br#"{"route":"/home","action":"click","clientEventId":"abc"}"#;
	let first = f.gateway.submit_bytes(body, &mut gate).await.expect("accepted");
	let second = f.gateway.submit_bytes(body, &mut gate).await.expect("accepted");

	assert!(!first.duplicate);
	assert!(second.duplicate);
	assert_eq!(first.event.id, second.event.id);
	assert_eq!(f.events.len().await, 1);

	for w in [1_000, 5_000, 60_000] {
		let acc = f.engine.accumulator(WindowKey::containing(w, NOW_MS)).await.expect("acc");
		assert_eq!(acc.total_events, 1, "window {w}");
	}
}

#[tokio::test]
async fn oversized_payload_never_reaches_the_limiter() {
	let f = fixture(64);
	let mut gate = CountingGate::new(10);

	let padding = "x".repeat(64);
	let body = format!(r#"{{"route":"/home","action":"click","metadata":{{"pad":"{padding}"}}}}"#);
	let err = f.gateway.submit_bytes(body.as_bytes(), &mut gate).await.unwrap_err();
	assert!(matches!(err, IngestError::PayloadTooLarge { max: 64, .. }));

	let mut big = raw("/home", "click");
	big.session_id = Some(padding);
	let err = f.gateway.submit(big, &mut gate).await.unwrap_err();
	assert!(matches!(err, IngestError::PayloadTooLarge { .. }));

	assert_eq!(gate.asked, 0);
	assert_eq!(f.events.len().await, 0);
}

#[tokio::test]
async fn rate_limited_events_have_no_side_effects() {
	let f = fixture(16 * 1024);
	let mut gate = CountingGate::new(2);

	for _ in 0..2 {
		f.gateway.submit(raw("/home", "click"), &mut gate).await.expect("accepted");
	}
	let err = f.gateway.submit(raw("/home", "click"), &mut gate).await.unwrap_err();
	assert!(matches!(err, IngestError::RateLimited));
	assert_eq!(err.code().as_str(), "RATE_LIMITED");

	assert_eq!(f.events.len().await, 2);
	let acc = f.engine.accumulator(one_second_key()).await.expect("acc");
	assert_eq!(acc.total_events, 2);
}

#[tokio::test]
async fn invalid_events_are_rejected_before_the_limiter() {
	let f = fixture(16 * 1024);
	let mut gate = CountingGate::new(10);

	let err = f
		.gateway
		.submit_bytes(br#"{"route":"","action":"click"}"#, &mut gate)
		.await
		.unwrap_err();
	assert!(matches!(err, IngestError::Validation(EventValidationError::EmptyField("route"))));

	let err = f.gateway.submit_bytes(b"not json", &mut gate).await.unwrap_err();
	assert!(matches!(err, IngestError::Validation(EventValidationError::Malformed(_))));

	let mut bad_ts = raw("/home", "click");
	bad_ts.timestamp = Some(RawTimestamp::Text("soon".into()));
	let err = f.gateway.submit(bad_ts, &mut gate).await.unwrap_err();
	assert_eq!(err.code().as_str(), "VALIDATION_ERROR");

	assert_eq!(gate.asked, 0);
	assert_eq!(f.engine.live_accumulators(), 0);
}

#[tokio::test]
async fn accepted_event_is_stamped_and_aggregated() {
	let f = fixture(16 * 1024);
	let mut gate = TokenBucket::new(50, 100);

	for _ in 0..3 {
		f.gateway.submit(raw("/home", "click"), &mut gate).await.expect("accepted");
	}
	let cart = f.gateway.submit(raw("/cart", "error"), &mut gate).await.expect("accepted");

	assert_eq!(cart.event.server_received_at.timestamp_millis(), NOW_MS);
	assert_eq!(cart.event.timestamp.timestamp_millis(), NOW_MS);
	assert_eq!(cart.event.stored_at.timestamp_millis(), NOW_MS);

	let acc = f.engine.accumulator(one_second_key()).await.expect("acc");
	assert_eq!(acc.total_events, 4);
	assert_eq!(acc.routes.get("/home"), Some(&3));
	assert_eq!(acc.routes.get("/cart"), Some(&1));
	assert_eq!(acc.errors, 1);
	assert!(acc.is_conserved());

	let recent = f.events.recent(10).await.expect("recent");
	assert_eq!(recent.len(), 4);
}

async fn assert_every_window_total(engine: &AggregationEngine, expected: u64) {
	for w in [1_000, 5_000, 60_000] {
		let acc = engine.accumulator(WindowKey::containing(w, NOW_MS)).await.expect("acc");
		assert_eq!(acc.total_events, expected, "window {w}");
	}
}

#[tokio::test(start_paused = true)]
async fn abandoned_submission_still_reaches_every_window() {
	let f = fixture_with(16 * 1024, Arc::new(SlowLookupStore::default()));
	let mut gate = TokenBucket::new(50, 100);

	let body = br#"{"route":"/home","action":"click","clientEventId":"c-1"}"#;
	// the caller gives up while the first window is still being recovered
	let abandoned = timeout(Duration::from_millis(30), f.gateway.submit_bytes(body, &mut gate)).await;
	assert!(abandoned.is_err());

	tokio::time::sleep(Duration::from_millis(200)).await;
	assert_eq!(f.events.len().await, 1);
	assert_every_window_total(&f.engine, 1).await;

	let retry = f.gateway.submit_bytes(body, &mut gate).await.expect("accepted");
	assert!(retry.duplicate);
	assert_every_window_total(&f.engine, 1).await;
}

#[tokio::test(start_paused = true)]
async fn close_waits_for_in_flight_events_and_rejects_new_ones() {
	let f = fixture_with(16 * 1024, Arc::new(SlowLookupStore::default()));

	let gateway = f.gateway.clone();
	let in_flight = tokio::spawn(async move {
		let mut gate = TokenBucket::new(50, 100);
		gateway.submit(raw("/home", "click"), &mut gate).await
	});
	tokio::time::sleep(Duration::from_millis(5)).await;

	f.gateway.close().await;
	assert_every_window_total(&f.engine, 1).await;
	in_flight.await.expect("task").expect("accepted before close");

	let mut gate = TokenBucket::new(50, 100);
	let err = f.gateway.submit(raw("/home", "click"), &mut gate).await.unwrap_err();
	assert!(matches!(err, IngestError::ShuttingDown));
	assert_eq!(err.code().as_str(), "PROCESSING_ERROR");
	assert_eq!(f.events.len().await, 1);
	assert_every_window_total(&f.engine, 1).await;
}
