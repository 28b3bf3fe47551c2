#![forbid(unsafe_code)]

use std::sync::Arc;

use pulse_domain::{DEFAULT_MAX_PAYLOAD_BYTES, Event, EventValidationError, RawEvent, ValidatedEvent};
use pulse_protocol::ErrorCode;
use thiserror::Error;
use tracing::{debug, warn};

use crate::server::aggregation::AggregationEngine;
use crate::server::event_store::EventStore;
use crate::server::rate_limit::RateGate;
use crate::util::time::Clock;

/// Why an event was not accepted.
#[derive(Debug, Error)]
pub enum IngestError {
	#[error(transparent)]
	Validation(#[from] EventValidationError),

	#[error("payload too large: {len} bytes (max {max})")]
	PayloadTooLarge { len: usize, max: usize },

	#[error("rate limit exceeded")]
	RateLimited,

	#[error("failed to store event: {0}")]
	Persistence(String),

	#[error("server is shutting down")]
	ShuttingDown,
}

impl IngestError {
	pub fn code(&self) -> ErrorCode {
		match self {
			IngestError::Validation(_) => ErrorCode::Validation,
			IngestError::PayloadTooLarge { .. } => ErrorCode::PayloadTooLarge,
			IngestError::RateLimited => ErrorCode::RateLimited,
			IngestError::Persistence(_) | IngestError::ShuttingDown => ErrorCode::Processing,
		}
	}

	/// Short label for metrics.
	pub fn reason(&self) -> &'static str {
		match self {
			IngestError::Validation(_) => "validation",
			IngestError::PayloadTooLarge { .. } => "payload_too_large",
			IngestError::RateLimited => "rate_limited",
			IngestError::Persistence(_) => "persistence",
			IngestError::ShuttingDown => "shutting_down",
		}
	}
}

/// An event that made it through the gateway.
#[derive(Debug, Clone)]
pub struct Accepted {
	pub event: Event,
	/// The `clientEventId` was seen before; `event` is the original record.
	pub duplicate: bool,
}

/// Entry point shared by the push stream and the REST API.
///
/// Order of checks: payload size, validation, rate limit. Only events that
/// pass all three reach the stores, so rejected events never touch an aggregate.
#[derive(Clone)]
pub struct IngestionGateway {
	events: Arc<dyn EventStore>,
	engine: AggregationEngine,
	clock: Arc<dyn Clock>,
	max_payload_bytes: usize,
	/// `true` once closed. Each in-flight accept holds a read guard.
	closed: Arc<tokio::sync::RwLock<bool>>,
}

impl IngestionGateway {
	pub fn new(
		events: Arc<dyn EventStore>,
		engine: AggregationEngine,
		clock: Arc<dyn Clock>,
		max_payload_bytes: usize,
	) -> Self {
		let max_payload_bytes = if max_payload_bytes == 0 {
			DEFAULT_MAX_PAYLOAD_BYTES
		} else {
			max_payload_bytes
		};
		Self {
			events,
			engine,
			clock,
			max_payload_bytes,
			closed: Arc::new(tokio::sync::RwLock::new(false)),
		}
	}

	/// Stop admitting events and wait for in-flight ones to finish.
	pub async fn close(&self) {
		let mut closed = self.closed.write().await;
		*closed = true;
		debug!("ingestion gateway closed");
	}

	pub fn max_payload_bytes(&self) -> usize {
		self.max_payload_bytes
	}

	/// Submit a serialized event body.
	pub async fn submit_bytes<G>(&self, body: &[u8], gate: &mut G) -> Result<Accepted, IngestError>
	where
		G: RateGate + Send + ?Sized,
	{
		metrics::counter!("pulse_server_events_received_total").increment(1);
		let result = match self.check_size(body.len()) {
			Ok(()) => match RawEvent::from_json(body) {
				Ok(raw) => self.admit(raw, gate).await,
				Err(e) => Err(e.into()),
			},
			Err(e) => Err(e),
		};
		record_outcome(&result);
		result
	}

	/// Submit an already decoded event. Its serialized size is still enforced.
	pub async fn submit<G>(&self, raw: RawEvent, gate: &mut G) -> Result<Accepted, IngestError>
	where
		G: RateGate + Send + ?Sized,
	{
		metrics::counter!("pulse_server_events_received_total").increment(1);
		let result = match serde_json::to_vec(&raw) {
			Ok(encoded) => match self.check_size(encoded.len()) {
				Ok(()) => self.admit(raw, gate).await,
				Err(e) => Err(e),
			},
			Err(e) => Err(EventValidationError::Malformed(e.to_string()).into()),
		};
		record_outcome(&result);
		result
	}

	fn check_size(&self, len: usize) -> Result<(), IngestError> {
		if len > self.max_payload_bytes {
			return Err(IngestError::PayloadTooLarge {
				len,
				max: self.max_payload_bytes,
			});
		}
		Ok(())
	}

	async fn admit<G>(&self, raw: RawEvent, gate: &mut G) -> Result<Accepted, IngestError>
	where
		G: RateGate + Send + ?Sized,
	{
		let validated = raw.validate(self.clock.now())?;

		if !gate.try_acquire() {
			return Err(IngestError::RateLimited);
		}

		self.accept(validated).await
	}

	/// Run the store and aggregation step on its own task so that a caller that
	/// goes away (a dropped HTTP request) cannot leave an event half applied.
	async fn accept(&self, event: ValidatedEvent) -> Result<Accepted, IngestError> {
		let open = Arc::clone(&self.closed).read_owned().await;
		if *open {
			return Err(IngestError::ShuttingDown);
		}

		let this = self.clone();
		let task = tokio::spawn(async move {
			let _open = open;
			this.store_and_aggregate(event).await
		});

		match task.await {
			Ok(result) => result,
			Err(e) => {
				warn!(error = %e, "ingest task failed");
				Err(IngestError::Persistence(e.to_string()))
			}
		}
	}

	/// Store and aggregate one validated event.
	///
	/// With an idempotency key the store decides first and duplicates are not
	/// aggregated again. Without one both run concurrently.
	async fn store_and_aggregate(&self, event: ValidatedEvent) -> Result<Accepted, IngestError> {
		let stored_at = self.clock.now();

		if event.client_event_id.is_some() {
			let outcome = self.events.store(event.clone(), stored_at).await.map_err(persistence_error)?;
			if outcome.duplicate {
				metrics::counter!("pulse_server_events_duplicate_total").increment(1);
				debug!(client_event_id = ?outcome.event.client_event_id, "duplicate event ignored");
			} else {
				self.engine.process(&event).await;
			}
			return Ok(Accepted {
				event: outcome.event,
				duplicate: outcome.duplicate,
			});
		}

		let (stored, ()) = tokio::join!(self.events.store(event.clone(), stored_at), self.engine.process(&event));
		let outcome = stored.map_err(persistence_error)?;
		Ok(Accepted {
			event: outcome.event,
			duplicate: false,
		})
	}
}

fn persistence_error(e: anyhow::Error) -> IngestError {
	warn!(error = %e, "event store write failed");
	IngestError::Persistence(format!("{e:#}"))
}

fn record_outcome(result: &Result<Accepted, IngestError>) {
	match result {
		Ok(_) => metrics::counter!("pulse_server_events_accepted_total").increment(1),
		Err(e) => metrics::counter!("pulse_server_events_rejected_total", "reason" => e.reason()).increment(1),
	}
}

impl std::fmt::Debug for IngestionGateway {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("IngestionGateway")
			.field("max_payload_bytes", &self.max_payload_bytes)
			.finish_non_exhaustive()
	}
}
