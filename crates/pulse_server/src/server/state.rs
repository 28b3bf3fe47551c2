#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::ServerConfig;
use crate::server::aggregate_store::AggregateStore;
use crate::server::aggregation::AggregationEngine;
use crate::server::auth::Authenticator;
use crate::server::event_store::EventStore;
use crate::server::gateway::IngestionGateway;
use crate::server::rate_limit::{IpRateLimiter, TokenBucket};
use crate::server::room_hub::{RoomHub, RoomHubConfig};
use crate::util::time::Clock;

/// Startup-complete flag behind `/readyz`.
#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn mark_not_ready(&self) {
		self.ready.store(false, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

/// Services shared by every listener.
#[derive(Clone)]
pub struct AppState {
	pub gateway: IngestionGateway,
	pub engine: AggregationEngine,
	pub events: Arc<dyn EventStore>,
	pub aggregates: Arc<dyn AggregateStore>,
	pub hub: RoomHub,
	pub auth: Authenticator,
	pub health: HealthState,
	pub rest_limiter: Arc<IpRateLimiter>,
	pub clock: Arc<dyn Clock>,
	pub default_room: String,
	rate_limit_per_sec: u32,
	rate_limit_burst: u32,
}

impl AppState {
	pub fn new(
		cfg: &ServerConfig,
		events: Arc<dyn EventStore>,
		aggregates: Arc<dyn AggregateStore>,
		clock: Arc<dyn Clock>,
	) -> Self {
		let engine = AggregationEngine::new(cfg.aggregation.engine_config(), Arc::clone(&aggregates), Arc::clone(&clock));
		let gateway = IngestionGateway::new(
			Arc::clone(&events),
			engine.clone(),
			Arc::clone(&clock),
			cfg.ingest.max_payload_bytes,
		);
		let hub = RoomHub::new(RoomHubConfig {
			subscriber_queue_capacity: cfg.broadcast.subscriber_queue_capacity,
		});

		Self {
			gateway,
			engine,
			events,
			aggregates,
			hub,
			auth: Authenticator::new(cfg.auth.auth_token.clone(), cfg.auth.jwt_secret.clone()),
			health: HealthState::new(),
			rest_limiter: Arc::new(IpRateLimiter::new(cfg.ingest.rate_limit_per_sec, cfg.ingest.rate_limit_burst)),
			clock,
			default_room: cfg.broadcast.default_room.clone(),
			rate_limit_per_sec: cfg.ingest.rate_limit_per_sec,
			rate_limit_burst: cfg.ingest.rate_limit_burst,
		}
	}

	/// Fresh full bucket for a new push-stream connection.
	pub fn connection_bucket(&self) -> TokenBucket {
		TokenBucket::new(self.rate_limit_per_sec, self.rate_limit_burst)
	}

	/// Store reachability, for readiness.
	pub async fn ping_stores(&self) -> anyhow::Result<()> {
		self.events.ping().await?;
		self.aggregates.ping().await
	}
}
