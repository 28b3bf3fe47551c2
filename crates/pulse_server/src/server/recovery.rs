#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Context;
use pulse_domain::{AggregateRecord, WindowKey};

use crate::server::aggregate_store::AggregateStore;

/// Point lookups used to seed a freshly created accumulator.
#[derive(Clone)]
pub struct RecoveryLoader {
	store: Arc<dyn AggregateStore>,
}

impl RecoveryLoader {
	pub fn new(store: Arc<dyn AggregateStore>) -> Self {
		Self { store }
	}

	/// Durable record for exactly `key`, if one was ever written.
	pub async fn load(&self, key: WindowKey) -> anyhow::Result<Option<AggregateRecord>> {
		let record = self
			.store
			.get(key)
			.await
			.with_context(|| format!("recover aggregate {key}"))?;

		if record.is_some() {
			metrics::counter!("pulse_server_recovered_windows_total").increment(1);
		}
		Ok(record)
	}
}

impl std::fmt::Debug for RecoveryLoader {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RecoveryLoader").finish_non_exhaustive()
	}
}
