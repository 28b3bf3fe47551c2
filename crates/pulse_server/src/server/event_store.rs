#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use pulse_domain::{Event, EventId, ValidatedEvent};
use tokio::sync::Mutex;

use crate::server::db::Database;
use crate::util::time::from_unix_ms;

/// Raw events are eligible for removal seven days after `storedAt`.
pub const DEFAULT_EVENT_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Result of a store call. `duplicate` means the `clientEventId` was already
/// present and `event` is the original record.
#[derive(Debug, Clone)]
pub struct StoreOutcome {
	pub event: Event,
	pub duplicate: bool,
}

#[async_trait::async_trait]
pub trait EventStore: Send + Sync {
	/// Store an event; first writer wins per `clientEventId`.
	async fn store(&self, event: ValidatedEvent, stored_at: DateTime<Utc>) -> anyhow::Result<StoreOutcome>;

	/// Most recent events by client timestamp, newest first.
	async fn recent(&self, limit: usize) -> anyhow::Result<Vec<Event>>;

	/// Delete events stored before `cutoff`; returns the number removed.
	async fn purge_stored_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64>;

	async fn ping(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryEventStore {
	inner: Mutex<InMemoryEvents>,
}

#[derive(Debug, Default)]
struct InMemoryEvents {
	events: HashMap<EventId, Event>,
	by_client_event_id: HashMap<String, EventId>,
	/// Ordered by client timestamp so `recent` only walks the newest entries.
	by_timestamp: BTreeSet<(DateTime<Utc>, EventId)>,
}

impl InMemoryEventStore {
	pub async fn len(&self) -> usize {
		self.inner.lock().await.events.len()
	}
}

#[async_trait::async_trait]
impl EventStore for InMemoryEventStore {
	async fn store(&self, event: ValidatedEvent, stored_at: DateTime<Utc>) -> anyhow::Result<StoreOutcome> {
		let mut guard = self.inner.lock().await;

		if let Some(client_id) = event.client_event_id.as_deref()
			&& let Some(existing) = guard.by_client_event_id.get(client_id).and_then(|id| guard.events.get(id))
		{
			return Ok(StoreOutcome {
				event: existing.clone(),
				duplicate: true,
			});
		}

		let stored = Event::from_validated(event, EventId::new_v4(), stored_at);
		if let Some(client_id) = stored.client_event_id.clone() {
			guard.by_client_event_id.insert(client_id, stored.id);
		}
		guard.by_timestamp.insert((stored.timestamp, stored.id));
		guard.events.insert(stored.id, stored.clone());

		Ok(StoreOutcome {
			event: stored,
			duplicate: false,
		})
	}

	async fn recent(&self, limit: usize) -> anyhow::Result<Vec<Event>> {
		let guard = self.inner.lock().await;
		let events = guard
			.by_timestamp
			.iter()
			.rev()
			.filter_map(|(_, id)| guard.events.get(id))
			.take(limit)
			.cloned()
			.collect();
		Ok(events)
	}

	async fn purge_stored_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
		let mut guard = self.inner.lock().await;
		let expired = guard
			.events
			.values()
			.filter(|e| e.stored_at < cutoff)
			.map(|e| (e.id, e.timestamp, e.client_event_id.clone()))
			.collect::<Vec<_>>();

		for (id, timestamp, client_id) in &expired {
			guard.events.remove(id);
			guard.by_timestamp.remove(&(*timestamp, *id));
			if let Some(client_id) = client_id {
				guard.by_client_event_id.remove(client_id);
			}
		}

		Ok(expired.len() as u64)
	}

	async fn ping(&self) -> anyhow::Result<()> {
		Ok(())
	}
}

#[derive(Clone, Debug)]
pub struct SqlEventStore {
	db: Database,
}

#[derive(sqlx::FromRow)]
struct EventRow {
	id: String,
	client_event_id: Option<String>,
	timestamp_ms: i64,
	server_received_at_ms: i64,
	stored_at_ms: i64,
	user_id: Option<String>,
	session_id: Option<String>,
	route: String,
	action: String,
	metadata: Option<String>,
}

impl TryFrom<EventRow> for Event {
	type Error = anyhow::Error;

	fn try_from(row: EventRow) -> anyhow::Result<Self> {
		let id = uuid::Uuid::parse_str(&row.id).context("parse event id")?;
		let metadata = match row.metadata {
			Some(text) => Some(serde_json::from_str(&text).context("decode event metadata")?),
			None => None,
		};

		Ok(Event {
			id: EventId(id),
			timestamp: from_unix_ms(row.timestamp_ms),
			server_received_at: from_unix_ms(row.server_received_at_ms),
			stored_at: from_unix_ms(row.stored_at_ms),
			user_id: row.user_id,
			session_id: row.session_id,
			route: row.route,
			action: row.action,
			metadata,
			client_event_id: row.client_event_id,
		})
	}
}

const EVENT_COLUMNS: &str = "id, client_event_id, timestamp_ms, server_received_at_ms, stored_at_ms, user_id, session_id, route, action, metadata";

impl SqlEventStore {
	pub fn new(db: Database) -> Self {
		Self { db }
	}

	async fn find_by_client_event_id(&self, client_event_id: &str) -> anyhow::Result<Option<Event>> {
		let row: Option<EventRow> = match &self.db {
			Database::Sqlite(pool) => {
				sqlx::query_as(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE client_event_id = ?"))
					.bind(client_event_id)
					.fetch_optional(pool)
					.await
					.context("select event by client_event_id (sqlite)")?
			}
			Database::Postgres(pool) => {
				sqlx::query_as(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE client_event_id = $1"))
					.bind(client_event_id)
					.fetch_optional(pool)
					.await
					.context("select event by client_event_id (postgres)")?
			}
		};

		row.map(Event::try_from).transpose()
	}
}

#[async_trait::async_trait]
impl EventStore for SqlEventStore {
	async fn store(&self, event: ValidatedEvent, stored_at: DateTime<Utc>) -> anyhow::Result<StoreOutcome> {
		let stored = Event::from_validated(event, EventId::new_v4(), stored_at);
		let metadata = match &stored.metadata {
			Some(m) => Some(serde_json::to_string(m).context("encode event metadata")?),
			None => None,
		};

		let inserted = match &self.db {
			Database::Sqlite(pool) => sqlx::query(
				"INSERT INTO events (id, client_event_id, timestamp_ms, server_received_at_ms, stored_at_ms, user_id, session_id, route, action, metadata) \
				VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT(client_event_id) DO NOTHING",
			)
			.bind(stored.id.to_string())
			.bind(stored.client_event_id.as_deref())
			.bind(stored.timestamp.timestamp_millis())
			.bind(stored.server_received_at.timestamp_millis())
			.bind(stored.stored_at.timestamp_millis())
			.bind(stored.user_id.as_deref())
			.bind(stored.session_id.as_deref())
			.bind(&stored.route)
			.bind(&stored.action)
			.bind(metadata)
			.execute(pool)
			.await
			.context("insert event (sqlite)")?
			.rows_affected(),
			Database::Postgres(pool) => sqlx::query(
				"INSERT INTO events (id, client_event_id, timestamp_ms, server_received_at_ms, stored_at_ms, user_id, session_id, route, action, metadata) \
				VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) ON CONFLICT (client_event_id) DO NOTHING",
			)
			.bind(stored.id.to_string())
			.bind(stored.client_event_id.as_deref())
			.bind(stored.timestamp.timestamp_millis())
			.bind(stored.server_received_at.timestamp_millis())
			.bind(stored.stored_at.timestamp_millis())
			.bind(stored.user_id.as_deref())
			.bind(stored.session_id.as_deref())
			.bind(&stored.route)
			.bind(&stored.action)
			.bind(metadata)
			.execute(pool)
			.await
			.context("insert event (postgres)")?
			.rows_affected(),
		};

		if inserted > 0 {
			return Ok(StoreOutcome {
				event: stored,
				duplicate: false,
			});
		}

		let client_event_id = stored
			.client_event_id
			.as_deref()
			.ok_or_else(|| anyhow!("event insert affected no rows"))?;
		let existing = self
			.find_by_client_event_id(client_event_id)
			.await?
			.ok_or_else(|| anyhow!("conflicting event vanished: {client_event_id}"))?;

		Ok(StoreOutcome {
			event: existing,
			duplicate: true,
		})
	}

	async fn recent(&self, limit: usize) -> anyhow::Result<Vec<Event>> {
		let limit = limit.min(i64::MAX as usize) as i64;
		let rows: Vec<EventRow> = match &self.db {
			Database::Sqlite(pool) => sqlx::query_as(&format!(
				"SELECT {EVENT_COLUMNS} FROM events ORDER BY timestamp_ms DESC LIMIT ?"
			))
			.bind(limit)
			.fetch_all(pool)
			.await
			.context("select recent events (sqlite)")?,
			Database::Postgres(pool) => sqlx::query_as(&format!(
				"SELECT {EVENT_COLUMNS} FROM events ORDER BY timestamp_ms DESC LIMIT $1"
			))
			.bind(limit)
			.fetch_all(pool)
			.await
			.context("select recent events (postgres)")?,
		};

		rows.into_iter().map(Event::try_from).collect()
	}

	async fn purge_stored_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
		let cutoff_ms = cutoff.timestamp_millis();
		let removed = match &self.db {
			Database::Sqlite(pool) => sqlx::query("DELETE FROM events WHERE stored_at_ms < ?")
				.bind(cutoff_ms)
				.execute(pool)
				.await
				.context("purge events (sqlite)")?
				.rows_affected(),
			Database::Postgres(pool) => sqlx::query("DELETE FROM events WHERE stored_at_ms < $1")
				.bind(cutoff_ms)
				.execute(pool)
				.await
				.context("purge events (postgres)")?
				.rows_affected(),
		};
		Ok(removed)
	}

	async fn ping(&self) -> anyhow::Result<()> {
		self.db.ping().await
	}
}
