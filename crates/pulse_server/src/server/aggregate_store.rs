#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use pulse_domain::{AggregateRecord, WindowKey};
use tokio::sync::Mutex;

use crate::server::db::Database;
use crate::util::time::from_unix_ms;

/// Durable per-window summaries, upserted by `(window, window_start)`.
#[async_trait::async_trait]
pub trait AggregateStore: Send + Sync {
	async fn upsert(&self, record: &AggregateRecord) -> anyhow::Result<()>;

	/// Point lookup by exact key.
	async fn get(&self, key: WindowKey) -> anyhow::Result<Option<AggregateRecord>>;

	/// Most recently written record for a window size.
	async fn latest(&self, window_ms: u64) -> anyhow::Result<Option<AggregateRecord>>;

	async fn ping(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryAggregateStore {
	records: Mutex<HashMap<WindowKey, AggregateRecord>>,
	writes: AtomicU64,
}

impl InMemoryAggregateStore {
	/// Number of upserts served so far.
	pub fn write_count(&self) -> u64 {
		self.writes.load(Ordering::Relaxed)
	}
}

#[async_trait::async_trait]
impl AggregateStore for InMemoryAggregateStore {
	async fn upsert(&self, record: &AggregateRecord) -> anyhow::Result<()> {
		self.records.lock().await.insert(record.key(), record.clone());
		self.writes.fetch_add(1, Ordering::Relaxed);
		Ok(())
	}

	async fn get(&self, key: WindowKey) -> anyhow::Result<Option<AggregateRecord>> {
		Ok(self.records.lock().await.get(&key).cloned())
	}

	async fn latest(&self, window_ms: u64) -> anyhow::Result<Option<AggregateRecord>> {
		let guard = self.records.lock().await;
		Ok(guard
			.values()
			.filter(|r| r.window == window_ms)
			.max_by_key(|r| (r.timestamp, r.window_start))
			.cloned())
	}

	async fn ping(&self) -> anyhow::Result<()> {
		Ok(())
	}
}

#[derive(Clone, Debug)]
pub struct SqlAggregateStore {
	db: Database,
}

#[derive(sqlx::FromRow)]
struct AggregateRow {
	window_ms: i64,
	window_start_ms: i64,
	timestamp_ms: i64,
	total_events: i64,
	unique_users: i64,
	unique_sessions: i64,
	routes: String,
	actions: String,
	errors: i64,
	partial: bool,
}

impl TryFrom<AggregateRow> for AggregateRecord {
	type Error = anyhow::Error;

	fn try_from(row: AggregateRow) -> anyhow::Result<Self> {
		let routes: BTreeMap<String, u64> = serde_json::from_str(&row.routes).context("decode routes")?;
		let actions: BTreeMap<String, u64> = serde_json::from_str(&row.actions).context("decode actions")?;

		Ok(AggregateRecord {
			window: row.window_ms.max(0) as u64,
			window_start: from_unix_ms(row.window_start_ms),
			timestamp: from_unix_ms(row.timestamp_ms),
			total_events: row.total_events.max(0) as u64,
			unique_users: row.unique_users.max(0) as u64,
			unique_sessions: row.unique_sessions.max(0) as u64,
			routes,
			actions,
			errors: row.errors.max(0) as u64,
			partial: row.partial,
		})
	}
}

const AGGREGATE_COLUMNS: &str =
	"window_ms, window_start_ms, timestamp_ms, total_events, unique_users, unique_sessions, routes, actions, errors, partial";

#[inline]
fn as_i64(v: u64) -> i64 {
	i64::try_from(v).unwrap_or(i64::MAX)
}

impl SqlAggregateStore {
	pub fn new(db: Database) -> Self {
		Self { db }
	}
}

#[async_trait::async_trait]
impl AggregateStore for SqlAggregateStore {
	async fn upsert(&self, record: &AggregateRecord) -> anyhow::Result<()> {
		let routes = serde_json::to_string(&record.routes).context("encode routes")?;
		let actions = serde_json::to_string(&record.actions).context("encode actions")?;

		match &self.db {
			Database::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO window_aggregates (window_ms, window_start_ms, timestamp_ms, total_events, unique_users, unique_sessions, routes, actions, errors, partial) \
					VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
					ON CONFLICT(window_ms, window_start_ms) DO UPDATE SET \
					timestamp_ms = excluded.timestamp_ms, total_events = excluded.total_events, \
					unique_users = excluded.unique_users, unique_sessions = excluded.unique_sessions, \
					routes = excluded.routes, actions = excluded.actions, errors = excluded.errors, partial = excluded.partial",
				)
				.bind(as_i64(record.window))
				.bind(record.window_start.timestamp_millis())
				.bind(record.timestamp.timestamp_millis())
				.bind(as_i64(record.total_events))
				.bind(as_i64(record.unique_users))
				.bind(as_i64(record.unique_sessions))
				.bind(&routes)
				.bind(&actions)
				.bind(as_i64(record.errors))
				.bind(record.partial)
				.execute(pool)
				.await
				.context("upsert aggregate (sqlite)")?;
			}
			Database::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO window_aggregates (window_ms, window_start_ms, timestamp_ms, total_events, unique_users, unique_sessions, routes, actions, errors, partial) \
					VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
					ON CONFLICT (window_ms, window_start_ms) DO UPDATE SET \
					timestamp_ms = EXCLUDED.timestamp_ms, total_events = EXCLUDED.total_events, \
					unique_users = EXCLUDED.unique_users, unique_sessions = EXCLUDED.unique_sessions, \
					routes = EXCLUDED.routes, actions = EXCLUDED.actions, errors = EXCLUDED.errors, partial = EXCLUDED.partial",
				)
				.bind(as_i64(record.window))
				.bind(record.window_start.timestamp_millis())
				.bind(record.timestamp.timestamp_millis())
				.bind(as_i64(record.total_events))
				.bind(as_i64(record.unique_users))
				.bind(as_i64(record.unique_sessions))
				.bind(&routes)
				.bind(&actions)
				.bind(as_i64(record.errors))
				.bind(record.partial)
				.execute(pool)
				.await
				.context("upsert aggregate (postgres)")?;
			}
		}
		Ok(())
	}

	async fn get(&self, key: WindowKey) -> anyhow::Result<Option<AggregateRecord>> {
		let row: Option<AggregateRow> = match &self.db {
			Database::Sqlite(pool) => sqlx::query_as(&format!(
				"SELECT {AGGREGATE_COLUMNS} FROM window_aggregates WHERE window_ms = ? AND window_start_ms = ?"
			))
			.bind(as_i64(key.window_ms))
			.bind(key.window_start_ms)
			.fetch_optional(pool)
			.await
			.context("select aggregate (sqlite)")?,
			Database::Postgres(pool) => sqlx::query_as(&format!(
				"SELECT {AGGREGATE_COLUMNS} FROM window_aggregates WHERE window_ms = $1 AND window_start_ms = $2"
			))
			.bind(as_i64(key.window_ms))
			.bind(key.window_start_ms)
			.fetch_optional(pool)
			.await
			.context("select aggregate (postgres)")?,
		};

		row.map(AggregateRecord::try_from).transpose()
	}

	async fn latest(&self, window_ms: u64) -> anyhow::Result<Option<AggregateRecord>> {
		let row: Option<AggregateRow> = match &self.db {
			Database::Sqlite(pool) => sqlx::query_as(&format!(
				"SELECT {AGGREGATE_COLUMNS} FROM window_aggregates WHERE window_ms = ? \
				ORDER BY timestamp_ms DESC, window_start_ms DESC LIMIT 1"
			))
			.bind(as_i64(window_ms))
			.fetch_optional(pool)
			.await
			.context("select latest aggregate (sqlite)")?,
			Database::Postgres(pool) => sqlx::query_as(&format!(
				"SELECT {AGGREGATE_COLUMNS} FROM window_aggregates WHERE window_ms = $1 \
				ORDER BY timestamp_ms DESC, window_start_ms DESC LIMIT 1"
			))
			.bind(as_i64(window_ms))
			.fetch_optional(pool)
			.await
			.context("select latest aggregate (postgres)")?,
		};

		row.map(AggregateRecord::try_from).transpose()
	}

	async fn ping(&self) -> anyhow::Result<()> {
		self.db.ping().await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn record(window: u64, start_ms: i64, stamped_ms: i64, total: u64) -> AggregateRecord {
		AggregateRecord {
			window,
			window_start: from_unix_ms(start_ms),
			timestamp: from_unix_ms(stamped_ms),
			total_events: total,
			unique_users: 2,
			unique_sessions: 1,
			routes: BTreeMap::from([("/home".to_string(), total)]),
			actions: BTreeMap::from([("click".to_string(), total)]),
			errors: 0,
			partial: false,
		}
	}

	async fn exercise(store: &dyn AggregateStore) {
		assert!(store.latest(1_000).await.expect("latest").is_none());

		store.upsert(&record(1_000, 10_000, 10_900, 3)).await.expect("upsert");
		store.upsert(&record(1_000, 11_000, 11_900, 5)).await.expect("upsert");
		store.upsert(&record(5_000, 10_000, 11_950, 8)).await.expect("upsert");

		// same key again replaces the row
		let mut replaced = record(1_000, 10_000, 12_500, 4);
		replaced.partial = true;
		store.upsert(&replaced).await.expect("upsert");

		let got = store
			.get(WindowKey {
				window_ms: 1_000,
				window_start_ms: 10_000,
			})
			.await
			.expect("get")
			.expect("present");
		assert_eq!(got, replaced);

		let latest = store.latest(1_000).await.expect("latest").expect("present");
		assert_eq!(latest.window_start.timestamp_millis(), 10_000);
		assert_eq!(latest.total_events, 4);

		let latest = store.latest(5_000).await.expect("latest").expect("present");
		assert_eq!(latest.total_events, 8);

		assert!(
			store
				.get(WindowKey {
					window_ms: 60_000,
					window_start_ms: 0,
				})
				.await
				.expect("get")
				.is_none()
		);
	}

	#[tokio::test]
	async fn in_memory_store_upserts_by_key() {
		let store = InMemoryAggregateStore::default();
		exercise(&store).await;
		assert_eq!(store.write_count(), 4);
	}

	#[tokio::test]
	async fn sqlite_store_upserts_by_key() {
		let db = Database::connect("sqlite::memory:").await.expect("connect sqlite");
		exercise(&SqlAggregateStore::new(db)).await;
	}
}
