#![forbid(unsafe_code)]

use std::str::FromStr;

use anyhow::{Context, anyhow};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

/// Pooled connection to the durable store, selected by URL scheme.
#[derive(Clone, Debug)]
pub enum Database {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl Database {
	/// Connect and run migrations. Accepts `sqlite:` and `postgres:`/`postgresql:` URLs.
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
			let opts = SqliteConnectOptions::from_str(database_url)
				.context("parse sqlite url")?
				.create_if_missing(true);

			// every connection to `:memory:` is a separate database
			let pool_opts = if in_memory {
				SqlitePoolOptions::new()
					.max_connections(1)
					.idle_timeout(None::<std::time::Duration>)
					.max_lifetime(None::<std::time::Duration>)
			} else {
				SqlitePoolOptions::new().max_connections(8)
			};

			let pool = pool_opts.connect_with(opts).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self::Sqlite(pool))
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self::Postgres(pool))
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}

	pub fn backend_name(&self) -> &'static str {
		match self {
			Database::Sqlite(_) => "sqlite",
			Database::Postgres(_) => "postgres",
		}
	}

	pub async fn ping(&self) -> anyhow::Result<()> {
		match self {
			Database::Sqlite(pool) => {
				sqlx::query("SELECT 1").execute(pool).await.context("ping sqlite")?;
			}
			Database::Postgres(pool) => {
				sqlx::query("SELECT 1").execute(pool).await.context("ping postgres")?;
			}
		}
		Ok(())
	}
}
