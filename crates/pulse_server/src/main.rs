#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use pulse_server::config::{load_server_config_from_path, resolve_config_path};
use pulse_server::server::aggregate_store::{AggregateStore, InMemoryAggregateStore, SqlAggregateStore};
use pulse_server::server::broadcast::BroadcastScheduler;
use pulse_server::server::connection::serve_ws;
use pulse_server::server::db::Database;
use pulse_server::server::event_store::{EventStore, InMemoryEventStore, SqlEventStore};
use pulse_server::server::http::serve_http;
use pulse_server::server::maintenance::{Maintenance, MaintenanceConfig};
use pulse_server::server::state::AppState;
use pulse_server::util::time::{Clock, SystemClock};
use pulse_util::endpoint::{parse_http_bind, parse_ws_bind};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: pulse_server [--config path] [--http-bind http://host:port] [--ws-bind ws://host:port]\n\
\n\
Options:\n\
\t--config     Config file (default: $PULSE_CONFIG or ~/.pulse/config.toml)\n\
\t--http-bind  REST endpoint (default: http://127.0.0.1:3000)\n\
\t--ws-bind    Push stream endpoint (default: ws://127.0.0.1:3001)\n\
\t--help       Show this help\n\
"
	);
	std::process::exit(2)
}

#[derive(Default)]
struct Args {
	config: Option<PathBuf>,
	http_bind: Option<SocketAddr>,
	ws_bind: Option<SocketAddr>,
}

fn parse_args() -> Args {
	let mut args = Args::default();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.config = Some(PathBuf::from(v));
			}
			"--http-bind" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.http_bind = Some(parse_http_bind(&v).unwrap_or_else(|e| {
					eprintln!("{e}");
					usage_and_exit();
				}));
			}
			"--ws-bind" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.ws_bind = Some(parse_ws_bind(&v).unwrap_or_else(|e| {
					eprintln!("{e}");
					usage_and_exit();
				}));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,pulse_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("pulse_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = resolve_config_path(args.config)?;
	let mut server_cfg = load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	if let Some(addr) = args.http_bind {
		server_cfg.server.http_bind = addr;
	}
	if let Some(addr) = args.ws_bind {
		server_cfg.server.ws_bind = addr;
	}

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let (events, aggregates): (Arc<dyn EventStore>, Arc<dyn AggregateStore>) = if server_cfg.persistence.enabled {
		let Some(database_url) = server_cfg.persistence.database_url.as_deref() else {
			return Err(anyhow::anyhow!("persistence enabled but no database_url configured"));
		};
		let db = Database::connect(database_url).await?;
		info!(backend = db.backend_name(), "persistent stores ready");
		(
			Arc::new(SqlEventStore::new(db.clone())),
			Arc::new(SqlAggregateStore::new(db)),
		)
	} else {
		warn!("persistence disabled: events and aggregates are kept in memory only");
		(
			Arc::new(InMemoryEventStore::default()),
			Arc::new(InMemoryAggregateStore::default()),
		)
	};

	let clock: Arc<dyn Clock> = Arc::new(SystemClock);
	let state = AppState::new(&server_cfg, events, aggregates, Arc::clone(&clock));
	if !state.auth.is_enabled() {
		warn!("no auth_token or jwt_secret configured: ingestion endpoints are open");
	}

	let http_listener = TcpListener::bind(server_cfg.server.http_bind).await?;
	let ws_listener = TcpListener::bind(server_cfg.server.ws_bind).await?;
	info!(http = %server_cfg.server.http_bind, ws = %server_cfg.server.ws_bind, "pulse_server listening");

	let http_task = tokio::spawn(serve_http(http_listener, state.clone()));
	let ws_task = tokio::spawn(serve_ws(ws_listener, state.clone()));
	let broadcast = BroadcastScheduler::new(state.engine.clone(), state.hub.clone(), Arc::clone(&clock)).spawn();
	let maintenance = Maintenance::new(
		MaintenanceConfig {
			sweep_interval: server_cfg.aggregation.sweep_interval,
			event_ttl: server_cfg.persistence.event_ttl,
		},
		state.engine.clone(),
		Arc::clone(&state.events),
		Arc::clone(&clock),
	)
	.spawn();

	state.health.mark_ready();

	tokio::signal::ctrl_c().await?;
	info!("shutdown requested");
	state.health.mark_not_ready();

	http_task.abort();
	ws_task.abort();
	broadcast.shutdown();
	maintenance.abort();

	// open connections may still submit; close the gateway so nothing lands after the flush
	let timeout = server_cfg.server.shutdown_flush_timeout;
	let drain = async {
		state.gateway.close().await;
		state.engine.flush_all().await
	};
	match tokio::time::timeout(timeout, drain).await {
		Ok(report) if report.failed == 0 => {
			info!(persisted = report.persisted, "shutdown complete");
			Ok(())
		}
		Ok(report) => {
			warn!(
				persisted = report.persisted,
				failed = report.failed,
				"shutdown complete with unpersisted aggregates"
			);
			Ok(())
		}
		Err(_) => {
			error!(timeout_ms = timeout.as_millis() as u64, "aggregate flush timed out; exiting");
			std::process::exit(1);
		}
	}
}
