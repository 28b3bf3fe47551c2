#![forbid(unsafe_code)]

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use pulse_domain::{DEFAULT_MAX_PAYLOAD_BYTES, DEFAULT_ROOM, DEFAULT_WINDOWS_MS};
use pulse_util::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::aggregation::{AggregationConfig, DEFAULT_PERSIST_DEBOUNCE, DEFAULT_RETENTION};
use crate::server::event_store::DEFAULT_EVENT_TTL_SECS;
use crate::server::rate_limit::{DEFAULT_BURST, DEFAULT_RATE_PER_SEC};

/// Env var naming an explicit config file.
pub const PULSE_CONFIG_ENV: &str = "PULSE_CONFIG";

/// Default config path: `~/.pulse/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".pulse").join("config.toml"))
}

/// `--config` wins over `PULSE_CONFIG`, which wins over the default path.
pub fn resolve_config_path(cli: Option<PathBuf>) -> anyhow::Result<PathBuf> {
	if let Some(path) = cli {
		return Ok(path);
	}
	if let Ok(v) = std::env::var(PULSE_CONFIG_ENV) {
		let v = v.trim();
		if !v.is_empty() {
			return Ok(PathBuf::from(v));
		}
	}
	default_config_path()
}

/// Load the server config from TOML and env overrides. A missing file means defaults.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub auth: AuthSettings,
	pub persistence: PersistenceSettings,
	pub ingest: IngestSettings,
	pub aggregation: AggregationSettings,
	pub broadcast: BroadcastSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// REST API and health endpoints.
	pub http_bind: SocketAddr,
	/// WebSocket push stream.
	pub ws_bind: SocketAddr,
	/// Optional Prometheus exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Upper bound on the shutdown flush.
	pub shutdown_flush_timeout: Duration,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			http_bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
			ws_bind: SocketAddr::from(([127, 0, 0, 1], 3001)),
			metrics_bind: None,
			shutdown_flush_timeout: Duration::from_secs(10),
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct AuthSettings {
	/// Static bearer token.
	pub auth_token: Option<SecretString>,
	/// HS256 secret for signed tokens.
	pub jwt_secret: Option<SecretString>,
}

#[derive(Debug, Clone)]
pub struct PersistenceSettings {
	pub enabled: bool,
	/// Database URL (sqlite: or postgres:).
	pub database_url: Option<String>,
	/// Raw events older than this (by `storedAt`) are purged.
	pub event_ttl: Duration,
}

impl Default for PersistenceSettings {
	fn default() -> Self {
		Self {
			enabled: false,
			database_url: None,
			event_ttl: Duration::from_secs(DEFAULT_EVENT_TTL_SECS),
		}
	}
}

#[derive(Debug, Clone)]
pub struct IngestSettings {
	pub max_payload_bytes: usize,
	pub rate_limit_per_sec: u32,
	/// Bucket capacity; 0 means twice the rate.
	pub rate_limit_burst: u32,
}

impl Default for IngestSettings {
	fn default() -> Self {
		Self {
			max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
			rate_limit_per_sec: DEFAULT_RATE_PER_SEC,
			rate_limit_burst: DEFAULT_BURST,
		}
	}
}

#[derive(Debug, Clone)]
pub struct AggregationSettings {
	pub windows_ms: Vec<u64>,
	pub persist_debounce: Duration,
	/// Eviction horizon for in-memory accumulators.
	pub retention: Duration,
	/// Cadence of the eviction and event purge sweep.
	pub sweep_interval: Duration,
}

impl Default for AggregationSettings {
	fn default() -> Self {
		Self {
			windows_ms: DEFAULT_WINDOWS_MS.to_vec(),
			persist_debounce: DEFAULT_PERSIST_DEBOUNCE,
			retention: DEFAULT_RETENTION,
			sweep_interval: Duration::from_secs(30),
		}
	}
}

impl AggregationSettings {
	pub fn engine_config(&self) -> AggregationConfig {
		AggregationConfig {
			windows_ms: self.windows_ms.clone(),
			persist_debounce: self.persist_debounce,
			retention: self.retention,
		}
	}
}

#[derive(Debug, Clone)]
pub struct BroadcastSettings {
	pub subscriber_queue_capacity: usize,
	/// Room joined when `join-dashboard` names none.
	pub default_room: String,
}

impl Default for BroadcastSettings {
	fn default() -> Self {
		Self {
			subscriber_queue_capacity: 256,
			default_room: DEFAULT_ROOM.to_string(),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	auth: FileAuthSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	ingest: FileIngestSettings,

	#[serde(default)]
	aggregation: FileAggregationSettings,

	#[serde(default)]
	broadcast: FileBroadcastSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	http_bind: Option<String>,
	ws_bind: Option<String>,
	metrics_bind: Option<String>,
	shutdown_flush_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAuthSettings {
	auth_token: Option<String>,
	jwt_secret: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
	event_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileIngestSettings {
	max_payload_bytes: Option<usize>,
	rate_limit_per_sec: Option<u32>,
	rate_limit_burst: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAggregationSettings {
	windows_ms: Option<Vec<u64>>,
	persist_debounce_ms: Option<u64>,
	retention_secs: Option<u64>,
	sweep_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileBroadcastSettings {
	subscriber_queue_capacity: Option<usize>,
	default_room: Option<String>,
}

fn non_blank(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn parse_bind(field: &str, v: Option<String>, default: SocketAddr) -> SocketAddr {
	match non_blank(v) {
		Some(s) => s.parse().unwrap_or_else(|e| {
			warn!(error = %e, value = %s, field, "invalid bind address (expected host:port); using default");
			default
		}),
		None => default,
	}
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ServerSettings::default();

		let mut windows_ms = file
			.aggregation
			.windows_ms
			.unwrap_or_else(|| DEFAULT_WINDOWS_MS.to_vec())
			.into_iter()
			.filter(|w| *w > 0)
			.collect::<Vec<_>>();
		windows_ms.sort_unstable();
		windows_ms.dedup();
		if windows_ms.is_empty() {
			warn!("aggregation config: no usable windows_ms; using defaults");
			windows_ms = DEFAULT_WINDOWS_MS.to_vec();
		}

		Self {
			server: ServerSettings {
				http_bind: parse_bind("http_bind", file.server.http_bind, defaults.http_bind),
				ws_bind: parse_bind("ws_bind", file.server.ws_bind, defaults.ws_bind),
				metrics_bind: non_blank(file.server.metrics_bind),
				shutdown_flush_timeout: file
					.server
					.shutdown_flush_timeout_secs
					.map(Duration::from_secs)
					.unwrap_or(defaults.shutdown_flush_timeout),
			},
			auth: AuthSettings {
				auth_token: non_blank(file.auth.auth_token).map(SecretString::new),
				jwt_secret: non_blank(file.auth.jwt_secret).map(SecretString::new),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: non_blank(file.persistence.database_url),
				event_ttl: Duration::from_secs(file.persistence.event_ttl_secs.unwrap_or(DEFAULT_EVENT_TTL_SECS)),
			},
			ingest: IngestSettings {
				max_payload_bytes: file
					.ingest
					.max_payload_bytes
					.filter(|v| *v > 0)
					.unwrap_or(DEFAULT_MAX_PAYLOAD_BYTES),
				rate_limit_per_sec: file.ingest.rate_limit_per_sec.unwrap_or(DEFAULT_RATE_PER_SEC),
				rate_limit_burst: file.ingest.rate_limit_burst.unwrap_or(DEFAULT_BURST),
			},
			aggregation: AggregationSettings {
				windows_ms,
				persist_debounce: file
					.aggregation
					.persist_debounce_ms
					.map(Duration::from_millis)
					.unwrap_or(DEFAULT_PERSIST_DEBOUNCE),
				retention: file
					.aggregation
					.retention_secs
					.map(Duration::from_secs)
					.unwrap_or(DEFAULT_RETENTION),
				sweep_interval: Duration::from_secs(file.aggregation.sweep_interval_secs.unwrap_or(30).max(1)),
			},
			broadcast: BroadcastSettings {
				subscriber_queue_capacity: file
					.broadcast
					.subscriber_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(256),
				default_room: non_blank(file.broadcast.default_room).unwrap_or_else(|| DEFAULT_ROOM.to_string()),
			},
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("PULSE_HTTP_BIND")
		&& let Ok(addr) = v.trim().parse::<SocketAddr>()
	{
		cfg.server.http_bind = addr;
		info!(%addr, "server config: http_bind overridden by env");
	}

	if let Ok(v) = std::env::var("PULSE_WS_BIND")
		&& let Ok(addr) = v.trim().parse::<SocketAddr>()
	{
		cfg.server.ws_bind = addr;
		info!(%addr, "server config: ws_bind overridden by env");
	}

	if let Ok(v) = std::env::var("PULSE_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PULSE_SHUTDOWN_FLUSH_TIMEOUT_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.server.shutdown_flush_timeout = Duration::from_secs(secs);
		info!(secs, "server config: shutdown_flush_timeout overridden by env");
	}

	if let Ok(v) = std::env::var("PULSE_AUTH_TOKEN") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.auth.auth_token = Some(SecretString::new(v));
			info!("server auth: auth_token overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PULSE_JWT_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.auth.jwt_secret = Some(SecretString::new(v));
			info!("server auth: jwt_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PULSE_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Ok(v) = std::env::var("PULSE_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = Some(v);
			info!("persistence: database_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PULSE_EVENT_TTL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.persistence.event_ttl = Duration::from_secs(secs);
		info!(secs, "persistence: event_ttl overridden by env");
	}

	if let Ok(v) = std::env::var("PULSE_MAX_PAYLOAD_BYTES")
		&& let Ok(bytes) = v.trim().parse::<usize>()
		&& bytes > 0
	{
		cfg.ingest.max_payload_bytes = bytes;
		info!(bytes, "ingest config: max_payload_bytes overridden by env");
	}

	if let Ok(v) = std::env::var("PULSE_RATE_LIMIT_PER_SEC")
		&& let Ok(rate) = v.trim().parse::<u32>()
	{
		cfg.ingest.rate_limit_per_sec = rate;
		info!(rate, "ingest config: rate_limit_per_sec overridden by env");
	}

	if let Ok(v) = std::env::var("PULSE_RATE_LIMIT_BURST")
		&& let Ok(burst) = v.trim().parse::<u32>()
	{
		cfg.ingest.rate_limit_burst = burst;
		info!(burst, "ingest config: rate_limit_burst overridden by env");
	}

	if let Ok(v) = std::env::var("PULSE_PERSIST_DEBOUNCE_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.aggregation.persist_debounce = Duration::from_millis(ms);
		info!(ms, "aggregation config: persist_debounce overridden by env");
	}

	if let Ok(v) = std::env::var("PULSE_RETENTION_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.aggregation.retention = Duration::from_secs(secs);
		info!(secs, "aggregation config: retention overridden by env");
	}

	if let Ok(v) = std::env::var("PULSE_DEFAULT_ROOM") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.broadcast.default_room = v;
			info!("broadcast config: default_room overridden by env");
		}
	}

	if cfg.ingest.rate_limit_per_sec == 0 {
		warn!("ingest config: rate_limit_per_sec is 0; using default");
		cfg.ingest.rate_limit_per_sec = DEFAULT_RATE_PER_SEC;
	}

	if cfg.persistence.enabled && cfg.persistence.database_url.is_none() {
		warn!("persistence enabled but no database_url configured");
	}
}
