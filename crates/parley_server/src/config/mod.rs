#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use parley_domain::RoomId;
use parley_util::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.parley/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".parley").join("config.toml"))
}

/// Load the server config from TOML and `PARLEY_*` env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg, |name| std::env::var(name).ok());

	Ok(cfg)
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub auth: AuthSettings,
	pub store: StoreSettings,
	pub bridge: BridgeSettings,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self::from_file(FileConfig::default())
	}
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// WebSocket listen endpoint (`ws://host:port`); the CLI flag wins.
	pub bind: Option<String>,
	/// Health/readiness and token endpoint bind address (host:port).
	pub http_bind: Option<String>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	pub hub_queue_capacity: usize,
	pub outbound_queue_capacity: usize,
	pub max_frame_bytes: usize,
	/// Inbound frame rate limiting: burst size. Zero disables.
	pub rate_limit_burst: u32,
	/// Inbound frame rate limiting: frames per minute. Zero disables.
	pub rate_limit_per_minute: u32,
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
	pub access_secret: Option<SecretString>,
	pub refresh_secret: Option<SecretString>,
	pub access_ttl: Duration,
	pub refresh_ttl: Duration,
	pub issuer: String,
	pub login_password: SecretString,
	pub default_rooms: Vec<String>,
}

impl AuthSettings {
	pub fn default_room_ids(&self) -> anyhow::Result<Vec<RoomId>> {
		let rooms = self
			.default_rooms
			.iter()
			.map(|r| RoomId::new(r.trim()).with_context(|| format!("invalid default room {r:?}")))
			.collect::<anyhow::Result<Vec<_>>>()?;
		if rooms.is_empty() {
			return Err(anyhow!("auth.default_rooms must name at least one room"));
		}
		Ok(rooms)
	}
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
	/// Redis URL; unset means the in-memory single-instance store.
	pub redis_url: Option<String>,
	pub history_max_len: usize,
	pub history_fetch_limit: usize,
	pub history_ttl: Duration,
	pub unread_ttl: Duration,
	pub persist_queue_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct BridgeSettings {
	pub pattern: String,
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
	/// Log every forwarded event at debug level.
	pub debug_log_events: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	auth: FileAuthSettings,

	#[serde(default)]
	store: FileStoreSettings,

	#[serde(default)]
	bridge: FileBridgeSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	http_bind: Option<String>,
	metrics_bind: Option<String>,
	hub_queue_capacity: Option<usize>,
	outbound_queue_capacity: Option<usize>,
	max_frame_bytes: Option<usize>,
	rate_limit_burst: Option<u32>,
	rate_limit_per_minute: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAuthSettings {
	access_secret: Option<String>,
	refresh_secret: Option<String>,
	access_ttl_minutes: Option<u64>,
	refresh_ttl_hours: Option<u64>,
	issuer: Option<String>,
	login_password: Option<String>,
	default_rooms: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileStoreSettings {
	redis_url: Option<String>,
	history_max_len: Option<usize>,
	history_fetch_limit: Option<usize>,
	history_ttl_hours: Option<u64>,
	unread_ttl_hours: Option<u64>,
	persist_queue_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileBridgeSettings {
	pattern: Option<String>,
	reconnect_min_delay_ms: Option<u64>,
	reconnect_max_delay_ms: Option<u64>,
	debug_log_events: Option<bool>,
}

fn non_blank(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

const HOUR: u64 = 60 * 60;

fn minutes(n: u64) -> Duration {
	Duration::from_secs(n.saturating_mul(60))
}

fn hours(n: u64) -> Duration {
	Duration::from_secs(n.saturating_mul(HOUR))
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let server = ServerSettings {
			bind: non_blank(file.server.bind),
			http_bind: non_blank(file.server.http_bind),
			metrics_bind: non_blank(file.server.metrics_bind),
			hub_queue_capacity: file.server.hub_queue_capacity.unwrap_or(1024).max(1),
			outbound_queue_capacity: file.server.outbound_queue_capacity.unwrap_or(256).max(1),
			max_frame_bytes: file.server.max_frame_bytes.unwrap_or(64 * 1024),
			rate_limit_burst: file.server.rate_limit_burst.unwrap_or(20),
			rate_limit_per_minute: file.server.rate_limit_per_minute.unwrap_or(120),
		};

		let auth = AuthSettings {
			access_secret: non_blank(file.auth.access_secret).map(SecretString::new),
			refresh_secret: non_blank(file.auth.refresh_secret).map(SecretString::new),
			access_ttl: minutes(file.auth.access_ttl_minutes.unwrap_or(5)),
			refresh_ttl: hours(file.auth.refresh_ttl_hours.unwrap_or(24)),
			issuer: non_blank(file.auth.issuer).unwrap_or_else(|| "chat-app".to_string()),
			login_password: SecretString::new(file.auth.login_password.unwrap_or_else(|| "1234".to_string())),
			default_rooms: file
				.auth
				.default_rooms
				.filter(|rooms| !rooms.is_empty())
				.unwrap_or_else(|| vec!["default".to_string(), "vip".to_string()]),
		};

		let store = StoreSettings {
			redis_url: non_blank(file.store.redis_url),
			history_max_len: file.store.history_max_len.unwrap_or(50),
			history_fetch_limit: file.store.history_fetch_limit.unwrap_or(50),
			history_ttl: hours(file.store.history_ttl_hours.unwrap_or(6)),
			unread_ttl: hours(file.store.unread_ttl_hours.unwrap_or(24)),
			persist_queue_capacity: file.store.persist_queue_capacity.unwrap_or(1024).max(1),
		};

		let mut bridge = BridgeSettings {
			pattern: non_blank(file.bridge.pattern).unwrap_or_else(|| "chat:*".to_string()),
			reconnect_min_delay: Duration::from_millis(file.bridge.reconnect_min_delay_ms.unwrap_or(250)),
			reconnect_max_delay: Duration::from_millis(file.bridge.reconnect_max_delay_ms.unwrap_or(10_000)),
			debug_log_events: file.bridge.debug_log_events.unwrap_or(false),
		};
		normalize_backoff(&mut bridge);

		Self {
			server,
			auth,
			store,
			bridge,
		}
	}
}

fn normalize_backoff(bridge: &mut BridgeSettings) {
	if bridge.reconnect_min_delay > bridge.reconnect_max_delay {
		warn!(
			min_ms = bridge.reconnect_min_delay.as_millis() as u64,
			max_ms = bridge.reconnect_max_delay.as_millis() as u64,
			"bridge config: reconnect_min_delay > reconnect_max_delay; swapping"
		);
		std::mem::swap(&mut bridge.reconnect_min_delay, &mut bridge.reconnect_max_delay);
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

fn env_string(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
	non_blank(lookup(name))
}

fn env_parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
	let raw = env_string(lookup, name)?;
	match raw.parse() {
		Ok(v) => Some(v),
		Err(_) => {
			warn!(env = name, value = %raw, "ignoring unparsable env override");
			None
		}
	}
}

/// Apply `PARLEY_*` overrides. `lookup` is `std::env::var` in production.
fn apply_env_overrides(cfg: &mut ServerConfig, lookup: impl Fn(&str) -> Option<String>) {
	if let Some(v) = env_string(&lookup, "PARLEY_BIND") {
		cfg.server.bind = Some(v);
		info!("server config: bind overridden by env");
	}

	if let Some(v) = env_string(&lookup, "PARLEY_HTTP_BIND") {
		cfg.server.http_bind = Some(v);
		info!("server config: http_bind overridden by env");
	}

	if let Some(v) = env_string(&lookup, "PARLEY_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(bytes) = env_parse::<usize>(&lookup, "PARLEY_MAX_FRAME_BYTES") {
		cfg.server.max_frame_bytes = bytes;
		info!(bytes, "server config: max_frame_bytes overridden by env");
	}

	if let Some(burst) = env_parse::<u32>(&lookup, "PARLEY_RATE_LIMIT_BURST") {
		cfg.server.rate_limit_burst = burst;
		info!(burst, "server config: rate_limit_burst overridden by env");
	}

	if let Some(rate) = env_parse::<u32>(&lookup, "PARLEY_RATE_LIMIT_PER_MINUTE") {
		cfg.server.rate_limit_per_minute = rate;
		info!(rate, "server config: rate_limit_per_minute overridden by env");
	}

	if let Some(v) = env_string(&lookup, "PARLEY_ACCESS_SECRET") {
		cfg.auth.access_secret = Some(SecretString::new(v));
		info!("server auth: access_secret overridden by env");
	}

	if let Some(v) = env_string(&lookup, "PARLEY_REFRESH_SECRET") {
		cfg.auth.refresh_secret = Some(SecretString::new(v));
		info!("server auth: refresh_secret overridden by env");
	}

	if let Some(n) = env_parse::<u64>(&lookup, "PARLEY_ACCESS_TTL_MINUTES") {
		cfg.auth.access_ttl = minutes(n);
		info!(minutes = n, "server auth: access_ttl overridden by env");
	}

	if let Some(n) = env_parse::<u64>(&lookup, "PARLEY_REFRESH_TTL_HOURS") {
		cfg.auth.refresh_ttl = hours(n);
		info!(hours = n, "server auth: refresh_ttl overridden by env");
	}

	if let Some(v) = env_string(&lookup, "PARLEY_LOGIN_PASSWORD") {
		cfg.auth.login_password = SecretString::new(v);
		info!("server auth: login_password overridden by env");
	}

	if let Some(v) = env_string(&lookup, "PARLEY_DEFAULT_ROOMS") {
		let rooms: Vec<String> = v
			.split(',')
			.map(str::trim)
			.filter(|r| !r.is_empty())
			.map(str::to_string)
			.collect();
		if !rooms.is_empty() {
			info!(rooms = ?rooms, "server auth: default_rooms overridden by env");
			cfg.auth.default_rooms = rooms;
		}
	}

	if let Some(v) = env_string(&lookup, "PARLEY_REDIS_URL") {
		cfg.store.redis_url = Some(v);
		info!("store config: redis_url overridden by env");
	}

	if let Some(len) = env_parse::<usize>(&lookup, "PARLEY_HISTORY_MAX_LEN") {
		cfg.store.history_max_len = len;
		info!(len, "store config: history_max_len overridden by env");
	}

	if let Some(ms) = env_parse::<u64>(&lookup, "PARLEY_BRIDGE_RECONNECT_MIN_DELAY_MS") {
		cfg.bridge.reconnect_min_delay = Duration::from_millis(ms);
		info!(ms, "bridge config: reconnect_min_delay overridden by env");
	}

	if let Some(ms) = env_parse::<u64>(&lookup, "PARLEY_BRIDGE_RECONNECT_MAX_DELAY_MS") {
		cfg.bridge.reconnect_max_delay = Duration::from_millis(ms);
		info!(ms, "bridge config: reconnect_max_delay overridden by env");
	}

	if let Some(enabled) = env_parse::<bool>(&lookup, "PARLEY_BRIDGE_DEBUG_LOG_EVENTS") {
		cfg.bridge.debug_log_events = enabled;
		info!(enabled, "bridge config: debug_log_events overridden by env");
	}

	normalize_backoff(&mut cfg.bridge);

	if cfg.store.redis_url.is_some() {
		info!("store config: redis backend selected");
	} else {
		info!("store config: no redis_url; using in-memory store (single instance only)");
	}
}
