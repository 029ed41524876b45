#![forbid(unsafe_code)]

mod config;
mod server;
mod util;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use parley_util::SecretString;
use parley_util::endpoint::parse_ws_bind;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::ServerConfig;
use crate::server::auth::{HmacTokenGate, TokenGate, TokenSettings};
use crate::server::bridge::{BridgeConfig, spawn_pubsub_bridge};
use crate::server::connection::{ConnectionSettings, Gateway};
use crate::server::http::{HealthState, HttpState, LoginPolicy, spawn_http_server};
use crate::server::hub::{HubConfig, spawn_hub};
use crate::server::persist::StoreWriter;
use crate::server::redis_store::RedisMessageStore;
use crate::server::store::{InMemoryMessageStore, MessageStore, RetentionPolicy, spawn_expiry_sweeper};

const DEFAULT_BIND: &str = "ws://127.0.0.1:8080";

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: parley_server [--bind ws://host:port]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default: {DEFAULT_BIND}, or server.bind from config)\n\
\t         Format: ws://host:port\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<String> {
	let mut bind_endpoint = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected ws://host:port)");
					usage_and_exit();
				}
				bind_endpoint = Some(v);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	bind_endpoint
}

fn resolve_bind(endpoint: &str) -> SocketAddr {
	parse_ws_bind(endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	})
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,parley_server=debug".to_string());

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
				let tracer = tracer_provider.tracer("parley_server");
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

fn secret_or_dev_default(secret: Option<&SecretString>, name: &str) -> SecretString {
	match secret {
		Some(s) => s.clone(),
		None => {
			warn!(secret = name, "no secret configured; using an insecure development default");
			SecretString::new(format!("parley-dev-{name}"))
		}
	}
}

async fn open_store(cfg: &ServerConfig, shutdown: &watch::Receiver<bool>) -> anyhow::Result<Arc<dyn MessageStore>> {
	match cfg.store.redis_url.as_deref() {
		Some(url) => {
			let store = RedisMessageStore::connect(url).await?;
			Ok(Arc::new(store))
		}
		None => {
			let store = Arc::new(InMemoryMessageStore::default());
			spawn_expiry_sweeper(store.clone(), Duration::from_secs(60), shutdown.clone());
			Ok(store)
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let cli_bind = parse_args();

	let config_path = crate::config::default_config_path()?;
	let cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	let bind_addr = resolve_bind(
		cli_bind
			.as_deref()
			.or(cfg.server.bind.as_deref())
			.unwrap_or(DEFAULT_BIND),
	);

	init_metrics(cfg.server.metrics_bind.as_deref());

	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			info!("shutdown requested");
			let _ = shutdown_tx.send(true);
		}
	});

	let default_rooms = cfg.auth.default_room_ids()?;
	let tokens: Arc<dyn TokenGate> = Arc::new(HmacTokenGate::new(TokenSettings {
		access_secret: secret_or_dev_default(cfg.auth.access_secret.as_ref(), "access"),
		refresh_secret: secret_or_dev_default(cfg.auth.refresh_secret.as_ref(), "refresh"),
		access_ttl: cfg.auth.access_ttl,
		refresh_ttl: cfg.auth.refresh_ttl,
		issuer: cfg.auth.issuer.clone(),
	}));

	let store = open_store(&cfg, &shutdown_rx).await.context("open message store")?;

	let retention = RetentionPolicy {
		history_max_len: cfg.store.history_max_len,
		history_fetch_limit: cfg.store.history_fetch_limit,
		history_ttl: cfg.store.history_ttl,
		unread_ttl: cfg.store.unread_ttl,
	};

	let writer = StoreWriter::spawn(store.clone(), cfg.store.persist_queue_capacity);
	let hub = spawn_hub(
		HubConfig {
			command_queue_capacity: cfg.server.hub_queue_capacity,
			unread_ttl: retention.unread_ttl,
		},
		store.clone(),
		writer,
		shutdown_rx.clone(),
	);

	let _bridge = spawn_pubsub_bridge(
		store.clone(),
		hub.clone(),
		BridgeConfig {
			pattern: cfg.bridge.pattern.clone(),
			reconnect_min: cfg.bridge.reconnect_min_delay,
			reconnect_max: cfg.bridge.reconnect_max_delay,
			debug_log_events: cfg.bridge.debug_log_events,
		},
		shutdown_rx.clone(),
	);

	let health = HealthState::new();
	if let Some(bind) = cfg.server.http_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => spawn_http_server(
				addr,
				HttpState {
					health: health.clone(),
					tokens: tokens.clone(),
					login: LoginPolicy {
						password: cfg.auth.login_password.clone(),
						rooms: default_rooms,
					},
				},
			),
			Err(e) => warn!(error = %e, %bind, "invalid http bind address (expected host:port)"),
		}
	}

	let gateway = Gateway::new(
		hub,
		store,
		tokens,
		ConnectionSettings {
			outbound_capacity: cfg.server.outbound_queue_capacity,
			max_frame_bytes: cfg.server.max_frame_bytes,
			rate_limit_burst: cfg.server.rate_limit_burst,
			rate_limit_per_minute: cfg.server.rate_limit_per_minute,
			retention,
			..ConnectionSettings::default()
		},
	);

	let listener = TcpListener::bind(bind_addr)
		.await
		.with_context(|| format!("bind {bind_addr}"))?;
	info!(bind = %bind_addr, "parley_server: websocket endpoint ready");
	health.mark_ready();

	crate::server::listener::serve(listener, gateway, shutdown_rx).await
}
