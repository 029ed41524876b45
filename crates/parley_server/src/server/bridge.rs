#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt as _;
use parley_domain::{Message, StoreKey};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::server::hub::HubHandle;
use crate::server::store::{MessageStore, StoreEvent};
use crate::util::shutdown::{ShutdownRx, wait_for_shutdown};

/// Settings for the pub/sub bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
	pub pattern: String,

	pub reconnect_min: Duration,
	pub reconnect_max: Duration,

	pub debug_log_events: bool,
}

impl Default for BridgeConfig {
	fn default() -> Self {
		Self {
			pattern: StoreKey::ALL_ROOMS.to_string(),
			reconnect_min: Duration::from_millis(250),
			reconnect_max: Duration::from_secs(10),
			debug_log_events: false,
		}
	}
}

/// Forwards room events from the shared store into the local hub.
pub struct PubSubBridge {
	cfg: BridgeConfig,
	store: Arc<dyn MessageStore>,
	hub: HubHandle,
}

impl PubSubBridge {
	pub fn new(store: Arc<dyn MessageStore>, hub: HubHandle, cfg: BridgeConfig) -> Self {
		Self { cfg, store, hub }
	}

	/// Run until shutdown or until the hub stops. Lost subscriptions are re-established with backoff.
	pub async fn run(self, mut shutdown: ShutdownRx) {
		info!(pattern = %self.cfg.pattern, "pubsub bridge started");

		let stop = wait_for_shutdown(&mut shutdown);
		tokio::pin!(stop);

		let mut backoff = self.cfg.reconnect_min;

		loop {
			let subscribed = tokio::select! {
				_ = &mut stop => break,
				res = self.store.subscribe(&self.cfg.pattern) => res,
			};

			match subscribed {
				Ok(mut events) => {
					debug!(pattern = %self.cfg.pattern, "pubsub bridge subscribed");
					backoff = self.cfg.reconnect_min;

					loop {
						tokio::select! {
							_ = &mut stop => {
								info!("pubsub bridge exiting (shutdown)");
								return;
							}
							ev = events.next() => {
								let Some(ev) = ev else {
									warn!("pubsub subscription ended; resubscribing");
									break;
								};
								if !self.forward(ev).await {
									info!("pubsub bridge exiting (hub stopped)");
									return;
								}
							}
						}
					}
				}
				Err(e) => {
					metrics::counter!("parley_server_bridge_subscribe_errors_total").increment(1);
					warn!(error = %e, retry_in_ms = backoff.as_millis() as u64, "pubsub subscribe failed");
				}
			}

			tokio::select! {
				_ = &mut stop => break,
				_ = tokio::time::sleep(backoff) => {}
			}
			backoff = backoff.saturating_mul(2).min(self.cfg.reconnect_max);
		}

		info!("pubsub bridge exiting (shutdown)");
	}

	/// Returns `false` once the hub is gone.
	async fn forward(&self, ev: StoreEvent) -> bool {
		let message = match serde_json::from_str::<Message>(&ev.payload) {
			Ok(message) => message,
			Err(e) => {
				metrics::counter!("parley_server_bridge_malformed_total").increment(1);
				warn!(topic = %ev.topic, error = %e, "skipping malformed pubsub payload");
				return true;
			}
		};

		match StoreKey::parse_room_channel(&ev.topic) {
			Ok(room) if message.room().is_some_and(|r| r != &room) => {
				metrics::counter!("parley_server_bridge_malformed_total").increment(1);
				warn!(topic = %ev.topic, room = ?message.room(), "message room does not match its channel; skipping");
				return true;
			}
			Ok(_) => {}
			Err(e) => {
				metrics::counter!("parley_server_bridge_malformed_total").increment(1);
				warn!(topic = %ev.topic, error = %e, "event on a non-room channel; skipping");
				return true;
			}
		}

		if self.cfg.debug_log_events {
			debug!(topic = %ev.topic, sender = %message.sender(), direct = message.is_direct(), "bridging event to hub");
		}

		metrics::counter!("parley_server_bridge_events_total").increment(1);
		self.hub.broadcast(message).await.is_ok()
	}
}

/// Spawn the bridge as a background task.
pub fn spawn_pubsub_bridge(
	store: Arc<dyn MessageStore>,
	hub: HubHandle,
	cfg: BridgeConfig,
	shutdown: ShutdownRx,
) -> JoinHandle<()> {
	let bridge = PubSubBridge::new(store, hub, cfg);
	tokio::spawn(bridge.run(shutdown))
}
