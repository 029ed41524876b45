#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::SplitSink;
use futures::{SinkExt as _, StreamExt as _};
use parley_domain::{IncomingFrame, Message, Notice, OutgoingFrame, RoomId, StoreKey, UserId};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};

use crate::server::auth::TokenGate;
use crate::server::hub::{ConnectionId, DEFAULT_OUTBOUND_CAPACITY, HubHandle, Member};
use crate::server::store::{MessageStore, RetentionPolicy};

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub outbound_capacity: usize,

	/// Text frames larger than this are skipped.
	pub max_frame_bytes: usize,

	pub rate_limit_burst: u32,
	pub rate_limit_per_minute: u32,

	pub retention: RetentionPolicy,

	/// How long the writer gets to flush after the reader ends.
	pub writer_grace: Duration,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
			max_frame_bytes: 64 * 1024,
			rate_limit_burst: 0,
			rate_limit_per_minute: 0,
			retention: RetentionPolicy::default(),
			writer_grace: Duration::from_secs(5),
		}
	}
}

/// Why a connection was turned away before joining the hub.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Rejection {
	#[error("missing or invalid credentials")]
	Unauthorized,
	#[error("room not granted: {0}")]
	Forbidden(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
	#[error(transparent)]
	Rejected(#[from] Rejection),
	#[error("hub is not running")]
	HubClosed,
}

/// An authorized principal bound to one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
	pub user: UserId,
	pub room: RoomId,
}

/// Connection handler: authorizes, registers with the hub and runs the reader and writer loops.
#[derive(Clone)]
pub struct Gateway {
	hub: HubHandle,
	store: Arc<dyn MessageStore>,
	tokens: Arc<dyn TokenGate>,
	settings: ConnectionSettings,
}

impl Gateway {
	pub fn new(
		hub: HubHandle,
		store: Arc<dyn MessageStore>,
		tokens: Arc<dyn TokenGate>,
		settings: ConnectionSettings,
	) -> Self {
		Self {
			hub,
			store,
			tokens,
			settings,
		}
	}

	#[cfg(test)]
	pub(crate) fn hub(&self) -> &HubHandle {
		&self.hub
	}

	/// Check the bearer credential and the requested room.
	///
	/// The `Bearer ` prefix is optional. A missing or blank room means the default room.
	pub fn authorize(&self, bearer: Option<&str>, room: Option<&str>) -> Result<Grant, Rejection> {
		let token = bearer
			.map(|b| b.trim())
			.map(|b| b.strip_prefix("Bearer ").unwrap_or(b).trim())
			.filter(|b| !b.is_empty())
			.ok_or(Rejection::Unauthorized)?;

		let access = self.tokens.validate_access(token).map_err(|e| {
			debug!(error = %e, "access token rejected");
			Rejection::Unauthorized
		})?;

		let room = match room.map(str::trim).filter(|r| !r.is_empty()) {
			None => RoomId::default_room(),
			Some(raw) => RoomId::new(raw).map_err(|_| Rejection::Forbidden(raw.to_string()))?,
		};

		if !access.allows(&room) {
			return Err(Rejection::Forbidden(room.into_string()));
		}

		Ok(Grant {
			user: access.user,
			room,
		})
	}

	/// Authorize an already-upgraded stream and run its session.
	///
	/// Rejected streams get a policy close frame and never reach the hub.
	pub async fn handle_connection<S>(
		&self,
		mut ws: WebSocketStream<S>,
		bearer: Option<&str>,
		room: Option<&str>,
	) -> Result<(), SessionError>
	where
		S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
	{
		let grant = match self.authorize(bearer, room) {
			Ok(grant) => grant,
			Err(rejection) => {
				metrics::counter!("parley_server_rejected_connections_total").increment(1);
				let frame = CloseFrame {
					code: CloseCode::Policy,
					reason: rejection.to_string().into(),
				};
				if let Err(e) = ws.close(Some(frame)).await {
					debug!(error = %e, "failed to send rejection close frame");
				}
				return Err(rejection.into());
			}
		};

		self.run_session(ws, grant).await
	}

	async fn run_session<S>(&self, ws: WebSocketStream<S>, grant: Grant) -> Result<(), SessionError>
	where
		S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
	{
		struct ConnectionGaugeGuard;
		impl Drop for ConnectionGaugeGuard {
			fn drop(&mut self) {
				metrics::gauge!("parley_server_active_sessions").decrement(1.0);
			}
		}

		metrics::gauge!("parley_server_active_sessions").increment(1.0);
		let _guard = ConnectionGaugeGuard;

		let id = ConnectionId::next();
		let Grant { user, room } = grant;
		info!(conn = %id, user = %user, room = %room, "session started");

		let (sink, mut stream) = ws.split();
		let (tx, rx) = mpsc::channel::<OutgoingFrame>(self.settings.outbound_capacity.max(1));
		let mut writer = tokio::spawn(write_loop(id, sink, rx));

		let member = Member {
			id,
			user: user.clone(),
			room: Some(room.clone()),
			outbound: tx.clone(),
		};
		if self.hub.register(member).await.is_err() {
			warn!(conn = %id, "hub is not running; dropping session");
			return Err(SessionError::HubClosed);
		}

		self.enqueue_backlog(id, &room, &tx).await;
		drop(tx);

		let mut limiter = FrameRateLimiter::new(self.settings.rate_limit_burst, self.settings.rate_limit_per_minute);

		while let Some(frame) = stream.next().await {
			let frame = match frame {
				Ok(frame) => frame,
				Err(e) => {
					debug!(conn = %id, error = %e, "websocket read ended");
					break;
				}
			};

			match frame {
				WsMessage::Text(text) => {
					self.on_text(id, &user, &room, text.as_str(), &mut limiter).await;
				}
				WsMessage::Close(_) => break,
				WsMessage::Binary(_) => {
					metrics::counter!("parley_server_frames_skipped_total", "reason" => "binary").increment(1);
					debug!(conn = %id, "binary frame ignored");
				}
				_ => {}
			}
		}

		if self.hub.unregister(id).await.is_err() {
			debug!(conn = %id, "hub already stopped at unregister");
		}

		match tokio::time::timeout(self.settings.writer_grace, &mut writer).await {
			Ok(_) => {}
			Err(_) => {
				warn!(conn = %id, "writer did not finish in time; aborting");
				writer.abort();
			}
		}

		info!(conn = %id, user = %user, room = %room, "session ended");
		Ok(())
	}

	/// Room history (oldest first) followed by the connected notice.
	async fn enqueue_backlog(&self, id: ConnectionId, room: &RoomId, tx: &mpsc::Sender<OutgoingFrame>) {
		let key = StoreKey::room_history(room);
		let history = match self
			.store
			.read_recent(&key, Some(self.settings.retention.history_fetch_limit))
			.await
		{
			Ok(history) => history,
			Err(e) => {
				warn!(conn = %id, room = %room, error = %e, "failed to load room history");
				Vec::new()
			}
		};

		for message in history {
			if tx.send(OutgoingFrame::Chat(message)).await.is_err() {
				return;
			}
		}

		let _ = tx.send(Notice::connected(room).into()).await;
	}

	async fn on_text(&self, id: ConnectionId, user: &UserId, room: &RoomId, text: &str, limiter: &mut FrameRateLimiter) {
		metrics::counter!("parley_server_frames_in_total").increment(1);

		if text.len() > self.settings.max_frame_bytes {
			metrics::counter!("parley_server_frames_skipped_total", "reason" => "oversized").increment(1);
			debug!(conn = %id, len = text.len(), "oversized frame skipped");
			return;
		}

		if !limiter.allow() {
			metrics::counter!("parley_server_frames_skipped_total", "reason" => "rate_limited").increment(1);
			debug!(conn = %id, "frame over rate limit skipped");
			return;
		}

		let incoming: IncomingFrame = match serde_json::from_str(text) {
			Ok(frame) => frame,
			Err(e) => {
				metrics::counter!("parley_server_frames_skipped_total", "reason" => "malformed").increment(1);
				debug!(conn = %id, error = %e, "malformed frame skipped");
				return;
			}
		};

		let message = Message::new(
			user.clone(),
			incoming.content,
			chrono::Utc::now(),
			Some(room.clone()),
			incoming.target,
		);

		if let Err(e) = self.store.publish(&StoreKey::room_channel(room), &message).await {
			metrics::counter!("parley_server_store_errors_total", "op" => "publish").increment(1);
			warn!(conn = %id, room = %room, error = %e, "publish failed");
		}

		let retention = &self.settings.retention;
		if let Err(e) = self
			.store
			.append_bounded(
				&StoreKey::room_history(room),
				&message,
				Some(retention.history_max_len),
				retention.history_ttl,
			)
			.await
		{
			metrics::counter!("parley_server_store_errors_total", "op" => "history").increment(1);
			warn!(conn = %id, room = %room, error = %e, "history write failed");
		}
	}
}

/// Drain the outbound queue onto the socket, then close it.
async fn write_loop<S>(id: ConnectionId, mut sink: SplitSink<WebSocketStream<S>, WsMessage>, mut rx: mpsc::Receiver<OutgoingFrame>)
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	while let Some(frame) = rx.recv().await {
		let json = match serde_json::to_string(&frame) {
			Ok(json) => json,
			Err(e) => {
				warn!(conn = %id, error = %e, "failed to encode outbound frame");
				continue;
			}
		};

		if let Err(e) = sink.send(WsMessage::text(json)).await {
			debug!(conn = %id, error = %e, "websocket write failed; closing");
			let _ = sink.close().await;
			return;
		}
		metrics::counter!("parley_server_frames_out_total").increment(1);
	}

	match sink.close().await {
		Ok(()) | Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {}
		Err(e) => debug!(conn = %id, error = %e, "close after drain failed"),
	}
}

#[derive(Debug, Clone)]
struct TokenBucket {
	capacity: f64,
	tokens: f64,
	refill_per_sec: f64,
	last: Instant,
}

impl TokenBucket {
	fn new(capacity: u32, refill_per_minute: u32) -> Option<Self> {
		if capacity == 0 || refill_per_minute == 0 {
			return None;
		}
		Some(Self {
			capacity: capacity as f64,
			tokens: capacity as f64,
			refill_per_sec: refill_per_minute as f64 / 60.0,
			last: Instant::now(),
		})
	}

	fn allow_at(&mut self, now: Instant) -> bool {
		let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
		if elapsed > 0.0 {
			self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
			self.last = now;
		}
		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			true
		} else {
			false
		}
	}
}

/// Inbound frame limiter for one connection. Unlimited when burst or rate is zero.
#[derive(Debug)]
struct FrameRateLimiter {
	bucket: Option<TokenBucket>,
}

impl FrameRateLimiter {
	fn new(burst: u32, per_minute: u32) -> Self {
		Self {
			bucket: TokenBucket::new(burst, per_minute),
		}
	}

	fn allow(&mut self) -> bool {
		match self.bucket.as_mut() {
			Some(bucket) => bucket.allow_at(Instant::now()),
			None => true,
		}
	}
}
