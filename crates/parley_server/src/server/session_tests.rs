#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures::{SinkExt as _, StreamExt as _};
use parley_domain::{Message, RoomId, StoreKey, UserId};
use parley_util::SecretString;
use serde_json::Value;
use tokio::io::DuplexStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::server::auth::{HmacTokenGate, TokenGate, TokenSettings};
use crate::server::bridge::{BridgeConfig, spawn_pubsub_bridge};
use crate::server::connection::{ConnectionSettings, Gateway, Rejection, SessionError};
use crate::server::hub::{HubConfig, spawn_hub};
use crate::server::persist::StoreWriter;
use crate::server::store::{InMemoryMessageStore, MessageStore, StoreSubscription};

type Client = WebSocketStream<DuplexStream>;
type Session = JoinHandle<Result<(), SessionError>>;

struct World {
	gateway: Gateway,
	gate: Arc<HmacTokenGate>,
	store: Arc<InMemoryMessageStore>,
	_shutdown: watch::Sender<bool>,
}

async fn world() -> World {
	let store = Arc::new(InMemoryMessageStore::default());
	world_over(store.clone(), store).await
}

/// A gateway, hub and bridge over `store`, with `inner` as the shared backing store.
async fn world_over(inner: Arc<InMemoryMessageStore>, store: Arc<dyn MessageStore>) -> World {
	let gate = Arc::new(HmacTokenGate::new(TokenSettings {
		access_secret: SecretString::new("access"),
		refresh_secret: SecretString::new("refresh"),
		access_ttl: Duration::from_secs(300),
		refresh_ttl: Duration::from_secs(86_400),
		issuer: "chat-app".to_string(),
	}));

	let (shutdown, shutdown_rx) = watch::channel(false);
	let writer = StoreWriter::spawn(store.clone(), 64);
	let hub = spawn_hub(HubConfig::default(), store.clone(), writer, shutdown_rx.clone());

	let subscribers = inner.subscriber_count();
	let _bridge = spawn_pubsub_bridge(store.clone(), hub.clone(), BridgeConfig::default(), shutdown_rx);
	for _ in 0..100 {
		if inner.subscriber_count() > subscribers {
			break;
		}
		tokio::time::sleep(Duration::from_millis(5)).await;
	}

	let gateway = Gateway::new(hub, store, gate.clone(), ConnectionSettings::default());
	World {
		gateway,
		gate,
		store: inner,
		_shutdown: shutdown,
	}
}

impl World {
	fn token_for(&self, name: &str) -> String {
		let rooms = [RoomId::default_room(), RoomId::new("vip").expect("valid RoomId")];
		self.gate
			.issue_access(&UserId::new(name).expect("valid UserId"), &rooms)
			.expect("issue token")
	}

	async fn connect(&self, token: String, room: Option<&str>) -> (Client, Session) {
		let (server_io, client_io) = tokio::io::duplex(64 * 1024);
		let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
		let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;

		let gateway = self.gateway.clone();
		let room = room.map(str::to_string);
		let session = tokio::spawn(async move {
			gateway
				.handle_connection(server, Some(&format!("Bearer {token}")), room.as_deref())
				.await
		});

		(client, session)
	}
}

async fn next_json(client: &mut Client) -> Value {
	loop {
		let frame = timeout(Duration::from_millis(500), client.next())
			.await
			.expect("expected a frame within timeout")
			.expect("stream open")
			.expect("frame ok");
		match frame {
			WsMessage::Text(text) => return serde_json::from_str(text.as_str()).expect("json frame"),
			WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
			other => panic!("unexpected frame: {other:?}"),
		}
	}
}

/// Everything that arrives until the connection goes quiet.
async fn drain_json(client: &mut Client) -> Vec<Value> {
	let mut out = Vec::new();
	while let Ok(Some(Ok(frame))) = timeout(Duration::from_millis(150), client.next()).await {
		if let WsMessage::Text(text) = frame {
			out.push(serde_json::from_str(text.as_str()).expect("json frame"));
		}
	}
	out
}

async fn assert_quiet(client: &mut Client) {
	let got = timeout(Duration::from_millis(100), client.next()).await;
	assert!(got.is_err(), "unexpected frame: {got:?}");
}

async fn wait_for_history(w: &World, room: &str, len: usize) -> Vec<Message> {
	let key = StoreKey::room_history(&RoomId::new(room).expect("valid RoomId"));
	let mut entries = Vec::new();
	for _ in 0..100 {
		entries = w.store.read_recent(&key, None).await.expect("read");
		if entries.len() == len {
			return entries;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("{key} has {} entries, expected {len}", entries.len());
}

async fn say(client: &mut Client, frame: Value) {
	client.send(WsMessage::text(frame.to_string())).await.expect("send");
}

#[tokio::test]
async fn alice_and_bob_chat_then_bob_catches_up_after_reconnect() {
	let w = world().await;

	let (mut alice, _alice_session) = w.connect(w.token_for("alice"), Some("vip")).await;
	assert_eq!(next_json(&mut alice).await["msg"], "connected to vip");

	let (mut bob, bob_session) = w.connect(w.token_for("bob"), Some("vip")).await;
	assert_eq!(next_json(&mut bob).await["msg"], "connected to vip");

	say(&mut alice, serde_json::json!({"content": "hi all"})).await;
	for client in [&mut alice, &mut bob] {
		let got = next_json(client).await;
		assert_eq!(got["user"], "alice");
		assert_eq!(got["content"], "hi all");
		assert_eq!(got["room_id"], "vip");
		assert!(got.get("target").is_none());
	}

	say(&mut alice, serde_json::json!({"content": "psst", "target": "bob"})).await;
	let got = next_json(&mut bob).await;
	assert_eq!(got["content"], "psst");
	assert_eq!(got["target"], "bob");
	assert_quiet(&mut alice).await;

	bob.close(None).await.expect("close");
	timeout(Duration::from_secs(2), bob_session)
		.await
		.expect("bob's session ends")
		.expect("task ok")
		.expect("clean session end");

	say(&mut alice, serde_json::json!({"content": "offline", "target": "bob"})).await;

	let unread_key = StoreKey::unread(&UserId::new("bob").expect("valid UserId"));
	let mut unread = Vec::new();
	for _ in 0..100 {
		unread = w.store.read_recent(&unread_key, None).await.expect("read");
		if unread.len() == 2 {
			break;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	let contents: Vec<_> = unread.iter().map(|m| m.content().to_string()).collect();
	assert_eq!(contents, vec!["psst", "offline"]);
	wait_for_history(&w, "vip", 3).await;

	let (mut bob, _bob_session) = w.connect(w.token_for("bob"), Some("vip")).await;
	let frames = drain_json(&mut bob).await;
	let position = |needle: &str| {
		frames
			.iter()
			.position(|f| f["content"] == needle || f["msg"] == needle)
			.unwrap_or_else(|| panic!("{needle} not delivered: {frames:?}"))
	};

	assert!(position("hi all") < position("connected to vip"), "history precedes the notice");
	assert!(position("psst") < position("offline"), "unread arrives oldest first");
	assert_eq!(
		frames.iter().filter(|f| f["content"] == "hi all").count(),
		1,
		"each message is written to room history once: {frames:?}"
	);
	assert_eq!(
		frames.iter().filter(|f| f["content"] == "psst").count(),
		2,
		"direct messages replay from room history and the unread queue: {frames:?}"
	);

	for _ in 0..100 {
		if w.store.read_recent(&unread_key, None).await.expect("read").is_empty() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("unread queue was not cleared after delivery");
}

#[tokio::test]
async fn rooms_are_isolated_end_to_end() {
	let w = world().await;

	let (mut alice, _a) = w.connect(w.token_for("alice"), Some("vip")).await;
	next_json(&mut alice).await;
	let (mut bob, _b) = w.connect(w.token_for("bob"), Some("default")).await;
	next_json(&mut bob).await;

	say(&mut alice, serde_json::json!({"content": "vip only"})).await;
	assert_eq!(next_json(&mut alice).await["content"], "vip only");
	assert_quiet(&mut bob).await;
}

#[tokio::test]
async fn malformed_frames_are_skipped() {
	let w = world().await;
	let (mut alice, _a) = w.connect(w.token_for("alice"), None).await;
	next_json(&mut alice).await;

	alice.send(WsMessage::text("not json")).await.expect("send");
	say(&mut alice, serde_json::json!({"target": "bob"})).await;
	say(&mut alice, serde_json::json!({"content": "still here"})).await;

	assert_eq!(next_json(&mut alice).await["content"], "still here");
	assert_quiet(&mut alice).await;
}

#[tokio::test]
async fn history_is_replayed_oldest_first() {
	let w = world().await;
	let (mut alice, _a) = w.connect(w.token_for("alice"), None).await;
	next_json(&mut alice).await;

	for i in 0..3 {
		say(&mut alice, serde_json::json!({"content": format!("m{i}")})).await;
		assert_eq!(next_json(&mut alice).await["content"], format!("m{i}"));
	}

	wait_for_history(&w, "default", 3).await;

	let (mut carol, _c) = w.connect(w.token_for("carol"), None).await;
	for i in 0..3 {
		assert_eq!(next_json(&mut carol).await["content"], format!("m{i}"));
	}
	assert_eq!(next_json(&mut carol).await["msg"], "connected to default");
}

#[tokio::test]
async fn unauthorized_and_forbidden_connections_get_a_policy_close() {
	let w = world().await;

	let cases = [
		("garbage".to_string(), Some("default"), Rejection::Unauthorized),
		(w.token_for("alice"), Some("ops"), Rejection::Forbidden("ops".to_string())),
	];

	for (token, room, expected) in cases {
		let (mut client, session) = w.connect(token, room).await;

		match timeout(Duration::from_millis(500), client.next()).await {
			Ok(Some(Ok(WsMessage::Close(Some(frame))))) => assert_eq!(frame.code, CloseCode::Policy),
			other => panic!("expected a policy close, got: {other:?}"),
		}

		let result = timeout(Duration::from_millis(500), session)
			.await
			.expect("session returns")
			.expect("task ok");
		match result {
			Err(SessionError::Rejected(rejection)) => assert_eq!(rejection, expected),
			other => panic!("expected rejection, got: {other:?}"),
		}
	}

	let counts = w.gateway.hub().room_counts().await.expect("hub running");
	assert!(counts.is_empty(), "rejected connections never join: {counts:?}");
}

#[tokio::test]
async fn direct_messages_are_recorded_in_room_history() {
	let w = world().await;
	let (mut alice, _a) = w.connect(w.token_for("alice"), Some("vip")).await;
	next_json(&mut alice).await;

	say(&mut alice, serde_json::json!({"content": "psst", "target": "bob"})).await;

	let history = wait_for_history(&w, "vip", 1).await;
	assert_eq!(history[0].content(), "psst");
	assert_eq!(history[0].target().map(|t| t.as_str()), Some("bob"));
}

/// Every publish fails; everything else goes to the in-memory store.
struct PublishDownStore {
	inner: Arc<InMemoryMessageStore>,
}

#[async_trait::async_trait]
impl MessageStore for PublishDownStore {
	async fn publish(&self, _topic: &str, _message: &Message) -> anyhow::Result<()> {
		Err(anyhow!("publish unavailable"))
	}

	async fn subscribe(&self, pattern: &str) -> anyhow::Result<StoreSubscription> {
		self.inner.subscribe(pattern).await
	}

	async fn append_bounded(
		&self,
		key: &str,
		message: &Message,
		max_len: Option<usize>,
		ttl: Duration,
	) -> anyhow::Result<()> {
		self.inner.append_bounded(key, message, max_len, ttl).await
	}

	async fn read_recent(&self, key: &str, limit: Option<usize>) -> anyhow::Result<Vec<Message>> {
		self.inner.read_recent(key, limit).await
	}

	async fn drop_oldest(&self, key: &str, count: usize) -> anyhow::Result<()> {
		self.inner.drop_oldest(key, count).await
	}

	async fn clear(&self, key: &str) -> anyhow::Result<()> {
		self.inner.clear(key).await
	}
}

#[tokio::test]
async fn history_is_written_even_when_publish_fails() {
	let inner = Arc::new(InMemoryMessageStore::default());
	let w = world_over(inner.clone(), Arc::new(PublishDownStore { inner })).await;

	let (mut alice, _a) = w.connect(w.token_for("alice"), None).await;
	next_json(&mut alice).await;

	say(&mut alice, serde_json::json!({"content": "hi"})).await;

	let history = wait_for_history(&w, "default", 1).await;
	assert_eq!(history[0].content(), "hi");
}

#[tokio::test]
async fn messages_cross_gateway_instances_through_the_shared_store() {
	let store = Arc::new(InMemoryMessageStore::default());
	let a = world_over(store.clone(), store.clone()).await;
	let b = world_over(store.clone(), store).await;

	let (mut alice, _a) = a.connect(a.token_for("alice"), Some("vip")).await;
	assert_eq!(next_json(&mut alice).await["msg"], "connected to vip");
	let (mut bob, _b) = b.connect(b.token_for("bob"), Some("vip")).await;
	assert_eq!(next_json(&mut bob).await["msg"], "connected to vip");

	say(&mut alice, serde_json::json!({"content": "hello from a"})).await;
	for client in [&mut alice, &mut bob] {
		let got = next_json(client).await;
		assert_eq!(got["user"], "alice");
		assert_eq!(got["content"], "hello from a");
	}

	say(&mut bob, serde_json::json!({"content": "psst", "target": "alice"})).await;
	assert_eq!(next_json(&mut alice).await["content"], "psst");
	assert_quiet(&mut bob).await;

	let history = wait_for_history(&a, "vip", 2).await;
	let contents: Vec<_> = history.iter().map(|m| m.content()).collect();
	assert_eq!(contents, vec!["hello from a", "psst"]);
}
