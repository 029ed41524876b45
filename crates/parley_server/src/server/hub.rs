#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parley_domain::{Message, OutgoingFrame, RoomId, StoreKey, UserId};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::server::persist::StoreWriter;
use crate::server::store::MessageStore;
use crate::util::shutdown::{ShutdownRx, wait_for_shutdown};

/// Outbound queue capacity per connection.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
	pub fn next() -> Self {
		static NEXT: AtomicU64 = AtomicU64::new(1);
		Self(NEXT.fetch_add(1, Ordering::Relaxed))
	}
}

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "conn-{}", self.0)
	}
}

/// The hub's view of a connection: who it is, where it sits, and how to reach its writer.
///
/// Dropping the last `Member` for a connection closes its outbound queue.
#[derive(Debug)]
pub struct Member {
	pub id: ConnectionId,
	pub user: UserId,
	/// `None` lands the connection in the default room.
	pub room: Option<RoomId>,
	pub outbound: mpsc::Sender<OutgoingFrame>,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
	pub command_queue_capacity: usize,
	pub unread_ttl: Duration,
}

impl Default for HubConfig {
	fn default() -> Self {
		Self {
			command_queue_capacity: 1024,
			unread_ttl: Duration::from_secs(24 * 60 * 60),
		}
	}
}

#[derive(Debug, thiserror::Error)]
#[error("hub is not running")]
pub struct HubClosed;

enum HubCommand {
	Register(Member),
	Unregister(ConnectionId),
	Broadcast(Message),
	RoomCounts(oneshot::Sender<HashMap<RoomId, usize>>),
}

/// Cheap, cloneable handle for submitting work to the hub loop.
#[derive(Debug, Clone)]
pub struct HubHandle {
	tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
	pub async fn register(&self, member: Member) -> Result<(), HubClosed> {
		self.tx.send(HubCommand::Register(member)).await.map_err(|_| HubClosed)
	}

	pub async fn unregister(&self, id: ConnectionId) -> Result<(), HubClosed> {
		self.tx.send(HubCommand::Unregister(id)).await.map_err(|_| HubClosed)
	}

	pub async fn broadcast(&self, message: Message) -> Result<(), HubClosed> {
		self.tx.send(HubCommand::Broadcast(message)).await.map_err(|_| HubClosed)
	}

	/// Snapshot of member counts per room.
	pub async fn room_counts(&self) -> Result<HashMap<RoomId, usize>, HubClosed> {
		let (reply, rx) = oneshot::channel();
		self.tx.send(HubCommand::RoomCounts(reply)).await.map_err(|_| HubClosed)?;
		rx.await.map_err(|_| HubClosed)
	}
}

/// Start the hub loop. It runs until shutdown is signalled or every handle is dropped.
pub fn spawn_hub(cfg: HubConfig, store: Arc<dyn MessageStore>, writer: StoreWriter, mut shutdown: ShutdownRx) -> HubHandle {
	let (tx, mut rx) = mpsc::channel(cfg.command_queue_capacity.max(1));

	tokio::spawn(async move {
		let mut hub = Hub {
			cfg,
			store,
			writer,
			rooms: HashMap::new(),
			index: HashMap::new(),
		};

		let stop = wait_for_shutdown(&mut shutdown);
		tokio::pin!(stop);

		loop {
			tokio::select! {
				_ = &mut stop => break,
				cmd = rx.recv() => {
					let Some(cmd) = cmd else { break };
					hub.handle(cmd);
				}
			}
		}

		let members = hub.index.len();
		hub.rooms.clear();
		hub.index.clear();
		metrics::gauge!("parley_server_connections").set(0.0);
		info!(members, "hub stopped");
	});

	HubHandle { tx }
}

struct Hub {
	cfg: HubConfig,
	store: Arc<dyn MessageStore>,
	writer: StoreWriter,
	rooms: HashMap<RoomId, HashMap<ConnectionId, Member>>,
	index: HashMap<ConnectionId, RoomId>,
}

impl Hub {
	fn handle(&mut self, cmd: HubCommand) {
		match cmd {
			HubCommand::Register(member) => self.register(member),
			HubCommand::Unregister(id) => {
				if self.remove(id).is_some() {
					debug!(conn = %id, "hub: unregistered");
				}
			}
			HubCommand::Broadcast(message) => self.broadcast(message),
			HubCommand::RoomCounts(reply) => {
				let counts = self.rooms.iter().map(|(room, m)| (room.clone(), m.len())).collect();
				let _ = reply.send(counts);
			}
		}
	}

	fn register(&mut self, mut member: Member) {
		let room = member.room.take().unwrap_or_else(RoomId::default_room);
		let id = member.id;

		// A repeated Register moves the connection.
		self.remove(id);

		tokio::spawn(deliver_unread(
			self.store.clone(),
			member.user.clone(),
			member.outbound.downgrade(),
		));

		member.room = Some(room.clone());
		debug!(conn = %id, user = %member.user, room = %room, "hub: registered");

		self.rooms.entry(room.clone()).or_default().insert(id, member);
		self.index.insert(id, room);
		metrics::gauge!("parley_server_connections").set(self.index.len() as f64);
	}

	fn remove(&mut self, id: ConnectionId) -> Option<Member> {
		let room = self.index.remove(&id)?;
		let members = self.rooms.get_mut(&room)?;
		let member = members.remove(&id);
		if members.is_empty() {
			self.rooms.remove(&room);
		}
		metrics::gauge!("parley_server_connections").set(self.index.len() as f64);
		member
	}

	fn broadcast(&mut self, message: Message) {
		let mut evicted = Vec::new();
		let frame = OutgoingFrame::Chat(message.clone());

		if let Some(target) = message.target() {
			let recipients = self
				.rooms
				.values()
				.flat_map(|members| members.values())
				.filter(|m| &m.user == target);
			for member in recipients {
				if !offer(member, &frame) {
					evicted.push(member.id);
				}
			}

			self.writer
				.append(StoreKey::unread(target), message.clone(), None, self.cfg.unread_ttl);
			metrics::counter!("parley_server_direct_messages_total").increment(1);
		} else if let Some(room) = message.room() {
			if let Some(members) = self.rooms.get(room) {
				for member in members.values() {
					if !offer(member, &frame) {
						evicted.push(member.id);
					}
				}
			}
			metrics::counter!("parley_server_room_messages_total").increment(1);
		} else {
			warn!(sender = %message.sender(), "message has neither room nor target; dropping");
			return;
		}

		for id in evicted {
			if let Some(member) = self.remove(id) {
				metrics::counter!("parley_server_evictions_total").increment(1);
				warn!(conn = %id, user = %member.user, "outbound queue full or closed; evicting connection");
			}
		}
	}
}

/// Non-blocking enqueue. `false` means the member must be evicted.
fn offer(member: &Member, frame: &OutgoingFrame) -> bool {
	member.outbound.try_send(frame.clone()).is_ok()
}

/// Replay a user's unread queue onto one connection, then drop what was delivered.
///
/// Holds only a weak sender so eviction or unregister still closes the queue mid-delivery.
/// Enqueueing never waits: a full or closed queue ends delivery and the rest stays queued for
/// the next connect. Entries appended after the read are left in place.
async fn deliver_unread(store: Arc<dyn MessageStore>, user: UserId, outbound: mpsc::WeakSender<OutgoingFrame>) {
	let key = StoreKey::unread(&user);

	let pending = match store.read_recent(&key, None).await {
		Ok(pending) => pending,
		Err(e) => {
			warn!(user = %user, error = %e, "failed to read unread queue");
			return;
		}
	};

	if pending.is_empty() {
		return;
	}

	let total = pending.len();
	let mut delivered = 0;
	for message in pending {
		let Some(tx) = outbound.upgrade() else {
			debug!(user = %user, "connection gone during unread delivery");
			break;
		};
		match tx.try_send(OutgoingFrame::Chat(message)) {
			Ok(()) => delivered += 1,
			Err(mpsc::error::TrySendError::Full(_)) => {
				debug!(user = %user, delivered, total, "outbound queue full during unread delivery");
				break;
			}
			Err(mpsc::error::TrySendError::Closed(_)) => {
				debug!(user = %user, "connection closed during unread delivery");
				break;
			}
		}
	}

	if delivered == 0 {
		return;
	}

	if let Err(e) = store.drop_oldest(&key, delivered).await {
		warn!(user = %user, error = %e, "failed to trim delivered unread messages");
		return;
	}

	debug!(user = %user, delivered, total, "delivered unread messages");
}
