#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use futures::StreamExt as _;
use futures::stream::BoxStream;
use parley_domain::Message;
use tokio::sync::{Mutex, broadcast};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::util::shutdown::{ShutdownRx, wait_for_shutdown};

/// One raw pub/sub delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
	pub topic: String,
	pub payload: String,
}

/// Live subscription feed. Dropping it unsubscribes.
pub type StoreSubscription = BoxStream<'static, StoreEvent>;

/// Bounds and lifetimes for the advisory lists kept in the store.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
	/// Max entries kept per room history list.
	pub history_max_len: usize,
	/// Entries replayed to a newly connected client.
	pub history_fetch_limit: usize,
	/// Room history expiry, refreshed on every write.
	pub history_ttl: Duration,
	/// Unread list expiry, refreshed on every write.
	pub unread_ttl: Duration,
}

impl Default for RetentionPolicy {
	fn default() -> Self {
		Self {
			history_max_len: 50,
			history_fetch_limit: 50,
			history_ttl: Duration::from_secs(6 * 60 * 60),
			unread_ttl: Duration::from_secs(24 * 60 * 60),
		}
	}
}

/// Pub/sub bus plus bounded, expiring lists shared by every server instance.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
	/// Best-effort fan-out to every subscriber whose pattern matches `topic`.
	async fn publish(&self, topic: &str, message: &Message) -> anyhow::Result<()>;

	/// Subscribe to every topic matching a glob `pattern` (`*` and `?`).
	async fn subscribe(&self, pattern: &str) -> anyhow::Result<StoreSubscription>;

	/// Append to `key`, keep only the newest `max_len` entries and reset the expiry to `ttl`.
	async fn append_bounded(
		&self,
		key: &str,
		message: &Message,
		max_len: Option<usize>,
		ttl: Duration,
	) -> anyhow::Result<()>;

	/// Newest `limit` entries of `key` (all when `None`), oldest first.
	async fn read_recent(&self, key: &str, limit: Option<usize>) -> anyhow::Result<Vec<Message>>;

	/// Remove the `count` oldest entries of `key`, leaving anything appended since untouched.
	async fn drop_oldest(&self, key: &str, count: usize) -> anyhow::Result<()>;

	async fn clear(&self, key: &str) -> anyhow::Result<()>;
}

/// Glob match as used by pattern subscriptions.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
	let p = pattern.as_bytes();
	let t = topic.as_bytes();

	let (mut pi, mut ti) = (0usize, 0usize);
	let mut star: Option<usize> = None;
	let mut star_ti = 0usize;

	while ti < t.len() {
		if pi < p.len() && (p[pi] == b'?' || p[pi] == t[ti]) {
			pi += 1;
			ti += 1;
		} else if pi < p.len() && p[pi] == b'*' {
			star = Some(pi);
			star_ti = ti;
			pi += 1;
		} else if let Some(s) = star {
			pi = s + 1;
			star_ti += 1;
			ti = star_ti;
		} else {
			return false;
		}
	}

	while pi < p.len() && p[pi] == b'*' {
		pi += 1;
	}

	pi == p.len()
}

pub(crate) fn decode_entries<I>(key: &str, raw: I) -> Vec<Message>
where
	I: IntoIterator<Item = String>,
{
	raw.into_iter()
		.filter_map(|entry| match serde_json::from_str::<Message>(&entry) {
			Ok(msg) => Some(msg),
			Err(e) => {
				warn!(key, error = %e, "skipping undecodable store entry");
				None
			}
		})
		.collect()
}

/// Single-process store: a broadcast bus and in-memory lists.
pub struct InMemoryMessageStore {
	lists: Mutex<HashMap<String, StoredList>>,
	bus: broadcast::Sender<StoreEvent>,
}

#[derive(Debug)]
struct StoredList {
	/// Oldest at the front.
	entries: VecDeque<String>,
	expires_at: Instant,
}

impl Default for InMemoryMessageStore {
	fn default() -> Self {
		Self::with_bus_capacity(1024)
	}
}

impl InMemoryMessageStore {
	pub fn with_bus_capacity(capacity: usize) -> Self {
		let (bus, _) = broadcast::channel(capacity.max(1));
		Self {
			lists: Mutex::new(HashMap::new()),
			bus,
		}
	}

	/// Publish an already-serialized payload.
	pub fn publish_raw(&self, topic: &str, payload: String) {
		let receivers = self
			.bus
			.send(StoreEvent {
				topic: topic.to_string(),
				payload,
			})
			.unwrap_or(0);
		trace!(topic, receivers, "in-memory publish");
	}

	/// Drop every list whose expiry has passed. Returns how many were removed.
	pub async fn purge_expired(&self) -> usize {
		let now = Instant::now();
		let mut lists = self.lists.lock().await;
		let before = lists.len();
		lists.retain(|_, list| list.expires_at > now);
		before - lists.len()
	}

	#[cfg(test)]
	pub fn subscriber_count(&self) -> usize {
		self.bus.receiver_count()
	}

	#[cfg(test)]
	pub async fn append_raw_for_test(&self, key: &str, raw: &str) {
		if let Some(list) = self.lists.lock().await.get_mut(key) {
			list.entries.push_back(raw.to_string());
		}
	}
}

#[async_trait::async_trait]
impl MessageStore for InMemoryMessageStore {
	async fn publish(&self, topic: &str, message: &Message) -> anyhow::Result<()> {
		let payload = serde_json::to_string(message).context("serialize message")?;
		self.publish_raw(topic, payload);
		Ok(())
	}

	async fn subscribe(&self, pattern: &str) -> anyhow::Result<StoreSubscription> {
		let rx = self.bus.subscribe();
		let pattern = pattern.to_string();

		let events = futures::stream::unfold(rx, |mut rx| async move {
			loop {
				match rx.recv().await {
					Ok(ev) => return Some((ev, rx)),
					Err(broadcast::error::RecvError::Lagged(n)) => {
						warn!(lagged = n, "in-memory subscription lagged; events dropped");
					}
					Err(broadcast::error::RecvError::Closed) => return None,
				}
			}
		})
		.filter(move |ev| futures::future::ready(topic_matches(&pattern, &ev.topic)));

		Ok(events.boxed())
	}

	async fn append_bounded(
		&self,
		key: &str,
		message: &Message,
		max_len: Option<usize>,
		ttl: Duration,
	) -> anyhow::Result<()> {
		let payload = serde_json::to_string(message).context("serialize message")?;
		let now = Instant::now();

		let mut lists = self.lists.lock().await;
		let list = lists.entry(key.to_string()).or_insert_with(|| StoredList {
			entries: VecDeque::new(),
			expires_at: now,
		});

		if list.expires_at <= now {
			list.entries.clear();
		}

		list.entries.push_back(payload);
		if let Some(max) = max_len {
			while list.entries.len() > max {
				list.entries.pop_front();
			}
		}
		list.expires_at = expiry_after(now, ttl);

		Ok(())
	}

	async fn read_recent(&self, key: &str, limit: Option<usize>) -> anyhow::Result<Vec<Message>> {
		let now = Instant::now();
		let mut lists = self.lists.lock().await;

		let Some(list) = lists.get(key) else {
			return Ok(Vec::new());
		};

		if list.expires_at <= now {
			lists.remove(key);
			return Ok(Vec::new());
		}

		let skip = match limit {
			Some(limit) => list.entries.len().saturating_sub(limit),
			None => 0,
		};
		let raw = list.entries.iter().skip(skip).cloned().collect::<Vec<_>>();
		drop(lists);

		Ok(decode_entries(key, raw))
	}

	async fn drop_oldest(&self, key: &str, count: usize) -> anyhow::Result<()> {
		let mut lists = self.lists.lock().await;
		let Some(list) = lists.get_mut(key) else {
			return Ok(());
		};

		let n = count.min(list.entries.len());
		list.entries.drain(..n);
		if list.entries.is_empty() {
			lists.remove(key);
		}
		Ok(())
	}

	async fn clear(&self, key: &str) -> anyhow::Result<()> {
		self.lists.lock().await.remove(key);
		Ok(())
	}
}

/// `now + ttl`, pinned to a far-off deadline when the sum does not fit.
fn expiry_after(now: Instant, ttl: Duration) -> Instant {
	const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);
	now.checked_add(ttl)
		.or_else(|| now.checked_add(FAR_FUTURE))
		.unwrap_or(now)
}

/// Periodically purge expired lists from an in-memory store until shutdown.
pub fn spawn_expiry_sweeper(store: Arc<InMemoryMessageStore>, every: Duration, mut shutdown: ShutdownRx) {
	tokio::spawn(async move {
		let mut interval = tokio::time::interval(every);
		let stop = wait_for_shutdown(&mut shutdown);
		tokio::pin!(stop);

		loop {
			tokio::select! {
				_ = &mut stop => break,
				_ = interval.tick() => {
					let purged = store.purge_expired().await;
					if purged > 0 {
						debug!(purged, "purged expired store lists");
					}
				}
			}
		}
	});
}
