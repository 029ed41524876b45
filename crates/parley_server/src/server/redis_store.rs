#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context as _;
use futures::StreamExt as _;
use parley_domain::Message;
use redis::AsyncCommands as _;
use redis::aio::MultiplexedConnection;
use tracing::{info, warn};

use crate::server::store::{MessageStore, StoreEvent, StoreSubscription, decode_entries};

/// Redis rejects expiries whose millisecond form overflows.
const MAX_EXPIRE_SECS: u64 = i64::MAX as u64 / 1000;

/// Redis-backed store shared by every gateway instance.
///
/// Lists are written newest-first (`LPUSH`) and reversed on read.
pub struct RedisMessageStore {
	client: redis::Client,
	conn: MultiplexedConnection,
}

impl RedisMessageStore {
	pub async fn connect(url: &str) -> anyhow::Result<Self> {
		let client = redis::Client::open(url).context("parse redis url")?;
		let mut conn = client
			.get_multiplexed_async_connection()
			.await
			.context("connect to redis")?;

		let _: String = redis::cmd("PING")
			.query_async(&mut conn)
			.await
			.context("redis PING")?;

		info!("connected to redis store");
		Ok(Self { client, conn })
	}
}

#[async_trait::async_trait]
impl MessageStore for RedisMessageStore {
	async fn publish(&self, topic: &str, message: &Message) -> anyhow::Result<()> {
		let payload = serde_json::to_string(message).context("serialize message")?;
		let mut conn = self.conn.clone();
		let _: i64 = conn.publish(topic, payload).await.context("redis PUBLISH")?;
		Ok(())
	}

	async fn subscribe(&self, pattern: &str) -> anyhow::Result<StoreSubscription> {
		let mut pubsub = self.client.get_async_pubsub().await.context("open redis pubsub")?;
		pubsub.psubscribe(pattern).await.context("redis PSUBSCRIBE")?;

		let events = pubsub.into_on_message().filter_map(|msg| async move {
			let topic = msg.get_channel_name().to_string();
			match msg.get_payload::<String>() {
				Ok(payload) => Some(StoreEvent { topic, payload }),
				Err(e) => {
					warn!(%topic, error = %e, "non-text pubsub payload; skipping");
					None
				}
			}
		});

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

		let mut pipe = redis::pipe();
		pipe.atomic().lpush(key, payload).ignore();
		if let Some(max) = max_len {
			let stop = isize::try_from(max).unwrap_or(isize::MAX) - 1;
			pipe.ltrim(key, 0, stop).ignore();
		}
		let secs = i64::try_from(ttl.as_secs().clamp(1, MAX_EXPIRE_SECS)).unwrap_or(1);
		pipe.expire(key, secs).ignore();

		let mut conn = self.conn.clone();
		let _: () = pipe.query_async(&mut conn).await.context("redis append pipeline")?;
		Ok(())
	}

	async fn read_recent(&self, key: &str, limit: Option<usize>) -> anyhow::Result<Vec<Message>> {
		let stop = match limit {
			Some(0) => return Ok(Vec::new()),
			Some(n) => isize::try_from(n).unwrap_or(isize::MAX) - 1,
			None => -1,
		};

		let mut conn = self.conn.clone();
		let mut raw: Vec<String> = conn.lrange(key, 0, stop).await.context("redis LRANGE")?;
		raw.reverse();

		Ok(decode_entries(key, raw))
	}

	async fn drop_oldest(&self, key: &str, count: usize) -> anyhow::Result<()> {
		if count == 0 {
			return Ok(());
		}

		// Oldest entries sit at the tail.
		let stop = -isize::try_from(count).unwrap_or(isize::MAX - 1) - 1;
		let mut conn = self.conn.clone();
		let _: () = conn.ltrim(key, 0, stop).await.context("redis LTRIM")?;
		Ok(())
	}

	async fn clear(&self, key: &str) -> anyhow::Result<()> {
		let mut conn = self.conn.clone();
		let _: () = conn.del(key).await.context("redis DEL")?;
		Ok(())
	}
}
