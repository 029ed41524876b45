#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use parley_domain::Message;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::server::store::MessageStore;

#[derive(Debug)]
struct AppendJob {
	key: String,
	message: Message,
	max_len: Option<usize>,
	ttl: Duration,
}

/// Ordered background writer for store appends issued from places that must not await the store.
///
/// Jobs are applied one at a time in submission order. The worker exits once every handle is dropped.
#[derive(Debug, Clone)]
pub struct StoreWriter {
	tx: mpsc::Sender<AppendJob>,
}

impl StoreWriter {
	pub fn spawn(store: Arc<dyn MessageStore>, capacity: usize) -> Self {
		let (tx, mut rx) = mpsc::channel::<AppendJob>(capacity.max(1));

		tokio::spawn(async move {
			while let Some(job) = rx.recv().await {
				if let Err(e) = store
					.append_bounded(&job.key, &job.message, job.max_len, job.ttl)
					.await
				{
					metrics::counter!("parley_server_store_write_errors_total").increment(1);
					warn!(key = %job.key, error = %e, "background store append failed");
				}
			}
			debug!("store writer stopped");
		});

		Self { tx }
	}

	/// Queue an append. Returns `false` when the job was dropped.
	pub fn append(&self, key: String, message: Message, max_len: Option<usize>, ttl: Duration) -> bool {
		let job = AppendJob {
			key,
			message,
			max_len,
			ttl,
		};

		match self.tx.try_send(job) {
			Ok(()) => true,
			Err(mpsc::error::TrySendError::Full(job)) => {
				metrics::counter!("parley_server_store_writes_dropped_total").increment(1);
				warn!(key = %job.key, "store writer queue full; dropping append");
				false
			}
			Err(mpsc::error::TrySendError::Closed(job)) => {
				warn!(key = %job.key, "store writer stopped; dropping append");
				false
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::server::store::InMemoryMessageStore;
	use parley_domain::{StoreKey, UserId};

	#[tokio::test]
	async fn appends_are_applied_in_order() {
		let store = Arc::new(InMemoryMessageStore::default());
		let writer = StoreWriter::spawn(store.clone(), 16);

		let bob = UserId::new("bob").unwrap();
		let key = StoreKey::unread(&bob);
		for i in 0..5 {
			let msg = Message::to_user(UserId::new("alice").unwrap(), bob.clone(), format!("m{i}"));
			assert!(writer.append(key.clone(), msg, None, Duration::from_secs(60)));
		}

		let mut got = Vec::new();
		for _ in 0..50 {
			got = store.read_recent(&key, None).await.unwrap();
			if got.len() == 5 {
				break;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}

		let contents: Vec<_> = got.iter().map(|m| m.content().to_string()).collect();
		assert_eq!(contents, vec!["m0", "m1", "m2", "m3", "m4"]);
	}
}
