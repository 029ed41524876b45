#![forbid(unsafe_code)]

use std::time::Duration;

use futures::StreamExt as _;
use parley_domain::{Message, RoomId, StoreKey, UserId};
use tokio::time::timeout;

use crate::server::store::{InMemoryMessageStore, MessageStore, topic_matches};

fn msg(content: &str) -> Message {
	Message::to_room(
		UserId::new("alice").expect("valid UserId"),
		RoomId::new("vip").expect("valid RoomId"),
		content,
	)
}

const HOUR: Duration = Duration::from_secs(60 * 60);

#[test]
fn glob_patterns() {
	assert!(topic_matches("chat:*", "chat:vip"));
	assert!(topic_matches("chat:*", "chat:"));
	assert!(!topic_matches("chat:*", "unread:bob"));
	assert!(topic_matches("chat:v?p", "chat:vip"));
	assert!(!topic_matches("chat:v?p", "chat:viip"));
	assert!(topic_matches("*:vip", "chat:vip"));
	assert!(topic_matches("c*t:*p", "chat:vip"));
	assert!(topic_matches("exact", "exact"));
	assert!(!topic_matches("exact", "exactly"));
	assert!(topic_matches("*", ""));
}

#[tokio::test]
async fn history_keeps_only_the_newest_entries() {
	let store = InMemoryMessageStore::default();
	let key = "chat:vip";

	for i in 0..60 {
		store
			.append_bounded(key, &msg(&format!("m{i}")), Some(50), HOUR)
			.await
			.expect("append");
	}

	let all = store.read_recent(key, None).await.expect("read");
	assert_eq!(all.len(), 50);
	assert_eq!(all.first().map(|m| m.content()), Some("m10"));
	assert_eq!(all.last().map(|m| m.content()), Some("m59"));

	let recent = store.read_recent(key, Some(3)).await.expect("read");
	let contents: Vec<_> = recent.iter().map(|m| m.content()).collect();
	assert_eq!(contents, vec!["m57", "m58", "m59"]);

	assert!(store.read_recent(key, Some(0)).await.expect("read").is_empty());
}

#[tokio::test]
async fn unbounded_lists_keep_everything() {
	let store = InMemoryMessageStore::default();
	for i in 0..120 {
		store
			.append_bounded("unread:bob", &msg(&format!("m{i}")), None, HOUR)
			.await
			.expect("append");
	}
	assert_eq!(store.read_recent("unread:bob", None).await.expect("read").len(), 120);
}

#[tokio::test]
async fn lists_expire_and_writes_refresh_the_ttl() {
	let store = InMemoryMessageStore::default();
	let ttl = Duration::from_millis(200);

	store.append_bounded("k", &msg("one"), None, ttl).await.expect("append");
	tokio::time::sleep(Duration::from_millis(120)).await;
	store.append_bounded("k", &msg("two"), None, ttl).await.expect("append");
	tokio::time::sleep(Duration::from_millis(120)).await;

	assert_eq!(store.read_recent("k", None).await.expect("read").len(), 2);

	tokio::time::sleep(Duration::from_millis(250)).await;
	assert!(store.read_recent("k", None).await.expect("read").is_empty());

	store.append_bounded("k", &msg("three"), None, ttl).await.expect("append");
	let fresh = store.read_recent("k", None).await.expect("read");
	assert_eq!(fresh.len(), 1, "expired entries must not come back");
}

#[tokio::test]
async fn purge_drops_only_expired_lists() {
	let store = InMemoryMessageStore::default();
	store
		.append_bounded("short", &msg("x"), None, Duration::from_millis(10))
		.await
		.expect("append");
	store.append_bounded("long", &msg("y"), None, HOUR).await.expect("append");

	tokio::time::sleep(Duration::from_millis(30)).await;
	assert_eq!(store.purge_expired().await, 1);
	assert_eq!(store.read_recent("long", None).await.expect("read").len(), 1);
}

#[tokio::test]
async fn clear_removes_the_list() {
	let store = InMemoryMessageStore::default();
	store.append_bounded("unread:bob", &msg("x"), None, HOUR).await.expect("append");
	store.clear("unread:bob").await.expect("clear");
	store.clear("unread:bob").await.expect("clear twice");
	assert!(store.read_recent("unread:bob", None).await.expect("read").is_empty());
}

#[tokio::test]
async fn drop_oldest_keeps_later_appends() {
	let store = InMemoryMessageStore::default();
	let key = "unread:bob";

	for content in ["a", "b", "c"] {
		store.append_bounded(key, &msg(content), None, HOUR).await.expect("append");
	}
	store.drop_oldest(key, 2).await.expect("drop");
	store.append_bounded(key, &msg("d"), None, HOUR).await.expect("append");

	let left: Vec<_> = store
		.read_recent(key, None)
		.await
		.expect("read")
		.iter()
		.map(|m| m.content().to_string())
		.collect();
	assert_eq!(left, vec!["c", "d"]);

	store.drop_oldest(key, 10).await.expect("drop");
	assert!(store.read_recent(key, None).await.expect("read").is_empty());
	store.drop_oldest("unread:nobody", 1).await.expect("missing key is fine");
}

#[tokio::test]
async fn huge_ttl_does_not_overflow() {
	let store = InMemoryMessageStore::default();
	store
		.append_bounded("chat:vip", &msg("forever"), Some(50), Duration::MAX)
		.await
		.expect("append");
	assert_eq!(store.read_recent("chat:vip", None).await.expect("read").len(), 1);
	assert_eq!(store.purge_expired().await, 0);
}

#[tokio::test]
async fn corrupt_entries_are_skipped_on_read() {
	let store = InMemoryMessageStore::default();
	store.append_bounded("k", &msg("ok"), None, HOUR).await.expect("append");
	store.append_raw_for_test("k", "not json").await;

	let read = store.read_recent("k", None).await.expect("read");
	assert_eq!(read.len(), 1);
	assert_eq!(read[0].content(), "ok");
}

#[tokio::test]
async fn pattern_subscription_filters_topics() {
	let store = InMemoryMessageStore::default();
	let mut sub = store.subscribe(StoreKey::ALL_ROOMS).await.expect("subscribe");

	store.publish_raw("unread:bob", "ignored".to_string());
	store.publish("chat:vip", &msg("hello")).await.expect("publish");

	let ev = timeout(Duration::from_millis(250), sub.next())
		.await
		.expect("event within timeout")
		.expect("stream open");
	assert_eq!(ev.topic, "chat:vip");
	let back: Message = serde_json::from_str(&ev.payload).expect("payload is a message");
	assert_eq!(back.content(), "hello");
}

#[tokio::test]
async fn dropping_the_subscription_unsubscribes() {
	let store = InMemoryMessageStore::default();
	let sub = store.subscribe("chat:*").await.expect("subscribe");
	assert_eq!(store.subscriber_count(), 1);
	drop(sub);
	assert_eq!(store.subscriber_count(), 0);
}
