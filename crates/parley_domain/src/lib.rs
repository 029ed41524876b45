#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Room used when a client does not ask for one.
pub const DEFAULT_ROOM: &str = "default";

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Authenticated principal (username).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
	/// Create a non-empty `UserId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserId::new(s.to_string())
	}
}

impl TryFrom<String> for UserId {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		UserId::new(value)
	}
}

impl From<UserId> for String {
	fn from(value: UserId) -> Self {
		value.0
	}
}

/// Chat room identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

impl RoomId {
	/// Create a non-empty `RoomId`.
	///
	/// Room ids end up inside store keys and topic patterns, so glob metacharacters are rejected.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		if id.contains(['*', '?', '[', ']']) {
			return Err(ParseIdError::InvalidFormat(format!("room id contains a glob character: {id}")));
		}
		Ok(Self(id))
	}

	/// The room clients land in when none is requested.
	pub fn default_room() -> Self {
		Self(DEFAULT_ROOM.to_string())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for RoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomId::new(s.to_string())
	}
}

impl TryFrom<String> for RoomId {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		RoomId::new(value)
	}
}

impl From<RoomId> for String {
	fn from(value: RoomId) -> Self {
		value.0
	}
}

/// A chat message, either for a room or for a single user.
///
/// When `target` is set the message is direct, whatever `room` says.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
	#[serde(rename = "user")]
	sender: UserId,
	content: String,
	timestamp: DateTime<Utc>,
	#[serde(
		rename = "room_id",
		default,
		deserialize_with = "blank_as_none",
		skip_serializing_if = "Option::is_none"
	)]
	room: Option<RoomId>,
	#[serde(default, deserialize_with = "blank_as_none", skip_serializing_if = "Option::is_none")]
	target: Option<UserId>,
}

impl Message {
	pub fn new(
		sender: UserId,
		content: impl Into<String>,
		timestamp: DateTime<Utc>,
		room: Option<RoomId>,
		target: Option<UserId>,
	) -> Self {
		Self {
			sender,
			content: content.into(),
			timestamp,
			room,
			target,
		}
	}

	/// Message for everyone in `room`, stamped now.
	pub fn to_room(sender: UserId, room: RoomId, content: impl Into<String>) -> Self {
		Self::new(sender, content, Utc::now(), Some(room), None)
	}

	/// Direct message for `target`, stamped now.
	pub fn to_user(sender: UserId, target: UserId, content: impl Into<String>) -> Self {
		Self::new(sender, content, Utc::now(), None, Some(target))
	}

	pub fn sender(&self) -> &UserId {
		&self.sender
	}

	pub fn content(&self) -> &str {
		&self.content
	}

	pub fn timestamp(&self) -> DateTime<Utc> {
		self.timestamp
	}

	pub fn room(&self) -> Option<&RoomId> {
		self.room.as_ref()
	}

	pub fn target(&self) -> Option<&UserId> {
		self.target.as_ref()
	}

	pub fn is_direct(&self) -> bool {
		self.target.is_some()
	}
}

/// Client -> server frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingFrame {
	pub content: String,
	#[serde(default, deserialize_with = "blank_as_none", skip_serializing_if = "Option::is_none")]
	pub target: Option<UserId>,
}

/// Synthetic server notice, e.g. the post-connect acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
	pub msg: String,
}

impl Notice {
	pub fn connected(room: &RoomId) -> Self {
		Self {
			msg: format!("connected to {room}"),
		}
	}
}

/// Server -> client frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutgoingFrame {
	Chat(Message),
	Notice(Notice),
}

impl From<Message> for OutgoingFrame {
	fn from(value: Message) -> Self {
		Self::Chat(value)
	}
}

impl From<Notice> for OutgoingFrame {
	fn from(value: Notice) -> Self {
		Self::Notice(value)
	}
}

/// Key and topic naming shared by every instance talking to the same store.
pub struct StoreKey;

impl StoreKey {
	/// Prefix for room channels and room history lists.
	pub const ROOM_PREFIX: &'static str = "chat:";

	/// Prefix for per-user unread lists.
	pub const UNREAD_PREFIX: &'static str = "unread:";

	/// Pattern matching every room channel.
	pub const ALL_ROOMS: &'static str = "chat:*";

	/// Pub/sub channel for a room (`chat:<room>`).
	pub fn room_channel(room: &RoomId) -> String {
		format!("{}{}", Self::ROOM_PREFIX, room.as_str())
	}

	/// History list for a room. Shares the channel name; lists and channels live in separate namespaces.
	pub fn room_history(room: &RoomId) -> String {
		Self::room_channel(room)
	}

	/// Unread list for a user (`unread:<user>`).
	pub fn unread(user: &UserId) -> String {
		format!("{}{}", Self::UNREAD_PREFIX, user.as_str())
	}

	/// Parse the room back out of a room channel name.
	pub fn parse_room_channel(s: &str) -> Result<RoomId, ParseIdError> {
		let rest = s
			.strip_prefix(Self::ROOM_PREFIX)
			.ok_or_else(|| ParseIdError::InvalidFormat("expected chat:<room>".into()))?;
		RoomId::new(rest.to_string())
	}
}

fn blank_as_none<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
	D: Deserializer<'de>,
	T: FromStr,
	T::Err: fmt::Display,
{
	let raw: Option<String> = Option::deserialize(deserializer)?;
	match raw {
		None => Ok(None),
		Some(s) if s.trim().is_empty() => Ok(None),
		Some(s) => s.parse().map(Some).map_err(de::Error::custom),
	}
}
