#![forbid(unsafe_code)]

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use parley_domain::{RoomId, UserId};
use parley_util::SecretString;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::util::time::unix_secs_now;

const TOKEN_VERSION: &str = "v1";

/// Who a valid access token speaks for and where they may go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessGrant {
	pub user: UserId,
	pub rooms: Vec<RoomId>,
}

impl AccessGrant {
	pub fn allows(&self, room: &RoomId) -> bool {
		self.rooms.iter().any(|r| r == room)
	}
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
	#[error("malformed token: {0}")]
	Malformed(&'static str),
	#[error("invalid token signature")]
	BadSignature,
	#[error("token expired")]
	Expired,
	#[error("wrong token kind")]
	WrongKind,
	#[error("token issued by someone else")]
	WrongIssuer,
	#[error("invalid token claims: {0}")]
	InvalidClaims(String),
	#[error("access tokens must grant at least one room")]
	NoRooms,
}

/// Stateless bearer-credential validation and issuance.
pub trait TokenGate: Send + Sync {
	fn validate_access(&self, token: &str) -> Result<AccessGrant, TokenError>;

	fn validate_refresh(&self, token: &str) -> Result<UserId, TokenError>;

	fn issue_access(&self, user: &UserId, rooms: &[RoomId]) -> Result<String, TokenError>;

	fn issue_refresh(&self, user: &UserId) -> Result<String, TokenError>;
}

#[derive(Debug, Clone)]
pub struct TokenSettings {
	pub access_secret: SecretString,
	pub refresh_secret: SecretString,
	pub access_ttl: Duration,
	pub refresh_ttl: Duration,
	pub issuer: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TokenKind {
	Access,
	Refresh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
	sub: String,
	typ: TokenKind,
	iss: String,
	iat: u64,
	exp: u64,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	rooms: Vec<String>,
}

/// `v1.<base64url(claims)>.<base64url(hmac-sha256)>` tokens with one secret per token kind.
#[derive(Debug, Clone)]
pub struct HmacTokenGate {
	settings: TokenSettings,
}

impl HmacTokenGate {
	pub fn new(settings: TokenSettings) -> Self {
		Self { settings }
	}

	fn secret(&self, kind: TokenKind) -> &[u8] {
		match kind {
			TokenKind::Access => self.settings.access_secret.expose().as_bytes(),
			TokenKind::Refresh => self.settings.refresh_secret.expose().as_bytes(),
		}
	}

	fn ttl(&self, kind: TokenKind) -> Duration {
		match kind {
			TokenKind::Access => self.settings.access_ttl,
			TokenKind::Refresh => self.settings.refresh_ttl,
		}
	}

	fn issue_at(&self, kind: TokenKind, user: &UserId, rooms: &[RoomId], now: u64) -> Result<String, TokenError> {
		let claims = Claims {
			sub: user.as_str().to_string(),
			typ: kind,
			iss: self.settings.issuer.clone(),
			iat: now,
			exp: now.saturating_add(self.ttl(kind).as_secs()),
			rooms: rooms.iter().map(|r| r.as_str().to_string()).collect(),
		};

		let payload = serde_json::to_vec(&claims).map_err(|e| TokenError::InvalidClaims(e.to_string()))?;
		let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
		let sig = sign(payload_b64.as_bytes(), self.secret(kind))?;

		Ok(format!("{TOKEN_VERSION}.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig)))
	}

	fn verify_at(&self, token: &str, kind: TokenKind, now: u64) -> Result<Claims, TokenError> {
		let mut parts = token.trim().split('.');
		let (Some(version), Some(payload_b64), Some(sig_b64), None) = (parts.next(), parts.next(), parts.next(), parts.next())
		else {
			return Err(TokenError::Malformed("expected three segments"));
		};
		if version != TOKEN_VERSION {
			return Err(TokenError::Malformed("unknown version"));
		}

		let provided = URL_SAFE_NO_PAD
			.decode(sig_b64)
			.map_err(|_| TokenError::Malformed("signature is not base64url"))?;
		let expected = sign(payload_b64.as_bytes(), self.secret(kind))?;
		if !constant_time_eq(&expected, &provided) {
			return Err(TokenError::BadSignature);
		}

		let payload = URL_SAFE_NO_PAD
			.decode(payload_b64)
			.map_err(|_| TokenError::Malformed("payload is not base64url"))?;
		let claims: Claims = serde_json::from_slice(&payload).map_err(|e| TokenError::InvalidClaims(e.to_string()))?;

		if claims.typ != kind {
			return Err(TokenError::WrongKind);
		}
		if claims.iss != self.settings.issuer {
			return Err(TokenError::WrongIssuer);
		}
		if claims.exp <= now {
			return Err(TokenError::Expired);
		}

		Ok(claims)
	}

	fn grant_from(claims: Claims) -> Result<AccessGrant, TokenError> {
		let user = UserId::new(claims.sub).map_err(|e| TokenError::InvalidClaims(e.to_string()))?;
		let rooms = claims
			.rooms
			.into_iter()
			.map(RoomId::new)
			.collect::<Result<Vec<_>, _>>()
			.map_err(|e| TokenError::InvalidClaims(e.to_string()))?;
		if rooms.is_empty() {
			return Err(TokenError::NoRooms);
		}
		Ok(AccessGrant { user, rooms })
	}
}

impl TokenGate for HmacTokenGate {
	fn validate_access(&self, token: &str) -> Result<AccessGrant, TokenError> {
		let claims = self.verify_at(token, TokenKind::Access, unix_secs_now())?;
		Self::grant_from(claims)
	}

	fn validate_refresh(&self, token: &str) -> Result<UserId, TokenError> {
		let claims = self.verify_at(token, TokenKind::Refresh, unix_secs_now())?;
		UserId::new(claims.sub).map_err(|e| TokenError::InvalidClaims(e.to_string()))
	}

	fn issue_access(&self, user: &UserId, rooms: &[RoomId]) -> Result<String, TokenError> {
		if rooms.is_empty() {
			return Err(TokenError::NoRooms);
		}
		self.issue_at(TokenKind::Access, user, rooms, unix_secs_now())
	}

	fn issue_refresh(&self, user: &UserId) -> Result<String, TokenError> {
		self.issue_at(TokenKind::Refresh, user, &[], unix_secs_now())
	}
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Result<Vec<u8>, TokenError> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|_| TokenError::Malformed("signing key"))?;
	mac.update(payload_b64);
	Ok(mac.finalize().into_bytes().to_vec())
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}
