#![forbid(unsafe_code)]

pub mod endpoint {
	use std::net::SocketAddr;

	/// Resolve a `ws://ip:port` listen endpoint. Host names are refused; the gateway binds IP literals only.
	pub fn parse_ws_bind(raw: &str) -> Result<SocketAddr, String> {
		let raw = raw.trim();
		let authority = raw
			.strip_prefix("ws://")
			.ok_or_else(|| format!("bind endpoint must start with ws:// (got {raw:?})"))?;

		if authority.contains(['/', '?', '#']) {
			return Err(format!("bind endpoint takes no path, query or fragment (got {raw:?})"));
		}

		let addr: SocketAddr = authority
			.parse()
			.map_err(|_| format!("bind endpoint needs an IP and port, e.g. ws://127.0.0.1:8080 or ws://[::1]:8080 (got {raw:?})"))?;

		if addr.port() == 0 {
			return Err(format!("bind endpoint port must be non-zero (got {raw:?})"));
		}

		Ok(addr)
	}

}

pub mod secret {
	use core::fmt;

	/// Wrapper that redacts in logs.
	#[derive(Clone, PartialEq, Eq)]
	pub struct SecretString(String);

	impl SecretString {
		pub fn new(s: impl Into<String>) -> Self {
			Self(s.into())
		}

		/// Access the inner secret string.
		pub fn expose(&self) -> &str {
			&self.0
		}
	}

	impl fmt::Debug for SecretString {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			f.write_str("SecretString(<redacted>)")
		}
	}

	impl fmt::Display for SecretString {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			f.write_str("<redacted>")
		}
	}

}

pub use secret::SecretString;
