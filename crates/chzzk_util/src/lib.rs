#![forbid(unsafe_code)]

pub mod endpoint {
	/// Number of chat server shards.
	pub const CHAT_SHARD_COUNT: u32 = 9;

	/// Chat server shard picked deterministically from a chat channel id.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
	pub struct ChatServerEndpoint {
		shard: u32,
	}

	impl ChatServerEndpoint {
		/// Sum of the id's bytes modulo the shard count, 1-based.
		pub fn for_chat_channel(chat_channel_id: &str) -> Self {
			let sum = chat_channel_id
				.bytes()
				.fold(0u32, |acc, b| acc.wrapping_add(u32::from(b)));
			Self {
				shard: sum % CHAT_SHARD_COUNT + 1,
			}
		}

		pub fn shard(&self) -> u32 {
			self.shard
		}

		pub fn host(&self) -> String {
			format!("kr-ss{}.chat.naver.com", self.shard)
		}

		pub fn url(&self) -> String {
			format!("wss://{}/chat", self.host())
		}
	}

	/// Parsed `ws://` / `wss://` URL used to override the chat server.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct WsEndpoint {
		pub secure: bool,
		pub host: String,
		pub port: Option<u16>,
		pub path: String,
	}

	impl WsEndpoint {
		pub fn to_url(&self) -> String {
			let scheme = if self.secure { "wss" } else { "ws" };
			match self.port {
				Some(port) => format!("{scheme}://{}:{port}{}", self.host, self.path),
				None => format!("{scheme}://{}{}", self.host, self.path),
			}
		}

		/// Parse `ws[s]://host[:port][/path]`.
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("endpoint must be non-empty (expected wss://host[:port]/path)".to_string());
			}

			let (secure, rest) = if let Some(rest) = s.strip_prefix("wss://") {
				(true, rest)
			} else if let Some(rest) = s.strip_prefix("ws://") {
				(false, rest)
			} else {
				return Err(format!("invalid endpoint (expected ws:// or wss://): {s}"));
			};

			if rest.contains('?') || rest.contains('#') {
				return Err(format!("invalid endpoint (query/fragment not allowed): {s}"));
			}

			let (authority, path) = match rest.find('/') {
				Some(idx) => (&rest[..idx], &rest[idx..]),
				None => (rest, "/"),
			};

			let (host, port) = if authority.starts_with('[') {
				let end = authority
					.find(']')
					.ok_or_else(|| format!("invalid endpoint host (unterminated IPv6 literal): {s}"))?;
				let host = &authority[..=end];
				match &authority[end + 1..] {
					"" => (host, None),
					tail => {
						let port = tail
							.strip_prefix(':')
							.ok_or_else(|| format!("invalid endpoint (junk after IPv6 literal): {s}"))?;
						(host, Some(parse_port(port, s)?))
					}
				}
			} else {
				if authority.matches(':').count() > 1 {
					return Err(format!(
						"invalid endpoint host (IPv6 must be bracketed like ws://[::1]:8080): {s}"
					));
				}
				match authority.rsplit_once(':') {
					Some((host, port)) => (host, Some(parse_port(port, s)?)),
					None => (authority, None),
				}
			};

			if host.trim().is_empty() {
				return Err(format!("invalid endpoint host: {s}"));
			}

			Ok(Self {
				secure,
				host: host.to_string(),
				port,
				path: path.to_string(),
			})
		}
	}

	fn parse_port(port: &str, original: &str) -> Result<u16, String> {
		match port.trim().parse::<u16>() {
			Ok(0) | Err(_) => Err(format!("invalid endpoint port (expected 1..=65535): {original}")),
			Ok(port) => Ok(port),
		}
	}

	/// Validate `ws[s]://host[:port][/path]`.
	pub fn validate_ws_endpoint(s: &str) -> Result<(), String> {
		let _ = WsEndpoint::parse(s)?;
		Ok(())
	}

}

pub mod time {
	use std::time::{SystemTime, UNIX_EPOCH};

	/// Milliseconds since the unix epoch; 0 if the clock is before it.
	pub fn epoch_millis() -> u64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
			.unwrap_or_default()
	}
}
