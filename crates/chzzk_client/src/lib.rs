#![forbid(unsafe_code)]

pub mod api;
pub mod chat;

use std::fmt;

use chzzk_protocol::CodecError;
use thiserror::Error;

pub use api::{AccessToken, ApiConfig, ChzzkApiClient, LiveStatus, MetadataSource, NidAuth, UserStatus};
pub use chat::{ChatOptions, ChatSession, EventCategory, WsConnector};

/// Errors surfaced by the chat engine and the metadata client.
#[derive(Debug, Error)]
pub enum ChatError {
	#[error("chat channel id is missing; the live may be restricted and require a signed-in user")]
	NotReady,

	#[error("chat session is already connected")]
	AlreadyConnected,

	#[error("chat session is not connected")]
	NotConnected,

	#[error("websocket is already open")]
	AlreadyOpen,

	#[error("websocket is not open")]
	NotOpen,

	#[error("sending chat requires a signed-in user")]
	NotAuthenticated,

	#[error("transport error: {0}")]
	Transport(String),

	#[error("decode error: {0}")]
	Decode(#[from] CodecError),

	#[error("upstream returned code {code}: {message}")]
	UpstreamStatus {
		code: i64,
		message: String,
	},

	#[error("api error: {0}")]
	Api(String),
}

/// Wrapper that redacts in logs.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.trim().is_empty()
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

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}
