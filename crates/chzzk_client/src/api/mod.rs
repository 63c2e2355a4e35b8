#![forbid(unsafe_code)]

pub mod client;
pub mod types;

use async_trait::async_trait;

use crate::ChatError;

pub use client::{ApiConfig, ChzzkApiClient, DEFAULT_API_BASE_URL, DEFAULT_GAME_BASE_URL, NidAuth};
pub use types::{AccessToken, LiveStatus, TemporaryRestrict, UserStatus};

/// Metadata lookups the chat session depends on.
#[async_trait]
pub trait MetadataSource: Send + Sync + 'static {
	/// Current chat channel id of a channel, `None` when there is none (offline or restricted).
	async fn resolve_chat_channel_id(&self, channel_id: &str) -> Result<Option<String>, ChatError>;

	async fn issue_access_token(&self, chat_channel_id: &str) -> Result<AccessToken, ChatError>;

	/// User id hash of the signed-in user, `None` when anonymous.
	async fn resolve_user_id_hash(&self) -> Result<Option<String>, ChatError>;
}
