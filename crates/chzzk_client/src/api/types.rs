#![forbid(unsafe_code)]

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::{ChatError, SecretString};

/// `{code, message, content}` wrapper around every API response.
#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
	code: i64,
	#[serde(default)]
	message: Option<String>,
	content: Option<T>,
}

/// Decode an envelope; a `code` other than 200 is an upstream failure.
pub(crate) fn decode_envelope<T: DeserializeOwned>(body: &[u8]) -> Result<Option<T>, ChatError> {
	let envelope: ApiEnvelope<T> =
		serde_json::from_slice(body).map_err(|e| ChatError::Api(format!("parse response envelope: {e}")))?;
	if envelope.code != 200 {
		return Err(ChatError::UpstreamStatus {
			code: envelope.code,
			message: envelope.message.unwrap_or_default(),
		});
	}
	Ok(envelope.content)
}

/// Live polling status of a channel.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LiveStatus {
	pub live_title: Option<String>,
	pub status: Option<String>,
	pub concurrent_user_count: u64,
	pub accumulate_count: u64,
	pub chat_channel_id: Option<String>,
	pub adult: bool,
	pub chat_active: bool,
	pub chat_available_group: Option<String>,
	pub chat_available_condition: Option<String>,
	pub min_follower_minute: u64,
	pub user_adult_status: Option<String>,
	pub tags: Option<Vec<String>>,
	pub category_type: Option<String>,
	pub live_category: Option<String>,
	pub live_category_value: Option<String>,
}

impl LiveStatus {
	pub fn is_live(&self) -> bool {
		self.status.as_deref() == Some("OPEN")
	}

	/// Chat channel id, if present and non-blank.
	pub fn chat_channel_id(&self) -> Option<&str> {
		self.chat_channel_id.as_deref().filter(|s| !s.trim().is_empty())
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TemporaryRestrict {
	pub temporary_restrict: bool,
	pub times: u64,
	pub duration: Option<u64>,
	pub created_time: Option<u64>,
}

/// Chat access token issued for one chat channel.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccessToken {
	pub access_token: SecretString,
	pub extra_token: Option<SecretString>,
	pub real_name_auth: bool,
	pub temporary_restrict: TemporaryRestrict,
}

impl AccessToken {
	pub fn new(access_token: impl Into<String>) -> Self {
		Self {
			access_token: SecretString::new(access_token),
			..Self::default()
		}
	}
}

/// Signed-in user as seen by the chat backend.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserStatus {
	pub has_profile: bool,
	pub user_id_hash: Option<String>,
	pub nickname: Option<String>,
	pub profile_image_url: Option<String>,
	pub logged_in: bool,
	pub verified_mark: bool,
}
