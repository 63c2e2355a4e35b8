#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, COOKIE, USER_AGENT};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::MetadataSource;
use super::types::{AccessToken, LiveStatus, UserStatus, decode_envelope};
use crate::{ChatError, SecretString};

pub const DEFAULT_API_BASE_URL: &str = "https://api.chzzk.naver.com";
pub const DEFAULT_GAME_BASE_URL: &str = "https://comm-api.game.naver.com/nng_main";

const CLIENT_USER_AGENT: &str = "chzzk-chat/0.1";

/// `NID_AUT` / `NID_SES` session cookies of a signed-in Naver account.
#[derive(Debug, Clone, Default)]
pub struct NidAuth {
	pub aut: SecretString,
	pub ses: SecretString,
}

impl NidAuth {
	pub fn new(aut: impl Into<String>, ses: impl Into<String>) -> Self {
		Self {
			aut: SecretString::new(aut),
			ses: SecretString::new(ses),
		}
	}

	pub fn is_complete(&self) -> bool {
		!self.aut.is_empty() && !self.ses.is_empty()
	}

	fn cookie_header(&self) -> String {
		format!("NID_AUT={}; NID_SES={}", self.aut.expose().trim(), self.ses.expose().trim())
	}
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
	pub api_base_url: String,
	pub game_base_url: String,
	pub auth: Option<NidAuth>,
	/// Per-request timeout; zero disables it.
	pub timeout: Duration,
}

impl ApiConfig {
	pub fn new() -> Self {
		Self {
			api_base_url: DEFAULT_API_BASE_URL.to_string(),
			game_base_url: DEFAULT_GAME_BASE_URL.to_string(),
			auth: None,
			timeout: Duration::from_secs(10),
		}
	}
}

impl Default for ApiConfig {
	fn default() -> Self {
		Self::new()
	}
}

/// HTTP client for the live-status, access-token and user-status endpoints.
#[derive(Debug, Clone)]
pub struct ChzzkApiClient {
	cfg: ApiConfig,
	client: reqwest::Client,
}

impl ChzzkApiClient {
	pub fn new(cfg: ApiConfig) -> Result<Self, ChatError> {
		let mut builder = reqwest::Client::builder();
		if !cfg.timeout.is_zero() {
			builder = builder.timeout(cfg.timeout);
		}
		let client = builder
			.build()
			.map_err(|e| ChatError::Api(format!("build http client: {e}")))?;
		Ok(Self { cfg, client })
	}

	pub fn config(&self) -> &ApiConfig {
		&self.cfg
	}

	pub fn set_auth(&mut self, auth: NidAuth) {
		self.cfg.auth = Some(auth);
	}

	pub fn clear_auth(&mut self) {
		self.cfg.auth = None;
	}

	pub fn has_auth(&self) -> bool {
		self.cfg.auth.as_ref().is_some_and(NidAuth::is_complete)
	}

	fn api_url(&self, path: &str) -> String {
		format!("{}{}", self.cfg.api_base_url.trim_end_matches('/'), path)
	}

	fn game_url(&self, path: &str) -> String {
		format!("{}{}", self.cfg.game_base_url.trim_end_matches('/'), path)
	}

	async fn get_content<T: DeserializeOwned>(
		&self,
		what: &str,
		url: String,
		query: &[(&str, &str)],
	) -> Result<Option<T>, ChatError> {
		let mut request = self
			.client
			.get(url)
			.header(ACCEPT, "application/json")
			.header(USER_AGENT, CLIENT_USER_AGENT);
		if !query.is_empty() {
			request = request.query(query);
		}
		if let Some(auth) = self.cfg.auth.as_ref().filter(|a| a.is_complete()) {
			request = request.header(COOKIE, auth.cookie_header());
		}

		let resp = request
			.send()
			.await
			.map_err(|e| ChatError::Api(format!("{what}: {e}")))?;
		let status = resp.status();
		let body = resp
			.bytes()
			.await
			.map_err(|e| ChatError::Api(format!("{what}: read body: {e}")))?;

		debug!(endpoint = what, %status, len = body.len(), "chzzk api response");

		// Error statuses still carry the envelope; fall back to the HTTP status if not.
		match decode_envelope(&body) {
			Err(ChatError::Api(reason)) if !status.is_success() => {
				Err(ChatError::Api(format!("{what} failed: status={status} ({reason})")))
			}
			other => other,
		}
	}

	pub async fn live_status(&self, channel_id: &str) -> Result<Option<LiveStatus>, ChatError> {
		let url = self.api_url(&format!(
			"/polling/v2/channels/{}/live-status",
			urlencoding::encode(channel_id)
		));
		self.get_content("live status", url, &[]).await
	}

	pub async fn access_token(&self, chat_channel_id: &str) -> Result<AccessToken, ChatError> {
		let url = self.game_url("/v1/chats/access-token");
		self.get_content(
			"access token",
			url,
			&[("channelId", chat_channel_id), ("chatType", "STREAMING")],
		)
		.await?
		.ok_or_else(|| ChatError::Api("access token response had no content".to_string()))
	}

	pub async fn user_status(&self) -> Result<Option<UserStatus>, ChatError> {
		let url = self.game_url("/v1/user/getUserStatus");
		self.get_content("user status", url, &[]).await
	}
}

#[async_trait]
impl MetadataSource for ChzzkApiClient {
	async fn resolve_chat_channel_id(&self, channel_id: &str) -> Result<Option<String>, ChatError> {
		let status = self.live_status(channel_id).await?;
		Ok(status.and_then(|s| s.chat_channel_id().map(str::to_string)))
	}

	async fn issue_access_token(&self, chat_channel_id: &str) -> Result<AccessToken, ChatError> {
		self.access_token(chat_channel_id).await
	}

	async fn resolve_user_id_hash(&self) -> Result<Option<String>, ChatError> {
		if !self.has_auth() {
			return Ok(None);
		}
		let user = self.user_status().await?;
		Ok(user
			.and_then(|u| u.user_id_hash)
			.filter(|id| !id.trim().is_empty()))
	}
}
