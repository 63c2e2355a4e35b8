#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use chzzk_client::api::{DEFAULT_API_BASE_URL, DEFAULT_GAME_BASE_URL};
use chzzk_client::chat::{DEFAULT_POLL_INTERVAL, DEFAULT_RECENT_CHAT_COUNT};
use chzzk_client::{ApiConfig, NidAuth, SecretString};
use chzzk_protocol::OsType;
use chzzk_util::endpoint::validate_ws_endpoint;
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.chzzk/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".chzzk").join("config.toml"))
}

/// Load the config from TOML at `path`, then apply `CHZZK_*` env overrides.
pub fn load_config_from_path(path: &Path) -> anyhow::Result<CliConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = CliConfig::from_file(file_cfg)?;
	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
	Ok(cfg)
}

#[derive(Debug, Clone)]
pub struct CliConfig {
	/// Channel to join.
	pub channel: Option<String>,
	/// Preset chat channel id; skips the live-status lookup.
	pub chat_channel_id: Option<String>,
	/// Preset chat access token; skips token issuance.
	pub access_token: Option<SecretString>,
	/// Chat channel id poll interval; zero disables polling.
	pub poll_interval: Duration,
	/// Websocket connect timeout; zero waits indefinitely.
	pub connect_timeout: Duration,
	/// Messages requested once the chat handshake completes; zero skips the request.
	pub recent_chat_count: u32,
	pub os_type: OsType,
	/// Websocket URL used instead of the shard picked from the chat channel id.
	pub chat_server_url: Option<String>,
	pub api: ApiSettings,
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
	pub base_url: String,
	pub game_base_url: String,
	pub nid_aut: Option<SecretString>,
	pub nid_ses: Option<SecretString>,
	pub timeout: Duration,
}

impl Default for CliConfig {
	fn default() -> Self {
		Self {
			channel: None,
			chat_channel_id: None,
			access_token: None,
			poll_interval: DEFAULT_POLL_INTERVAL,
			connect_timeout: Duration::from_secs(10),
			recent_chat_count: DEFAULT_RECENT_CHAT_COUNT,
			os_type: OsType::Pc,
			chat_server_url: None,
			api: ApiSettings::default(),
		}
	}
}

impl Default for ApiSettings {
	fn default() -> Self {
		Self {
			base_url: DEFAULT_API_BASE_URL.to_string(),
			game_base_url: DEFAULT_GAME_BASE_URL.to_string(),
			nid_aut: None,
			nid_ses: None,
			timeout: Duration::from_secs(10),
		}
	}
}

impl CliConfig {
	/// API client settings. Cookies are only attached when both halves are present.
	pub fn api_config(&self) -> ApiConfig {
		let auth = match (&self.api.nid_aut, &self.api.nid_ses) {
			(Some(aut), Some(ses)) => Some(NidAuth::new(aut.expose(), ses.expose())),
			(None, None) => None,
			_ => {
				warn!("api config: only one of nid_aut/nid_ses set; connecting anonymously");
				None
			}
		};

		ApiConfig {
			api_base_url: self.api.base_url.clone(),
			game_base_url: self.api.game_base_url.clone(),
			auth,
			timeout: self.api.timeout,
		}
	}

	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let defaults = Self::default();

		let chat_server_url = file.chat_server_url.filter(|s| !s.trim().is_empty());
		if let Some(url) = chat_server_url.as_deref() {
			validate_ws_endpoint(url).map_err(|e| anyhow!(e).context("invalid chat_server_url"))?;
		}

		Ok(Self {
			channel: file.channel.filter(|s| !s.trim().is_empty()),
			chat_channel_id: file.chat_channel_id.filter(|s| !s.trim().is_empty()),
			access_token: file
				.access_token
				.filter(|s| !s.trim().is_empty())
				.map(SecretString::new),
			poll_interval: file
				.poll_interval_secs
				.map(Duration::from_secs)
				.unwrap_or(defaults.poll_interval),
			connect_timeout: file
				.connect_timeout_secs
				.map(Duration::from_secs)
				.unwrap_or(defaults.connect_timeout),
			recent_chat_count: file.recent_chat_count.unwrap_or(defaults.recent_chat_count),
			os_type: file.os_type.unwrap_or(defaults.os_type),
			chat_server_url,
			api: ApiSettings {
				base_url: file
					.api
					.base_url
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(defaults.api.base_url),
				game_base_url: file
					.api
					.game_base_url
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(defaults.api.game_base_url),
				nid_aut: file.api.nid_aut.filter(|s| !s.trim().is_empty()).map(SecretString::new),
				nid_ses: file.api.nid_ses.filter(|s| !s.trim().is_empty()).map(SecretString::new),
				timeout: file
					.api
					.timeout_secs
					.map(Duration::from_secs)
					.unwrap_or(defaults.api.timeout),
			},
		})
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	channel: Option<String>,
	chat_channel_id: Option<String>,
	access_token: Option<String>,
	poll_interval_secs: Option<u64>,
	connect_timeout_secs: Option<u64>,
	recent_chat_count: Option<u32>,
	os_type: Option<OsType>,
	chat_server_url: Option<String>,

	#[serde(default)]
	api: FileApiSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileApiSettings {
	base_url: Option<String>,
	game_base_url: Option<String>,
	nid_aut: Option<String>,
	nid_ses: Option<String>,
	timeout_secs: Option<u64>,
}

fn parse_os_type(v: &str) -> Option<OsType> {
	match v.trim().to_ascii_uppercase().as_str() {
		"PC" => Some(OsType::Pc),
		"AOS" | "ANDROID" => Some(OsType::Aos),
		"IOS" => Some(OsType::Ios),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut CliConfig, env: impl Fn(&str) -> Option<String>) {
	let non_empty = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = non_empty("CHZZK_CHANNEL") {
		cfg.channel = Some(v);
		info!("chat config: channel overridden by env");
	}

	if let Some(v) = non_empty("CHZZK_CHAT_CHANNEL_ID") {
		cfg.chat_channel_id = Some(v);
		info!("chat config: chat_channel_id overridden by env");
	}

	if let Some(v) = non_empty("CHZZK_ACCESS_TOKEN") {
		cfg.access_token = Some(SecretString::new(v));
		info!("chat auth: access_token overridden by env");
	}

	if let Some(v) = non_empty("CHZZK_POLL_INTERVAL_SECS")
		&& let Ok(secs) = v.parse::<u64>()
	{
		cfg.poll_interval = Duration::from_secs(secs);
		info!(secs, "chat config: poll_interval overridden by env");
	}

	if let Some(v) = non_empty("CHZZK_CONNECT_TIMEOUT_SECS")
		&& let Ok(secs) = v.parse::<u64>()
	{
		cfg.connect_timeout = Duration::from_secs(secs);
		info!(secs, "chat config: connect_timeout overridden by env");
	}

	if let Some(v) = non_empty("CHZZK_RECENT_CHAT_COUNT")
		&& let Ok(count) = v.parse::<u32>()
	{
		cfg.recent_chat_count = count;
		info!(count, "chat config: recent_chat_count overridden by env");
	}

	if let Some(v) = non_empty("CHZZK_OS_TYPE") {
		match parse_os_type(&v) {
			Some(os_type) => {
				cfg.os_type = os_type;
				info!(?os_type, "chat config: os_type overridden by env");
			}
			None => warn!(value = %v, "chat config: ignoring unknown CHZZK_OS_TYPE"),
		}
	}

	if let Some(v) = non_empty("CHZZK_CHAT_SERVER_URL") {
		match validate_ws_endpoint(&v) {
			Ok(()) => {
				cfg.chat_server_url = Some(v);
				info!("chat config: chat_server_url overridden by env");
			}
			Err(e) => warn!(error = %e, "chat config: ignoring invalid CHZZK_CHAT_SERVER_URL"),
		}
	}

	if let Some(v) = non_empty("CHZZK_API_BASE_URL") {
		cfg.api.base_url = v;
		info!("api config: base_url overridden by env");
	}

	if let Some(v) = non_empty("CHZZK_GAME_BASE_URL") {
		cfg.api.game_base_url = v;
		info!("api config: game_base_url overridden by env");
	}

	if let Some(v) = non_empty("CHZZK_NID_AUT") {
		cfg.api.nid_aut = Some(SecretString::new(v));
		info!("api auth: nid_aut overridden by env");
	}

	if let Some(v) = non_empty("CHZZK_NID_SES") {
		cfg.api.nid_ses = Some(SecretString::new(v));
		info!("api auth: nid_ses overridden by env");
	}

	if let Some(v) = non_empty("CHZZK_API_TIMEOUT_SECS")
		&& let Ok(secs) = v.parse::<u64>()
	{
		cfg.api.timeout = Duration::from_secs(secs);
		info!(secs, "api config: timeout overridden by env");
	}
}
