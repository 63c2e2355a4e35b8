#![forbid(unsafe_code)]

mod config;
mod display;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use chzzk_client::chat::{BoxFuture, ChatWs};
use chzzk_client::{ChatError, ChatOptions, ChatSession, ChzzkApiClient, EventCategory, SecretString, WsConnector};
use tokio::sync::Notify;
use tracing::{info, warn};
use url::Url;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: chzzk_chat [--channel id] [--config path] [--recent N]\n\
\n\
Options:\n\
	--channel   Channel id to join (default: `channel` from the config file)\n\
	--config    Config file (default: ~/.chzzk/config.toml)\n\
	--recent    Recent messages requested after joining (0 disables; default: 50)\n\
	--help      Show this help\n\
\n\
Notes:\n\
	Settings can also be given with CHZZK_* environment variables.\n\
	Set CHZZK_NID_AUT and CHZZK_NID_SES to join as a signed-in user.\n\
\n\
Examples:\n\
	chzzk_chat --channel 0123456789abcdef0123456789abcdef\n\
	RUST_LOG=debug chzzk_chat --config ./chzzk.toml --recent 0\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,chzzk_client=debug".to_string());
	tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[derive(Debug, Default)]
struct Args {
	channel: Option<String>,
	config: Option<PathBuf>,
	recent: Option<u32>,
}

fn parse_args() -> Args {
	let mut args = Args::default();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--channel" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--channel must be non-empty");
					usage_and_exit();
				}
				args.channel = Some(v.trim().to_string());
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.config = Some(PathBuf::from(v));
			}
			"--recent" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let count = v.trim().parse::<u32>().unwrap_or_else(|_| {
					eprintln!("Invalid --recent value: {v}");
					usage_and_exit()
				});
				args.recent = Some(count);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

async fn connect_fixed(target: String) -> anyhow::Result<ChatWs> {
	let (ws, _resp) = tokio_tungstenite::connect_async(target.as_str())
		.await
		.with_context(|| format!("connect_async to {target}"))?;
	Ok(ws)
}

/// Dials `target` regardless of the shard url the session picked.
fn fixed_connector(target: String) -> WsConnector {
	Arc::new(move |_url: Url| Box::pin(connect_fixed(target.clone())) as BoxFuture<'static, anyhow::Result<ChatWs>>)
}

fn register_printers(session: &ChatSession, connected: Arc<Notify>) {
	for category in [
		EventCategory::Chat,
		EventCategory::Donation,
		EventCategory::Subscription,
		EventCategory::SystemMessage,
		EventCategory::Notice,
	] {
		session.add_handler(category, move |payload| {
			if let Some(line) = display::format_event(category, payload) {
				println!("{line}");
			}
		});
	}

	session.add_handler(EventCategory::Connect, move |_| {
		info!("joined chat");
		connected.notify_one();
	});
	session.add_handler(EventCategory::Reconnect, |chat_channel_id| {
		info!(chat_channel_id, "rejoined chat");
	});
	session.add_handler(EventCategory::TransportError, |payload| {
		warn!(payload, "chat connection lost; press Ctrl-C to quit");
	});
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let args = parse_args();

	let path = match args.config {
		Some(path) => path,
		None => config::default_config_path()?,
	};
	let mut cfg = config::load_config_from_path(&path)?;
	if let Some(channel) = args.channel {
		cfg.channel = Some(channel);
	}
	if let Some(count) = args.recent {
		cfg.recent_chat_count = count;
	}

	let Some(channel) = cfg.channel.clone() else {
		eprintln!("No channel given (use --channel, `channel` in the config file, or CHZZK_CHANNEL)");
		usage_and_exit();
	};

	let client = ChzzkApiClient::new(cfg.api_config()).context("build api client")?;
	match client.live_status(&channel).await {
		Ok(Some(status)) => info!(
			channel = %channel,
			live = status.is_live(),
			title = status.live_title.as_deref().unwrap_or_default(),
			viewers = status.concurrent_user_count,
			"channel status"
		),
		Ok(None) => warn!(channel = %channel, "channel has no live status"),
		Err(err) => warn!(channel = %channel, error = %err, "live status lookup failed"),
	}

	let mut options = ChatOptions::new(channel);
	options.chat_channel_id = cfg.chat_channel_id.clone().unwrap_or_default();
	options.access_token = cfg.access_token.clone().unwrap_or_else(SecretString::default);
	options.poll_interval = cfg.poll_interval;
	options.os_type = cfg.os_type;

	let client = Arc::new(client);
	let session = match cfg.chat_server_url.clone() {
		Some(url) => {
			info!(url = %url, "using chat server override");
			ChatSession::with_connector(client, options, fixed_connector(url))
		}
		None => ChatSession::new(client, options),
	};
	session.set_connection_timeout(cfg.connect_timeout);

	let connected = Arc::new(Notify::new());
	register_printers(&session, connected.clone());

	session.connect().await.context("connect to chat")?;

	loop {
		tokio::select! {
			res = tokio::signal::ctrl_c() => {
				res.context("listen for ctrl-c")?;
				break;
			}
			() = connected.notified() => {
				if cfg.recent_chat_count > 0
					&& let Err(err) = session.request_recent_chat(cfg.recent_chat_count).await
				{
					warn!(error = %err, "recent chat request failed");
				}
			}
		}
	}

	info!("closing chat session");
	match session.close().await {
		Ok(()) | Err(ChatError::NotConnected) => Ok(()),
		Err(err) => Err(err).context("close chat session"),
	}
}
