#![forbid(unsafe_code)]

use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ChatError;

/// Default interval between chat channel id checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[async_trait]
pub(crate) trait RotationTarget: Send + Sync + 'static {
	fn is_connected(&self) -> bool;

	fn chat_channel_id(&self) -> String;

	async fn fetch_chat_channel_id(&self) -> Result<Option<String>, ChatError>;

	/// Switch to `chat_channel_id` and reconnect.
	async fn rotate_chat_channel(&self, chat_channel_id: String);
}

struct PollerTask {
	cancel: CancellationToken,
	handle: JoinHandle<()>,
}

/// Watches the channel's chat channel id and reconnects when upstream rotates it.
pub(crate) struct ChannelIdentityPoller {
	task: Mutex<Option<PollerTask>>,
}

impl ChannelIdentityPoller {
	pub(crate) fn new() -> Self {
		Self { task: Mutex::new(None) }
	}

	/// Starts polling every `interval`. No-op when already running or when `interval` is zero.
	pub(crate) fn start<T: RotationTarget>(&self, interval: Duration, target: Weak<T>) {
		if interval.is_zero() {
			return;
		}

		let mut task = self.task.lock();
		if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
			return;
		}

		let cancel = CancellationToken::new();
		let handle = tokio::spawn(run_poller(interval, target, cancel.clone()));
		*task = Some(PollerTask { cancel, handle });
	}

	/// Cancels the task without waiting for it; the task may be the caller.
	pub(crate) fn stop(&self) {
		if let Some(task) = self.task.lock().take() {
			task.cancel.cancel();
		}
	}

	pub(crate) fn is_running(&self) -> bool {
		self.task.lock().as_ref().is_some_and(|t| !t.handle.is_finished())
	}
}

impl Drop for ChannelIdentityPoller {
	fn drop(&mut self) {
		self.stop();
	}
}

async fn run_poller<T: RotationTarget>(interval: Duration, target: Weak<T>, cancel: CancellationToken) {
	let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
	ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

	loop {
		tokio::select! {
			biased;
			() = cancel.cancelled() => break,
			_ = ticker.tick() => {}
		}

		let Some(target) = target.upgrade() else {
			break;
		};
		if !target.is_connected() {
			debug!("session disconnected; chat channel poller stopped");
			break;
		}

		let fetched = tokio::select! {
			biased;
			() = cancel.cancelled() => break,
			fetched = target.fetch_chat_channel_id() => fetched,
		};

		let current = target.chat_channel_id();
		match fetched {
			Ok(Some(next)) if !next.is_empty() && next != current => {
				if cancel.is_cancelled() {
					break;
				}
				info!(from = %current, to = %next, "chat channel id rotated; reconnecting");
				target.rotate_chat_channel(next).await;
			}
			Ok(_) => debug!(chat_channel_id = %current, "chat channel id unchanged"),
			Err(err) => warn!(error = %err, "chat channel id poll failed"),
		}
	}
}
