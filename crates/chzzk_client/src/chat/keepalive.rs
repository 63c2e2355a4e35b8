#![forbid(unsafe_code)]

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ChatError;

/// Idle period after which a PING is sent.
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(20);

#[async_trait]
pub(crate) trait PingTarget: Send + Sync + 'static {
	async fn send_ping(&self) -> Result<(), ChatError>;
}

struct KeepAliveTask {
	cancel: CancellationToken,
	reset: Arc<Notify>,
	handle: JoinHandle<()>,
}

/// Single idle timer that pings the server when nothing has arrived for a while.
pub(crate) struct KeepAliveScheduler {
	period: Duration,
	task: Mutex<Option<KeepAliveTask>>,
}

impl KeepAliveScheduler {
	pub(crate) fn new(period: Duration) -> Self {
		Self {
			period,
			task: Mutex::new(None),
		}
	}

	/// Restart the idle timer, spawning the timer task if it is not running.
	pub(crate) fn touch<T: PingTarget>(&self, target: Weak<T>) {
		let mut task = self.task.lock();
		if let Some(running) = task.as_ref()
			&& !running.handle.is_finished()
		{
			running.reset.notify_one();
			return;
		}

		let cancel = CancellationToken::new();
		let reset = Arc::new(Notify::new());
		let handle = tokio::spawn(run_keepalive(self.period, target, cancel.clone(), reset.clone()));
		*task = Some(KeepAliveTask { cancel, reset, handle });
	}

	pub(crate) fn stop(&self) {
		if let Some(task) = self.task.lock().take() {
			task.cancel.cancel();
		}
	}

	pub(crate) fn is_running(&self) -> bool {
		self.task.lock().as_ref().is_some_and(|t| !t.handle.is_finished())
	}
}

impl Drop for KeepAliveScheduler {
	fn drop(&mut self) {
		self.stop();
	}
}

async fn run_keepalive<T: PingTarget>(period: Duration, target: Weak<T>, cancel: CancellationToken, reset: Arc<Notify>) {
	loop {
		tokio::select! {
			biased;
			() = cancel.cancelled() => break,
			() = reset.notified() => continue,
			() = tokio::time::sleep(period) => {
				let Some(target) = target.upgrade() else {
					break;
				};

				debug!(period_secs = period.as_secs(), "chat idle; sending ping");
				metrics::counter!("chzzk_chat_pings_total").increment(1);
				match target.send_ping().await {
					Ok(()) => {}
					Err(ChatError::NotOpen) => {
						debug!("websocket closed; keep-alive stopped");
						break;
					}
					Err(err) => warn!(error = %err, "keep-alive ping failed"),
				}
			}
		}
	}
}
