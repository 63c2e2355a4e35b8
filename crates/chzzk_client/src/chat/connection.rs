#![forbid(unsafe_code)]

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::ChatError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ChatWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<ChatWs>> + Send + Sync>;

type WsSink = SplitSink<ChatWs, Message>;
type WsStream = SplitStream<ChatWs>;

/// Pause before retrying a read that would have blocked.
const RETRY_PAUSE: Duration = Duration::from_millis(10);

async fn connect_chat_ws(url: Url) -> anyhow::Result<ChatWs> {
	let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
		.await
		.context("connect_async to chat server")?;
	Ok(ws)
}

pub fn default_connector() -> WsConnector {
	Arc::new(|url: Url| Box::pin(async move { connect_chat_ws(url).await }) as BoxFuture<'static, anyhow::Result<ChatWs>>)
}

/// Receiver of complete inbound messages, called on the receive task.
#[async_trait]
pub(crate) trait InboundHandler: Send + Sync + 'static {
	async fn on_message(&self, text: String);

	/// The receive loop ended for a reason other than `close()`.
	async fn on_transport_error(&self, err: ChatError);
}

struct ReceiveTask {
	cancel: CancellationToken,
	handle: JoinHandle<()>,
}

/// Owns the websocket. Writes are serialized through the sink lock; reads happen on
/// a dedicated receive task.
pub(crate) struct ConnectionManager {
	connector: WsConnector,
	sink: tokio::sync::Mutex<Option<WsSink>>,
	pending_stream: parking_lot::Mutex<Option<WsStream>>,
	receiver: parking_lot::Mutex<Option<ReceiveTask>>,
}

impl ConnectionManager {
	pub(crate) fn new(connector: WsConnector) -> Self {
		Self {
			connector,
			sink: tokio::sync::Mutex::new(None),
			pending_stream: parking_lot::Mutex::new(None),
			receiver: parking_lot::Mutex::new(None),
		}
	}

	/// Connects to `url`. A zero `timeout` waits indefinitely.
	pub(crate) async fn open(&self, url: &str, timeout: Duration) -> Result<(), ChatError> {
		let mut sink = self.sink.lock().await;
		if sink.is_some() {
			return Err(ChatError::AlreadyOpen);
		}

		let url = Url::parse(url).map_err(|e| ChatError::Transport(format!("invalid chat url {url}: {e}")))?;
		let connecting = (self.connector)(url);
		let connected = if timeout.is_zero() {
			connecting.await
		} else {
			tokio::time::timeout(timeout, connecting)
				.await
				.map_err(|_| ChatError::Transport(format!("connect timed out after {timeout:?}")))?
		};
		let ws = connected.map_err(|e| ChatError::Transport(format!("{e:#}")))?;

		let (write, read) = ws.split();
		*sink = Some(write);
		*self.pending_stream.lock() = Some(read);
		Ok(())
	}

	pub(crate) async fn send(&self, text: String) -> Result<(), ChatError> {
		let mut sink = self.sink.lock().await;
		let Some(write) = sink.as_mut() else {
			return Err(ChatError::NotOpen);
		};
		write
			.send(Message::Text(text.into()))
			.await
			.map_err(|e| ChatError::Transport(e.to_string()))
	}

	/// Spawns the receive loop over the stream half produced by `open`.
	pub(crate) fn start_receiving(&self, handler: Arc<dyn InboundHandler>) -> Result<(), ChatError> {
		let stream = self.pending_stream.lock().take().ok_or(ChatError::NotOpen)?;
		let cancel = CancellationToken::new();
		let handle = tokio::spawn(receive_loop(stream, handler, cancel.clone()));

		if let Some(previous) = self.receiver.lock().replace(ReceiveTask { cancel, handle }) {
			previous.cancel.cancel();
			previous.handle.abort();
		}
		Ok(())
	}

	/// Stops the receive task, sends a best-effort close frame and waits for the
	/// receive task to finish. Must not be called from the receive task.
	pub(crate) async fn close(&self) {
		let receiver = self.receiver.lock().take();
		if let Some(task) = receiver.as_ref() {
			task.cancel.cancel();
		}

		if let Some(mut write) = self.sink.lock().await.take() {
			if let Err(err) = write.send(Message::Close(None)).await {
				debug!(error = %err, "close frame not delivered");
			}
			let _ = write.close().await;
		}
		self.pending_stream.lock().take();

		if let Some(task) = receiver
			&& let Err(err) = task.handle.await
			&& !err.is_cancelled()
		{
			warn!(error = %err, "chat receive task panicked");
		}
	}

	/// Non-blocking `close`: aborts the receive task and hands the sink to a detached
	/// task that sends the close frame. Without a runtime the socket is just dropped.
	pub(crate) fn close_detached(&self) {
		if let Some(task) = self.receiver.lock().take() {
			task.cancel.cancel();
			task.handle.abort();
		}
		self.pending_stream.lock().take();

		let Some(mut write) = self.sink.try_lock().ok().and_then(|mut sink| sink.take()) else {
			return;
		};
		if let Ok(handle) = tokio::runtime::Handle::try_current() {
			handle.spawn(async move {
				if let Err(err) = write.send(Message::Close(None)).await {
					debug!(error = %err, "close frame not delivered");
				}
				let _ = write.close().await;
			});
		}
	}
}

fn is_transient(err: &tungstenite::Error) -> bool {
	matches!(err, tungstenite::Error::Io(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted))
}

async fn receive_loop(mut stream: WsStream, handler: Arc<dyn InboundHandler>, cancel: CancellationToken) {
	loop {
		let next = tokio::select! {
			biased;
			() = cancel.cancelled() => break,
			next = stream.next() => next,
		};

		match next {
			Some(Ok(Message::Text(text))) => handler.on_message(text.to_string()).await,
			Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
				Ok(text) => handler.on_message(text).await,
				Err(_) => warn!(len = bytes.len(), "dropping non-utf8 binary chat frame"),
			},
			Some(Ok(Message::Close(frame))) => {
				if !cancel.is_cancelled() {
					warn!(?frame, "chat websocket closed by server");
					handler
						.on_transport_error(ChatError::Transport(format!("closed by server: {frame:?}")))
						.await;
				}
				break;
			}
			Some(Ok(_)) => {}
			Some(Err(err)) if is_transient(&err) => tokio::time::sleep(RETRY_PAUSE).await,
			Some(Err(err)) => {
				if !cancel.is_cancelled() {
					warn!(error = %err, "chat websocket error");
					handler.on_transport_error(ChatError::Transport(err.to_string())).await;
				}
				break;
			}
			None => {
				if !cancel.is_cancelled() {
					warn!("chat websocket stream ended");
					handler
						.on_transport_error(ChatError::Transport("connection closed".to_string()))
						.await;
				}
				break;
			}
		}
	}
	debug!("chat receive loop finished");
}
