#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chzzk_protocol::codec::{self, ChannelScope, ChatBatch, CodecError, InboundFrame, OsType};
use chzzk_protocol::{Command, ParsedChatPayload};
use chzzk_util::endpoint::ChatServerEndpoint;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::connection::{ConnectionManager, InboundHandler, WsConnector, default_connector};
use super::dispatcher::{EventCategory, EventDispatcher, HandlerId};
use super::keepalive::{KEEPALIVE_PERIOD, KeepAliveScheduler, PingTarget};
use super::poller::{ChannelIdentityPoller, DEFAULT_POLL_INTERVAL, RotationTarget};
use crate::api::MetadataSource;
use crate::{ChatError, SecretString};

/// Number of messages requested by a recent-chat request unless told otherwise.
pub const DEFAULT_RECENT_CHAT_COUNT: u32 = 50;

/// Caller-supplied session settings.
#[derive(Debug, Clone)]
pub struct ChatOptions {
	pub channel_id: String,
	/// Resolved from `channel_id` on connect when empty.
	pub chat_channel_id: String,
	/// Issued on connect when empty.
	pub access_token: SecretString,
	/// Zero disables chat channel id polling.
	pub poll_interval: Duration,
	pub os_type: OsType,
}

impl ChatOptions {
	pub fn new(channel_id: impl Into<String>) -> Self {
		Self {
			channel_id: channel_id.into(),
			chat_channel_id: String::new(),
			access_token: SecretString::default(),
			poll_interval: DEFAULT_POLL_INTERVAL,
			os_type: OsType::Pc,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
	Disconnected,
	Connecting,
	/// Websocket open, handshake pending.
	Open,
	/// Handshake acknowledged by the server.
	Connected,
}

#[derive(Debug)]
struct SessionState {
	options: ChatOptions,
	uid: String,
	sid: String,
	phase: SessionPhase,
	reconnecting: bool,
}

impl SessionState {
	fn is_connected(&self) -> bool {
		matches!(self.phase, SessionPhase::Open | SessionPhase::Connected)
	}
}

struct SessionInner {
	self_ref: Weak<SessionInner>,
	client: Arc<dyn MetadataSource>,
	state: Mutex<SessionState>,
	/// Serializes connect, close and reconnect.
	lifecycle: tokio::sync::Mutex<()>,
	connect_timeout: Mutex<Duration>,
	connection: ConnectionManager,
	dispatcher: EventDispatcher,
	keepalive: KeepAliveScheduler,
	poller: ChannelIdentityPoller,
	/// Set once the owning `ChatSession` is dropped.
	closed: AtomicBool,
}

/// Live chat session for one channel.
///
/// Handlers run on the receive task. They must not block, and must not await
/// `close` or `reconnect` inline (spawn a task instead), since those wait for the
/// receive task to finish.
pub struct ChatSession {
	inner: Arc<SessionInner>,
}

impl ChatSession {
	pub fn new(client: Arc<dyn MetadataSource>, options: ChatOptions) -> Self {
		Self::with_connector(client, options, default_connector())
	}

	pub fn with_connector(client: Arc<dyn MetadataSource>, options: ChatOptions, connector: WsConnector) -> Self {
		let inner = Arc::new_cyclic(|self_ref| SessionInner {
			self_ref: self_ref.clone(),
			client,
			state: Mutex::new(SessionState {
				options,
				uid: String::new(),
				sid: String::new(),
				phase: SessionPhase::Disconnected,
				reconnecting: false,
			}),
			lifecycle: tokio::sync::Mutex::new(()),
			connect_timeout: Mutex::new(Duration::ZERO),
			connection: ConnectionManager::new(connector),
			dispatcher: EventDispatcher::new(),
			keepalive: KeepAliveScheduler::new(KEEPALIVE_PERIOD),
			poller: ChannelIdentityPoller::new(),
			closed: AtomicBool::new(false),
		});
		Self { inner }
	}

	pub fn client(&self) -> Arc<dyn MetadataSource> {
		self.inner.client.clone()
	}

	/// Timeout of the websocket connect; zero waits indefinitely.
	pub fn set_connection_timeout(&self, timeout: Duration) {
		*self.inner.connect_timeout.lock() = timeout;
	}

	pub fn connection_timeout(&self) -> Duration {
		*self.inner.connect_timeout.lock()
	}

	pub async fn connect(&self) -> Result<(), ChatError> {
		let _guard = self.inner.lifecycle.lock().await;
		self.inner.connect_locked().await
	}

	pub async fn close(&self) -> Result<(), ChatError> {
		let _guard = self.inner.lifecycle.lock().await;
		self.inner.close_locked().await
	}

	/// Closes and reconnects without emitting DISCONNECT/CONNECT; RECONNECT follows
	/// the new handshake. Does nothing while disconnected.
	pub async fn reconnect(&self) -> Result<(), ChatError> {
		let _guard = self.inner.lifecycle.lock().await;
		self.inner.reconnect_locked().await
	}

	pub fn add_handler<F>(&self, category: EventCategory, handler: F) -> HandlerId
	where
		F: Fn(&str) + Send + Sync + 'static,
	{
		self.inner.dispatcher.add(category, handler)
	}

	pub fn remove_handler(&self, category: EventCategory, id: HandlerId) -> bool {
		self.inner.dispatcher.remove(category, id)
	}

	pub fn remove_handlers(&self, category: EventCategory) {
		self.inner.dispatcher.clear(category);
	}

	pub fn remove_all_handlers(&self) {
		self.inner.dispatcher.clear_all();
	}

	pub async fn request_recent_chat(&self, count: u32) -> Result<(), ChatError> {
		let (scope, sid) = {
			let state = self.inner.state.lock();
			if !state.is_connected() {
				return Err(ChatError::NotConnected);
			}
			(ChannelScope::new(state.options.chat_channel_id.as_str()), state.sid.clone())
		};
		let frame = codec::encode_request_recent_chat(&scope, &sid, count)?;
		self.inner.connection.send(frame).await
	}

	/// Sends a chat message. `emojis` maps emoji names used in `message` to image URLs.
	pub async fn send_chat(&self, message: &str, emojis: &BTreeMap<String, String>) -> Result<(), ChatError> {
		let (scope, sid, os_type) = {
			let state = self.inner.state.lock();
			if !state.is_connected() {
				return Err(ChatError::NotConnected);
			}
			if state.uid.is_empty() {
				return Err(ChatError::NotAuthenticated);
			}
			(
				ChannelScope::new(state.options.chat_channel_id.as_str()),
				state.sid.clone(),
				state.options.os_type,
			)
		};
		let now = chzzk_util::time::epoch_millis();
		let frame = codec::encode_send_chat(&scope, &sid, message, emojis, now, os_type)?;
		self.inner.connection.send(frame).await
	}

	pub fn current_options(&self) -> ChatOptions {
		self.inner.state.lock().options.clone()
	}

	/// Edits the options used by the next `connect`.
	pub fn update_options(&self, f: impl FnOnce(&mut ChatOptions)) {
		f(&mut self.inner.state.lock().options);
	}

	/// True once the websocket is open, until `close`.
	pub fn is_connected(&self) -> bool {
		self.inner.is_connected()
	}

	/// True once the server acknowledged the handshake.
	pub fn is_chat_connected(&self) -> bool {
		self.phase() == SessionPhase::Connected
	}

	pub fn phase(&self) -> SessionPhase {
		self.inner.state.lock().phase
	}

	pub fn session_id(&self) -> Option<String> {
		let state = self.inner.state.lock();
		Some(state.sid.clone()).filter(|sid| !sid.is_empty())
	}
}

impl Drop for ChatSession {
	fn drop(&mut self) {
		self.inner.closed.store(true, Ordering::SeqCst);
		match self.inner.lifecycle.try_lock() {
			Ok(_guard) => self.inner.close_detached(false),
			// A poller-driven reconnect holds the lock; it sees `closed` and finishes the teardown.
			Err(_) => {
				debug!("chat session dropped during a reconnect");
				self.inner.keepalive.stop();
				self.inner.poller.stop();
				self.inner.connection.close_detached();
			}
		}
	}
}

impl SessionInner {
	fn is_connected(&self) -> bool {
		self.state.lock().is_connected()
	}

	fn connection_timeout(&self) -> Duration {
		*self.connect_timeout.lock()
	}

	async fn connect_locked(&self) -> Result<(), ChatError> {
		{
			let mut state = self.state.lock();
			if state.phase != SessionPhase::Disconnected {
				return Err(ChatError::AlreadyConnected);
			}
			state.phase = SessionPhase::Connecting;
		}

		if let Err(err) = self.establish().await {
			self.connection.close().await;
			self.state.lock().phase = SessionPhase::Disconnected;
			warn!(error = %err, "chat connect failed");
			return Err(err);
		}
		Ok(())
	}

	async fn establish(&self) -> Result<(), ChatError> {
		let (channel_id, mut chat_channel_id, mut access_token, mut uid) = {
			let state = self.state.lock();
			(
				state.options.channel_id.clone(),
				state.options.chat_channel_id.clone(),
				state.options.access_token.clone(),
				state.uid.clone(),
			)
		};

		if chat_channel_id.is_empty() && !channel_id.is_empty() {
			chat_channel_id = self
				.client
				.resolve_chat_channel_id(&channel_id)
				.await?
				.unwrap_or_default();
		}
		if chat_channel_id.is_empty() {
			return Err(ChatError::NotReady);
		}

		if access_token.is_empty() {
			uid = self.client.resolve_user_id_hash().await?.unwrap_or_default();
			access_token = self.client.issue_access_token(&chat_channel_id).await?.access_token;
		}

		{
			let mut state = self.state.lock();
			state.options.chat_channel_id = chat_channel_id.clone();
			state.options.access_token = access_token.clone();
			state.uid = uid.clone();
		}

		let url = ChatServerEndpoint::for_chat_channel(&chat_channel_id).url();
		info!(chat_channel_id = %chat_channel_id, %url, signed_in = !uid.is_empty(), "connecting to chat server");
		self.connection.open(&url, self.connection_timeout()).await?;
		self.state.lock().phase = SessionPhase::Open;

		let frame = codec::encode_connect(&ChannelScope::new(chat_channel_id.as_str()), access_token.expose(), &uid)?;
		self.connection.send(frame).await?;

		let handler: Arc<dyn InboundHandler> = self.self_ref.upgrade().ok_or(ChatError::NotConnected)?;
		self.connection.start_receiving(handler)
	}

	async fn close_locked(&self) -> Result<(), ChatError> {
		if !self.is_connected() {
			return Err(ChatError::NotConnected);
		}

		self.connection.close().await;

		let (reconnecting, chat_channel_id) = {
			let state = self.state.lock();
			(state.reconnecting, state.options.chat_channel_id.clone())
		};

		if !reconnecting {
			self.dispatcher.emit(EventCategory::Disconnect, &chat_channel_id);
			self.poller.stop();
		}
		self.keepalive.stop();

		{
			let mut state = self.state.lock();
			if !reconnecting {
				state.options.chat_channel_id.clear();
			}
			state.sid.clear();
			state.options.access_token = SecretString::default();
			state.uid.clear();
			state.phase = SessionPhase::Disconnected;
		}

		info!(chat_channel_id = %chat_channel_id, reconnecting, "chat session closed");
		Ok(())
	}

	/// Synchronous counterpart of `close_locked` for a session whose owner is gone.
	/// DISCONNECT is emitted when the session was live, or always with `force`.
	fn close_detached(&self, force: bool) {
		self.keepalive.stop();
		self.poller.stop();
		self.connection.close_detached();

		let farewell = {
			let mut state = self.state.lock();
			let live = force || (state.is_connected() && !state.reconnecting);
			let chat_channel_id = std::mem::take(&mut state.options.chat_channel_id);
			state.sid.clear();
			state.options.access_token = SecretString::default();
			state.uid.clear();
			state.phase = SessionPhase::Disconnected;
			state.reconnecting = false;
			live.then_some(chat_channel_id)
		};

		if let Some(chat_channel_id) = farewell {
			info!(chat_channel_id = %chat_channel_id, "chat session dropped while connected");
			self.dispatcher.emit(EventCategory::Disconnect, &chat_channel_id);
		}
	}

	async fn reconnect_locked(&self) -> Result<(), ChatError> {
		if !self.is_connected() {
			debug!("reconnect requested while disconnected; ignoring");
			return Ok(());
		}

		self.state.lock().reconnecting = true;
		metrics::counter!("chzzk_chat_reconnects_total").increment(1);

		self.close_locked().await?;
		if let Err(err) = self.connect_locked().await {
			self.state.lock().reconnecting = false;
			return Err(err);
		}
		Ok(())
	}

	fn emit_payload(&self, category: EventCategory, payload: &ParsedChatPayload) {
		match payload.to_json() {
			Ok(json) => {
				self.dispatcher.emit(category, &json);
			}
			Err(err) => warn!(%category, error = %err, "failed to serialize chat payload"),
		}
	}

	fn emit_transport_error(&self, chat_channel_id: &str, err: &ChatError) {
		let payload = serde_json::json!({
			"chatChannelId": chat_channel_id,
			"error": err.to_string(),
		});
		self.dispatcher.emit(EventCategory::TransportError, &payload.to_string());
	}

	fn on_connected(&self, sid: String) {
		let (reconnecting, chat_channel_id, poll_interval) = {
			let mut state = self.state.lock();
			state.sid = sid;
			state.phase = SessionPhase::Connected;
			let reconnecting = std::mem::take(&mut state.reconnecting);
			(reconnecting, state.options.chat_channel_id.clone(), state.options.poll_interval)
		};

		if reconnecting {
			info!(chat_channel_id = %chat_channel_id, "chat session reconnected");
			self.dispatcher.emit(EventCategory::Reconnect, &chat_channel_id);
		} else {
			info!(chat_channel_id = %chat_channel_id, "chat session connected");
			self.dispatcher.emit(EventCategory::Connect, "");
		}

		self.keepalive.touch(self.self_ref.clone());
		if !reconnecting {
			self.poller.start(poll_interval, self.self_ref.clone());
		}
	}

	fn dispatch_batch(&self, batch: &ChatBatch) {
		for skipped in &batch.skipped {
			metrics::counter!("chzzk_chat_decode_errors_total").increment(1);
			warn!(location = %skipped.location, reason = %skipped.reason, "dropping malformed chat entry");
		}
		if let Some(notice) = &batch.notice {
			self.emit_payload(EventCategory::Notice, notice);
		}
		for entry in &batch.entries {
			match EventCategory::for_message_type(entry.kind) {
				Some(category) => self.emit_payload(category, &entry.payload),
				None => debug!(kind = ?entry.kind, "dropping unrouted chat entry"),
			}
		}
	}

	async fn dispatch_frame(&self, frame: InboundFrame) {
		match frame {
			InboundFrame::Ping => {
				let sent = match codec::encode_pong() {
					Ok(pong) => self.connection.send(pong).await,
					Err(err) => Err(err.into()),
				};
				if let Err(err) = sent {
					warn!(error = %err, "failed to answer ping");
				}
			}
			InboundFrame::Pong => {}
			InboundFrame::Connected { sid } => self.on_connected(sid),
			InboundFrame::Chat(batch) | InboundFrame::RecentChat(batch) | InboundFrame::Donation(batch) => {
				self.dispatch_batch(&batch);
			}
			InboundFrame::Notice(None) => {
				self.dispatcher.emit(EventCategory::Notice, "");
			}
			InboundFrame::Notice(Some(notice)) => self.emit_payload(EventCategory::Notice, &notice),
			InboundFrame::Blind(raw) => {
				self.dispatcher.emit(EventCategory::Blind, &raw);
			}
			InboundFrame::Other {
				command: Command::Event,
				body,
			} => {
				self.dispatcher.emit(EventCategory::Event, &body.to_string());
			}
			InboundFrame::Other { command, .. } => debug!(%command, "ignoring chat command"),
		}
	}
}

#[async_trait]
impl InboundHandler for SessionInner {
	async fn on_message(&self, text: String) {
		metrics::counter!("chzzk_chat_frames_total").increment(1);

		let frame = match codec::decode(&text) {
			Ok(frame) => frame,
			Err(CodecError::UnknownCommand(cmd)) => {
				debug!(cmd, "ignoring unknown chat command");
				self.keepalive.touch(self.self_ref.clone());
				return;
			}
			Err(err) => {
				metrics::counter!("chzzk_chat_decode_errors_total").increment(1);
				warn!(error = %err, "dropping malformed chat frame");
				return;
			}
		};

		if frame.command() != Command::Pong {
			self.keepalive.touch(self.self_ref.clone());
		}
		self.dispatch_frame(frame).await;
	}

	async fn on_transport_error(&self, err: ChatError) {
		self.keepalive.stop();
		let chat_channel_id = {
			let mut state = self.state.lock();
			if state.phase == SessionPhase::Connected {
				state.phase = SessionPhase::Open;
			}
			state.options.chat_channel_id.clone()
		};
		warn!(chat_channel_id = %chat_channel_id, error = %err, "chat connection lost");
		self.emit_transport_error(&chat_channel_id, &err);
	}
}

#[async_trait]
impl PingTarget for SessionInner {
	async fn send_ping(&self) -> Result<(), ChatError> {
		self.connection.send(codec::encode_ping()?).await
	}
}

#[async_trait]
impl RotationTarget for SessionInner {
	fn is_connected(&self) -> bool {
		SessionInner::is_connected(self)
	}

	fn chat_channel_id(&self) -> String {
		self.state.lock().options.chat_channel_id.clone()
	}

	async fn fetch_chat_channel_id(&self) -> Result<Option<String>, ChatError> {
		let channel_id = self.state.lock().options.channel_id.clone();
		if channel_id.is_empty() {
			return Ok(None);
		}
		self.client.resolve_chat_channel_id(&channel_id).await
	}

	async fn rotate_chat_channel(&self, chat_channel_id: String) {
		let _guard = self.lifecycle.lock().await;
		if !self.is_connected() {
			return;
		}

		self.state.lock().options.chat_channel_id = chat_channel_id.clone();
		let reconnected = self.reconnect_locked().await;
		if self.closed.load(Ordering::SeqCst) {
			self.close_detached(true);
			return;
		}
		if let Err(err) = reconnected {
			warn!(chat_channel_id = %chat_channel_id, error = %err, "reconnect after chat channel rotation failed");
			self.poller.stop();
			self.emit_transport_error(&chat_channel_id, &err);
		}
	}
}

#[cfg(test)]
impl ChatSession {
	/// Runs `raw` through inbound dispatch as if it came off the socket.
	pub(super) async fn inject_frame(&self, raw: &str) {
		self.inner.on_message(raw.to_string()).await;
	}
}
