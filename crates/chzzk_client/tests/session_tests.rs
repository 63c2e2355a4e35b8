use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chzzk_client::chat::{BoxFuture, ChatWs};
use chzzk_client::{AccessToken, ChatError, ChatOptions, ChatSession, EventCategory, MetadataSource, WsConnector};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Notify, mpsc};
use tokio::time::{Instant, timeout};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

const WAIT: Duration = Duration::from_secs(5);

struct FakeMetadata {
	chat_channel_id: Mutex<String>,
	uid: Option<String>,
}

impl FakeMetadata {
	fn new(chat_channel_id: &str) -> Arc<Self> {
		Arc::new(Self {
			chat_channel_id: Mutex::new(chat_channel_id.to_string()),
			uid: None,
		})
	}

	fn signed_in(chat_channel_id: &str, uid: &str) -> Arc<Self> {
		Arc::new(Self {
			chat_channel_id: Mutex::new(chat_channel_id.to_string()),
			uid: Some(uid.to_string()),
		})
	}

	fn rotate(&self, chat_channel_id: &str) {
		*self.chat_channel_id.lock() = chat_channel_id.to_string();
	}
}

#[async_trait]
impl MetadataSource for FakeMetadata {
	async fn resolve_chat_channel_id(&self, channel_id: &str) -> Result<Option<String>, ChatError> {
		assert_eq!(channel_id, "abc");
		Ok(Some(self.chat_channel_id.lock().clone()))
	}

	async fn issue_access_token(&self, _chat_channel_id: &str) -> Result<AccessToken, ChatError> {
		Ok(AccessToken::new("tok"))
	}

	async fn resolve_user_id_hash(&self) -> Result<Option<String>, ChatError> {
		Ok(self.uid.clone())
	}
}

/// One accepted websocket on the fake chat server.
struct ServerConn {
	inbound: mpsc::UnboundedReceiver<Value>,
	outbound: mpsc::UnboundedSender<Message>,
}

impl ServerConn {
	async fn recv(&mut self) -> Value {
		timeout(WAIT, self.inbound.recv())
			.await
			.expect("frame within timeout")
			.expect("connection still open")
	}

	fn send(&self, frame: Value) {
		self.outbound
			.send(Message::Text(frame.to_string().into()))
			.expect("server connection alive");
	}

	fn close(&self) {
		let _ = self.outbound.send(Message::Close(None));
	}
}

struct FakeChatServer {
	addr: SocketAddr,
	connections: mpsc::UnboundedReceiver<ServerConn>,
}

impl FakeChatServer {
	async fn start() -> Self {
		let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
		let addr = listener.local_addr().expect("local addr");
		let (conn_tx, connections) = mpsc::unbounded_channel();

		tokio::spawn(async move {
			while let Ok((stream, _)) = listener.accept().await {
				let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
					continue;
				};
				let (mut write, mut read) = ws.split();
				let (in_tx, inbound) = mpsc::unbounded_channel();
				let (outbound, mut out_rx) = mpsc::unbounded_channel::<Message>();

				tokio::spawn(async move {
					loop {
						tokio::select! {
							msg = read.next() => match msg {
								Some(Ok(Message::Text(text))) => {
									if let Ok(value) = serde_json::from_str::<Value>(&text) {
										let _ = in_tx.send(value);
									}
								}
								Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
								Some(Ok(_)) => {}
							},
							out = out_rx.recv() => {
								let Some(msg) = out else { break };
								let closing = matches!(msg, Message::Close(_));
								if write.send(msg).await.is_err() || closing {
									break;
								}
							}
						}
					}
				});

				if conn_tx.send(ServerConn { inbound, outbound }).is_err() {
					break;
				}
			}
		});

		Self { addr, connections }
	}

	/// Connector that records the requested url and dials this server instead.
	fn connector(&self, urls: Arc<Mutex<Vec<String>>>) -> WsConnector {
		let addr = self.addr;
		Arc::new(move |url: Url| {
			urls.lock().push(url.to_string());
			Box::pin(async move {
				let (ws, _resp) = tokio_tungstenite::connect_async(format!("ws://{addr}/chat")).await?;
				Ok::<ChatWs, anyhow::Error>(ws)
			}) as BoxFuture<'static, anyhow::Result<ChatWs>>
		})
	}

	/// Like `connector`, but every dial after the first waits for `gate`.
	fn gated_connector(&self, dials: Arc<AtomicUsize>, gate: Arc<Notify>) -> WsConnector {
		let addr = self.addr;
		Arc::new(move |_url: Url| {
			let dial = dials.fetch_add(1, Ordering::SeqCst);
			let gate = gate.clone();
			Box::pin(async move {
				if dial > 0 {
					gate.notified().await;
				}
				let (ws, _resp) = tokio_tungstenite::connect_async(format!("ws://{addr}/chat")).await?;
				Ok::<ChatWs, anyhow::Error>(ws)
			}) as BoxFuture<'static, anyhow::Result<ChatWs>>
		})
	}

	async fn next_connection(&mut self) -> ServerConn {
		timeout(WAIT, self.connections.recv())
			.await
			.expect("connection within timeout")
			.expect("server running")
	}
}

type Events = Arc<Mutex<Vec<(EventCategory, String)>>>;

fn record_events(session: &ChatSession) -> Events {
	let events: Events = Arc::new(Mutex::new(Vec::new()));
	for category in EventCategory::ALL {
		let sink = events.clone();
		session.add_handler(category, move |payload| sink.lock().push((category, payload.to_string())));
	}
	events
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
	timeout(WAIT, async {
		while !cond() {
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
	})
	.await
	.expect("condition within timeout");
}

/// Polls in 1ms steps, so a paused clock only creeps forward while socket I/O completes.
async fn settle<T>(mut poll: impl FnMut() -> Option<T>) -> T {
	loop {
		if let Some(value) = poll() {
			return value;
		}
		tokio::time::sleep(Duration::from_millis(1)).await;
	}
}

fn has_event(events: &Events, category: EventCategory) -> bool {
	events.lock().iter().any(|(c, _)| *c == category)
}

#[tokio::test]
async fn connect_handshake_then_close() {
	let mut server = FakeChatServer::start().await;
	let urls = Arc::new(Mutex::new(Vec::new()));
	let session = ChatSession::with_connector(
		FakeMetadata::new("chat123"),
		ChatOptions::new("abc"),
		server.connector(urls.clone()),
	);
	let events = record_events(&session);

	session.connect().await.expect("connect");
	assert!(session.is_connected());
	assert!(!session.is_chat_connected());
	assert_eq!(*urls.lock(), vec!["wss://kr-ss9.chat.naver.com/chat".to_string()]);

	let mut conn = server.next_connection().await;
	let hello = conn.recv().await;
	assert_eq!(hello["cmd"], 100);
	assert_eq!(hello["cid"], "chat123");
	assert_eq!(hello["svcid"], "game");
	assert_eq!(hello["ver"], 2);
	assert_eq!(hello["tid"], 1);
	assert_eq!(hello["bdy"]["accTkn"], "tok");
	assert_eq!(hello["bdy"]["auth"], "READ");
	assert_eq!(hello["bdy"]["devType"], 2001);

	conn.send(json!({"cmd": 10100, "bdy": {"sid": "s1"}}));
	wait_until(|| session.is_chat_connected()).await;
	assert_eq!(*events.lock(), vec![(EventCategory::Connect, String::new())]);
	assert_eq!(session.session_id().as_deref(), Some("s1"));

	session.close().await.expect("close");
	assert!(!session.is_connected());
	assert_eq!(
		*events.lock(),
		vec![
			(EventCategory::Connect, String::new()),
			(EventCategory::Disconnect, "chat123".to_string())
		]
	);
	let options = session.current_options();
	assert!(options.chat_channel_id.is_empty());
	assert!(options.access_token.is_empty());
	assert_eq!(session.session_id(), None);

	assert!(matches!(session.close().await, Err(ChatError::NotConnected)));
	assert_eq!(events.lock().len(), 2);
}

#[tokio::test]
async fn second_connect_is_rejected() {
	let mut server = FakeChatServer::start().await;
	let session = ChatSession::with_connector(
		FakeMetadata::new("chat123"),
		ChatOptions::new("abc"),
		server.connector(Arc::new(Mutex::new(Vec::new()))),
	);

	session.connect().await.expect("connect");
	let _conn = server.next_connection().await;
	assert!(matches!(session.connect().await, Err(ChatError::AlreadyConnected)));
	session.close().await.expect("close");
}

#[tokio::test]
async fn server_ping_is_answered_with_pong() {
	let mut server = FakeChatServer::start().await;
	let session = ChatSession::with_connector(
		FakeMetadata::new("chat123"),
		ChatOptions::new("abc"),
		server.connector(Arc::new(Mutex::new(Vec::new()))),
	);

	session.connect().await.expect("connect");
	let mut conn = server.next_connection().await;
	let _hello = conn.recv().await;

	conn.send(json!({"cmd": 0, "ver": 2}));
	assert_eq!(conn.recv().await, json!({"cmd": 10000, "ver": 2}));

	session.close().await.expect("close");
}

#[tokio::test]
async fn signed_in_session_sends_chat_and_requests_history() {
	let mut server = FakeChatServer::start().await;
	let session = ChatSession::with_connector(
		FakeMetadata::signed_in("chat123", "user-hash"),
		ChatOptions::new("abc"),
		server.connector(Arc::new(Mutex::new(Vec::new()))),
	);

	session.connect().await.expect("connect");
	let mut conn = server.next_connection().await;
	let hello = conn.recv().await;
	assert_eq!(hello["bdy"]["auth"], "SEND");
	assert_eq!(hello["bdy"]["uid"], "user-hash");

	conn.send(json!({"cmd": 10100, "bdy": {"sid": "s1"}}));
	wait_until(|| session.is_chat_connected()).await;

	let mut emojis = BTreeMap::new();
	emojis.insert("wave".to_string(), "https://example.invalid/wave.png".to_string());
	session.send_chat("hello", &emojis).await.expect("send chat");

	let sent = conn.recv().await;
	assert_eq!(sent["cmd"], 3101);
	assert_eq!(sent["sid"], "s1");
	assert_eq!(sent["retry"], false);
	assert_eq!(sent["bdy"]["msg"], "hello");
	assert!(sent["bdy"]["msgTime"].as_u64().expect("msgTime") > 0);
	let extras: Value = serde_json::from_str(sent["bdy"]["extras"].as_str().expect("extras string")).expect("extras json");
	assert_eq!(extras["streamingChannelId"], "chat123");
	assert_eq!(extras["emojis"]["wave"], "https://example.invalid/wave.png");

	session
		.request_recent_chat(chzzk_client::chat::DEFAULT_RECENT_CHAT_COUNT)
		.await
		.expect("request recent chat");
	let request = conn.recv().await;
	assert_eq!(request["cmd"], 5101);
	assert_eq!(request["sid"], "s1");
	assert_eq!(request["bdy"]["recentMessageCount"], 50);

	session.close().await.expect("close");
}

#[tokio::test]
async fn anonymous_session_cannot_send_chat() {
	let mut server = FakeChatServer::start().await;
	let session = ChatSession::with_connector(
		FakeMetadata::new("chat123"),
		ChatOptions::new("abc"),
		server.connector(Arc::new(Mutex::new(Vec::new()))),
	);

	session.connect().await.expect("connect");
	let _conn = server.next_connection().await;
	assert!(matches!(
		session.send_chat("hi", &BTreeMap::new()).await,
		Err(ChatError::NotAuthenticated)
	));
	session.close().await.expect("close");
}

#[tokio::test]
async fn rotated_chat_channel_reconnects_once() {
	let mut server = FakeChatServer::start().await;
	let metadata = FakeMetadata::new("chat123");
	let mut options = ChatOptions::new("abc");
	options.poll_interval = Duration::from_millis(50);
	let session = ChatSession::with_connector(
		metadata.clone(),
		options,
		server.connector(Arc::new(Mutex::new(Vec::new()))),
	);
	let events = record_events(&session);

	session.connect().await.expect("connect");
	let mut first = server.next_connection().await;
	assert_eq!(first.recv().await["cid"], "chat123");
	first.send(json!({"cmd": 10100, "bdy": {"sid": "s1"}}));
	wait_until(|| session.is_chat_connected()).await;

	metadata.rotate("chat456");

	let mut second = server.next_connection().await;
	let hello = second.recv().await;
	assert_eq!(hello["cmd"], 100);
	assert_eq!(hello["cid"], "chat456");
	second.send(json!({"cmd": 10100, "bdy": {"sid": "s2"}}));
	wait_until(|| has_event(&events, EventCategory::Reconnect)).await;

	assert_eq!(
		*events.lock(),
		vec![
			(EventCategory::Connect, String::new()),
			(EventCategory::Reconnect, "chat456".to_string())
		]
	);
	assert_eq!(session.current_options().chat_channel_id, "chat456");
	assert_eq!(session.session_id().as_deref(), Some("s2"));

	session.close().await.expect("close");
	assert_eq!(
		events.lock().last().cloned(),
		Some((EventCategory::Disconnect, "chat456".to_string()))
	);
}

#[tokio::test]
async fn manual_reconnect_emits_reconnect() {
	let mut server = FakeChatServer::start().await;
	let session = ChatSession::with_connector(
		FakeMetadata::new("chat123"),
		ChatOptions::new("abc"),
		server.connector(Arc::new(Mutex::new(Vec::new()))),
	);
	let events = record_events(&session);

	session.connect().await.expect("connect");
	let mut first = server.next_connection().await;
	let _ = first.recv().await;
	first.send(json!({"cmd": 10100, "bdy": {"sid": "s1"}}));
	wait_until(|| session.is_chat_connected()).await;

	session.reconnect().await.expect("reconnect");
	let mut second = server.next_connection().await;
	assert_eq!(second.recv().await["cid"], "chat123");
	second.send(json!({"cmd": 10100, "bdy": {"sid": "s2"}}));
	wait_until(|| has_event(&events, EventCategory::Reconnect)).await;

	assert_eq!(
		*events.lock(),
		vec![
			(EventCategory::Connect, String::new()),
			(EventCategory::Reconnect, "chat123".to_string())
		]
	);
	session.close().await.expect("close");
}

#[tokio::test]
async fn server_close_surfaces_transport_error() {
	let mut server = FakeChatServer::start().await;
	let session = ChatSession::with_connector(
		FakeMetadata::new("chat123"),
		ChatOptions::new("abc"),
		server.connector(Arc::new(Mutex::new(Vec::new()))),
	);
	let events = record_events(&session);

	session.connect().await.expect("connect");
	let mut conn = server.next_connection().await;
	let _ = conn.recv().await;
	conn.send(json!({"cmd": 10100, "bdy": {"sid": "s1"}}));
	wait_until(|| session.is_chat_connected()).await;

	conn.close();
	wait_until(|| has_event(&events, EventCategory::TransportError)).await;

	let payload = events
		.lock()
		.iter()
		.find(|(c, _)| *c == EventCategory::TransportError)
		.map(|(_, p)| p.clone())
		.expect("transport error event");
	let payload: Value = serde_json::from_str(&payload).expect("json payload");
	assert_eq!(payload["chatChannelId"], "chat123");
	assert!(payload["error"].as_str().is_some_and(|e| !e.is_empty()));

	assert!(session.is_connected());
	assert!(!session.is_chat_connected());

	session.close().await.expect("close after transport error");
	assert!(has_event(&events, EventCategory::Disconnect));
}

#[tokio::test]
async fn dropping_a_connected_session_releases_the_socket() {
	let mut server = FakeChatServer::start().await;
	let session = ChatSession::with_connector(
		FakeMetadata::new("chat123"),
		ChatOptions::new("abc"),
		server.connector(Arc::new(Mutex::new(Vec::new()))),
	);

	session.connect().await.expect("connect");
	let mut conn = server.next_connection().await;
	let _ = conn.recv().await;

	drop(session);
	let closed = timeout(WAIT, conn.inbound.recv()).await.expect("socket released");
	assert!(closed.is_none());
}

#[tokio::test]
async fn dropping_a_chat_connected_session_emits_disconnect_and_closes() {
	let mut server = FakeChatServer::start().await;
	let metadata = FakeMetadata::new("chat123");
	let session = ChatSession::with_connector(
		metadata.clone(),
		ChatOptions::new("abc"),
		server.connector(Arc::new(Mutex::new(Vec::new()))),
	);
	let events = record_events(&session);

	session.connect().await.expect("connect");
	let mut conn = server.next_connection().await;
	let _ = conn.recv().await;
	conn.send(json!({"cmd": 10100, "bdy": {"sid": "s1"}}));
	wait_until(|| session.is_chat_connected()).await;

	drop(session);
	assert_eq!(
		*events.lock(),
		vec![
			(EventCategory::Connect, String::new()),
			(EventCategory::Disconnect, "chat123".to_string())
		]
	);

	let closed = timeout(WAIT, conn.inbound.recv()).await.expect("socket released");
	assert!(closed.is_none());
	wait_until(|| Arc::strong_count(&metadata) == 1).await;
}

#[tokio::test]
async fn dropping_a_session_mid_rotation_tears_down_the_new_socket() {
	let mut server = FakeChatServer::start().await;
	let metadata = FakeMetadata::new("chat123");
	let mut options = ChatOptions::new("abc");
	options.poll_interval = Duration::from_millis(50);
	let dials = Arc::new(AtomicUsize::new(0));
	let gate = Arc::new(Notify::new());
	let session = ChatSession::with_connector(
		metadata.clone(),
		options,
		server.gated_connector(dials.clone(), gate.clone()),
	);
	let events = record_events(&session);

	session.connect().await.expect("connect");
	let mut first = server.next_connection().await;
	let _ = first.recv().await;
	first.send(json!({"cmd": 10100, "bdy": {"sid": "s1"}}));
	wait_until(|| session.is_chat_connected()).await;

	metadata.rotate("chat456");
	wait_until(|| dials.load(Ordering::SeqCst) == 2).await;
	drop(session);
	gate.notify_one();

	let mut second = server.next_connection().await;
	assert_eq!(second.recv().await["cid"], "chat456");
	let closed = timeout(WAIT, second.inbound.recv()).await.expect("socket released");
	assert!(closed.is_none());

	wait_until(|| Arc::strong_count(&metadata) == 1).await;
	assert_eq!(
		*events.lock(),
		vec![
			(EventCategory::Connect, String::new()),
			(EventCategory::Disconnect, "chat456".to_string())
		]
	);
}

/// Connects on a paused clock and returns once the server acknowledged the handshake.
async fn chat_connected_on_paused_clock(server: &mut FakeChatServer, session: &ChatSession) -> ServerConn {
	session.connect().await.expect("connect");
	let mut conn = settle(|| server.connections.try_recv().ok()).await;
	let hello = settle(|| conn.inbound.try_recv().ok()).await;
	assert_eq!(hello["cmd"], 100);
	conn.send(json!({"cmd": 10100, "bdy": {"sid": "s1"}}));
	settle(|| session.is_chat_connected().then_some(())).await;
	conn
}

fn idle_session(server: &FakeChatServer) -> ChatSession {
	let mut options = ChatOptions::new("abc");
	options.poll_interval = Duration::ZERO;
	ChatSession::with_connector(
		FakeMetadata::new("chat123"),
		options,
		server.connector(Arc::new(Mutex::new(Vec::new()))),
	)
}

#[tokio::test(start_paused = true)]
async fn pong_does_not_postpone_the_next_ping() {
	let mut server = FakeChatServer::start().await;
	let session = idle_session(&server);
	let mut conn = chat_connected_on_paused_clock(&mut server, &session).await;
	let start = Instant::now();

	tokio::time::sleep(Duration::from_secs(10)).await;
	conn.send(json!({"cmd": 10000, "ver": 2}));
	tokio::time::sleep(Duration::from_secs(9)).await;
	assert!(conn.inbound.try_recv().is_err(), "no ping before the idle period");

	let ping = settle(|| conn.inbound.try_recv().ok()).await;
	let elapsed = start.elapsed();
	assert_eq!(ping, json!({"cmd": 0, "ver": 2}));
	assert!(
		elapsed >= Duration::from_millis(19_500) && elapsed <= Duration::from_millis(20_500),
		"ping after {elapsed:?}"
	);

	session.close().await.expect("close");
}

#[tokio::test(start_paused = true)]
async fn chat_traffic_postpones_the_next_ping() {
	let mut server = FakeChatServer::start().await;
	let session = idle_session(&server);
	let events = record_events(&session);
	let mut conn = chat_connected_on_paused_clock(&mut server, &session).await;
	let start = Instant::now();

	tokio::time::sleep(Duration::from_secs(10)).await;
	conn.send(json!({"cmd": 93101, "bdy": [{"msg": "hi", "msgTypeCode": 1}]}));
	settle(|| has_event(&events, EventCategory::Chat).then_some(())).await;
	tokio::time::sleep(Duration::from_secs(19)).await;
	assert!(conn.inbound.try_recv().is_err(), "no ping while chat keeps the link busy");

	let ping = settle(|| conn.inbound.try_recv().ok()).await;
	let elapsed = start.elapsed();
	assert_eq!(ping, json!({"cmd": 0, "ver": 2}));
	assert!(
		elapsed >= Duration::from_millis(29_500) && elapsed <= Duration::from_millis(30_500),
		"ping after {elapsed:?}"
	);

	session.close().await.expect("close");
}
