#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::command::{ChatMessageType, Command};
use crate::payload::{ParsedChatPayload, first_present, parse_chat_payload};
use crate::version::{DEVICE_TYPE, PROTOCOL_VERSION, SERVICE_ID};

const TID_CONNECT: u32 = 1;
const TID_RECENT_CHAT: u32 = 2;
const TID_SEND_CHAT: u32 = 3;

#[derive(Debug, Error)]
pub enum CodecError {
	#[error("malformed json: {0}")]
	Json(#[from] serde_json::Error),

	#[error("unknown command: {0}")]
	UnknownCommand(i64),

	#[error("missing field: {0}")]
	MissingField(&'static str),

	#[error("invalid field {field}: {reason}")]
	InvalidField {
		field: &'static str,
		reason: String,
	},
}

impl CodecError {
	pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
		CodecError::InvalidField {
			field,
			reason: reason.into(),
		}
	}
}

/// Per-session defaults merged into every scoped outbound frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelScope {
	pub cid: String,
	pub svcid: String,
}

impl ChannelScope {
	pub fn new(chat_channel_id: impl Into<String>) -> Self {
		Self {
			cid: chat_channel_id.into(),
			svcid: SERVICE_ID.to_string(),
		}
	}
}

/// Platform tag reported in the extras of sent messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OsType {
	#[default]
	Pc,
	Aos,
	Ios,
}

#[derive(Serialize)]
struct OutboundFrame<'a, B: Serialize> {
	#[serde(skip_serializing_if = "Option::is_none")]
	bdy: Option<B>,
	cmd: u32,
	#[serde(flatten)]
	scope: Option<&'a ChannelScope>,
	#[serde(skip_serializing_if = "Option::is_none")]
	retry: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	sid: Option<&'a str>,
	#[serde(skip_serializing_if = "Option::is_none")]
	tid: Option<u32>,
	ver: u32,
}

impl<'a, B: Serialize> OutboundFrame<'a, B> {
	fn bare(cmd: Command) -> Self {
		Self {
			bdy: None,
			cmd: cmd.code(),
			scope: None,
			retry: None,
			sid: None,
			tid: None,
			ver: PROTOCOL_VERSION,
		}
	}

	fn scoped(cmd: Command, scope: &'a ChannelScope, tid: u32, bdy: B) -> Self {
		Self {
			bdy: Some(bdy),
			scope: Some(scope),
			tid: Some(tid),
			..Self::bare(cmd)
		}
	}

	fn encode(&self) -> Result<String, CodecError> {
		Ok(serde_json::to_string(self)?)
	}
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectBody<'a> {
	acc_tkn: &'a str,
	auth: &'static str,
	dev_type: u32,
	uid: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RecentChatBody {
	recent_message_count: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendChatBody<'a> {
	extras: String,
	msg: &'a str,
	msg_time: u64,
	msg_type_code: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendChatExtras<'a> {
	chat_type: &'static str,
	emojis: &'a BTreeMap<String, String>,
	os_type: OsType,
	streaming_channel_id: &'a str,
}

/// CONNECT handshake. An empty `uid` joins read-only.
pub fn encode_connect(scope: &ChannelScope, access_token: &str, uid: &str) -> Result<String, CodecError> {
	let body = ConnectBody {
		acc_tkn: access_token,
		auth: if uid.is_empty() { "READ" } else { "SEND" },
		dev_type: DEVICE_TYPE,
		uid,
	};
	OutboundFrame::scoped(Command::Connect, scope, TID_CONNECT, body).encode()
}

pub fn encode_ping() -> Result<String, CodecError> {
	OutboundFrame::<()>::bare(Command::Ping).encode()
}

pub fn encode_pong() -> Result<String, CodecError> {
	OutboundFrame::<()>::bare(Command::Pong).encode()
}

pub fn encode_request_recent_chat(scope: &ChannelScope, sid: &str, count: u32) -> Result<String, CodecError> {
	let body = RecentChatBody {
		recent_message_count: count,
	};
	let mut frame = OutboundFrame::scoped(Command::RequestRecentChat, scope, TID_RECENT_CHAT, body);
	frame.sid = Some(sid);
	frame.encode()
}

/// SEND_CHAT. `extras` travels as a string-encoded JSON document.
pub fn encode_send_chat(
	scope: &ChannelScope,
	sid: &str,
	message: &str,
	emojis: &BTreeMap<String, String>,
	msg_time: u64,
	os_type: OsType,
) -> Result<String, CodecError> {
	let extras = SendChatExtras {
		chat_type: "STREAMING",
		emojis,
		os_type,
		streaming_channel_id: &scope.cid,
	};
	let body = SendChatBody {
		extras: serde_json::to_string(&extras)?,
		msg: message,
		msg_time,
		msg_type_code: ChatMessageType::Text.code(),
	};
	let mut frame = OutboundFrame::scoped(Command::SendChat, scope, TID_SEND_CHAT, body);
	frame.sid = Some(sid);
	frame.retry = Some(false);
	frame.encode()
}

/// One typed entry of a chat list.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatEntry {
	pub kind: ChatMessageType,
	pub payload: ParsedChatPayload,
}

/// Part of a batch dropped because its payload could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
	/// `notice` or `entries[i]`.
	pub location: String,
	pub reason: String,
}

/// Body of CHAT, RECENT_CHAT and DONATION frames.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatBatch {
	pub notice: Option<ParsedChatPayload>,
	pub entries: Vec<ChatEntry>,
	/// Malformed parts left out of `notice` and `entries`.
	pub skipped: Vec<SkippedEntry>,
}

/// Decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
	Ping,
	Pong,
	Connected { sid: String },
	Chat(ChatBatch),
	RecentChat(ChatBatch),
	Donation(ChatBatch),
	/// `None` clears the pinned notice.
	Notice(Option<ParsedChatPayload>),
	Blind(String),
	/// Known commands the session does not interpret; the body is kept raw.
	Other { command: Command, body: Value },
}

impl InboundFrame {
	pub fn command(&self) -> Command {
		match self {
			InboundFrame::Ping => Command::Ping,
			InboundFrame::Pong => Command::Pong,
			InboundFrame::Connected { .. } => Command::Connected,
			InboundFrame::Chat(_) => Command::Chat,
			InboundFrame::RecentChat(_) => Command::RecentChat,
			InboundFrame::Donation(_) => Command::Donation,
			InboundFrame::Notice(_) => Command::Notice,
			InboundFrame::Blind(_) => Command::Blind,
			InboundFrame::Other { command, .. } => *command,
		}
	}
}

#[derive(Deserialize)]
struct InboundEnvelope {
	cmd: i64,
	#[serde(default)]
	bdy: Value,
}

/// Decode one complete text frame.
pub fn decode(raw: &str) -> Result<InboundFrame, CodecError> {
	let envelope: InboundEnvelope = serde_json::from_str(raw)?;
	let command = u32::try_from(envelope.cmd)
		.ok()
		.and_then(Command::from_code)
		.ok_or(CodecError::UnknownCommand(envelope.cmd))?;

	let body = envelope.bdy;
	let frame = match command {
		Command::Ping => InboundFrame::Ping,
		Command::Pong => InboundFrame::Pong,
		Command::Connected => {
			let sid = body
				.get("sid")
				.and_then(Value::as_str)
				.ok_or(CodecError::MissingField("bdy.sid"))?;
			InboundFrame::Connected { sid: sid.to_string() }
		}
		Command::Chat => InboundFrame::Chat(decode_batch(&body, false)),
		Command::RecentChat => InboundFrame::RecentChat(decode_batch(&body, true)),
		Command::Donation => InboundFrame::Donation(decode_batch(&body, false)),
		Command::Notice => InboundFrame::Notice(decode_notice(&body)?),
		Command::Blind => InboundFrame::Blind(match body {
			Value::String(s) => s,
			other => other.to_string(),
		}),
		command => InboundFrame::Other { command, body },
	};
	Ok(frame)
}

fn is_blank(value: &Value) -> bool {
	match value {
		Value::Null => true,
		Value::Object(m) => m.is_empty(),
		Value::Array(a) => a.is_empty(),
		_ => false,
	}
}

fn decode_notice(body: &Value) -> Result<Option<ParsedChatPayload>, CodecError> {
	if is_blank(body) {
		return Ok(None);
	}
	if !body.is_object() {
		return Err(CodecError::invalid("bdy", format!("notice body must be an object, got {body}")));
	}
	parse_chat_payload(body, false).map(Some)
}

fn decode_batch(body: &Value, is_recent: bool) -> ChatBatch {
	let mut batch = ChatBatch::default();

	if let Some(n) = body.get("notice").filter(|n| !is_blank(n)) {
		match parse_chat_payload(n, is_recent) {
			Ok(notice) => batch.notice = Some(notice),
			Err(err) => batch.skipped.push(SkippedEntry {
				location: "notice".to_string(),
				reason: err.to_string(),
			}),
		}
	}

	let list: &[Value] = match body {
		Value::Array(items) => items.as_slice(),
		Value::Object(map) => match map.get("messageList") {
			Some(Value::Array(items)) => items.as_slice(),
			_ => &[],
		},
		_ => &[],
	};

	for (index, item) in list.iter().enumerate() {
		let code = first_present(item, &["msgTypeCode", "messageTypeCode"])
			.and_then(Value::as_i64)
			.unwrap_or_default();
		match parse_chat_payload(item, is_recent) {
			Ok(payload) => batch.entries.push(ChatEntry {
				kind: ChatMessageType::from_code(code),
				payload,
			}),
			Err(err) => batch.skipped.push(SkippedEntry {
				location: format!("entries[{index}]"),
				reason: err.to_string(),
			}),
		}
	}

	batch
}
