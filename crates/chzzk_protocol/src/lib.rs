#![forbid(unsafe_code)]

pub mod codec;
pub mod command;
pub mod payload;

pub use codec::{
	ChannelScope, ChatBatch, ChatEntry, CodecError, InboundFrame, OsType, SkippedEntry, decode, encode_connect, encode_ping,
	encode_pong, encode_request_recent_chat, encode_send_chat,
};
pub use command::{ChatMessageType, Command};
pub use payload::{ParsedChatPayload, parse_chat_payload};

/// Protocol version constants.
pub mod version {
	/// Value of the `ver` field carried by every outbound frame.
	pub const PROTOCOL_VERSION: u32 = 2;

	/// Service id sent alongside the chat channel id.
	pub const SERVICE_ID: &str = "game";

	/// Device type reported in the CONNECT handshake.
	pub const DEVICE_TYPE: u32 = 2001;
}
