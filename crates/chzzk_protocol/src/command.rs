#![forbid(unsafe_code)]

use core::fmt;

/// Chat protocol opcodes carried in the `cmd` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
	Ping,
	Pong,
	Connect,
	Connected,
	RequestRecentChat,
	RecentChat,
	Event,
	Chat,
	Donation,
	Kick,
	Block,
	Blind,
	Notice,
	Penalty,
	SendChat,
}

impl Command {
	pub const ALL: [Command; 15] = [
		Command::Ping,
		Command::Pong,
		Command::Connect,
		Command::Connected,
		Command::RequestRecentChat,
		Command::RecentChat,
		Command::Event,
		Command::Chat,
		Command::Donation,
		Command::Kick,
		Command::Block,
		Command::Blind,
		Command::Notice,
		Command::Penalty,
		Command::SendChat,
	];

	/// Wire value.
	pub const fn code(self) -> u32 {
		match self {
			Command::Ping => 0,
			Command::Pong => 10000,
			Command::Connect => 100,
			Command::Connected => 10100,
			Command::RequestRecentChat => 5101,
			Command::RecentChat => 15101,
			Command::Event => 93006,
			Command::Chat => 93101,
			Command::Donation => 93102,
			Command::Kick => 94005,
			Command::Block => 94006,
			Command::Blind => 94008,
			Command::Notice => 94010,
			Command::Penalty => 94015,
			Command::SendChat => 3101,
		}
	}

	pub fn from_code(code: u32) -> Option<Self> {
		Self::ALL.into_iter().find(|c| c.code() == code)
	}

	pub const fn as_str(self) -> &'static str {
		match self {
			Command::Ping => "PING",
			Command::Pong => "PONG",
			Command::Connect => "CONNECT",
			Command::Connected => "CONNECTED",
			Command::RequestRecentChat => "REQUEST_RECENT_CHAT",
			Command::RecentChat => "RECENT_CHAT",
			Command::Event => "EVENT",
			Command::Chat => "CHAT",
			Command::Donation => "DONATION",
			Command::Kick => "KICK",
			Command::Block => "BLOCK",
			Command::Blind => "BLIND",
			Command::Notice => "NOTICE",
			Command::Penalty => "PENALTY",
			Command::SendChat => "SEND_CHAT",
		}
	}
}

impl fmt::Display for Command {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}({})", self.as_str(), self.code())
	}
}

/// Message kind carried by each chat entry (`msgTypeCode` / `messageTypeCode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatMessageType {
	None,
	Text,
	Image,
	Sticker,
	Video,
	Rich,
	Donation,
	Subscription,
	SystemMessage,
}

impl ChatMessageType {
	pub const fn code(self) -> i64 {
		match self {
			ChatMessageType::None => 0,
			ChatMessageType::Text => 1,
			ChatMessageType::Image => 2,
			ChatMessageType::Sticker => 3,
			ChatMessageType::Video => 4,
			ChatMessageType::Rich => 5,
			ChatMessageType::Donation => 10,
			ChatMessageType::Subscription => 11,
			ChatMessageType::SystemMessage => 30,
		}
	}

	/// Unknown codes map to `None`; they are never routed.
	pub const fn from_code(code: i64) -> Self {
		match code {
			1 => ChatMessageType::Text,
			2 => ChatMessageType::Image,
			3 => ChatMessageType::Sticker,
			4 => ChatMessageType::Video,
			5 => ChatMessageType::Rich,
			10 => ChatMessageType::Donation,
			11 => ChatMessageType::Subscription,
			30 => ChatMessageType::SystemMessage,
			_ => ChatMessageType::None,
		}
	}

	/// Whether entries of this kind are delivered to subscribers.
	pub const fn is_routed(self) -> bool {
		matches!(
			self,
			ChatMessageType::Text
				| ChatMessageType::Donation
				| ChatMessageType::Subscription
				| ChatMessageType::SystemMessage
		)
	}
}
