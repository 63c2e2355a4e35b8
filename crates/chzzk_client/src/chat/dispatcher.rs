#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chzzk_protocol::ChatMessageType;
use parking_lot::Mutex;

/// Categories subscribers can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventCategory {
	Connect,
	Reconnect,
	Disconnect,
	Notice,
	Chat,
	Donation,
	Subscription,
	SystemMessage,
	Blind,
	Event,
	TransportError,
}

impl EventCategory {
	pub const ALL: [EventCategory; 11] = [
		EventCategory::Connect,
		EventCategory::Reconnect,
		EventCategory::Disconnect,
		EventCategory::Notice,
		EventCategory::Chat,
		EventCategory::Donation,
		EventCategory::Subscription,
		EventCategory::SystemMessage,
		EventCategory::Blind,
		EventCategory::Event,
		EventCategory::TransportError,
	];

	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			EventCategory::Connect => "connect",
			EventCategory::Reconnect => "reconnect",
			EventCategory::Disconnect => "disconnect",
			EventCategory::Notice => "notice",
			EventCategory::Chat => "chat",
			EventCategory::Donation => "donation",
			EventCategory::Subscription => "subscription",
			EventCategory::SystemMessage => "system_message",
			EventCategory::Blind => "blind",
			EventCategory::Event => "event",
			EventCategory::TransportError => "transport_error",
		}
	}

	/// Category a chat entry of `kind` is routed to, if any.
	pub const fn for_message_type(kind: ChatMessageType) -> Option<Self> {
		match kind {
			ChatMessageType::Text => Some(EventCategory::Chat),
			ChatMessageType::Donation => Some(EventCategory::Donation),
			ChatMessageType::Subscription => Some(EventCategory::Subscription),
			ChatMessageType::SystemMessage => Some(EventCategory::SystemMessage),
			_ => None,
		}
	}
}

impl fmt::Display for EventCategory {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for EventCategory {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim().to_ascii_lowercase().replace('-', "_");
		Self::ALL
			.into_iter()
			.find(|c| c.as_str() == s)
			.ok_or_else(|| format!("unknown event category: {s}"))
	}
}

pub type HandlerId = usize;

/// Subscriber callback. Receives the canonical payload string.
pub type ChatHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Per-category handler registry with synchronous fan-out.
///
/// Ids are the smallest unused id within a category. Handlers are invoked from a
/// snapshot, so a handler may add or remove handlers without deadlocking.
#[derive(Default)]
pub struct EventDispatcher {
	handlers: Mutex<HashMap<EventCategory, BTreeMap<HandlerId, ChatHandler>>>,
}

impl EventDispatcher {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add<F>(&self, category: EventCategory, handler: F) -> HandlerId
	where
		F: Fn(&str) + Send + Sync + 'static,
	{
		let mut handlers = self.handlers.lock();
		let slot = handlers.entry(category).or_default();

		let mut id: HandlerId = 0;
		for used in slot.keys() {
			if *used != id {
				break;
			}
			id += 1;
		}

		slot.insert(id, Arc::new(handler));
		id
	}

	/// Returns whether a handler was removed.
	pub fn remove(&self, category: EventCategory, id: HandlerId) -> bool {
		let mut handlers = self.handlers.lock();
		let Some(slot) = handlers.get_mut(&category) else {
			return false;
		};
		let removed = slot.remove(&id).is_some();
		if slot.is_empty() {
			handlers.remove(&category);
		}
		removed
	}

	pub fn clear(&self, category: EventCategory) {
		self.handlers.lock().remove(&category);
	}

	pub fn clear_all(&self) {
		self.handlers.lock().clear();
	}

	pub fn handler_count(&self, category: EventCategory) -> usize {
		self.handlers.lock().get(&category).map_or(0, BTreeMap::len)
	}

	/// Calls every handler of `category` in id order; returns how many ran.
	pub fn emit(&self, category: EventCategory, payload: &str) -> usize {
		let snapshot: Vec<ChatHandler> = {
			let handlers = self.handlers.lock();
			match handlers.get(&category) {
				Some(slot) => slot.values().cloned().collect(),
				None => return 0,
			}
		};

		for handler in &snapshot {
			handler(payload);
		}
		snapshot.len()
	}
}

impl fmt::Debug for EventDispatcher {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let handlers = self.handlers.lock();
		let counts: BTreeMap<EventCategory, usize> = handlers.iter().map(|(c, s)| (*c, s.len())).collect();
		f.debug_struct("EventDispatcher").field("handlers", &counts).finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) + Send + Sync + 'static) {
		let seen = Arc::new(Mutex::new(Vec::new()));
		let sink = seen.clone();
		(seen, move |payload: &str| sink.lock().push(payload.to_string()))
	}

	#[test]
	fn ids_fill_the_smallest_gap() {
		let d = EventDispatcher::new();
		assert_eq!(d.add(EventCategory::Chat, |_| {}), 0);
		assert_eq!(d.add(EventCategory::Chat, |_| {}), 1);
		assert_eq!(d.add(EventCategory::Chat, |_| {}), 2);

		assert!(d.remove(EventCategory::Chat, 1));
		assert_eq!(d.add(EventCategory::Chat, |_| {}), 1);
		assert_eq!(d.add(EventCategory::Chat, |_| {}), 3);

		// Categories are numbered independently.
		assert_eq!(d.add(EventCategory::Notice, |_| {}), 0);
	}

	#[test]
	fn emit_reaches_only_the_category() {
		let d = EventDispatcher::new();
		let (chat, chat_handler) = recorder();
		let (notice, notice_handler) = recorder();
		d.add(EventCategory::Chat, chat_handler);
		d.add(EventCategory::Notice, notice_handler);

		assert_eq!(d.emit(EventCategory::Chat, "hello"), 1);
		assert_eq!(d.emit(EventCategory::Donation, "ignored"), 0);

		assert_eq!(*chat.lock(), vec!["hello".to_string()]);
		assert!(notice.lock().is_empty());
	}

	#[test]
	fn removing_unknown_handler_is_false() {
		let d = EventDispatcher::new();
		assert!(!d.remove(EventCategory::Chat, 0));
		let id = d.add(EventCategory::Chat, |_| {});
		assert!(!d.remove(EventCategory::Chat, id + 1));
		assert!(d.remove(EventCategory::Chat, id));
		assert!(!d.remove(EventCategory::Chat, id));
	}

	#[test]
	fn clear_and_clear_all() {
		let d = EventDispatcher::new();
		d.add(EventCategory::Chat, |_| {});
		d.add(EventCategory::Chat, |_| {});
		d.add(EventCategory::Blind, |_| {});

		d.clear(EventCategory::Chat);
		assert_eq!(d.handler_count(EventCategory::Chat), 0);
		assert_eq!(d.handler_count(EventCategory::Blind), 1);

		d.clear_all();
		assert_eq!(d.handler_count(EventCategory::Blind), 0);
		assert_eq!(d.add(EventCategory::Chat, |_| {}), 0);
	}

	#[test]
	fn handler_may_register_during_emit() {
		let d = Arc::new(EventDispatcher::new());
		let inner = d.clone();
		d.add(EventCategory::Connect, move |_| {
			inner.add(EventCategory::Chat, |_| {});
		});

		d.emit(EventCategory::Connect, "");
		assert_eq!(d.handler_count(EventCategory::Chat), 1);
	}

	#[test]
	fn categories_parse_from_names() {
		assert_eq!("chat".parse::<EventCategory>(), Ok(EventCategory::Chat));
		assert_eq!("SYSTEM_MESSAGE".parse::<EventCategory>(), Ok(EventCategory::SystemMessage));
		assert_eq!("transport-error".parse::<EventCategory>(), Ok(EventCategory::TransportError));
		assert!("mission".parse::<EventCategory>().is_err());
	}

	#[derive(Debug, Clone)]
	enum Op {
		Add,
		Remove(usize),
	}

	fn op() -> impl Strategy<Value = Op> {
		prop_oneof![Just(Op::Add), (0usize..16).prop_map(Op::Remove)]
	}

	proptest! {
		#[test]
		fn ids_are_smallest_unused(ops in proptest::collection::vec(op(), 0..64)) {
			let d = EventDispatcher::new();
			let mut live = std::collections::BTreeSet::new();

			for op in ops {
				match op {
					Op::Add => {
						let expected = (0..).find(|i| !live.contains(i)).unwrap();
						let id = d.add(EventCategory::Chat, |_| {});
						prop_assert_eq!(id, expected);
						prop_assert!(live.insert(id));
					}
					Op::Remove(id) => {
						prop_assert_eq!(d.remove(EventCategory::Chat, id), live.remove(&id));
					}
				}
			}
			prop_assert_eq!(d.handler_count(EventCategory::Chat), live.len());
		}
	}
}
