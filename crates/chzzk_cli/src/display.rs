#![forbid(unsafe_code)]

use chzzk_client::EventCategory;
use serde_json::Value;

/// One printable line for a chat event, or `None` when there is nothing to show.
pub fn format_event(category: EventCategory, payload: &str) -> Option<String> {
	if payload.is_empty() {
		return (category == EventCategory::Notice).then(|| "[notice] (cleared)".to_string());
	}

	let value: Value = serde_json::from_str(payload).ok()?;
	let message = value.get("message").and_then(Value::as_str).unwrap_or_default();
	let recent = if value.get("isRecent").and_then(Value::as_bool).unwrap_or(false) {
		"~"
	} else {
		""
	};

	let line = match category {
		EventCategory::Chat => format!("{recent}{}: {message}", nickname(&value)),
		EventCategory::Donation => {
			let amount = value
				.pointer("/extras/payAmount")
				.and_then(Value::as_u64)
				.map(|a| format!(" ({a})"))
				.unwrap_or_default();
			format!("{recent}[donation{amount}] {}: {message}", nickname(&value))
		}
		EventCategory::Subscription => format!("{recent}[subscription] {}: {message}", nickname(&value)),
		EventCategory::SystemMessage => format!("{recent}[system] {message}"),
		EventCategory::Notice => format!("[notice] {message}"),
		_ => return None,
	};
	Some(line)
}

fn nickname(value: &Value) -> &str {
	value
		.pointer("/profile/nickname")
		.and_then(Value::as_str)
		.unwrap_or("(anonymous)")
}
