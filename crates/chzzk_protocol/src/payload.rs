#![forbid(unsafe_code)]

use serde::Serialize;
use serde_json::{Map, Value};

use crate::codec::CodecError;

const REGISTER_PROFILE_JSON: &str = "registerChatProfileJson";
const TARGET_PROFILE_JSON: &str = "targetChatProfileJson";

/// Canonical chat message handed to subscribers.
///
/// Both the short field names used by live frames (`msg`, `msgTime`, ...) and the
/// long ones used by recent-chat history (`content`, `messageTime`, ...) collapse
/// into this shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedChatPayload {
	pub profile: Option<Value>,
	pub extras: Option<Value>,
	pub hidden: bool,
	pub message: String,
	pub time: u64,
	pub is_recent: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub member_count: Option<u64>,
}

impl ParsedChatPayload {
	pub fn to_json(&self) -> Result<String, CodecError> {
		Ok(serde_json::to_string(self)?)
	}
}

/// Normalize one chat entry.
pub fn parse_chat_payload(entry: &Value, is_recent: bool) -> Result<ParsedChatPayload, CodecError> {
	let profile = embedded_json(entry, "profile")?;
	let mut extras = embedded_json(entry, "extras")?;

	if let Some(Value::Object(extras)) = extras.as_mut()
		&& let Some(Value::Object(params)) = extras.get_mut("params")
	{
		expand_profile_params(params)?;
	}

	let message = match first_present(entry, &["msg", "content"]) {
		None => String::new(),
		Some(Value::String(s)) => s.clone(),
		Some(other) => return Err(CodecError::invalid("msg", format!("expected string, got {other}"))),
	};

	let time = match first_present(entry, &["msgTime", "messageTime"]) {
		None => 0,
		Some(v) => v
			.as_u64()
			.ok_or_else(|| CodecError::invalid("msgTime", format!("expected unsigned integer, got {v}")))?,
	};

	let member_count = match first_present(entry, &["mbrCnt", "memberCount"]) {
		None => None,
		Some(v) => Some(
			v.as_u64()
				.ok_or_else(|| CodecError::invalid("mbrCnt", format!("expected unsigned integer, got {v}")))?,
		),
	}
	.filter(|n| *n != 0);

	let hidden = first_present(entry, &["msgStatusType", "messageStatusType"])
		.and_then(Value::as_str)
		.is_some_and(|s| s == "HIDDEN");

	Ok(ParsedChatPayload {
		profile,
		extras,
		hidden,
		message,
		time,
		is_recent,
		member_count,
	})
}

/// First non-null value among `keys`, short alias first.
pub(crate) fn first_present<'a>(entry: &'a Value, keys: &[&str]) -> Option<&'a Value> {
	keys.iter().filter_map(|k| entry.get(*k)).find(|v| !v.is_null())
}

/// `profile` and `extras` arrive as JSON documents encoded in a string.
fn embedded_json(entry: &Value, field: &'static str) -> Result<Option<Value>, CodecError> {
	match entry.get(field) {
		Some(Value::String(s)) => parse_embedded(s, field),
		Some(v @ Value::Object(_)) => Ok(Some(v.clone())),
		_ => Ok(None),
	}
}

fn parse_embedded(raw: &str, field: &'static str) -> Result<Option<Value>, CodecError> {
	if raw.trim().is_empty() {
		return Ok(None);
	}
	let value: Value = serde_json::from_str(raw).map_err(|e| CodecError::invalid(field, e.to_string()))?;
	Ok(Some(value).filter(|v| !v.is_null()))
}

fn expand_profile_params(params: &mut Map<String, Value>) -> Result<(), CodecError> {
	let (Some(Value::String(register)), Some(Value::String(target))) =
		(params.get(REGISTER_PROFILE_JSON), params.get(TARGET_PROFILE_JSON))
	else {
		return Ok(());
	};

	let register = parse_embedded(register, "extras.params.registerChatProfileJson")?;
	let target = parse_embedded(target, "extras.params.targetChatProfileJson")?;

	params.remove(REGISTER_PROFILE_JSON);
	params.remove(TARGET_PROFILE_JSON);
	params.insert("registerChatProfile".to_string(), register.unwrap_or(Value::Null));
	params.insert("targetChatProfile".to_string(), target.unwrap_or(Value::Null));
	Ok(())
}
