#![forbid(unsafe_code)]

use core::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Store-assigned event identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub uuid::Uuid);

impl EventId {
	/// Create a new random event id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for EventId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Client timestamp as it appears on the wire: RFC 3339 text or Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
	Millis(i64),
	Text(String),
}

impl RawTimestamp {
	pub fn parse(&self) -> Result<DateTime<Utc>, EventValidationError> {
		match self {
			RawTimestamp::Millis(ms) => DateTime::from_timestamp_millis(*ms)
				.ok_or_else(|| EventValidationError::InvalidTimestamp(ms.to_string())),
			RawTimestamp::Text(s) => DateTime::parse_from_rfc3339(s.trim())
				.map(|dt| dt.with_timezone(&Utc))
				.map_err(|_| EventValidationError::InvalidTimestamp(s.clone())),
		}
	}
}

/// Validation failures for inbound events.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventValidationError {
	#[error("missing required field: {0}")]
	MissingField(&'static str),
	#[error("field must be a non-empty string: {0}")]
	EmptyField(&'static str),
	#[error("timestamp is not parseable: {0}")]
	InvalidTimestamp(String),
	#[error("metadata must be a JSON object")]
	InvalidMetadata,
	#[error("malformed event body: {0}")]
	Malformed(String),
}

/// Event body exactly as submitted by a client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
	#[serde(default)]
	pub timestamp: Option<RawTimestamp>,
	#[serde(default)]
	pub user_id: Option<String>,
	#[serde(default)]
	pub session_id: Option<String>,
	#[serde(default)]
	pub route: Option<String>,
	#[serde(default)]
	pub action: Option<String>,
	#[serde(default)]
	pub metadata: Option<serde_json::Value>,
	#[serde(default)]
	pub client_event_id: Option<String>,
}

impl RawEvent {
	/// Parse a JSON body into a `RawEvent`.
	pub fn from_json(body: &[u8]) -> Result<Self, EventValidationError> {
		serde_json::from_slice(body).map_err(|e| EventValidationError::Malformed(e.to_string()))
	}

	/// Validate and stamp the event with the server receive time.
	///
	/// A missing `timestamp` defaults to `server_received_at`. Blank optional
	/// identifiers are treated as absent.
	pub fn validate(self, server_received_at: DateTime<Utc>) -> Result<ValidatedEvent, EventValidationError> {
		let route = required_str(self.route, "route")?;
		let action = required_str(self.action, "action")?;

		let timestamp = match &self.timestamp {
			Some(raw) => raw.parse()?,
			None => server_received_at,
		};

		let metadata = match self.metadata {
			None | Some(serde_json::Value::Null) => None,
			Some(serde_json::Value::Object(map)) => Some(map),
			Some(_) => return Err(EventValidationError::InvalidMetadata),
		};

		Ok(ValidatedEvent {
			timestamp,
			server_received_at,
			user_id: optional_str(self.user_id),
			session_id: optional_str(self.session_id),
			route,
			action,
			metadata,
			client_event_id: optional_str(self.client_event_id),
		})
	}
}

fn required_str(v: Option<String>, field: &'static str) -> Result<String, EventValidationError> {
	let v = v.ok_or(EventValidationError::MissingField(field))?;
	if v.trim().is_empty() {
		return Err(EventValidationError::EmptyField(field));
	}
	Ok(v)
}

fn optional_str(v: Option<String>) -> Option<String> {
	v.filter(|s| !s.trim().is_empty())
}

/// An accepted event that has not been stored yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatedEvent {
	pub timestamp: DateTime<Utc>,
	pub server_received_at: DateTime<Utc>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub user_id: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub session_id: Option<String>,
	pub route: String,
	pub action: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub client_event_id: Option<String>,
}

impl ValidatedEvent {
	/// Whether this event counts toward the `errors` tally of a window.
	pub fn is_error(&self) -> bool {
		if self.action == "error" {
			return true;
		}
		self.metadata
			.as_ref()
			.and_then(|m| m.get("error"))
			.map(is_truthy)
			.unwrap_or(false)
	}
}

/// JSON truthiness: everything except `null`, `false`, `0` and `""` counts.
pub fn is_truthy(v: &serde_json::Value) -> bool {
	match v {
		serde_json::Value::Null => false,
		serde_json::Value::Bool(b) => *b,
		serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
		serde_json::Value::String(s) => !s.is_empty(),
		serde_json::Value::Array(_) | serde_json::Value::Object(_) => true,
	}
}

/// A stored event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
	pub id: EventId,
	pub timestamp: DateTime<Utc>,
	pub server_received_at: DateTime<Utc>,
	pub stored_at: DateTime<Utc>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub user_id: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub session_id: Option<String>,
	pub route: String,
	pub action: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub client_event_id: Option<String>,
}

impl Event {
	pub fn from_validated(ev: ValidatedEvent, id: EventId, stored_at: DateTime<Utc>) -> Self {
		Self {
			id,
			timestamp: ev.timestamp,
			server_received_at: ev.server_received_at,
			stored_at,
			user_id: ev.user_id,
			session_id: ev.session_id,
			route: ev.route,
			action: ev.action,
			metadata: ev.metadata,
			client_event_id: ev.client_event_id,
		}
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	fn now() -> DateTime<Utc> {
		DateTime::from_timestamp_millis(1_700_000_000_000).unwrap()
	}

	#[test]
	fn validate_requires_route_and_action() {
		let raw = RawEvent {
			action: Some("click".into()),
			..Default::default()
		};
		assert_eq!(raw.validate(now()), Err(EventValidationError::MissingField("route")));

		let raw = RawEvent {
			route: Some("/home".into()),
			action: Some("  ".into()),
			..Default::default()
		};
		assert_eq!(raw.validate(now()), Err(EventValidationError::EmptyField("action")));
	}

	#[test]
	fn missing_timestamp_defaults_to_receive_time() {
		let raw = RawEvent {
			route: Some("/home".into()),
			action: Some("click".into()),
			..Default::default()
		};
		let ev = raw.validate(now()).unwrap();
		assert_eq!(ev.timestamp, now());
		assert_eq!(ev.server_received_at, now());
	}

	#[test]
	fn parses_rfc3339_and_millis_timestamps() {
		let body = br#"{"route":"/a","action":"b","timestamp":"2024-01-02T03:04:05.678Z"}"#;
		let ev = RawEvent::from_json(body).unwrap().validate(now()).unwrap();
		assert_eq!(ev.timestamp.timestamp_millis(), 1_704_164_645_678);

		let body = br#"{"route":"/a","action":"b","timestamp":1704164645678}"#;
		let ev = RawEvent::from_json(body).unwrap().validate(now()).unwrap();
		assert_eq!(ev.timestamp.timestamp_millis(), 1_704_164_645_678);

		let body = br#"{"route":"/a","action":"b","timestamp":"yesterday"}"#;
		let err = RawEvent::from_json(body).unwrap().validate(now()).unwrap_err();
		assert!(matches!(err, EventValidationError::InvalidTimestamp(_)));
	}

	#[test]
	fn non_string_route_is_malformed() {
		let err = RawEvent::from_json(br#"{"route":5,"action":"b"}"#).unwrap_err();
		assert!(matches!(err, EventValidationError::Malformed(_)));
	}

	#[test]
	fn error_rule_uses_action_or_truthy_metadata() {
		let mk = |action: &str, meta: serde_json::Value| {
			RawEvent {
				route: Some("/x".into()),
				action: Some(action.into()),
				metadata: Some(meta),
				..Default::default()
			}
			.validate(now())
			.unwrap()
		};

		assert!(mk("error", json!({})).is_error());
		assert!(mk("click", json!({"error": "boom"})).is_error());
		assert!(mk("click", json!({"error": true})).is_error());
		assert!(!mk("click", json!({"error": false})).is_error());
		assert!(!mk("click", json!({"error": ""})).is_error());
		assert!(!mk("click", json!({"error": 0})).is_error());
		assert!(!mk("click", json!({"other": 1})).is_error());
	}

	#[test]
	fn metadata_must_be_an_object() {
		let raw = RawEvent {
			route: Some("/x".into()),
			action: Some("y".into()),
			metadata: Some(json!([1, 2])),
			..Default::default()
		};
		assert_eq!(raw.validate(now()), Err(EventValidationError::InvalidMetadata));
	}
}
