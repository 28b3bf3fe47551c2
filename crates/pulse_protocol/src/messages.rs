#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use pulse_domain::{AggregateView, Event, LatestAggregates, RawEvent};
use serde::{Deserialize, Serialize};

/// Messages a client sends on the push stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
	/// Submit one interaction event.
	Event(RawEvent),
	/// Subscribe to aggregate updates; answered with `initial-state`.
	JoinDashboard(JoinDashboard),
	/// Catch up after a reconnect; answered with `reconnect-data`.
	ReconnectRequest(ReconnectRequest),
}

impl ClientMessage {
	pub const fn kind(&self) -> &'static str {
		match self {
			ClientMessage::Event(_) => "event",
			ClientMessage::JoinDashboard(_) => "join-dashboard",
			ClientMessage::ReconnectRequest(_) => "reconnect-request",
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinDashboard {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub room: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectRequest {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub limit: Option<usize>,
}

/// Messages the server pushes to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
	EventAck(EventAck),
	Error(ErrorPayload),
	InitialState(InitialState),
	ReconnectData(ReconnectData),
	AggregateUpdate(AggregateUpdate),
	/// The subscriber queue overflowed and `dropped` updates were skipped.
	Lagged { dropped: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventAck {
	pub client_event_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
	pub code: String,
	pub message: String,
}

impl ErrorPayload {
	pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
		Self {
			code: code.as_str().to_string(),
			message: message.into(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialState {
	pub aggregates: LatestAggregates,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectData {
	pub aggregates: LatestAggregates,
	pub recent_events: Vec<Event>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateUpdate {
	pub window: u64,
	pub aggregates: AggregateView,
	pub timestamp: DateTime<Utc>,
}

/// Stable error codes carried in `error` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
	Validation,
	PayloadTooLarge,
	RateLimited,
	UnknownMessage,
	Processing,
}

impl ErrorCode {
	pub const fn as_str(self) -> &'static str {
		match self {
			ErrorCode::Validation => "VALIDATION_ERROR",
			ErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
			ErrorCode::RateLimited => "RATE_LIMITED",
			ErrorCode::UnknownMessage => "UNKNOWN_MESSAGE",
			ErrorCode::Processing => "PROCESSING_ERROR",
		}
	}
}
