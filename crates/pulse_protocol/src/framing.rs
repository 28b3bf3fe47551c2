#![forbid(unsafe_code)]

use pulse_domain::{DEFAULT_MAX_PAYLOAD_BYTES, RawEvent};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::messages::{ClientMessage, ServerMessage};

/// Default maximum client frame size for v1.
pub const DEFAULT_MAX_FRAME_SIZE: usize = DEFAULT_MAX_PAYLOAD_BYTES;

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("malformed frame: {0}")]
	Malformed(#[source] serde_json::Error),

	#[error("unknown message type: {0}")]
	UnknownType(String),

	#[error("invalid {kind} payload: {message}")]
	InvalidPayload {
		kind: &'static str,
		message: String,
	},

	#[error("json encode error: {0}")]
	Encode(#[source] serde_json::Error),
}

#[derive(Deserialize)]
struct Envelope {
	#[serde(rename = "type")]
	kind: String,
	#[serde(default)]
	data: serde_json::Value,
}

/// Decode one client text frame.
///
/// The size check runs before any parsing. `join-dashboard` and
/// `reconnect-request` may omit `data`.
pub fn decode_client_frame(text: &str, max_frame_size: usize) -> Result<ClientMessage, FramingError> {
	if text.len() > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: text.len(),
			max: max_frame_size,
		});
	}

	let env: Envelope = serde_json::from_str(text).map_err(FramingError::Malformed)?;

	match env.kind.as_str() {
		"event" => payload::<RawEvent>("event", env.data, false).map(ClientMessage::Event),
		"join-dashboard" => payload("join-dashboard", env.data, true).map(ClientMessage::JoinDashboard),
		"reconnect-request" => payload("reconnect-request", env.data, true).map(ClientMessage::ReconnectRequest),
		other => Err(FramingError::UnknownType(other.to_string())),
	}
}

fn payload<T: DeserializeOwned + Default>(
	kind: &'static str,
	data: serde_json::Value,
	allow_missing: bool,
) -> Result<T, FramingError> {
	if data.is_null() {
		if allow_missing {
			return Ok(T::default());
		}
		return Err(FramingError::InvalidPayload {
			kind,
			message: "missing data".to_string(),
		});
	}

	serde_json::from_value(data).map_err(|e| FramingError::InvalidPayload {
		kind,
		message: e.to_string(),
	})
}

/// Encode a server message as a JSON text frame.
pub fn encode_server_frame(msg: &ServerMessage) -> Result<String, FramingError> {
	serde_json::to_string(msg).map_err(FramingError::Encode)
}

/// Encode a client message as a JSON text frame.
pub fn encode_client_frame(msg: &ClientMessage) -> Result<String, FramingError> {
	serde_json::to_string(msg).map_err(FramingError::Encode)
}
