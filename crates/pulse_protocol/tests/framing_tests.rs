use std::collections::BTreeMap;

use chrono::DateTime;
use pulse_domain::{AggregateView, RawTimestamp};
use pulse_protocol::{
	AggregateUpdate, ClientMessage, DEFAULT_MAX_FRAME_SIZE, ErrorCode, ErrorPayload, EventAck, FramingError,
	ReconnectRequest, ServerMessage, decode_client_frame, encode_client_frame, encode_server_frame,
};

#[test]
fn decode_event_frame_with_camel_case_fields() {
	let text = r#"{"type":"event","data":{"route":"/home","action":"click","userId":"u1","clientEventId":"c-1","timestamp":1700000000000}}"#;

	let msg = decode_client_frame(text, DEFAULT_MAX_FRAME_SIZE).expect("decode");
	let ClientMessage::Event(raw) = msg else {
		panic!("expected event message");
	};

	assert_eq!(raw.route.as_deref(), Some("/home"));
	assert_eq!(raw.action.as_deref(), Some("click"));
	assert_eq!(raw.user_id.as_deref(), Some("u1"));
	assert_eq!(raw.client_event_id.as_deref(), Some("c-1"));
	assert_eq!(raw.timestamp, Some(RawTimestamp::Millis(1_700_000_000_000)));
}

#[test]
fn client_frames_encoded_by_a_client_decode_on_the_server() {
	let frame = encode_client_frame(&ClientMessage::ReconnectRequest(ReconnectRequest { limit: Some(5) })).expect("encode");
	assert_eq!(frame, r#"{"type":"reconnect-request","data":{"limit":5}}"#);

	let msg = decode_client_frame(&frame, DEFAULT_MAX_FRAME_SIZE).expect("decode");
	assert_eq!(msg, ClientMessage::ReconnectRequest(ReconnectRequest { limit: Some(5) }));
}

#[test]
fn event_ack_and_error_shapes() {
	let ack = encode_server_frame(&ServerMessage::EventAck(EventAck {
		client_event_id: Some("c-9".to_string()),
	}))
	.expect("encode");
	assert_eq!(ack, r#"{"type":"event-ack","data":{"clientEventId":"c-9"}}"#);

	let err = encode_server_frame(&ServerMessage::Error(ErrorPayload::new(ErrorCode::RateLimited, "slow down")))
		.expect("encode");
	assert_eq!(err, r#"{"type":"error","data":{"code":"RATE_LIMITED","message":"slow down"}}"#);
}

#[test]
fn aggregate_update_uses_camel_case_view() {
	let now = DateTime::from_timestamp_millis(1_700_000_000_000).expect("ts");
	let mut view = AggregateView::empty(1_000, now);
	view.total_events = 4;
	view.routes = BTreeMap::from([("/home".to_string(), 4)]);

	let frame = encode_server_frame(&ServerMessage::AggregateUpdate(AggregateUpdate {
		window: 1_000,
		aggregates: view,
		timestamp: now,
	}))
	.expect("encode");

	let v: serde_json::Value = serde_json::from_str(&frame).expect("json");
	assert_eq!(v["type"], "aggregate-update");
	assert_eq!(v["data"]["window"], 1000);
	assert_eq!(v["data"]["aggregates"]["totalEvents"], 4);
	assert_eq!(v["data"]["aggregates"]["eventsPerSecond"], 0.0);
	assert_eq!(v["data"]["aggregates"]["routes"]["/home"], 4);
}

#[test]
fn malformed_json_is_reported() {
	let err = decode_client_frame("{not json", DEFAULT_MAX_FRAME_SIZE).unwrap_err();
	assert!(matches!(err, FramingError::Malformed(_)));
}

#[test]
fn size_limit_is_inclusive() {
	let padding = "p".repeat(64);
	let text = format!(r#"{{"type":"join-dashboard","data":{{"room":"{padding}"}}}}"#);

	assert!(decode_client_frame(&text, text.len()).is_ok());
	assert!(matches!(
		decode_client_frame(&text, text.len() - 1),
		Err(FramingError::FrameTooLarge { .. })
	));
}

#[test]
fn error_codes_on_the_wire() {
	let codes = [
		ErrorCode::Validation,
		ErrorCode::PayloadTooLarge,
		ErrorCode::RateLimited,
		ErrorCode::UnknownMessage,
		ErrorCode::Processing,
	];
	let names: Vec<&str> = codes.iter().map(|c| c.as_str()).collect();
	assert_eq!(
		names,
		["VALIDATION_ERROR", "PAYLOAD_TOO_LARGE", "RATE_LIMITED", "UNKNOWN_MESSAGE", "PROCESSING_ERROR"]
	);
}
