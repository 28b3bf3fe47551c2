#![forbid(unsafe_code)]

use std::net::SocketAddr;

use anyhow::Context as _;
use futures::{Sink, SinkExt as _, StreamExt as _};
use pulse_protocol::version::PROTOCOL_VERSION_U32;
use pulse_protocol::{
	AggregateUpdate, ClientMessage, ErrorCode, ErrorPayload, EventAck, FramingError, InitialState, JoinDashboard,
	ReconnectData, ReconnectRequest, ServerMessage, decode_client_frame, encode_server_frame,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, info, warn};

use crate::server::auth::{Principal, bearer_token, query_token};
use crate::server::gateway::IngestError;
use crate::server::http::{DEFAULT_RECENT_LIMIT, MAX_RECENT_LIMIT};
use crate::server::rate_limit::TokenBucket;
use crate::server::room_hub::RoomHubItem;
use crate::server::state::AppState;

/// Accept loop for the WebSocket push stream.
pub async fn serve_ws(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
	let mut next_conn_id: u64 = 1;

	loop {
		let (stream, remote) = match listener.accept().await {
			Ok(v) => v,
			Err(e) => {
				warn!(error = %e, "ws accept failed");
				continue;
			}
		};

		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("pulse_server_connections_total").increment(1);

		let state = state.clone();
		tokio::spawn(async move {
			if let Err(e) = handle_connection(conn_id, stream, remote, state).await {
				warn!(conn_id, error = %e, "connection handler exited with error");
			}
		});
	}
}

/// Per-connection state: one token bucket and at most one room subscription.
pub struct Session {
	pub conn_id: u64,
	bucket: TokenBucket,
	room: Option<String>,
	room_rx: Option<mpsc::Receiver<RoomHubItem>>,
}

impl Session {
	pub fn new(conn_id: u64, bucket: TokenBucket) -> Self {
		Self {
			conn_id,
			bucket,
			room: None,
			room_rx: None,
		}
	}

	pub fn room(&self) -> Option<&str> {
		self.room.as_deref()
	}

	/// Decode and answer one text frame.
	pub async fn handle_frame(&mut self, state: &AppState, text: &str) -> Vec<ServerMessage> {
		match decode_client_frame(text, state.gateway.max_payload_bytes()) {
			Ok(msg) => self.handle_message(state, msg).await,
			Err(e) => {
				debug!(conn_id = self.conn_id, error = %e, "rejected client frame");
				vec![ServerMessage::Error(framing_error(&e))]
			}
		}
	}

	pub async fn handle_message(&mut self, state: &AppState, msg: ClientMessage) -> Vec<ServerMessage> {
		debug!(conn_id = self.conn_id, kind = msg.kind(), "client message");

		match msg {
			ClientMessage::Event(raw) => match state.gateway.submit(raw, &mut self.bucket).await {
				Ok(accepted) => vec![ServerMessage::EventAck(EventAck {
					client_event_id: accepted.event.client_event_id,
				})],
				Err(e) => {
					debug!(conn_id = self.conn_id, error = %e, "event rejected");
					vec![ServerMessage::Error(ingest_error(&e))]
				}
			},
			ClientMessage::JoinDashboard(JoinDashboard { room }) => {
				let room = room
					.map(|r| r.trim().to_string())
					.filter(|r| !r.is_empty())
					.unwrap_or_else(|| state.default_room.clone());
				self.join(state, room).await;

				let aggregates = state.engine.get_latest_aggregates().await;
				vec![ServerMessage::InitialState(InitialState { aggregates })]
			}
			ClientMessage::ReconnectRequest(ReconnectRequest { limit }) => {
				let limit = limit.filter(|l| *l > 0).unwrap_or(DEFAULT_RECENT_LIMIT).min(MAX_RECENT_LIMIT);
				let aggregates = state.engine.get_latest_aggregates().await;
				match state.events.recent(limit).await {
					Ok(recent_events) => vec![ServerMessage::ReconnectData(ReconnectData {
						aggregates,
						recent_events,
					})],
					Err(e) => {
						warn!(conn_id = self.conn_id, error = %e, "reading recent events failed");
						vec![ServerMessage::Error(ErrorPayload::new(
							ErrorCode::Processing,
							"failed to fetch recent events",
						))]
					}
				}
			}
		}
	}

	async fn join(&mut self, state: &AppState, room: String) {
		if self.room.as_deref() == Some(room.as_str()) && self.room_rx.is_some() {
			return;
		}

		let previous = self.room.take();
		self.room_rx = Some(state.hub.subscribe_room(&room).await);
		if let Some(prev) = previous {
			state.hub.prune_room(&prev).await;
		}

		info!(conn_id = self.conn_id, room = %room, "joined dashboard room");
		self.room = Some(room);
	}

	/// Next item from the joined room; pends forever while not joined.
	async fn next_room_item(&mut self) -> Option<RoomHubItem> {
		match self.room_rx.as_mut() {
			Some(rx) => rx.recv().await,
			None => std::future::pending().await,
		}
	}
}

fn framing_error(e: &FramingError) -> ErrorPayload {
	match e {
		FramingError::FrameTooLarge { .. } => {
			metrics::counter!("pulse_server_events_rejected_total", "reason" => "payload_too_large").increment(1);
			ErrorPayload::new(ErrorCode::PayloadTooLarge, e.to_string())
		}
		FramingError::UnknownType(_) => ErrorPayload::new(ErrorCode::UnknownMessage, e.to_string()),
		_ => ErrorPayload::new(ErrorCode::Validation, e.to_string()),
	}
}

fn ingest_error(e: &IngestError) -> ErrorPayload {
	match e {
		IngestError::Persistence(_) => ErrorPayload::new(e.code(), "failed to process event"),
		other => ErrorPayload::new(other.code(), other.to_string()),
	}
}

fn handshake_token(req: &Request) -> Option<String> {
	req.headers()
		.get("authorization")
		.and_then(|v| v.to_str().ok())
		.and_then(bearer_token)
		.map(str::to_string)
		.or_else(|| query_token(req.uri().query()))
}

async fn send_message<S>(sink: &mut S, msg: &ServerMessage) -> anyhow::Result<()>
where
	S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
	let text = encode_server_frame(msg)?;
	sink.send(Message::text(text)).await.context("send frame")
}

pub async fn handle_connection(conn_id: u64, stream: TcpStream, remote: SocketAddr, state: AppState) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("pulse_server_active_connections").decrement(1.0);
		}
	}

	let mut principal: Option<Principal> = None;
	let auth = state.auth.clone();
	let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
		match auth.authenticate(handshake_token(req).as_deref()) {
			Ok(p) => {
				principal = Some(p);
				Ok(response)
			}
			Err(e) => {
				metrics::counter!("pulse_server_auth_failures_total", "channel" => "ws").increment(1);
				let mut resp = ErrorResponse::new(Some(e.to_string()));
				*resp.status_mut() = StatusCode::UNAUTHORIZED;
				Err(resp)
			}
		}
	};

	let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
		Ok(ws) => ws,
		Err(e) => {
			debug!(conn_id, %remote, error = %e, "ws handshake failed");
			return Ok(());
		}
	};
	let subject = principal.and_then(|p| p.subject);

	metrics::gauge!("pulse_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	info!(
		conn_id,
		%remote,
		subject = subject.as_deref().unwrap_or("-"),
		protocol_version = PROTOCOL_VERSION_U32,
		"accepted connection"
	);

	let (mut write, mut read) = ws.split();
	let mut session = Session::new(conn_id, state.connection_bucket());

	loop {
		tokio::select! {
			frame = read.next() => {
				let Some(frame) = frame else { break };
				let frame = match frame {
					Ok(f) => f,
					Err(e) => {
						debug!(conn_id, error = %e, "ws read error");
						break;
					}
				};

				match frame {
					Message::Text(text) => {
						for reply in session.handle_frame(&state, text.as_str()).await {
							send_message(&mut write, &reply).await?;
						}
					}
					Message::Binary(_) => {
						let reply = ServerMessage::Error(ErrorPayload::new(ErrorCode::UnknownMessage, "binary frames are not supported"));
						send_message(&mut write, &reply).await?;
					}
					Message::Close(_) => break,
					_ => {}
				}
			}
			item = session.next_room_item() => {
				match item {
					Some(RoomHubItem::Update(update)) => {
						let msg = ServerMessage::AggregateUpdate(AggregateUpdate::clone(&update));
						send_message(&mut write, &msg).await?;
					}
					Some(RoomHubItem::Lagged { dropped }) => {
						send_message(&mut write, &ServerMessage::Lagged { dropped }).await?;
					}
					None => session.room_rx = None,
				}
			}
		}
	}

	if let Some(room) = session.room.take() {
		drop(session.room_rx.take());
		state.hub.prune_room(&room).await;
	}
	let _ = write.close().await;

	info!(conn_id, "connection closed");
	Ok(())
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;
	use crate::config::ServerConfig;
	use crate::server::aggregate_store::InMemoryAggregateStore;
	use crate::server::event_store::InMemoryEventStore;
	use crate::util::time::ManualClock;

	fn app_state() -> AppState {
		let mut cfg = ServerConfig::default();
		cfg.ingest.rate_limit_per_sec = 1;
		cfg.ingest.rate_limit_burst = 2;
		AppState::new(
			&cfg,
			Arc::new(InMemoryEventStore::default()),
			Arc::new(InMemoryAggregateStore::default()),
			Arc::new(ManualClock::new(1_700_000_000_000)),
		)
	}

	fn code_of(msgs: &[ServerMessage]) -> Option<&str> {
		match msgs {
			[ServerMessage::Error(e)] => Some(e.code.as_str()),
			_ => None,
		}
	}

	#[tokio::test]
	async fn event_frames_are_acked_and_limited_per_session() {
		let state = app_state();
		let mut session = Session::new(1, state.connection_bucket());

		let frame = r#"{"type":"event","data":{"route":"/home","action":"click","clientEventId":"c-1"}}"#;
		let replies = session.handle_frame(&state, frame).await;
		assert_eq!(
			replies,
			vec![ServerMessage::EventAck(EventAck {
				client_event_id: Some("c-1".to_string())
			})]
		);

		let frame = r#"{"type":"event","data":{"route":"/home","action":"click"}}"#;
		let replies = session.handle_frame(&state, frame).await;
		assert!(matches!(replies.as_slice(), [ServerMessage::EventAck(EventAck { client_event_id: None })]));

		let replies = session.handle_frame(&state, frame).await;
		assert_eq!(code_of(&replies), Some("RATE_LIMITED"));

		// another connection has its own bucket
		let mut other = Session::new(2, state.connection_bucket());
		let replies = other.handle_frame(&state, frame).await;
		assert!(matches!(replies.as_slice(), [ServerMessage::EventAck(_)]));
	}

	#[tokio::test]
	async fn bad_frames_map_to_error_codes() {
		let state = app_state();
		let mut session = Session::new(1, state.connection_bucket());

		let replies = session.handle_frame(&state, r#"{"type":"event","data":{"action":"click"}}"#).await;
		assert_eq!(code_of(&replies), Some("VALIDATION_ERROR"));

		let replies = session.handle_frame(&state, r#"{"type":"subscribe"}"#).await;
		assert_eq!(code_of(&replies), Some("UNKNOWN_MESSAGE"));

		let huge = format!(
			r#"{{"type":"event","data":{{"route":"/r","action":"a","metadata":{{"p":"{}"}}}}}}"#,
			"x".repeat(20 * 1024)
		);
		let replies = session.handle_frame(&state, &huge).await;
		assert_eq!(code_of(&replies), Some("PAYLOAD_TOO_LARGE"));
	}

	#[tokio::test]
	async fn join_uses_default_room_and_switches_rooms() {
		let state = app_state();
		let mut session = Session::new(1, state.connection_bucket());

		let replies = session.handle_frame(&state, r#"{"type":"join-dashboard"}"#).await;
		let [ServerMessage::InitialState(initial)] = replies.as_slice() else {
			panic!("expected initial-state, got {replies:?}");
		};
		assert_eq!(initial.aggregates.len(), 3);
		assert_eq!(session.room(), Some("dashboard"));

		session
			.handle_frame(&state, r#"{"type":"join-dashboard","data":{"room":"ops"}}"#)
			.await;
		assert_eq!(session.room(), Some("ops"));

		let counts = state.hub.room_subscriber_counts().await;
		assert_eq!(counts.get("ops").copied(), Some(1));
		assert_eq!(counts.get("dashboard").copied().unwrap_or(0), 0);
	}

	#[tokio::test]
	async fn reconnect_returns_recent_events_newest_first() {
		let state = app_state();
		let mut session = Session::new(1, TokenBucket::new(100, 100));

		for ts in [1_000, 3_000, 2_000] {
			let frame = format!(r#"{{"type":"event","data":{{"route":"/r","action":"a","timestamp":{ts}}}}}"#);
			session.handle_frame(&state, &frame).await;
		}

		let replies = session
			.handle_frame(&state, r#"{"type":"reconnect-request","data":{"limit":2}}"#)
			.await;
		let [ServerMessage::ReconnectData(data)] = replies.as_slice() else {
			panic!("expected reconnect-data, got {replies:?}");
		};
		let ts = data
			.recent_events
			.iter()
			.map(|e| e.timestamp.timestamp_millis())
			.collect::<Vec<_>>();
		assert_eq!(ts, vec![3_000, 2_000]);
		assert_eq!(data.aggregates.len(), 3);
	}
}
