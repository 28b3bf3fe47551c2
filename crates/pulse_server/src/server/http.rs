#![forbid(unsafe_code)]

use std::convert::Infallible;
use std::net::SocketAddr;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use hyper::http::request::Parts;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::server::auth::{AuthError, Principal, bearer_token, query_token};
use crate::server::gateway::IngestError;
use crate::server::state::AppState;

/// Default and maximum `limit` for `/api/events/recent`.
pub const DEFAULT_RECENT_LIMIT: usize = 100;
pub const MAX_RECENT_LIMIT: usize = 1_000;

/// Accept loop for the REST API and health endpoints.
pub async fn serve_http(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
	loop {
		let (stream, remote) = match listener.accept().await {
			Ok(v) => v,
			Err(e) => {
				warn!(error = %e, "http accept failed");
				continue;
			}
		};
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle(req, state.clone(), remote));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				debug!(error = %err, %remote, "http connection error");
			}
		});
	}
}

async fn handle(req: Request<Incoming>, state: AppState, remote: SocketAddr) -> Result<Response<Full<Bytes>>, Infallible> {
	let (parts, body) = req.into_parts();
	let method = parts.method.clone();
	let path = parts.uri.path().to_string();

	let resp = match (method.clone(), path.as_str()) {
		(Method::GET, "/healthz") => text(StatusCode::OK, "ok"),
		(Method::GET, "/readyz") => readyz(&state).await,
		(Method::POST, "/api/events") => post_event(&parts, body, &state, remote).await,
		(Method::GET, "/api/events/recent") => recent_events(&parts, &state).await,
		(Method::GET, "/api/aggregates/latest") => {
			let aggregates = state.engine.get_latest_aggregates().await;
			json_response(StatusCode::OK, &json!({ "aggregates": aggregates }))
		}
		(_, "/healthz" | "/readyz" | "/api/events" | "/api/events/recent" | "/api/aggregates/latest") => {
			error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
		}
		_ => error_response(StatusCode::NOT_FOUND, "not found"),
	};

	debug!(%method, path, status = resp.status().as_u16(), %remote, "http request");
	Ok(resp)
}

async fn readyz(state: &AppState) -> Response<Full<Bytes>> {
	if !state.health.is_ready() {
		return text(StatusCode::SERVICE_UNAVAILABLE, "not-ready");
	}
	match state.ping_stores().await {
		Ok(()) => text(StatusCode::OK, "ready"),
		Err(e) => {
			warn!(error = %e, "readiness check: store ping failed");
			text(StatusCode::SERVICE_UNAVAILABLE, "store-unavailable")
		}
	}
}

fn authenticate(parts: &Parts, state: &AppState) -> Result<Principal, AuthError> {
	let header = parts
		.headers
		.get(AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(bearer_token)
		.map(str::to_string);
	let token = header.or_else(|| query_token(parts.uri.query()));
	state.auth.authenticate(token.as_deref())
}

async fn post_event(parts: &Parts, body: Incoming, state: &AppState, remote: SocketAddr) -> Response<Full<Bytes>> {
	if let Err(e) = authenticate(parts, state) {
		return auth_failure(e);
	}

	let max = state.gateway.max_payload_bytes();
	// one byte over the limit is enough for the gateway to reject it
	let body = match Limited::new(body, max + 1).collect().await {
		Ok(collected) => collected.to_bytes(),
		Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
			metrics::counter!("pulse_server_events_rejected_total", "reason" => "payload_too_large").increment(1);
			return error_response(StatusCode::PAYLOAD_TOO_LARGE, &format!("payload exceeds {max} bytes"));
		}
		Err(e) => {
			debug!(error = %e, %remote, "failed to read request body");
			return error_response(StatusCode::BAD_REQUEST, "failed to read request body");
		}
	};

	let mut gate = state.rest_limiter.gate(remote.ip());
	match state.gateway.submit_bytes(&body, &mut gate).await {
		Ok(accepted) => {
			debug!(event_id = %accepted.event.id, duplicate = accepted.duplicate, "event accepted over http");
			json_response(StatusCode::CREATED, &json!({ "success": true }))
		}
		Err(e) => ingest_failure(&e),
	}
}

async fn recent_events(parts: &Parts, state: &AppState) -> Response<Full<Bytes>> {
	if let Err(e) = authenticate(parts, state) {
		return auth_failure(e);
	}

	let limit = parse_limit(parts.uri.query());
	match state.events.recent(limit).await {
		Ok(events) => json_response(StatusCode::OK, &json!({ "events": events })),
		Err(e) => {
			warn!(error = %e, "reading recent events failed");
			error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to fetch events")
		}
	}
}

/// `limit` query parameter; unparseable or zero falls back to the default.
pub fn parse_limit(query: Option<&str>) -> usize {
	query
		.and_then(|q| {
			url::form_urlencoded::parse(q.as_bytes())
				.find(|(k, _)| k == "limit")
				.and_then(|(_, v)| v.trim().parse::<usize>().ok())
		})
		.filter(|v| *v > 0)
		.unwrap_or(DEFAULT_RECENT_LIMIT)
		.min(MAX_RECENT_LIMIT)
}

fn ingest_failure(e: &IngestError) -> Response<Full<Bytes>> {
	let status = match e {
		IngestError::Validation(_) => StatusCode::BAD_REQUEST,
		IngestError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
		IngestError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
		IngestError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
		IngestError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
	};
	let message = match e {
		IngestError::Persistence(_) => "failed to process event".to_string(),
		other => other.to_string(),
	};
	error_response(status, &message)
}

fn auth_failure(e: AuthError) -> Response<Full<Bytes>> {
	metrics::counter!("pulse_server_auth_failures_total", "channel" => "http").increment(1);
	error_response(StatusCode::UNAUTHORIZED, &e.to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
	json_response(status, &json!({ "error": message }))
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
	let body = match serde_json::to_vec(body) {
		Ok(b) => Bytes::from(b),
		Err(e) => {
			warn!(error = %e, "failed to encode response body");
			return text(StatusCode::INTERNAL_SERVER_ERROR, "encode error");
		}
	};
	let mut resp = Response::new(Full::new(body));
	*resp.status_mut() = status;
	resp.headers_mut()
		.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
	resp
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
	*resp.status_mut() = status;
	resp.headers_mut()
		.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
	resp
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn recent_limit_defaults_and_clamps() {
		assert_eq!(parse_limit(None), 100);
		assert_eq!(parse_limit(Some("limit=5")), 5);
		assert_eq!(parse_limit(Some("limit=abc")), 100);
		assert_eq!(parse_limit(Some("limit=0")), 100);
		assert_eq!(parse_limit(Some("other=1&limit=50000")), 1_000);
	}

	#[test]
	fn ingest_errors_map_to_statuses() {
		assert_eq!(ingest_failure(&IngestError::RateLimited).status(), StatusCode::TOO_MANY_REQUESTS);
		assert_eq!(
			ingest_failure(&IngestError::PayloadTooLarge { len: 2, max: 1 }).status(),
			StatusCode::PAYLOAD_TOO_LARGE
		);
		assert_eq!(
			ingest_failure(&IngestError::Persistence("boom".into())).status(),
			StatusCode::INTERNAL_SERVER_ERROR
		);
		assert_eq!(ingest_failure(&IngestError::ShuttingDown).status(), StatusCode::SERVICE_UNAVAILABLE);
	}
}
