#![forbid(unsafe_code)]

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use pulse_util::SecretString;
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;

use crate::util::time::unix_ms_now;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
	#[error("authentication required")]
	Missing,
	#[error("invalid token format")]
	Malformed,
	#[error("unsupported token algorithm: {0}")]
	UnsupportedAlgorithm(String),
	#[error("invalid token signature")]
	BadSignature,
	#[error("token expired")]
	Expired,
	#[error("invalid token")]
	Rejected,
}

/// HS256 claims. Tokens carry the subject as either `sub` or `userId`.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthClaims {
	#[serde(default)]
	pub sub: Option<String>,
	#[serde(default, rename = "userId")]
	pub user_id: Option<String>,
	#[serde(default)]
	pub exp: Option<u64>,
}

impl AuthClaims {
	pub fn subject(&self) -> Option<&str> {
		self.sub.as_deref().or(self.user_id.as_deref())
	}
}

/// Who a request or connection authenticated as.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Principal {
	pub subject: Option<String>,
}

#[derive(Deserialize)]
struct JwtHeader {
	alg: String,
}

/// Verify a compact HS256 JWT against `secret`.
pub fn verify_hs256(token: &str, secret: &[u8]) -> Result<AuthClaims, AuthError> {
	let mut parts = token.split('.');
	let (Some(header_b64), Some(payload_b64), Some(sig_b64), None) = (parts.next(), parts.next(), parts.next(), parts.next())
	else {
		return Err(AuthError::Malformed);
	};

	let header = URL_SAFE_NO_PAD.decode(header_b64).map_err(|_| AuthError::Malformed)?;
	let header: JwtHeader = serde_json::from_slice(&header).map_err(|_| AuthError::Malformed)?;
	if header.alg != "HS256" {
		return Err(AuthError::UnsupportedAlgorithm(header.alg));
	}

	let signing_input = &token[..header_b64.len() + 1 + payload_b64.len()];
	let expected_sig = sign(signing_input.as_bytes(), secret)?;
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).map_err(|_| AuthError::Malformed)?;
	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(AuthError::BadSignature);
	}

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| AuthError::Malformed)?;
	let claims: AuthClaims = serde_json::from_slice(&payload).map_err(|_| AuthError::Malformed)?;

	let now_secs = (unix_ms_now() / 1000).max(0) as u64;
	if let Some(exp) = claims.exp
		&& exp <= now_secs
	{
		return Err(AuthError::Expired);
	}

	Ok(claims)
}

fn sign(input: &[u8], secret: &[u8]) -> Result<Vec<u8>, AuthError> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|_| AuthError::Rejected)?;
	mac.update(input);
	Ok(mac.finalize().into_bytes().to_vec())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

/// Credential check shared by the push stream and the REST API.
///
/// A static token and a JWT secret may both be configured; either one
/// admitting the token is enough. With neither configured every caller is
/// admitted.
#[derive(Debug, Clone, Default)]
pub struct Authenticator {
	auth_token: Option<SecretString>,
	jwt_secret: Option<SecretString>,
}

impl Authenticator {
	pub fn new(auth_token: Option<SecretString>, jwt_secret: Option<SecretString>) -> Self {
		Self { auth_token, jwt_secret }
	}

	pub fn is_enabled(&self) -> bool {
		self.auth_token.is_some() || self.jwt_secret.is_some()
	}

	pub fn authenticate(&self, token: Option<&str>) -> Result<Principal, AuthError> {
		if !self.is_enabled() {
			return Ok(Principal::default());
		}

		let token = token.map(str::trim).filter(|t| !t.is_empty()).ok_or(AuthError::Missing)?;

		if let Some(expected) = &self.auth_token
			&& constant_time_eq(expected.expose().as_bytes(), token.as_bytes())
		{
			return Ok(Principal::default());
		}

		match &self.jwt_secret {
			Some(secret) => {
				let claims = verify_hs256(token, secret.expose().as_bytes())?;
				Ok(Principal {
					subject: claims.subject().map(str::to_string),
				})
			}
			None => Err(AuthError::Rejected),
		}
	}
}

/// Token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
	let (scheme, token) = header.trim().split_once(' ')?;
	if !scheme.eq_ignore_ascii_case("bearer") {
		return None;
	}
	let token = token.trim();
	(!token.is_empty()).then_some(token)
}

/// Token from a `token=` query parameter.
pub fn query_token(query: Option<&str>) -> Option<String> {
	url::form_urlencoded::parse(query?.as_bytes())
		.find(|(k, _)| k == "token")
		.map(|(_, v)| v.into_owned())
		.filter(|v| !v.is_empty())
}

#[cfg(test)]
pub(crate) fn sign_hs256_for_tests(claims: &serde_json::Value, secret: &str) -> String {
	let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
	let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).expect("claims json"));
	let input = format!("{header}.{payload}");
	let sig = sign(input.as_bytes(), secret.as_bytes()).expect("sign");
	format!("{input}.{}", URL_SAFE_NO_PAD.encode(sig))
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	fn far_future() -> u64 {
		(unix_ms_now() / 1000) as u64 + 3_600
	}

	#[test]
	fn jwt_roundtrip_with_sub_or_user_id() {
		let token = sign_hs256_for_tests(&json!({"sub": "alice", "exp": far_future()}), "s3cret");
		let claims = verify_hs256(&token, b"s3cret").expect("valid");
		assert_eq!(claims.subject(), Some("alice"));

		let token = sign_hs256_for_tests(&json!({"userId": "bob"}), "s3cret");
		let claims = verify_hs256(&token, b"s3cret").expect("valid");
		assert_eq!(claims.subject(), Some("bob"));
	}

	#[test]
	fn jwt_rejects_tampering_expiry_and_garbage() {
		let token = sign_hs256_for_tests(&json!({"sub": "alice", "exp": far_future()}), "s3cret");
		assert_eq!(verify_hs256(&token, b"other").unwrap_err(), AuthError::BadSignature);

		let expired = sign_hs256_for_tests(&json!({"sub": "alice", "exp": 1}), "s3cret");
		assert_eq!(verify_hs256(&expired, b"s3cret").unwrap_err(), AuthError::Expired);

		assert_eq!(verify_hs256("a.b", b"s3cret").unwrap_err(), AuthError::Malformed);
		assert_eq!(verify_hs256("a.b.c.d", b"s3cret").unwrap_err(), AuthError::Malformed);

		let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
		let none = format!("{header}.e30.");
		assert!(matches!(verify_hs256(&none, b"s3cret"), Err(AuthError::UnsupportedAlgorithm(_))));
	}

	#[test]
	fn authenticator_modes() {
		let open = Authenticator::default();
		assert!(!open.is_enabled());
		assert_eq!(open.authenticate(None), Ok(Principal::default()));

		let static_only = Authenticator::new(Some(SecretString::new("tok")), None);
		assert!(static_only.authenticate(Some("tok")).is_ok());
		assert_eq!(static_only.authenticate(Some("nope")), Err(AuthError::Rejected));
		assert_eq!(static_only.authenticate(None), Err(AuthError::Missing));
		assert_eq!(static_only.authenticate(Some("  ")), Err(AuthError::Missing));

		let jwt = Authenticator::new(None, Some(SecretString::new("s3cret")));
		let token = sign_hs256_for_tests(&json!({"sub": "carol", "exp": far_future()}), "s3cret");
		assert_eq!(
			jwt.authenticate(Some(&token)),
			Ok(Principal {
				subject: Some("carol".to_string())
			})
		);
	}

	#[test]
	fn token_extraction() {
		assert_eq!(bearer_token("Bearer abc"), Some("abc"));
		assert_eq!(bearer_token("bearer  abc "), Some("abc"));
		assert_eq!(bearer_token("Basic abc"), None);
		assert_eq!(bearer_token("Bearer"), None);

		assert_eq!(query_token(Some("a=1&token=x%2By")), Some("x+y".to_string()));
		assert_eq!(query_token(Some("token=")), None);
		assert_eq!(query_token(None), None);
	}
}
