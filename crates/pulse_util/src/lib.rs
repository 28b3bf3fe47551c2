#![forbid(unsafe_code)]

pub mod endpoint {
	use std::net::SocketAddr;

	/// Parsed `scheme://host:port` bind endpoint.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct BindEndpoint {
		pub scheme: String,
		pub host: String,
		pub port: u16,
	}

	impl BindEndpoint {
		/// Returns `host:port` (host preserved, IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Convert to `SocketAddr` only if the host is an IP literal.
		pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, String> {
			self.hostport()
				.parse()
				.map_err(|_| format!("host must be an IP literal (DNS names not supported here): {}", self.host))
		}

		/// Parse `<scheme>://host:port` where `scheme` is one of `schemes`.
		pub fn parse(s: &str, schemes: &[&str]) -> Result<Self, String> {
			let expected = schemes.first().copied().unwrap_or("http");
			let s = s.trim();
			if s.is_empty() {
				return Err(format!("endpoint must be non-empty (expected {expected}://host:port)"));
			}

			let (scheme, rest) = s
				.split_once("://")
				.ok_or_else(|| format!("invalid endpoint (expected {expected}://host:port): {s}"))?;

			let scheme = scheme.to_ascii_lowercase();
			if !schemes.iter().any(|allowed| *allowed == scheme) {
				return Err(format!("invalid endpoint scheme {scheme:?} (expected {expected}://host:port): {s}"));
			}

			if rest.contains('/') || rest.contains('?') || rest.contains('#') {
				return Err(format!(
					"invalid endpoint (expected {expected}://host:port without path/query/fragment): {s}"
				));
			}

			let (host, port_str) = rest
				.rsplit_once(':')
				.ok_or_else(|| format!("invalid endpoint (missing :port, expected {expected}://host:port): {s}"))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(format!("invalid endpoint host (expected {expected}://host:port): {s}"));
			}

			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(format!(
					"invalid endpoint host (IPv6 must be bracketed like {expected}://[::1]:3000): {s}"
				));
			}

			let port: u16 = port_str
				.trim()
				.parse()
				.map_err(|_| format!("invalid endpoint port (expected 1..=65535): {s}"))?;

			if port == 0 {
				return Err(format!("invalid endpoint port (expected 1..=65535): {s}"));
			}

			Ok(Self {
				scheme,
				host: host.to_string(),
				port,
			})
		}
	}

	/// Parse an HTTP listener endpoint (`http://host:port`).
	pub fn parse_http_bind(s: &str) -> Result<SocketAddr, String> {
		BindEndpoint::parse(s, &["http"])?.to_socket_addr_if_ip_literal()
	}

	/// Parse a WebSocket listener endpoint (`ws://host:port`).
	pub fn parse_ws_bind(s: &str) -> Result<SocketAddr, String> {
		BindEndpoint::parse(s, &["ws"])?.to_socket_addr_if_ip_literal()
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn parses_dns_hostname() {
			let e = BindEndpoint::parse("http://pulse.example.com:443", &["http"]).unwrap();
			assert_eq!(e.host, "pulse.example.com");
			assert_eq!(e.port, 443);
			assert_eq!(e.hostport(), "pulse.example.com:443");
		}

		#[test]
		fn parses_bracketed_ipv6() {
			let e = BindEndpoint::parse("ws://[::1]:3001", &["ws"]).unwrap();
			assert_eq!(e.host, "[::1]");
			assert_eq!(e.hostport(), "[::1]:3001");
		}

		#[test]
		fn rejects_wrong_scheme() {
			let err = BindEndpoint::parse("ws://127.0.0.1:3000", &["http"]).unwrap_err();
			assert!(err.contains("scheme"));
		}

		#[test]
		fn rejects_unbracketed_ipv6() {
			let err = BindEndpoint::parse("http://::1:3000", &["http"]).unwrap_err();
			assert!(err.to_lowercase().contains("ipv6"));
		}

		#[test]
		fn rejects_path_query_fragment() {
			assert!(BindEndpoint::parse("http://127.0.0.1:3000/", &["http"]).is_err());
			assert!(BindEndpoint::parse("http://127.0.0.1:3000?x=y", &["http"]).is_err());
			assert!(BindEndpoint::parse("http://127.0.0.1:3000#frag", &["http"]).is_err());
		}

		#[test]
		fn rejects_port_zero_and_missing_port() {
			assert!(BindEndpoint::parse("http://127.0.0.1:0", &["http"]).is_err());
			assert!(BindEndpoint::parse("http://127.0.0.1", &["http"]).is_err());
		}

		#[test]
		fn bind_helpers_require_ip_literals() {
			assert_eq!(parse_http_bind("http://127.0.0.1:3000").unwrap().to_string(), "127.0.0.1:3000");
			assert_eq!(parse_ws_bind("ws://[::1]:3001").unwrap().to_string(), "[::1]:3001");
			assert!(parse_http_bind("http://pulse.example.com:3000").is_err());
		}
	}
}

pub mod secret {
	use core::fmt;

	/// Wrapper that redacts in logs.
	#[derive(Clone, PartialEq, Eq)]
	pub struct SecretString(String);

	impl SecretString {
		pub fn new(s: impl Into<String>) -> Self {
			Self(s.into())
		}

		/// Access the inner secret string.
		pub fn expose(&self) -> &str {
			&self.0
		}
	}

	impl fmt::Debug for SecretString {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			f.write_str("SecretString(<redacted>)")
		}
	}

	impl fmt::Display for SecretString {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			f.write_str("<redacted>")
		}
	}

}

pub use secret::SecretString;
