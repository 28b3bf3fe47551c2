#![forbid(unsafe_code)]

pub mod framing;
pub mod messages;

pub use framing::{DEFAULT_MAX_FRAME_SIZE, FramingError, decode_client_frame, encode_client_frame, encode_server_frame};
pub use messages::{
	AggregateUpdate, ClientMessage, ErrorCode, ErrorPayload, EventAck, InitialState, JoinDashboard, ReconnectData,
	ReconnectRequest, ServerMessage,
};

/// Protocol version constants.
pub mod version {
	/// Current protocol major version (v1).
	pub const PROTOCOL_MAJOR: u32 = 1;
	/// Current protocol minor version.
	pub const PROTOCOL_MINOR: u32 = 0;

	/// Compact representation useful for logs/metrics.
	pub const PROTOCOL_VERSION_U32: u32 = (PROTOCOL_MAJOR << 16) | PROTOCOL_MINOR;
}
