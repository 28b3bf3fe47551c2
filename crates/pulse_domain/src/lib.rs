#![forbid(unsafe_code)]

pub mod event;
pub mod window;

pub use event::{Event, EventId, EventValidationError, RawEvent, RawTimestamp, ValidatedEvent, is_truthy};
pub use window::{AggregateRecord, AggregateView, DEFAULT_WINDOWS_MS, LatestAggregates, WindowAccumulator, WindowKey};

/// Room name used when a dashboard joins without naming one.
pub const DEFAULT_ROOM: &str = "dashboard";

/// Maximum accepted serialized event payload (16 KiB).
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 16 * 1024;
