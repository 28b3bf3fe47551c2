#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use pulse_protocol::AggregateUpdate;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Dashboard rooms that fan out aggregate updates to subscribed connections.
#[derive(Debug, Clone)]
pub struct RoomHub {
	inner: Arc<Mutex<Inner>>,
	cfg: RoomHubConfig,
}

#[derive(Debug, Clone)]
pub struct RoomHubConfig {
	/// Maximum number of queued updates per subscriber.
	pub subscriber_queue_capacity: usize,
}

impl Default for RoomHubConfig {
	fn default() -> Self {
		Self {
			subscriber_queue_capacity: 256,
		}
	}
}

/// Items emitted on a subscriber stream.
#[derive(Debug, Clone)]
pub enum RoomHubItem {
	Update(Arc<AggregateUpdate>),

	/// The subscriber is lagging and updates were dropped.
	Lagged {
		dropped: u64,
	},
}

/// Per-publish delivery counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishStats {
	pub delivered: usize,
	pub dropped: usize,
}

impl RoomHub {
	pub fn new(cfg: RoomHubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Subscribe to a room.
	pub async fn subscribe_room(&self, room: &str) -> mpsc::Receiver<RoomHubItem> {
		let (tx, rx) = mpsc::channel(self.cfg.subscriber_queue_capacity.max(1));

		let mut inner = self.inner.lock().await;
		let entry = inner.rooms.entry(room.to_string()).or_default();

		prune_closed_subscribers(entry);

		entry.subscribers.push(tx);
		entry.pending_lag_by_subscriber.push(0);

		debug!(room, subs = entry.subscribers.len(), "room hub: subscribed");

		rx
	}

	/// Drop closed subscribers of `room`, and the room itself once empty.
	pub async fn prune_room(&self, room: &str) {
		let mut inner = self.inner.lock().await;
		if let Some(entry) = inner.rooms.get_mut(room) {
			prune_closed_subscribers(entry);

			if entry.subscribers.is_empty() {
				inner.rooms.remove(room);
			}
		}
	}

	/// Publish to every subscriber of one room.
	pub async fn publish_to_room(&self, room: &str, item: RoomHubItem) -> PublishStats {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.rooms.get_mut(room) else {
			return PublishStats::default();
		};

		let stats = self.deliver(room, entry, &item);

		if entry.subscribers.is_empty() {
			inner.rooms.remove(room);
		}
		stats
	}

	/// Publish to every subscriber of every room.
	pub async fn publish_all(&self, item: RoomHubItem) -> PublishStats {
		let mut inner = self.inner.lock().await;
		let mut total = PublishStats::default();

		for (room, entry) in inner.rooms.iter_mut() {
			let stats = self.deliver(room, entry, &item);
			total.delivered += stats.delivered;
			total.dropped += stats.dropped;
		}

		inner.rooms.retain(|_, entry| !entry.subscribers.is_empty());
		total
	}

	/// One failing subscriber never stops delivery to the rest.
	fn deliver(&self, room: &str, entry: &mut RoomEntry, item: &RoomHubItem) -> PublishStats {
		prune_closed_subscribers(entry);

		let mut stats = PublishStats::default();

		for (idx, sub) in entry.subscribers.iter_mut().enumerate() {
			match sub.try_send(item.clone()) {
				Ok(()) => {
					stats.delivered += 1;
					if let Some(pending) = entry.pending_lag_by_subscriber.get_mut(idx)
						&& *pending > 0 && sub.try_send(RoomHubItem::Lagged { dropped: *pending }).is_ok()
					{
						*pending = 0;
					}
				}
				Err(mpsc::error::TrySendError::Full(_)) => {
					stats.dropped += 1;

					if let Some(pending) = entry.pending_lag_by_subscriber.get_mut(idx) {
						*pending = pending.saturating_add(1);
					}
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {}
			}
		}

		prune_closed_subscribers(entry);

		if stats.dropped > 0 {
			metrics::counter!("pulse_server_broadcast_dropped_total").increment(stats.dropped as u64);
			debug!(room, dropped = stats.dropped, "room hub: dropped due to full subscriber queues");
		}
		stats
	}

	/// Snapshot of live subscriber counts per room.
	pub async fn room_subscriber_counts(&self) -> HashMap<String, usize> {
		let inner = self.inner.lock().await;
		inner
			.rooms
			.iter()
			.map(|(k, v)| (k.clone(), v.subscribers.iter().filter(|s| !s.is_closed()).count()))
			.collect()
	}
}

#[derive(Debug, Default)]
struct Inner {
	rooms: HashMap<String, RoomEntry>,
}

#[derive(Debug, Default)]
struct RoomEntry {
	subscribers: Vec<mpsc::Sender<RoomHubItem>>,

	/// Pending lag markers per subscriber.
	pending_lag_by_subscriber: Vec<u64>,
}

fn prune_closed_subscribers(entry: &mut RoomEntry) {
	if entry.subscribers.len() != entry.pending_lag_by_subscriber.len() {
		entry.pending_lag_by_subscriber.resize(entry.subscribers.len(), 0);
	}

	let mut new_subs = Vec::with_capacity(entry.subscribers.len());
	let mut new_lag = Vec::with_capacity(entry.subscribers.len());

	for (idx, s) in entry.subscribers.drain(..).enumerate() {
		if !s.is_closed() {
			new_subs.push(s);
			new_lag.push(*entry.pending_lag_by_subscriber.get(idx).unwrap_or(&0));
		}
	}

	entry.subscribers = new_subs;
	entry.pending_lag_by_subscriber = new_lag;
}
