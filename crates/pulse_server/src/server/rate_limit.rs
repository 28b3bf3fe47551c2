#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

/// Default refill rate in tokens per second.
pub const DEFAULT_RATE_PER_SEC: u32 = 50;

/// Default bucket capacity: two seconds of refill.
pub const DEFAULT_BURST: u32 = 2 * DEFAULT_RATE_PER_SEC;

/// Something that admits or denies one unit of work.
pub trait RateGate {
	fn try_acquire(&mut self) -> bool;
}

/// Lazily refilled token bucket owned by a single connection.
///
/// Refill adds `floor(elapsed * rate)` whole tokens, capped at capacity. The
/// refill anchor only moves when at least one whole token was added, so sub-token
/// intervals accumulate across checks.
#[derive(Debug, Clone)]
pub struct TokenBucket {
	capacity: f64,
	tokens: f64,
	refill_per_sec: f64,
	last_refill: Instant,
}

impl TokenBucket {
	/// Full bucket. A zero `capacity` falls back to `2 * rate_per_sec`.
	pub fn new(rate_per_sec: u32, capacity: u32) -> Self {
		Self::new_at(rate_per_sec, capacity, Instant::now())
	}

	pub fn new_at(rate_per_sec: u32, capacity: u32, now: Instant) -> Self {
		let capacity = if capacity == 0 { rate_per_sec.saturating_mul(2) } else { capacity };
		Self {
			capacity: capacity as f64,
			tokens: capacity as f64,
			refill_per_sec: rate_per_sec as f64,
			last_refill: now,
		}
	}

	pub fn allow(&mut self) -> bool {
		self.allow_at(Instant::now())
	}

	pub fn allow_at(&mut self, now: Instant) -> bool {
		let refill = self.refill_at(now);
		if refill >= 1.0 {
			self.tokens = (self.tokens + refill).min(self.capacity);
			self.last_refill = now;
		}

		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			true
		} else {
			false
		}
	}

	pub fn tokens(&self) -> f64 {
		self.tokens
	}

	/// Tokens available at `now`, counting refill that has not been applied yet.
	pub fn projected_tokens_at(&self, now: Instant) -> f64 {
		(self.tokens + self.refill_at(now)).min(self.capacity)
	}

	/// A full bucket behaves exactly like a freshly created one.
	pub fn is_full_at(&self, now: Instant) -> bool {
		self.projected_tokens_at(now) >= self.capacity
	}

	fn refill_at(&self, now: Instant) -> f64 {
		let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
		(elapsed * self.refill_per_sec).floor()
	}
}

impl RateGate for TokenBucket {
	fn try_acquire(&mut self) -> bool {
		self.allow()
	}
}

/// Token buckets keyed by remote address, for the stateless REST channel.
#[derive(Debug)]
pub struct IpRateLimiter {
	buckets: parking_lot::Mutex<HashMap<IpAddr, TokenBucket>>,
	rate_per_sec: u32,
	capacity: u32,
	max_entries: usize,
}

impl IpRateLimiter {
	pub fn new(rate_per_sec: u32, capacity: u32) -> Self {
		Self {
			buckets: parking_lot::Mutex::new(HashMap::new()),
			rate_per_sec,
			capacity,
			max_entries: 4096,
		}
	}

	pub fn allow(&self, ip: IpAddr) -> bool {
		self.allow_at(ip, Instant::now())
	}

	pub fn allow_at(&self, ip: IpAddr, now: Instant) -> bool {
		let mut buckets = self.buckets.lock();
		if buckets.len() >= self.max_entries && !buckets.contains_key(&ip) {
			Self::make_room(&mut buckets, now);
		}
		buckets
			.entry(ip)
			.or_insert_with(|| TokenBucket::new_at(self.rate_per_sec, self.capacity, now))
			.allow_at(now)
	}

	/// Drop buckets that refilled to capacity. Throttled addresses keep their
	/// state; if every bucket is throttled only the one closest to full goes.
	fn make_room(buckets: &mut HashMap<IpAddr, TokenBucket>, now: Instant) {
		let before = buckets.len();
		buckets.retain(|_, bucket| !bucket.is_full_at(now));
		if buckets.len() < before {
			return;
		}

		let fullest = buckets
			.iter()
			.max_by(|(_, a), (_, b)| a.projected_tokens_at(now).total_cmp(&b.projected_tokens_at(now)))
			.map(|(ip, _)| *ip);
		if let Some(ip) = fullest {
			buckets.remove(&ip);
		}
	}

	pub fn tracked(&self) -> usize {
		self.buckets.lock().len()
	}

	/// Gate bound to one remote address.
	pub fn gate(&self, ip: IpAddr) -> IpGate<'_> {
		IpGate { limiter: self, ip }
	}
}

pub struct IpGate<'a> {
	limiter: &'a IpRateLimiter,
	ip: IpAddr,
}

impl RateGate for IpGate<'_> {
	fn try_acquire(&mut self) -> bool {
		self.limiter.allow(self.ip)
	}
}
