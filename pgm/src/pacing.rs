//! Token-bucket rate limiter bounding repair (RDATA) transmission to `txw_max_rte` (spec §4.6,
//! invariant 7: "bytes sent via repair ≤ txw_max_rte · Δt + mtu").

use std::time::Instant;

pub struct Bucket {
	rate: f64,
	capacity: f64,
	tokens: f64,
	last: Instant,
}

impl Bucket {
	/// `rate` in bytes/sec, `burst` the largest single send this bucket should ever wave
	/// through immediately (the MTU headroom the invariant allows).
	pub fn new(rate: u32, burst: u32, now: Instant) -> Self {
		Self { rate: rate as f64, capacity: burst as f64, tokens: burst as f64, last: now }
	}

	fn refill(&mut self, now: Instant) {
		let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
		self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
		self.last = now;
	}

	/// Attempt to spend `bytes` tokens. On success, returns `true` and debits the bucket. On
	/// failure, returns `false` and leaves the bucket untouched — the caller should report
	/// `RATE_LIMITED` together with `wait_for(bytes, now)`.
	pub fn try_spend(&mut self, bytes: u32, now: Instant) -> bool {
		self.refill(now);

		if self.tokens >= bytes as f64 {
			self.tokens -= bytes as f64;
			true
		} else {
			false
		}
	}

	/// How long the caller must wait before `bytes` tokens would be available.
	pub fn wait_for(&mut self, bytes: u32, now: Instant) -> std::time::Duration {
		self.refill(now);

		let deficit = (bytes as f64 - self.tokens).max(0.0);
		if deficit <= 0.0 || self.rate <= 0.0 {
			std::time::Duration::ZERO
		} else {
			std::time::Duration::from_secs_f64(deficit / self.rate)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn spends_up_to_burst_immediately() {
		let now = Instant::now();
		let mut bucket = Bucket::new(1000, 1500, now);

		assert!(bucket.try_spend(1500, now));
		assert!(!bucket.try_spend(1, now));
	}

	#[test]
	fn refills_over_time() {
		let now = Instant::now();
		let mut bucket = Bucket::new(1000, 1000, now);
		bucket.try_spend(1000, now);

		let later = now + std::time::Duration::from_millis(500);
		assert!(bucket.try_spend(500, later));
	}

	#[test]
	fn wait_for_reports_nonzero_when_starved() {
		let now = Instant::now();
		let mut bucket = Bucket::new(1000, 100, now);
		bucket.try_spend(100, now);

		let wait = bucket.wait_for(1000, now);
		assert!(wait > std::time::Duration::ZERO);
	}
}
