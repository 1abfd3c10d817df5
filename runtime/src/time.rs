//! A monotonic clock with a wall-clock offset captured once at initialisation.
//!
//! The original implementation selects amongst several monotonic sources at init
//! (`gettimeofday`, `clock_gettime(MONOTONIC)`, RDTSC with calibration, HPET, ...); on this
//! platform `std::time::Instant` is the one such source that is monotonic non-decreasing by
//! construction, so `Clock` wraps it rather than re-implementing source selection.

use std::time::{Duration, Instant, SystemTime};

#[derive(Clone, Copy)]
pub struct Clock {
	start: Instant,
	start_sys: SystemTime,
}

impl Clock {
	pub fn new() -> Self {
		Self { start: Instant::now(), start_sys: SystemTime::now() }
	}

	/// Monotonic microseconds elapsed since the clock was created. Saturates rather than going
	/// backwards, matching the "never decreases" guarantee the original sources provide.
	pub fn now_us(&self) -> u64 {
		self.start.elapsed().as_micros() as u64
	}

	pub fn now(&self) -> Instant {
		Instant::now()
	}

	pub fn elapsed(&self) -> Duration {
		self.start.elapsed()
	}

	/// Convert a monotonic instant to wall-clock time, using the offset captured at init.
	pub fn to_systime(&self, instant: Instant) -> SystemTime {
		self.start_sys + instant.saturating_duration_since(self.start)
	}

	/// The UNIX timestamp (seconds) corresponding to a monotonic instant.
	pub fn unix(&self, instant: Instant) -> u32 {
		self.to_systime(instant)
			.duration_since(SystemTime::UNIX_EPOCH)
			.expect("current time should be after the UNIX epoch")
			.as_secs()
			.try_into()
			.expect("32-bit UNIX time should not overflow")
	}
}

impl Default for Clock {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn monotonic_non_decreasing() {
		let clock = Clock::new();
		let a = clock.now_us();
		let b = clock.now_us();
		assert!(b >= a);
	}
}
