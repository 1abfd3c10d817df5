//! Per-remote-source state, keyed by TSI (spec §3 "Peer").

use core::fmt;
use std::time::Instant;

use collections::map::Key;
use proto::codec::nla::Nla;
use proto::{Rxw, Sequence};

/// Transport Session Identifier: 6-byte GSI + 16-bit source port.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tsi(pub [u8; 8]);

impl Tsi {
	pub fn new(gsi: [u8; 6], sport: u16) -> Self {
		let mut bytes = [0u8; 8];
		bytes[..6].copy_from_slice(&gsi);
		bytes[6..].copy_from_slice(&sport.to_be_bytes());
		Tsi(bytes)
	}

	pub fn gsi(&self) -> [u8; 6] {
		self.0[..6].try_into().unwrap()
	}

	pub fn sport(&self) -> u16 {
		u16::from_be_bytes([self.0[6], self.0[7]])
	}
}

/// Canonical string form `g0.g1.g2.g3.g4.g5.sport`.
impl fmt::Display for Tsi {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let g = self.gsi();
		write!(f, "{}.{}.{}.{}.{}.{}.{}", g[0], g[1], g[2], g[3], g[4], g[5], self.sport())
	}
}

impl fmt::Debug for Tsi {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Display::fmt(self, f)
	}
}

#[derive(Default, Clone, Copy, Debug)]
pub struct Stats {
	pub naks_failed_rxw_advanced: u64,
	pub naks_ignored: u64,
	pub malformed_naks: u64,
	pub dup_spms: u64,
	pub packets_discarded: u64,
	pub cksum_errors: u64,
	pub rxw_advanced: u64,

	/// Derived from observed SPM inter-arrival times; consulted only by admin-surface readers,
	/// never by protocol logic (SPEC_FULL.md §E).
	pub min_ihb: Option<std::time::Duration>,
	pub max_ihb: Option<std::time::Duration>,
}

impl Stats {
	pub fn observe_ihb(&mut self, interval: std::time::Duration) {
		self.min_ihb = Some(self.min_ihb.map_or(interval, |m| m.min(interval)));
		self.max_ihb = Some(self.max_ihb.map_or(interval, |m| m.max(interval)));
	}
}

pub struct Peer {
	pub tsi: Tsi,
	pub source_nla: Nla,
	pub group_nla: Nla,
	pub last_hop_nla: Nla,

	pub rxw: Rxw,

	pub last_spm_sqn: Option<u32>,
	pub last_activity: Instant,

	/// Set by the receiver engine when `RXW::add` returns `Appended`; cleared once `readv`
	/// drains everything currently deliverable.
	pub has_pending: bool,

	pub stats: Stats,
}

impl Peer {
	pub fn new(tsi: Tsi, source_nla: Nla, group_nla: Nla, rxw: Rxw, now: Instant) -> Self {
		Self {
			tsi,
			source_nla,
			group_nla,
			last_hop_nla: match source_nla {
				Nla::V4(a) => Nla::V4(a),
				Nla::V6(a) => Nla::V6(a),
			},
			rxw,
			last_spm_sqn: None,
			last_activity: now,
			has_pending: false,
			stats: Stats::default(),
		}
	}

	/// Records an SPM sequence, returning `true` if it is a duplicate or stale replay of one
	/// already seen (spec §4.7, S4) — any `spm_sqn` that is not strictly newer than the last one
	/// observed, compared with serial arithmetic rather than plain equality so a reordered or
	/// looping SPM doesn't get mistaken for a fresh one.
	pub fn observe_spm(&mut self, spm_sqn: u32, now: Instant) -> bool {
		self.last_activity = now;

		let stale = match self.last_spm_sqn {
			Some(last) => Sequence::new(spm_sqn).distance(Sequence::new(last)) <= 0,
			None => false,
		};

		if stale {
			self.stats.dup_spms += 1;
		} else {
			self.last_spm_sqn = Some(spm_sqn);
		}
		stale
	}

	pub fn is_expired(&self, now: Instant, peer_expiry: std::time::Duration) -> bool {
		now.saturating_duration_since(self.last_activity) >= peer_expiry
	}
}

impl Key for Peer {
	type Type = Tsi;

	fn key(&self) -> &Self::Type {
		&self.tsi
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tsi_round_trips_gsi_and_port() {
		let tsi = Tsi::new([1, 2, 3, 4, 5, 6], 7500);
		assert_eq!(tsi.gsi(), [1, 2, 3, 4, 5, 6]);
		assert_eq!(tsi.sport(), 7500);
		assert_eq!(tsi.to_string(), "1.2.3.4.5.6.7500");
	}

	#[test]
	fn observe_spm_discards_stale_out_of_order_sequence() {
		let now = Instant::now();
		let tsi = Tsi::new([1, 2, 3, 4, 5, 6], 1000);
		let mut peer = Peer::new(tsi, Nla::V4(std::net::Ipv4Addr::LOCALHOST), Nla::V4(std::net::Ipv4Addr::LOCALHOST), proto::Rxw::new(16, None), now);

		assert!(!peer.observe_spm(10, now));
		assert!(!peer.observe_spm(11, now));

		// Sequence 5 is older than the last one seen (11), even though it isn't an exact repeat.
		assert!(peer.observe_spm(5, now));
		assert_eq!(peer.last_spm_sqn, Some(11));
		assert_eq!(peer.stats.dup_spms, 1);
	}

	#[test]
	fn observe_ihb_tracks_min_and_max() {
		let mut stats = Stats::default();
		stats.observe_ihb(std::time::Duration::from_millis(100));
		stats.observe_ihb(std::time::Duration::from_millis(300));
		stats.observe_ihb(std::time::Duration::from_millis(200));

		assert_eq!(stats.min_ihb, Some(std::time::Duration::from_millis(100)));
		assert_eq!(stats.max_ihb, Some(std::time::Duration::from_millis(300)));
	}
}
