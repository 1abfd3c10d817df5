//! Transmit Window (spec §4.4): a sequenced buffer of sent skbs with a retransmit queue.
//!
//! Runtime-sized rather than the fixed `N` of `collections::sparse::Ring` — `txw_sqns` is either
//! given directly or derived from `txw_secs * txw_max_rte / mtu` at bind time — so storage here
//! is a plain `Vec<Option<T>>` addressed modulo capacity, the same slot-addressing idiom as
//! `Ring` generalized to a capacity chosen at construction.

use std::collections::VecDeque;

use log::debug;

use crate::seq::Sequence;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct RepairRequest {
	/// A sequence number for a data repair, or a transmission-group id for a parity repair.
	key: u32,
	is_parity: bool,
}

pub struct Txw<T> {
	capacity: usize,
	trail: Sequence,
	lead: Sequence,
	slots: Vec<Option<T>>,
	retransmit: VecDeque<RepairRequest>,
	/// Repair requests for sequences below `trail` are dropped at scan time; this counts them.
	pub naks_failed_rxw_advanced: u64,
}

impl<T> Txw<T> {
	pub fn new(capacity: usize) -> Self {
		assert!(capacity > 0);
		Self {
			capacity,
			trail: Sequence::ZERO,
			lead: Sequence::ZERO,
			slots: (0..capacity).map(|_| None).collect(),
			retransmit: VecDeque::new(),
			naks_failed_rxw_advanced: 0,
		}
	}

	pub fn trail(&self) -> Sequence {
		self.trail
	}

	pub fn lead(&self) -> Sequence {
		self.lead
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}

	fn idx(&self, seq: Sequence) -> usize {
		(seq.get() as usize) % self.capacity
	}

	/// Assign the next sequence number and store `skb`, evicting the oldest slot if the window is
	/// now over capacity. Returns the assigned sequence.
	pub fn add(&mut self, skb: T) -> Sequence {
		let seq = self.lead;
		let idx = self.idx(seq);
		self.slots[idx] = Some(skb);
		self.lead = self.lead + 1;

		if (self.lead.distance(self.trail) as i64) > self.capacity as i64 {
			let evicted = self.trail;
			self.slots[self.idx(evicted)] = None;
			self.trail = self.trail + 1;

			let before = self.retransmit.len();
			self.retransmit.retain(|r| !r.is_parity && r.key != evicted.get());
			self.naks_failed_rxw_advanced += (before - self.retransmit.len()) as u64;
		}

		seq
	}

	/// O(1) lookup; `None` if `sequence` is outside `[trail, lead)`.
	pub fn peek(&self, sequence: Sequence) -> Option<&T> {
		if !sequence.in_window(self.trail, self.lead) {
			return None;
		}
		self.slots[self.idx(sequence)].as_ref()
	}

	/// Enqueue a repair request. Parity requests are coalesced per transmission group
	/// (`sequence >> tg_sqn_shift`); data requests are coalesced per sequence. Sequences outside
	/// the window are dropped silently, counting toward `naks_failed_rxw_advanced`.
	pub fn retransmit_push(&mut self, sequence: Sequence, is_parity: bool, tg_sqn_shift: u32) {
		if !sequence.in_window(self.trail, self.lead) {
			debug!("Repair request for {sequence:?} outside window [{:?}, {:?})", self.trail, self.lead);
			self.naks_failed_rxw_advanced += 1;
			return;
		}

		let key = if is_parity { sequence.tg(tg_sqn_shift) } else { sequence.get() };

		if self.retransmit.iter().any(|r| r.is_parity == is_parity && r.key == key) {
			return;
		}

		self.retransmit.push_back(RepairRequest { key, is_parity });
	}

	/// Peek the oldest outstanding repair request without removing it, e.g. so the caller can
	/// check the rate limiter before committing to send it.
	pub fn retransmit_try_peek(&self) -> Option<(u32, bool)> {
		self.retransmit.front().map(|r| (r.key, r.is_parity))
	}

	pub fn retransmit_remove_head(&mut self) {
		self.retransmit.pop_front();
	}

	pub fn retransmit_len(&self) -> usize {
		self.retransmit.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn add_assigns_sequential_sequences() {
		let mut txw = Txw::new(4);
		assert_eq!(txw.add("a").get(), 0);
		assert_eq!(txw.add("b").get(), 1);
		assert_eq!(txw.lead().get(), 2);
	}

	#[test]
	fn eviction_advances_trail_and_drops_stale_repair() {
		let mut txw = Txw::new(2);
		txw.add("a");
		txw.retransmit_push(Sequence::new(0), false, 0);
		txw.add("b");
		txw.add("c"); // evicts sequence 0

		assert_eq!(txw.trail().get(), 1);
		assert!(txw.peek(Sequence::new(0)).is_none());
		assert_eq!(txw.retransmit_len(), 0);
		assert_eq!(txw.naks_failed_rxw_advanced, 1);
	}

	#[test]
	fn retransmit_push_deduplicates_parity_by_transmission_group() {
		let mut txw = Txw::new(16);
		for _ in 0..8 {
			txw.add(());
		}

		txw.retransmit_push(Sequence::new(1), true, 3);
		txw.retransmit_push(Sequence::new(2), true, 3); // same tg (0) as above, coalesced
		txw.retransmit_push(Sequence::new(9), true, 3); // different tg

		assert_eq!(txw.retransmit_len(), 2);
	}

	#[test]
	fn out_of_window_request_is_dropped() {
		let mut txw = Txw::new(4);
		txw.add(());

		txw.retransmit_push(Sequence::new(99), false, 0);
		assert_eq!(txw.retransmit_len(), 0);
		assert_eq!(txw.naks_failed_rxw_advanced, 1);
	}
}
