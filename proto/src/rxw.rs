//! Receive Window (spec §4.5): per-peer reassembly buffer with a per-slot repair state machine.
//!
//! Storage is the same runtime-sized `Vec`-backed ring as `txw` — `rxw_sqns` is equally often
//! derived from a rate rather than fixed at compile time. Three FIFO queues (`back_off`,
//! `wait_ncf`, `wait_data`) hold sequences awaiting the next NAK-ladder scan; a slot is a member
//! of at most one of them at any time.

use std::collections::VecDeque;
use std::time::Instant;

use log::{debug, warn};

use crate::rs::Rs;
use crate::seq::Sequence;
use crate::skb::Skb;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SlotState {
	Placeholder,
	BackOff,
	WaitNcf,
	WaitData,
	HaveData,
	Lost,
	CommitData,
}

#[derive(Clone, Copy, Debug)]
struct Frag {
	first_sqn: Sequence,
	is_last: bool,
}

struct Slot {
	state: SlotState,
	skb: Option<Skb>,
	expiry: Option<Instant>,
	ncf_retries: u32,
	data_retries: u32,
	frag: Option<Frag>,
}

impl Default for Slot {
	fn default() -> Self {
		Self { state: SlotState::Placeholder, skb: None, expiry: None, ncf_retries: 0, data_retries: 0, frag: None }
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AddOutcome {
	Appended,
	Inserted,
	Duplicate,
	Malformed,
	Bounds,
}

pub struct Rxw {
	capacity: usize,
	trail: Sequence,
	lead: Sequence,
	commit_trail: Sequence,
	commit_lead: Sequence,
	slots: Vec<Slot>,
	back_off: VecDeque<Sequence>,
	wait_ncf: VecDeque<Sequence>,
	wait_data: VecDeque<Sequence>,
	rs: Option<Rs>,
	/// Parity packets received for a transmission group, keyed by the group's first data
	/// sequence, held until enough data+parity are present to attempt recovery.
	parity_cache: Vec<(Sequence, Vec<u8>)>,
	reset_pending: bool,
	pub rxw_advanced: u64,
	pub naks_failed_rxw_advanced: u64,
}

impl Rxw {
	pub fn new(capacity: usize, rs: Option<Rs>) -> Self {
		assert!(capacity > 0);
		Self {
			capacity,
			trail: Sequence::ZERO,
			lead: Sequence::ZERO,
			commit_trail: Sequence::ZERO,
			commit_lead: Sequence::ZERO,
			slots: (0..capacity).map(|_| Slot::default()).collect(),
			back_off: VecDeque::new(),
			wait_ncf: VecDeque::new(),
			wait_data: VecDeque::new(),
			rs,
			parity_cache: Vec::new(),
			reset_pending: false,
			rxw_advanced: 0,
			naks_failed_rxw_advanced: 0,
		}
	}

	pub fn trail(&self) -> Sequence {
		self.trail
	}

	pub fn lead(&self) -> Sequence {
		self.lead
	}

	pub fn wait_data_len(&self) -> usize {
		self.wait_data.len()
	}

	pub fn parity_cache_is_empty(&self) -> bool {
		self.parity_cache.is_empty()
	}

	fn idx(&self, seq: Sequence) -> usize {
		(seq.get() as usize) % self.capacity
	}

	fn queue_for(&mut self, state: SlotState) -> Option<&mut VecDeque<Sequence>> {
		match state {
			SlotState::BackOff => Some(&mut self.back_off),
			SlotState::WaitNcf => Some(&mut self.wait_ncf),
			SlotState::WaitData => Some(&mut self.wait_data),
			_ => None,
		}
	}

	/// Remove `seq` from whichever of the three timer queues it currently occupies, if any.
	fn dequeue(&mut self, seq: Sequence) {
		for q in [&mut self.back_off, &mut self.wait_ncf, &mut self.wait_data] {
			if let Some(pos) = q.iter().position(|&s| s == seq) {
				q.remove(pos);
				break;
			}
		}
	}

	/// Force a slot into `new_state`, updating queue membership and the invariant that a slot
	/// sits on at most one queue.
	pub fn state(&mut self, seq: Sequence, new_state: SlotState) {
		self.dequeue(seq);

		let idx = self.idx(seq);
		self.slots[idx].state = new_state;

		if let Some(q) = self.queue_for(new_state) {
			q.push_back(seq);
		}
	}

	/// Learn advertised transmit-window extents from an SPM.
	pub fn update(&mut self, txw_lead: Sequence, txw_trail: Sequence, now: Instant, nak_bo_ivl: std::time::Duration) {
		while self.lead.distance(txw_lead) < 0 {
			let seq = self.lead;
			self.lead = self.lead + 1;

			if (self.lead.distance(self.trail) as i64) > self.capacity as i64 {
				warn!("RXW overrun while advancing lead to {txw_lead:?}; dropping trail slot");
				self.trail = self.trail + 1;
			}

			let idx = self.idx(seq);
			self.slots[idx] = Slot { state: SlotState::Placeholder, expiry: Some(now + nak_bo_ivl), ..Slot::default() };
			self.back_off.push_back(seq);
		}

		while self.trail.distance(txw_trail) < 0 {
			let seq = self.trail;
			let idx = self.idx(seq);

			if !matches!(self.slots[idx].state, SlotState::HaveData | SlotState::CommitData) {
				self.dequeue(seq);
				self.slots[idx].state = SlotState::Lost;
				self.reset_pending = true;
				self.rxw_advanced += 1;
			}

			self.trail = self.trail + 1;
			if self.commit_trail.distance(self.trail) < 0 {
				self.commit_trail = self.trail;
			}
		}
	}

	/// ODATA/RDATA payload arrival.
	pub fn add(&mut self, sequence: Sequence, skb: Skb, frag: Option<(Sequence, bool)>) -> AddOutcome {
		if sequence.distance(self.trail) < 0 {
			return AddOutcome::Bounds;
		}
		if (sequence.distance(self.trail) as i64) >= self.capacity as i64 {
			return AddOutcome::Bounds;
		}

		let appended = sequence == self.lead;
		if sequence.distance(self.lead) >= 0 {
			// Gap: materialize placeholders for every slot strictly between the old lead and
			// `sequence`, then advance lead past it.
			while self.lead.distance(sequence) < 0 {
				let idx = self.idx(self.lead);
				self.slots[idx] = Slot::default();
				self.lead = self.lead + 1;
			}
			self.lead = sequence + 1;
		}

		let idx = self.idx(sequence);
		let outcome = match self.slots[idx].state {
			SlotState::HaveData | SlotState::CommitData => {
				return AddOutcome::Duplicate;
			}
			_ => {
				if appended {
					AddOutcome::Appended
				} else {
					AddOutcome::Inserted
				}
			}
		};

		self.dequeue(sequence);
		self.slots[idx] = Slot {
			state: SlotState::HaveData,
			skb: Some(skb),
			expiry: None,
			ncf_retries: 0,
			data_retries: 0,
			frag: frag.map(|(first_sqn, is_last)| Frag { first_sqn, is_last }),
		};

		if let Some(k) = self.rs.as_ref().map(|rs| rs.k() as u32) {
			let tg_start = Sequence::new((sequence.get() / k) * k);
			self.try_fec_decode(tg_start);
		}

		outcome
	}

	/// Parity packet arrival (proactive or on-demand) for the transmission group starting at
	/// `tg_start`. The packet carries no slot of its own in the ring; it is cached until
	/// `try_fec_decode` has enough data+parity to attempt recovery.
	pub fn add_parity(&mut self, tg_start: Sequence, payload: Vec<u8>) {
		if self.rs.is_none() {
			return;
		}

		if !tg_start.in_window(self.trail, self.lead + 1) {
			debug!("Parity for {tg_start:?} outside window [{:?}, {:?})", self.trail, self.lead);
			return;
		}

		self.parity_cache.retain(|(tg, _)| tg.in_window(self.trail, self.lead + 1));

		if self.parity_cache.iter().any(|(tg, _)| *tg == tg_start) {
			return;
		}

		self.parity_cache.push((tg_start, payload));
		self.try_fec_decode(tg_start);
	}

	/// NCF receipt: no payload yet, just an acknowledgement that the repair is in flight.
	pub fn confirm(&mut self, sequence: Sequence, now: Instant, rdata_expiry: std::time::Duration) -> Result<(), ()> {
		if !sequence.in_window(self.trail, self.lead) {
			debug!("NCF for {sequence:?} outside window [{:?}, {:?})", self.trail, self.lead);
			return Err(());
		}

		let idx = self.idx(sequence);
		match self.slots[idx].state {
			SlotState::BackOff | SlotState::WaitNcf => {
				self.dequeue(sequence);
				self.slots[idx].state = SlotState::WaitData;
				self.slots[idx].expiry = Some(now + rdata_expiry);
				self.wait_data.push_back(sequence);
				Ok(())
			}
			SlotState::WaitData | SlotState::HaveData | SlotState::CommitData => Ok(()),
			_ => Err(()),
		}
	}

	/// Explicit loss upcall (retry limit exceeded).
	pub fn lost(&mut self, sequence: Sequence) {
		self.state(sequence, SlotState::Lost);
		self.reset_pending = true;
	}

	/// Scan the BACK_OFF queue tail: slots whose backoff elapsed get promoted to WAIT_NCF and are
	/// returned so the caller can send a NAK.
	pub fn back_off_scan(&mut self, now: Instant, nak_rpt_ivl: std::time::Duration) -> Vec<Sequence> {
		let mut due = Vec::new();
		while let Some(&seq) = self.back_off.front() {
			let idx = self.idx(seq);
			match self.slots[idx].expiry {
				Some(expiry) if expiry <= now => {
					self.back_off.pop_front();
					self.slots[idx].state = SlotState::WaitNcf;
					self.slots[idx].expiry = Some(now + nak_rpt_ivl);
					self.wait_ncf.push_back(seq);
					due.push(seq);
				}
				_ => break,
			}
		}
		due
	}

	/// Scan the WAIT_NCF queue tail: resend or give up per `nak_ncf_retries`.
	pub fn wait_ncf_scan(&mut self, now: Instant, nak_ncf_retries: u32, nak_rpt_ivl: std::time::Duration) -> Vec<Sequence> {
		let mut due = Vec::new();
		while let Some(&seq) = self.wait_ncf.front() {
			let idx = self.idx(seq);
			match self.slots[idx].expiry {
				Some(expiry) if expiry <= now => {
					self.wait_ncf.pop_front();
					if self.slots[idx].ncf_retries < nak_ncf_retries {
						self.slots[idx].ncf_retries += 1;
						self.slots[idx].expiry = Some(now + nak_rpt_ivl);
						self.wait_ncf.push_back(seq);
						due.push(seq);
					} else {
						self.lost(seq);
					}
				}
				_ => break,
			}
		}
		due
	}

	/// Scan the WAIT_DATA queue tail: resend or give up per `nak_data_retries`.
	pub fn wait_data_scan(&mut self, now: Instant, nak_data_retries: u32, rdata_expiry: std::time::Duration) -> Vec<Sequence> {
		let mut due = Vec::new();
		while let Some(&seq) = self.wait_data.front() {
			let idx = self.idx(seq);
			match self.slots[idx].expiry {
				Some(expiry) if expiry <= now => {
					self.wait_data.pop_front();
					if self.slots[idx].data_retries < nak_data_retries {
						self.slots[idx].data_retries += 1;
						self.slots[idx].expiry = Some(now + rdata_expiry);
						self.wait_data.push_back(seq);
						due.push(seq);
					} else {
						self.lost(seq);
					}
				}
				_ => break,
			}
		}
		due
	}

	/// Refresh the Reed–Solomon context when the sender changes transmission-group size.
	pub fn update_fec(&mut self, rs: Option<Rs>) {
		self.rs = rs;
		self.parity_cache.clear();
	}

	/// On receiving k of n distinct packets in a transmission group, decode in place, mark
	/// missing slots HAVE_DATA, and drop outstanding repair requests for the group.
	fn try_fec_decode(&mut self, tg_start: Sequence) {
		let Some(rs) = &self.rs else { return };
		let k = rs.k() as usize;

		if !tg_start.in_window(self.trail, self.lead + 1) {
			return;
		}

		let mut data: Vec<Option<Vec<u8>>> = Vec::with_capacity(k);
		let mut missing = Vec::new();
		let mut donor = None;

		for i in 0..k {
			let seq = tg_start + i as u32;
			if !seq.in_window(self.trail, self.lead + 1) {
				return;
			}
			let idx = self.idx(seq);
			match self.slots[idx].state {
				SlotState::HaveData => {
					let skb = self.slots[idx].skb.as_ref().expect("HAVE_DATA slot always carries a payload");
					donor.get_or_insert((skb.socket, skb.tsi));
					data.push(Some(skb.buffer.to_vec()));
				}
				// Already delivered to the app; its bytes are gone, so the group can't be fed to
				// the decoder even if another slot in it is still missing.
				SlotState::CommitData => return,
				_ => {
					data.push(None);
					missing.push(i);
				}
			}
		}

		if missing.is_empty() {
			return;
		}

		let Some(pos) = self.parity_cache.iter().position(|(tg, _)| *tg == tg_start) else {
			return;
		};

		if missing.len() > 1 {
			// Only one parity packet is ever produced per group (spec §6 USE_FEC); more than one
			// loss in the group is unrecoverable until a retransmit fills the gap.
			return;
		}

		let parity = vec![(k as u8, self.parity_cache[pos].1.clone())];

		if rs.decode_appended(&mut data, &parity).is_err() {
			return;
		}

		let Some((socket, tsi)) = donor else { return };

		debug!("Recovered {} missing packet(s) in transmission group starting at {tg_start:?}", missing.len());

		for i in missing {
			let seq = tg_start + i as u32;
			let idx = self.idx(seq);
			let bytes = data[i].take().expect("decode_appended fills every missing slot");

			let mut buffer = collections::bytes::Slice::new(bytes.len());
			buffer.copy_from_slice(&bytes);

			self.dequeue(seq);
			self.slots[idx].skb = Some(Skb::new(socket, tsi, seq, buffer));
			self.slots[idx].state = SlotState::HaveData;
			self.slots[idx].expiry = None;
		}

		self.parity_cache.remove(pos);
	}

	/// Commit contiguous HAVE_DATA slots into application message vectors. Fragmented APDUs
	/// (tracked via `frag`) are only committed once every fragment from `first_sqn` through the
	/// one marked `is_last` is present; otherwise delivery blocks head-of-line at that sequence.
	pub fn readv(&mut self) -> Vec<Vec<u8>> {
		let mut out = Vec::new();

		loop {
			if self.commit_lead.distance(self.lead) >= 0 {
				break;
			}

			let idx = self.idx(self.commit_lead);
			let frag = self.slots[idx].frag;

			match frag {
				None => match self.slots[idx].state {
					SlotState::HaveData => {
						let seq = self.commit_lead;
						let idx = self.idx(seq);
						let payload = self.slots[idx].skb.take().map(|skb| skb.buffer.to_vec()).unwrap_or_default();
						self.slots[idx].state = SlotState::CommitData;
						out.push(payload);
						self.commit_lead = self.commit_lead + 1;
					}
					_ => break,
				},
				Some(f) => {
					if !self.apdu_complete(f.first_sqn) {
						break;
					}
					out.push(self.drain_apdu(f.first_sqn));
				}
			}
		}

		out
	}

	fn apdu_complete(&self, first_sqn: Sequence) -> bool {
		let mut seq = first_sqn;
		loop {
			if !seq.in_window(self.trail, self.lead) {
				return false;
			}
			let idx = self.idx(seq);
			if self.slots[idx].state != SlotState::HaveData {
				return false;
			}
			if self.slots[idx].frag.map(|f| f.is_last).unwrap_or(true) {
				return true;
			}
			seq = seq + 1;
		}
	}

	fn drain_apdu(&mut self, first_sqn: Sequence) -> Vec<u8> {
		let mut out = Vec::new();
		let mut seq = first_sqn;
		loop {
			let idx = self.idx(seq);
			let is_last = self.slots[idx].frag.map(|f| f.is_last).unwrap_or(true);
			if let Some(skb) = self.slots[idx].skb.take() {
				out.extend_from_slice(&skb.buffer);
			}
			self.slots[idx].state = SlotState::CommitData;
			if seq == self.commit_lead {
				self.commit_lead = self.commit_lead + 1;
			}
			if is_last {
				break;
			}
			seq = seq + 1;
		}
		out
	}

	/// Release already-delivered slots back to the arena, advancing `trail`.
	pub fn remove_commit(&mut self) {
		while self.trail.distance(self.commit_trail) < 0 {
			let idx = self.idx(self.trail);
			if self.slots[idx].state == SlotState::CommitData {
				self.slots[idx] = Slot::default();
				self.trail = self.trail + 1;
			} else {
				break;
			}
		}
	}

	/// Per spec §4.5: once any slot becomes LOST, the next call returns `true` exactly once, then
	/// resumes reporting `false` until another loss occurs.
	pub fn take_reset_pending(&mut self) -> bool {
		std::mem::replace(&mut self.reset_pending, false)
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use collections::bytes::Slice;

	use super::*;
	use crate::skb::SocketId;

	fn skb(bytes: &[u8]) -> Skb {
		let mut buffer = Slice::new(bytes.len());
		buffer.copy_from_slice(bytes);
		Skb::new(SocketId(0), [0; 8], Sequence::ZERO, buffer)
	}

	#[test]
	fn update_inserts_placeholders_and_marks_trail_loss() {
		let mut rxw = Rxw::new(16, None);
		let now = Instant::now();

		rxw.update(Sequence::new(4), Sequence::ZERO, now, Duration::from_millis(50));
		assert_eq!(rxw.lead().get(), 4);
		assert_eq!(rxw.back_off.len(), 4);

		rxw.update(Sequence::new(4), Sequence::new(2), now, Duration::from_millis(50));
		assert_eq!(rxw.trail().get(), 2);
		assert_eq!(rxw.rxw_advanced, 2);
	}

	#[test]
	fn add_appended_then_duplicate() {
		let mut rxw = Rxw::new(16, None);
		let outcome = rxw.add(Sequence::new(0), skb(b"hello"), None);
		assert_eq!(outcome, AddOutcome::Appended);

		let dup = rxw.add(Sequence::new(0), skb(b"hello"), None);
		assert_eq!(dup, AddOutcome::Duplicate);
	}

	#[test]
	fn readv_delivers_contiguous_have_data() {
		let mut rxw = Rxw::new(16, None);
		rxw.add(Sequence::new(0), skb(b"a"), None);
		rxw.add(Sequence::new(1), skb(b"b"), None);

		let msgs = rxw.readv();
		assert_eq!(msgs, vec![b"a".to_vec(), b"b".to_vec()]);
	}

	#[test]
	fn readv_blocks_on_incomplete_fragmented_apdu() {
		let mut rxw = Rxw::new(16, None);
		rxw.add(Sequence::new(0), skb(b"frag0-"), Some((Sequence::new(0), false)));
		// second fragment missing

		assert!(rxw.readv().is_empty());

		rxw.add(Sequence::new(1), skb(b"frag1"), Some((Sequence::new(0), true)));
		let msgs = rxw.readv();
		assert_eq!(msgs, vec![b"frag0-frag1".to_vec()]);
	}

	#[test]
	fn back_off_scan_promotes_to_wait_ncf() {
		let mut rxw = Rxw::new(16, None);
		let now = Instant::now();
		rxw.update(Sequence::new(1), Sequence::ZERO, now, Duration::from_millis(0));

		let due = rxw.back_off_scan(now + Duration::from_millis(1), Duration::from_millis(50));
		assert_eq!(due, vec![Sequence::new(0)]);
		assert_eq!(rxw.wait_ncf.len(), 1);
	}

	#[test]
	fn wait_ncf_scan_marks_lost_after_retry_limit() {
		let mut rxw = Rxw::new(16, None);
		let now = Instant::now();
		rxw.update(Sequence::new(1), Sequence::ZERO, now, Duration::from_millis(0));
		rxw.back_off_scan(now, Duration::from_millis(0));

		rxw.wait_ncf_scan(now, 0, Duration::from_millis(10));
		assert!(rxw.take_reset_pending());
	}

	#[test]
	fn bounds_rejects_sequence_outside_capacity() {
		let mut rxw = Rxw::new(4, None);
		let outcome = rxw.add(Sequence::new(100), skb(b"x"), None);
		assert_eq!(outcome, AddOutcome::Bounds);
	}
}
