//! Source engine (spec §4.6): sequencing, SPM scheduling, NAK processing, repair emission.

use std::time::{Duration, Instant};

use collections::bytes::Slice;
use log::{debug, warn};
use proto::codec::nla::Nla;
use proto::codec::options::Opt;
use proto::codec::{Body, Packet};
use proto::{Rs, Sequence, Skb, SocketId, Txw};

use crate::error::{Domain, Error, Kind};
use crate::options::Options;
use crate::pacing::Bucket;
use crate::peer::Stats;

pub struct Source {
	socket_id: SocketId,
	gsi: [u8; 6],
	sport: u16,
	dport: u16,
	mtu: u16,
	hops: u8,

	txw: Txw<Skb>,
	rs: Option<Rs>,
	tg_sqn_shift: u32,

	bucket: Bucket,

	spm_sqn: u32,
	group_nla: Nla,

	ambient_spm: Duration,
	heartbeat_spm: Vec<Duration>,
	heartbeat_idx: usize,
	next_spm_expiry: Instant,

	pub stats: Stats,
}

fn tg_shift_for(group_size: Option<u8>) -> u32 {
	match group_size {
		Some(k) if k > 0 => (k as u32).next_power_of_two().trailing_zeros(),
		_ => 0,
	}
}

impl Source {
	pub fn new(socket_id: SocketId, gsi: [u8; 6], sport: u16, dport: u16, group_nla: Nla, options: &Options, now: Instant) -> Self {
		let rs = options.fec.as_ref().map(|fec| Rs::new(fec.block_size, fec.group_size));
		let tg_sqn_shift = tg_shift_for(options.fec.as_ref().map(|fec| fec.group_size));

		let rate = match options.txw {
			crate::options::WindowSizing::Rate { max_rte, .. } => max_rte,
			crate::options::WindowSizing::Sqns(_) => u32::MAX,
		};

		Self {
			socket_id,
			gsi,
			sport,
			dport,
			mtu: options.mtu,
			hops: options.hops,
			txw: Txw::new(options.txw_sqns() as usize),
			rs,
			tg_sqn_shift,
			bucket: Bucket::new(rate, options.mtu as u32, now),
			spm_sqn: 0,
			group_nla,
			ambient_spm: options.ambient_spm,
			heartbeat_spm: options.heartbeat_spm.clone(),
			heartbeat_idx: 0,
			next_spm_expiry: now + options.heartbeat_spm.first().copied().unwrap_or(options.ambient_spm),
			stats: Stats::default(),
		}
	}

	fn max_tsdu_fragment(&self) -> usize {
		// Header (16) + worst-case option overhead is left to the caller-provided MTU budget;
		// this is the conservative per-packet payload ceiling used for APDU fragmentation.
		self.mtu as usize - 16
	}

	/// Fragment `payload` into ODATA TSDUs and append each to the transmit window. Returns the
	/// wire packets to send, in order. Pre-condition: APDU length <= `txw_capacity *
	/// max_tsdu_fragment` (spec §4.6).
	pub fn send(&mut self, payload: &[u8], now: Instant) -> Result<Vec<Packet>, Error> {
		let fragment_len = self.max_tsdu_fragment();
		let max_apdu = self.txw.capacity() * fragment_len;

		if payload.len() > max_apdu {
			return Err(Error::new(Domain::Socket, Kind::Fault, "APDU exceeds transmit window capacity"));
		}

		let chunks: Vec<&[u8]> = if payload.is_empty() { vec![&[][..]] } else { payload.chunks(fragment_len).collect() };
		let fragmented = chunks.len() > 1;

		let mut packets = Vec::with_capacity(chunks.len());
		let mut first_sqn = None;
		let mut fragment_offset = 0u32;

		for chunk in &chunks {
			let mut buffer = Slice::new(chunk.len());
			buffer.copy_from_slice(chunk);

			let seq_before = self.txw.lead();
			let first_sqn = *first_sqn.get_or_insert(seq_before.get());
			let frag = fragmented.then_some((first_sqn, payload.len() as u32));

			let options = if fragmented {
				vec![Opt::Fragment { first_sqn, fragment_offset, apdu_length: payload.len() as u32 }]
			} else {
				Vec::new()
			};
			fragment_offset += chunk.len() as u32;

			let skb = Skb::new(self.socket_id, self.tsi_bytes(), seq_before, buffer).with_frag(frag);
			let sequence = self.txw.add(skb);
			let trail = self.txw.trail().get();

			packets.push(Packet {
				sport: self.sport,
				dport: self.dport,
				gsi: self.gsi,
				body: Body::Odata { data_sqn: sequence.get(), data_trail: trail, payload: chunk.to_vec() },
				options,
			});

			if let Some(parity) = self.maybe_parity(sequence) {
				packets.push(parity);
			}
		}

		self.heartbeat_idx = 0;
		self.reschedule_spm(now);

		Ok(packets)
	}

	fn tsi_bytes(&self) -> [u8; 8] {
		let mut bytes = [0u8; 8];
		bytes[..6].copy_from_slice(&self.gsi);
		bytes[6..].copy_from_slice(&self.sport.to_be_bytes());
		bytes
	}

	/// Emit the configured proactive parity packet once a full transmission group has been sent
	/// (spec §6 `USE_FEC.proactive_packets`).
	fn maybe_parity(&mut self, sequence: Sequence) -> Option<Packet> {
		let rs = self.rs.as_ref()?;
		let k = rs.k() as u32;

		if (sequence.get() + 1) % k != 0 {
			return None;
		}

		let tg_start = sequence - (k - 1);
		let parity_offset = rs.k();
		let payload = self.encode_parity(tg_start, parity_offset)?;

		Some(Packet {
			sport: self.sport,
			dport: self.dport,
			gsi: self.gsi,
			// `data_sqn` here is informational only; the receiver routes parity by
			// `parity_group_sqn`, never by this field, so it can't collide with a future data
			// packet's sequence in the same window.
			body: Body::Rdata { data_sqn: tg_start.get() + k, data_trail: self.txw.trail().get(), payload },
			options: vec![Opt::ParityCur { parity_group_sqn: tg_start.get() }],
		})
	}

	pub fn encode_parity(&self, tg_start: Sequence, parity_offset: u8) -> Option<Vec<u8>> {
		let rs = self.rs.as_ref()?;
		let k = rs.k() as usize;

		let mut owned = Vec::with_capacity(k);
		for i in 0..k {
			let skb = self.txw.peek(tg_start + i as u32)?;
			owned.push(skb.buffer.to_vec());
		}

		let refs: Vec<&[u8]> = owned.iter().map(Vec::as_slice).collect();
		let len = refs.iter().map(|b| b.len()).max().unwrap_or(0);
		let mut dst = vec![0u8; len];
		rs.encode(&refs, parity_offset, &mut dst);
		Some(dst)
	}

	/// Next SPM to emit, if its expiry has elapsed. Ambient and heartbeat schedules race; the
	/// earlier one fires, and a NAK resets the heartbeat index to 0 (spec §4.6).
	pub fn poll_spm(&mut self, now: Instant) -> Option<Packet> {
		if now < self.next_spm_expiry {
			return None;
		}

		self.spm_sqn += 1;
		self.reschedule_spm(now);

		Some(Packet {
			sport: self.sport,
			dport: self.dport,
			gsi: self.gsi,
			body: Body::Spm { spm_sqn: self.spm_sqn, spm_trail: self.txw.trail().get(), spm_lead: self.txw.lead().get(), nla: self.group_nla },
			options: Vec::new(),
		})
	}

	fn reschedule_spm(&mut self, now: Instant) {
		let heartbeat = self.heartbeat_spm.get(self.heartbeat_idx).copied().unwrap_or(self.ambient_spm);
		let interval = heartbeat.min(self.ambient_spm);
		self.next_spm_expiry = now + interval;

		if self.heartbeat_idx + 1 < self.heartbeat_spm.len() {
			self.heartbeat_idx += 1;
		}
	}

	/// Answer an SPMR immediately.
	pub fn handle_spmr(&mut self, now: Instant) -> Packet {
		self.spm_sqn += 1;
		self.reschedule_spm(now);

		Packet {
			sport: self.sport,
			dport: self.dport,
			gsi: self.gsi,
			body: Body::Spm { spm_sqn: self.spm_sqn, spm_trail: self.txw.trail().get(), spm_lead: self.txw.lead().get(), nla: self.group_nla },
			options: Vec::new(),
		}
	}

	/// Process an inbound NAK list, pushing each requested sequence (or transmission group, for
	/// parity requests) onto the retransmit queue.
	pub fn handle_nak(&mut self, sequences: &[u32], is_parity: bool) {
		self.heartbeat_idx = 0;

		for &seq in sequences {
			let seq = Sequence::new(seq);
			if !seq.in_window(self.txw.trail(), self.txw.lead()) {
				debug!("NAK for {seq:?} outside transmit window");
				self.stats.naks_ignored += 1;
				continue;
			}

			self.txw.retransmit_push(seq, is_parity, self.tg_sqn_shift);
		}
	}

	/// Drain one outstanding repair request, respecting the token bucket. Returns `None` if
	/// nothing is queued, or `Err` with the wait duration if rate-limited.
	pub fn poll_repair(&mut self, now: Instant) -> Result<Option<Packet>, Duration> {
		let Some((key, is_parity)) = self.txw.retransmit_try_peek() else {
			return Ok(None);
		};

		if !self.bucket.try_spend(self.mtu as u32, now) {
			return Err(self.bucket.wait_for(self.mtu as u32, now));
		}

		self.txw.retransmit_remove_head();

		if is_parity {
			let tg_start = Sequence::new(key << self.tg_sqn_shift);
			let k = self.rs.as_ref().map(|rs| rs.k() as u32).unwrap_or(0);
			let payload = self.encode_parity(tg_start, k as u8).unwrap_or_default();

			Ok(Some(Packet {
				sport: self.sport,
				dport: self.dport,
				gsi: self.gsi,
				body: Body::Rdata { data_sqn: tg_start.get() + k, data_trail: self.txw.trail().get(), payload },
				options: vec![Opt::ParityGrp { parity_group_sqn: tg_start.get() }],
			}))
		} else {
			let sequence = Sequence::new(key);
			let Some(skb) = self.txw.peek(sequence) else {
				warn!("Retransmit request for {sequence:?} no longer in window");
				return Ok(None);
			};

			let options = match skb.frag {
				Some((first_sqn, apdu_length)) => {
					let fragment_offset = sequence.distance(Sequence::new(first_sqn)) as u32 * self.max_tsdu_fragment() as u32;
					vec![Opt::Fragment { first_sqn, fragment_offset, apdu_length }]
				}
				None => Vec::new(),
			};

			Ok(Some(Packet {
				sport: self.sport,
				dport: self.dport,
				gsi: self.gsi,
				body: Body::Rdata { data_sqn: sequence.get(), data_trail: self.txw.trail().get(), payload: skb.buffer.to_vec() },
				options,
			}))
		}
	}
}

#[cfg(test)]
mod tests {
	use core::net::Ipv4Addr;

	use super::*;

	fn source() -> Source {
		let options = Options { txw: crate::options::WindowSizing::Sqns(32), ..Options::default() };
		Source::new(SocketId(0), [1, 2, 3, 4, 5, 6], 1000, 7500, Nla::V4(Ipv4Addr::new(239, 0, 0, 1)), &options, Instant::now())
	}

	#[test]
	fn send_assigns_sequential_sequences() {
		let mut src = source();
		let packets = src.send(b"i am not a string", Instant::now()).unwrap();

		assert_eq!(packets.len(), 1);
		match &packets[0].body {
			Body::Odata { data_sqn, payload, .. } => {
				assert_eq!(*data_sqn, 0);
				assert_eq!(payload, b"i am not a string");
			}
			_ => panic!("expected ODATA"),
		}
	}

	#[test]
	fn nak_for_sent_sequence_is_queued_for_repair() {
		let mut src = source();
		src.send(b"hello", Instant::now()).unwrap();

		src.handle_nak(&[0], false);
		let repaired = src.poll_repair(Instant::now()).unwrap();

		assert!(matches!(repaired, Some(Packet { body: Body::Rdata { .. }, .. })));
	}

	#[test]
	fn nak_outside_window_is_ignored() {
		let mut src = source();
		src.handle_nak(&[999], false);

		assert_eq!(src.stats.naks_ignored, 1);
	}

	#[test]
	fn proactive_parity_carries_group_sqn_option_and_distinct_data_sqn() {
		let fec = crate::options::Fec { block_size: 255, group_size: 2, proactive_packets: 1, ondemand_parity_enabled: false, var_pktlen_enabled: true };
		let options = Options { txw: crate::options::WindowSizing::Sqns(32), fec: Some(fec), ..Options::default() };
		let mut src = Source::new(SocketId(0), [1, 2, 3, 4, 5, 6], 1000, 7500, Nla::V4(Ipv4Addr::new(239, 0, 0, 1)), &options, Instant::now());

		src.send(b"aa", Instant::now()).unwrap();
		let packets = src.send(b"bb", Instant::now()).unwrap();

		assert_eq!(packets.len(), 2);
		match &packets[1].body {
			Body::Rdata { data_sqn, .. } => assert_eq!(*data_sqn, 2),
			_ => panic!("expected RDATA parity packet"),
		}
		assert!(matches!(packets[1].options.as_slice(), [Opt::ParityCur { parity_group_sqn: 0 }]));
	}

	#[test]
	fn on_demand_parity_repair_carries_group_sqn_option() {
		let fec = crate::options::Fec { block_size: 255, group_size: 2, proactive_packets: 0, ondemand_parity_enabled: true, var_pktlen_enabled: true };
		let options = Options { txw: crate::options::WindowSizing::Sqns(32), fec: Some(fec), ..Options::default() };
		let mut src = Source::new(SocketId(0), [1, 2, 3, 4, 5, 6], 1000, 7500, Nla::V4(Ipv4Addr::new(239, 0, 0, 1)), &options, Instant::now());

		src.send(b"aa", Instant::now()).unwrap();
		src.send(b"bb", Instant::now()).unwrap();

		src.handle_nak(&[0], true);
		let repaired = src.poll_repair(Instant::now()).unwrap().unwrap();

		match &repaired.body {
			Body::Rdata { data_sqn, .. } => assert_eq!(*data_sqn, 2),
			_ => panic!("expected RDATA parity packet"),
		}
		assert!(matches!(repaired.options.as_slice(), [Opt::ParityGrp { parity_group_sqn: 0 }]));
	}
}
