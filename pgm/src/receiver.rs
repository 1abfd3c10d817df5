//! Receiver engine (spec §4.7): glue between the parser and per-peer RXWs, plus the NAK ladder.

use std::time::Instant;

use collections::map::{Map, Key as _};
use log::debug;
use proto::codec::nla::Nla;
use proto::{AddOutcome, Rs, Rxw, Sequence, Skb};

use crate::error::{Domain, Error, Kind, Status};
use crate::options::Options;
use crate::peer::{Peer, Tsi};

/// Fixed peer-table capacity. PGM does not bound the number of concurrent sources at the wire
/// level, but every real deployment runs within an administratively-scoped multicast group, so
/// a generous fixed table (the same `collections::map::Map` the teacher uses for its port and
/// session tables) is the idiomatic fit rather than a reallocating hash map.
pub const MAX_PEERS: usize = 256;

pub struct NakRequest {
	pub tsi: Tsi,
	pub destination: Nla,
	pub sequences: Vec<u32>,
	pub is_parity: bool,
}

pub struct Receiver {
	peers: Map<Peer, MAX_PEERS>,
	options: Options,
	rs_template: Option<(u8, u8)>,
}

impl Receiver {
	pub fn new(options: &Options) -> Self {
		let rs_template = options.fec.as_ref().map(|fec| (fec.block_size, fec.group_size));

		Self { peers: Map::default(), options: options.clone(), rs_template }
	}

	fn rxw_capacity(&self) -> usize {
		self.options.rxw_sqns() as usize
	}

	fn rs(&self) -> Option<Rs> {
		self.rs_template.map(|(n, k)| Rs::new(n, k))
	}

	fn peer_mut(&mut self, tsi: Tsi, source_nla: Nla, group_nla: Nla, now: Instant) -> &mut Peer {
		use collections::map::Entry;

		match self.peers.find_entry(&tsi) {
			Entry::Filled(f) => f.into_ref(),
			Entry::Empty(e) => {
				let rxw = Rxw::new(self.rxw_capacity(), self.rs());
				e.insert(Peer::new(tsi, source_nla, group_nla, rxw, now)).into_ref()
			}
		}
	}

	/// ODATA/RDATA arrival.
	pub fn on_data(&mut self, tsi: Tsi, source_nla: Nla, group_nla: Nla, sequence: u32, skb: Skb, frag: Option<(u32, bool)>, now: Instant) {
		let peer = self.peer_mut(tsi, source_nla, group_nla, now);
		peer.last_activity = now;

		let frag = frag.map(|(first, last)| (Sequence::new(first), last));
		let outcome = peer.rxw.add(Sequence::new(sequence), skb, frag);

		match outcome {
			AddOutcome::Appended | AddOutcome::Inserted => peer.has_pending = true,
			AddOutcome::Duplicate => debug!("Duplicate data sequence {sequence} from {tsi}"),
			AddOutcome::Malformed | AddOutcome::Bounds => peer.stats.packets_discarded += 1,
		}
	}

	/// SPM arrival: verify TSI match is the caller's job (it owns the parsed packet); this records
	/// the advertised window extents and duplicate-SPM bookkeeping. `parity_prm` carries the
	/// OPT_PARITY_PRM transmission-group size when the source advertises or changes FEC parameters;
	/// a changed group size rebuilds this peer's decoder, discarding any cached parity.
	pub fn on_spm(&mut self, tsi: Tsi, source_nla: Nla, group_nla: Nla, spm_sqn: u32, spm_trail: u32, spm_lead: u32, parity_prm: Option<u32>, now: Instant) {
		let rs_template = self.rs_template;
		let peer = self.peer_mut(tsi, source_nla, group_nla, now);

		if peer.observe_spm(spm_sqn, now) {
			return;
		}

		if let Some(k) = parity_prm {
			let rs = rs_template.map(|(n, _)| Rs::new(n, k as u8));
			peer.rxw.update_fec(rs);
		}

		let rxw_advanced_before = peer.rxw.rxw_advanced;
		peer.rxw.update(Sequence::new(spm_lead), Sequence::new(spm_trail), now, self.options.nak_bo_ivl);
		peer.stats.rxw_advanced += peer.rxw.rxw_advanced - rxw_advanced_before;
	}

	/// Parity packet arrival (OPT_PARITY_CUR/OPT_PARITY_GRP), routed by the group's data sequence
	/// rather than the packet's own wire sequence (spec §4.2, §4.5).
	pub fn on_parity(&mut self, tsi: Tsi, source_nla: Nla, group_nla: Nla, tg_start: u32, payload: Vec<u8>, now: Instant) {
		let peer = self.peer_mut(tsi, source_nla, group_nla, now);
		peer.last_activity = now;
		peer.rxw.add_parity(Sequence::new(tg_start), payload);
		peer.has_pending = true;
	}

	/// NCF arrival: confirms a NAK reached the source, advancing WAIT_NCF/BACK_OFF to WAIT_DATA.
	pub fn on_ncf(&mut self, tsi: Tsi, source_nla: Nla, group_nla: Nla, ncf_sqn: u32, now: Instant) {
		let peer = self.peer_mut(tsi, source_nla, group_nla, now);
		peer.last_activity = now;
		peer.rxw.confirm(Sequence::new(ncf_sqn), now, self.options.nak_rdata_ivl);
	}

	/// Run one NAK-ladder scan across every peer: back-off -> wait-ncf -> wait-data.
	pub fn nak_ladder(&mut self, now: Instant) -> Vec<NakRequest> {
		let mut requests = Vec::new();

		for peer in self.peers.iter_mut() {
			let due = peer.rxw.back_off_scan(now, self.options.nak_rpt_ivl);
			if !due.is_empty() {
				requests.push(NakRequest {
					tsi: peer.tsi,
					destination: peer.source_nla,
					sequences: due.into_iter().map(Sequence::get).collect(),
					is_parity: false,
				});
			}

			let ncf_due = peer.rxw.wait_ncf_scan(now, self.options.nak_ncf_retries, self.options.nak_rpt_ivl);
			if !ncf_due.is_empty() {
				requests.push(NakRequest {
					tsi: peer.tsi,
					destination: peer.source_nla,
					sequences: ncf_due.into_iter().map(Sequence::get).collect(),
					is_parity: false,
				});
			}

			let data_due = peer.rxw.wait_data_scan(now, self.options.nak_data_retries, self.options.nak_rdata_ivl);
			if !data_due.is_empty() {
				requests.push(NakRequest {
					tsi: peer.tsi,
					destination: peer.source_nla,
					sequences: data_due.into_iter().map(Sequence::get).collect(),
					is_parity: false,
				});
			}
		}

		requests
	}

	/// Drop peers that have been silent for longer than `peer_expiry`.
	pub fn expire_peers(&mut self, now: Instant) {
		let expired: Vec<Tsi> = self
			.peers
			.iter()
			.filter(|p| p.is_expired(now, self.options.peer_expiry))
			.map(|p| *p.key())
			.collect();

		for tsi in expired {
			self.peers.find_entry(&tsi).remove();
		}
	}

	/// Walk peers marked pending, draining deliverable APDUs. Returns `Status::Normal` with the
	/// bytes read if at least one message was delivered.
	pub fn recvmsgv(&mut self, now: Instant) -> Result<(Status, Vec<Vec<u8>>), Error> {
		let mut out = Vec::new();

		for peer in self.peers.iter_mut() {
			if !peer.has_pending {
				continue;
			}

			if peer.rxw.take_reset_pending() {
				return Err(Error::new(Domain::Recv, Kind::ConnReset, format!("peer {} lost a sequence", peer.tsi)));
			}

			let msgs = peer.rxw.readv();
			peer.rxw.remove_commit();

			if msgs.is_empty() {
				peer.has_pending = false;
			} else {
				out.extend(msgs);
			}
		}

		let _ = now;

		if out.is_empty() {
			Ok((Status::WouldBlock, out))
		} else {
			Ok((Status::Normal, out))
		}
	}
}

#[cfg(test)]
mod tests {
	use core::net::Ipv4Addr;

	use proto::SocketId;

	use super::*;

	fn group() -> Nla {
		Nla::V4(Ipv4Addr::new(239, 0, 0, 1))
	}

	fn make_skb(sequence: u32, payload: &[u8]) -> Skb {
		let mut buffer = collections::bytes::Slice::new(payload.len());
		buffer.copy_from_slice(payload);
		Skb::new(SocketId(0), Tsi::new([1, 2, 3, 4, 5, 6], 1000).0, Sequence::new(sequence), buffer)
	}

	#[test]
	fn data_then_spm_then_recvmsgv_delivers_in_order() {
		let options = Options { rxw: crate::options::WindowSizing::Sqns(32), ..Options::default() };
		let mut recv = Receiver::new(&options);
		let tsi = Tsi::new([1, 2, 3, 4, 5, 6], 1000);

		recv.on_spm(tsi, group(), group(), 1, 0, 10, None, Instant::now());
		recv.on_data(tsi, group(), group(), 0, make_skb(0, b"hello"), None, Instant::now());

		let (status, msgs) = recv.recvmsgv(Instant::now()).unwrap();
		assert_eq!(status, Status::Normal);
		assert_eq!(msgs, vec![b"hello".to_vec()]);
	}

	#[test]
	fn duplicate_spm_sequence_is_counted_but_harmless() {
		let options = Options::default();
		let mut recv = Receiver::new(&options);
		let tsi = Tsi::new([1, 2, 3, 4, 5, 6], 1000);

		recv.on_spm(tsi, group(), group(), 5, 0, 10, None, Instant::now());
		recv.on_spm(tsi, group(), group(), 5, 0, 10, None, Instant::now());

		let peer = recv.peers.find(&tsi).unwrap();
		assert_eq!(peer.stats.dup_spms, 1);
	}

	#[test]
	fn expire_peers_drops_silent_sources() {
		let options = Options { peer_expiry: std::time::Duration::from_secs(1), ..Options::default() };
		let mut recv = Receiver::new(&options);
		let tsi = Tsi::new([1, 2, 3, 4, 5, 6], 1000);
		let t0 = Instant::now();

		recv.on_spm(tsi, group(), group(), 1, 0, 10, None, t0);
		assert!(recv.peers.find(&tsi).is_some());

		recv.expire_peers(t0 + std::time::Duration::from_secs(2));
		assert!(recv.peers.find(&tsi).is_none());
	}

	#[test]
	fn nak_ladder_requests_missing_sequence_after_back_off() {
		let options = Options { rxw: crate::options::WindowSizing::Sqns(32), nak_bo_ivl: std::time::Duration::from_millis(10), ..Options::default() };
		let mut recv = Receiver::new(&options);
		let tsi = Tsi::new([1, 2, 3, 4, 5, 6], 1000);
		let t0 = Instant::now();

		// Advertise a window lead of 2 with nothing received: sequence 0 and 1 become pending.
		recv.on_spm(tsi, group(), group(), 1, 0, 2, None, t0);

		let requests = recv.nak_ladder(t0 + std::time::Duration::from_millis(50));
		assert!(!requests.is_empty());
		assert_eq!(requests[0].tsi, tsi);
	}

	#[test]
	fn on_parity_recovers_missing_data_packet() {
		let fec = crate::options::Fec { block_size: 255, group_size: 2, proactive_packets: 0, ondemand_parity_enabled: true, var_pktlen_enabled: true };
		let options = Options { rxw: crate::options::WindowSizing::Sqns(32), fec: Some(fec), ..Options::default() };
		let mut recv = Receiver::new(&options);
		let tsi = Tsi::new([1, 2, 3, 4, 5, 6], 1000);
		let t0 = Instant::now();

		recv.on_spm(tsi, group(), group(), 1, 0, 2, None, t0);
		recv.on_data(tsi, group(), group(), 0, make_skb(0, b"aa"), None, t0);

		let rs = Rs::new(255, 2);
		let mut parity = vec![0u8; 2];
		rs.encode(&[b"aa".as_slice(), b"bb".as_slice()], 2, &mut parity);

		recv.on_parity(tsi, group(), group(), 0, parity, t0);

		let (status, msgs) = recv.recvmsgv(t0).unwrap();
		assert_eq!(status, Status::Normal);
		assert_eq!(msgs, vec![b"aa".to_vec(), b"bb".to_vec()]);
	}

	#[test]
	fn on_ncf_confirms_wait_ncf_slot() {
		let options = Options { rxw: crate::options::WindowSizing::Sqns(32), nak_bo_ivl: std::time::Duration::from_millis(0), ..Options::default() };
		let mut recv = Receiver::new(&options);
		let tsi = Tsi::new([1, 2, 3, 4, 5, 6], 1000);
		let t0 = Instant::now();

		recv.on_spm(tsi, group(), group(), 1, 0, 1, None, t0);
		recv.nak_ladder(t0);

		recv.on_ncf(tsi, group(), group(), 0, t0);

		let peer = recv.peers.find(&tsi).unwrap();
		assert_eq!(peer.rxw.wait_data_len(), 1);
	}

	#[test]
	fn spm_parity_prm_change_rebuilds_peer_decoder() {
		let fec = crate::options::Fec { block_size: 255, group_size: 2, proactive_packets: 0, ondemand_parity_enabled: true, var_pktlen_enabled: true };
		let options = Options { rxw: crate::options::WindowSizing::Sqns(32), fec: Some(fec), ..Options::default() };
		let mut recv = Receiver::new(&options);
		let tsi = Tsi::new([1, 2, 3, 4, 5, 6], 1000);
		let t0 = Instant::now();

		recv.on_spm(tsi, group(), group(), 1, 0, 4, None, t0);
		recv.on_spm(tsi, group(), group(), 2, 0, 4, Some(4), t0);

		// Parity cached under the old group size of 2 must be gone after the rebuild.
		let peer = recv.peers.find(&tsi).unwrap();
		assert!(peer.rxw.parity_cache_is_empty());
	}
}
