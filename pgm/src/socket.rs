//! Socket core (spec §4.8): binding, event-loop fds, `recvmsg`/`send`/`close`.
//!
//! Model is the single-threaded cooperative core spec §5 describes: nothing here blocks or
//! spawns a thread. A caller drives the socket by polling `as_raw_fd()` (data arrived),
//! `pending_fd()` (a deliverable APDU or due timer exists) and `repair_fd()` (a queued repair is
//! ready to send), then calling `recvmsg`/`send`/`poll_timers` from its own loop — the "optional
//! async wrapper" spec §9 puts out of scope.
//!
//! Addressing is fundamentally one-to-many (ODATA/SPM to the multicast group, NAK/NCF/RDATA to a
//! specific peer's unicast NLA), which `runtime::Datagram`'s connected-socket model doesn't fit;
//! this talks to the kernel directly through `socket2::Socket::send_to`/`recv_from` instead.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr as StdSocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use proto::codec::options::Opt;
use proto::codec::{self, nla::Nla, Body, Packet};
use proto::{Skb, SocketId};
use runtime::{Notifier, RawFd};
use socket2::{Domain, Protocol, SockAddr, Socket as Socket2, Type};

use crate::error::{Domain as ErrDomain, Error, Kind, Status};
use crate::options::Options;
use crate::peer::Tsi;
use crate::receiver::Receiver;
use crate::source::Source;

/// Process-wide initialization handle (spec §9: "the only process-wide state is the engine
/// ref-count initializer plus clock calibration... encapsulate as an explicit `Engine` handle;
/// `Socket::new` requires a live handle"). `std::time::Instant` needs no calibration step, so the
/// only state left to own is the socket-id allocator shared by every `Socket` the caller binds.
#[derive(Clone)]
pub struct Engine {
	next_socket_id: Arc<AtomicU32>,
}

impl Engine {
	pub fn new() -> Self {
		Self { next_socket_id: Arc::new(AtomicU32::new(1)) }
	}

	fn alloc_socket_id(&self) -> SocketId {
		SocketId(self.next_socket_id.fetch_add(1, Ordering::Relaxed))
	}
}

impl Default for Engine {
	fn default() -> Self {
		Self::new()
	}
}

fn random_gsi() -> [u8; 6] {
	let mut gsi = [0u8; 6];
	rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut gsi);
	gsi
}

fn nla_of(addr: IpAddr) -> Nla {
	match addr {
		IpAddr::V4(a) => Nla::V4(a),
		IpAddr::V6(a) => Nla::V6(a),
	}
}

fn new_socket2(group: &Nla, options: &Options) -> Result<Socket2, Error> {
	let domain = match group {
		Nla::V4(_) => Domain::IPV4,
		Nla::V6(_) => Domain::IPV6,
	};

	let socket = if options.raw_ip {
		Socket2::new(domain, Type::RAW, Some(Protocol::from(113)))
	} else {
		Socket2::new(domain, Type::DGRAM, Some(Protocol::UDP))
	}
	.map_err(|err| Error::new(ErrDomain::Socket, Kind::Fault, format!("socket() failed: {err}")))?;

	socket.set_nonblocking(true).ok();
	socket.set_reuse_address(true).ok();

	if options.raw_ip {
		if let Nla::V4(_) = group {
			socket.set_header_included_v4(true).ok();
		}
	}

	match group {
		Nla::V4(_) => {
			socket.set_multicast_loop_v4(options.multicast_loop).ok();
			socket.set_multicast_ttl_v4(options.hops as u32).ok();
			socket.set_tos(options.tos as u32).ok();
		}
		Nla::V6(_) => {
			socket.set_multicast_loop_v6(options.multicast_loop).ok();
			socket.set_multicast_hops_v6(options.hops as u32).ok();
		}
	}

	if options.ip_router_alert {
		debug!("IP_ROUTER_ALERT has no portable socket2 equivalent; proceeding without it");
	}

	Ok(socket)
}

/// A bound PGM endpoint: a source half, a receiver half, or both.
pub struct Socket {
	id: SocketId,
	engine: Engine,

	gsi: [u8; 6],
	sport: u16,
	dport: u16,
	group_nla: Nla,

	socket: Socket2,
	pending: Notifier,
	repair: Notifier,

	source: Option<Source>,
	receiver: Option<Receiver>,

	options: Options,
	next_nak_scan: Instant,
	next_peer_sweep: Instant,

	is_destroyed: bool,
}

impl Socket {
	/// Bind a socket: resolve the interface/group NLAs, create the raw or UDP socket, join the
	/// multicast group, and construct the source/receiver halves `options.send_only`/`recv_only`
	/// select.
	pub fn bind(engine: &Engine, interface: IpAddr, group: Nla, sport: u16, dport: u16, options: Options, now: Instant) -> Result<Self, Error> {
		options.validate()?;

		let socket = new_socket2(&group, &options)?;

		let bind_addr: StdSocketAddr = StdSocketAddr::new(interface, sport);
		socket.bind(&bind_addr.into()).map_err(|err| Error::new(ErrDomain::Socket, Kind::Fault, format!("bind() failed: {err}")))?;

		match (interface, group) {
			(IpAddr::V4(iface), Nla::V4(grp)) => {
				socket.join_multicast_v4(&grp, &iface).map_err(|err| Error::new(ErrDomain::Interface, Kind::Nonet, format!("join_multicast_v4 failed: {err}")))?;
			}
			(IpAddr::V6(_), Nla::V6(grp)) => {
				socket.join_multicast_v6(&grp, 0).map_err(|err| Error::new(ErrDomain::Interface, Kind::Nonet, format!("join_multicast_v6 failed: {err}")))?;
			}
			_ => return Err(Error::new(ErrDomain::Socket, Kind::AfNoSupport, "interface and group address families differ")),
		}

		let id = engine.alloc_socket_id();
		let gsi = random_gsi();

		let source = (!options.recv_only).then(|| Source::new(id, gsi, sport, dport, group, &options, now));
		let receiver = (!options.send_only).then(|| Receiver::new(&options));

		let pending = Notifier::new().map_err(|_| Error::new(ErrDomain::Socket, Kind::Fault, "failed to create pending notifier"))?;
		let repair = Notifier::new().map_err(|_| Error::new(ErrDomain::Socket, Kind::Fault, "failed to create repair notifier"))?;

		Ok(Self {
			id,
			engine: engine.clone(),
			gsi,
			sport,
			dport,
			group_nla: group,
			socket,
			pending,
			repair,
			source,
			receiver,
			next_nak_scan: now,
			next_peer_sweep: now + options.peer_expiry,
			options,
			is_destroyed: false,
		})
	}

	pub fn id(&self) -> SocketId {
		self.id
	}

	#[cfg(target_family = "unix")]
	pub fn as_raw_fd(&self) -> RawFd {
		use std::os::fd::AsRawFd as _;
		self.socket.as_raw_fd()
	}

	#[cfg(target_family = "unix")]
	pub fn pending_fd(&self) -> RawFd {
		self.pending.as_raw_fd()
	}

	#[cfg(target_family = "unix")]
	pub fn repair_fd(&self) -> RawFd {
		self.repair.as_raw_fd()
	}

	fn check_alive(&self) -> Result<(), Error> {
		if self.is_destroyed {
			return Err(Error::new(ErrDomain::Socket, Kind::Fault, "socket is closed"));
		}
		Ok(())
	}

	/// Submit an APDU for transmission, draining every wire packet `Source::send` produces.
	pub fn send(&mut self, payload: &[u8], now: Instant) -> Result<Status, Error> {
		self.check_alive()?;

		let Some(source) = self.source.as_mut() else {
			return Err(Error::new(ErrDomain::Socket, Kind::Fault, "socket is RECV_ONLY"));
		};

		let packets = source.send(payload, now)?;
		let dest = SockAddr::from(StdSocketAddr::new(self.group_nla_ip(), self.dport));

		for packet in &packets {
			self.transmit(packet, &dest);
		}

		Ok(Status::Normal)
	}

	fn group_nla_ip(&self) -> IpAddr {
		match self.group_nla {
			Nla::V4(a) => IpAddr::V4(a),
			Nla::V6(a) => IpAddr::V6(a),
		}
	}

	fn transmit(&self, packet: &Packet, dest: &SockAddr) {
		let wire = codec::write(packet);
		if let Err(err) = self.socket.send_to(&wire, dest) {
			warn!("Failed to send PGM packet: {err}");
		}
	}

	/// Drain every datagram currently queued on the kernel socket, routing each into the source
	/// (SPMR) or receiver (everything else) half.
	pub fn poll_recv(&mut self, now: Instant) -> Result<(), Error> {
		self.check_alive()?;

		let mtu = self.options.mtu as usize;
		loop {
			let mut buf = vec![MaybeUninit::uninit(); mtu];
			match self.socket.recv_from(&mut buf) {
				Ok((n, from)) => {
					// SAFETY: `recv_from` initialized exactly the first `n` bytes.
					let bytes: Vec<u8> = buf[..n].iter().map(|b| unsafe { b.assume_init() }).collect();
					self.handle_wire(&bytes, from, now);
				}
				Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
				Err(err) => {
					warn!("recv failed: {err}");
					break;
				}
			}
		}

		Ok(())
	}

	fn handle_wire(&mut self, bytes: &[u8], from: SockAddr, now: Instant) {
		let Ok(packet) = codec::parse(bytes) else {
			return;
		};

		let tsi = Tsi::new(packet.gsi, packet.sport);
		let source_nla = from.as_socket().map(|addr| nla_of(addr.ip())).unwrap_or(self.group_nla);

		match packet.body {
			Body::Spm { spm_sqn, spm_trail, spm_lead, nla } => {
				if let Some(receiver) = self.receiver.as_mut() {
					let parity_prm = packet.options.iter().find_map(|opt| match opt {
						Opt::ParityPrm { transmission_group_size } => Some(*transmission_group_size),
						_ => None,
					});
					receiver.on_spm(tsi, source_nla, nla, spm_sqn, spm_trail, spm_lead, parity_prm, now);
					self.pending.set();
				}
			}
			Body::Odata { data_sqn, payload, .. } | Body::Rdata { data_sqn, payload, .. } => {
				let Some(receiver) = self.receiver.as_mut() else { return };

				let tg_start = packet.options.iter().find_map(|opt| match opt {
					Opt::ParityCur { parity_group_sqn } | Opt::ParityGrp { parity_group_sqn } => Some(*parity_group_sqn),
					_ => None,
				});

				if let Some(tg_start) = tg_start {
					receiver.on_parity(tsi, source_nla, self.group_nla, tg_start, payload, now);
					self.pending.set();
					return;
				}

				let frag = packet.options.iter().find_map(|opt| match opt {
					Opt::Fragment { first_sqn, fragment_offset, apdu_length } => {
						let is_last = fragment_offset + payload.len() as u32 >= *apdu_length;
						Some((*first_sqn, is_last))
					}
					_ => None,
				});

				let mut buffer = collections::bytes::Slice::new(payload.len());
				buffer.copy_from_slice(&payload);
				let skb = Skb::new(self.id, tsi.0, proto::Sequence::new(data_sqn), buffer);

				receiver.on_data(tsi, source_nla, self.group_nla, data_sqn, skb, frag, now);
				self.pending.set();
			}
			Body::Spmr => {
				if let Some(source) = self.source.as_mut() {
					let reply = source.handle_spmr(now);
					let dest = SockAddr::from(StdSocketAddr::new(self.group_nla_ip(), self.dport));
					self.transmit(&reply, &dest);
				}
			}
			Body::Nak { nak_sqn, .. } | Body::Nnak { nak_sqn, .. } => {
				let is_parity = packet.options.iter().any(|opt| matches!(opt, Opt::ParityCur { .. } | Opt::ParityGrp { .. }));
				self.handle_nak_list(packet.options, nak_sqn, is_parity);
			}
			Body::Ncf { ncf_sqn, group_nla, .. } => {
				if let Some(receiver) = self.receiver.as_mut() {
					let mut sequences = vec![ncf_sqn];
					for opt in &packet.options {
						if let Opt::NakList { sequences: rest } = opt {
							sequences.extend(rest);
						}
					}
					for sequence in sequences {
						receiver.on_ncf(tsi, source_nla, group_nla, sequence, now);
					}
					self.pending.set();
				}
			}
			Body::Poll { .. } | Body::Polr { .. } | Body::Ack { .. } => {
				debug!("PGM body type not used by this implementation, ignoring");
			}
		}
	}

	fn handle_nak_list(&mut self, options: Vec<Opt>, head_sqn: u32, is_parity: bool) {
		let Some(source) = self.source.as_mut() else { return };

		let mut sequences = vec![head_sqn];
		for opt in options {
			if let Opt::NakList { sequences: rest } = opt {
				sequences.extend(rest);
			}
		}

		source.handle_nak(&sequences, is_parity);
		self.repair.set();
	}

	/// Run the NAK ladder and peer-expiry sweep, returning due repair/NAK work the caller should
	/// transmit. Meant to be called whenever a timer the caller is tracking fires, or periodically
	/// at `nak_bo_ivl` granularity.
	pub fn poll_timers(&mut self, now: Instant) -> Result<Vec<Packet>, Error> {
		self.check_alive()?;

		let mut packets = Vec::new();

		if let Some(source) = self.source.as_mut() {
			if let Some(spm) = source.poll_spm(now) {
				packets.push(spm);
			}

			loop {
				match source.poll_repair(now) {
					Ok(Some(packet)) => packets.push(packet),
					Ok(None) => break,
					Err(_wait) => break,
				}
			}
		}

		if let Some(receiver) = self.receiver.as_mut() {
			if now >= self.next_nak_scan {
				let requests = receiver.nak_ladder(now);
				self.next_nak_scan = now + self.options.nak_bo_ivl;

				for request in requests {
					packets.push(Packet {
						sport: self.sport,
						dport: request.tsi.sport(),
						gsi: self.gsi,
						body: Body::Nak {
							nak_sqn: request.sequences.first().copied().unwrap_or(0),
							source_nla: request.destination,
							group_nla: self.group_nla,
						},
						options: if request.sequences.len() > 1 {
							vec![Opt::NakList { sequences: request.sequences[1..].to_vec() }]
						} else {
							Vec::new()
						},
					});
				}
			}

			if now >= self.next_peer_sweep {
				receiver.expire_peers(now);
				self.next_peer_sweep = now + self.options.peer_expiry;
			}
		}

		if !packets.is_empty() {
			let dest_group = SockAddr::from(StdSocketAddr::new(self.group_nla_ip(), self.dport));
			for packet in &packets {
				self.transmit(packet, &dest_group);
			}
		}

		Ok(packets)
	}

	/// Drain deliverable APDUs. Returns `WOULD_BLOCK` if nothing is ready, `RESET` (with an
	/// `Error`) the first time unrecoverable loss is detected for a peer (spec §8 S5), or `NORMAL`
	/// with the delivered byte buffers.
	pub fn recvmsg(&mut self, now: Instant) -> Result<(Status, Vec<Vec<u8>>), Error> {
		self.check_alive()?;

		self.poll_recv(now)?;
		self.pending.clear();

		let Some(receiver) = self.receiver.as_mut() else {
			return Err(Error::new(ErrDomain::Socket, Kind::Fault, "socket is SEND_ONLY"));
		};

		receiver.recvmsgv(now)
	}

	/// `close(sock, flush)` (spec §5): marks the socket destroyed, optionally drains the transmit
	/// window by continuing to answer NAKs for `linger`, then releases it. Idempotent-close: a
	/// second call returns `ERROR` rather than panicking.
	pub fn close(&mut self, linger: Duration, now: Instant) -> Result<(), Error> {
		if self.is_destroyed {
			return Err(Error::new(ErrDomain::Socket, Kind::Fault, "socket already closed"));
		}

		if linger > Duration::ZERO {
			if let Some(source) = self.source.as_mut() {
				let deadline = now + linger;
				let mut clock = now;
				while clock < deadline && source.poll_repair(clock).map(|p| p.is_some()).unwrap_or(false) {
					clock += Duration::from_millis(1);
				}
			}
		}

		self.is_destroyed = true;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use core::net::Ipv4Addr;
	use std::thread;
	use std::time::Duration;

	use super::*;

	#[test]
	fn engine_allocates_distinct_socket_ids() {
		let engine = Engine::new();
		let a = engine.alloc_socket_id();
		let b = engine.alloc_socket_id();
		assert_ne!(a, b);
	}

	#[test]
	fn random_gsi_is_not_all_zero() {
		// Not a strong guarantee, but catches an accidentally-stubbed RNG.
		assert_ne!(random_gsi(), [0u8; 6]);
	}

	fn bind_pair(options: Options) -> (Socket, Socket) {
		let engine = Engine::new();
		let group = Nla::V4(Ipv4Addr::new(239, 255, 0, 1));
		let now = Instant::now();

		let sender = Socket::bind(&engine, IpAddr::V4(Ipv4Addr::LOCALHOST), group, 0, 7500, Options { send_only: true, multicast_loop: true, ..options.clone() }, now).expect("sender bind");
		let receiver = Socket::bind(&engine, IpAddr::V4(Ipv4Addr::LOCALHOST), group, 7500, 0, Options { recv_only: true, multicast_loop: true, ..options }, now).expect("receiver bind");

		(sender, receiver)
	}

	/// Loopback send-then-receive (spec §8 S1): what a sender transmits, a receiver bound to the
	/// same group and loopback interface eventually delivers unchanged via `recvmsg`.
	#[test]
	#[ignore = "requires a loopback multicast route; exercised manually, not under the default test run"]
	fn send_then_recvmsg_round_trips_payload() {
		let (mut sender, mut receiver) = bind_pair(Options { txw: WindowSizing::Sqns(32), rxw: WindowSizing::Sqns(32), ..Options::default() });

		sender.send(b"hello, group", Instant::now()).expect("send");

		let mut delivered = Vec::new();
		for _ in 0..50 {
			thread::sleep(Duration::from_millis(10));
			let (status, msgs) = receiver.recvmsg(Instant::now()).expect("recvmsg");
			if status == Status::Normal {
				delivered.extend(msgs);
				break;
			}
		}

		assert_eq!(delivered, vec![b"hello, group".to_vec()]);
	}

	#[test]
	fn send_only_socket_rejects_recvmsg() {
		let (_, mut receiver) = bind_pair(Options::default());
		// The receiver half is RECV_ONLY's mirror: a SEND_ONLY bind has no receiver to poll.
		let engine = Engine::new();
		let group = Nla::V4(Ipv4Addr::new(239, 255, 0, 2));
		let mut send_only = Socket::bind(&engine, IpAddr::V4(Ipv4Addr::LOCALHOST), group, 0, 7501, Options { send_only: true, ..Options::default() }, Instant::now()).expect("bind");

		assert!(send_only.recvmsg(Instant::now()).is_err());
		assert!(receiver.send(b"x", Instant::now()).is_err());
	}

	#[test]
	fn close_is_not_idempotent() {
		let engine = Engine::new();
		let group = Nla::V4(Ipv4Addr::new(239, 255, 0, 3));
		let mut socket = Socket::bind(&engine, IpAddr::V4(Ipv4Addr::LOCALHOST), group, 0, 7502, Options::default(), Instant::now()).expect("bind");

		assert!(socket.close(Duration::ZERO, Instant::now()).is_ok());
		assert!(socket.close(Duration::ZERO, Instant::now()).is_err());
	}
}
