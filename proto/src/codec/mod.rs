//! PGM packet parsing and serialization (spec §4.1 / RFC 3208 §8).
//!
//! Supports both raw-IP framing (caller already stripped the IP header) and UDP-encapsulated
//! framing; either way this module only ever sees the PGM common header onward.

pub mod checksum;
pub mod header;
pub mod nla;
pub mod options;

use core::mem::size_of;

use log::warn;
use utils::bytes::{self, Cast};
use utils::error::*;

use self::header::{Header, Type};
use self::nla::Nla;
use self::options::Opt;

#[derive(Clone, Debug)]
pub enum Body {
	Spm { spm_sqn: u32, spm_trail: u32, spm_lead: u32, nla: Nla },
	Poll { poll_sqn: u32, poll_round: u16, path_nla: Nla },
	Polr { polr_sqn: u32, polr_round: u16 },
	Odata { data_sqn: u32, data_trail: u32, payload: Vec<u8> },
	Rdata { data_sqn: u32, data_trail: u32, payload: Vec<u8> },
	Nak { nak_sqn: u32, source_nla: Nla, group_nla: Nla },
	Nnak { nak_sqn: u32, source_nla: Nla, group_nla: Nla },
	Ncf { ncf_sqn: u32, source_nla: Nla, group_nla: Nla },
	Spmr,
	Ack { ack_sqn: u32, ack_bitmap: u32 },
}

impl Body {
	pub fn ty(&self) -> Type {
		match self {
			Body::Spm { .. } => Type::Spm,
			Body::Poll { .. } => Type::Poll,
			Body::Polr { .. } => Type::Polr,
			Body::Odata { .. } => Type::Odata,
			Body::Rdata { .. } => Type::Rdata,
			Body::Nak { .. } => Type::Nak,
			Body::Nnak { .. } => Type::Nnak,
			Body::Ncf { .. } => Type::Ncf,
			Body::Spmr => Type::Spmr,
			Body::Ack { .. } => Type::Ack,
		}
	}
}

#[derive(Clone, Debug)]
pub struct Packet {
	pub sport: u16,
	pub dport: u16,
	pub gsi: [u8; 6],
	pub body: Body,
	pub options: Vec<Opt>,
}

/// Parse a PGM packet. Rejects with `Err(())` (caller increments `PACKETS_DISCARDED` /
/// `CKSUM_ERRORS`) on any malformed or checksum-invalid input; nothing here ever panics on
/// attacker-controlled bytes.
pub fn parse(buf: &[u8]) -> Result<Packet> {
	if buf.len() < size_of::<Header>() {
		warn!("Packet shorter than the PGM common header ({} bytes)", buf.len());
		return Err(());
	}

	if checksum::Checksum::of(buf).end() != 0xffff {
		warn!("PGM checksum mismatch");
		return Err(());
	}

	let header: &Header = bytes::cast(&buf[..size_of::<Header>()]);
	let ty = Type::from_u8(header.ty).ok_or_else(|| warn!("Unknown PGM packet type 0x{:02x}", header.ty))?;

	let mut rest = &buf[size_of::<Header>()..];
	let has_options = header.options & header::opt_flags::PRESENT != 0;

	let (body, body_len) = parse_body(ty, rest)?;
	rest = &rest[body_len..];

	let tsdu = header.tsdu_length.get() as usize;
	let body = match (ty, body) {
		(Type::Odata, Body::Odata { data_sqn, data_trail, .. }) | (Type::Rdata, Body::Odata { data_sqn, data_trail, .. }) => {
			if rest.len() < tsdu {
				warn!("TSDU length {tsdu} exceeds remaining buffer ({})", rest.len());
				return Err(());
			}
			let (payload, remainder) = rest.split_at(tsdu);
			rest = remainder;
			if ty == Type::Odata {
				Body::Odata { data_sqn, data_trail, payload: payload.to_vec() }
			} else {
				Body::Rdata { data_sqn, data_trail, payload: payload.to_vec() }
			}
		}
		(_, body) => body,
	};

	let options = if has_options {
		if rest.is_empty() {
			warn!("OPT_PRESENT set but no option chain follows");
			return Err(());
		}
		options::parse(rest)?
	} else {
		Vec::new()
	};

	Ok(Packet { sport: header.sport.get(), dport: header.dport.get(), gsi: header.gsi, body, options })
}

/// Parse the per-type body following the common header, returning the decoded body (payload
/// unfilled for ODATA/RDATA — the caller slices TSDU bytes using `tsdu_length`) and the number of
/// bytes consumed from `rest`.
fn parse_body(ty: Type, rest: &[u8]) -> Result<(Body, usize)> {
	Ok(match ty {
		Type::Spm => {
			let hdr: &header::Spm = cast_prefix(rest)?;
			let (nla, nla_len) = Nla::parse(&rest[size_of::<header::Spm>()..]).ok_or_else(|| warn!("Malformed SPM NLA"))?;
			(
				Body::Spm { spm_sqn: hdr.spm_sqn.get(), spm_trail: hdr.spm_trail.get(), spm_lead: hdr.spm_lead.get(), nla },
				size_of::<header::Spm>() + nla_len,
			)
		}
		Type::Poll => {
			if rest.len() < 8 {
				warn!("POLL body truncated");
				return Err(());
			}
			let poll_sqn = u32::from_be_bytes(rest[0..4].try_into().unwrap());
			let poll_round = u16::from_be_bytes(rest[4..6].try_into().unwrap());
			let (path_nla, nla_len) = Nla::parse(&rest[8..]).ok_or_else(|| warn!("Malformed POLL NLA"))?;
			// Trailing poll_bo_ivl/rand/matching_bo_ivl (3 x u32) are not yet surfaced.
			(Body::Poll { poll_sqn, poll_round, path_nla }, 8 + nla_len + 12)
		}
		Type::Polr => {
			if rest.len() < 8 {
				warn!("POLR body truncated");
				return Err(());
			}
			let polr_sqn = u32::from_be_bytes(rest[0..4].try_into().unwrap());
			let polr_round = u16::from_be_bytes(rest[4..6].try_into().unwrap());
			(Body::Polr { polr_sqn, polr_round }, 8)
		}
		Type::Odata | Type::Rdata => {
			let hdr: &header::Data = cast_prefix(rest)?;
			(Body::Odata { data_sqn: hdr.data_sqn.get(), data_trail: hdr.data_trail.get(), payload: Vec::new() }, size_of::<header::Data>())
		}
		Type::Nak | Type::Nnak => {
			let hdr: &header::Nak = cast_prefix(rest)?;
			let after_source = &rest[size_of::<header::Nak>()..];
			let (source_nla, s_len) = Nla::parse(after_source).ok_or_else(|| warn!("Malformed NAK source NLA"))?;
			let (group_nla, g_len) = Nla::parse(&after_source[s_len..]).ok_or_else(|| warn!("Malformed NAK group NLA"))?;
			let body = if ty == Type::Nak {
				Body::Nak { nak_sqn: hdr.nak_sqn.get(), source_nla, group_nla }
			} else {
				Body::Nnak { nak_sqn: hdr.nak_sqn.get(), source_nla, group_nla }
			};
			(body, size_of::<header::Nak>() + s_len + g_len)
		}
		Type::Ncf => {
			let hdr: &header::Ncf = cast_prefix(rest)?;
			let after_source = &rest[size_of::<header::Ncf>()..];
			let (source_nla, s_len) = Nla::parse(after_source).ok_or_else(|| warn!("Malformed NCF source NLA"))?;
			let (group_nla, g_len) = Nla::parse(&after_source[s_len..]).ok_or_else(|| warn!("Malformed NCF group NLA"))?;
			(Body::Ncf { ncf_sqn: hdr.ncf_sqn.get(), source_nla, group_nla }, size_of::<header::Ncf>() + s_len + g_len)
		}
		Type::Spmr => (Body::Spmr, 0),
		Type::Ack => {
			let hdr: &header::Ack = cast_prefix(rest)?;
			(Body::Ack { ack_sqn: hdr.ack_sqn.get(), ack_bitmap: hdr.ack_bitmap.get() }, size_of::<header::Ack>())
		}
	})
}

fn cast_prefix<T: Cast>(buf: &[u8]) -> Result<&T> {
	if buf.len() < size_of::<T>() {
		warn!("Packet body truncated");
		return Err(());
	}
	Ok(bytes::cast(&buf[..size_of::<T>()]))
}

/// Serialize a packet, computing and filling in the checksum over the complete wire image.
pub fn write(pkt: &Packet) -> Vec<u8> {
	let mut out = vec![0u8; size_of::<Header>()];

	let mut body_bytes = Vec::new();
	write_body(&pkt.body, &mut body_bytes);

	let payload_len = match &pkt.body {
		Body::Odata { payload, .. } | Body::Rdata { payload, .. } => payload.len(),
		_ => 0,
	};

	out.extend_from_slice(&body_bytes);

	let mut options_bytes = Vec::new();
	if !pkt.options.is_empty() {
		options::write(&pkt.options, &mut options_bytes);
	}
	out.extend_from_slice(&options_bytes);

	let header: &mut Header = bytes::cast_mut(&mut out[..size_of::<Header>()]);
	header.sport = pkt.sport.into();
	header.dport = pkt.dport.into();
	header.ty = pkt.body.ty() as u8;
	header.options = if options_bytes.is_empty() { 0 } else { header::opt_flags::PRESENT };
	header.checksum = 0u16.into();
	header.gsi = pkt.gsi;
	header.tsdu_length = (payload_len as u16).into();

	let csum = checksum::Checksum::of(&out).end();
	let header: &mut Header = bytes::cast_mut(&mut out[..size_of::<Header>()]);
	header.checksum = csum.into();

	out
}

fn write_body(body: &Body, out: &mut Vec<u8>) {
	match body {
		Body::Spm { spm_sqn, spm_trail, spm_lead, nla } => {
			out.extend_from_slice(&spm_sqn.to_be_bytes());
			out.extend_from_slice(&spm_trail.to_be_bytes());
			out.extend_from_slice(&spm_lead.to_be_bytes());
			nla.write(out);
		}
		Body::Poll { poll_sqn, poll_round, path_nla } => {
			out.extend_from_slice(&poll_sqn.to_be_bytes());
			out.extend_from_slice(&poll_round.to_be_bytes());
			out.extend_from_slice(&0u16.to_be_bytes());
			path_nla.write(out);
			out.extend_from_slice(&0u32.to_be_bytes());
			out.extend_from_slice(&0u32.to_be_bytes());
			out.extend_from_slice(&0u32.to_be_bytes());
		}
		Body::Polr { polr_sqn, polr_round } => {
			out.extend_from_slice(&polr_sqn.to_be_bytes());
			out.extend_from_slice(&polr_round.to_be_bytes());
			out.extend_from_slice(&0u16.to_be_bytes());
		}
		Body::Odata { data_sqn, data_trail, payload } | Body::Rdata { data_sqn, data_trail, payload } => {
			out.extend_from_slice(&data_sqn.to_be_bytes());
			out.extend_from_slice(&data_trail.to_be_bytes());
			out.extend_from_slice(payload);
		}
		Body::Nak { nak_sqn, source_nla, group_nla } | Body::Nnak { nak_sqn, source_nla, group_nla } => {
			out.extend_from_slice(&nak_sqn.to_be_bytes());
			source_nla.write(out);
			group_nla.write(out);
		}
		Body::Ncf { ncf_sqn, source_nla, group_nla } => {
			out.extend_from_slice(&ncf_sqn.to_be_bytes());
			source_nla.write(out);
			group_nla.write(out);
		}
		Body::Spmr => {}
		Body::Ack { ack_sqn, ack_bitmap } => {
			out.extend_from_slice(&ack_sqn.to_be_bytes());
			out.extend_from_slice(&ack_bitmap.to_be_bytes());
		}
	}
}

#[cfg(test)]
mod tests {
	use core::net::Ipv4Addr;

	use super::*;

	fn sample_odata() -> Packet {
		Packet {
			sport: 1000,
			dport: 7500,
			gsi: [1, 2, 3, 4, 5, 6],
			body: Body::Odata { data_sqn: 0, data_trail: 0, payload: b"i am not a string".to_vec() },
			options: Vec::new(),
		}
	}

	#[test]
	fn parse_of_write_round_trips() {
		let pkt = sample_odata();
		let wire = write(&pkt);
		let parsed = parse(&wire).unwrap();

		assert_eq!(parsed.sport, pkt.sport);
		assert_eq!(parsed.dport, pkt.dport);
		assert_eq!(parsed.gsi, pkt.gsi);

		match (parsed.body, pkt.body) {
			(Body::Odata { data_sqn: a, payload: pa, .. }, Body::Odata { data_sqn: b, payload: pb, .. }) => {
				assert_eq!(a, b);
				assert_eq!(pa, pb);
			}
			_ => panic!("body type changed across round-trip"),
		}
	}

	#[test]
	fn corrupt_checksum_is_rejected() {
		let mut wire = write(&sample_odata());
		let last = wire.len() - 1;
		wire[last] ^= 0xff;

		assert!(parse(&wire).is_err());
	}

	#[test]
	fn spm_round_trips_with_nla() {
		let pkt = Packet {
			sport: 1000,
			dport: 7500,
			gsi: [1, 2, 3, 4, 5, 6],
			body: Body::Spm { spm_sqn: 42, spm_trail: 0, spm_lead: 10, nla: Nla::V4(Ipv4Addr::new(192, 168, 1, 1)) },
			options: Vec::new(),
		};

		let wire = write(&pkt);
		let parsed = parse(&wire).unwrap();

		match parsed.body {
			Body::Spm { spm_sqn, nla, .. } => {
				assert_eq!(spm_sqn, 42);
				assert_eq!(nla, Nla::V4(Ipv4Addr::new(192, 168, 1, 1)));
			}
			_ => panic!("expected SPM"),
		}
	}
}
