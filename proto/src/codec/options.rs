//! PGM option TLV chain (RFC 3208 §9). The first option is always OPT_LENGTH, giving the total
//! byte length of the chain; each subsequent option carries a 1-byte type (E/network-significant
//! bits in the top two bits) and a 1-byte length.

use log::warn;
use utils::error::*;

use super::nla::Nla;

pub mod flags {
	/// Last option in the chain.
	pub const END: u8 = 0b1000_0000;
	/// Unknown options carrying this bit must cause `MALFORMED` rather than being skipped.
	pub const NETWORK_SIGNIFICANT: u8 = 0b0100_0000;
	pub const TYPE_MASK: u8 = 0b0011_1111;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum OptionType {
	Length = 0x00,
	Fragment = 0x01,
	NakList = 0x02,
	Join = 0x03,
	Redirect = 0x04,
	ParityPrm = 0x05,
	ParityCur = 0x06,
	ParityGrp = 0x07,
	Rst = 0x08,
	Syn = 0x09,
	Fin = 0x0a,
	Cr = 0x0b,
}

impl OptionType {
	fn from_u8(v: u8) -> Option<Self> {
		Some(match v {
			0x00 => Self::Length,
			0x01 => Self::Fragment,
			0x02 => Self::NakList,
			0x03 => Self::Join,
			0x04 => Self::Redirect,
			0x05 => Self::ParityPrm,
			0x06 => Self::ParityCur,
			0x07 => Self::ParityGrp,
			0x08 => Self::Rst,
			0x09 => Self::Syn,
			0x0a => Self::Fin,
			0x0b => Self::Cr,
			_ => return None,
		})
	}
}

pub const MAX_NAK_LIST: usize = 62;

#[derive(Clone, Debug, PartialEq)]
pub enum Opt {
	Fragment { first_sqn: u32, fragment_offset: u32, apdu_length: u32 },
	/// Additional NAK sequences beyond the one carried in the packet's own header field.
	NakList { sequences: Vec<u32> },
	Join { min_join_sqn: u32 },
	Redirect { nla: Nla },
	ParityPrm { transmission_group_size: u32 },
	ParityCur { parity_group_sqn: u32 },
	ParityGrp { parity_group_sqn: u32 },
	Rst,
	Syn,
	Fin,
	Cr,
}

fn decode_one(ty: OptionType, body: &[u8]) -> Option<Opt> {
	Some(match ty {
		OptionType::Length => return None,
		OptionType::Fragment => {
			if body.len() < 12 {
				return None;
			}
			Opt::Fragment {
				first_sqn: u32::from_be_bytes(body[0..4].try_into().unwrap()),
				fragment_offset: u32::from_be_bytes(body[4..8].try_into().unwrap()),
				apdu_length: u32::from_be_bytes(body[8..12].try_into().unwrap()),
			}
		}
		OptionType::NakList => {
			if body.len() % 4 != 0 {
				return None;
			}
			let sequences = body.chunks_exact(4).map(|c| u32::from_be_bytes(c.try_into().unwrap())).collect::<Vec<_>>();
			if sequences.len() > MAX_NAK_LIST {
				return None;
			}
			Opt::NakList { sequences }
		}
		OptionType::Join => {
			if body.len() < 4 {
				return None;
			}
			Opt::Join { min_join_sqn: u32::from_be_bytes(body[0..4].try_into().unwrap()) }
		}
		OptionType::Redirect => {
			let (nla, _) = Nla::parse(body)?;
			Opt::Redirect { nla }
		}
		OptionType::ParityPrm => {
			if body.len() < 4 {
				return None;
			}
			Opt::ParityPrm { transmission_group_size: u32::from_be_bytes(body[0..4].try_into().unwrap()) }
		}
		OptionType::ParityCur => {
			if body.len() < 4 {
				return None;
			}
			Opt::ParityCur { parity_group_sqn: u32::from_be_bytes(body[0..4].try_into().unwrap()) }
		}
		OptionType::ParityGrp => {
			if body.len() < 4 {
				return None;
			}
			Opt::ParityGrp { parity_group_sqn: u32::from_be_bytes(body[0..4].try_into().unwrap()) }
		}
		OptionType::Rst => Opt::Rst,
		OptionType::Syn => Opt::Syn,
		OptionType::Fin => Opt::Fin,
		OptionType::Cr => Opt::Cr,
	})
}

/// Parse the option chain following a packet's per-type body. `buf` starts at OPT_LENGTH.
pub fn parse(buf: &[u8]) -> Result<Vec<Opt>> {
	if buf.len() < 4 {
		warn!("Option chain shorter than OPT_LENGTH header");
		return Err(());
	}

	let head_ty = buf[0] & flags::TYPE_MASK;
	let head_len = buf[1];

	if OptionType::from_u8(head_ty) != Some(OptionType::Length) || head_len != 4 {
		warn!("Option chain does not begin with OPT_LENGTH");
		return Err(());
	}

	let total_length = u16::from_be_bytes([buf[2], buf[3]]) as usize;

	if total_length > buf.len() || total_length < 4 {
		warn!("OPT_LENGTH total ({total_length}) inconsistent with buffer ({})", buf.len());
		return Err(());
	}

	let mut rest = &buf[4..total_length];
	let mut opts = Vec::new();
	let mut seen_end = false;

	while !rest.is_empty() {
		if seen_end {
			warn!("Option found after end-of-chain marker");
			return Err(());
		}

		if rest.len() < 2 {
			warn!("Truncated option header");
			return Err(());
		}

		let type_byte = rest[0];
		let opt_len = rest[1] as usize;

		if opt_len < 2 || opt_len > rest.len() {
			warn!("Option length {opt_len} out of range");
			return Err(());
		}

		seen_end = type_byte & flags::END != 0;
		let body = &rest[2..opt_len];
		let ty = OptionType::from_u8(type_byte & flags::TYPE_MASK);

		match ty.map(|ty| decode_one(ty, body)) {
			Some(Some(opt)) => opts.push(opt),
			// Recognized type, but a body the type's own decoder rejected: always malformed.
			Some(None) => {
				warn!("Malformed body for option type 0x{:02x}", type_byte & flags::TYPE_MASK);
				return Err(());
			}
			None if type_byte & flags::NETWORK_SIGNIFICANT != 0 => {
				warn!("Unrecognized network-significant option 0x{:02x}", type_byte & flags::TYPE_MASK);
				return Err(());
			}
			None => {}
		}

		rest = &rest[opt_len..];
	}

	Ok(opts)
}

/// Serialize an option chain, prefixing OPT_LENGTH and setting the end bit on the last entry.
pub fn write(opts: &[Opt], out: &mut Vec<u8>) {
	if opts.is_empty() {
		return;
	}

	let length_pos = out.len();
	out.extend_from_slice(&[OptionType::Length as u8, 4, 0, 0]);

	for (i, opt) in opts.iter().enumerate() {
		let is_last = i + 1 == opts.len();
		write_one(opt, is_last, out);
	}

	let total = (out.len() - length_pos) as u16;
	out[length_pos + 2..length_pos + 4].copy_from_slice(&total.to_be_bytes());
}

fn write_one(opt: &Opt, is_last: bool, out: &mut Vec<u8>) {
	let (ty, mut body) = match opt {
		Opt::Fragment { first_sqn, fragment_offset, apdu_length } => {
			let mut body = Vec::with_capacity(12);
			body.extend_from_slice(&first_sqn.to_be_bytes());
			body.extend_from_slice(&fragment_offset.to_be_bytes());
			body.extend_from_slice(&apdu_length.to_be_bytes());
			(OptionType::Fragment, body)
		}
		Opt::NakList { sequences } => {
			let mut body = Vec::with_capacity(sequences.len() * 4);
			for s in sequences {
				body.extend_from_slice(&s.to_be_bytes());
			}
			(OptionType::NakList, body)
		}
		Opt::Join { min_join_sqn } => (OptionType::Join, min_join_sqn.to_be_bytes().to_vec()),
		Opt::Redirect { nla } => {
			let mut body = Vec::new();
			nla.write(&mut body);
			(OptionType::Redirect, body)
		}
		Opt::ParityPrm { transmission_group_size } => (OptionType::ParityPrm, transmission_group_size.to_be_bytes().to_vec()),
		Opt::ParityCur { parity_group_sqn } => (OptionType::ParityCur, parity_group_sqn.to_be_bytes().to_vec()),
		Opt::ParityGrp { parity_group_sqn } => (OptionType::ParityGrp, parity_group_sqn.to_be_bytes().to_vec()),
		Opt::Rst => (OptionType::Rst, Vec::new()),
		Opt::Syn => (OptionType::Syn, Vec::new()),
		Opt::Fin => (OptionType::Fin, Vec::new()),
		Opt::Cr => (OptionType::Cr, Vec::new()),
	};

	let mut type_byte = ty as u8;
	if is_last {
		type_byte |= flags::END;
	}

	out.push(type_byte);
	out.push((2 + body.len()) as u8);
	out.append(&mut body);
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips_nak_list_and_fragment() {
		let opts = vec![
			Opt::Fragment { first_sqn: 10, fragment_offset: 0, apdu_length: 4096 },
			Opt::NakList { sequences: vec![1, 2, 3, 4] },
		];

		let mut buf = Vec::new();
		write(&opts, &mut buf);

		let parsed = parse(&buf).unwrap();
		assert_eq!(parsed, opts);
	}

	#[test]
	fn rejects_unknown_significant_option() {
		let mut buf = vec![OptionType::Length as u8, 4, 0, 8];
		buf.extend_from_slice(&[flags::END | flags::NETWORK_SIGNIFICANT | 0x3f, 4, 0, 0]);

		assert!(parse(&buf).is_err());
	}

	#[test]
	fn nak_list_over_limit_is_rejected() {
		let sequences = (0..(MAX_NAK_LIST as u32 + 1)).collect();
		let opts = vec![Opt::NakList { sequences }];

		let mut buf = Vec::new();
		write(&opts, &mut buf);

		// write() doesn't enforce the limit (it only encodes); parse() must reject it.
		assert!(parse(&buf).is_err());
	}
}
