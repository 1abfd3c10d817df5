//! AFI-tagged network-layer addresses, as carried inside PGM option bodies (RFC 3208 §9.10).

use core::net::{Ipv4Addr, Ipv6Addr};

use utils::bytes::Cast;
use utils::endian::u16be;

/// Address Family Identifier, per RFC 1700.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u16)]
pub enum Afi {
	Ipv4 = 1,
	Ipv6 = 2,
}

impl Afi {
	pub fn from_u16(v: u16) -> Option<Self> {
		match v {
			1 => Some(Afi::Ipv4),
			2 => Some(Afi::Ipv6),
			_ => None,
		}
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Nla {
	V4(Ipv4Addr),
	V6(Ipv6Addr),
}

impl Nla {
	pub const fn afi(&self) -> Afi {
		match self {
			Nla::V4(_) => Afi::Ipv4,
			Nla::V6(_) => Afi::Ipv6,
		}
	}

	pub const fn encoded_len(&self) -> usize {
		match self {
			Nla::V4(_) => 2 + 4,
			Nla::V6(_) => 2 + 16,
		}
	}

	/// Parse an AFI-prefixed address from the front of `buf`, returning the address and the
	/// number of bytes consumed.
	pub fn parse(buf: &[u8]) -> Option<(Self, usize)> {
		if buf.len() < 2 {
			return None;
		}

		let afi = Afi::from_u16(u16::from_be_bytes([buf[0], buf[1]]))?;

		match afi {
			Afi::Ipv4 => {
				if buf.len() < 6 {
					return None;
				}
				let octets: [u8; 4] = buf[2..6].try_into().unwrap();
				Some((Nla::V4(Ipv4Addr::from(octets)), 6))
			}
			Afi::Ipv6 => {
				if buf.len() < 18 {
					return None;
				}
				let octets: [u8; 16] = buf[2..18].try_into().unwrap();
				Some((Nla::V6(Ipv6Addr::from(octets)), 18))
			}
		}
	}

	pub fn write(&self, out: &mut Vec<u8>) {
		out.extend_from_slice(&(self.afi() as u16).to_be_bytes());

		match self {
			Nla::V4(addr) => out.extend_from_slice(&addr.octets()),
			Nla::V6(addr) => out.extend_from_slice(&addr.octets()),
		}
	}
}

/// The raw wire form of an IPv4 NLA: AFI followed by 4 address bytes, used directly inside
/// `#[derive(Cast)]` option bodies where the address family is fixed at the type level.
#[derive(Clone, Copy, Cast)]
#[repr(C)]
pub struct RawNla4 {
	pub afi: u16be,
	pub addr: Ipv4Addr,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips_v4() {
		let nla = Nla::V4(Ipv4Addr::new(10, 0, 0, 1));
		let mut buf = Vec::new();
		nla.write(&mut buf);

		let (parsed, len) = Nla::parse(&buf).unwrap();
		assert_eq!(parsed, nla);
		assert_eq!(len, nla.encoded_len());
	}

	#[test]
	fn round_trips_v6() {
		let nla = Nla::V6(Ipv6Addr::LOCALHOST);
		let mut buf = Vec::new();
		nla.write(&mut buf);

		let (parsed, len) = Nla::parse(&buf).unwrap();
		assert_eq!(parsed, nla);
		assert_eq!(len, nla.encoded_len());
	}

	#[test]
	fn rejects_unknown_afi() {
		let buf = [0, 99, 1, 2, 3, 4];
		assert!(Nla::parse(&buf).is_none());
	}
}
