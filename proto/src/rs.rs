//! Systematic Reed–Solomon (n, k) forward error correction over GF(2⁸) (spec §4.2).
//!
//! Generator matrix `GM = V_kk⁻¹ · V_kn`, built from a Vandermonde matrix over the field
//! generated by the primitive polynomial `x⁸ + x⁴ + x³ + x² + 1`, with the first `k` rows forced
//! to the identity so encoding leaves the original data untouched (systematic code). Matrix
//! inversion is Gauss–Jordan with partial pivoting, same shape as `reed_solomon.c`'s
//! `_pgm_matinv`, generalized to operate on `Vec<Vec<u8>>` rather than a flat pointer buffer.

use log::warn;
use utils::error::*;

const PRIM_POLY: u16 = 0x11d;
const FIELD_SIZE: usize = 255;

struct GfTables {
	log: [u8; 256],
	antilog: [u8; 512],
}

fn build_tables() -> GfTables {
	let mut log = [0u8; 256];
	let mut antilog = [0u8; 512];

	let mut x: u16 = 1;
	for i in 0..FIELD_SIZE {
		antilog[i] = x as u8;
		log[x as usize] = i as u8;

		x <<= 1;
		if x & 0x100 != 0 {
			x ^= PRIM_POLY;
		}
	}

	for i in FIELD_SIZE..512 {
		antilog[i] = antilog[i - FIELD_SIZE];
	}

	GfTables { log, antilog }
}

fn tables() -> &'static GfTables {
	use std::sync::OnceLock;
	static TABLES: OnceLock<GfTables> = OnceLock::new();
	TABLES.get_or_init(build_tables)
}

#[inline]
pub fn gf_mul(a: u8, b: u8) -> u8 {
	if a == 0 || b == 0 {
		return 0;
	}

	let t = tables();
	t.antilog[t.log[a as usize] as usize + t.log[b as usize] as usize]
}

#[inline]
pub fn gf_pow(e: u32) -> u8 {
	tables().antilog[(e as usize) % FIELD_SIZE]
}

#[inline]
pub fn gf_inv(a: u8) -> u8 {
	assert_ne!(a, 0, "zero has no multiplicative inverse in GF(2^8)");
	let t = tables();
	let e = FIELD_SIZE - t.log[a as usize] as usize;
	t.antilog[e % FIELD_SIZE]
}

/// `d[] ^= b • s[]`, the field-accumulate primitive every matrix operation bottoms out in.
fn vec_addmul(d: &mut [u8], b: u8, s: &[u8]) {
	if b == 0 {
		return;
	}

	for (di, si) in d.iter_mut().zip(s) {
		*di ^= gf_mul(b, *si);
	}
}

fn vandermonde(k: usize, n: usize) -> Vec<Vec<u8>> {
	(0..k).map(|i| (0..n).map(|j| gf_pow((i * j) as u32)).collect()).collect()
}

fn identity(n: usize) -> Vec<Vec<u8>> {
	(0..n).map(|i| (0..n).map(|j| if i == j { 1 } else { 0 }).collect()).collect()
}

/// Gauss–Jordan inversion with partial pivoting. Returns `None` iff the matrix is singular,
/// which cannot happen for a genuine Vandermonde submatrix but can for a caller-assembled
/// recovery matrix built from a malformed (e.g. duplicate) offset list.
fn invert(m: &[Vec<u8>]) -> Option<Vec<Vec<u8>>> {
	let n = m.len();
	let mut a = m.to_vec();
	let mut inv = identity(n);

	for col in 0..n {
		let pivot = (col..n).find(|&r| a[r][col] != 0)?;
		a.swap(col, pivot);
		inv.swap(col, pivot);

		let scale = gf_inv(a[col][col]);
		for x in 0..n {
			a[col][x] = gf_mul(a[col][x], scale);
			inv[col][x] = gf_mul(inv[col][x], scale);
		}

		for row in 0..n {
			if row == col {
				continue;
			}

			let factor = a[row][col];
			if factor == 0 {
				continue;
			}

			let (a_col, inv_col) = (a[col].clone(), inv[col].clone());
			vec_addmul(&mut a[row], factor, &a_col);
			vec_addmul(&mut inv[row], factor, &inv_col);
		}
	}

	Some(inv)
}

pub struct Rs {
	n: u8,
	k: u8,
	/// Row `offset` (0..n), column `i` (0..k): `GM[offset][i]`. Rows `0..k` are the identity.
	gm: Vec<Vec<u8>>,
}

impl Rs {
	pub fn new(n: u8, k: u8) -> Self {
		assert!(k > 0 && n > k, "Reed-Solomon requires 0 < k < n");

		let kk = k as usize;
		let nn = n as usize;

		let v = vandermonde(kk, nn);
		let v_kk: Vec<Vec<u8>> = v.iter().map(|row| row[..kk].to_vec()).collect();
		let v_kk_inv = invert(&v_kk).expect("Vandermonde submatrix is always invertible");

		let mut gm = vec![vec![0u8; kk]; nn];
		for i in 0..kk {
			gm[i][i] = 1;
		}

		for offset in kk..nn {
			for i in 0..kk {
				let mut sum = 0u8;
				for c in 0..kk {
					sum ^= gf_mul(v_kk_inv[c][i], v[c][offset]);
				}
				gm[offset][i] = sum;
			}
		}

		Self { n, k, gm }
	}

	pub fn n(&self) -> u8 {
		self.n
	}

	pub fn k(&self) -> u8 {
		self.k
	}

	/// Compute the parity packet at `offset` (`k <= offset < n`) from `k` data packets of equal
	/// length `len`.
	pub fn encode(&self, src: &[&[u8]], offset: u8, dst: &mut [u8]) {
		assert_eq!(src.len(), self.k as usize);
		assert!(offset >= self.k && offset < self.n, "offset must address a parity packet");

		dst.fill(0);
		for i in 0..self.k as usize {
			vec_addmul(dst, self.gm[offset as usize][i], src[i]);
		}
	}

	/// Inline decode: `block[i]` holds whatever packet currently occupies transmission-group
	/// slot `i`; `offsets[i]` is that packet's true offset within the group (`< k` for data,
	/// `>= k` for parity). Slots where `offsets[i] != i` and `offsets[i] < k` are rejected —
	/// a data packet can only ever occupy its own slot.
	pub fn decode_inline(&self, block: &mut [Vec<u8>], offsets: &[u8]) -> Result<()> {
		let k = self.k as usize;

		if block.len() != k || offsets.len() != k {
			warn!("Reed-Solomon inline decode requires exactly k={k} packets");
			return Err(());
		}

		let mut rm = vec![vec![0u8; k]; k];
		for i in 0..k {
			let off = offsets[i] as usize;

			if off < k {
				if off != i {
					warn!("Data packet offset {off} does not match its transmission-group slot {i}");
					return Err(());
				}
				rm[i][i] = 1;
			} else if off < self.n as usize {
				rm[i] = self.gm[off].clone();
			} else {
				warn!("Offset {off} is outside the transmission group (n={})", self.n);
				return Err(());
			}
		}

		let rm_inv = invert(&rm).ok_or_else(|| warn!("Recovery matrix is singular (duplicate offsets?)"))?;

		let len = block.iter().map(Vec::len).max().unwrap_or(0);
		let mut repaired = Vec::new();

		for j in 0..k {
			if (offsets[j] as usize) < k {
				continue;
			}

			let mut out = vec![0u8; len];
			for i in 0..k {
				vec_addmul(&mut out, rm_inv[j][i], &block[i]);
			}
			repaired.push((j, out));
		}

		for (j, out) in repaired {
			block[j] = out;
		}

		Ok(())
	}

	/// Appended decode: `data[i]` is `None` for missing data packets; `parity` holds received
	/// parity packets as `(offset, bytes)` pairs. Fills in every missing `data[i]` in place.
	pub fn decode_appended(&self, data: &mut [Option<Vec<u8>>], parity: &[(u8, Vec<u8>)]) -> Result<()> {
		let k = self.k as usize;

		if data.len() != k {
			warn!("Reed-Solomon appended decode requires exactly k={k} data slots");
			return Err(());
		}

		let missing: Vec<usize> = (0..k).filter(|&i| data[i].is_none()).collect();

		if missing.len() > parity.len() {
			warn!("Not enough parity packets to recover {} missing data packets", missing.len());
			return Err(());
		}

		let mut block = Vec::with_capacity(k);
		let mut offsets = Vec::with_capacity(k);
		let mut parity_iter = parity.iter();

		for i in 0..k {
			if let Some(d) = &data[i] {
				block.push(d.clone());
				offsets.push(i as u8);
			} else {
				let (off, buf) = parity_iter.next().expect("checked above");
				block.push(buf.clone());
				offsets.push(*off);
			}
		}

		self.decode_inline(&mut block, &offsets)?;

		for i in missing {
			data[i] = Some(block[i].clone());
		}

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn encode_then_inline_decode_recovers_erasure() {
		let rs = Rs::new(10, 8);
		let data: Vec<Vec<u8>> = (0..8).map(|i| vec![i as u8; 16]).collect();
		let refs: Vec<&[u8]> = data.iter().map(Vec::as_slice).collect();

		let mut parity = vec![0u8; 16];
		rs.encode(&refs, 8, &mut parity);

		// Lose data packet 3, replace its slot with the parity packet.
		let mut block: Vec<Vec<u8>> = data.clone();
		block[3] = parity;
		let offsets: Vec<u8> = (0..8).map(|i| if i == 3 { 8 } else { i as u8 }).collect();

		rs.decode_inline(&mut block, &offsets).unwrap();
		assert_eq!(block[3], data[3]);
	}

	#[test]
	fn appended_decode_recovers_missing_packet() {
		let rs = Rs::new(10, 8);
		let data: Vec<Vec<u8>> = (0..8).map(|i| vec![(i * 7 + 1) as u8; 8]).collect();
		let refs: Vec<&[u8]> = data.iter().map(Vec::as_slice).collect();

		let mut parity = vec![0u8; 8];
		rs.encode(&refs, 9, &mut parity);

		let mut received: Vec<Option<Vec<u8>>> = data.iter().cloned().map(Some).collect();
		received[5] = None;

		rs.decode_appended(&mut received, &[(9, parity)]).unwrap();
		assert_eq!(received[5].as_ref().unwrap(), &data[5]);
	}

	#[test]
	fn rejects_too_few_parity_packets() {
		let rs = Rs::new(10, 8);
		let mut received: Vec<Option<Vec<u8>>> = vec![Some(vec![0; 4]); 8];
		received[0] = None;
		received[1] = None;

		assert!(rs.decode_appended(&mut received, &[]).is_err());
	}

	#[test]
	fn gf_mul_and_div_are_inverse() {
		for a in 1..=255u8 {
			for b in [1u8, 2, 3, 200] {
				let prod = gf_mul(a, b);
				let recovered = gf_mul(prod, gf_inv(b));
				assert_eq!(recovered, a);
			}
		}
	}
}
