//! The arena-allocated frame shared by the transmit and receive windows (spec §3 "skb").
//!
//! Skbs may be referenced by both a window slot and a pending-delivery queue; `Slice` is already
//! reference-counted arena storage (`collections::bytes::Slice`), so a clone is cheap and keeps
//! the underlying bytes alive for as long as either holder needs them.

use std::time::Instant;

use collections::bytes::Slice;

use crate::seq::Sequence;

/// Per spec §9: skbs hold a back-reference to their owning socket only as a weak handle,
/// resolved at dispatch time, rather than a raw pointer cycle.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SocketId(pub u32);

#[derive(Clone)]
pub struct Skb {
	pub socket: SocketId,
	pub received_at: Instant,
	pub tsi: [u8; 8],
	pub sequence: Sequence,
	/// The packet's TSDU payload (post-parse; headers have already been stripped).
	pub buffer: Slice,
	/// `Some((first_sqn, apdu_length))` for a fragment of a multi-TSDU APDU, so OPT_FRAGMENT can
	/// be reconstructed on retransmission without re-deriving it from neighboring skbs.
	pub frag: Option<(u32, u32)>,
}

impl Skb {
	pub fn new(socket: SocketId, tsi: [u8; 8], sequence: Sequence, buffer: Slice) -> Self {
		Self { socket, received_at: Instant::now(), tsi, sequence, buffer, frag: None }
	}

	pub fn with_frag(mut self, frag: Option<(u32, u32)>) -> Self {
		self.frag = frag;
		self
	}

	pub fn len(&self) -> usize {
		self.buffer.len()
	}

	pub fn is_empty(&self) -> bool {
		self.buffer.is_empty()
	}
}
