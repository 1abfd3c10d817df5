//! Self-contained PGM protocol engine: wire codec, Reed–Solomon FEC, serial sequence
//! arithmetic, and the transmit/receive window state machines. `pgm` links against this the
//! way an application links against a transport library — nothing here knows about sockets.

pub mod codec;
pub mod rs;
pub mod rxw;
pub mod seq;
pub mod skb;
pub mod txw;

pub use codec::{Body, Packet};
pub use rs::Rs;
pub use rxw::{AddOutcome, Rxw, SlotState};
pub use seq::Sequence;
pub use skb::{Skb, SocketId};
pub use txw::Txw;
