//! PGM (RFC 3208, Pragmatic General Multicast) reliable-multicast transport.
//!
//! The socket core (spec §4.8) is the crate's front door: `Engine` is the process-wide handle
//! `Socket::bind` requires, and `Socket` wraps one bound endpoint's source and/or receiver half.
//! Everything else (codec, FEC, windows, timing, peer table) is internal plumbing the socket
//! core drives.

pub mod error;
pub mod options;
pub mod pacing;
pub mod peer;
pub mod receiver;
pub mod socket;
pub mod source;

pub use error::{Domain, Error, Kind, Status};
pub use options::{Fec, Options, WindowSizing};
pub use peer::Tsi;
pub use socket::{Engine, Socket};
