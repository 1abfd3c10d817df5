//! Status/error facade for the public socket API (spec §6/§7).
//!
//! Recoverable parse/decode failures never reach here — they are logged and dropped at the
//! call site using `utils::error::Result<T = (), E = ()>`, same as the teacher's `udp`/`tcp`
//! modules. `Status`/`Error` are only produced by API entry points that must tell the caller
//! *why* a call did not complete normally.

use core::fmt;

/// Return status of a socket API call.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Status {
	Normal,
	WouldBlock,
	RateLimited,
	TimerPending,
	Reset,
	Eof,
	Error,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Domain {
	Interface,
	Packet,
	Socket,
	Time,
	Engine,
	/// Invalid or conflicting socket configuration, surfaced at `Socket::bind`.
	Config,
	Recv,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Kind {
	// Interface
	Nodev,
	Nonet,
	Noname,
	Notuniq,
	Xdev,
	// Packet
	Malformed,
	Cksum,
	Bounds,
	// Socket
	Fault,
	AfNoSupport,
	Again,
	InProgress,
	ConnReset,
	NoBufs,
	// Time
	Failed,
	Nosys,
	// Config
	Invalid,
}

#[derive(Clone, Debug)]
pub struct Error {
	pub domain: Domain,
	pub code: Kind,
	pub message: String,
}

impl Error {
	pub fn new(domain: Domain, code: Kind, message: impl Into<String>) -> Self {
		Self { domain, code, message: message.into() }
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:?}/{:?}: {}", self.domain, self.code, self.message)
	}
}

impl std::error::Error for Error {}
