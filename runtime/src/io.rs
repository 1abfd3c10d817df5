//! Non-blocking datagram I/O, shared by the raw-IP and UDP-encapsulated transports.

use std::io::{self, ErrorKind};

use collections::bytes::Slice;
use log::error;
use utils::error::*;

#[cfg(target_family = "unix")]
mod sys {
	pub use std::os::fd::{AsRawFd, RawFd};

	pub use libc::{c_void as BufType, recv, send};

	pub fn as_raw<T: AsRawFd>(t: &T) -> RawFd {
		t.as_raw_fd()
	}

	pub fn pipe() -> io::Result<(RawFd, RawFd)> {
		let mut fds = [0; 2];
		if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
			return Err(io::Error::last_os_error());
		}
		Ok((fds[0], fds[1]))
	}

	pub fn write_byte(fd: RawFd) {
		let byte = 1u8;
		unsafe { libc::write(fd, &byte as *const u8 as *const _, 1) };
	}

	pub fn drain(fd: RawFd) {
		let mut buf = [0u8; 64];
		loop {
			let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) };
			if n <= 0 {
				break;
			}
		}
	}

	pub fn set_nonblocking(fd: RawFd) {
		unsafe {
			let flags = libc::fcntl(fd, libc::F_GETFL, 0);
			libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
		}
	}

	pub fn close(fd: RawFd) {
		unsafe {
			libc::close(fd);
		}
	}

	use std::io;
}

#[cfg(target_family = "windows")]
mod sys {
	pub use std::os::windows::io::AsRawSocket as AsRawFd;

	pub use u8 as BufType;
	pub use windows_sys::Win32::Networking::WinSock::{recv, send, SOCKET as RawFd};

	pub fn as_raw<T: AsRawFd>(t: &T) -> RawFd {
		t.as_raw_socket() as _
	}
}

pub use sys::{AsRawFd, RawFd};
use sys::*;

fn ret_to_err(val: isize) -> Result<Option<usize>> {
	match TryInto::<usize>::try_into(val) {
		Ok(n) => Ok(Some(n)),
		Err(_) => {
			let err = io::Error::last_os_error();

			if matches!(err.kind(), ErrorKind::WouldBlock) {
				return Ok(None);
			}

			error!("I/O operation failed: {err}");
			Err(())
		}
	}
}

/// A non-blocking wrapper around a raw or UDP socket.
///
/// Unlike the teacher's `Io<T>`, this does not register itself in a global poll set: the PGM
/// socket core owns its own fd and is itself the thing an application's `poll`/`select`/epoll
/// loop watches (spec.md §4.8).
pub struct Datagram<T: AsRawFd> {
	inner: T,
}

impl<T: AsRawFd> Datagram<T> {
	pub fn new(inner: T) -> Self {
		Self { inner }
	}

	pub fn as_raw_fd(&self) -> RawFd {
		as_raw(&self.inner)
	}

	pub fn get_ref(&self) -> &T {
		&self.inner
	}

	/// Attempt a single non-blocking receive into a fresh buffer of `mtu` bytes. Returns `None`
	/// if nothing was waiting.
	pub fn recv(&self, mtu: usize) -> Result<Option<Slice>> {
		let mut buf = Slice::new(mtu);

		let r = unsafe { sys::recv(as_raw(&self.inner), buf.as_mut_ptr() as *mut BufType, buf.len() as _, 0) };

		match ret_to_err(r as _)? {
			Some(n) => {
				buf.truncate(n);
				Ok(Some(buf))
			}
			None => Ok(None),
		}
	}

	/// Attempt a single non-blocking send. Returns `false` if the socket would have blocked.
	pub fn send(&self, buf: &[u8]) -> Result<bool> {
		let r = unsafe { sys::send(as_raw(&self.inner), buf.as_ptr() as *mut BufType, buf.len() as _, 0) };

		match ret_to_err(r as _)? {
			Some(n) if n == buf.len() => Ok(true),
			Some(n) => {
				error!("Only sent {}/{} bytes to socket", n, buf.len());
				Err(())
			}
			None => Ok(false),
		}
	}
}

/// The "pending"/"repair" notifier fds spec.md §4.8 asks for: a byte written whenever the
/// receiver has new deliverable data or the source has a repair queued, so a caller's
/// `poll`/`select`/epoll loop wakes even though nothing arrived on the network socket itself.
///
/// Windows has no equivalent of a self-pipe without bringing in an IOCP-aware crate the rest of
/// the stack doesn't otherwise need, so there `is_set()` is the only way to observe it.
pub struct Notifier {
	#[cfg(target_family = "unix")]
	fds: (RawFd, RawFd),
	flag: std::sync::atomic::AtomicBool,
}

impl Notifier {
	#[cfg(target_family = "unix")]
	pub fn new() -> Result<Self> {
		let (read_fd, write_fd) = sys::pipe().map_err(|err| error!("Failed to create notifier pipe: {err}"))?;
		sys::set_nonblocking(read_fd);
		Ok(Self { fds: (read_fd, write_fd), flag: std::sync::atomic::AtomicBool::new(false) })
	}

	#[cfg(target_family = "windows")]
	pub fn new() -> Result<Self> {
		Ok(Self { flag: std::sync::atomic::AtomicBool::new(false) })
	}

	#[cfg(target_family = "unix")]
	pub fn as_raw_fd(&self) -> RawFd {
		self.fds.0
	}

	pub fn is_set(&self) -> bool {
		self.flag.load(std::sync::atomic::Ordering::Acquire)
	}

	pub fn set(&self) {
		if !self.flag.swap(true, std::sync::atomic::Ordering::AcqRel) {
			#[cfg(target_family = "unix")]
			sys::write_byte(self.fds.1);
		}
	}

	pub fn clear(&self) {
		self.flag.store(false, std::sync::atomic::Ordering::Release);
		#[cfg(target_family = "unix")]
		sys::drain(self.fds.0);
	}
}

#[cfg(target_family = "unix")]
impl Drop for Notifier {
	fn drop(&mut self) {
		sys::close(self.fds.0);
		sys::close(self.fds.1);
	}
}
