pub mod io;
pub mod logger;
pub mod time;

pub use io::{AsRawFd, Datagram, Notifier, RawFd};
pub use time::Clock;
