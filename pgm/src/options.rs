//! Socket configuration, validated once at `Socket::bind` (spec §6).

use std::time::Duration;

use crate::error::{Domain, Error, Kind};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WindowSizing {
	Sqns(u32),
	Rate { secs: u32, max_rte: u32 },
}

#[derive(Clone, Debug)]
pub struct Fec {
	/// Transmission group block size, `n`.
	pub block_size: u8,
	/// Transmission group data size, `k`.
	pub group_size: u8,
	pub proactive_packets: u8,
	pub ondemand_parity_enabled: bool,
	pub var_pktlen_enabled: bool,
}

#[derive(Clone, Debug)]
pub struct Options {
	pub mtu: u16,
	pub txw: WindowSizing,
	pub rxw: WindowSizing,

	pub peer_expiry: Duration,
	pub spmr_expiry: Duration,
	pub nak_bo_ivl: Duration,
	pub nak_rpt_ivl: Duration,
	pub nak_rdata_ivl: Duration,
	pub nak_data_retries: u32,
	pub nak_ncf_retries: u32,

	pub ambient_spm: Duration,
	pub heartbeat_spm: Vec<Duration>,

	pub hops: u8,
	pub multicast_loop: bool,
	pub tos: u8,
	pub ip_router_alert: bool,

	/// `true` binds a raw IP-protocol-113 socket (`IP_HDRINCL`); `false` (default) uses UDP
	/// encapsulation, which is the only framing most deployment environments allow unprivileged.
	pub raw_ip: bool,

	pub fec: Option<Fec>,

	pub send_only: bool,
	pub recv_only: bool,
	pub passive: bool,
	pub noblock: bool,
}

impl Default for Options {
	fn default() -> Self {
		Self {
			mtu: 1500,
			txw: WindowSizing::Sqns(4096),
			rxw: WindowSizing::Sqns(4096),
			peer_expiry: Duration::from_secs(300),
			spmr_expiry: Duration::from_millis(250),
			nak_bo_ivl: Duration::from_millis(50),
			nak_rpt_ivl: Duration::from_secs(2),
			nak_rdata_ivl: Duration::from_secs(2),
			nak_data_retries: 5,
			nak_ncf_retries: 2,
			ambient_spm: Duration::from_secs(30),
			heartbeat_spm: vec![
				Duration::from_millis(100),
				Duration::from_millis(200),
				Duration::from_millis(400),
				Duration::from_millis(800),
				Duration::from_secs(1),
				Duration::from_secs(2),
				Duration::from_secs(4),
				Duration::from_secs(8),
				Duration::from_secs(16),
				Duration::from_secs(30),
			],
			hops: 16,
			multicast_loop: false,
			tos: 0,
			ip_router_alert: false,
			raw_ip: false,
			fec: None,
			send_only: false,
			recv_only: false,
			passive: false,
			noblock: false,
		}
	}
}

impl Options {
	/// Cross-field validation performed once, at bind time.
	pub fn validate(&self) -> Result<(), Error> {
		if self.mtu < 64 {
			return Err(Error::new(Domain::Config, Kind::Invalid, "MTU below minimum PGM header overhead"));
		}

		if self.send_only && self.recv_only {
			return Err(Error::new(Domain::Config, Kind::Invalid, "SEND_ONLY and RECV_ONLY are mutually exclusive"));
		}

		// Open question resolved (SPEC_FULL.md §E): FEC and variable packet length within a
		// transmission group are mutually exclusive — the decode path assumes equal-length
		// packets.
		if let Some(fec) = &self.fec {
			if fec.var_pktlen_enabled {
				return Err(Error::new(Domain::Config, Kind::Invalid, "OPT_VAR_PKTLEN is incompatible with FEC (USE_FEC)"));
			}

			if fec.group_size == 0 || fec.block_size <= fec.group_size {
				return Err(Error::new(Domain::Config, Kind::Invalid, "FEC requires 0 < group_size < block_size"));
			}
		}

		Ok(())
	}

	/// Resolve the configured window sizing mode into a slot count.
	pub fn txw_sqns(&self) -> u32 {
		resolve_sqns(self.txw, self.mtu)
	}

	pub fn rxw_sqns(&self) -> u32 {
		resolve_sqns(self.rxw, self.mtu)
	}
}

fn resolve_sqns(sizing: WindowSizing, mtu: u16) -> u32 {
	match sizing {
		WindowSizing::Sqns(n) => n,
		WindowSizing::Rate { secs, max_rte } => (secs as u64 * max_rte as u64 / mtu as u64) as u32,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fec_and_var_pktlen_are_rejected_together() {
		let mut opts = Options::default();
		opts.fec = Some(Fec { block_size: 255, group_size: 8, proactive_packets: 0, ondemand_parity_enabled: true, var_pktlen_enabled: true });

		assert!(opts.validate().is_err());
	}

	#[test]
	fn rate_sizing_derives_sqns_from_mtu() {
		let opts = Options { txw: WindowSizing::Rate { secs: 2, max_rte: 1500 }, mtu: 1500, ..Options::default() };
		assert_eq!(opts.txw_sqns(), 2);
	}
}
