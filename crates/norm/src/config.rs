//! Session configuration (§6 Configuration).

use std::time::Duration;

use utils::error::*;

/// How a NACK repair request is scoped across a sender's blocks.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RepairBoundary {
	/// One NACK round per block.
	Block,
	/// NACKs coalesce across an entire object.
	Object,
}

/// How aggressively a receiver requests repair for a given object.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NackingMode {
	/// Ignore the object entirely.
	None,
	/// Only request missing INFO, never repair data.
	InfoOnly,
	/// Full repair.
	Normal,
}

/// The earliest objectId a receiver will attempt to receive from a
/// newly heard sender.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SyncPolicy {
	/// Accept only objects whose first DATA segment is received.
	Current,
	/// As `Current`, but attempt to rewind one stream object to block zero.
	Stream,
	/// Sync as far back as the receive cache permits.
	All,
}

/// Whether/how FEC Transmission Information is attached to outgoing messages.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FtiMode {
	/// Never attach FTI; the receiver is preconfigured out of band.
	Preset,
	/// Attach FTI only to INFO messages.
	Info,
	/// Attach FTI to every initial DATA message of an object as well.
	Always,
}

/// `Stream::flush` behavior.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FlushMode {
	None,
	/// Flush a runt segment without requesting acknowledgment.
	Passive,
	/// Flush a runt segment and arm a watermark at the flush point.
	Active,
}

/// Session-wide configuration. Validated once at construction; immutable
/// thereafter (§6).
#[derive(Clone, Debug)]
pub struct Config {
	/// UDP payload per DATA message, excluding headers.
	pub segment_size: u16,
	/// Source symbols per FEC block.
	pub num_data: u16,
	/// Parity symbols per FEC block.
	pub num_parity: u16,
	/// FEC scheme identifier (§4.2 FEC payload id table).
	pub fec_id: u8,
	/// Field size in bits for the configured FEC scheme (e.g. 8, 16).
	pub fec_field_size: u8,
	/// Parity symbols proactively sent per block before any NACK.
	pub auto_parity: u16,

	pub tx_rate: u32,
	pub tx_rate_min: u32,
	pub tx_rate_max: u32,

	/// Scales NACK and feedback backoff windows (the `K` in `U(0, K*GRTT)`).
	pub backoff_factor: f64,
	/// Feedback-suppression group-size parameter.
	pub group_size: u32,
	/// Clamp on advertised GRTT.
	pub grtt_max: Duration,

	pub tx_cache_count_min: u32,
	pub tx_cache_count_max: u32,
	pub tx_cache_size_max: u64,

	pub tx_robust_factor: u32,
	pub rx_robust_factor: u32,

	pub repair_boundary: RepairBoundary,
	pub nacking_mode: NackingMode,
	pub sync_policy: SyncPolicy,
	pub fti_mode: FtiMode,
	pub flush_mode: FlushMode,

	pub silent_receiver: bool,
	pub unicast_nacks: bool,
	pub rcvr_realtime: bool,
	pub rcvr_max_delay: Option<u32>,
	pub rcvr_ignore_info: bool,

	pub ecn_enabled: bool,
	pub ecn_ignore_loss: bool,
	pub cc_tolerate_loss: bool,
	pub fragmentation: bool,
	pub multicast_loopback: bool,
	pub ttl: u32,
	pub tos: u8,

	/// Non-RFC-compliant cap on CC rate to 2x the measured receive rate
	/// during slow start. Enabled by default, matching the reference
	/// implementation (see DESIGN.md Open Question decisions).
	pub cc_limit: bool,

	/// Fixed-capacity sizing for the segment and block pools (§4.1).
	pub segment_pool_capacity: usize,
	pub block_pool_capacity: usize,
}

/// `GRTT_MIN = 1 ms` (§6 Time base).
pub const GRTT_MIN: Duration = Duration::from_millis(1);
/// `GRTT_MAX = 15 s` (§6 Time base).
pub const GRTT_MAX: Duration = Duration::from_secs(15);

impl Default for Config {
	fn default() -> Self {
		Self {
			segment_size: 1400,
			num_data: 64,
			num_parity: 16,
			fec_id: 2,
			fec_field_size: 8,
			auto_parity: 0,

			tx_rate: 64_000,
			tx_rate_min: 8_000,
			tx_rate_max: 10_000_000,

			backoff_factor: 4.0,
			group_size: 1000,
			grtt_max: Duration::from_secs(10),

			tx_cache_count_min: 8,
			tx_cache_count_max: 256,
			tx_cache_size_max: 64 * 1024 * 1024,

			tx_robust_factor: 20,
			rx_robust_factor: 20,

			repair_boundary: RepairBoundary::Block,
			nacking_mode: NackingMode::Normal,
			sync_policy: SyncPolicy::Current,
			fti_mode: FtiMode::Info,
			flush_mode: FlushMode::Active,

			silent_receiver: false,
			unicast_nacks: false,
			rcvr_realtime: false,
			rcvr_max_delay: None,
			rcvr_ignore_info: false,

			ecn_enabled: false,
			ecn_ignore_loss: false,
			cc_tolerate_loss: true,
			fragmentation: false,
			multicast_loopback: false,
			ttl: 64,
			tos: 0,

			cc_limit: true,

			segment_pool_capacity: 4096,
			block_pool_capacity: 256,
		}
	}
}

impl Config {
	/// Validate invariants that the rest of the engine assumes hold for
	/// the lifetime of the session.
	pub fn validate(&self) -> Result {
		if self.segment_size == 0 {
			return Err(log::error!("segment_size must be at least 1"));
		}

		if self.num_data == 0 {
			return Err(log::error!("num_data must be at least 1"));
		}

		let max_symbol_id = match (self.fec_id, self.fec_field_size) {
			(2, 8) | (5, 8) => 1u32 << 8,
			(2, 16) | (129, 16) => 1u32 << 16,
			_ => return Err(log::error!("unsupported fec_id/fec_field_size combination: {}/{}", self.fec_id, self.fec_field_size)),
		};

		if (self.num_data as u32) + (self.num_parity as u32) > max_symbol_id {
			return Err(log::error!("num_data + num_parity exceeds the symbol-id width for fec_id {}", self.fec_id));
		}

		if self.tx_rate_min > self.tx_rate_max {
			return Err(log::error!("tx_rate_min must not exceed tx_rate_max"));
		}

		if self.tx_cache_count_min > self.tx_cache_count_max {
			return Err(log::error!("tx_cache_count_min must not exceed tx_cache_count_max"));
		}

		if self.grtt_max < GRTT_MIN || self.grtt_max > GRTT_MAX {
			return Err(log::error!("grtt_max must fall within [{:?}, {:?}]", GRTT_MIN, GRTT_MAX));
		}

		Ok(())
	}
}
