//! Session (§4.6): GRTT tracking, TFRC-like congestion control, the
//! acking-node watermark state machine, tx cache bounds, and squelch.
//!
//! Grounded on `original_source/include/normSession.h` for the GRTT
//! max-filter/EWMA update and the tx cache bound fields, and on §4.6's
//! congestion-control rate equation directly (the reference
//! implementation's `NormSession::CalculateRate` body isn't present in
//! `original_source/`, only its declaration, so the canonical TFRC
//! throughput equation it implements is used verbatim). The socket and
//! timer plumbing follows `wireguard`'s `Tunnel`/`Peer` actor wiring —
//! `Session` is meant to be driven as a `stakker` actor the same way,
//! with each timer-wheel priority in §4.6 becoming a `CX![]`-scheduled
//! method; the state transitions below are written so that wiring is a
//! thin wrapper, not a rewrite.

use std::time::{Duration, Instant};

use collections::arena::{Arena, Handle};
use collections::fastmap::FastMap;

use crate::config::Config;
use crate::object::{Object, Payload};
use crate::sender_node::{SenderKey, SenderNode};
use crate::wire::{BlockId, NodeId, ObjectId};

/// TFRC-like throughput equation (§4.6): bytes/sec a flow paying loss
/// fraction `p` with round-trip `rtt` (seconds) and packet size
/// `segment_size` (bytes) can sustain.
pub fn tfrc_rate(segment_size: f64, rtt: f64, loss: f64) -> f64 {
	if loss <= 0.0 || rtt <= 0.0 {
		return f64::INFINITY;
	}

	let p = loss;
	let denom = rtt * ((2.0 * p / 3.0).sqrt() + 12.0 * (3.0 * p / 8.0).sqrt() * p * (1.0 + 32.0 * p * p));

	segment_size / denom
}

/// One remote receiver's latest congestion-control feedback (§4.5 CC
/// feedback extension).
#[derive(Clone, Copy, Debug, Default)]
pub struct CcReport {
	pub rtt: Duration,
	pub loss: f64,
	pub is_clr: bool,
	pub is_plr: bool,
}

/// Per-node watermark-ACK outcome (§4.6 acking-node tree).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AckStatus {
	Pending,
	Success,
	Failure,
	Invalid,
}

/// A sender-driven positive-ACK round for flow control / delivery
/// confirmation, armed by `SetWatermark`.
pub struct Watermark {
	pub object_id: ObjectId,
	pub block_id: BlockId,
	pub symbol_id: u16,
	attempts_left: u32,
	acking: FastMap<NodeId, AckStatus>,
}

impl Watermark {
	pub fn is_complete(&self) -> bool {
		self.acking.values().all(|s| *s != AckStatus::Pending)
	}

	pub fn is_exhausted(&self) -> bool {
		self.attempts_left == 0
	}

	pub fn record(&mut self, node: NodeId, status: AckStatus) {
		if let Some(slot) = self.acking.get_mut(&node) {
			*slot = status;
		}
	}

	pub fn tick(&mut self) {
		self.attempts_left = self.attempts_left.saturating_sub(1);
	}
}

/// A retained post-completion tx object, tracked only for cache-bound
/// accounting (the object's own data lives in `Object`/`Block`).
struct TxCacheEntry {
	object_id: ObjectId,
	size: u64,
	completed_at: Instant,
}

/// Sender- and receiver-side session state: GRTT, congestion control,
/// the remote-sender tree, watermark tracking, and the tx cache.
pub struct Session {
	pub config: Config,
	pub local_node: NodeId,

	senders: Arena<SenderNode>,
	sender_index: FastMap<SenderKey, Handle<SenderNode>>,

	grtt_measured: Duration,
	grtt_advertised: Duration,

	tx_rate: f64,
	cc_reports: FastMap<NodeId, CcReport>,
	cc_slow_start: bool,

	watermark: Option<Watermark>,

	tx_cache: Vec<TxCacheEntry>,
	tx_cache_size: u64,
	squelch_floor: Option<ObjectId>,

	tx_objects: Arena<Object>,
	tx_index: std::collections::BTreeMap<u16, Handle<Object>>,
	next_object_id: u16,
}

impl Session {
	pub fn new(config: Config, local_node: NodeId) -> utils::error::Result<Self> {
		config.validate()?;

		let tx_rate = config.tx_rate as f64;

		Ok(Self {
			local_node,
			senders: Arena::new(),
			sender_index: Default::default(),
			grtt_measured: Duration::from_millis(500),
			grtt_advertised: Duration::from_millis(500),
			tx_rate,
			cc_reports: Default::default(),
			cc_slow_start: true,
			watermark: None,
			tx_cache: Vec::new(),
			tx_cache_size: 0,
			squelch_floor: None,
			tx_objects: Arena::new(),
			tx_index: Default::default(),
			next_object_id: 0,
			config,
		})
	}

	// -- transmit object table (§4.4, §4.6) ---------------------------

	/// Open a new transmit object, assigning the next sequential
	/// objectId and sizing its block/segment pools from `config`
	/// (mirrors `NormSession::QueueTxObject`'s id assignment and the
	/// object's own `segment_pool`/`block_pool` construction).
	pub fn open_tx_object(&mut self, payload: Payload, size: u64, info: Option<Vec<u8>>) -> (ObjectId, Handle<Object>) {
		let id = ObjectId(self.next_object_id);
		self.next_object_id = self.next_object_id.wrapping_add(1);

		let object = Object::open(
			id,
			payload,
			size,
			self.config.segment_size,
			self.config.num_data,
			self.config.num_parity,
			info,
			self.config.segment_pool_capacity,
			self.config.block_pool_capacity,
		);

		let handle = self.tx_objects.insert(object);
		self.tx_index.insert(id.0, handle);
		(id, handle)
	}

	pub fn tx_object(&self, handle: Handle<Object>) -> Option<&Object> {
		self.tx_objects.get(handle)
	}

	pub fn tx_object_mut(&mut self, handle: Handle<Object>) -> Option<&mut Object> {
		self.tx_objects.get_mut(handle)
	}

	pub fn tx_object_handle(&self, object_id: ObjectId) -> Option<Handle<Object>> {
		self.tx_index.get(&object_id.0).copied()
	}

	pub fn remove_tx_object(&mut self, object_id: ObjectId) -> Option<Object> {
		let handle = self.tx_index.remove(&object_id.0)?;
		self.tx_objects.remove(handle)
	}

	/// Handles of every currently open tx object, oldest (lowest
	/// objectId) first — the order a sender scans across objects for
	/// its next message.
	pub fn tx_object_handles(&self) -> impl Iterator<Item = Handle<Object>> + '_ {
		self.tx_index.values().copied()
	}

	pub fn tx_object_count(&self) -> usize {
		self.tx_objects.len()
	}

	// -- remote-sender tree (§4.5) -----------------------------------

	pub fn sender_or_insert(&mut self, key: SenderKey, now: Instant) -> Handle<SenderNode> {
		if let Some(&handle) = self.sender_index.get(&key) {
			return handle;
		}

		let handle = self.senders.insert(SenderNode::new(key, now, &self.config));
		self.sender_index.insert(key, handle);
		handle
	}

	pub fn sender(&self, handle: Handle<SenderNode>) -> Option<&SenderNode> {
		self.senders.get(handle)
	}

	pub fn sender_mut(&mut self, handle: Handle<SenderNode>) -> Option<&mut SenderNode> {
		self.senders.get_mut(handle)
	}

	pub fn sender_by_key(&self, key: &SenderKey) -> Option<Handle<SenderNode>> {
		self.sender_index.get(key).copied()
	}

	/// Every tracked remote sender's handle, for a repair/probe sweep to
	/// walk without needing its own index into `senders`.
	pub fn sender_handles(&self) -> impl Iterator<Item = Handle<SenderNode>> + '_ {
		self.sender_index.values().copied()
	}

	/// Purge any remote sender that's missed `rx_robust_factor`
	/// consecutive activity intervals.
	pub fn purge_inactive_senders(&mut self) -> Vec<SenderKey> {
		let senders = &mut self.senders;

		let stale: Vec<SenderKey> = self
			.sender_index
			.iter()
			.filter_map(|(&key, &handle)| match senders.get_mut(handle) {
				Some(node) if node.activity_timeout() => Some(key),
				_ => None,
			})
			.collect();

		for key in &stale {
			if let Some(handle) = self.sender_index.remove(key) {
				self.senders.remove(handle);
			}
			self.forget_cc_report(&key.node_id);
		}

		stale
	}

	// -- GRTT (§4.6, §6) ----------------------------------------------

	/// Fold in a new round-trip sample: a max-filter over the current
	/// window feeding an EWMA, clamped to `[GRTT_MIN, grtt_max]`,
	/// mirroring `NormSession::SenderSetGrtt`/`UpdateGrttEstimate`.
	pub fn update_grtt(&mut self, sample: Duration) {
		self.grtt_measured = self.grtt_measured.max(sample);

		let ewma = self.grtt_advertised.mul_f64(0.9) + self.grtt_measured.mul_f64(0.1);
		self.grtt_advertised = ewma.clamp(crate::config::GRTT_MIN, self.config.grtt_max);
	}

	pub fn grtt(&self) -> Duration {
		self.grtt_advertised
	}

	// -- congestion control (§4.6) ------------------------------------

	pub fn record_cc_report(&mut self, node: NodeId, report: CcReport) {
		self.cc_reports.insert(node, report);
	}

	pub fn forget_cc_report(&mut self, node: &NodeId) {
		self.cc_reports.remove(node);
	}

	/// Worst (largest) loss fraction reported by an active CLR/PLR
	/// receiver, or `None` if no loss has been observed yet (slow start).
	fn worst_loss(&self) -> Option<(f64, Duration)> {
		self.cc_reports
			.values()
			.filter(|r| r.is_clr || r.is_plr)
			.filter(|r| r.loss > 0.0)
			.map(|r| (r.loss, r.rtt))
			.max_by(|a, b| a.0.total_cmp(&b.0))
	}

	/// Recompute `tx_rate` from the worst reported loss, per §4.6: in
	/// slow start (no loss yet), double per RTT capped at
	/// `2 * measured_recv_rate`; once loss is observed, apply the TFRC
	/// equation and leave slow start permanently (matching the
	/// reference's one-way transition out of slow start on first loss).
	pub fn update_cc_rate(&mut self, measured_recv_rate: f64) {
		match self.worst_loss() {
			Some((loss, rtt)) => {
				self.cc_slow_start = false;
				let rate = tfrc_rate(self.config.segment_size as f64, rtt.as_secs_f64(), loss);
				self.set_tx_rate(rate);
			}
			None if self.cc_slow_start => {
				let doubled = self.tx_rate * 2.0;
				let cap = if self.config.cc_limit { 2.0 * measured_recv_rate } else { f64::INFINITY };
				self.set_tx_rate(doubled.min(cap));
			}
			None => {}
		}
	}

	fn set_tx_rate(&mut self, rate: f64) {
		self.tx_rate = rate.clamp(self.config.tx_rate_min as f64, self.config.tx_rate_max as f64);
	}

	pub fn tx_rate(&self) -> f64 {
		self.tx_rate
	}

	/// Inter-packet pacing interval for a `packet_size`-byte send.
	pub fn pacing_interval(&self, packet_size: usize) -> Duration {
		Duration::from_secs_f64(packet_size as f64 / self.tx_rate.max(1.0))
	}

	// -- acking-node tree / watermark (§4.6) ---------------------------

	pub fn set_watermark(&mut self, object_id: ObjectId, block_id: BlockId, symbol_id: u16, acking_nodes: &[NodeId]) {
		let acking = acking_nodes.iter().map(|&n| (n, AckStatus::Pending)).collect();

		self.watermark = Some(Watermark { object_id, block_id, symbol_id, attempts_left: self.config.tx_robust_factor, acking });
	}

	pub fn watermark(&self) -> Option<&Watermark> {
		self.watermark.as_ref()
	}

	pub fn watermark_mut(&mut self) -> Option<&mut Watermark> {
		self.watermark.as_mut()
	}

	/// Advance the watermark's retry budget, returning the watermark's
	/// terminal outcome once it either completes or exhausts its
	/// retries, clearing it from the session either way.
	pub fn tick_watermark(&mut self) -> Option<bool> {
		let wm = self.watermark.as_mut()?;

		if wm.is_complete() {
			self.watermark = None;
			return Some(true);
		}

		wm.tick();
		if wm.is_exhausted() {
			self.watermark = None;
			return Some(false);
		}

		None
	}

	// -- tx cache bounds (§4.6) -----------------------------------------

	pub fn retain_completed(&mut self, object_id: ObjectId, size: u64, now: Instant) {
		self.tx_cache_size += size;
		self.tx_cache.push(TxCacheEntry { object_id, size, completed_at: now });
	}

	/// Purge objects beyond `tx_cache_count_min`, oldest first, while
	/// any bound is exceeded and no pending watermark references the
	/// candidate.
	pub fn purge_tx_cache(&mut self) -> Vec<ObjectId> {
		let mut purged = Vec::new();

		while self.tx_cache.len() as u32 > self.config.tx_cache_count_min {
			let over_count = self.tx_cache.len() as u32 > self.config.tx_cache_count_max;
			let over_size = self.tx_cache_size > self.config.tx_cache_size_max;

			if !over_count && !over_size {
				break;
			}

			let Some(victim_idx) = self.tx_cache.iter().position(|e| self.watermark.as_ref().map_or(true, |wm| wm.object_id != e.object_id)) else {
				break;
			};

			let entry = self.tx_cache.remove(victim_idx);
			self.tx_cache_size -= entry.size;
			purged.push(entry.object_id);
		}

		purged
	}

	pub fn tx_cache_len(&self) -> usize {
		self.tx_cache.len()
	}

	// -- squelch (§4.6) --------------------------------------------------

	pub fn set_squelch_floor(&mut self, floor: ObjectId) {
		self.squelch_floor = Some(floor);
	}

	/// If `requested` falls below the sender's retained floor, return the
	/// squelch list (just the floor itself here — a full implementation
	/// would list every invalid id the NACK's repair request named).
	pub fn check_squelch(&self, requested: ObjectId) -> Option<ObjectId> {
		use crate::wire::SerialId;
		let floor = self.squelch_floor?;
		requested.lt(floor).then_some(floor)
	}
}
