//! Receive-side remote-sender record (§4.5): sync policy, per-object
//! NACK state, CC feedback loss-event estimation, watermark ACK
//! tracking.
//!
//! Grounded on `original_source/include/normNode.h`'s `NormSenderNode`
//! (identity, sync policy, nacking-mode default) and
//! `NormLossEstimator2` (the loss-event history used to derive the CC
//! feedback loss fraction). Keyed by `(nodeId, instanceId, srcAddr,
//! srcPort)` per the Open Question decision in SPEC_FULL.md §9.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use collections::arena::{Arena, Handle};
use collections::fastmap::FastMap;
use rand::Rng;

use crate::config::{NackingMode, SyncPolicy};
use crate::object::Object;
use crate::wire::{InstanceId, NodeId, ObjectId, SerialId};

/// Identifies a specific incarnation of a remote sender. `srcAddr`/
/// `srcPort` disambiguate senders sharing a `NodeId` behind NAT or
/// multihoming, `instanceId` disambiguates reincarnations of the same
/// sender identity (a process restart).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SenderKey {
	pub node_id: NodeId,
	pub instance_id: InstanceId,
	pub src: SocketAddr,
}

/// A weighted loss-interval history, simplified from
/// `NormLossEstimator2`'s 8-interval discounted-average scheme to an
/// EWMA over inter-loss-event sequence gaps. Feeds the TFRC-style rate
/// equation in `norm::session`.
pub struct LossEstimator {
	last_seq: Option<u16>,
	last_loss_seq: Option<u16>,
	loss_fraction: f64,
	ecn_enabled: bool,
	ecn_confirmed: bool,
	first_ecn_at: Option<Instant>,
}

impl Default for LossEstimator {
	fn default() -> Self {
		Self { last_seq: None, last_loss_seq: None, loss_fraction: 0.0, ecn_enabled: false, ecn_confirmed: false, first_ecn_at: None }
	}
}

impl LossEstimator {
	pub fn new(ecn_enabled: bool) -> Self {
		Self { ecn_enabled, ..Default::default() }
	}

	/// Feed a newly observed sequence number. Returns `true` if this
	/// update detected a gap (a loss event).
	pub fn observe_sequence(&mut self, seq: u16) -> bool {
		let gap = match self.last_seq {
			Some(prev) => seq.wrapping_sub(prev).wrapping_sub(1),
			None => 0,
		};
		self.last_seq = Some(seq);

		if gap == 0 {
			return false;
		}

		let interval = match self.last_loss_seq {
			Some(prev) => seq.wrapping_sub(prev) as f64,
			None => 16.0,
		};
		self.last_loss_seq = Some(seq);

		// EWMA over inter-loss-event interval length; a short interval
		// (frequent loss) raises the fraction, a long one decays it.
		let sample = 1.0 / interval.max(1.0);
		self.loss_fraction = 0.9 * self.loss_fraction + 0.1 * sample;

		true
	}

	/// Record an ECN-marked packet. Per the §9 Open Question decision,
	/// ECN only overrides the loss-based estimate once confirmed for a
	/// full RTT, to avoid a single spurious mark collapsing the rate.
	pub fn observe_ecn(&mut self, now: Instant, rtt: Duration) {
		if !self.ecn_enabled {
			return;
		}

		match self.first_ecn_at {
			None => self.first_ecn_at = Some(now),
			Some(first) if now.duration_since(first) >= rtt => self.ecn_confirmed = true,
			Some(_) => {}
		}
	}

	pub fn clear_ecn(&mut self) {
		self.first_ecn_at = None;
		self.ecn_confirmed = false;
	}

	/// The loss fraction to feed the CC rate equation: the ECN-derived
	/// event rate once confirmed, else the sequence-gap-derived one.
	pub fn loss_fraction(&self) -> f64 {
		if self.ecn_confirmed {
			self.loss_fraction.max(1.0 / 50.0)
		} else {
			self.loss_fraction
		}
	}
}

/// A pending NACK's randomized backoff state (§4.5, feedback
/// suppression via `U(0, backoff_factor * GRTT)`, grounded on
/// `normNode.h`'s `backoff_factor` and the session's group-size-scaled
/// suppression window).
pub struct NackBackoff {
	pub deadline: Instant,
	pub suppressed: bool,
}

impl NackBackoff {
	/// Arm a new randomized backoff in `[0, backoff_factor * grtt]`.
	pub fn arm(rng: &mut impl Rng, now: Instant, backoff_factor: f64, grtt: Duration) -> Self {
		let max = grtt.mul_f64(backoff_factor);
		let delay = max.mul_f64(rng.gen::<f64>());
		Self { deadline: now + delay, suppressed: false }
	}
}

/// Per-object nacking state the sender-node tracks independent of the
/// object itself, since an object may arrive after NACKing has already
/// begun (a repair request referencing an as-yet-unseen object id).
pub struct ObjectNackState {
	pub nacking_mode: NackingMode,
	pub backoff: Option<NackBackoff>,
}

/// The receive-side state for one remote sender incarnation.
pub struct SenderNode {
	pub key: SenderKey,
	pub sync_policy: SyncPolicy,
	pub default_nacking_mode: NackingMode,
	pub repair_boundary: crate::config::RepairBoundary,

	pub loss: LossEstimator,
	pub grtt: Duration,
	pub backoff_factor: f64,

	objects: FastMap<u16, ObjectNackState>,
	last_activity: Instant,
	robust_factor: u32,
	silence_count: u32,

	/// The earliest objectId this sender incarnation will accept,
	/// established from the first object observed and re-evaluated per
	/// `sync_policy` (`NormSenderNode::SetSyncPolicy`/`SyncToObject`).
	sync_floor: Option<ObjectId>,

	rx_objects: Arena<Object>,
	rx_index: std::collections::BTreeMap<u16, Handle<Object>>,
}

impl SenderNode {
	pub fn new(key: SenderKey, now: Instant, cfg: &crate::config::Config) -> Self {
		Self {
			key,
			sync_policy: cfg.sync_policy,
			default_nacking_mode: cfg.nacking_mode,
			repair_boundary: cfg.repair_boundary,
			loss: LossEstimator::new(cfg.ecn_enabled),
			grtt: Duration::from_millis(500),
			backoff_factor: cfg.backoff_factor,
			objects: Default::default(),
			last_activity: now,
			robust_factor: cfg.rx_robust_factor,
			silence_count: 0,
			sync_floor: None,
			rx_objects: Arena::new(),
			rx_index: Default::default(),
		}
	}

	pub fn touch(&mut self, now: Instant) {
		self.last_activity = now;
		self.silence_count = 0;
	}

	/// Mirrors `NormSenderNode::OnActivityTimeout`: each missed activity
	/// interval increments a counter; the node is considered dead after
	/// `rx_robust_factor` consecutive misses.
	pub fn activity_timeout(&mut self) -> bool {
		self.silence_count += 1;
		self.silence_count >= self.robust_factor
	}

	pub fn last_activity(&self) -> Instant {
		self.last_activity
	}

	pub fn object_state(&mut self, object_id: u16) -> &mut ObjectNackState {
		self.objects.entry(object_id).or_insert_with(|| ObjectNackState { nacking_mode: self.default_nacking_mode, backoff: None })
	}

	pub fn forget_object(&mut self, object_id: u16) {
		self.objects.remove(&object_id);
	}

	pub fn tracked_objects(&self) -> usize {
		self.objects.len()
	}

	pub fn sync_floor(&self) -> Option<ObjectId> {
		self.sync_floor
	}

	/// Decide whether a newly observed object id falls within what
	/// `sync_policy` permits this receiver to start receiving,
	/// initializing the floor from the first object id ever seen from
	/// this sender incarnation. Mirrors `NormSenderNode::SyncToObject`'s
	/// per-policy choice of how far back to accept.
	pub fn accepts_object(&mut self, object_id: ObjectId) -> bool {
		match self.sync_policy {
			SyncPolicy::All => true,
			SyncPolicy::Current => {
				let floor = *self.sync_floor.get_or_insert(object_id);
				floor.le(object_id)
			}
			SyncPolicy::Stream => {
				let floor = *self.sync_floor.get_or_insert_with(|| ObjectId(object_id.0.wrapping_sub(1)));
				floor.le(object_id)
			}
		}
	}

	/// Check whether `object_id` currently needs a NACK and, if no
	/// backoff is armed yet, start one. Returns `true` once an armed
	/// backoff's deadline has passed, i.e. the caller should emit the
	/// NACK now. Mirrors the arm/expire half of
	/// `NormSenderNode::UpdateNackingProcess`.
	pub fn receiver_repair_check(&mut self, rng: &mut impl Rng, now: Instant, object_id: u16, needs_repair: bool) -> bool {
		if !needs_repair {
			self.object_state(object_id).backoff = None;
			return false;
		}

		let grtt = self.grtt;
		let backoff_factor = self.backoff_factor;
		let state = self.object_state(object_id);

		match &state.backoff {
			Some(backoff) if backoff.suppressed => false,
			Some(backoff) => now >= backoff.deadline,
			None => {
				state.backoff = Some(NackBackoff::arm(rng, now, backoff_factor, grtt));
				false
			}
		}
	}

	pub fn object_handle(&self, object_id: ObjectId) -> Option<Handle<Object>> {
		self.rx_index.get(&object_id.0).copied()
	}

	pub fn insert_object(&mut self, object: Object) -> Handle<Object> {
		let id = object.id;
		let handle = self.rx_objects.insert(object);
		self.rx_index.insert(id.0, handle);
		handle
	}

	pub fn object(&self, handle: Handle<Object>) -> Option<&Object> {
		self.rx_objects.get(handle)
	}

	pub fn object_mut(&mut self, handle: Handle<Object>) -> Option<&mut Object> {
		self.rx_objects.get_mut(handle)
	}

	pub fn remove_object(&mut self, object_id: ObjectId) -> Option<Object> {
		let handle = self.rx_index.remove(&object_id.0)?;
		self.rx_objects.remove(handle)
	}

	pub fn rx_object_count(&self) -> usize {
		self.rx_objects.len()
	}

	/// Every tracked object id, in ascending order (`rx_index`'s
	/// `BTreeMap` order), for a repair sweep to scan without borrowing
	/// the object arena itself.
	pub fn rx_object_ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
		self.rx_index.keys().copied().map(ObjectId)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn loss_estimator_ignores_in_order_sequence() {
		let mut le = LossEstimator::default();
		for seq in 0..10 {
			assert!(!le.observe_sequence(seq));
		}
		assert_eq!(le.loss_fraction(), 0.0);
	}

	#[test]
	fn loss_estimator_detects_a_gap() {
		let mut le = LossEstimator::default();
		le.observe_sequence(0);
		le.observe_sequence(1);
		assert!(le.observe_sequence(5));
		assert!(le.loss_fraction() > 0.0);
	}

	#[test]
	fn ecn_only_overrides_after_a_full_rtt() {
		let mut le = LossEstimator::new(true);
		let t0 = Instant::now();
		let rtt = Duration::from_millis(100);

		le.observe_ecn(t0, rtt);
		assert_eq!(le.loss_fraction(), 0.0);

		le.observe_ecn(t0 + rtt + Duration::from_millis(1), rtt);
		assert!(le.loss_fraction() > 0.0);
	}

	#[test]
	fn activity_timeout_fires_after_robust_factor_misses() {
		let mut cfg = crate::config::Config::default();
		cfg.rx_robust_factor = 3;
		let key = SenderKey { node_id: NodeId(1), instance_id: InstanceId(1), src: "127.0.0.1:6000".parse().unwrap() };
		let mut node = SenderNode::new(key, Instant::now(), &cfg);

		assert!(!node.activity_timeout());
		assert!(!node.activity_timeout());
		assert!(node.activity_timeout());
	}

	fn node_with_policy(policy: SyncPolicy) -> SenderNode {
		let mut cfg = crate::config::Config::default();
		cfg.sync_policy = policy;
		let key = SenderKey { node_id: NodeId(1), instance_id: InstanceId(1), src: "127.0.0.1:6000".parse().unwrap() };
		SenderNode::new(key, Instant::now(), &cfg)
	}

	#[test]
	fn sync_policy_all_accepts_every_object() {
		let mut node = node_with_policy(SyncPolicy::All);
		assert!(node.accepts_object(ObjectId(500)));
		assert!(node.accepts_object(ObjectId(0)));
	}

	#[test]
	fn sync_policy_current_floors_at_the_first_object_seen() {
		let mut node = node_with_policy(SyncPolicy::Current);

		assert!(node.accepts_object(ObjectId(10)));
		assert_eq!(node.sync_floor(), Some(ObjectId(10)));
		assert!(!node.accepts_object(ObjectId(9)));
		assert!(node.accepts_object(ObjectId(11)));
	}

	#[test]
	fn sync_policy_stream_rewinds_one_object_from_the_first_seen() {
		let mut node = node_with_policy(SyncPolicy::Stream);

		assert!(node.accepts_object(ObjectId(10)));
		assert_eq!(node.sync_floor(), Some(ObjectId(9)));
		assert!(node.accepts_object(ObjectId(9)));
		assert!(!node.accepts_object(ObjectId(8)));
	}

	#[test]
	fn receiver_repair_check_arms_once_then_waits_for_the_deadline() {
		let mut node = node_with_policy(SyncPolicy::All);
		node.grtt = Duration::from_millis(10);
		let mut rng = rand::thread_rng();
		let now = Instant::now();

		assert!(!node.receiver_repair_check(&mut rng, now, 1, true));
		assert!(!node.receiver_repair_check(&mut rng, now, 1, true));

		let later = now + Duration::from_millis((node.backoff_factor * 10.0) as u64 + 1);
		assert!(node.receiver_repair_check(&mut rng, later, 1, true));
	}

	#[test]
	fn receiver_repair_check_clears_backoff_once_repair_is_no_longer_needed() {
		let mut node = node_with_policy(SyncPolicy::All);
		let mut rng = rand::thread_rng();
		let now = Instant::now();

		node.receiver_repair_check(&mut rng, now, 1, true);
		assert!(!node.receiver_repair_check(&mut rng, now, 1, false));
		assert!(node.object_state(1).backoff.is_none());
	}

	#[test]
	fn rx_objects_table_inserts_looks_up_and_removes() {
		let mut node = node_with_policy(SyncPolicy::All);
		let object = crate::object::Object::open(ObjectId(7), crate::object::Payload::Data { buf: vec![] }, 4, 4, 1, 0, None, 8, 4);

		let handle = node.insert_object(object);
		assert_eq!(node.rx_object_count(), 1);
		assert_eq!(node.object_handle(ObjectId(7)), Some(handle));
		assert!(node.object(handle).is_some());

		assert!(node.remove_object(ObjectId(7)).is_some());
		assert_eq!(node.rx_object_count(), 0);
		assert_eq!(node.object_handle(ObjectId(7)), None);
	}
}
