//! The session actor (§4.6): wires [`Session`]'s pure protocol state to
//! socket I/O and the timer wheel, in the style of
//! `wireguard::Wireguard`'s actor wrapper around `Interface`/`Peer`
//! (`examples/dspeyrer-net/wireguard/src/lib.rs`) — `init` builds the
//! socket and forwards its reads back into the actor via `fwd_to!`,
//! dispatch methods route by message type, and `stakker`'s `timer_max!`
//! reschedules each recurring timer from inside its own handler.
//!
//! This wires inbound NORM_INFO/NORM_DATA ingestion into a sender's
//! `rx_objects` table via [`Object::write_segment`], NORM_NACK/ACK/CMD
//! dispatch, a paced tx scheduler driven by [`Session::tx_object_handles`]
//! and [`Object::next_sender_msg`], and the repair/flush/activity sweeps
//! of the six-item timer wheel (§4.6).

use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use log::{debug, warn};
use rand::Rng;
use runtime::socket::Config as SocketConfig;
use runtime::{socket, Datagram, Io};
use stakker::{fwd_to, timer_max, MaxTimerKey, CX};
use utils::bytes;
use utils::error::*;

use crate::codec::XorCodec;
use crate::config::{Config, FtiMode};
use crate::event::{Event, EventKind, EventQueue};
use crate::message::{AckMessage, AckType, CmdBody, CmdMessage, DataMessage, NackMessage};
use crate::object::{EvictionPolicy, Object, Payload, SenderMsg};
use crate::sender_node::SenderKey;
use crate::session::{CcReport, Session};
use crate::wire::ext::{AppAck, CcFeedback, Fti};
use crate::wire::fec::FecPayloadId;
use crate::wire::header::{quantize_grtt, unquantize_grtt, CommonHeader, MsgType, COMMON_HEADER_LEN};
use crate::wire::object::ObjectFlags;
use crate::wire::{BlockId, InstanceId, NodeId, ObjectId};

/// How often [`NormNode::sweep_activity`] checks for senders that have
/// gone quiet and re-evaluates the tx cache bounds.
const ACTIVITY_INTERVAL: Duration = Duration::from_secs(1);

/// How often [`NormNode::check_repairs`] re-scans tracked remote
/// senders' rx objects for outstanding NACK-worthy gaps.
const REPAIR_CHECK_INTERVAL: Duration = Duration::from_millis(200);

/// How often [`NormNode::sweep_flush`] checks for tx objects that have
/// finished sending and still need a FLUSH announced.
const FLUSH_CHECK_INTERVAL: Duration = Duration::from_millis(200);

/// How often the sender solicits CC feedback via CMD(CC) while it has
/// outstanding tx traffic.
const PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// The width in bits `RepairItem`/`FecPayloadId` comparisons use for a
/// given `fec_id`/`fec_field_size` pair, mirroring the widths
/// `FecPayloadId::decode` assigns for the same schemes.
fn block_id_width(fec_id: u8, fec_field_size: u8) -> u32 {
	match (fec_id, fec_field_size) {
		(2, 16) => 16,
		(129, 16) => 32,
		_ => 24,
	}
}

/// A running NORM session: socket I/O, the timer wheel, and the
/// protocol/event-plane state in [`Session`].
pub struct NormNode {
	session: Session,
	io: Io<UdpSocket>,
	/// Default destination for outgoing traffic (the multicast group for
	/// a sender, or the sender's unicast address for feedback).
	dest: SocketAddr,
	instance_id: InstanceId,
	events: EventQueue,
	codec: XorCodec,
	tx_sequence: u16,
	flushed: std::collections::HashSet<u16>,
	activity_timer: MaxTimerKey,
	tx_timer: MaxTimerKey,
	repair_timer: MaxTimerKey,
	flush_timer: MaxTimerKey,
	probe_timer: MaxTimerKey,
}

impl NormNode {
	pub fn init(cx: CX![], config: Config, local_node: NodeId, dest: SocketAddr, socket_cfg: SocketConfig, event_capacity: usize) -> Option<Self> {
		let session = Session::new(config, local_node).ok_or(|_| warn!("Rejected an invalid session configuration"))?;

		let socket = socket::open(&socket_cfg).ok_or(|err| warn!("Failed to open session socket: {err}"))?;

		let read_fwd = fwd_to!([cx], read() as (Datagram));
		let io = Io::new(socket, read_fwd);

		let instance_id = InstanceId(rand::thread_rng().gen());

		let mut node = Self {
			session,
			io,
			dest,
			instance_id,
			events: EventQueue::new(event_capacity),
			codec: XorCodec,
			tx_sequence: 0,
			flushed: Default::default(),
			activity_timer: MaxTimerKey::default(),
			tx_timer: MaxTimerKey::default(),
			repair_timer: MaxTimerKey::default(),
			flush_timer: MaxTimerKey::default(),
			probe_timer: MaxTimerKey::default(),
		};

		node.reset_activity_timer(cx);
		node.pump_tx(cx);
		node.check_repairs(cx);
		node.sweep_flush(cx);
		node.send_probe(cx);

		Some(node)
	}

	pub fn session(&self) -> &Session {
		&self.session
	}

	pub fn session_mut(&mut self) -> &mut Session {
		&mut self.session
	}

	pub fn events_mut(&mut self) -> &mut EventQueue {
		&mut self.events
	}

	pub fn instance_id(&self) -> InstanceId {
		self.instance_id
	}

	fn next_sequence(&mut self) -> u16 {
		let seq = self.tx_sequence;
		self.tx_sequence = self.tx_sequence.wrapping_add(1);
		seq
	}

	/// Encode and transmit a fully-formed data message to `to` (or the
	/// session's default destination if `to` is `None`).
	pub fn send(&mut self, to: Option<SocketAddr>, msg: &DataMessage) -> Result {
		let Some(encoded) = msg.encode() else {
			warn!("Refused to send a message with an unsupported FEC scheme");
			return Err(());
		};

		self.send_bytes(to.unwrap_or(self.dest), &encoded)?;
		self.events.push(Event::new(EventKind::TxObjectSent));
		Ok(())
	}

	fn send_bytes(&mut self, to: SocketAddr, bytes: &[u8]) -> Result {
		self.io.write(to, |cursor| {
			cursor.push(bytes);
		})
	}

	fn read(&mut self, cx: CX![], dg: Datagram) {
		let buf = &dg.buf[..];

		if buf.len() < COMMON_HEADER_LEN {
			debug!("Dropped a datagram shorter than the common header from {}", dg.from);
			return;
		}

		let common: &CommonHeader = bytes::cast(&buf[0..COMMON_HEADER_LEN]);

		match common.msg_type() {
			Some(MsgType::Info) | Some(MsgType::Data) => self.handle_data(cx, dg.from, buf),
			Some(MsgType::Nack) => self.handle_nack(cx, dg.from, buf),
			Some(MsgType::Ack) => self.handle_ack(cx, dg.from, buf),
			Some(MsgType::Cmd) => self.handle_cmd(cx, dg.from, buf),
			Some(other) => debug!("Received a {other:?} message from {} — dispatch for this type isn't wired up yet", dg.from),
			None => warn!("Received a message with an unrecognized type from {}", dg.from),
		}
	}

	fn handle_data(&mut self, _cx: CX![], from: SocketAddr, buf: &[u8]) {
		let Some(msg) = DataMessage::decode(buf, self.session.config.fec_field_size) else {
			debug!("Failed to decode a DATA/INFO message from {from}");
			return;
		};

		let key = SenderKey { node_id: msg.source_id, instance_id: InstanceId(msg.instance_id), src: from };
		let now = Instant::now();
		let segment_pool_capacity = self.session.config.segment_pool_capacity;
		let block_pool_capacity = self.session.config.block_pool_capacity;

		let is_new = self.session.sender_by_key(&key).is_none();
		let handle = self.session.sender_or_insert(key, now);

		let Some(node) = self.session.sender_mut(handle) else { return };
		node.touch(now);
		node.grtt = unquantize_grtt(msg.grtt_quantized);

		if is_new {
			self.events.push(Event::new(EventKind::RemoteSenderNew).with_sender(handle));
		}

		if !node.accepts_object(msg.object_id) {
			return;
		}

		let object_handle = match node.object_handle(msg.object_id) {
			Some(h) => h,
			None => {
				let Some(fti) = msg.fti else {
					debug!("Dropped the first segment of object {:?} from {from} without an FTI to size it", msg.object_id);
					return;
				};
				let object = Object::open(msg.object_id, Payload::Data { buf: Vec::new() }, fti.object_size, fti.segment_size, fti.num_data, fti.num_parity, None, segment_pool_capacity, block_pool_capacity);
				let h = node.insert_object(object);
				self.events.push(Event::new(EventKind::RxObjectNew).with_sender(handle).with_object(h));
				h
			}
		};

		if msg.flags.contains(ObjectFlags::INFO) {
			if let Some(object) = node.object_mut(object_handle) {
				object.clear_pending_info();
			}
			self.events.push(Event::new(EventKind::RxObjectInfo).with_sender(handle).with_object(object_handle));
			return;
		}

		let policy = EvictionPolicy::Newest;
		let wrote = node.object_mut(object_handle).is_some_and(|object| object.write_segment(msg.fec.block_id, msg.fec.symbol_id, &msg.payload, &self.codec, policy));

		if !wrote {
			return;
		}

		let completed = node.object(object_handle).is_some_and(|object| !object.needs_receiver_repair());

		self.events.push(Event::new(EventKind::RxObjectUpdated).with_sender(handle).with_object(object_handle));
		if completed {
			self.events.push(Event::new(EventKind::RxObjectCompleted).with_sender(handle).with_object(object_handle));
		}
	}

	fn handle_nack(&mut self, _cx: CX![], from: SocketAddr, buf: &[u8]) {
		let Some(msg) = NackMessage::decode(buf) else {
			debug!("Failed to decode a NACK message from {from}");
			return;
		};

		if msg.server_id != self.session.local_node {
			return;
		}

		if let Some(cc) = msg.cc_feedback {
			// No CLR/PLR election: every receiver that reports feedback is
			// treated as rate-limiting, so `Session::worst_loss` sees it.
			self.session.record_cc_report(msg.source_id, CcReport { rtt: unquantize_grtt(cc.rtt_quantized), loss: cc.loss_quantized as f64 / 65535.0, is_clr: true, is_plr: false });
		}

		for request in &msg.requests {
			let Some(first) = request.items.first() else { continue };
			let Some(handle) = self.session.tx_object_handle(first.object_id) else { continue };
			if let Some(object) = self.session.tx_object_mut(handle) {
				object.apply_repair_request(request);
			}
		}

		if !msg.requests.is_empty() {
			self.events.push(Event::new(EventKind::TxQueueVacancy));
		}
	}

	fn handle_ack(&mut self, _cx: CX![], from: SocketAddr, buf: &[u8]) {
		let Some(msg) = AckMessage::decode(buf) else {
			debug!("Failed to decode an ACK message from {from}");
			return;
		};

		if msg.server_id != self.session.local_node {
			return;
		}

		if let Some(cc) = msg.cc_feedback {
			self.session.record_cc_report(msg.source_id, CcReport { rtt: unquantize_grtt(cc.rtt_quantized), loss: cc.loss_quantized as f64 / 65535.0, is_clr: true, is_plr: false });
		}

		if msg.ack_type == AckType::Watermark {
			if let Some(wm) = self.session.watermark_mut() {
				if wm.object_id == msg.object_id {
					wm.record(msg.source_id, crate::session::AckStatus::Success);
				}
			}
		}

		self.events.push(Event::new(EventKind::AckingNodeNew));
	}

	fn handle_cmd(&mut self, _cx: CX![], from: SocketAddr, buf: &[u8]) {
		let Some(msg) = CmdMessage::decode(buf) else {
			debug!("Failed to decode a CMD message from {from}");
			return;
		};

		self.events.push(Event::new(EventKind::RxCmdNew));

		let key = SenderKey { node_id: msg.source_id, instance_id: InstanceId(msg.instance_id), src: from };

		match &msg.body {
			CmdBody::Flush { object_id, .. } => debug!("Received FLUSH for object {object_id:?} from {from}"),
			CmdBody::Eot => debug!("Received EOT from {from}"),
			CmdBody::Squelch { sync_id, invalid } => {
				if let Some(handle) = self.session.sender_by_key(&key) {
					if let Some(sender) = self.session.sender_mut(handle) {
						for id in invalid {
							sender.remove_object(*id);
							sender.forget_object(id.0);
						}
					}
				}
				debug!("Received SQUELCH (floor {sync_id:?}) from {from}");
			}
			CmdBody::Cc { cc_sequence, .. } => {
				let Some(handle) = self.session.sender_by_key(&key) else { return };
				let Some(sender) = self.session.sender(handle) else { return };
				let feedback = CcFeedback { cc_sequence: *cc_sequence, ecn_echo: false, rtt_quantized: quantize_grtt(sender.grtt), loss_quantized: (sender.loss.loss_fraction() * 65535.0).min(65535.0) as u16, rate_quantized: 0 };
				let ack = self.build_ack(&msg, AckType::RttOnly, ObjectId(0), Some(feedback), None);
				if let Some(bytes) = ack {
					let _ = self.send_bytes(from, &bytes.encode());
				}
			}
			CmdBody::RepairAdv { .. } => debug!("Received REPAIR_ADV from {from}"),
			CmdBody::AckReq { ack_type, object_id } => {
				let Some(kind) = AckType::from_u8(*ack_type) else { return };
				if let Some(ack) = self.build_ack(&msg, kind, *object_id, None, None) {
					let _ = self.send_bytes(from, &ack.encode());
				}
			}
			CmdBody::Application { .. } => {}
		}
	}

	fn build_ack(&mut self, cmd: &CmdMessage, ack_type: AckType, object_id: ObjectId, cc_feedback: Option<CcFeedback>, app_ack: Option<AppAck>) -> Option<AckMessage> {
		let sequence = self.next_sequence();
		Some(AckMessage {
			sequence,
			source_id: self.session.local_node,
			server_id: cmd.source_id,
			instance_id: cmd.instance_id,
			grtt_quantized: cmd.grtt_quantized,
			backoff_factor: cmd.backoff_factor,
			group_size: cmd.group_size,
			ack_type,
			object_id,
			cc_feedback,
			app_ack,
		})
	}

	/// §4.6 timer-wheel item: walk tx objects in ascending object-id
	/// order and send the first pending INFO/DATA segment, pacing the
	/// next call by [`Session::pacing_interval`]. Mirrors
	/// `NormSession::TxQueue` driving `NormObject::NextSenderMsg`
	/// segment by segment rather than draining a whole object at once,
	/// so every tx object gets a fair share of the send rate.
	fn pump_tx(&mut self, cx: CX![]) {
		let mut sent = None;

		for handle in self.session.tx_object_handles().collect::<Vec<_>>() {
			let Some(object) = self.session.tx_object_mut(handle) else { continue };
			let is_stream = object.stream().is_some();
			let size = object.size();
			let info = object.info().map(|b| b.to_vec());
			let object_id = object.id;

			if let Some(msg) = object.next_sender_msg(&self.codec) {
				sent = Some((object_id, is_stream, size, info, msg));
				break;
			}
		}

		let interval = match sent {
			Some((object_id, is_stream, size, info, sender_msg)) => {
				let data_msg = self.build_data_message(object_id, is_stream, size, info, sender_msg);
				let payload_len = data_msg.payload.len().max(1);
				if self.send(None, &data_msg).is_err() {
					self.events.push(Event::new(EventKind::SendError));
				}
				self.session.pacing_interval(payload_len)
			}
			None => ACTIVITY_INTERVAL,
		};

		timer_max!(&mut self.tx_timer, cx.now() + interval.max(Duration::from_millis(1)), [cx], pump_tx());
	}

	fn build_data_message(&mut self, object_id: ObjectId, is_stream: bool, object_size: u64, info: Option<Vec<u8>>, msg: SenderMsg) -> DataMessage {
		let sequence = self.next_sequence();

		let mut flags = ObjectFlags::empty();
		if is_stream {
			flags |= ObjectFlags::STREAM;
		}

		let (fec, payload) = match msg {
			SenderMsg::Info => {
				flags |= ObjectFlags::INFO;
				(FecPayloadId { block_id: BlockId(0), block_len: None, symbol_id: 0, block_id_width: block_id_width(self.session.config.fec_id, self.session.config.fec_field_size) }, info.unwrap_or_default())
			}
			SenderMsg::Data { block_id, sid, payload } => (FecPayloadId { block_id, block_len: None, symbol_id: sid, block_id_width: block_id_width(self.session.config.fec_id, self.session.config.fec_field_size) }, payload),
		};

		let cfg = &self.session.config;
		let attach_fti = matches!(cfg.fti_mode, FtiMode::Always) || (matches!(cfg.fti_mode, FtiMode::Info) && flags.contains(ObjectFlags::INFO));
		let fti = attach_fti.then(|| Fti { object_size, segment_size: cfg.segment_size, num_data: cfg.num_data, num_parity: cfg.num_parity, fec_field_size: cfg.fec_field_size, fec_group_size: 1 });

		DataMessage {
			sequence,
			source_id: self.session.local_node,
			instance_id: self.instance_id.0,
			grtt_quantized: quantize_grtt(self.session.grtt()),
			backoff_factor: cfg.backoff_factor as u8,
			group_size: cfg.group_size.min(15) as u8,
			flags,
			object_id,
			fec_id: cfg.fec_id,
			fec_field_size: cfg.fec_field_size,
			fec,
			fti,
			payload,
		}
	}

	/// §4.6 timer-wheel item: for every tracked remote sender, check
	/// each rx object's pending/repair state and, once a backoff
	/// expires, emit one NACK naming every object of that sender with
	/// outstanding repair work. Mirrors `NormSenderNode::UpdateNackingProcess`.
	fn check_repairs(&mut self, cx: CX![]) {
		let now = Instant::now();
		let width = block_id_width(self.session.config.fec_id, self.session.config.fec_field_size);
		let fec_id = self.session.config.fec_id;
		let fec_field_size = self.session.config.fec_field_size;
		let mut rng = rand::thread_rng();

		for sender_handle in self.session.sender_handles().collect::<Vec<_>>() {
			let Some(sender) = self.session.sender_mut(sender_handle) else { continue };

			let object_ids: Vec<ObjectId> = sender.rx_object_ids().collect();
			let mut items = Vec::new();

			for object_id in object_ids {
				let Some(object_handle) = sender.object_handle(object_id) else { continue };
				let needs = sender.object(object_handle).is_some_and(Object::needs_receiver_repair);

				if !sender.receiver_repair_check(&mut rng, now, object_id.0, needs) {
					continue;
				}

				if let Some(object) = sender.object(object_handle) {
					object.append_repair_request(&mut items, width);
				}
			}

			if items.is_empty() {
				continue;
			}

			let server_id = sender.key.node_id;
			let instance_id = sender.key.instance_id.0;
			let grtt = sender.grtt;
			let backoff_factor = sender.backoff_factor as u8;
			let to = sender.key.src;

			let nack = NackMessage {
				sequence: self.next_sequence(),
				source_id: self.session.local_node,
				server_id,
				instance_id,
				grtt_quantized: quantize_grtt(grtt),
				backoff_factor,
				group_size: self.session.config.group_size.min(15) as u8,
				fec_id,
				fec_field_size,
				cc_feedback: None,
				requests: vec![crate::wire::repair::RepairRequest { form: crate::wire::repair::RepairForm::Ranges, flags: crate::wire::repair::flag::SEGMENT, items }],
			};

			if let Some(bytes) = nack.encode() {
				let _ = self.send_bytes(to, &bytes);
			}
		}

		timer_max!(&mut self.repair_timer, cx.now() + REPAIR_CHECK_INTERVAL, [cx], check_repairs());
	}

	/// §4.6 timer-wheel item: announce a FLUSH once for each tx object
	/// that has finished sending and hasn't been announced yet.
	fn sweep_flush(&mut self, cx: CX![]) {
		let fec_id = self.session.config.fec_id;
		let fec_field_size = self.session.config.fec_field_size;
		let width = block_id_width(fec_id, fec_field_size);

		let done: Vec<(ObjectId, BlockId)> = self
			.session
			.tx_object_handles()
			.filter_map(|h| self.session.tx_object(h))
			.filter(|o| o.is_tx_complete() && !self.flushed.contains(&o.id.0))
			.map(|o| (o.id, o.final_block_id()))
			.collect();

		for (object_id, block_id) in done {
			self.flushed.insert(object_id.0);

			let cmd = CmdMessage {
				sequence: self.next_sequence(),
				source_id: self.session.local_node,
				instance_id: self.instance_id.0,
				grtt_quantized: quantize_grtt(self.session.grtt()),
				backoff_factor: self.session.config.backoff_factor as u8,
				group_size: self.session.config.group_size.min(15) as u8,
				fec_id,
				fec_field_size,
				body: CmdBody::Flush { object_id, fec: FecPayloadId { block_id, block_len: None, symbol_id: 0, block_id_width: width } },
			};

			if let Some(bytes) = cmd.encode() {
				if self.send_bytes(self.dest, &bytes).is_ok() {
					self.events.push(Event::new(EventKind::TxFlushCompleted));
				}
			}
		}

		timer_max!(&mut self.flush_timer, cx.now() + FLUSH_CHECK_INTERVAL, [cx], sweep_flush());
	}

	/// §4.6 timer-wheel item: solicit CC feedback from receivers by
	/// periodically broadcasting a CMD(CC) naming the current GRTT/rate,
	/// but only while there's outstanding tx traffic to pace.
	fn send_probe(&mut self, cx: CX![]) {
		if self.session.tx_object_count() > 0 {
			let cmd = CmdMessage {
				sequence: self.next_sequence(),
				source_id: self.session.local_node,
				instance_id: self.instance_id.0,
				grtt_quantized: quantize_grtt(self.session.grtt()),
				backoff_factor: self.session.config.backoff_factor as u8,
				group_size: self.session.config.group_size.min(15) as u8,
				fec_id: self.session.config.fec_id,
				fec_field_size: self.session.config.fec_field_size,
				body: CmdBody::Cc { cc_sequence: 0, send_time_sec: 0, send_time_usec: 0, rate_quantized: crate::wire::ext::quantize_rate(self.session.tx_rate()), reports: Vec::new() },
			};

			if let Some(bytes) = cmd.encode() {
				let _ = self.send_bytes(self.dest, &bytes);
			}
		}

		timer_max!(&mut self.probe_timer, cx.now() + PROBE_INTERVAL, [cx], send_probe());
	}

	fn reset_activity_timer(&mut self, cx: CX![]) {
		timer_max!(&mut self.activity_timer, cx.now() + ACTIVITY_INTERVAL, [cx], sweep_activity());
	}

	fn sweep_activity(&mut self, cx: CX![]) {
		for _key in self.session.purge_inactive_senders() {
			self.events.push(Event::new(EventKind::RemoteSenderInactive));
		}

		for _object_id in self.session.purge_tx_cache() {
			self.events.push(Event::new(EventKind::TxObjectPurged));
		}

		self.reset_activity_timer(cx);
	}
}
