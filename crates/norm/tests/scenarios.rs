//! End-to-end loopback scenarios: two in-process [`Session`]s exchanging
//! wire-encoded [`DataMessage`]/[`NackMessage`] bytes directly, the same
//! way `NormNode` glues `Session`/`SenderNode`/`Object` together, but
//! without a running socket or `stakker` runtime. Exercises reliable
//! delivery of a complete object and NACK-driven repair of a dropped
//! segment end to end.

use std::net::SocketAddr;
use std::time::Instant;

use norm::codec::XorCodec;
use norm::config::Config;
use norm::object::{EvictionPolicy, Object, Payload, SenderMsg};
use norm::sender_node::SenderKey;
use norm::session::Session;
use norm::wire::ext::Fti;
use norm::wire::fec::FecPayloadId;
use norm::wire::header::{quantize_grtt, unquantize_grtt};
use norm::wire::object::ObjectFlags;
use norm::wire::repair::{flag, RepairForm, RepairRequest};
use norm::wire::{BlockId, InstanceId, NodeId, ObjectId};
use norm::message::{DataMessage, NackMessage};

fn addr(port: u16) -> SocketAddr {
	format!("127.0.0.1:{port}").parse().unwrap()
}

/// Build the DATA/INFO message for one `next_sender_msg` result, mirroring
/// `NormNode::build_data_message`'s field assembly without needing the
/// actor shell around it.
fn encode_sender_msg(sender: &Session, source_id: NodeId, instance_id: u16, object_id: ObjectId, object_size: u64, info: Option<&[u8]>, msg: SenderMsg) -> DataMessage {
	let cfg = &sender.config;

	let mut flags = ObjectFlags::empty();
	let (fec, payload) = match msg {
		SenderMsg::Info => {
			flags |= ObjectFlags::INFO;
			(FecPayloadId { block_id: BlockId(0), block_len: None, symbol_id: 0, block_id_width: 24 }, info.unwrap_or_default().to_vec())
		}
		SenderMsg::Data { block_id, sid, payload } => (FecPayloadId { block_id, block_len: None, symbol_id: sid, block_id_width: 24 }, payload),
	};

	let attach_fti = matches!(cfg.fti_mode, norm::config::FtiMode::Always) || (matches!(cfg.fti_mode, norm::config::FtiMode::Info) && flags.contains(ObjectFlags::INFO));
	let fti = attach_fti.then(|| Fti { object_size, segment_size: cfg.segment_size, num_data: cfg.num_data, num_parity: cfg.num_parity, fec_field_size: cfg.fec_field_size, fec_group_size: 1 });

	DataMessage {
		sequence: 0,
		source_id,
		instance_id,
		grtt_quantized: quantize_grtt(sender.grtt()),
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

/// Deliver one decoded `DataMessage` into the receiver session, creating
/// the sender/object records on first contact the way
/// `NormNode::handle_data` does.
fn deliver(receiver: &mut Session, codec: &XorCodec, key: SenderKey, now: Instant, msg: &DataMessage) {
	let node = receiver.sender_or_insert(key, now);
	let node = receiver.sender_mut(node).unwrap();
	node.touch(now);
	node.grtt = unquantize_grtt(msg.grtt_quantized);

	assert!(node.accepts_object(msg.object_id));

	let object_handle = match node.object_handle(msg.object_id) {
		Some(h) => h,
		None => {
			let fti = msg.fti.expect("first segment of a new object must carry FTI in this test setup");
			let object = Object::open(msg.object_id, Payload::Data { buf: Vec::new() }, fti.object_size, fti.segment_size, fti.num_data, fti.num_parity, None, 64, 16);
			node.insert_object(object)
		}
	};

	if msg.flags.contains(ObjectFlags::INFO) {
		node.object_mut(object_handle).unwrap().clear_pending_info();
		return;
	}

	let wrote = node.object_mut(object_handle).unwrap().write_segment(msg.fec.block_id, msg.fec.symbol_id, &msg.payload, codec, EvictionPolicy::Newest);
	assert!(wrote, "segment write should succeed against a freshly opened object");
}

#[test]
fn reliable_transfer_of_a_complete_object_needs_no_repair() {
	// No parity ever goes out here (`auto_parity` stays at its default of
	// 0), so a receiver-side block tracks pending bits purely over the
	// source symbols it's actually owed — otherwise the never-sent parity
	// range would keep `needs_receiver_repair` true forever.
	let config = Config { num_parity: 0, ..Config::default() };

	let sender_node = NodeId(1);
	let receiver_node = NodeId(2);
	let mut sender = Session::new(config.clone(), sender_node).expect("valid config");
	let mut receiver = Session::new(config, receiver_node).expect("valid config");
	let codec = XorCodec;

	let data: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
	let (object_id, tx_handle) = sender.open_tx_object(Payload::Data { buf: data.clone() }, data.len() as u64, Some(b"example.bin".to_vec()));
	let object_size = sender.tx_object(tx_handle).unwrap().size();
	let info = sender.tx_object(tx_handle).unwrap().info().map(|b| b.to_vec());

	let key = SenderKey { node_id: sender_node, instance_id: InstanceId(7), src: addr(6000) };
	let now = Instant::now();

	loop {
		let Some(msg) = sender.tx_object_mut(tx_handle).unwrap().next_sender_msg(&codec) else { break };
		let data_msg = encode_sender_msg(&sender, sender_node, 7, object_id, object_size, info.as_deref(), msg);
		deliver(&mut receiver, &codec, key, now, &data_msg);
	}

	assert!(sender.tx_object(tx_handle).unwrap().is_tx_complete());

	let sender_node_handle = receiver.sender_by_key(&key).unwrap();
	let remote = receiver.sender(sender_node_handle).unwrap();
	let object_handle = remote.object_handle(object_id).unwrap();
	let rx_object = remote.object(object_handle).unwrap();

	assert!(!rx_object.is_pending_info());
	assert!(!rx_object.needs_receiver_repair());
}

#[test]
fn a_dropped_segment_is_recovered_via_nack_and_retransmission() {
	// `info: None` means this object never sends an INFO segment, so FTI
	// must ride on every DATA message instead of the default INFO-only
	// policy for the receiver to be able to size the object at all.
	// `num_parity: 0` keeps the rx block's pending mask limited to the
	// source symbols actually in play, so a direct NACK-driven resend of
	// the dropped symbol (not FEC reconstruction) is what clears it.
	let config = Config { fti_mode: norm::config::FtiMode::Always, num_parity: 0, ..Config::default() };

	let sender_node = NodeId(10);
	let receiver_node = NodeId(20);
	let mut sender = Session::new(config.clone(), sender_node).expect("valid config");
	let mut receiver = Session::new(config, receiver_node).expect("valid config");
	let codec = XorCodec;

	let data: Vec<u8> = (0..3000u32).map(|i| (i * 3) as u8).collect();
	let (object_id, tx_handle) = sender.open_tx_object(Payload::Data { buf: data.clone() }, data.len() as u64, None);
	let object_size = sender.tx_object(tx_handle).unwrap().size();

	let key = SenderKey { node_id: sender_node, instance_id: InstanceId(3), src: addr(7000) };
	let now = Instant::now();

	let mut pending = Vec::new();
	while let Some(msg) = sender.tx_object_mut(tx_handle).unwrap().next_sender_msg(&codec) {
		pending.push(encode_sender_msg(&sender, sender_node, 3, object_id, object_size, None, msg));
	}
	assert!(sender.tx_object(tx_handle).unwrap().is_tx_complete());

	// Drop the first DATA segment (index 0 is the only non-INFO message
	// here since `info` was `None`), deliver the rest.
	let dropped = pending.remove(0);
	for msg in &pending {
		deliver(&mut receiver, &codec, key, now, msg);
	}

	let remote_handle = receiver.sender_by_key(&key).unwrap();
	let object_handle = receiver.sender(remote_handle).unwrap().object_handle(object_id).unwrap();
	assert!(receiver.sender(remote_handle).unwrap().object(object_handle).unwrap().needs_receiver_repair());

	// Build the repair request the way `check_repairs` does: arm once
	// (suppressed), then arm again past the deadline to actually emit.
	let remote = receiver.sender_mut(remote_handle).unwrap();
	let mut rng = rand::thread_rng();
	assert!(!remote.receiver_repair_check(&mut rng, now, object_id.0, true));
	let later = now + remote.grtt.mul_f64(remote.backoff_factor) + std::time::Duration::from_millis(1);
	assert!(remote.receiver_repair_check(&mut rng, later, object_id.0, true));

	let mut items = Vec::new();
	remote.object(object_handle).unwrap().append_repair_request(&mut items, 24);
	assert!(!items.is_empty());

	let request = RepairRequest { form: RepairForm::Ranges, flags: flag::SEGMENT, items };
	let nack = NackMessage {
		sequence: 1,
		source_id: receiver.local_node,
		server_id: sender_node,
		instance_id: 3,
		grtt_quantized: quantize_grtt(remote.grtt),
		backoff_factor: remote.backoff_factor as u8,
		group_size: 1,
		fec_id: sender.config.fec_id,
		fec_field_size: sender.config.fec_field_size,
		cc_feedback: None,
		requests: vec![request],
	};
	let encoded = nack.encode().expect("NACK with a supported FEC scheme must encode");
	let decoded = NackMessage::decode(&encoded).unwrap();
	assert_eq!(decoded.requests.len(), 1);

	// Sender applies the repair request, then re-sends the repaired symbol.
	sender.tx_object_mut(tx_handle).unwrap().apply_repair_request(&decoded.requests[0]);
	let repaired_msg = sender.tx_object_mut(tx_handle).unwrap().next_sender_msg(&codec).expect("a repair request should produce exactly one more symbol to send");
	let repaired = encode_sender_msg(&sender, sender_node, 3, object_id, object_size, None, repaired_msg);

	// Sanity: the retransmitted symbol is the one originally dropped.
	assert_eq!(repaired.fec.block_id, dropped.fec.block_id);
	assert_eq!(repaired.fec.symbol_id, dropped.fec.symbol_id);

	deliver(&mut receiver, &codec, key, now, &repaired);

	let remote = receiver.sender(remote_handle).unwrap();
	assert!(!remote.object(object_handle).unwrap().needs_receiver_repair());
}
