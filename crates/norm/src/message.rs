//! NORM_INFO / NORM_DATA message assembly (§4.2).
//!
//! Grounded on `normMessage.h`'s `NormObjectMsg`/`NormInfoMsg`/
//! `NormDataMsg` layout: common header, then object header, then any
//! header extensions (both counted in the common header's `hdrLen`),
//! then the FEC payload id, then payload bytes. `hdrLen` never includes
//! the FEC payload id — it's sized per `fec_id`/`fec_field_size` and
//! sits between the header and the payload.

use utils::bytes::{cast, cast_mut};

use crate::wire::ext::{AppAck, CcFeedback, ExtType, ExtensionIter, Fti, CC_FEEDBACK_TOTAL_LEN, FTI_TOTAL_LEN};
use crate::wire::fec::FecPayloadId;
use crate::wire::header::{CmdFlavor, CmdHeader, CommonHeader, MsgType, COMMON_HEADER_LEN};
use crate::wire::ids::{NodeId, ObjectId};
use crate::wire::object::{ObjectFlags, ObjectHeader, OBJECT_HEADER_LEN};
use crate::wire::repair::RepairRequest;

/// A fully assembled NORM_INFO or NORM_DATA protocol data unit.
#[derive(Clone, Debug, PartialEq)]
pub struct DataMessage {
	pub sequence: u16,
	pub source_id: NodeId,
	pub instance_id: u16,
	pub grtt_quantized: u8,
	pub backoff_factor: u8,
	pub group_size: u8,
	pub flags: ObjectFlags,
	pub object_id: ObjectId,
	pub fec_id: u8,
	pub fec_field_size: u8,
	pub fec: FecPayloadId,
	pub fti: Option<Fti>,
	pub payload: Vec<u8>,
}

impl DataMessage {
	/// NORM_INFO and NORM_DATA share every field; only the top-level
	/// message type differs, carried by whether the object header's
	/// `INFO` bit is set (`normMessage.h`'s `NormObjectMsg::FLAG_INFO`
	/// doubles as the discriminant for which message class this is).
	fn msg_type(&self) -> MsgType {
		if self.flags.contains(ObjectFlags::INFO) {
			MsgType::Info
		} else {
			MsgType::Data
		}
	}

	fn ext_len(&self) -> usize {
		if self.fti.is_some() {
			FTI_TOTAL_LEN
		} else {
			0
		}
	}

	/// Total wire length this message would encode to, or `None` if
	/// `fec_id`/`fec_field_size` isn't a supported combination.
	pub fn encoded_len(&self) -> Option<usize> {
		let fec_len = FecPayloadId::encoded_len(self.fec_id, self.fec_field_size)?;
		Some(COMMON_HEADER_LEN + OBJECT_HEADER_LEN + self.ext_len() + fec_len + self.payload.len())
	}

	pub fn encode(&self) -> Option<Vec<u8>> {
		let fec_len = FecPayloadId::encoded_len(self.fec_id, self.fec_field_size)?;
		let header_len = COMMON_HEADER_LEN + OBJECT_HEADER_LEN + self.ext_len();

		let mut buf = vec![0u8; header_len + fec_len + self.payload.len()];

		let mut common = CommonHeader::new(self.msg_type(), self.sequence, self.source_id);
		common.set_header_len(header_len);
		*cast_mut::<CommonHeader, _>(&mut buf[0..COMMON_HEADER_LEN]) = common;

		let object = ObjectHeader::new(self.instance_id, self.grtt_quantized, self.backoff_factor, self.group_size, self.flags, self.fec_id, self.object_id);
		*cast_mut::<ObjectHeader, _>(&mut buf[COMMON_HEADER_LEN..COMMON_HEADER_LEN + OBJECT_HEADER_LEN]) = object;

		if let Some(fti) = self.fti {
			fti.encode(&mut buf[COMMON_HEADER_LEN + OBJECT_HEADER_LEN..header_len]);
		}

		self.fec.encode(self.fec_id, self.fec_field_size, &mut buf[header_len..header_len + fec_len]);
		buf[header_len + fec_len..].copy_from_slice(&self.payload);

		Some(buf)
	}

	pub fn decode(buf: &[u8], fec_field_size: u8) -> Option<Self> {
		if buf.len() < COMMON_HEADER_LEN + OBJECT_HEADER_LEN {
			return None;
		}

		let common: &CommonHeader = cast(&buf[0..COMMON_HEADER_LEN]);
		let header_len = common.header_len();
		if header_len < COMMON_HEADER_LEN + OBJECT_HEADER_LEN || header_len > buf.len() {
			return None;
		}

		let object: &ObjectHeader = cast(&buf[COMMON_HEADER_LEN..COMMON_HEADER_LEN + OBJECT_HEADER_LEN]);
		let fec_id = object.fec_id();

		let fti = if common.has_extensions(COMMON_HEADER_LEN + OBJECT_HEADER_LEN) {
			ExtensionIter::new(&buf[COMMON_HEADER_LEN + OBJECT_HEADER_LEN..header_len]).find(|ext| ext.ext_type == ExtType::Fti).and_then(|ext| Fti::decode(ext.content))
		} else {
			None
		};

		let fec_len = FecPayloadId::encoded_len(fec_id, fec_field_size)?;
		if header_len + fec_len > buf.len() {
			return None;
		}
		let fec = FecPayloadId::decode(fec_id, fec_field_size, &buf[header_len..header_len + fec_len])?;

		Some(Self {
			sequence: common.sequence(),
			source_id: common.source_id(),
			instance_id: object.instance_id(),
			grtt_quantized: object.grtt_quantized(),
			backoff_factor: object.backoff_factor(),
			group_size: object.group_size(),
			flags: object.flags(),
			object_id: object.object_id(),
			fec_id,
			fec_field_size,
			fec,
			fti,
			payload: buf[header_len + fec_len..].to_vec(),
		})
	}
}

/// Walk a back-to-back sequence of wire-encoded [`RepairRequest`]s until
/// `buf` is exhausted, used for both a NACK's repair-request list and a
/// CMD(REPAIR_ADV)'s advertised-repair list.
fn decode_repair_requests(mut buf: &[u8], fec_id: u8, field_size: u8) -> Option<Vec<RepairRequest>> {
	let mut requests = Vec::new();
	while !buf.is_empty() {
		let req = RepairRequest::decode(fec_id, field_size, buf)?;
		let len = req.encoded_len(fec_id, field_size)?;
		requests.push(req);
		buf = buf.get(len..)?;
	}
	Some(requests)
}

fn encode_repair_requests(requests: &[RepairRequest], fec_id: u8, field_size: u8) -> Option<Vec<u8>> {
	let mut out = Vec::new();
	for req in requests {
		let len = req.encoded_len(fec_id, field_size)?;
		let mut chunk = vec![0u8; len];
		req.encode(fec_id, field_size, &mut chunk)?;
		out.extend_from_slice(&chunk);
	}
	Some(out)
}

fn repair_requests_len(requests: &[RepairRequest], fec_id: u8, field_size: u8) -> Option<usize> {
	requests.iter().try_fold(0usize, |acc, req| Some(acc + req.encoded_len(fec_id, field_size)?))
}

/// The fixed fields every NACK carries ahead of its optional CC-FEEDBACK
/// extension and repair-request list (`normMessage.h`'s `NormNackMsg`):
/// `serverId:32, instanceId:16, grtt:8, backoff/groupSize:8, fecId:8,
/// fecFieldSize:8, reserved:16`.
const NACK_BODY_LEN: usize = 12;

/// A NORM_NACK: feedback requesting retransmission of missing INFO/DATA,
/// with an optional embedded CC-FEEDBACK extension.
#[derive(Clone, Debug, PartialEq)]
pub struct NackMessage {
	pub sequence: u16,
	pub source_id: NodeId,
	pub server_id: NodeId,
	pub instance_id: u16,
	pub grtt_quantized: u8,
	pub backoff_factor: u8,
	pub group_size: u8,
	pub fec_id: u8,
	pub fec_field_size: u8,
	pub cc_feedback: Option<CcFeedback>,
	pub requests: Vec<RepairRequest>,
}

impl NackMessage {
	fn ext_len(&self) -> usize {
		if self.cc_feedback.is_some() {
			CC_FEEDBACK_TOTAL_LEN
		} else {
			0
		}
	}

	pub fn encoded_len(&self) -> Option<usize> {
		let header_len = COMMON_HEADER_LEN + NACK_BODY_LEN + self.ext_len();
		Some(header_len + repair_requests_len(&self.requests, self.fec_id, self.fec_field_size)?)
	}

	pub fn encode(&self) -> Option<Vec<u8>> {
		let header_len = COMMON_HEADER_LEN + NACK_BODY_LEN + self.ext_len();
		let requests_bytes = encode_repair_requests(&self.requests, self.fec_id, self.fec_field_size)?;

		let mut buf = vec![0u8; header_len + requests_bytes.len()];

		let mut common = CommonHeader::new(MsgType::Nack, self.sequence, self.source_id);
		common.set_header_len(header_len);
		*cast_mut::<CommonHeader, _>(&mut buf[0..COMMON_HEADER_LEN]) = common;

		let body = &mut buf[COMMON_HEADER_LEN..COMMON_HEADER_LEN + NACK_BODY_LEN];
		body[0..4].copy_from_slice(&self.server_id.0.to_be_bytes());
		body[4..6].copy_from_slice(&self.instance_id.to_be_bytes());
		body[6] = self.grtt_quantized;
		body[7] = (self.backoff_factor << 4) | (self.group_size & 0x0f);
		body[8] = self.fec_id;
		body[9] = self.fec_field_size;
		body[10..12].copy_from_slice(&[0, 0]);

		if let Some(cc) = self.cc_feedback {
			let ext_start = COMMON_HEADER_LEN + NACK_BODY_LEN;
			cc.encode(&mut buf[ext_start..ext_start + CC_FEEDBACK_TOTAL_LEN]);
		}

		buf[header_len..].copy_from_slice(&requests_bytes);

		Some(buf)
	}

	pub fn decode(buf: &[u8]) -> Option<Self> {
		if buf.len() < COMMON_HEADER_LEN + NACK_BODY_LEN {
			return None;
		}

		let common: &CommonHeader = cast(&buf[0..COMMON_HEADER_LEN]);
		if common.msg_type() != Some(MsgType::Nack) {
			return None;
		}

		let header_len = common.header_len();
		if header_len < COMMON_HEADER_LEN + NACK_BODY_LEN || header_len > buf.len() {
			return None;
		}

		let body = &buf[COMMON_HEADER_LEN..COMMON_HEADER_LEN + NACK_BODY_LEN];
		let server_id = NodeId(u32::from_be_bytes([body[0], body[1], body[2], body[3]]));
		let instance_id = u16::from_be_bytes([body[4], body[5]]);
		let grtt_quantized = body[6];
		let backoff_factor = body[7] >> 4;
		let group_size = body[7] & 0x0f;
		let fec_id = body[8];
		let fec_field_size = body[9];

		let ext_area = &buf[COMMON_HEADER_LEN + NACK_BODY_LEN..header_len];
		let cc_feedback = if !ext_area.is_empty() {
			ExtensionIter::new(ext_area).find(|e| e.ext_type == ExtType::CcFeedback).and_then(|e| CcFeedback::decode(e.content))
		} else {
			None
		};

		let requests = decode_repair_requests(&buf[header_len..], fec_id, fec_field_size)?;

		Some(Self {
			sequence: common.sequence(),
			source_id: common.source_id(),
			server_id,
			instance_id,
			grtt_quantized,
			backoff_factor,
			group_size,
			fec_id,
			fec_field_size,
			cc_feedback,
			requests,
		})
	}
}

/// §4.6's three ACK flavors: a watermark/flow-control ACK, an RTT-only
/// probe response, or an application-defined ACK (its payload carried in
/// the APP-ACK extension).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum AckType {
	Watermark = 1,
	RttOnly = 2,
	Application = 3,
}

impl AckType {
	pub fn from_u8(v: u8) -> Option<Self> {
		Some(match v {
			1 => Self::Watermark,
			2 => Self::RttOnly,
			3 => Self::Application,
			_ => return None,
		})
	}
}

/// Fixed fields ahead of an ACK's optional extensions (`NormAckMsg`):
/// `serverId:32, instanceId:16, grtt:8, backoff/groupSize:8, ackType:8,
/// reserved:8, objectId:16`.
const ACK_BODY_LEN: usize = 12;

/// A NORM_ACK: positive acknowledgment for a watermark, RTT probe, or
/// application-defined round.
#[derive(Clone, Debug, PartialEq)]
pub struct AckMessage {
	pub sequence: u16,
	pub source_id: NodeId,
	pub server_id: NodeId,
	pub instance_id: u16,
	pub grtt_quantized: u8,
	pub backoff_factor: u8,
	pub group_size: u8,
	pub ack_type: AckType,
	pub object_id: ObjectId,
	pub cc_feedback: Option<CcFeedback>,
	pub app_ack: Option<AppAck>,
}

impl AckMessage {
	fn ext_len(&self) -> usize {
		self.cc_feedback.map_or(0, |_| CC_FEEDBACK_TOTAL_LEN) + self.app_ack.as_ref().map_or(0, AppAck::encoded_len)
	}

	pub fn encoded_len(&self) -> usize {
		COMMON_HEADER_LEN + ACK_BODY_LEN + self.ext_len()
	}

	pub fn encode(&self) -> Vec<u8> {
		let header_len = self.encoded_len();
		let mut buf = vec![0u8; header_len];

		let mut common = CommonHeader::new(MsgType::Ack, self.sequence, self.source_id);
		common.set_header_len(header_len);
		*cast_mut::<CommonHeader, _>(&mut buf[0..COMMON_HEADER_LEN]) = common;

		let body = &mut buf[COMMON_HEADER_LEN..COMMON_HEADER_LEN + ACK_BODY_LEN];
		body[0..4].copy_from_slice(&self.server_id.0.to_be_bytes());
		body[4..6].copy_from_slice(&self.instance_id.to_be_bytes());
		body[6] = self.grtt_quantized;
		body[7] = (self.backoff_factor << 4) | (self.group_size & 0x0f);
		body[8] = self.ack_type as u8;
		body[9] = 0;
		body[10..12].copy_from_slice(&self.object_id.0.to_be_bytes());

		let mut offset = COMMON_HEADER_LEN + ACK_BODY_LEN;
		if let Some(cc) = self.cc_feedback {
			cc.encode(&mut buf[offset..offset + CC_FEEDBACK_TOTAL_LEN]);
			offset += CC_FEEDBACK_TOTAL_LEN;
		}
		if let Some(app) = &self.app_ack {
			app.encode(&mut buf[offset..offset + app.encoded_len()]);
		}

		buf
	}

	pub fn decode(buf: &[u8]) -> Option<Self> {
		if buf.len() < COMMON_HEADER_LEN + ACK_BODY_LEN {
			return None;
		}

		let common: &CommonHeader = cast(&buf[0..COMMON_HEADER_LEN]);
		if common.msg_type() != Some(MsgType::Ack) {
			return None;
		}

		let header_len = common.header_len();
		if header_len < COMMON_HEADER_LEN + ACK_BODY_LEN || header_len > buf.len() {
			return None;
		}

		let body = &buf[COMMON_HEADER_LEN..COMMON_HEADER_LEN + ACK_BODY_LEN];
		let server_id = NodeId(u32::from_be_bytes([body[0], body[1], body[2], body[3]]));
		let instance_id = u16::from_be_bytes([body[4], body[5]]);
		let grtt_quantized = body[6];
		let backoff_factor = body[7] >> 4;
		let group_size = body[7] & 0x0f;
		let ack_type = AckType::from_u8(body[8])?;
		let object_id = ObjectId(u16::from_be_bytes([body[10], body[11]]));

		let ext_area = &buf[COMMON_HEADER_LEN + ACK_BODY_LEN..header_len];
		let cc_feedback = ExtensionIter::new(ext_area).find(|e| e.ext_type == ExtType::CcFeedback).and_then(|e| CcFeedback::decode(e.content));
		let app_ack = ExtensionIter::new(ext_area).find(|e| e.ext_type == ExtType::AppAck).map(|e| AppAck::decode(e.content));

		Some(Self {
			sequence: common.sequence(),
			source_id: common.source_id(),
			server_id,
			instance_id,
			grtt_quantized,
			backoff_factor,
			group_size,
			ack_type,
			object_id,
			cc_feedback,
			app_ack,
		})
	}
}

/// One receiver's reported round-trip/loss/rate sample within a
/// CMD(CC)'s report list.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct CcReportEntry {
	pub node_id: NodeId,
	pub feedback: CcFeedback,
}

const CC_REPORT_ENTRY_LEN: usize = 10;

/// The seven CMD sub-message bodies (`NormCmdMsg::Flavor`, §4.2/§4.6).
#[derive(Clone, Debug, PartialEq)]
pub enum CmdBody {
	Flush { object_id: ObjectId, fec: FecPayloadId },
	Eot,
	Squelch { sync_id: ObjectId, invalid: Vec<ObjectId> },
	Cc { cc_sequence: u8, send_time_sec: u32, send_time_usec: u32, rate_quantized: u16, reports: Vec<CcReportEntry> },
	RepairAdv { requests: Vec<RepairRequest> },
	AckReq { ack_type: u8, object_id: ObjectId },
	Application { content: Vec<u8> },
}

impl CmdBody {
	pub fn flavor(&self) -> CmdFlavor {
		match self {
			Self::Flush { .. } => CmdFlavor::Flush,
			Self::Eot => CmdFlavor::Eot,
			Self::Squelch { .. } => CmdFlavor::Squelch,
			Self::Cc { .. } => CmdFlavor::Cc,
			Self::RepairAdv { .. } => CmdFlavor::RepairAdv,
			Self::AckReq { .. } => CmdFlavor::AckReq,
			Self::Application { .. } => CmdFlavor::Application,
		}
	}
}

fn encode_cmd_body(body: &CmdBody, fec_id: u8, fec_field_size: u8) -> Option<Vec<u8>> {
	Some(match body {
		CmdBody::Flush { object_id, fec } => {
			let fec_len = FecPayloadId::encoded_len(fec_id, fec_field_size)?;
			let mut out = vec![0u8; 2 + fec_len];
			out[0..2].copy_from_slice(&object_id.0.to_be_bytes());
			fec.encode(fec_id, fec_field_size, &mut out[2..]);
			out
		}
		CmdBody::Eot => Vec::new(),
		CmdBody::Squelch { sync_id, invalid } => {
			let mut out = vec![0u8; 4 + invalid.len() * 2];
			out[0..2].copy_from_slice(&sync_id.0.to_be_bytes());
			out[2..4].copy_from_slice(&(invalid.len() as u16).to_be_bytes());
			for (i, id) in invalid.iter().enumerate() {
				out[4 + i * 2..6 + i * 2].copy_from_slice(&id.0.to_be_bytes());
			}
			out
		}
		CmdBody::Cc { cc_sequence, send_time_sec, send_time_usec, rate_quantized, reports } => {
			let mut out = vec![0u8; 14 + reports.len() * CC_REPORT_ENTRY_LEN];
			out[0] = *cc_sequence;
			out[1] = 0;
			out[2..6].copy_from_slice(&send_time_sec.to_be_bytes());
			out[6..10].copy_from_slice(&send_time_usec.to_be_bytes());
			out[10..12].copy_from_slice(&rate_quantized.to_be_bytes());
			out[12..14].copy_from_slice(&(reports.len() as u16).to_be_bytes());
			for (i, report) in reports.iter().enumerate() {
				let base = 14 + i * CC_REPORT_ENTRY_LEN;
				out[base..base + 4].copy_from_slice(&report.node_id.0.to_be_bytes());
				out[base + 4] = report.feedback.rtt_quantized;
				out[base + 5] = if report.feedback.ecn_echo { 1 } else { 0 };
				out[base + 6..base + 8].copy_from_slice(&report.feedback.loss_quantized.to_be_bytes());
				out[base + 8..base + 10].copy_from_slice(&report.feedback.rate_quantized.to_be_bytes());
			}
			out
		}
		CmdBody::RepairAdv { requests } => encode_repair_requests(requests, fec_id, fec_field_size)?,
		CmdBody::AckReq { ack_type, object_id } => vec![*ack_type, 0, (object_id.0 >> 8) as u8, object_id.0 as u8],
		CmdBody::Application { content } => content.clone(),
	})
}

fn decode_cmd_body(flavor: CmdFlavor, fec_id: u8, fec_field_size: u8, buf: &[u8]) -> Option<CmdBody> {
	Some(match flavor {
		CmdFlavor::Flush => {
			let fec_len = FecPayloadId::encoded_len(fec_id, fec_field_size)?;
			if buf.len() < 2 + fec_len {
				return None;
			}
			let object_id = ObjectId(u16::from_be_bytes([buf[0], buf[1]]));
			let fec = FecPayloadId::decode(fec_id, fec_field_size, &buf[2..2 + fec_len])?;
			CmdBody::Flush { object_id, fec }
		}
		CmdFlavor::Eot => CmdBody::Eot,
		CmdFlavor::Squelch => {
			if buf.len() < 4 {
				return None;
			}
			let sync_id = ObjectId(u16::from_be_bytes([buf[0], buf[1]]));
			let count = u16::from_be_bytes([buf[2], buf[3]]) as usize;
			if buf.len() < 4 + count * 2 {
				return None;
			}
			let invalid = buf[4..4 + count * 2].chunks_exact(2).map(|c| ObjectId(u16::from_be_bytes([c[0], c[1]]))).collect();
			CmdBody::Squelch { sync_id, invalid }
		}
		CmdFlavor::Cc => {
			if buf.len() < 14 {
				return None;
			}
			let cc_sequence = buf[0];
			let send_time_sec = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);
			let send_time_usec = u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]);
			let rate_quantized = u16::from_be_bytes([buf[10], buf[11]]);
			let count = u16::from_be_bytes([buf[12], buf[13]]) as usize;
			if buf.len() < 14 + count * CC_REPORT_ENTRY_LEN {
				return None;
			}
			let reports = buf[14..14 + count * CC_REPORT_ENTRY_LEN]
				.chunks_exact(CC_REPORT_ENTRY_LEN)
				.map(|c| CcReportEntry {
					node_id: NodeId(u32::from_be_bytes([c[0], c[1], c[2], c[3]])),
					feedback: CcFeedback { cc_sequence, ecn_echo: c[5] != 0, rtt_quantized: c[4], loss_quantized: u16::from_be_bytes([c[6], c[7]]), rate_quantized: u16::from_be_bytes([c[8], c[9]]) },
				})
				.collect();
			CmdBody::Cc { cc_sequence, send_time_sec, send_time_usec, rate_quantized, reports }
		}
		CmdFlavor::RepairAdv => CmdBody::RepairAdv { requests: decode_repair_requests(buf, fec_id, fec_field_size)? },
		CmdFlavor::AckReq => {
			if buf.len() < 4 {
				return None;
			}
			CmdBody::AckReq { ack_type: buf[0], object_id: ObjectId(u16::from_be_bytes([buf[2], buf[3]])) }
		}
		CmdFlavor::Application => CmdBody::Application { content: buf.to_vec() },
	})
}

/// `CmdHeader`'s wire form (5 bytes) doesn't divide evenly into 4-byte
/// words, but [`CommonHeader::set_header_len`] requires one that does —
/// padded to the next word boundary with 3 reserved bytes, two of which
/// carry `fec_id`/`fec_field_size` (a CMD body's FEC payload ids need
/// them, and there's nowhere else word-aligned to put them).
const CMD_HEADER_AREA: usize = 8;

/// A NORM_CMD: one of seven sender-originated command sub-messages.
#[derive(Clone, Debug, PartialEq)]
pub struct CmdMessage {
	pub sequence: u16,
	pub source_id: NodeId,
	pub instance_id: u16,
	pub grtt_quantized: u8,
	pub backoff_factor: u8,
	pub group_size: u8,
	pub fec_id: u8,
	pub fec_field_size: u8,
	pub body: CmdBody,
}

impl CmdMessage {
	pub fn encode(&self) -> Option<Vec<u8>> {
		let header_len = COMMON_HEADER_LEN + CMD_HEADER_AREA;
		let body_bytes = encode_cmd_body(&self.body, self.fec_id, self.fec_field_size)?;

		let mut buf = vec![0u8; header_len + body_bytes.len()];

		let mut common = CommonHeader::new(MsgType::Cmd, self.sequence, self.source_id);
		common.set_header_len(header_len);
		*cast_mut::<CommonHeader, _>(&mut buf[0..COMMON_HEADER_LEN]) = common;

		let cmd_header = CmdHeader::new(self.instance_id, self.grtt_quantized, self.backoff_factor, self.group_size, self.body.flavor());
		let area = &mut buf[COMMON_HEADER_LEN..header_len];
		cmd_header.encode(area);
		area[5] = self.fec_id;
		area[6] = self.fec_field_size;
		area[7] = 0;

		buf[header_len..].copy_from_slice(&body_bytes);

		Some(buf)
	}

	pub fn decode(buf: &[u8]) -> Option<Self> {
		if buf.len() < COMMON_HEADER_LEN + CMD_HEADER_AREA {
			return None;
		}

		let common: &CommonHeader = cast(&buf[0..COMMON_HEADER_LEN]);
		if common.msg_type() != Some(MsgType::Cmd) {
			return None;
		}

		let header_len = common.header_len();
		if header_len < COMMON_HEADER_LEN + CMD_HEADER_AREA || header_len > buf.len() {
			return None;
		}

		let area = &buf[COMMON_HEADER_LEN..COMMON_HEADER_LEN + CMD_HEADER_AREA];
		let cmd_header = CmdHeader::decode(area)?;
		let fec_id = area[5];
		let fec_field_size = area[6];
		let flavor = cmd_header.flavor()?;

		let body = decode_cmd_body(flavor, fec_id, fec_field_size, &buf[header_len..])?;

		Some(Self {
			sequence: common.sequence(),
			source_id: common.source_id(),
			instance_id: cmd_header.instance_id(),
			grtt_quantized: cmd_header.grtt_quantized(),
			backoff_factor: cmd_header.backoff_factor(),
			group_size: cmd_header.group_size(),
			fec_id,
			fec_field_size,
			body,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample(fti: Option<Fti>, payload: &[u8]) -> DataMessage {
		DataMessage {
			sequence: 17,
			source_id: NodeId(0x1020_3040),
			instance_id: 99,
			grtt_quantized: 80,
			backoff_factor: 2,
			group_size: 5,
			flags: ObjectFlags::STREAM,
			object_id: ObjectId(4242),
			fec_id: 2,
			fec_field_size: 16,
			fec: FecPayloadId { block_id: crate::wire::ids::BlockId(7), block_len: None, symbol_id: 3, block_id_width: 16 },
			fti,
			payload: payload.to_vec(),
		}
	}

	#[test]
	fn data_message_round_trips_without_extensions() {
		let msg = sample(None, b"hello norm");

		let encoded = msg.encode().unwrap();
		assert_eq!(encoded.len(), msg.encoded_len().unwrap());

		let decoded = DataMessage::decode(&encoded, msg.fec_field_size).unwrap();
		assert_eq!(decoded, msg);
	}

	#[test]
	fn data_message_round_trips_with_fti_extension() {
		let fti = Fti { object_size: 9_000_000, segment_size: 1400, num_data: 64, num_parity: 16, fec_field_size: 8, fec_group_size: 1 };
		let msg = sample(Some(fti), b"leading info segment");

		let encoded = msg.encode().unwrap();
		let decoded = DataMessage::decode(&encoded, msg.fec_field_size).unwrap();

		assert_eq!(decoded.fti, Some(fti));
		assert_eq!(decoded.payload, msg.payload);
	}

	#[test]
	fn info_flag_selects_the_info_message_type() {
		let mut msg = sample(None, b"");
		msg.flags = ObjectFlags::INFO;

		let encoded = msg.encode().unwrap();
		let common: &CommonHeader = cast(&encoded[0..COMMON_HEADER_LEN]);
		assert_eq!(common.msg_type(), Some(MsgType::Info));
	}

	#[test]
	fn decode_rejects_a_truncated_buffer() {
		let msg = sample(None, b"payload");
		let mut encoded = msg.encode().unwrap();
		encoded.truncate(encoded.len() - 1);

		assert!(DataMessage::decode(&encoded, msg.fec_field_size).is_none());
	}

	#[test]
	fn unsupported_fec_scheme_fails_encode_cleanly() {
		let mut msg = sample(None, b"x");
		msg.fec_id = 200;
		assert!(msg.encode().is_none());
	}

	fn repair_item(object: u16, block: u32, symbol: u16) -> crate::wire::repair::RepairItem {
		crate::wire::repair::RepairItem { object_id: ObjectId(object), fec: FecPayloadId { block_id: crate::wire::ids::BlockId(block), block_len: None, symbol_id: symbol, block_id_width: 24 } }
	}

	#[test]
	fn nack_message_round_trips_without_cc_feedback() {
		let msg = NackMessage {
			sequence: 1,
			source_id: NodeId(1),
			server_id: NodeId(2),
			instance_id: 7,
			grtt_quantized: 10,
			backoff_factor: 4,
			group_size: 9,
			fec_id: 2,
			fec_field_size: 8,
			cc_feedback: None,
			requests: vec![crate::wire::repair::RepairRequest {
				form: crate::wire::repair::RepairForm::Items,
				flags: crate::wire::repair::flag::SEGMENT,
				items: vec![repair_item(5, 1, 2), repair_item(5, 1, 3)],
			}],
		};

		let encoded = msg.encode().unwrap();
		assert_eq!(encoded.len(), msg.encoded_len().unwrap());

		let decoded = NackMessage::decode(&encoded).unwrap();
		assert_eq!(decoded, msg);
	}

	#[test]
	fn nack_message_round_trips_with_cc_feedback_and_multiple_requests() {
		let msg = NackMessage {
			sequence: 2,
			source_id: NodeId(1),
			server_id: NodeId(2),
			instance_id: 7,
			grtt_quantized: 10,
			backoff_factor: 4,
			group_size: 9,
			fec_id: 2,
			fec_field_size: 8,
			cc_feedback: Some(CcFeedback { cc_sequence: 3, ecn_echo: true, rtt_quantized: 40, loss_quantized: 500, rate_quantized: 9000 }),
			requests: vec![
				crate::wire::repair::RepairRequest { form: crate::wire::repair::RepairForm::Items, flags: crate::wire::repair::flag::BLOCK, items: vec![repair_item(5, 1, 0)] },
				crate::wire::repair::RepairRequest { form: crate::wire::repair::RepairForm::Ranges, flags: crate::wire::repair::flag::SEGMENT, items: vec![repair_item(6, 0, 0), repair_item(6, 2, 0)] },
			],
		};

		let encoded = msg.encode().unwrap();
		let decoded = NackMessage::decode(&encoded).unwrap();
		assert_eq!(decoded, msg);
		assert_eq!(decoded.cc_feedback.unwrap().rate_quantized, 9000);
	}

	#[test]
	fn ack_message_round_trips_with_app_ack_and_no_cc_feedback() {
		let msg = AckMessage {
			sequence: 3,
			source_id: NodeId(1),
			server_id: NodeId(2),
			instance_id: 7,
			grtt_quantized: 5,
			backoff_factor: 0,
			group_size: 0,
			ack_type: AckType::Application,
			object_id: ObjectId(99),
			cc_feedback: None,
			app_ack: Some(AppAck { content: vec![9, 8, 7] }),
		};

		let encoded = msg.encode();
		assert_eq!(encoded.len(), msg.encoded_len());

		let decoded = AckMessage::decode(&encoded).unwrap();
		assert_eq!(decoded, msg);
	}

	#[test]
	fn ack_message_round_trips_with_both_extensions() {
		let msg = AckMessage {
			sequence: 4,
			source_id: NodeId(1),
			server_id: NodeId(2),
			instance_id: 7,
			grtt_quantized: 5,
			backoff_factor: 0,
			group_size: 0,
			ack_type: AckType::Watermark,
			object_id: ObjectId(12),
			cc_feedback: Some(CcFeedback { cc_sequence: 1, ecn_echo: false, rtt_quantized: 30, loss_quantized: 10, rate_quantized: 200 }),
			app_ack: Some(AppAck { content: vec![1, 2, 3, 4, 5] }),
		};

		let encoded = msg.encode();
		let decoded = AckMessage::decode(&encoded).unwrap();
		assert_eq!(decoded, msg);
	}

	#[test]
	fn ack_type_rejects_an_unknown_value() {
		assert!(AckType::from_u8(0).is_none());
		assert!(AckType::from_u8(4).is_none());
	}

	fn cmd_sample(body: CmdBody) -> CmdMessage {
		CmdMessage { sequence: 9, source_id: NodeId(1), instance_id: 7, grtt_quantized: 40, backoff_factor: 2, group_size: 3, fec_id: 2, fec_field_size: 8, body }
	}

	#[test]
	fn cmd_message_round_trips_flush() {
		let msg = cmd_sample(CmdBody::Flush { object_id: ObjectId(42), fec: FecPayloadId { block_id: crate::wire::ids::BlockId(9), block_len: None, symbol_id: 0, block_id_width: 24 } });

		let encoded = msg.encode().unwrap();
		let decoded = CmdMessage::decode(&encoded).unwrap();
		assert_eq!(decoded, msg);
	}

	#[test]
	fn cmd_message_round_trips_eot() {
		let msg = cmd_sample(CmdBody::Eot);

		let encoded = msg.encode().unwrap();
		let decoded = CmdMessage::decode(&encoded).unwrap();
		assert_eq!(decoded, msg);
	}

	#[test]
	fn cmd_message_round_trips_squelch_with_invalid_list() {
		let msg = cmd_sample(CmdBody::Squelch { sync_id: ObjectId(10), invalid: vec![ObjectId(11), ObjectId(12), ObjectId(13)] });

		let encoded = msg.encode().unwrap();
		let decoded = CmdMessage::decode(&encoded).unwrap();
		assert_eq!(decoded, msg);
	}

	#[test]
	fn cmd_message_round_trips_cc_with_reports() {
		let msg = cmd_sample(CmdBody::Cc {
			cc_sequence: 5,
			send_time_sec: 1_700_000,
			send_time_usec: 123,
			rate_quantized: 4096,
			reports: vec![
				CcReportEntry { node_id: NodeId(10), feedback: CcFeedback { cc_sequence: 5, ecn_echo: false, rtt_quantized: 20, loss_quantized: 1, rate_quantized: 500 } },
				CcReportEntry { node_id: NodeId(11), feedback: CcFeedback { cc_sequence: 5, ecn_echo: true, rtt_quantized: 21, loss_quantized: 2, rate_quantized: 600 } },
			],
		});

		let encoded = msg.encode().unwrap();
		let decoded = CmdMessage::decode(&encoded).unwrap();
		assert_eq!(decoded, msg);
	}

	#[test]
	fn cmd_message_round_trips_repair_adv() {
		let msg = cmd_sample(CmdBody::RepairAdv {
			requests: vec![crate::wire::repair::RepairRequest { form: crate::wire::repair::RepairForm::Items, flags: crate::wire::repair::flag::BLOCK, items: vec![repair_item(1, 2, 3)] }],
		});

		let encoded = msg.encode().unwrap();
		let decoded = CmdMessage::decode(&encoded).unwrap();
		assert_eq!(decoded, msg);
	}

	#[test]
	fn cmd_message_round_trips_ack_req() {
		let msg = cmd_sample(CmdBody::AckReq { ack_type: AckType::Watermark as u8, object_id: ObjectId(777) });

		let encoded = msg.encode().unwrap();
		let decoded = CmdMessage::decode(&encoded).unwrap();
		assert_eq!(decoded, msg);
	}

	#[test]
	fn cmd_message_round_trips_application() {
		let msg = cmd_sample(CmdBody::Application { content: b"hello from the sender".to_vec() });

		let encoded = msg.encode().unwrap();
		let decoded = CmdMessage::decode(&encoded).unwrap();
		assert_eq!(decoded, msg);
	}

	#[test]
	fn nack_message_rejects_wrong_msg_type() {
		let data_bytes = sample(None, b"x").encode().unwrap();
		assert!(NackMessage::decode(&data_bytes).is_none());
	}
}
