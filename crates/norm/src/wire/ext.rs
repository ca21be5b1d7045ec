//! Header extension TLVs (§4.2): FTI, CC-FEEDBACK, CC-RATE, APP-ACK.
//!
//! Every extension shares a 2-byte prefix (`type:8, lengthWords:8`,
//! content starting at byte 2) followed by type-specific content,
//! grounded on `normMessage.h`'s `NormHeaderExtension` base class.
//! Extensions with `type >= 128` ("short" extensions) are always
//! exactly 4 bytes and don't encode a length byte at all; we still
//! store one for symmetry with the accessor below since none of the
//! short extensions NORM currently defines need more than that.

/// Header extension type tag (§4.2).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExtType {
	Fti,
	CcFeedback,
	CcRate,
	AppAck,
	Unknown(u8),
}

impl ExtType {
	pub const FTI: u8 = 64;
	pub const CC_FEEDBACK: u8 = 3;
	pub const CC_RATE: u8 = 128;
	pub const APP_ACK: u8 = 65;

	pub fn from_u8(v: u8) -> Self {
		match v {
			Self::FTI => Self::Fti,
			Self::CC_FEEDBACK => Self::CcFeedback,
			Self::CC_RATE => Self::CcRate,
			Self::APP_ACK => Self::AppAck,
			other => Self::Unknown(other),
		}
	}

	pub fn as_u8(self) -> u8 {
		match self {
			Self::Fti => Self::FTI,
			Self::CcFeedback => Self::CC_FEEDBACK,
			Self::CcRate => Self::CC_RATE,
			Self::AppAck => Self::APP_ACK,
			Self::Unknown(v) => v,
		}
	}

	/// "Short" extensions (type >= 128) are always exactly 4 bytes and
	/// carry no explicit length byte on the wire.
	fn is_short(self) -> bool {
		self.as_u8() >= 128
	}
}

/// A single header extension borrowed from a message's extension area.
pub struct Extension<'a> {
	pub ext_type: ExtType,
	pub content: &'a [u8],
}

/// Walk the (possibly empty) sequence of header extensions between the
/// end of a message's fixed header and the start of its payload.
///
/// Unrecognized extension types are yielded as `ExtType::Unknown` rather
/// than treated as an error (§7: UNKNOWN_EXTENSION is non-fatal) — the
/// length byte lets callers skip over them regardless of content.
pub struct ExtensionIter<'a> {
	buf: &'a [u8],
}

impl<'a> ExtensionIter<'a> {
	pub fn new(buf: &'a [u8]) -> Self {
		Self { buf }
	}
}

impl<'a> Iterator for ExtensionIter<'a> {
	type Item = Extension<'a>;

	fn next(&mut self) -> Option<Self::Item> {
		if self.buf.len() < 4 {
			return None;
		}

		let ext_type = ExtType::from_u8(self.buf[0]);
		let total_len = if ext_type.is_short() { 4 } else { (self.buf[1] as usize) * 4 };

		if total_len < 2 || total_len > self.buf.len() {
			return None;
		}

		let content = &self.buf[2..total_len];
		self.buf = &self.buf[total_len..];

		Some(Extension { ext_type, content })
	}
}

/// FEC Object Transmission Information, the `fec_id`-agnostic common
/// fields. `object_size` is the 48-bit transmit size (§3 uses a 64-bit
/// byte offset internally per Design Note 9; only the wire encoding is
/// 48-bit).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Fti {
	pub object_size: u64,
	pub segment_size: u16,
	pub num_data: u16,
	pub num_parity: u16,
	pub fec_field_size: u8,
	pub fec_group_size: u8,
}

/// Wire length of the FTI extension: 2-byte prefix + 14 bytes of
/// content, rounded up to a whole 4-byte word (`normMessage.h`'s
/// `NormFtiExtension2` sets `SetWords(4)`, i.e. 16 bytes).
pub const FTI_TOTAL_LEN: usize = 16;

impl Fti {
	pub fn encode(self, out: &mut [u8]) {
		debug_assert!(out.len() >= FTI_TOTAL_LEN);
		out[0] = ExtType::FTI;
		out[1] = (FTI_TOTAL_LEN / 4) as u8;

		let c = &mut out[2..FTI_TOTAL_LEN];
		c[0..2].copy_from_slice(&((self.object_size >> 32) as u16).to_be_bytes());
		c[2..6].copy_from_slice(&(self.object_size as u32).to_be_bytes());
		c[6] = self.fec_field_size;
		c[7] = self.fec_group_size;
		c[8..10].copy_from_slice(&self.segment_size.to_be_bytes());
		c[10..12].copy_from_slice(&self.num_data.to_be_bytes());
		c[12..14].copy_from_slice(&self.num_parity.to_be_bytes());
	}

	pub fn decode(content: &[u8]) -> Option<Self> {
		if content.len() < 14 {
			return None;
		}

		let msb = u16::from_be_bytes([content[0], content[1]]) as u64;
		let lsb = u32::from_be_bytes([content[2], content[3], content[4], content[5]]) as u64;

		Some(Self {
			object_size: (msb << 32) | lsb,
			fec_field_size: content[6],
			fec_group_size: content[7],
			segment_size: u16::from_be_bytes([content[8], content[9]]),
			num_data: u16::from_be_bytes([content[10], content[11]]),
			num_parity: u16::from_be_bytes([content[12], content[13]]),
		})
	}
}

/// NORM-CC Feedback extension: round-trip estimate, loss estimate, and
/// advertised rate from a single receiver, carried in an NACK/ACK.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CcFeedback {
	pub cc_sequence: u8,
	pub ecn_echo: bool,
	pub rtt_quantized: u8,
	pub loss_quantized: u16,
	pub rate_quantized: u16,
}

pub const CC_FEEDBACK_TOTAL_LEN: usize = 12;

impl CcFeedback {
	pub fn encode(self, out: &mut [u8]) {
		debug_assert!(out.len() >= CC_FEEDBACK_TOTAL_LEN);
		out[0] = ExtType::CC_FEEDBACK;
		out[1] = (CC_FEEDBACK_TOTAL_LEN / 4) as u8;
		out[2] = self.cc_sequence;
		out[3] = if self.ecn_echo { 1 } else { 0 };
		out[4] = self.rtt_quantized;
		out[5] = 0;
		out[6..8].copy_from_slice(&self.loss_quantized.to_be_bytes());
		out[8..10].copy_from_slice(&self.rate_quantized.to_be_bytes());
	}

	pub fn decode(content: &[u8]) -> Option<Self> {
		if content.len() < 10 {
			return None;
		}

		Some(Self {
			cc_sequence: content[0],
			ecn_echo: content[1] != 0,
			rtt_quantized: content[2],
			loss_quantized: u16::from_be_bytes([content[4], content[5]]),
			rate_quantized: u16::from_be_bytes([content[8], content[9]]),
		})
	}
}

/// NORM-CC Rate extension: the sender's currently advertised send rate,
/// quantized the same way as [`super::header::quantize_grtt`] but over
/// bytes/sec rather than seconds.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CcRate {
	pub rate_quantized: u16,
}

pub const CC_RATE_TOTAL_LEN: usize = 4;

impl CcRate {
	pub fn encode(self, out: &mut [u8]) {
		debug_assert!(out.len() >= CC_RATE_TOTAL_LEN);
		out[0] = ExtType::CC_RATE;
		out[1] = 0;
		out[2..4].copy_from_slice(&self.rate_quantized.to_be_bytes());
	}

	pub fn decode(content: &[u8]) -> Option<Self> {
		if content.len() < 2 {
			return None;
		}
		Some(Self { rate_quantized: u16::from_be_bytes([content[0], content[1]]) })
	}
}

/// Application-defined ACK extension: an opaque application payload
/// carried back to the sender on an application-requested ACK
/// (`NormCmdAckReqMsg`'s `ACK_APPLICATION` variant, §4.6 acking-node
/// tree). The engine never interprets `content` itself.
#[derive(Clone, Debug, PartialEq)]
pub struct AppAck {
	pub content: Vec<u8>,
}

impl AppAck {
	pub fn encoded_len(&self) -> usize {
		(2 + self.content.len()).div_ceil(4) * 4
	}

	pub fn encode(&self, out: &mut [u8]) {
		let total = self.encoded_len();
		debug_assert!(out.len() >= total);
		out[0] = ExtType::APP_ACK;
		out[1] = (total / 4) as u8;
		out[2..2 + self.content.len()].copy_from_slice(&self.content);
		for b in &mut out[2 + self.content.len()..total] {
			*b = 0;
		}
	}

	pub fn decode(content: &[u8]) -> Self {
		Self { content: content.to_vec() }
	}
}

/// Quantize a rate in bytes/sec to the NORM-CC 16-bit float encoding
/// (4-bit exponent, 12-bit mantissa), matching `NormQuantizeRate`.
pub fn quantize_rate(bytes_per_sec: f64) -> u16 {
	if bytes_per_sec <= 0.0 {
		return 0;
	}

	let bits_per_sec = bytes_per_sec * 8.0;
	let mut exponent = 0u32;
	let mut mantissa = bits_per_sec;

	while mantissa >= 4096.0 && exponent < 15 {
		mantissa /= 2.0;
		exponent += 1;
	}

	((exponent << 12) | (mantissa.round() as u16 & 0x0fff)) as u16
}

pub fn unquantize_rate(q: u16) -> f64 {
	let exponent = (q >> 12) & 0x0f;
	let mantissa = (q & 0x0fff) as f64;
	let bits_per_sec = mantissa * (1u32 << exponent) as f64;
	bits_per_sec / 8.0
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fti_round_trips_with_full_encode() {
		let fti = Fti { object_size: 123_456_789, segment_size: 1400, num_data: 64, num_parity: 16, fec_field_size: 8, fec_group_size: 1 };

		let mut buf = [0u8; 16];
		fti.encode(&mut buf);

		let back = Fti::decode(&buf[2..]).unwrap();
		assert_eq!(back, fti);
		assert_eq!(buf[0], ExtType::FTI);
	}

	#[test]
	fn extension_iter_walks_unknown_extensions() {
		let mut buf = vec![0u8; 16];
		Fti { object_size: 0, segment_size: 1, num_data: 1, num_parity: 1, fec_field_size: 8, fec_group_size: 1 }.encode(&mut buf);

		let exts: Vec<_> = ExtensionIter::new(&buf).collect();
		assert_eq!(exts.len(), 1);
		assert_eq!(exts[0].ext_type, ExtType::Fti);
	}

	#[test]
	fn cc_feedback_round_trips_rtt_and_loss() {
		let fb = CcFeedback { cc_sequence: 9, ecn_echo: true, rtt_quantized: 200, loss_quantized: 500, rate_quantized: 0 };

		let mut buf = [0u8; CC_FEEDBACK_TOTAL_LEN];
		fb.encode(&mut buf);
		let back = CcFeedback::decode(&buf[2..]).unwrap();

		assert_eq!(back.cc_sequence, fb.cc_sequence);
		assert_eq!(back.ecn_echo, fb.ecn_echo);
		assert_eq!(back.rtt_quantized, fb.rtt_quantized);
		assert_eq!(back.loss_quantized, fb.loss_quantized);
	}

	#[test]
	fn app_ack_round_trips_and_pads_to_a_word_boundary() {
		let ack = AppAck { content: vec![1, 2, 3] };

		let mut buf = vec![0u8; ack.encoded_len()];
		ack.encode(&mut buf);

		assert_eq!(buf.len() % 4, 0);
		assert_eq!(buf[0], ExtType::APP_ACK);

		let back = AppAck::decode(&buf[2..2 + ack.content.len()]);
		assert_eq!(back, ack);
	}

	#[test]
	fn rate_quantization_round_trips_approximately() {
		for rate in [1000.0, 64_000.0, 1_000_000.0, 9_500_000.0] {
			let q = quantize_rate(rate);
			let back = unquantize_rate(q);
			let ratio = back / rate;
			assert!((0.9..1.1).contains(&ratio), "rate={rate} ratio={ratio}");
		}
	}
}
