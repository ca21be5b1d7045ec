//! FEC payload identifier encoding (§4.2 FEC payload id table).
//!
//! The payload id's layout depends on the configured `fec_id`/field size,
//! so unlike [`super::header`] this isn't a single `Cast` overlay — it's
//! an explicit encode/decode pair over a byte slice, per Design Note 9's
//! "explicit getter/setter functions" guidance, grounded on
//! `normMessage.h`'s `NormPayloadId` (constructed per-call from `fecId`
//! and `m`, the field-size exponent).

use super::ids::BlockId;

/// A decoded FEC payload id. `width` carries the bit width `BlockId`
/// comparisons need (§3), since it's scheme-dependent.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FecPayloadId {
	pub block_id: BlockId,
	pub block_len: Option<u16>,
	pub symbol_id: u16,
	pub block_id_width: u32,
}

impl FecPayloadId {
	/// Wire length in bytes for a given `fec_id`/`field_size` pair, or
	/// `None` if unsupported.
	pub fn encoded_len(fec_id: u8, field_size: u8) -> Option<usize> {
		match (fec_id, field_size) {
			(2, 8) | (5, 8) => Some(4),
			(2, 16) => Some(4),
			(129, 16) => Some(8),
			_ => None,
		}
	}

	pub fn encode(self, fec_id: u8, field_size: u8, out: &mut [u8]) {
		match (fec_id, field_size) {
			(2, 8) | (5, 8) => {
				debug_assert!(out.len() >= 4);
				let block_id = self.block_id.0 & 0x00ff_ffff;
				out[0] = (block_id >> 16) as u8;
				out[1] = (block_id >> 8) as u8;
				out[2] = block_id as u8;
				out[3] = self.symbol_id as u8;
			}
			(2, 16) => {
				debug_assert!(out.len() >= 4);
				out[0..2].copy_from_slice(&(self.block_id.0 as u16).to_be_bytes());
				out[2..4].copy_from_slice(&self.symbol_id.to_be_bytes());
			}
			(129, 16) => {
				debug_assert!(out.len() >= 8);
				out[0..4].copy_from_slice(&self.block_id.0.to_be_bytes());
				out[4..6].copy_from_slice(&self.block_len.unwrap_or(0).to_be_bytes());
				out[6..8].copy_from_slice(&self.symbol_id.to_be_bytes());
			}
			_ => panic!("unsupported fec_id/field_size combination: {fec_id}/{field_size}"),
		}
	}

	pub fn decode(fec_id: u8, field_size: u8, buf: &[u8]) -> Option<Self> {
		match (fec_id, field_size) {
			(2, 8) | (5, 8) => {
				if buf.len() < 4 {
					return None;
				}
				let block_id = ((buf[0] as u32) << 16) | ((buf[1] as u32) << 8) | (buf[2] as u32);
				Some(Self {
					block_id: BlockId(block_id),
					block_len: None,
					symbol_id: buf[3] as u16,
					block_id_width: 24,
				})
			}
			(2, 16) => {
				if buf.len() < 4 {
					return None;
				}
				let block_id = u16::from_be_bytes([buf[0], buf[1]]) as u32;
				let symbol_id = u16::from_be_bytes([buf[2], buf[3]]);
				Some(Self {
					block_id: BlockId(block_id),
					block_len: None,
					symbol_id,
					block_id_width: 16,
				})
			}
			(129, 16) => {
				if buf.len() < 8 {
					return None;
				}
				let block_id = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
				let block_len = u16::from_be_bytes([buf[4], buf[5]]);
				let symbol_id = u16::from_be_bytes([buf[6], buf[7]]);
				Some(Self {
					block_id: BlockId(block_id),
					block_len: Some(block_len),
					symbol_id,
					block_id_width: 32,
				})
			}
			_ => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fec_id_2_m8_round_trips() {
		let id = FecPayloadId { block_id: BlockId(0x00ab_cdef & 0x00ff_ffff), block_len: None, symbol_id: 200, block_id_width: 24 };

		let mut buf = [0u8; 4];
		id.encode(2, 8, &mut buf);
		let back = FecPayloadId::decode(2, 8, &buf).unwrap();

		assert_eq!(back.block_id, id.block_id);
		assert_eq!(back.symbol_id, id.symbol_id);
	}

	#[test]
	fn fec_id_129_carries_block_len() {
		let id = FecPayloadId { block_id: BlockId(12345), block_len: Some(64), symbol_id: 9, block_id_width: 32 };

		let mut buf = [0u8; 8];
		id.encode(129, 16, &mut buf);
		let back = FecPayloadId::decode(129, 16, &buf).unwrap();

		assert_eq!(back, id);
	}

	#[test]
	fn unsupported_scheme_returns_none_on_decode() {
		assert!(FecPayloadId::decode(200, 8, &[0u8; 8]).is_none());
	}
}
