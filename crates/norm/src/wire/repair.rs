//! Compact NACK repair-request encoding (§4.2): `ITEMS`/`RANGES`/`ERASURES`
//! forms with a `SEGMENT`/`BLOCK`/`INFO`/`OBJECT` scope flag byte,
//! grounded on `normMessage.h`'s `NormRepairRequest`.

use super::fec::FecPayloadId;
use super::ids::ObjectId;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum RepairForm {
	Items = 1,
	Ranges = 2,
	Erasures = 3,
}

impl RepairForm {
	pub fn from_u8(v: u8) -> Option<Self> {
		Some(match v {
			1 => Self::Items,
			2 => Self::Ranges,
			3 => Self::Erasures,
			_ => return None,
		})
	}
}

/// Scope flags, OR-able. A request with no flags set repairs at the
/// symbol level named directly by its items.
pub mod flag {
	pub const SEGMENT: u8 = 0x01;
	pub const BLOCK: u8 = 0x02;
	pub const INFO: u8 = 0x04;
	pub const OBJECT: u8 = 0x08;
}

/// One repair item: an object, optionally scoped down to a block/symbol
/// by the request's FEC payload id.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RepairItem {
	pub object_id: ObjectId,
	pub fec: FecPayloadId,
}

/// A decoded or to-be-encoded repair request: a form, scope flags, and
/// a flat item list. `RANGES` pairs consecutive items as (start, end);
/// `ERASURES` items carry an erasure count in place of a symbol id.
#[derive(Clone, Debug)]
pub struct RepairRequest {
	pub form: RepairForm,
	pub flags: u8,
	pub items: Vec<RepairItem>,
}

/// Bytes needed for the request header (form:8, flags:8, itemLen:16).
pub const REQUEST_HEADER_LEN: usize = 4;

impl RepairRequest {
	/// Wire length of one item under a given FEC scheme: `objectId` (with
	/// padding to a 32-bit boundary) plus the scheme's FEC payload id.
	pub fn item_len(fec_id: u8, field_size: u8) -> Option<usize> {
		FecPayloadId::encoded_len(fec_id, field_size).map(|fec_len| 4 + fec_len)
	}

	/// Total encoded length of this request under the given FEC scheme.
	pub fn encoded_len(&self, fec_id: u8, field_size: u8) -> Option<usize> {
		let item_len = Self::item_len(fec_id, field_size)?;
		Some(REQUEST_HEADER_LEN + self.items.len() * item_len)
	}

	pub fn encode(&self, fec_id: u8, field_size: u8, out: &mut [u8]) -> Option<usize> {
		let item_len = Self::item_len(fec_id, field_size)?;
		let total = REQUEST_HEADER_LEN + self.items.len() * item_len;
		if out.len() < total {
			return None;
		}

		out[0] = self.form as u8;
		out[1] = self.flags;
		out[2..4].copy_from_slice(&((total - REQUEST_HEADER_LEN) as u16).to_be_bytes());

		for (i, item) in self.items.iter().enumerate() {
			let base = REQUEST_HEADER_LEN + i * item_len;
			out[base] = fec_id;
			out[base + 1] = 0;
			out[base + 2..base + 4].copy_from_slice(&item.object_id.0.to_be_bytes());
			item.fec.encode(fec_id, field_size, &mut out[base + 4..base + item_len]);
		}

		Some(total)
	}

	pub fn decode(fec_id: u8, field_size: u8, buf: &[u8]) -> Option<Self> {
		if buf.len() < REQUEST_HEADER_LEN {
			return None;
		}

		let form = RepairForm::from_u8(buf[0])?;
		let flags = buf[1];
		let item_list_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
		let item_len = Self::item_len(fec_id, field_size)?;

		if item_list_len % item_len != 0 {
			return None;
		}

		let list = buf.get(REQUEST_HEADER_LEN..REQUEST_HEADER_LEN + item_list_len)?;
		let mut items = Vec::with_capacity(item_list_len / item_len);

		for chunk in list.chunks_exact(item_len) {
			let object_id = ObjectId(u16::from_be_bytes([chunk[2], chunk[3]]));
			let fec = FecPayloadId::decode(fec_id, field_size, &chunk[4..])?;
			items.push(RepairItem { object_id, fec });
		}

		Some(Self { form, flags, items })
	}
}

/// Split an overlong item list into multiple requests, each fitting
/// within `budget_bytes` once encoded (§4.2: a NACK message whose
/// repair request would exceed `segmentSize` is split across several
/// NACK messages). Preserves `form`/`flags` across the split; a
/// `RANGES` request's items are kept paired, rounding the per-chunk
/// item count down to an even number.
pub fn split_to_fit(form: RepairForm, flags: u8, items: &[RepairItem], fec_id: u8, field_size: u8, budget_bytes: usize) -> Vec<RepairRequest> {
	let Some(item_len) = RepairRequest::item_len(fec_id, field_size) else {
		return Vec::new();
	};

	if budget_bytes <= REQUEST_HEADER_LEN {
		return Vec::new();
	}

	let mut max_items = (budget_bytes - REQUEST_HEADER_LEN) / item_len;
	if matches!(form, RepairForm::Ranges) {
		max_items -= max_items % 2;
	}
	if max_items == 0 {
		return Vec::new();
	}

	items
		.chunks(max_items)
		.map(|chunk| RepairRequest { form, flags, items: chunk.to_vec() })
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn item(obj: u16, block: u32, symbol: u16) -> RepairItem {
		RepairItem { object_id: ObjectId(obj), fec: FecPayloadId { block_id: super::super::ids::BlockId(block), block_len: None, symbol_id: symbol, block_id_width: 24 } }
	}

	#[test]
	fn items_request_round_trips() {
		let req = RepairRequest { form: RepairForm::Items, flags: flag::BLOCK, items: vec![item(1, 2, 3), item(1, 2, 4)] };

		let mut buf = vec![0u8; req.encoded_len(2, 8).unwrap()];
		let written = req.encode(2, 8, &mut buf).unwrap();
		assert_eq!(written, buf.len());

		let back = RepairRequest::decode(2, 8, &buf).unwrap();
		assert_eq!(back.form, req.form);
		assert_eq!(back.flags, req.flags);
		assert_eq!(back.items, req.items);
	}

	#[test]
	fn split_to_fit_respects_budget() {
		let items: Vec<_> = (0..20).map(|i| item(1, i, 0)).collect();
		let chunks = split_to_fit(RepairForm::Items, 0, &items, 2, 8, REQUEST_HEADER_LEN + 8 * 8);

		assert!(chunks.iter().all(|c| c.items.len() <= 8));
		let total: usize = chunks.iter().map(|c| c.items.len()).sum();
		assert_eq!(total, 20);
	}

	#[test]
	fn split_to_fit_keeps_ranges_paired() {
		let items: Vec<_> = (0..10).map(|i| item(1, i, 0)).collect();
		let chunks = split_to_fit(RepairForm::Ranges, 0, &items, 2, 8, REQUEST_HEADER_LEN + 3 * 8);

		for c in &chunks {
			assert_eq!(c.items.len() % 2, 0);
		}
	}
}
