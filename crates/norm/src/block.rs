//! Per-FEC-block state (§4.3): pending/repair bitmasks, erasure/parity
//! counters, segment storage.
//!
//! Grounded on `original_source/include/normSegment.h`'s `NormBlock`.
//! Segment storage there is an intrusive `char**` table owned by the
//! block; here a block holds [`collections::pool::Handle`]s into a
//! segment [`collections::pool::Pool`] owned by the enclosing
//! [`crate::object::Object`], per Design Note 9's arena-plus-handle
//! replacement for manual allocation bookkeeping.

use collections::pool;

use crate::wire::fec::FecPayloadId;
use crate::wire::ids::ObjectId;
use crate::wire::repair::RepairItem;
use crate::wire::BlockId;

/// A growable bitmask indexed by symbol id (0..65535), used for both
/// the pending and repair masks. `normSegment.h` uses a fixed
/// `ProtoBitmask`; since our symbol count is runtime-configured we size
/// this to the block's symbol count instead of compiling in a maximum.
#[derive(Clone, Debug, Default)]
struct Bitmask {
	words: Vec<u64>,
}

impl Bitmask {
	fn with_capacity(bits: usize) -> Self {
		Self { words: vec![0; bits.div_ceil(64)] }
	}

	fn clear(&mut self) {
		self.words.fill(0);
	}

	fn set(&mut self, bit: u16) {
		let (word, shift) = (bit as usize / 64, bit as usize % 64);
		if word >= self.words.len() {
			self.words.resize(word + 1, 0);
		}
		self.words[word] |= 1 << shift;
	}

	fn set_range(&mut self, first: u16, count: u16) {
		for i in 0..count {
			self.set(first.wrapping_add(i));
		}
	}

	fn unset(&mut self, bit: u16) {
		if let Some(word) = self.words.get_mut(bit as usize / 64) {
			*word &= !(1 << (bit as usize % 64));
		}
	}

	fn test(&self, bit: u16) -> bool {
		self.words.get(bit as usize / 64).is_some_and(|w| w & (1 << (bit as usize % 64)) != 0)
	}

	fn is_set(&self) -> bool {
		self.words.iter().any(|w| *w != 0)
	}

	fn first_set(&self) -> Option<u16> {
		self.next_set(0)
	}

	fn next_set(&self, from: u16) -> Option<u16> {
		for bit in from..(self.words.len() * 64) as u16 {
			if self.test(bit) {
				return Some(bit);
			}
		}
		None
	}
}

bitflags::bitflags! {
	#[derive(Clone, Copy, PartialEq, Eq, Debug)]
	pub struct BlockFlags: u8 {
		const IN_REPAIR = 0x01;
	}
}

/// One FEC source block's transmit or receive state.
pub struct Block {
	id: BlockId,
	flags: BlockFlags,
	segments: Vec<Option<pool::Handle>>,
	pending: Bitmask,
	repair: Bitmask,
	erasure_count: u16,
	parity_count: u16,
	parity_offset: u16,
}

impl Block {
	pub fn new(id: BlockId, total_symbols: u16) -> Self {
		Self {
			id,
			flags: BlockFlags::empty(),
			segments: vec![None; total_symbols as usize],
			pending: Bitmask::with_capacity(total_symbols as usize),
			repair: Bitmask::with_capacity(total_symbols as usize),
			erasure_count: 0,
			parity_count: 0,
			parity_offset: 0,
		}
	}

	pub fn id(&self) -> BlockId {
		self.id
	}

	pub fn in_repair(&self) -> bool {
		self.flags.contains(BlockFlags::IN_REPAIR)
	}

	/// Sender: start transmitting a fresh block, arming `num_data +
	/// auto_parity` pending symbols.
	pub fn tx_init(&mut self, num_data: u16, auto_parity: u16) {
		self.pending.clear();
		self.pending.set_range(0, num_data + auto_parity);
		self.repair.clear();
		self.erasure_count = 0;
		self.parity_count = 0;
		self.parity_offset = auto_parity;
		self.flags = BlockFlags::empty();
	}

	/// Receiver: start expecting a fresh block's `num_data + num_parity`
	/// symbols, all missing.
	pub fn rx_init(&mut self, num_data: u16, num_parity: u16) {
		self.pending.clear();
		self.pending.set_range(0, num_data + num_parity);
		self.repair.clear();
		self.erasure_count = num_data;
		self.parity_count = 0;
		self.parity_offset = 0;
		self.flags = BlockFlags::empty();
	}

	/// Sender: reset a block already fully sent so it can be
	/// retransmitted as proactive or requested parity.
	pub fn tx_reset(&mut self, num_parity: u16) {
		self.parity_offset = (self.parity_offset + self.parity_count).min(num_parity);
		self.parity_count = 0;
		self.flags.remove(BlockFlags::IN_REPAIR);
	}

	pub fn is_pending(&self) -> bool {
		self.pending.is_set()
	}

	pub fn is_repair_pending(&self) -> bool {
		self.repair.is_set()
	}

	pub fn is_transmit_pending(&self) -> bool {
		self.is_pending() || self.is_repair_pending()
	}

	pub fn first_pending(&self) -> Option<u16> {
		self.pending.first_set()
	}

	pub fn next_pending(&self, from: u16) -> Option<u16> {
		self.pending.next_set(from)
	}

	pub fn first_repair(&self) -> Option<u16> {
		self.repair.first_set()
	}

	pub fn next_repair(&self, from: u16) -> Option<u16> {
		self.repair.next_set(from)
	}

	pub fn set_pending(&mut self, symbol: u16) {
		self.pending.set(symbol);
	}

	pub fn unset_pending(&mut self, symbol: u16) {
		self.pending.unset(symbol);
	}

	pub fn set_repair(&mut self, symbol: u16) {
		self.repair.set(symbol);
	}

	pub fn set_repair_range(&mut self, first: u16, last: u16) {
		let count = last.saturating_sub(first).saturating_add(1);
		self.repair.set_range(first, count);
	}

	pub fn clear_repairs(&mut self) {
		self.repair.clear();
	}

	pub fn unset_repair(&mut self, symbol: u16) {
		self.repair.unset(symbol);
	}

	pub fn erasure_count(&self) -> u16 {
		self.erasure_count
	}

	/// A DATA/parity symbol for source index `sid` just arrived: drop
	/// the erasure count if it was a source symbol, mark no longer
	/// pending, and attach its segment storage.
	pub fn write_segment(&mut self, sid: u16, num_data: u16, handle: pool::Handle) {
		if (sid as usize) < self.segments.len() {
			self.segments[sid as usize] = Some(handle);
		}
		self.pending.unset(sid);
		if sid < num_data {
			self.erasure_count = self.erasure_count.saturating_sub(1);
		} else {
			self.parity_count += 1;
		}
	}

	pub fn segment(&self, sid: u16) -> Option<pool::Handle> {
		self.segments.get(sid as usize).copied().flatten()
	}

	pub fn detach_segment(&mut self, sid: u16) -> Option<pool::Handle> {
		self.segments.get_mut(sid as usize).and_then(|slot| slot.take())
	}

	/// Attach segment storage without touching pending/erasure
	/// bookkeeping — used when the sender stages its own outgoing data
	/// into a symbol slot ahead of ever sending it (the content must be
	/// retained for later repair even once the initial send clears
	/// `pending`), unlike [`Self::write_segment`] which models a symbol
	/// actually arriving over the wire.
	pub fn attach_segment(&mut self, sid: u16, handle: pool::Handle) {
		if (sid as usize) < self.segments.len() {
			self.segments[sid as usize] = Some(handle);
		}
	}

	/// Whether enough parity has arrived/been requested to reconstruct
	/// the block's remaining erasures, per `ParityReady`.
	pub fn parity_ready(&self, num_data: u16) -> bool {
		self.erasure_count == 0 || self.parity_count >= self.erasure_count.min(num_data)
	}

	/// Receiver: does this block still need repair, given the current
	/// final-block/segment constraints? Mirrors `IsRepairPending`,
	/// simplified to the steady-state (non-final-block) case; final
	/// block size adjustments are handled by the caller (`Object`).
	pub fn needs_repair(&self, num_data: u16, num_parity: u16) -> bool {
		if self.erasure_count == 0 {
			return false;
		}
		self.erasure_count > self.parity_count || self.parity_count < num_parity
	}

	/// Sender: a NACK reports `erasure_count` missing source symbols
	/// within `[first,last]` of this block. Union that range into the
	/// armed repair set, capped to `parity_budget` newly-armed symbols,
	/// and raise the tracked erasure count if the NACK reports more loss
	/// than already known. Mirrors `NormBlock::TxUpdate`.
	pub fn tx_update(&mut self, first: u16, last: u16, erasure_count: u16, parity_budget: u16) {
		self.erasure_count = self.erasure_count.max(erasure_count);

		let span = last.wrapping_sub(first).wrapping_add(1).max(1).min(parity_budget.max(1));
		self.repair.set_range(first, span);
		self.flags.insert(BlockFlags::IN_REPAIR);
	}

	/// Receiver: append this block's pending symbols to `items` as
	/// contiguous `RANGES` pairs (start, end), for assembly into a
	/// NACK's repair request. Mirrors `NormBlock::AppendRepairRequest`.
	pub fn append_repair_request(&self, object_id: ObjectId, block_id_width: u32, items: &mut Vec<RepairItem>) {
		Self::append_ranges(&self.pending, self.id, object_id, block_id_width, items);
	}

	/// Sender: append this block's armed repair (retransmit) symbols to
	/// `items` — the sender-side counterpart used to build a REPAIR_ADV
	/// command advertising upcoming retransmissions. Mirrors
	/// `NormBlock::AppendRepairAdv`.
	pub fn append_repair_adv(&self, object_id: ObjectId, block_id_width: u32, items: &mut Vec<RepairItem>) {
		Self::append_ranges(&self.repair, self.id, object_id, block_id_width, items);
	}

	fn append_ranges(mask: &Bitmask, block_id: BlockId, object_id: ObjectId, block_id_width: u32, items: &mut Vec<RepairItem>) {
		let mut sid = 0u16;
		loop {
			let Some(start) = mask.next_set(sid) else { break };

			let mut end = start;
			while end != u16::MAX && mask.test(end + 1) {
				end += 1;
			}

			let item = |symbol_id: u16| RepairItem { object_id, fec: FecPayloadId { block_id, block_len: None, symbol_id, block_id_width } };
			items.push(item(start));
			items.push(item(end));

			if end == u16::MAX {
				break;
			}
			sid = end + 1;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tx_init_arms_pending_through_autoparity() {
		let mut b = Block::new(BlockId(0), 80);
		b.tx_init(64, 4);

		assert_eq!(b.first_pending(), Some(0));
		assert!(b.is_pending());
		for s in 0..68 {
			assert!(b.pending.test(s));
		}
		assert!(!b.pending.test(68));
	}

	#[test]
	fn rx_init_tracks_erasure_count_as_symbols_arrive() {
		let mut b = Block::new(BlockId(1), 80);
		b.rx_init(64, 16);
		assert_eq!(b.erasure_count(), 64);

		let mut pool: pool::Pool<Vec<u8>> = pool::Pool::new(4);
		let h = pool.alloc(Vec::new).unwrap();
		b.write_segment(0, 64, h);

		assert_eq!(b.erasure_count(), 63);
		assert!(!b.pending.test(0));
	}

	#[test]
	fn parity_symbol_does_not_reduce_erasure_count() {
		let mut b = Block::new(BlockId(2), 80);
		b.rx_init(64, 16);

		let mut pool: pool::Pool<Vec<u8>> = pool::Pool::new(4);
		let h = pool.alloc(Vec::new).unwrap();
		b.write_segment(64, 64, h);

		assert_eq!(b.erasure_count(), 64);
		assert_eq!(b.parity_count, 1);
	}

	#[test]
	fn repair_mask_round_trips_through_range_set() {
		let mut b = Block::new(BlockId(3), 80);
		b.set_repair_range(5, 9);

		assert!(b.is_repair_pending());
		assert_eq!(b.first_repair(), Some(5));
		assert_eq!(b.next_repair(6), Some(6));
		assert_eq!(b.next_repair(10), None);
	}

	#[test]
	fn tx_update_arms_a_capped_repair_span() {
		let mut b = Block::new(BlockId(4), 80);
		b.tx_update(10, 30, 21, 4);

		assert!(b.in_repair());
		assert_eq!(b.erasure_count(), 21);
		assert_eq!(b.first_repair(), Some(10));
		// Capped to a 4-symbol span even though the NACK named 21.
		assert_eq!(b.next_repair(14), None);
	}

	#[test]
	fn append_repair_request_emits_one_range_per_contiguous_run() {
		let mut b = Block::new(BlockId(5), 80);
		b.rx_init(64, 16);
		// Fill in everything except symbols 3..=5 and 40.
		for sid in 0..80u16 {
			if (3..=5).contains(&sid) || sid == 40 {
				continue;
			}
			let mut pool: pool::Pool<Vec<u8>> = pool::Pool::new(1);
			let h = pool.alloc(Vec::new).unwrap();
			b.write_segment(sid, 64, h);
		}

		let mut items = Vec::new();
		b.append_repair_request(ObjectId(1), 24, &mut items);

		assert_eq!(items.len(), 4);
		assert_eq!(items[0].fec.symbol_id, 3);
		assert_eq!(items[1].fec.symbol_id, 5);
		assert_eq!(items[2].fec.symbol_id, 40);
		assert_eq!(items[3].fec.symbol_id, 40);
	}
}
