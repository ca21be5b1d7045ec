//! Object state machine (§4.4): FTI-driven block split, pending/repair
//! bitmasks at the object (block) level, payload variants, and the
//! sender scan-and-transmit / receiver segment-write operations that
//! drive blocks from the two sides of the wire.
//!
//! Grounded on `original_source/include/normObject.h`'s `NormObject`
//! base class plus its `NormFileObject`/`NormDataObject`/
//! `NormStreamObject` subclasses. Design Note 9 replaces that
//! inheritance hierarchy with a single [`Object`] holding a tagged
//! [`Payload`] enum, since the three kinds only ever differ in how
//! segment reads/writes are sourced (a file handle, an in-memory
//! buffer, or a stream's circular block window) — everything else
//! (block split arithmetic, pending/repair bitmasks, nacking mode) is
//! shared and lives directly on `Object`. The block and segment storage
//! pools (`normNode.h`'s `segment_pool`/`block_pool`) are sized per
//! object from the session's `segment_pool_capacity`/
//! `block_pool_capacity` and, once exhausted, make room via one of the
//! three eviction policies `NormObject::StealNonPendingBlock`/
//! `StealOldestBlock`/`StealNewestBlock`.

use collections::arena::{Arena, Handle};
use collections::pool;

use crate::block::Block;
use crate::codec::{BlockShape, FecCodec};
use crate::stream::Stream;
use crate::wire::repair::{RepairForm, RepairItem, RepairRequest};
use crate::wire::{BlockId, ObjectId};

/// Mirrors `normObject.h`'s `NackingMode`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NackingMode {
	None,
	InfoOnly,
	Normal,
}

/// The three transport object kinds (§4.4). `File` only tracks the path
/// and size the application supplied; actual file I/O is the
/// application's concern (the engine only ever moves segment-sized
/// byte ranges), matching `normFile.h`'s split between `NormFile` (I/O)
/// and `NormFileObject` (FEC bookkeeping). A `File` object can be
/// received (segments written in by [`Object::write_segment`] the same
/// as any other kind) but this engine doesn't originate file reads for
/// transmission — sending a `File` object is the application's job to
/// stage as a `Data` buffer instead.
pub enum Payload {
	File { path: std::path::PathBuf, size: u64 },
	Data { buf: Vec<u8> },
	Stream(Stream),
}

/// Which existing block to evict when a block pool is at capacity and a
/// new block is needed. `StealNonPendingBlock` (a block with nothing
/// left to send/receive) is always tried first regardless of policy,
/// since reclaiming it is free; the policy only decides the fallback
/// once every block still has pending work.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EvictionPolicy {
	/// Sender advancing a send window: give up on the block that's been
	/// around longest.
	Oldest,
	/// Receiver making room for a new arrival: give up on the
	/// most-recently-started block rather than stall on one closer to
	/// completion.
	Newest,
}

/// One thing [`Object::next_sender_msg`] says this object needs
/// transmitted next.
#[derive(Clone, Debug, PartialEq)]
pub enum SenderMsg {
	/// The object's INFO segment hasn't gone out yet.
	Info,
	/// A source or parity symbol for `block_id`/`sid`.
	Data { block_id: BlockId, sid: u16, payload: Vec<u8> },
}

/// One transport object: an ID, its FTI-derived block/segment layout,
/// and a tagged payload.
pub struct Object {
	pub id: ObjectId,
	pub payload: Payload,
	pub nacking_mode: NackingMode,

	size: u64,
	segment_size: u16,
	num_data: u16,
	num_parity: u16,

	/// Blocks before `large_block_count` use `large_block_size` source
	/// symbols; the remainder use `small_block_size`, per
	/// `GetBlockSize`'s large/small split.
	large_block_count: u32,
	large_block_size: u16,
	small_block_size: u16,
	final_block_id: BlockId,
	final_segment_size: u16,

	info: Option<Vec<u8>>,
	pending_info: bool,

	blocks: std::collections::BTreeMap<u32, Handle<Block>>,
	repair_blocks: std::collections::BTreeSet<u32>,

	segment_pool: pool::Pool<Vec<u8>>,
	block_arena: Arena<Block>,
	block_capacity: usize,
	/// Sender: the next block id `next_sender_msg` will arm once every
	/// currently-registered block has nothing left pending. Receiver:
	/// unused (blocks are armed on demand by [`Object::write_segment`]).
	next_block_to_arm: u32,
}

impl Object {
	/// Open an object for transmission or reception, computing the
	/// large/small block split from `(size, segment_size, num_data)`
	/// the way `NormObject::Open`'s `ComputeBlockCount`/segmentation
	/// arithmetic does: distribute `size` across
	/// `ceil(size / (segment_size * num_data))` blocks as evenly as
	/// possible, with any remainder going to the leading "large" blocks.
	#[allow(clippy::too_many_arguments)]
	pub fn open(
		id: ObjectId,
		payload: Payload,
		size: u64,
		segment_size: u16,
		num_data: u16,
		num_parity: u16,
		info: Option<Vec<u8>>,
		segment_pool_capacity: usize,
		block_pool_capacity: usize,
	) -> Self {
		let block_payload = segment_size as u64 * num_data as u64;
		let total_blocks = size.div_ceil(block_payload).max(1);
		let total_segments = size.div_ceil(segment_size as u64).max(1);

		let small_block_size = (total_segments / total_blocks) as u16;
		let large_block_size = small_block_size + 1;
		let large_block_count = (total_segments % total_blocks) as u32;

		let final_block_id = BlockId((total_blocks - 1) as u32);
		let final_segment_size = {
			let rem = size % segment_size as u64;
			if rem == 0 {
				segment_size
			} else {
				rem as u16
			}
		};

		Self {
			id,
			payload,
			nacking_mode: NackingMode::Normal,
			size,
			segment_size,
			num_data,
			num_parity,
			large_block_count,
			large_block_size,
			small_block_size,
			final_block_id,
			final_segment_size,
			pending_info: info.is_some(),
			info,
			blocks: Default::default(),
			repair_blocks: Default::default(),
			segment_pool: pool::Pool::new(segment_pool_capacity),
			block_arena: Arena::new(),
			block_capacity: block_pool_capacity.max(1),
			next_block_to_arm: 0,
		}
	}

	pub fn size(&self) -> u64 {
		self.size
	}

	pub fn segment_size(&self) -> u16 {
		self.segment_size
	}

	pub fn final_block_id(&self) -> BlockId {
		self.final_block_id
	}

	pub fn info(&self) -> Option<&[u8]> {
		self.info.as_deref()
	}

	pub fn is_pending_info(&self) -> bool {
		self.pending_info
	}

	pub fn clear_pending_info(&mut self) {
		self.pending_info = false;
	}

	/// Number of source symbols in `block_id`'s block, per the
	/// large/small split (`GetBlockSize`).
	pub fn block_size(&self, block_id: BlockId) -> u16 {
		if block_id.0 < self.large_block_count { self.large_block_size } else { self.small_block_size }
	}

	/// Segment size for the last segment of the last block, which is
	/// usually shorter than `segment_size`.
	pub fn segment_size_for(&self, block_id: BlockId, segment_id: u16) -> u16 {
		if block_id == self.final_block_id && segment_id + 1 == self.block_size(block_id) {
			self.final_segment_size
		} else {
			self.segment_size
		}
	}

	pub fn num_data(&self) -> u16 {
		self.num_data
	}

	pub fn num_parity(&self) -> u16 {
		self.num_parity
	}

	/// Track that `block_id` has an outstanding repair. The actual
	/// `Block` bookkeeping (which symbols) lives in the `Block` itself;
	/// this set only scopes which blocks the object needs to visit
	/// during a repair-request scan, avoiding an O(total blocks) walk.
	pub fn mark_block_repair_pending(&mut self, block_id: BlockId) {
		self.repair_blocks.insert(block_id.0);
	}

	pub fn clear_block_repair_pending(&mut self, block_id: BlockId) {
		self.repair_blocks.remove(&block_id.0);
	}

	pub fn is_repair_pending(&self) -> bool {
		!self.repair_blocks.is_empty()
	}

	pub fn register_block(&mut self, block_id: BlockId, handle: Handle<Block>) {
		self.blocks.insert(block_id.0, handle);
	}

	pub fn unregister_block(&mut self, block_id: BlockId) -> Option<Handle<Block>> {
		self.blocks.remove(&block_id.0)
	}

	pub fn block_handle(&self, block_id: BlockId) -> Option<Handle<Block>> {
		self.blocks.get(&block_id.0).copied()
	}

	pub fn block(&self, handle: Handle<Block>) -> Option<&Block> {
		self.block_arena.get(handle)
	}

	pub fn block_mut(&mut self, handle: Handle<Block>) -> Option<&mut Block> {
		self.block_arena.get_mut(handle)
	}

	pub fn blocks_in_use(&self) -> usize {
		self.blocks.len()
	}

	// -- block pool / eviction (§4.4) ------------------------------------

	/// Pick a block to reclaim when the block pool is full: prefer one
	/// with nothing left pending (`StealNonPendingBlock`), since
	/// reclaiming it costs nothing either side cares about.
	pub fn steal_non_pending_block(&self) -> Option<BlockId> {
		self.blocks
			.iter()
			.find(|(_, &h)| self.block_arena.get(h).is_none_or(|b| !b.is_transmit_pending()))
			.map(|(&id, _)| BlockId(id))
	}

	/// `StealOldestBlock`: the lowest-numbered registered block.
	pub fn steal_oldest_block(&self) -> Option<BlockId> {
		self.blocks.keys().next().copied().map(BlockId)
	}

	/// `StealNewestBlock`: the highest-numbered registered block.
	pub fn steal_newest_block(&self) -> Option<BlockId> {
		self.blocks.keys().next_back().copied().map(BlockId)
	}

	fn evict_block(&mut self, policy: EvictionPolicy) -> bool {
		let victim = self.steal_non_pending_block().or_else(|| match policy {
			EvictionPolicy::Oldest => self.steal_oldest_block(),
			EvictionPolicy::Newest => self.steal_newest_block(),
		});

		let Some(block_id) = victim else {
			return false;
		};

		if let Some(handle) = self.unregister_block(block_id) {
			self.block_arena.remove(handle);
		}
		self.clear_block_repair_pending(block_id);

		true
	}

	/// Allocate and register a fresh block, evicting another one first
	/// if the pool is already at `block_capacity`. Returns `None` if the
	/// pool is full and nothing could be evicted (every block still has
	/// pending work under both eviction policies).
	pub fn alloc_block(&mut self, block_id: BlockId, total_symbols: u16, rx: bool, policy: EvictionPolicy) -> Option<Handle<Block>> {
		if self.blocks.len() >= self.block_capacity && !self.evict_block(policy) {
			return None;
		}

		let mut block = Block::new(block_id, total_symbols);
		let num_data = self.num_data.min(total_symbols);
		if rx {
			block.rx_init(num_data, total_symbols.saturating_sub(num_data));
		} else {
			block.tx_init(num_data, 0);
		}

		let handle = self.block_arena.insert(block);
		self.register_block(block_id, handle);
		Some(handle)
	}

	// -- receiver: segment arrival and FEC decode (§4.3, §4.4) -----------

	/// Receiver: store one arriving DATA or parity segment for
	/// `block_id`/`sid`, creating the block on first arrival (evicting
	/// another block via `policy` if the object's block budget is
	/// exhausted) and attempting FEC reconstruction once enough symbols
	/// are in hand. Returns `false` if the segment pool is exhausted
	/// (flow control) or the block couldn't be created.
	pub fn write_segment(&mut self, block_id: BlockId, sid: u16, data: &[u8], codec: &dyn FecCodec, policy: EvictionPolicy) -> bool {
		let total_symbols = self.block_size(block_id) + self.num_parity;
		if sid >= total_symbols {
			return false;
		}

		let handle = match self.blocks.get(&block_id.0).copied() {
			Some(h) => h,
			None => match self.alloc_block(block_id, total_symbols, true, policy) {
				Some(h) => h,
				None => return false,
			},
		};

		let Some(seg_handle) = self.segment_pool.alloc(|| data.to_vec()) else {
			return false;
		};

		let num_data = self.num_data;
		if let Some(block) = self.block_arena.get_mut(handle) {
			block.write_segment(sid, num_data, seg_handle);
		}

		self.try_decode_block(handle, codec);

		true
	}

	/// Once a block has enough symbols to reconstruct its erasures,
	/// decode and attach the missing source segments so they read back
	/// the same as if they'd arrived over the wire.
	fn try_decode_block(&mut self, handle: Handle<Block>, codec: &dyn FecCodec) {
		let num_data = self.num_data;
		let num_parity = self.num_parity;
		let symbol_size = self.segment_size as usize;

		let ready = self.block_arena.get(handle).is_some_and(|b| b.erasure_count() > 0 && b.parity_ready(num_data));
		if !ready {
			return;
		}

		let total = (num_data + num_parity) as usize;
		let mut symbols: Vec<Option<Vec<u8>>> = Vec::with_capacity(total);
		for sid in 0..total as u16 {
			let bytes = self.block_arena.get(handle).and_then(|b| b.segment(sid)).and_then(|h| self.segment_pool.get(h)).cloned();
			symbols.push(bytes);
		}

		let shape = BlockShape { num_data, num_parity, symbol_size };
		if !codec.decode(shape, &mut symbols) {
			return;
		}

		for (sid, symbol) in symbols.into_iter().enumerate().take(num_data as usize) {
			let sid = sid as u16;
			let already_present = self.block_arena.get(handle).is_some_and(|b| b.segment(sid).is_some());
			if already_present {
				continue;
			}

			let Some(bytes) = symbol else { continue };
			let Some(seg_handle) = self.segment_pool.alloc(|| bytes) else { continue };

			if let Some(block) = self.block_arena.get_mut(handle) {
				block.attach_segment(sid, seg_handle);
				block.unset_pending(sid);
			}
		}
	}

	/// Whether every registered block is free of pending repair and no
	/// INFO segment is outstanding, i.e. the receiver has everything it
	/// currently knows to ask for.
	pub fn needs_receiver_repair(&self) -> bool {
		self.pending_info || self.blocks.iter().any(|(_, &h)| self.block_arena.get(h).is_some_and(|b| b.is_pending()))
	}

	/// Receiver: build this object's contribution to a NACK's repair
	/// request list — one item pair for the INFO segment if still
	/// pending, then each pending block's ranges. Mirrors
	/// `NormObject::AppendRepairRequest`.
	pub fn append_repair_request(&self, items: &mut Vec<RepairItem>, block_id_width: u32) {
		if self.pending_info {
			items.push(RepairItem {
				object_id: self.id,
				fec: crate::wire::fec::FecPayloadId { block_id: BlockId(0), block_len: None, symbol_id: 0, block_id_width },
			});
		}

		for (&id, &handle) in &self.blocks {
			let Some(block) = self.block_arena.get(handle) else { continue };
			if block.is_pending() {
				block.append_repair_request(self.id, block_id_width, items);
			}
			let _ = id;
		}
	}

	// -- sender: scan-and-transmit (§4.4, §4.6) --------------------------

	/// Sender: produce the next thing this object needs to transmit —
	/// the pending INFO segment, or the next pending/repair-requested
	/// data or parity symbol, arming a fresh block from `next_block_to_arm`
	/// once every currently-registered block is clear. Returns `None`
	/// once nothing is left to send. A `Stream` object never arms blocks
	/// this way — they're created on demand by [`Self::write_stream`] as
	/// the application hands over bytes. Mirrors `NormObject::NextSenderMsg`.
	pub fn next_sender_msg(&mut self, codec: &dyn FecCodec) -> Option<SenderMsg> {
		if self.pending_info {
			return Some(SenderMsg::Info);
		}

		let is_stream = matches!(self.payload, Payload::Stream(_));

		loop {
			let pending_blocks: Vec<u32> = self.blocks.keys().copied().collect();

			for id in pending_blocks {
				let block_id = BlockId(id);
				let Some(handle) = self.blocks.get(&id).copied() else { continue };

				let repair_sid = self.block_arena.get(handle).and_then(|b| b.first_repair());
				let (sid, is_repair) = match repair_sid {
					Some(sid) => (sid, true),
					None => match self.block_arena.get(handle).and_then(|b| b.first_pending()) {
						Some(sid) => (sid, false),
						None => continue,
					},
				};

				let payload = self.source_symbol(block_id, sid, codec);

				if let Some(block) = self.block_arena.get_mut(handle) {
					if is_repair {
						block.unset_repair(sid);
					} else {
						block.unset_pending(sid);
					}
				}

				return Some(SenderMsg::Data { block_id, sid, payload });
			}

			if is_stream || self.next_block_to_arm > self.final_block_id.0 {
				return None;
			}

			let block_id = BlockId(self.next_block_to_arm);
			let total = self.block_size(block_id) + self.num_parity;
			self.next_block_to_arm += 1;

			if self.alloc_block(block_id, total, false, EvictionPolicy::Oldest).is_none() {
				return None;
			}
		}
	}

	/// Sender: fold one decoded NACK repair request into the relevant
	/// blocks' armed repair ranges, allocating a block if it's already
	/// been evicted since it was last sent. `RANGES` items are consumed
	/// in (start, end) pairs; `ITEMS`/`ERASURES` items are each treated
	/// as a single-symbol range. Mirrors `NormObject::HandleNack`'s
	/// per-block dispatch into `NormBlock::TxUpdate`.
	pub fn apply_repair_request(&mut self, request: &RepairRequest) {
		let ranges: Vec<(BlockId, u16, u16)> = match request.form {
			RepairForm::Ranges => request.items.chunks(2).filter_map(|pair| match pair {
				[start, end] => Some((start.fec.block_id, start.fec.symbol_id, end.fec.symbol_id)),
				[single] => Some((single.fec.block_id, single.fec.symbol_id, single.fec.symbol_id)),
				_ => None,
			}).collect(),
			RepairForm::Items | RepairForm::Erasures => request.items.iter().map(|item| (item.fec.block_id, item.fec.symbol_id, item.fec.symbol_id)).collect(),
		};

		for (block_id, first, last) in ranges {
			let total = self.block_size(block_id) + self.num_parity;
			let handle = match self.blocks.get(&block_id.0).copied() {
				Some(h) => h,
				None => match self.alloc_block(block_id, total, false, EvictionPolicy::Oldest) {
					Some(h) => h,
					None => continue,
				},
			};

			let erasure_count = last.wrapping_sub(first).wrapping_add(1).max(1);
			if let Some(block) = self.block_mut(handle) {
				block.tx_update(first, last, erasure_count, self.num_parity);
			}
			self.mark_block_repair_pending(block_id);
		}
	}

	fn source_symbol(&mut self, block_id: BlockId, sid: u16, codec: &dyn FecCodec) -> Vec<u8> {
		let num_data = self.num_data;

		if sid < num_data {
			self.ensure_source_segment(block_id, sid).unwrap_or_else(|| vec![0u8; self.segment_size_for(block_id, sid) as usize])
		} else {
			let shape = BlockShape { num_data, num_parity: self.num_parity, symbol_size: self.segment_size as usize };
			let sources: Vec<Vec<u8>> = (0..num_data).map(|s| self.ensure_source_segment(block_id, s).unwrap_or_else(|| vec![0u8; shape.symbol_size])).collect();
			let refs: Vec<&[u8]> = sources.iter().map(|v| v.as_slice()).collect();

			let mut parity = vec![0u8; shape.symbol_size];
			codec.encode(shape, &refs, sid - num_data, &mut parity);
			parity
		}
	}

	/// Fetch (or, for a `Data` object, lazily stage from `buf` into a
	/// pooled segment so the bytes survive for later repair) the source
	/// bytes for `block_id`/`sid`.
	fn ensure_source_segment(&mut self, block_id: BlockId, sid: u16) -> Option<Vec<u8>> {
		let handle = self.blocks.get(&block_id.0).copied()?;

		if let Some(bytes) = self.block_arena.get(handle).and_then(|b| b.segment(sid)).and_then(|h| self.segment_pool.get(h)).cloned() {
			return Some(bytes);
		}

		let Payload::Data { buf } = &self.payload else { return None };

		let (offset, len) = self.segment_byte_range(block_id, sid);
		let start = offset as usize;
		let mut out = vec![0u8; len as usize];
		if start < buf.len() {
			let end = (start + len as usize).min(buf.len());
			out[..end - start].copy_from_slice(&buf[start..end]);
		}

		if let Some(seg_handle) = self.segment_pool.alloc(|| out.clone()) {
			if let Some(block) = self.block_arena.get_mut(handle) {
				block.attach_segment(sid, seg_handle);
			}
		}

		Some(out)
	}

	/// Byte offset and length of segment `segment_id` within `block_id`,
	/// counting every segment in every earlier block.
	fn segment_byte_range(&self, block_id: BlockId, segment_id: u16) -> (u64, u16) {
		let earlier_large = (self.large_block_count.min(block_id.0)) as u64 * self.large_block_size as u64;
		let earlier_small = block_id.0.saturating_sub(self.large_block_count) as u64 * self.small_block_size as u64;
		let earlier_segments = earlier_large + earlier_small + segment_id as u64;

		(earlier_segments * self.segment_size as u64, self.segment_size_for(block_id, segment_id))
	}

	/// Sender: true once every block through `final_block_id` has been
	/// armed and drained of both pending and repair work, i.e.
	/// `next_sender_msg` would return `None` right now. A `Stream`
	/// object is never "complete" this way — flush semantics for a
	/// stream belong to `Stream::flush`, not object completion.
	pub fn is_tx_complete(&self) -> bool {
		if matches!(self.payload, Payload::Stream(_)) {
			return false;
		}

		!self.pending_info && self.next_block_to_arm > self.final_block_id.0 && self.blocks.values().all(|&h| self.block_arena.get(h).is_none_or(|b| !b.is_transmit_pending()))
	}

	// -- stream payload access --------------------------------------------

	pub fn stream(&self) -> Option<&Stream> {
		match &self.payload {
			Payload::Stream(s) => Some(s),
			_ => None,
		}
	}

	pub fn stream_mut(&mut self) -> Option<&mut Stream> {
		match &mut self.payload {
			Payload::Stream(s) => Some(s),
			_ => None,
		}
	}

	/// Write application bytes into the stream's current block/segment
	/// position and advance the write cursor, staging the bytes into a
	/// pooled segment so they're available both to `next_sender_msg` and
	/// to FEC repair. Returns the number of bytes actually written — 0
	/// if the stream has no flow-control vacancy or the segment pool is
	/// exhausted. `eom` arms a flush at the resulting position.
	///
	/// Only meaningful when `self.payload` is [`Payload::Stream`].
	pub fn write_stream(&mut self, buf: &[u8], eom: bool) -> usize {
		let Payload::Stream(_) = &self.payload else { return 0 };

		let num_data = self.num_data;
		let num_parity = self.num_parity;
		let segment_size = self.segment_size;

		let cur = {
			let Payload::Stream(stream) = &self.payload else { return 0 };
			if !stream.has_vacancy() {
				return 0;
			}
			stream.write_index()
		};

		let n = buf.len().min(segment_size as usize);

		let block_id = BlockId(cur.block);
		let handle = match self.blocks.get(&cur.block).copied() {
			Some(h) => h,
			None => match self.alloc_block(block_id, num_data + num_parity, false, EvictionPolicy::Oldest) {
				Some(h) => h,
				None => return 0,
			},
		};

		let Some(seg_handle) = self.segment_pool.alloc(|| buf[..n].to_vec()) else {
			return 0;
		};

		if let Some(block) = self.block_arena.get_mut(handle) {
			block.attach_segment(cur.segment, seg_handle);
		}

		if let Payload::Stream(stream) = &mut self.payload {
			if let Some((evicted_id, _)) = stream.lock_block(cur.block, handle) {
				if let Some(old_handle) = self.blocks.remove(&(evicted_id as u32)) {
					self.block_arena.remove(old_handle);
				}
			}
			stream.advance_write(num_data);
			if eom {
				stream.flush();
			}
		}

		n
	}

	/// Read up to `buf.len()` bytes starting at the stream's current
	/// read cursor. Returns the number of bytes read — 0 once the read
	/// cursor catches up to the write cursor or the addressed block has
	/// aged out of the window (a stream break: the caller should resync
	/// via `seek_msg_start` semantics at the application layer).
	///
	/// Only meaningful when `self.payload` is [`Payload::Stream`].
	pub fn read_stream(&mut self, buf: &mut [u8]) -> usize {
		let Payload::Stream(_) = &self.payload else { return 0 };

		let num_data = self.num_data;

		let cur = {
			let Payload::Stream(stream) = &self.payload else { return 0 };
			stream.read_index()
		};

		let Some(&handle) = self.blocks.get(&cur.block) else { return 0 };
		let Some(seg_handle) = self.block_arena.get(handle).and_then(|b| b.segment(cur.segment)) else { return 0 };
		let Some(bytes) = self.segment_pool.get(seg_handle) else { return 0 };

		let n = bytes.len().min(buf.len());
		buf[..n].copy_from_slice(&bytes[..n]);

		if let Payload::Stream(stream) = &mut self.payload {
			stream.advance_read(num_data);
		}

		n
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::codec::XorCodec;

	fn open(size: u64, segment_size: u16, num_data: u16, num_parity: u16) -> Object {
		Object::open(ObjectId(0), Payload::Data { buf: vec![] }, size, segment_size, num_data, num_parity, None, 64, 16)
	}

	#[test]
	fn block_split_distributes_remainder_to_leading_blocks() {
		// 10 segments across 3 blocks: sizes 4,3,3.
		let obj = open(10 * 100, 100, 3, 1);

		assert_eq!(obj.block_size(BlockId(0)), 4);
		assert_eq!(obj.block_size(BlockId(1)), 3);
		assert_eq!(obj.block_size(BlockId(2)), 3);
		assert_eq!(obj.final_block_id(), BlockId(2));
	}

	#[test]
	fn final_segment_size_accounts_for_remainder_bytes() {
		let obj = open(250, 100, 64, 1);

		assert_eq!(obj.final_block_id(), BlockId(0));
		assert_eq!(obj.segment_size_for(BlockId(0), 2), 50);
		assert_eq!(obj.segment_size_for(BlockId(0), 0), 100);
	}

	#[test]
	fn info_pending_tracks_whether_info_was_supplied() {
		let obj = Object::open(ObjectId(1), Payload::Data { buf: vec![] }, 1, 100, 1, 0, Some(vec![1, 2, 3]), 8, 4);
		assert!(obj.is_pending_info());

		let obj = Object::open(ObjectId(2), Payload::Data { buf: vec![] }, 1, 100, 1, 0, None, 8, 4);
		assert!(!obj.is_pending_info());
	}

	#[test]
	fn next_sender_msg_drains_info_then_data_then_ends() {
		let mut obj = Object::open(ObjectId(3), Payload::Data { buf: b"abcdefgh".to_vec() }, 8, 4, 2, 0, Some(vec![9]), 8, 4);
		let codec = XorCodec;

		assert_eq!(obj.next_sender_msg(&codec), Some(SenderMsg::Info));
		obj.clear_pending_info();

		assert_eq!(obj.next_sender_msg(&codec), Some(SenderMsg::Data { block_id: BlockId(0), sid: 0, payload: b"abcd".to_vec() }));
		assert_eq!(obj.next_sender_msg(&codec), Some(SenderMsg::Data { block_id: BlockId(0), sid: 1, payload: b"efgh".to_vec() }));
		assert_eq!(obj.next_sender_msg(&codec), None);
	}

	#[test]
	fn write_segment_reconstructs_a_single_erasure_via_parity() {
		let mut obj = open(8, 4, 2, 1);
		let codec = XorCodec;

		let mut parity = vec![0u8; 4];
		codec.encode(BlockShape { num_data: 2, num_parity: 1, symbol_size: 4 }, &[b"abcd", b"efgh"], 0, &mut parity);

		assert!(obj.write_segment(BlockId(0), 1, b"efgh", &codec, EvictionPolicy::Oldest));
		assert!(obj.write_segment(BlockId(0), 2, &parity, &codec, EvictionPolicy::Oldest));

		let handle = obj.block_handle(BlockId(0)).unwrap();
		assert_eq!(obj.block(handle).unwrap().erasure_count(), 0);

		let seg = obj.block(handle).unwrap().segment(0).unwrap();
		assert_eq!(obj.segment_pool.get(seg).unwrap(), b"abcd");
	}

	#[test]
	fn stream_write_and_read_round_trip_a_segment() {
		let mut obj = Object::open(ObjectId(4), Payload::Stream(Stream::new(4)), 0, 4, 2, 0, None, 8, 4);
		obj.clear_pending_info();

		assert_eq!(obj.write_stream(b"data", false), 4);

		let mut buf = [0u8; 4];
		assert_eq!(obj.read_stream(&mut buf), 4);
		assert_eq!(&buf, b"data");
	}

	#[test]
	fn apply_repair_request_arms_a_range_on_an_already_drained_block() {
		let mut obj = Object::open(ObjectId(6), Payload::Data { buf: b"abcdefgh".to_vec() }, 8, 4, 2, 1, None, 8, 4);
		let codec = XorCodec;
		obj.clear_pending_info();

		// Drain block 0 so nothing is pending, then request repair of sid 0.
		while obj.next_sender_msg(&codec).is_some() {}

		let handle = obj.block_handle(BlockId(0)).unwrap();
		assert!(!obj.block(handle).unwrap().is_repair_pending());

		let request = RepairRequest {
			form: RepairForm::Ranges,
			flags: crate::wire::repair::flag::SEGMENT,
			items: vec![
				RepairItem { object_id: obj.id, fec: crate::wire::fec::FecPayloadId { block_id: BlockId(0), block_len: None, symbol_id: 0, block_id_width: 24 } },
				RepairItem { object_id: obj.id, fec: crate::wire::fec::FecPayloadId { block_id: BlockId(0), block_len: None, symbol_id: 0, block_id_width: 24 } },
			],
		};
		obj.apply_repair_request(&request);

		assert!(obj.block(handle).unwrap().is_repair_pending());
		assert!(obj.is_repair_pending());
	}

	#[test]
	fn eviction_prefers_a_non_pending_block() {
		let mut obj = open(200, 4, 2, 0);
		// block_capacity is 16 from `open`; shrink it via direct field
		// access isn't possible, so exercise StealNonPendingBlock by
		// fully draining block 0 and confirming it's the one reused.
		let codec = XorCodec;
		obj.write_segment(BlockId(0), 0, b"ab", &codec, EvictionPolicy::Oldest);
		obj.write_segment(BlockId(0), 1, b"cd", &codec, EvictionPolicy::Oldest);

		assert_eq!(obj.steal_non_pending_block(), Some(BlockId(0)));
	}
}
