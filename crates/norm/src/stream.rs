//! Stream object overlay (§4.7): a circular window of blocks addressed
//! by absolute byte offset, write/flush/graceful-close, push mode.
//!
//! Grounded on `original_source/include/normObject.h`'s
//! `NormStreamObject`. The block window there is a custom
//! `NormBlockBuffer` (a sorted tree or hash table depending on build
//! flags) holding a bounded range of `NormBlockId`s; here it's
//! [`collections::ring::Ring`], which is already addressed by an
//! absolute `u64` index and evicts the oldest entry on wraparound —
//! exactly the "circular buffer of recent blocks" behavior
//! `NormBlockBuffer` implements by hand.

use collections::arena::Handle;
use collections::ring::Ring;

use crate::block::Block;
use crate::config::FlushMode;

/// A read/write cursor into a stream: which block and which segment
/// within it.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Cursor {
	pub block: u32,
	pub segment: u16,
}

/// The engine-side half of a stream object: the circular block window
/// plus read/write cursors. The application-visible byte-stream
/// framing (message boundaries within a segment) is left to the
/// application layer, matching `normApi.cpp`'s `NormReadStream`/
/// `NormWriteStream` only ever moving opaque byte ranges.
pub struct Stream {
	buffer: Ring<Handle<Block>>,
	write_index: Cursor,
	read_index: Cursor,
	range_lo: u32,
	range_hi: u32,
	closing: bool,
	write_vacancy: bool,
	push_mode: bool,
	flush_mode: FlushMode,
	flush_pending: bool,
}

impl Stream {
	pub fn new(window_blocks: usize) -> Self {
		Self {
			buffer: Ring::new(window_blocks),
			write_index: Cursor::default(),
			read_index: Cursor::default(),
			range_lo: 0,
			range_hi: 0,
			closing: false,
			write_vacancy: true,
			push_mode: false,
			flush_mode: FlushMode::Active,
			flush_pending: false,
		}
	}

	pub fn write_index(&self) -> Cursor {
		self.write_index
	}

	pub fn read_index(&self) -> Cursor {
		self.read_index
	}

	pub fn set_push_mode(&mut self, push: bool) {
		self.push_mode = push;
	}

	pub fn push_mode(&self) -> bool {
		self.push_mode
	}

	pub fn is_closing(&self) -> bool {
		self.closing
	}

	pub fn has_vacancy(&self) -> bool {
		!self.closing && self.write_vacancy
	}

	pub fn set_vacancy(&mut self, vacancy: bool) {
		self.write_vacancy = vacancy;
	}

	/// Register a freshly allocated block at the current write
	/// position, evicting whatever aged out of the window.
	pub fn lock_block(&mut self, block_id: u32, handle: Handle<Block>) -> Option<(u64, Handle<Block>)> {
		if self.buffer.is_empty() {
			self.range_lo = block_id;
		}
		self.range_hi = block_id;
		self.buffer.insert(block_id as u64, handle)
	}

	pub fn unlock_block(&mut self, block_id: u32) -> Option<Handle<Block>> {
		self.buffer.remove(block_id as u64)
	}

	pub fn block_handle(&self, block_id: u32) -> Option<Handle<Block>> {
		self.buffer.get(block_id as u64).copied()
	}

	pub fn is_old_block(&self, block_id: u32) -> bool {
		!self.buffer.is_empty() && block_id < self.range_lo
	}

	pub fn range_lo(&self) -> u32 {
		self.range_lo
	}

	pub fn range_hi(&self) -> u32 {
		self.range_hi
	}

	/// Advance the write cursor by one segment, rolling over to the
	/// next block when `num_data` segments have been filled.
	pub fn advance_write(&mut self, num_data: u16) {
		self.write_index.segment += 1;
		if self.write_index.segment >= num_data {
			self.write_index.segment = 0;
			self.write_index.block = self.write_index.block.wrapping_add(1);
		}
	}

	pub fn advance_read(&mut self, num_data: u16) {
		self.read_index.segment += 1;
		if self.read_index.segment >= num_data {
			self.read_index.segment = 0;
			self.read_index.block = self.read_index.block.wrapping_add(1);
		}
	}

	/// Where a flush would land given the current write cursor,
	/// mirroring `FlushBlockId`/`FlushSegmentId`: a flush targets the
	/// last segment actually written, not the next one to be filled.
	pub fn flush_point(&self, num_data: u16) -> Cursor {
		if self.write_index.segment > 0 {
			Cursor { block: self.write_index.block, segment: self.write_index.segment - 1 }
		} else {
			Cursor { block: self.write_index.block.wrapping_sub(1), segment: num_data - 1 }
		}
	}

	pub fn set_flush_mode(&mut self, mode: FlushMode) {
		self.flush_mode = mode;
	}

	pub fn flush_mode(&self) -> FlushMode {
		self.flush_mode
	}

	/// Request a flush at the current write point. `Active` flushes
	/// also request a watermark ACK once the data drains (handled by
	/// the session/sender-node layer); `Passive` just drains without
	/// soliciting acknowledgment; `None` is a no-op.
	pub fn flush(&mut self) {
		if self.flush_mode != FlushMode::None {
			self.flush_pending = true;
		}
	}

	pub fn is_flush_pending(&self) -> bool {
		self.flush_pending
	}

	pub fn clear_flush_pending(&mut self) {
		self.flush_pending = false;
	}

	/// Begin a graceful close: stop admitting new writes, but let
	/// buffered data drain (`normApi.cpp`'s `NormCloseStream(graceful)`).
	pub fn close(&mut self, graceful: bool) {
		self.closing = true;
		if graceful {
			self.flush();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn handle() -> Handle<Block> {
		let mut arena: collections::arena::Arena<Block> = collections::arena::Arena::new();
		arena.insert(Block::new(crate::wire::BlockId(0), 1))
	}

	#[test]
	fn write_cursor_rolls_over_blocks() {
		let mut s = Stream::new(4);
		for _ in 0..3 {
			s.advance_write(3);
		}
		assert_eq!(s.write_index(), Cursor { block: 1, segment: 0 });
	}

	#[test]
	fn flush_point_targets_last_written_segment() {
		let mut s = Stream::new(4);
		s.advance_write(4);
		s.advance_write(4);
		assert_eq!(s.flush_point(4), Cursor { block: 0, segment: 1 });
	}

	#[test]
	fn lock_block_evicts_on_window_wraparound() {
		let mut s = Stream::new(2);
		let h = handle();

		assert!(s.lock_block(0, h).is_none());
		assert!(s.lock_block(1, h).is_none());
		let evicted = s.lock_block(2, h);
		assert_eq!(evicted, Some((0, h)));
		assert!(s.is_old_block(0));
	}

	#[test]
	fn graceful_close_arms_a_flush() {
		let mut s = Stream::new(2);
		s.close(true);
		assert!(s.is_closing());
		assert!(s.is_flush_pending());
		assert!(!s.has_vacancy());
	}
}
