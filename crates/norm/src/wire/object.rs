//! The object-message header shared by INFO and DATA PDUs (§4.2),
//! grounded on `normMessage.h`'s `NormObjectMsg`: `instanceId:16,
//! grtt:8, backoff:4/groupSize:4, flags:8, fecId:8, objectId:16` — 8
//! bytes, immediately following the common header. Unlike `CmdHeader`
//! this layout happens to be padding-free (`u16be`'s 2-byte alignment
//! divides its own 8-byte size evenly), so it's a `Cast` overlay like
//! [`super::header::CommonHeader`].

use bitflags::bitflags;
use utils::bytes::Cast;
use utils::endian::u16be;

use super::ids::ObjectId;

bitflags! {
	/// `NormObjectMsg::Flag`.
	#[derive(Clone, Copy, PartialEq, Eq, Debug)]
	pub struct ObjectFlags: u8 {
		const REPAIR     = 0x01;
		const EXPLICIT   = 0x02;
		const INFO       = 0x04;
		const UNRELIABLE = 0x08;
		const FILE       = 0x10;
		const STREAM     = 0x20;
		const SYN        = 0x40;
	}
}

#[derive(Clone, Copy, Cast)]
#[repr(C)]
pub struct ObjectHeader {
	instance_id: u16be,
	grtt_quantized: u8,
	backoff_group_size: u8,
	flags: u8,
	fec_id: u8,
	object_id: u16be,
}

pub const OBJECT_HEADER_LEN: usize = 8;

impl ObjectHeader {
	pub fn new(instance_id: u16, grtt_quantized: u8, backoff_factor: u8, group_size: u8, flags: ObjectFlags, fec_id: u8, object_id: ObjectId) -> Self {
		Self {
			instance_id: instance_id.into(),
			grtt_quantized,
			backoff_group_size: (backoff_factor << 4) | (group_size & 0x0f),
			flags: flags.bits(),
			fec_id,
			object_id: object_id.0.into(),
		}
	}

	pub fn instance_id(&self) -> u16 {
		self.instance_id.get()
	}

	pub fn grtt_quantized(&self) -> u8 {
		self.grtt_quantized
	}

	pub fn backoff_factor(&self) -> u8 {
		self.backoff_group_size >> 4
	}

	pub fn group_size(&self) -> u8 {
		self.backoff_group_size & 0x0f
	}

	pub fn flags(&self) -> ObjectFlags {
		ObjectFlags::from_bits_truncate(self.flags)
	}

	pub fn fec_id(&self) -> u8 {
		self.fec_id
	}

	pub fn object_id(&self) -> ObjectId {
		ObjectId(self.object_id.get())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn object_header_round_trips_fields() {
		let h = ObjectHeader::new(7, 40, 4, 8, ObjectFlags::INFO | ObjectFlags::STREAM, 2, ObjectId(99));

		assert_eq!(h.instance_id(), 7);
		assert_eq!(h.grtt_quantized(), 40);
		assert_eq!(h.backoff_factor(), 4);
		assert_eq!(h.group_size(), 8);
		assert!(h.flags().contains(ObjectFlags::INFO));
		assert!(h.flags().contains(ObjectFlags::STREAM));
		assert!(!h.flags().contains(ObjectFlags::REPAIR));
		assert_eq!(h.fec_id(), 2);
		assert_eq!(h.object_id(), ObjectId(99));
	}

	#[test]
	fn backoff_and_group_size_share_one_byte() {
		let h = ObjectHeader::new(0, 0, 15, 15, ObjectFlags::empty(), 0, ObjectId(0));
		assert_eq!(h.backoff_factor(), 15);
		assert_eq!(h.group_size(), 15);
	}
}
