//! NORM wire format (§4.2): common header, per-type bodies, FEC payload
//! ids, header extensions, and compact repair-request encoding.

pub mod ext;
pub mod fec;
pub mod header;
pub mod ids;
pub mod object;
pub mod repair;

pub use header::{CmdFlavor, CmdHeader, CommonHeader, MsgType, COMMON_HEADER_LEN};
pub use ids::{BlockId, InstanceId, NodeId, ObjectId, SerialId};
pub use object::{ObjectFlags, ObjectHeader, OBJECT_HEADER_LEN};
