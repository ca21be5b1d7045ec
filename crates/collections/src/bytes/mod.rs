mod cursor;
mod rc;
mod slice;

pub use cursor::Cursor;
pub use slice::Slice;
