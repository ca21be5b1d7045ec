//! Fixed-overhead collection primitives shared by the protocol engine.
//!
//! `bytes` provides the reference-counted wire-buffer types used by the
//! codec; `pool` and `arena` provide the bounded allocators and
//! generational handles the session uses to own objects, blocks and
//! remote-sender records without manual reference counting; `fastmap`
//! is a thin alias over `ahash` for the hot lookup tables (object and
//! sender tables) that do not need a bespoke hasher per entry.

pub mod arena;
pub mod bytes;
pub mod fastmap;
pub mod pool;
pub mod ring;
