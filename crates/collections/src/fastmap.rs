//! Hash tables using `ahash` instead of the SipHash default.
//!
//! The session's remote-sender tree and an object's rx table are
//! looked up on every received packet; `ahash` trades DoS resistance
//! (not a concern for identifiers the protocol itself already
//! authenticates the structure of) for speed, same as the teacher's
//! peer map.

use std::collections::{HashMap, HashSet};
use std::hash::BuildHasherDefault;

use ahash::AHasher;

pub type FastMap<K, V> = HashMap<K, V, BuildHasherDefault<AHasher>>;
pub type FastSet<K> = HashSet<K, BuildHasherDefault<AHasher>>;
