//! Ordered string multimap on a ternary search treap.
//!
//! Keys are canonicalized through a [`KeyMapping`], stored as runs of runes
//! on the edges of a ternary search tree, and kept balanced by treap
//! rotations on random priorities. Lookups support exact keys, prefix
//! enumeration in key order, and near-neighbour prefix search bounded by a
//! Hamming-style prefix distance.
//!
//! ```
//! use runemap::{KeyMapping, SetMultimap};
//!
//! let mut animals: SetMultimap<u32> = SetMultimap::new(KeyMapping::Lowercase);
//! animals.add("Cat", 1).unwrap();
//! animals.add("cow", 2).unwrap();
//! animals.add("chicken", 3).unwrap();
//!
//! let keys: Vec<_> = animals.keys().collect();
//! assert_eq!(keys, ["cat", "chicken", "cow"]);
//!
//! let close: Vec<_> = animals
//!     .keys_by_prefix("cow", 2)
//!     .map(|m| (m.key, m.distance))
//!     .collect();
//! assert_eq!(close[0], ("cow".to_string(), 0));
//! ```

use thiserror::Error as ThisError;

mod map;
mod mapping;
mod node;
mod pool;
mod search;
#[cfg(feature = "serde")]
mod snapshot;
mod tree;


pub use map::{
    Entries, EntriesByPrefix, Keys, KeysByPrefix, ListMultimap, SetMultimap, StringSet, Values,
    ValuesByPrefix,
};
pub use mapping::KeyMapping;
pub use node::{ListValues, SetValues, ValueBag};
pub use pool::{RuneHandle, RunePool};
pub use search::{EntriesCursor, KeysCursor, MeasuredEntry, MeasuredKey};
#[cfg(feature = "serde")]
pub use snapshot::{SnapshotEntry, TreeSnapshot};
pub use tree::RuneTreap;

/// Failures surfaced by the map API and the search cursors.
///
/// Internal invariant violations never surface here; they are debug
/// assertions.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum Error {
    /// A caller string mapped to the empty string; such keys cannot be
    /// stored or looked up.
    #[error("key is empty after key mapping")]
    EmptyKey,
    /// The tree changed between a cursor's construction and this advance.
    #[error("tree was modified after the cursor snapshot was taken")]
    ConcurrentModification,
    /// `current()` was called before the first advance or after exhaustion.
    #[error("cursor is not positioned on an element")]
    CursorNotPositioned,
    /// A snapshot declared a different key mapping than the tree it was
    /// restored into.
    #[error("snapshot uses key mapping `{found}`, tree uses `{active}`")]
    MappingMismatch { active: String, found: String },
}

pub type Result<T> = std::result::Result<T, Error>;
