use serde::{Deserialize, Serialize};

use crate::node::ValueBag;
use crate::tree::RuneTreap;
use crate::{Error, Result};

/// One exported key with its marked flag and values, in key order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry<V> {
    pub key: String,
    pub marked: bool,
    pub values: Vec<V>,
}

/// Structural export of a tree: the key-mapping identifier plus every entry.
///
/// No byte layout is fixed; the serde derives make any self-describing
/// format work. Restoring into a tree whose active mapping disagrees with
/// `key_mapping` is rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeSnapshot<V> {
    pub key_mapping: String,
    pub entries: Vec<SnapshotEntry<V>>,
}

impl<V: Clone, B: ValueBag<V>> RuneTreap<V, B> {
    /// Exports keys, markings, and values in key order.
    pub fn snapshot(&self) -> TreeSnapshot<V> {
        let mut entries = Vec::with_capacity(self.len());
        let mut cursor = self.keys_cursor();
        while let Some(measured) = cursor.advance(self).unwrap() {
            let runes: Vec<char> = measured.key.chars().collect();
            let node = self.node(self.key_node(&runes).unwrap());
            entries.push(SnapshotEntry {
                key: measured.key,
                marked: node.marked,
                values: node.values.as_ref().unwrap().snapshot(),
            });
        }
        TreeSnapshot {
            key_mapping: self.key_mapping().identifier().to_string(),
            entries,
        }
    }

    /// Replaces the tree contents with the snapshot's. Fails with
    /// [`Error::MappingMismatch`] when the snapshot was produced under a
    /// different key mapping, leaving the tree untouched.
    pub fn restore(&mut self, snapshot: &TreeSnapshot<V>) -> Result<()> {
        let active = self.key_mapping().identifier();
        if snapshot.key_mapping != active {
            return Err(Error::MappingMismatch {
                active: active.to_string(),
                found: snapshot.key_mapping.clone(),
            });
        }
        self.clear();
        for entry in &snapshot.entries {
            self.set(&entry.key, entry.values.iter().cloned())?;
        }
        for entry in &snapshot.entries {
            if entry.marked {
                self.mark_key(&entry.key)?;
            }
        }
        Ok(())
    }
}
