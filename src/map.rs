use crate::mapping::KeyMapping;
use crate::node::{ListValues, SetValues, ValueBag};
use crate::search::{EntriesCursor, KeysCursor, MeasuredEntry, MeasuredKey};
use crate::tree::RuneTreap;
use crate::Result;

/// Multimap whose per-key values form a set: duplicate adds are idempotent.
pub type SetMultimap<V> = RuneTreap<V, SetValues<V>>;

/// Multimap whose per-key values form a list in insertion order.
pub type ListMultimap<V> = RuneTreap<V, ListValues<V>>;

// Borrowing iterator adapters. Each wraps a detached cursor together with
// the borrow that makes concurrent modification a compile error, so the
// cursor's version check cannot fire.

/// Iterator over all keys in order.
pub struct Keys<'t, V: Clone, B: ValueBag<V>> {
    tree: &'t RuneTreap<V, B>,
    cursor: KeysCursor,
}

impl<V: Clone, B: ValueBag<V>> Iterator for Keys<'_, V, B> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.cursor.advance(self.tree).unwrap().map(|m| m.key)
    }
}

/// Iterator over keys within a prefix distance, exact group first.
pub struct KeysByPrefix<'t, V: Clone, B: ValueBag<V>> {
    tree: &'t RuneTreap<V, B>,
    cursor: KeysCursor,
}

impl<V: Clone, B: ValueBag<V>> Iterator for KeysByPrefix<'_, V, B> {
    type Item = MeasuredKey;

    fn next(&mut self) -> Option<MeasuredKey> {
        self.cursor.advance(self.tree).unwrap()
    }
}

/// Iterator over `(key, values)` pairs in key order.
pub struct Entries<'t, V: Clone, B: ValueBag<V>> {
    tree: &'t RuneTreap<V, B>,
    cursor: EntriesCursor<V>,
}

impl<V: Clone, B: ValueBag<V>> Iterator for Entries<'_, V, B> {
    type Item = (String, Vec<V>);

    fn next(&mut self) -> Option<(String, Vec<V>)> {
        self.cursor
            .advance(self.tree)
            .unwrap()
            .map(|entry| (entry.key, entry.values))
    }
}

/// Iterator over measured entries within a prefix distance.
pub struct EntriesByPrefix<'t, V: Clone, B: ValueBag<V>> {
    tree: &'t RuneTreap<V, B>,
    cursor: EntriesCursor<V>,
}

impl<V: Clone, B: ValueBag<V>> Iterator for EntriesByPrefix<'_, V, B> {
    type Item = MeasuredEntry<V>;

    fn next(&mut self) -> Option<MeasuredEntry<V>> {
        self.cursor.advance(self.tree).unwrap()
    }
}

/// Iterator over every stored value, grouped by key in key order.
pub struct Values<'t, V: Clone, B: ValueBag<V>> {
    entries: Entries<'t, V, B>,
    pending: std::vec::IntoIter<V>,
}

impl<V: Clone, B: ValueBag<V>> Iterator for Values<'_, V, B> {
    type Item = V;

    fn next(&mut self) -> Option<V> {
        loop {
            if let Some(value) = self.pending.next() {
                return Some(value);
            }
            let (_, values) = self.entries.next()?;
            self.pending = values.into_iter();
        }
    }
}

/// Iterator over the values of keys within a prefix distance.
pub struct ValuesByPrefix<'t, V: Clone, B: ValueBag<V>> {
    entries: EntriesByPrefix<'t, V, B>,
    pending: std::vec::IntoIter<V>,
}

impl<V: Clone, B: ValueBag<V>> Iterator for ValuesByPrefix<'_, V, B> {
    type Item = V;

    fn next(&mut self) -> Option<V> {
        loop {
            if let Some(value) = self.pending.next() {
                return Some(value);
            }
            let entry = self.entries.next()?;
            self.pending = entry.values.into_iter();
        }
    }
}

impl<V: Clone, B: ValueBag<V>> RuneTreap<V, B> {
    /// All keys in lexicographic (scalar) order.
    pub fn keys(&self) -> Keys<'_, V, B> {
        Keys {
            tree: self,
            cursor: self.keys_cursor(),
        }
    }

    /// Keys within `max_distance` of `prefix`, exact matches first, then
    /// ascending distance groups. An empty mapped prefix yields an empty
    /// iterator.
    pub fn keys_by_prefix(&self, prefix: &str, max_distance: usize) -> KeysByPrefix<'_, V, B> {
        KeysByPrefix {
            tree: self,
            cursor: self.keys_by_prefix_cursor(prefix, max_distance),
        }
    }

    /// All `(key, values)` entries in key order.
    pub fn entries(&self) -> Entries<'_, V, B> {
        Entries {
            tree: self,
            cursor: self.entries_cursor(),
        }
    }

    pub fn entries_by_prefix(
        &self,
        prefix: &str,
        max_distance: usize,
    ) -> EntriesByPrefix<'_, V, B> {
        EntriesByPrefix {
            tree: self,
            cursor: self.entries_by_prefix_cursor(prefix, max_distance),
        }
    }

    /// Every stored value, grouped by key in key order.
    pub fn values(&self) -> Values<'_, V, B> {
        Values {
            entries: self.entries(),
            pending: Vec::new().into_iter(),
        }
    }

    pub fn values_by_prefix(&self, prefix: &str, max_distance: usize) -> ValuesByPrefix<'_, V, B> {
        ValuesByPrefix {
            entries: self.entries_by_prefix(prefix, max_distance),
            pending: Vec::new().into_iter(),
        }
    }
}

/// The set-valued tree with values discarded: a sorted string set with the
/// same mapped-key semantics, prefix search, and suggestions.
#[derive(Debug)]
pub struct StringSet {
    inner: SetMultimap<()>,
}

impl StringSet {
    pub fn new(mapping: KeyMapping) -> Self {
        StringSet {
            inner: SetMultimap::new(mapping),
        }
    }

    pub fn with_seed(mapping: KeyMapping, seed: u64) -> Self {
        StringSet {
            inner: SetMultimap::with_seed(mapping, seed),
        }
    }

    pub fn key_mapping(&self) -> KeyMapping {
        self.inner.key_mapping()
    }

    /// Inserts the mapped element, reporting whether it was new.
    pub fn insert(&mut self, element: &str) -> Result<bool> {
        self.inner.add_key(element)
    }

    pub fn contains(&self, element: &str) -> Result<bool> {
        self.inner.contains_key(element)
    }

    /// Removes the mapped element, reporting whether it was present.
    pub fn remove(&mut self, element: &str) -> Result<bool> {
        Ok(self.inner.remove_key(element)?.is_some())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn iter(&self) -> Keys<'_, (), SetValues<()>> {
        self.inner.keys()
    }

    pub fn iter_by_prefix(
        &self,
        prefix: &str,
        max_distance: usize,
    ) -> KeysByPrefix<'_, (), SetValues<()>> {
        self.inner.keys_by_prefix(prefix, max_distance)
    }

    pub fn mark(&mut self, element: &str) -> Result<bool> {
        self.inner.mark_key(element)
    }

    pub fn suggestion_by_prefix(&self, prefix: &str) -> String {
        self.inner.suggestion_by_prefix(prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_set_folds_case_through_the_mapping() {
        let mut set = StringSet::with_seed(KeyMapping::Lowercase, 2);
        assert!(set.insert("cat").unwrap());
        assert!(!set.insert("Cat").unwrap());
        assert!(!set.insert("cAt").unwrap());
        assert_eq!(set.len(), 1);
        let elements: Vec<_> = set.iter().collect();
        assert_eq!(elements, ["cat"]);
        assert!(set.contains("CAT").unwrap());
        assert!(set.remove("CaT").unwrap());
        assert!(set.is_empty());
    }

    #[test]
    fn list_multimap_appends_in_order() {
        let mut map: ListMultimap<i32> = ListMultimap::with_seed(KeyMapping::Identity, 3);
        map.add_values("donkey", [7, 5, 1]).unwrap();
        map.add_values("donkey", [6, 8, 3]).unwrap();
        assert_eq!(map.get("donkey").unwrap(), Some(vec![7, 5, 1, 6, 8, 3]));
        let values: Vec<_> = map.values().collect();
        assert_eq!(values, [7, 5, 1, 6, 8, 3]);
    }

    #[test]
    fn values_iterators_flatten_by_key_order() {
        let mut map: ListMultimap<i32> = ListMultimap::with_seed(KeyMapping::Identity, 4);
        map.add_values("b", [3, 4]).unwrap();
        map.add_values("a", [1, 2]).unwrap();
        map.add_values("c", [5]).unwrap();
        let values: Vec<_> = map.values().collect();
        assert_eq!(values, [1, 2, 3, 4, 5]);
        let prefixed: Vec<_> = map.values_by_prefix("b", 0).collect();
        assert_eq!(prefixed, [3, 4]);
    }

    #[test]
    fn entries_pair_keys_with_value_snapshots() {
        let mut map: SetMultimap<u8> = SetMultimap::with_seed(KeyMapping::Identity, 5);
        map.add("dog", 1).unwrap();
        map.add_key("cat").unwrap();
        let entries: Vec<_> = map.entries().collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], ("cat".to_string(), vec![]));
        assert_eq!(entries[1], ("dog".to_string(), vec![1]));
    }
}
