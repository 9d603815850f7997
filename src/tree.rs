use std::marker::PhantomData;

use debug_print::debug_println;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use slab::Slab;

use crate::mapping::KeyMapping;
use crate::node::{Node, NodeId, ValueBag};
use crate::pool::RunePool;
use crate::{Error, Result};

/// Result of a closest-prefix descent: the deepest node on which a query
/// rune matched, how far the match got, and whether the whole query was
/// consumed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PrefixAnchor {
    pub node: NodeId,
    /// Index within the node's label of the last matched rune.
    pub label_idx: usize,
    /// Number of query runes matched.
    pub matched: usize,
    pub full: bool,
}

/// Ordered multimap from mapped string keys to value collections, stored as
/// a ternary search tree balanced by treap rotations.
///
/// First runes of edge labels obey BST order across `left`/`right` links,
/// random priorities obey heap order along the same links, and `mid` links
/// continue a key past the current label. The value-collection shape (set or
/// list) is the `B` parameter; see [`SetMultimap`](crate::SetMultimap) and
/// [`ListMultimap`](crate::ListMultimap).
#[derive(Debug)]
pub struct RuneTreap<V, B> {
    arena: Slab<Node<B>>,
    root: Option<NodeId>,
    pool: RunePool,
    mapping: KeyMapping,
    rng: StdRng,
    keys_version: u32,
    values_version: u32,
    _values: PhantomData<V>,
}

impl<V: Clone, B: ValueBag<V>> RuneTreap<V, B> {
    /// Creates an empty tree with entropy-seeded priorities.
    pub fn new(mapping: KeyMapping) -> Self {
        Self::from_rng(mapping, StdRng::from_entropy())
    }

    /// Creates an empty tree with a deterministic priority stream.
    pub fn with_seed(mapping: KeyMapping, seed: u64) -> Self {
        Self::from_rng(mapping, StdRng::seed_from_u64(seed))
    }

    fn from_rng(mapping: KeyMapping, rng: StdRng) -> Self {
        RuneTreap {
            arena: Slab::new(),
            root: None,
            pool: RunePool::new(),
            mapping,
            rng,
            keys_version: 1,
            values_version: 1,
            _values: PhantomData,
        }
    }

    pub fn key_mapping(&self) -> KeyMapping {
        self.mapping
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        match self.root {
            Some(root) => {
                let node = &self.arena[root];
                node.key_count + node.is_key_end() as usize
            }
            None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Approximate heap footprint of the interned edge labels.
    pub fn label_bytes(&self) -> usize {
        self.pool.size_bytes()
    }

    // Keyed API -----------------------------------------------------------

    /// Ensures `key` is stored. Returns whether the key was newly created.
    pub fn add_key(&mut self, key: &str) -> Result<bool> {
        let runes = self.mapped_runes(key)?;
        let (_, created) = self.insert_mapped(&runes);
        Ok(created)
    }

    /// Adds one value under `key`, creating the key as needed. Returns
    /// whether the value collection changed.
    pub fn add(&mut self, key: &str, value: V) -> Result<bool> {
        let runes = self.mapped_runes(key)?;
        let (target, _) = self.insert_mapped(&runes);
        let changed = self.arena[target].values.as_mut().unwrap().insert(value);
        if changed {
            self.bump_values();
        }
        Ok(changed)
    }

    /// Adds every value in `values` under `key`.
    pub fn add_values<I>(&mut self, key: &str, values: I) -> Result<bool>
    where
        I: IntoIterator<Item = V>,
    {
        let runes = self.mapped_runes(key)?;
        let (target, _) = self.insert_mapped(&runes);
        let changed = self.arena[target].values.as_mut().unwrap().extend(values);
        if changed {
            self.bump_values();
        }
        Ok(changed)
    }

    /// Adds a batch of `(key, values)` entries.
    pub fn add_entries<K, W, I>(&mut self, entries: I) -> Result<()>
    where
        K: AsRef<str>,
        W: IntoIterator<Item = V>,
        I: IntoIterator<Item = (K, W)>,
    {
        for (key, values) in entries {
            self.add_values(key.as_ref(), values)?;
        }
        Ok(())
    }

    /// Replaces the value collection of `key` with a copy of `values`,
    /// creating the key as needed. A replacement equal to the stored
    /// collection leaves the version counters untouched.
    pub fn set<I>(&mut self, key: &str, values: I) -> Result<()>
    where
        I: IntoIterator<Item = V>,
    {
        let runes = self.mapped_runes(key)?;
        let (target, _) = self.insert_mapped(&runes);
        let mut bag = B::default();
        bag.extend(values);
        let stored = self.arena[target].values.as_mut().unwrap();
        if *stored != bag {
            *stored = bag;
            self.bump_values();
        }
        Ok(())
    }

    /// Snapshot of the values stored under `key`, or `None` when the key is
    /// absent.
    pub fn get(&self, key: &str) -> Result<Option<Vec<V>>> {
        let runes = self.mapped_runes(key)?;
        Ok(self
            .key_node(&runes)
            .map(|node| self.arena[node].values.as_ref().unwrap().snapshot()))
    }

    pub fn contains_key(&self, key: &str) -> Result<bool> {
        let runes = self.mapped_runes(key)?;
        Ok(self.key_node(&runes).is_some())
    }

    /// Whether the exact `(key, value)` pair is stored.
    pub fn contains(&self, key: &str, value: &V) -> Result<bool> {
        let runes = self.mapped_runes(key)?;
        Ok(self.key_node(&runes).map_or(false, |node| {
            self.arena[node]
                .values
                .as_ref()
                .unwrap()
                .lookup(value)
                .is_some()
        }))
    }

    /// Returns the stored element equal to `value` under `key`. The stored
    /// instance is preserved, which matters for value types whose equality
    /// ignores part of their state.
    pub fn lookup(&self, key: &str, value: &V) -> Result<Option<V>> {
        let runes = self.mapped_runes(key)?;
        Ok(self.key_node(&runes).and_then(|node| {
            self.arena[node]
                .values
                .as_ref()
                .unwrap()
                .lookup(value)
                .cloned()
        }))
    }

    /// Whether any key holds `value`. Linear in the number of entries.
    pub fn contains_value(&self, value: &V) -> bool {
        self.arena.iter().any(|(_, node)| {
            node.values
                .as_ref()
                .map_or(false, |bag| bag.lookup(value).is_some())
        })
    }

    /// Removes `key` and returns the values it held, or `None` when absent.
    pub fn remove_key(&mut self, key: &str) -> Result<Option<Vec<V>>> {
        let runes = self.mapped_runes(key)?;
        let Some(node) = self.key_node(&runes) else {
            return Ok(None);
        };
        let removed = self.arena[node].clear_key_end().unwrap().snapshot();
        if self.arena[node].key_count == 0 {
            // no key terminates below; the node itself goes away
            debug_assert!(self.arena[node].children().iter().all(Option::is_none));
            let parent = self.arena[node].parent;
            match parent {
                None => self.root = None,
                Some(p) => self.arena[p].replace_child(node, None),
            }
            self.destroy_node(node);
            if let Some(p) = parent {
                self.restore_shape(p);
            }
        } else {
            self.restore_shape(node);
        }
        if self.root.is_none() {
            debug_assert!(self.arena.is_empty());
            debug_assert!(self.pool.is_empty());
            debug_println!("runemap: last key removed, rune pool drained");
        }
        self.bump_keys();
        if !removed.is_empty() {
            self.bump_values();
        }
        Ok(Some(removed))
    }

    /// Empties the value collection of `key`, keeping the key stored.
    /// Returns the prior contents, or `None` when the key is absent.
    pub fn remove_values(&mut self, key: &str) -> Result<Option<Vec<V>>> {
        let runes = self.mapped_runes(key)?;
        let Some(node) = self.key_node(&runes) else {
            return Ok(None);
        };
        let bag = self.arena[node].values.as_mut().unwrap();
        let removed = bag.snapshot();
        if !removed.is_empty() {
            *bag = B::default();
            self.bump_values();
        }
        Ok(Some(removed))
    }

    /// Removes one occurrence of `value` under `key`. The key stays stored
    /// even when its collection becomes empty; use [`remove_key`] to drop
    /// the key itself.
    ///
    /// [`remove_key`]: Self::remove_key
    pub fn remove_pair(&mut self, key: &str, value: &V) -> Result<bool> {
        let runes = self.mapped_runes(key)?;
        let Some(node) = self.key_node(&runes) else {
            return Ok(false);
        };
        let found = self.arena[node].values.as_mut().unwrap().remove(value);
        if found {
            self.bump_values();
        }
        Ok(found)
    }

    /// Removes every key and value.
    pub fn clear(&mut self) {
        if self.root.is_none() {
            return;
        }
        let labels: Vec<_> = self.arena.iter().map(|(_, node)| node.label).collect();
        for label in labels {
            self.pool.release(label);
        }
        self.arena.clear();
        self.root = None;
        debug_assert!(self.pool.is_empty());
        self.bump_keys();
        self.bump_values();
    }

    // Marking and suggestion ----------------------------------------------

    /// Flags `key` and promotes its node to the top of its left/right
    /// cluster, so that the default suggestion for a shared prefix favors
    /// it. Returns whether the key exists.
    pub fn mark_key(&mut self, key: &str) -> Result<bool> {
        let runes = self.mapped_runes(key)?;
        let Some(node) = self.key_node(&runes) else {
            return Ok(false);
        };
        self.arena[node].marked = true;
        loop {
            let Some(parent) = self.arena[node].parent else {
                break;
            };
            if self.arena[parent].mid == Some(node) {
                break;
            }
            // the node takes over the parent's priority before the rotation,
            // so the edge toward the next ancestor stays heap-ordered
            let upper = self.arena[parent].priority;
            let lower = self.arena[node].priority;
            self.arena[parent].priority = lower;
            self.arena[node].priority = upper;
            if self.arena[parent].left == Some(node) {
                self.rotate_right(parent);
            } else {
                debug_assert_eq!(self.arena[parent].right, Some(node));
                self.rotate_left(parent);
            }
            // the demoted ancestor may now sit above a retained child that
            // outranks it; everything below is still bounded by the priority
            // the marked node took
            self.rotate_if_needed(parent);
        }
        self.bump_keys();
        Ok(true)
    }

    /// Completes `prefix` to the nearest stored key reachable by following
    /// mid links from the prefix anchor. Returns `prefix` itself when no
    /// stored key starts with it.
    pub fn suggestion_by_prefix(&self, prefix: &str) -> String {
        let mapped = self.mapping.apply(prefix);
        let runes: Vec<char> = mapped.chars().collect();
        if runes.is_empty() {
            return prefix.to_string();
        }
        let Some(anchor) = self.closest_prefix(&runes) else {
            return prefix.to_string();
        };
        if !anchor.full {
            return prefix.to_string();
        }
        let mut out: Vec<char> = runes[..anchor.matched - (anchor.label_idx + 1)].to_vec();
        let mut cur = anchor.node;
        out.extend_from_slice(self.pool.get(self.arena[cur].label));
        while !self.arena[cur].is_key_end() {
            match self.arena[cur].mid {
                Some(mid) => {
                    cur = mid;
                    out.extend_from_slice(self.pool.get(self.arena[cur].label));
                }
                None => break,
            }
        }
        out.into_iter().collect()
    }

    // Descent --------------------------------------------------------------

    /// Maps a query prefix without the non-empty requirement of keyed
    /// operations.
    pub(crate) fn map_query(&self, prefix: &str) -> Vec<char> {
        self.mapping.apply(prefix).chars().collect()
    }

    pub(crate) fn mapped_runes(&self, key: &str) -> Result<Vec<char>> {
        let runes = self.map_query(key);
        if runes.is_empty() {
            return Err(Error::EmptyKey);
        }
        Ok(runes)
    }

    /// Walks the BST/mid structure matching `query` as far as it goes.
    pub(crate) fn closest_prefix(&self, query: &[char]) -> Option<PrefixAnchor> {
        if query.is_empty() {
            return None;
        }
        let mut cur = self.root?;
        let mut qi = 0usize;
        let mut best: Option<PrefixAnchor> = None;
        loop {
            let node = &self.arena[cur];
            let label = self.pool.get(node.label);
            if query[qi] < label[0] {
                match node.left {
                    Some(left) => cur = left,
                    None => return best,
                }
            } else if query[qi] > label[0] {
                match node.right {
                    Some(right) => cur = right,
                    None => return best,
                }
            } else {
                let mut li = 0;
                while li < label.len() && qi < query.len() && label[li] == query[qi] {
                    li += 1;
                    qi += 1;
                }
                let full = qi == query.len();
                best = Some(PrefixAnchor {
                    node: cur,
                    label_idx: li - 1,
                    matched: qi,
                    full,
                });
                if full || li < label.len() {
                    return best;
                }
                match node.mid {
                    Some(mid) => cur = mid,
                    None => return best,
                }
            }
        }
    }

    /// Node terminating exactly the mapped key `runes`, if stored.
    pub(crate) fn key_node(&self, runes: &[char]) -> Option<NodeId> {
        let anchor = self.closest_prefix(runes)?;
        if !anchor.full {
            return None;
        }
        let node = &self.arena[anchor.node];
        let exact = anchor.label_idx + 1 == self.pool.get(node.label).len();
        (exact && node.is_key_end()).then_some(anchor.node)
    }

    // Insertion ------------------------------------------------------------

    /// Locates or creates the node for an already-mapped key. Returns the
    /// target node and whether a new key came into existence.
    fn insert_mapped(&mut self, runes: &[char]) -> (NodeId, bool) {
        debug_assert!(!runes.is_empty());
        let Some(root) = self.root else {
            let id = self.new_node(runes, None);
            self.root = Some(id);
            let created = self.arena[id].mark_key_end();
            debug_assert!(created);
            self.bump_keys();
            return (id, true);
        };
        let mut cur = root;
        let mut qi = 0usize;
        let target = loop {
            let label = self.pool.runes(self.arena[cur].label);
            if runes[qi] < label[0] {
                if let Some(left) = self.arena[cur].left {
                    cur = left;
                    continue;
                }
                let id = self.new_node(&runes[qi..], Some(cur));
                self.arena[cur].left = Some(id);
                break id;
            } else if runes[qi] > label[0] {
                if let Some(right) = self.arena[cur].right {
                    cur = right;
                    continue;
                }
                let id = self.new_node(&runes[qi..], Some(cur));
                self.arena[cur].right = Some(id);
                break id;
            } else {
                let mut li = 1;
                qi += 1;
                while li < label.len() && qi < runes.len() && label[li] == runes[qi] {
                    li += 1;
                    qi += 1;
                }
                match (li < label.len(), qi < runes.len()) {
                    // key and label diverge inside the label: split and keep
                    // walking from the suffix child
                    (true, true) => {
                        self.split(cur, li);
                        cur = self.arena[cur].mid.unwrap();
                    }
                    // key exhausted inside the label: the prefix half is it
                    (true, false) => {
                        self.split(cur, li);
                        break cur;
                    }
                    (false, true) => {
                        if let Some(mid) = self.arena[cur].mid {
                            cur = mid;
                            continue;
                        }
                        let id = self.new_node(&runes[qi..], Some(cur));
                        self.arena[cur].mid = Some(id);
                        break id;
                    }
                    (false, false) => break cur,
                }
            }
        };
        let created = self.arena[target].mark_key_end();
        if created {
            self.restore_shape(target);
            self.bump_keys();
        }
        (target, created)
    }

    fn new_node(&mut self, runes: &[char], parent: Option<NodeId>) -> NodeId {
        let label = self.pool.intern(runes);
        let priority = self.rng.gen();
        self.arena.insert(Node::new(label, priority, parent))
    }

    /// Splits `node`'s label at `at`, pushing the suffix (with the node's
    /// key payload and mid continuation) into a fresh mid child.
    fn split(&mut self, node: NodeId, at: usize) {
        let label = self.pool.runes(self.arena[node].label);
        debug_assert!(at >= 1 && at < label.len(), "split inside the label only");
        let suffix = self.pool.intern(&label[at..]);
        let priority = self.rng.gen();
        let mut child = Node::new(suffix, priority, Some(node));
        child.mid = self.arena[node].mid;
        child.values = self.arena[node].values.take();
        child.marked = std::mem::replace(&mut self.arena[node].marked, false);
        // the child inherits only the mid continuation; the node's left and
        // right subtrees stay where they are
        child.key_count = child.mid.map_or(0, |m| {
            self.arena[m].key_count + self.arena[m].is_key_end() as usize
        });
        let child_is_end = child.is_key_end();
        let child_id = self.arena.insert(child);
        if let Some(grand) = self.arena[child_id].mid {
            self.arena[grand].parent = Some(child_id);
        }
        let Self { arena, pool, .. } = self;
        arena[node].set_label(&label[..at], pool);
        self.arena[node].mid = Some(child_id);
        if child_is_end {
            self.arena[node].key_count += 1;
        }
    }

    // Shape restoration ----------------------------------------------------

    /// Walks from `start` to the root re-establishing structure after a
    /// mutation: reclaims routing nodes no key passes through, absorbs
    /// single-run mid chains, restores heap order, refreshes counts. May
    /// re-root the tree.
    fn restore_shape(&mut self, start: NodeId) {
        let mut cur = Some(start);
        while let Some(node) = cur {
            let parent = self.arena[node].parent;
            if self.reclaim_if_dead(node) {
                cur = parent;
                continue;
            }
            self.merge_mid(node);
            self.rotate_if_needed(node);
            self.update_counts(node);
            cur = parent;
        }
    }

    /// A node is dead when it is not a key end and has no mid child: no key
    /// passes through its label any more. Rotates it down to at most one
    /// child and splices it out. Returns whether the node was reclaimed.
    fn reclaim_if_dead(&mut self, node: NodeId) -> bool {
        {
            let n = &self.arena[node];
            if n.is_key_end() || n.mid.is_some() {
                return false;
            }
        }
        loop {
            let n = &self.arena[node];
            match (n.left, n.right) {
                (Some(left), Some(right)) => {
                    if self.arena[left].priority >= self.arena[right].priority {
                        self.rotate_right(node);
                    } else {
                        self.rotate_left(node);
                    }
                }
                (child, None) | (None, child) => {
                    self.splice(node, child);
                    return true;
                }
            }
        }
    }

    /// Replaces `node` with `child` (possibly none) in its parent slot and
    /// destroys it. The node carries no key end, so ancestor counts are
    /// unaffected.
    fn splice(&mut self, node: NodeId, child: Option<NodeId>) {
        debug_assert!(!self.arena[node].is_key_end());
        let parent = self.arena[node].parent;
        if let Some(c) = child {
            self.arena[c].parent = parent;
        }
        match parent {
            None => self.root = child,
            Some(p) => self.arena[p].replace_child(node, child),
        }
        self.destroy_node(node);
    }

    fn destroy_node(&mut self, node: NodeId) {
        let removed = self.arena.remove(node);
        self.pool.release(removed.label);
    }

    /// Concatenates `node` with its mid child when nothing distinguishes
    /// them: the node is not a key end and the mid child has no left or
    /// right child. Returns whether a merge happened.
    fn merge_mid(&mut self, node: NodeId) -> bool {
        if self.arena[node].is_key_end() {
            return false;
        }
        let Some(mid) = self.arena[node].mid else {
            return false;
        };
        if self.arena[mid].left.is_some() || self.arena[mid].right.is_some() {
            return false;
        }
        let mut joined: Vec<char> = self.pool.get(self.arena[node].label).to_vec();
        joined.extend_from_slice(self.pool.get(self.arena[mid].label));
        let absorbed = self.arena.remove(mid);
        self.pool.release(absorbed.label);
        let Self { arena, pool, .. } = self;
        arena[node].set_label(&joined, pool);
        self.arena[node].values = absorbed.values;
        self.arena[node].marked = absorbed.marked;
        self.arena[node].mid = absorbed.mid;
        if let Some(grand) = absorbed.mid {
            self.arena[grand].parent = Some(node);
        }
        self.update_counts(node);
        true
    }

    /// Restores heap order at `node` by rotating the higher-priority
    /// left/right child above it, repeating until the position settles.
    fn rotate_if_needed(&mut self, node: NodeId) {
        loop {
            let n = &self.arena[node];
            let own = n.priority;
            let left = n.left.map(|l| self.arena[l].priority);
            let right = n.right.map(|r| self.arena[r].priority);
            match (left, right) {
                (Some(lp), Some(rp)) if lp > own || rp > own => {
                    if lp >= rp {
                        self.rotate_right(node);
                    } else {
                        self.rotate_left(node);
                    }
                }
                (Some(lp), None) if lp > own => self.rotate_right(node),
                (None, Some(rp)) if rp > own => self.rotate_left(node),
                _ => return,
            }
        }
    }

    /// BST rotation lifting the left child above `node`. Parent links and
    /// descendant counts are fixed locally; priorities ride along.
    fn rotate_right(&mut self, node: NodeId) {
        let left = self.arena[node].left.unwrap();
        let inner = self.arena[left].right;
        self.arena[node].left = inner;
        if let Some(x) = inner {
            self.arena[x].parent = Some(node);
        }
        let parent = self.arena[node].parent;
        self.arena[left].right = Some(node);
        self.arena[left].parent = parent;
        self.arena[node].parent = Some(left);
        match parent {
            None => self.root = Some(left),
            Some(p) => self.arena[p].replace_child(node, Some(left)),
        }
        self.update_counts(node);
        self.update_counts(left);
    }

    /// Mirror of [`rotate_right`](Self::rotate_right).
    fn rotate_left(&mut self, node: NodeId) {
        let right = self.arena[node].right.unwrap();
        let inner = self.arena[right].left;
        self.arena[node].right = inner;
        if let Some(x) = inner {
            self.arena[x].parent = Some(node);
        }
        let parent = self.arena[node].parent;
        self.arena[right].left = Some(node);
        self.arena[right].parent = parent;
        self.arena[node].parent = Some(right);
        match parent {
            None => self.root = Some(right),
            Some(p) => self.arena[p].replace_child(node, Some(right)),
        }
        self.update_counts(node);
        self.update_counts(right);
    }

    fn update_counts(&mut self, node: NodeId) {
        let mut total = 0;
        for child in self.arena[node].children().into_iter().flatten() {
            let c = &self.arena[child];
            total += c.key_count + c.is_key_end() as usize;
        }
        self.arena[node].key_count = total;
    }

    // Versions -------------------------------------------------------------

    pub(crate) fn versions(&self) -> (u32, u32) {
        (self.keys_version, self.values_version)
    }

    fn bump_keys(&mut self) {
        self.keys_version = wrapped_bump(self.keys_version);
    }

    fn bump_values(&mut self) {
        self.values_version = wrapped_bump(self.values_version);
    }

    // Internal read access for the search cursors --------------------------

    pub(crate) fn node(&self, id: NodeId) -> &Node<B> {
        &self.arena[id]
    }

    pub(crate) fn label(&self, id: NodeId) -> &[char] {
        self.pool.get(self.arena[id].label)
    }

    pub(crate) fn root_id(&self) -> Option<NodeId> {
        self.root
    }
}

/// Counters wrap to 1, never back to 0, so a freshly constructed cursor can
/// never alias a wrapped-around tree state.
fn wrapped_bump(version: u32) -> u32 {
    if version == u32::MAX {
        1
    } else {
        version + 1
    }
}

#[cfg(test)]
impl<V: Clone, B: ValueBag<V>> RuneTreap<V, B> {
    /// Validates every structural invariant; test harness only.
    pub(crate) fn check_invariants(&self) {
        use std::collections::HashMap;
        let mut seen = 0usize;
        let mut label_uses: HashMap<crate::pool::RuneHandle, u32> = HashMap::new();
        if let Some(root) = self.root {
            assert_eq!(self.arena[root].parent, None);
            seen = self.check_subtree(root, &mut label_uses);
        }
        assert_eq!(seen, self.arena.len(), "unreachable nodes in the arena");
        assert_eq!(self.pool.len(), label_uses.len());
        for (handle, uses) in label_uses {
            assert_eq!(self.pool.refs(handle), uses, "pool refcount drift");
        }
        if self.root.is_none() {
            assert!(self.pool.is_empty());
        }
        let key_ends = self
            .arena
            .iter()
            .filter(|(_, node)| node.is_key_end())
            .count();
        assert_eq!(self.len(), key_ends);
    }

    fn check_subtree(
        &self,
        node: NodeId,
        label_uses: &mut std::collections::HashMap<crate::pool::RuneHandle, u32>,
    ) -> usize {
        let n = &self.arena[node];
        let label = self.pool.get(n.label);
        assert!(!label.is_empty());
        *label_uses.entry(n.label).or_insert(0) += 1;
        assert!(
            n.is_key_end() || n.mid.is_some(),
            "routing node without a key through it"
        );
        if let Some(left) = n.left {
            assert!(self.label(left)[0] < label[0], "BST order (left)");
            assert!(self.arena[left].priority <= n.priority, "heap order (left)");
        }
        if let Some(right) = n.right {
            assert!(self.label(right)[0] > label[0], "BST order (right)");
            assert!(
                self.arena[right].priority <= n.priority,
                "heap order (right)"
            );
        }
        let mut below = 0;
        let mut visited = 1;
        for child in n.children().into_iter().flatten() {
            assert_eq!(self.arena[child].parent, Some(node), "parent back-link");
            visited += self.check_subtree(child, label_uses);
            below += self.arena[child].key_count + self.arena[child].is_key_end() as usize;
        }
        assert_eq!(n.key_count, below, "descendant count");
        visited
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::SetValues;

    type Tree = RuneTreap<u32, SetValues<u32>>;

    fn tree() -> Tree {
        Tree::with_seed(KeyMapping::Identity, 0xC0FFEE)
    }

    #[test]
    fn single_key_becomes_the_root() {
        let mut t = tree();
        assert!(t.add_key("cat").unwrap());
        assert!(!t.add_key("cat").unwrap());
        assert_eq!(t.len(), 1);
        assert!(t.contains_key("cat").unwrap());
        assert!(!t.contains_key("ca").unwrap());
        assert!(!t.contains_key("cats").unwrap());
        t.check_invariants();
    }

    #[test]
    fn shared_prefix_splits_the_label() {
        let mut t = tree();
        t.add_key("cattle").unwrap();
        t.add_key("cat").unwrap();
        assert_eq!(t.len(), 2);
        assert!(t.contains_key("cat").unwrap());
        assert!(t.contains_key("cattle").unwrap());
        t.check_invariants();
    }

    #[test]
    fn diverging_keys_split_and_branch() {
        let mut t = tree();
        t.add_key("cater").unwrap();
        t.add_key("catus").unwrap();
        t.add_key("cat").unwrap();
        assert_eq!(t.len(), 3);
        for key in ["cater", "catus", "cat"] {
            assert!(t.contains_key(key).unwrap(), "{key}");
        }
        t.check_invariants();
    }

    #[test]
    fn empty_mapped_key_is_rejected() {
        let mut t: RuneTreap<u32, SetValues<u32>> =
            RuneTreap::with_seed(KeyMapping::CollapseWhitespace, 1);
        assert_eq!(t.add_key("   "), Err(Error::EmptyKey));
        assert_eq!(t.get("\t\n"), Err(Error::EmptyKey));
        assert!(t.is_empty());
    }

    #[test]
    fn removal_restores_the_empty_pool() {
        let mut t = tree();
        let words = ["zebra", "zonkey", "ape", "cat", "dog", "cattle", "ca"];
        for w in words {
            t.add_key(w).unwrap();
            t.check_invariants();
        }
        for w in words {
            assert!(t.remove_key(w).unwrap().is_some(), "{w}");
            t.check_invariants();
        }
        assert!(t.is_empty());
        assert_eq!(t.label_bytes(), 0);
    }

    #[test]
    fn removing_a_middle_key_keeps_descendants() {
        let mut t = tree();
        t.add_key("cat").unwrap();
        t.add_key("cattle").unwrap();
        t.add_key("catnip").unwrap();
        assert_eq!(t.remove_key("cat").unwrap(), Some(vec![]));
        assert!(!t.contains_key("cat").unwrap());
        assert!(t.contains_key("cattle").unwrap());
        assert!(t.contains_key("catnip").unwrap());
        t.check_invariants();
    }

    #[test]
    fn remove_of_absent_key_reports_absent() {
        let mut t = tree();
        t.add_key("cat").unwrap();
        let before = t.versions();
        assert_eq!(t.remove_key("dog").unwrap(), None);
        assert_eq!(t.versions(), before, "absent removal must not bump");
    }

    #[test]
    fn values_round_trip() {
        let mut t = tree();
        assert!(t.add("cow", 7).unwrap());
        assert!(!t.add("cow", 7).unwrap());
        assert!(t.add("cow", 8).unwrap());
        let mut got = t.get("cow").unwrap().unwrap();
        got.sort_unstable();
        assert_eq!(got, vec![7, 8]);
        assert!(t.contains("cow", &7).unwrap());
        assert!(!t.contains("cow", &9).unwrap());
        assert!(t.contains_value(&8));
        assert!(!t.contains_value(&9));
    }

    #[test]
    fn remove_pair_keeps_key_end() {
        let mut t = tree();
        t.add("cow", 7).unwrap();
        assert!(t.remove_pair("cow", &7).unwrap());
        assert!(!t.remove_pair("cow", &7).unwrap());
        assert!(t.contains_key("cow").unwrap());
        assert_eq!(t.get("cow").unwrap(), Some(vec![]));
        t.check_invariants();
    }

    #[test]
    fn remove_values_keeps_key_end() {
        let mut t = tree();
        t.add_values("cow", [1, 2, 3]).unwrap();
        let mut removed = t.remove_values("cow").unwrap().unwrap();
        removed.sort_unstable();
        assert_eq!(removed, vec![1, 2, 3]);
        assert_eq!(t.get("cow").unwrap(), Some(vec![]));
        t.check_invariants();
    }

    #[test]
    fn merge_mid_respects_branching_mid() {
        let mut t = tree();
        // "ca" -> mid "t" with left/right siblings below keeps "ca" intact
        t.add_key("cat").unwrap();
        t.add_key("cas").unwrap();
        t.add_key("cau").unwrap();
        t.remove_key("cat").unwrap();
        t.check_invariants();
        assert!(t.contains_key("cas").unwrap());
        assert!(t.contains_key("cau").unwrap());
        // once a single run remains, the chain compacts and lookups survive
        t.remove_key("cau").unwrap();
        t.check_invariants();
        assert!(t.contains_key("cas").unwrap());
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn clear_empties_tree_and_pool() {
        let mut t = tree();
        for w in ["dog", "donkey", "goat"] {
            t.add(w, 1).unwrap();
        }
        t.clear();
        assert!(t.is_empty());
        assert_eq!(t.len(), 0);
        assert_eq!(t.label_bytes(), 0);
        t.clear();
        t.check_invariants();
    }

    #[test]
    fn mark_key_preserves_entries() {
        let mut t = tree();
        for (i, w) in ["cat", "canary", "cow", "chicken", "crocodile"]
            .iter()
            .enumerate()
        {
            t.add(w, i as u32).unwrap();
        }
        assert!(t.mark_key("chicken").unwrap());
        assert!(!t.mark_key("cobra").unwrap());
        t.check_invariants();
        for (i, w) in ["cat", "canary", "cow", "chicken", "crocodile"]
            .iter()
            .enumerate()
        {
            assert!(t.contains(w, &(i as u32)).unwrap(), "{w}");
        }
    }

    #[test]
    fn marking_cluster_members_keeps_the_heap() {
        // promotion past an ancestor that keeps an opposite child must not
        // leave that child outranking the demoted ancestor
        for seed in 0..16 {
            let mut t = Tree::with_seed(KeyMapping::Identity, seed);
            for w in ["ape", "cat", "dog", "hawk", "zebra"] {
                t.add_key(w).unwrap();
            }
            for w in ["cat", "zebra", "ape", "dog", "hawk"] {
                t.mark_key(w).unwrap();
                t.check_invariants();
            }
        }
    }

    #[test]
    fn set_with_unchanged_contents_is_a_no_op() {
        let mut t = tree();
        t.set("cow", [1, 2]).unwrap();
        let before = t.versions();
        t.set("cow", [2, 1]).unwrap();
        assert_eq!(t.versions(), before, "equal contents must not bump");
        t.set("cow", [3]).unwrap();
        assert_ne!(t.versions(), before);
    }

    #[test]
    fn suggestion_follows_mid_chain() {
        let mut t = tree();
        t.add_key("chicken").unwrap();
        t.add_key("cheese").unwrap();
        let suggestion = t.suggestion_by_prefix("ch");
        assert!(
            suggestion == "chicken" || suggestion == "cheese",
            "{suggestion}"
        );
        assert_eq!(t.suggestion_by_prefix("zz"), "zz");
        assert_eq!(t.suggestion_by_prefix("chicken"), "chicken");
    }

    #[test]
    fn marked_key_wins_the_suggestion() {
        let mut t = tree();
        for w in ["cheese", "chalk", "chicken", "chorus"] {
            t.add_key(w).unwrap();
        }
        t.mark_key("chorus").unwrap();
        assert_eq!(t.suggestion_by_prefix("ch"), "chorus");
        t.mark_key("chalk").unwrap();
        assert_eq!(t.suggestion_by_prefix("ch"), "chalk");
        t.check_invariants();
    }
}
