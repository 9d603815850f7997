use derive_new::new;

use crate::node::{NodeId, ValueBag};
use crate::tree::RuneTreap;
use crate::{Error, Result};

/// A key yielded by a prefix search together with its measured prefix
/// distance: the number of positions within the first `|prefix|` runes at
/// which the stored key differs from the query.
#[derive(Debug, Clone, PartialEq, Eq, new)]
pub struct MeasuredKey {
    pub key: String,
    pub distance: usize,
}

/// A `(key, values, distance)` triple yielded by an entry search.
#[derive(Debug, Clone, PartialEq, Eq, new)]
pub struct MeasuredEntry<V> {
    pub key: String,
    pub values: Vec<V>,
    pub distance: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Left,
    Own,
    Mid,
    Right,
}

/// One in-order traversal frame. `prefix_len` is the number of accumulated
/// runes before this node's label; `mismatches` counts query mismatches
/// within them, `total` additionally counts this node's label (filled at the
/// `Own` stage).
#[derive(Debug, Clone, Copy)]
struct Frame {
    node: NodeId,
    stage: Stage,
    prefix_len: usize,
    mismatches: usize,
    total: usize,
    /// Anchor frame of the exact pass: left/right siblings stay untouched.
    mid_only: bool,
}

impl Frame {
    fn enter(node: NodeId, prefix_len: usize, mismatches: usize) -> Self {
        Frame {
            node,
            stage: Stage::Left,
            prefix_len,
            mismatches,
            total: mismatches,
            mid_only: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Unfiltered in-order walk of the whole tree (`keys()`/`entries()`).
    Scan,
    /// In-order walk of the prefix anchor's subtree, mid-restricted on
    /// entry: the distance-0 group.
    Exact,
    /// Full-tree walk emitting distance 1 inline and deferring greater
    /// distances into per-distance buckets.
    Fuzzy,
    /// Buckets drain in ascending distance order.
    Drain,
    Finished,
}

type Hit = (String, NodeId, usize);

/// Traversal engine shared by the key and entry cursors. Holds no borrow of
/// the tree; every step is handed the tree it was built from.
#[derive(Debug)]
struct SearchCore {
    query: Vec<char>,
    /// Effective distance ceiling, already clamped to `|query| - 1`.
    limit: usize,
    phase: Phase,
    stack: Vec<Frame>,
    /// Runes accumulated along the current mid-path, including the label of
    /// the frame currently past its `Own` stage.
    acc: Vec<char>,
    buckets: Vec<Vec<Hit>>,
    drain_distance: usize,
    drain_index: usize,
}

impl SearchCore {
    fn finished() -> Self {
        SearchCore {
            query: Vec::new(),
            limit: 0,
            phase: Phase::Finished,
            stack: Vec::new(),
            acc: Vec::new(),
            buckets: Vec::new(),
            drain_distance: 0,
            drain_index: 0,
        }
    }

    fn scan<V: Clone, B: ValueBag<V>>(tree: &RuneTreap<V, B>) -> Self {
        let mut core = SearchCore::finished();
        if let Some(root) = tree.root_id() {
            core.phase = Phase::Scan;
            core.stack.push(Frame::enter(root, 0, 0));
        }
        core
    }

    fn prefix<V: Clone, B: ValueBag<V>>(
        tree: &RuneTreap<V, B>,
        query: Vec<char>,
        max_distance: usize,
    ) -> Self {
        let mut core = SearchCore::finished();
        // an empty mapped prefix yields an empty cursor, not an error
        if query.is_empty() || tree.root_id().is_none() {
            return core;
        }
        core.limit = max_distance.min(query.len() - 1);
        core.buckets = vec![Vec::new(); core.limit + 1];
        core.phase = Phase::Exact;
        if let Some(anchor) = tree.closest_prefix(&query) {
            if anchor.full {
                let consumed_in_label = anchor.label_idx + 1;
                core.acc = query[..anchor.matched - consumed_in_label].to_vec();
                let mut frame = Frame::enter(anchor.node, core.acc.len(), 0);
                frame.mid_only = true;
                core.stack.push(frame);
            }
        }
        core.query = query;
        core
    }

    fn next_hit<V: Clone, B: ValueBag<V>>(&mut self, tree: &RuneTreap<V, B>) -> Option<Hit> {
        loop {
            match self.phase {
                Phase::Finished => return None,
                Phase::Drain => {
                    if self.drain_distance > self.limit {
                        self.phase = Phase::Finished;
                        continue;
                    }
                    if self.drain_index < self.buckets[self.drain_distance].len() {
                        let hit = self.buckets[self.drain_distance][self.drain_index].clone();
                        self.drain_index += 1;
                        return Some(hit);
                    }
                    self.drain_distance += 1;
                    self.drain_index = 0;
                }
                Phase::Scan | Phase::Exact | Phase::Fuzzy => {
                    if self.stack.is_empty() {
                        self.next_pass(tree);
                        continue;
                    }
                    if let Some(hit) = self.step(tree) {
                        return Some(hit);
                    }
                }
            }
        }
    }

    fn next_pass<V: Clone, B: ValueBag<V>>(&mut self, tree: &RuneTreap<V, B>) {
        self.acc.clear();
        match self.phase {
            Phase::Scan => self.phase = Phase::Finished,
            Phase::Exact => match tree.root_id() {
                Some(root) if self.limit >= 1 => {
                    self.phase = Phase::Fuzzy;
                    self.stack.push(Frame::enter(root, 0, 0));
                }
                _ => self.phase = Phase::Finished,
            },
            Phase::Fuzzy => {
                self.phase = Phase::Drain;
                self.drain_distance = 2;
                self.drain_index = 0;
            }
            Phase::Drain | Phase::Finished => self.phase = Phase::Finished,
        }
    }

    /// Runs one stage of the frame on top of the stack.
    fn step<V: Clone, B: ValueBag<V>>(&mut self, tree: &RuneTreap<V, B>) -> Option<Hit> {
        let top = self.stack.len() - 1;
        let frame = self.stack[top];
        let node = tree.node(frame.node);
        match frame.stage {
            Stage::Left => {
                self.stack[top].stage = Stage::Own;
                debug_assert_eq!(self.acc.len(), frame.prefix_len);
                if !frame.mid_only {
                    if let Some(left) = node.left {
                        self.stack
                            .push(Frame::enter(left, frame.prefix_len, frame.mismatches));
                    }
                }
                None
            }
            Stage::Own => {
                let label = tree.label(frame.node);
                let mut total = frame.mismatches;
                for (offset, &rune) in label.iter().enumerate() {
                    let pos = frame.prefix_len + offset;
                    if pos < self.query.len() && self.query[pos] != rune {
                        total += 1;
                    }
                }
                self.acc.extend_from_slice(label);
                self.stack[top].stage = Stage::Mid;
                self.stack[top].total = total;
                if node.is_key_end() {
                    self.consider(frame.node, total)
                } else {
                    None
                }
            }
            Stage::Mid => {
                self.stack[top].stage = Stage::Right;
                if let Some(mid) = node.mid {
                    if self.wants_mid(frame.total) {
                        self.stack.push(Frame::enter(mid, self.acc.len(), frame.total));
                    }
                }
                None
            }
            Stage::Right => {
                self.acc.truncate(frame.prefix_len);
                self.stack.pop();
                if !frame.mid_only {
                    if let Some(right) = node.right {
                        self.stack
                            .push(Frame::enter(right, frame.prefix_len, frame.mismatches));
                    }
                }
                None
            }
        }
    }

    /// Whether the mid subtree below the current frame can still contribute.
    fn wants_mid(&self, total: usize) -> bool {
        match self.phase {
            Phase::Fuzzy => {
                if total > self.limit {
                    // mid descendants only accumulate further mismatches
                    return false;
                }
                // a settled exact subtree was already emitted by the first pass
                !(total == 0 && self.acc.len() >= self.query.len())
            }
            _ => true,
        }
    }

    /// Emits, defers, or drops the key ending at `node`.
    fn consider(&mut self, node: NodeId, total: usize) -> Option<Hit> {
        match self.phase {
            Phase::Scan => Some((self.key_string(), node, 0)),
            Phase::Exact => {
                debug_assert!(total == 0 && self.acc.len() >= self.query.len());
                Some((self.key_string(), node, 0))
            }
            Phase::Fuzzy => {
                if self.acc.len() < self.query.len() {
                    // the stored key is shorter than the prefix: undefined
                    return None;
                }
                match total {
                    0 => None,
                    1 => Some((self.key_string(), node, 1)),
                    d if d <= self.limit => {
                        let hit = (self.key_string(), node, d);
                        self.buckets[d].push(hit);
                        None
                    }
                    _ => None,
                }
            }
            Phase::Drain | Phase::Finished => None,
        }
    }

    fn key_string(&self) -> String {
        self.acc.iter().collect()
    }
}

#[derive(Debug)]
enum Position<T> {
    Fresh,
    At(T),
    Done,
}

/// Forward-only cursor over keys. Snapshots the tree's keys version at
/// construction and rejects any later structural change with
/// [`Error::ConcurrentModification`]; value-only mutations are tolerated.
#[derive(Debug)]
pub struct KeysCursor {
    core: SearchCore,
    keys_version: u32,
    position: Position<MeasuredKey>,
}

impl KeysCursor {
    pub fn advance<V: Clone, B: ValueBag<V>>(
        &mut self,
        tree: &RuneTreap<V, B>,
    ) -> Result<Option<MeasuredKey>> {
        if tree.versions().0 != self.keys_version {
            return Err(Error::ConcurrentModification);
        }
        match self.core.next_hit(tree) {
            Some((key, _, distance)) => {
                let item = MeasuredKey::new(key, distance);
                self.position = Position::At(item.clone());
                Ok(Some(item))
            }
            None => {
                self.position = Position::Done;
                Ok(None)
            }
        }
    }

    /// The most recently yielded key. Fails with
    /// [`Error::CursorNotPositioned`] before the first advance and after
    /// exhaustion.
    pub fn current(&self) -> Result<&MeasuredKey> {
        match &self.position {
            Position::At(item) => Ok(item),
            _ => Err(Error::CursorNotPositioned),
        }
    }
}

/// Forward-only cursor over `(key, values, distance)` entries. Sensitive to
/// both key-set and value mutations.
#[derive(Debug)]
pub struct EntriesCursor<V> {
    core: SearchCore,
    keys_version: u32,
    values_version: u32,
    position: Position<MeasuredEntry<V>>,
}

impl<V: Clone> EntriesCursor<V> {
    pub fn advance<B: ValueBag<V>>(
        &mut self,
        tree: &RuneTreap<V, B>,
    ) -> Result<Option<MeasuredEntry<V>>> {
        if tree.versions() != (self.keys_version, self.values_version) {
            return Err(Error::ConcurrentModification);
        }
        match self.core.next_hit(tree) {
            Some((key, node, distance)) => {
                let values = tree.node(node).values.as_ref().unwrap().snapshot();
                let item = MeasuredEntry::new(key, values, distance);
                self.position = Position::At(item.clone());
                Ok(Some(item))
            }
            None => {
                self.position = Position::Done;
                Ok(None)
            }
        }
    }

    pub fn current(&self) -> Result<&MeasuredEntry<V>> {
        match &self.position {
            Position::At(item) => Ok(item),
            _ => Err(Error::CursorNotPositioned),
        }
    }
}

impl<V: Clone, B: ValueBag<V>> RuneTreap<V, B> {
    /// Detached cursor over every key in order.
    pub fn keys_cursor(&self) -> KeysCursor {
        KeysCursor {
            core: SearchCore::scan(self),
            keys_version: self.versions().0,
            position: Position::Fresh,
        }
    }

    /// Detached cursor over keys within `max_distance` of `prefix`, exact
    /// matches first, then ascending distance groups. An empty mapped
    /// prefix yields an exhausted cursor.
    pub fn keys_by_prefix_cursor(&self, prefix: &str, max_distance: usize) -> KeysCursor {
        KeysCursor {
            core: SearchCore::prefix(self, self.map_query(prefix), max_distance),
            keys_version: self.versions().0,
            position: Position::Fresh,
        }
    }

    /// Detached cursor over every `(key, values)` entry in key order.
    pub fn entries_cursor(&self) -> EntriesCursor<V> {
        let (keys_version, values_version) = self.versions();
        EntriesCursor {
            core: SearchCore::scan(self),
            keys_version,
            values_version,
            position: Position::Fresh,
        }
    }

    /// Detached cursor over entries within `max_distance` of `prefix`.
    pub fn entries_by_prefix_cursor(&self, prefix: &str, max_distance: usize) -> EntriesCursor<V> {
        let (keys_version, values_version) = self.versions();
        EntriesCursor {
            core: SearchCore::prefix(self, self.map_query(prefix), max_distance),
            keys_version,
            values_version,
            position: Position::Fresh,
        }
    }
}
