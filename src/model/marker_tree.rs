use std::cmp::{max, Ordering};
use std::collections::HashMap;

use crate::config::MarkerTreeConfig;
use crate::error::Result;
use crate::model::edit::DocumentChange;
use crate::model::marker::{
    apply_change, Affinity, MarkerId, MarkerOptions, Taste, TasteSet, TextRange,
};
use crate::model::marker_iter::OverlappingIter;

// ---
// 1. Core Data Structures
// ---

/// Index of a node in the tree's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct NodeId(u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// A tree node: one bucket of markers sharing range, affinity and layer
///
/// `start` and `end` are relative to the accumulated `delta` of the node's
/// strict ancestors; the node's own `delta` applies to itself and its whole
/// subtree. `max_end` is kept in the same frame as `end`, so the real
/// maximum end of a subtree is `max_end + delta + (ancestor deltas)`.
#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub(crate) start: i64,
    pub(crate) end: i64,
    pub(crate) delta: i64,
    /// Augmentation: the max `end` in this node's subtree
    pub(crate) max_end: i64,

    pub(crate) parent: Option<NodeId>,
    pub(crate) left: Option<NodeId>,
    pub(crate) right: Option<NodeId>,
    red: bool,

    pub(crate) affinity: Affinity,
    pub(crate) layer: i32,
    /// Never empty while the node is linked into the tree
    pub(crate) markers: Vec<MarkerId>,

    own_value: u64,
    /// Augmentation: sum of marker values in this subtree
    value_sum: u64,
    pub(crate) own_tastes: u32,
    /// Augmentation: union of marker tastes in this subtree
    pub(crate) taste_mask: u32,
}

impl Node {
    fn detached(range: TextRange, affinity: Affinity, layer: i32) -> Self {
        Self {
            start: range.start as i64,
            end: range.end as i64,
            delta: 0,
            max_end: range.end as i64,
            parent: None,
            left: None,
            right: None,
            red: true,
            affinity,
            layer,
            markers: Vec::new(),
            own_value: 0,
            value_sum: 0,
            own_tastes: 0,
            taste_mask: 0,
        }
    }

    fn key(&self, delta: i64) -> NodeKey {
        NodeKey {
            start: self.start + delta,
            end: self.end + delta,
            affinity: self.affinity,
            layer: self.layer,
        }
    }
}

/// Ordering key of a node
///
/// Sorted by start, then greedy-to-left nodes first, then shorter ranges
/// first, then non-greedy-to-right first, then non-sticking first, then by
/// layer. Two markers with equal keys share a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NodeKey {
    start: i64,
    end: i64,
    affinity: Affinity,
    layer: i32,
}

impl Ord for NodeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start
            .cmp(&other.start)
            .then_with(|| {
                other
                    .affinity
                    .greedy_to_left
                    .cmp(&self.affinity.greedy_to_left)
            })
            .then_with(|| (self.end - self.start).cmp(&(other.end - other.start)))
            .then_with(|| {
                self.affinity
                    .greedy_to_right
                    .cmp(&other.affinity.greedy_to_right)
            })
            .then_with(|| {
                self.affinity
                    .sticking_to_right
                    .cmp(&other.affinity.sticking_to_right)
            })
            .then_with(|| self.layer.cmp(&other.layer))
    }
}

impl PartialOrd for NodeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Per-marker bookkeeping, kept for the marker's whole lifetime
#[derive(Debug, Clone)]
struct MarkerSlot {
    /// `None` once the marker has been invalidated or disposed
    node: Option<NodeId>,
    /// Last known range; authoritative only while `node` is `None`
    range: TextRange,
    affinity: Affinity,
    layer: i32,
    value: u64,
    tastes: TasteSet,
}

/// Red-black interval tree holding all range markers of one document
///
/// Markers are grouped into nodes by `(range, affinity, layer)`. Document
/// edits shift whole subtrees through lazy deltas, so only the markers that
/// touch the edited area are visited individually.
#[derive(Debug)]
pub struct MarkerTree {
    nodes: Vec<Node>,
    free_list: Vec<NodeId>,
    root: Option<NodeId>,
    /// ID-to-slot map for O(1) lookups
    markers: HashMap<MarkerId, MarkerSlot>,
    next_id: u64,
    valid_markers: usize,
    node_count: usize,
    config: MarkerTreeConfig,
}

impl Default for MarkerTree {
    fn default() -> Self {
        Self::new()
    }
}

// ---
// 2. Public API
// ---

impl MarkerTree {
    pub fn new() -> Self {
        Self::with_config(MarkerTreeConfig::default())
    }

    pub fn with_config(config: MarkerTreeConfig) -> Self {
        Self {
            nodes: Vec::with_capacity(config.initial_capacity),
            free_list: Vec::new(),
            root: None,
            markers: HashMap::new(),
            next_id: 0,
            valid_markers: 0,
            node_count: 0,
            config,
        }
    }

    pub fn config(&self) -> &MarkerTreeConfig {
        &self.config
    }

    /// Register a marker over `[start, end)`.
    ///
    /// The tree does not know the document length; bounds against the text
    /// are checked by the owning `Document`.
    pub fn add_interval(
        &mut self,
        start: usize,
        end: usize,
        options: MarkerOptions,
    ) -> Result<MarkerId> {
        let range = TextRange::checked(start, end)?;
        let id = MarkerId(self.next_id);
        self.next_id += 1;

        self.markers.insert(
            id,
            MarkerSlot {
                node: None,
                range,
                affinity: options.affinity,
                layer: options.layer,
                value: options.value,
                tastes: options.tastes,
            },
        );
        self.attach(vec![id], range, options.affinity, options.layer);
        self.valid_markers += 1;

        self.after_mutation("add_interval");
        Ok(id)
    }

    /// Remove a marker from the tree, whether or not it is still valid.
    ///
    /// Returns false for unknown ids and markers that were already removed.
    /// The marker keeps reporting its last range afterwards.
    pub fn remove_interval(&mut self, id: MarkerId) -> bool {
        let Some(slot) = self.markers.get(&id) else {
            return false;
        };
        let Some(node) = slot.node else {
            return false;
        };

        let range = self.node_range(node);
        if let Some(slot) = self.markers.get_mut(&id) {
            slot.node = None;
            slot.range = range;
        }
        self.detach_marker(node, id);
        self.valid_markers -= 1;

        self.after_mutation("remove_interval");
        true
    }

    /// Forget a marker entirely, including its last known range
    pub fn forget(&mut self, id: MarkerId) -> bool {
        self.remove_interval(id);
        self.markers.remove(&id).is_some()
    }

    /// Current range of a valid marker, or the last valid range of an
    /// invalidated one
    pub fn range(&self, id: MarkerId) -> Option<TextRange> {
        let slot = self.markers.get(&id)?;
        Some(match slot.node {
            Some(node) => self.node_range(node),
            None => slot.range,
        })
    }

    pub fn is_valid(&self, id: MarkerId) -> bool {
        self.markers.get(&id).is_some_and(|slot| slot.node.is_some())
    }

    pub fn contains(&self, id: MarkerId) -> bool {
        self.markers.contains_key(&id)
    }

    /// Number of markers the tree still remembers, valid or not
    pub fn tracked_len(&self) -> usize {
        self.markers.len()
    }

    /// Drop the last known ranges of every invalidated or removed marker.
    ///
    /// Returns how many markers were forgotten.
    pub fn forget_invalid(&mut self) -> usize {
        let before = self.markers.len();
        self.markers.retain(|_, slot| slot.node.is_some());
        let forgotten = before - self.markers.len();
        if forgotten > 0 {
            tracing::debug!(forgotten, "invalid markers forgotten");
        }
        forgotten
    }

    pub fn value(&self, id: MarkerId) -> Option<u64> {
        self.markers.get(&id).map(|slot| slot.value)
    }

    pub fn tastes(&self, id: MarkerId) -> Option<TasteSet> {
        self.markers.get(&id).map(|slot| slot.tastes)
    }

    pub fn affinity(&self, id: MarkerId) -> Option<Affinity> {
        self.markers.get(&id).map(|slot| slot.affinity)
    }

    pub fn layer(&self, id: MarkerId) -> Option<i32> {
        self.markers.get(&id).map(|slot| slot.layer)
    }

    /// Number of valid markers
    pub fn len(&self) -> usize {
        self.valid_markers
    }

    pub fn is_empty(&self) -> bool {
        self.valid_markers == 0
    }

    /// Number of nodes linked into the tree
    pub fn node_count(&self) -> usize {
        self.node_count
    }

    /// Height of the tree, counting nodes (0 for an empty tree)
    pub fn max_height(&self) -> usize {
        fn height(tree: &MarkerTree, node: Option<NodeId>) -> usize {
            match node {
                None => 0,
                Some(n) => 1 + max(height(tree, tree.left(n)), height(tree, tree.right(n))),
            }
        }
        height(self, self.root)
    }

    /// Translate every marker through `change`.
    ///
    /// Markers away from the change are shifted lazily. Markers touching it
    /// are taken out, translated with `apply_change` and put back; those
    /// that no longer make sense, or end past `document_len`, are
    /// invalidated and keep their pre-change range.
    pub fn update_on_change(&mut self, change: &DocumentChange, document_len: usize) {
        let Some(root) = self.root else {
            return;
        };

        let mut affected = Vec::new();
        self.collect_affected(
            root,
            change.offset as i64,
            change.old_end() as i64,
            change.length_delta(),
            &mut affected,
        );

        for &(node, _) in &affected {
            self.unlink(node);
        }

        let mut invalidated = 0;
        for (node, old_range) in affected {
            let affinity = self.nodes[node.index()].affinity;
            match apply_change(old_range, affinity, change).filter(|r| r.end <= document_len) {
                Some(new_range) => {
                    self.reset_detached(node, new_range);
                    self.insert_or_merge(node);
                }
                None => {
                    invalidated += self.invalidate_node(node, old_range);
                }
            }
        }

        if invalidated > 0 {
            tracing::debug!(
                offset = change.offset,
                old_len = change.old_len(),
                new_len = change.new_len(),
                invalidated,
                "markers invalidated by change"
            );
        }

        self.after_mutation("update_on_change");
    }

    /// Move every marker lying inside `[src_start, src_end]` (closed) by
    /// `dst - src_start`.
    ///
    /// Used by text moves: after the moved text has been copied to `dst`,
    /// markers inside the original are re-pointed at the copy before the
    /// original is deleted.
    pub fn retarget(&mut self, src_start: usize, src_end: usize, dst: usize) {
        let mut found = Vec::new();
        self.collect_contained(
            self.root,
            0,
            src_start as i64,
            src_end as i64,
            &mut found,
        );

        let delta = dst as i64 - src_start as i64;
        for &(node, _) in &found {
            self.unlink(node);
        }
        for (node, range) in found {
            self.reset_detached(node, range.shifted(delta));
            self.insert_or_merge(node);
        }

        self.after_mutation("retarget");
    }

    /// Sum of the values of all valid markers with `start <= offset`
    pub fn sum_of_values_up_to(&self, offset: usize) -> u64 {
        let offset = offset as i64;
        let mut sum: u64 = 0;
        let mut delta = 0;
        let mut cur = self.root;
        while let Some(n) = cur {
            let node = &self.nodes[n.index()];
            delta += node.delta;
            if node.start + delta <= offset {
                let left = node.left.map_or(0, |l| self.nodes[l.index()].value_sum);
                sum = sum.saturating_add(node.own_value).saturating_add(left);
                cur = node.right;
            } else {
                cur = node.left;
            }
        }
        sum
    }

    /// Change a marker's value. Invalid markers just record it.
    pub fn set_value(&mut self, id: MarkerId, value: u64) -> bool {
        let Some(slot) = self.markers.get_mut(&id) else {
            return false;
        };
        slot.value = value;
        if let Some(node) = slot.node {
            self.refresh_own(node);
            self.update_up(Some(node));
            self.after_mutation("set_value");
        }
        true
    }

    pub fn set_tastes(&mut self, id: MarkerId, tastes: TasteSet) -> bool {
        let Some(slot) = self.markers.get_mut(&id) else {
            return false;
        };
        slot.tastes = tastes;
        if let Some(node) = slot.node {
            self.refresh_own(node);
            self.update_up(Some(node));
            self.after_mutation("set_tastes");
        }
        true
    }

    /// Change the affinity and layer of a marker, moving it to the node
    /// matching its new identity. Value and tastes are replaced as well.
    pub fn change_attributes(&mut self, id: MarkerId, options: MarkerOptions) -> bool {
        let Some(slot) = self.markers.get(&id) else {
            return false;
        };
        let node = slot.node;
        let range = self.range(id).unwrap_or(slot.range);

        if let Some(node) = node {
            self.detach_marker(node, id);
        }
        if let Some(slot) = self.markers.get_mut(&id) {
            slot.affinity = options.affinity;
            slot.layer = options.layer;
            slot.value = options.value;
            slot.tastes = options.tastes;
            slot.range = range;
            slot.node = None;
        }
        if node.is_some() {
            self.attach(vec![id], range, options.affinity, options.layer);
        }

        self.after_mutation("change_attributes");
        true
    }

    /// Invalidate every marker, keeping their last ranges
    pub fn clear(&mut self) {
        let mut all = Vec::new();
        self.collect_contained(self.root, 0, i64::MIN, i64::MAX, &mut all);
        for (node, range) in all {
            for id in &self.nodes[node.index()].markers {
                if let Some(slot) = self.markers.get_mut(id) {
                    slot.node = None;
                    slot.range = range;
                }
            }
        }

        self.nodes.clear();
        self.free_list.clear();
        self.root = None;
        self.valid_markers = 0;
        self.node_count = 0;
        tracing::debug!("marker tree cleared");
    }

    /// Markers overlapping `[start, end]`, touching counts, in tree order
    pub fn overlapping(&self, start: usize, end: usize) -> OverlappingIter<'_> {
        OverlappingIter::new(self, start as i64, end as i64, None)
    }

    /// Like `overlapping`, restricted to markers carrying `taste`.
    ///
    /// Subtrees without any marker of that taste are skipped, so a rare
    /// taste costs time proportional to the markers found, not to all
    /// markers in the range.
    pub fn overlapping_delicious(
        &self,
        start: usize,
        end: usize,
        taste: Taste,
    ) -> OverlappingIter<'_> {
        OverlappingIter::new(self, start as i64, end as i64, Some(taste))
    }

    /// All valid markers in tree order
    pub fn iter(&self) -> OverlappingIter<'_> {
        OverlappingIter::new(self, i64::MIN, i64::MAX, None)
    }

    // ---
    // 3. Processors
    // ---

    /// Feed every valid marker to `processor` in tree order.
    /// Returns false if the processor stopped early.
    pub fn process_all(&self, mut processor: impl FnMut(MarkerId) -> bool) -> bool {
        self.process_subtree(self.root, &mut processor)
    }

    /// Markers with `max(start, m.start) <= min(end, m.end)`
    pub fn process_overlapping_with(
        &self,
        start: usize,
        end: usize,
        mut processor: impl FnMut(MarkerId) -> bool,
    ) -> bool {
        self.process_overlapping(self.root, 0, start as i64, end as i64, &mut processor)
    }

    /// Markers with `m.start <= offset < m.end`
    pub fn process_containing(
        &self,
        offset: usize,
        mut processor: impl FnMut(MarkerId) -> bool,
    ) -> bool {
        let offset = offset as i64;
        self.process_overlapping(self.root, 0, offset, offset, &mut |id| {
            match self.range(id) {
                Some(range) if range.contains_offset(offset as usize) => processor(id),
                _ => true,
            }
        })
    }

    /// Markers not contained in `[start, end]`: those that start before it
    /// or end after it
    pub fn process_overlapping_with_outside(
        &self,
        start: usize,
        end: usize,
        mut processor: impl FnMut(MarkerId) -> bool,
    ) -> bool {
        self.process_outside(self.root, 0, start as i64, end as i64, &mut processor)
    }

    /// The marker following `id` in tree order
    pub fn find_marker_after(&self, id: MarkerId) -> Option<MarkerId> {
        let node = self.markers.get(&id)?.node?;
        let bucket = &self.nodes[node.index()].markers;
        let pos = bucket.iter().position(|m| *m == id)?;
        if let Some(next) = bucket.get(pos + 1) {
            return Some(*next);
        }
        self.successor(node)
            .and_then(|n| self.nodes[n.index()].markers.first().copied())
    }

    /// The marker preceding `id` in tree order
    pub fn find_marker_before(&self, id: MarkerId) -> Option<MarkerId> {
        let node = self.markers.get(&id)?.node?;
        let bucket = &self.nodes[node.index()].markers;
        let pos = bucket.iter().position(|m| *m == id)?;
        if pos > 0 {
            return Some(bucket[pos - 1]);
        }
        self.predecessor(node)
            .and_then(|n| self.nodes[n.index()].markers.last().copied())
    }

    fn process_subtree(
        &self,
        node: Option<NodeId>,
        processor: &mut impl FnMut(MarkerId) -> bool,
    ) -> bool {
        let Some(n) = node else {
            return true;
        };
        let node = &self.nodes[n.index()];
        self.process_subtree(node.left, processor)
            && node.markers.iter().all(|id| processor(*id))
            && self.process_subtree(node.right, processor)
    }

    fn process_overlapping(
        &self,
        node: Option<NodeId>,
        delta_above: i64,
        start: i64,
        end: i64,
        processor: &mut impl FnMut(MarkerId) -> bool,
    ) -> bool {
        let Some(n) = node else {
            return true;
        };
        let node = &self.nodes[n.index()];
        let delta = delta_above + node.delta;
        if start > node.max_end + delta {
            return true;
        }
        if !self.process_overlapping(node.left, delta, start, end, processor) {
            return false;
        }
        let node_start = node.start + delta;
        if node_start > end {
            return true;
        }
        if node.end + delta >= start && !node.markers.iter().all(|id| processor(*id)) {
            return false;
        }
        self.process_overlapping(node.right, delta, start, end, processor)
    }

    fn process_outside(
        &self,
        node: Option<NodeId>,
        delta_above: i64,
        start: i64,
        end: i64,
        processor: &mut impl FnMut(MarkerId) -> bool,
    ) -> bool {
        let Some(n) = node else {
            return true;
        };
        let node = &self.nodes[n.index()];
        let delta = delta_above + node.delta;
        let node_start = node.start + delta;
        if !self.process_outside(node.left, delta, start, end, processor) {
            return false;
        }
        if (node_start < start || node.end + delta > end)
            && !node.markers.iter().all(|id| processor(*id))
        {
            return false;
        }
        // everything to the right starts inside the range and ends before its end
        if node_start >= start && node.max_end + delta <= end {
            return true;
        }
        self.process_outside(node.right, delta, start, end, processor)
    }

    // ---
    // 4. Iteration support
    // ---

    pub(crate) fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub(crate) fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub(crate) fn marker_tastes(&self, id: MarkerId) -> TasteSet {
        self.markers
            .get(&id)
            .map_or(TasteSet::empty(), |slot| slot.tastes)
    }

    // ---
    // 5. Self-check
    // ---

    /// Check every structural property of the tree: red-black balance,
    /// parent links, key order, the three aggregates, marker back
    /// references and the counters.
    pub fn verify_properties(&self) -> std::result::Result<(), String> {
        if let Some(root) = self.root {
            if self.nodes[root.index()].red {
                return Err("root is red".to_string());
            }
            if self.nodes[root.index()].parent.is_some() {
                return Err("root has a parent".to_string());
            }
        }

        let mut stats = VerifyStats::default();
        self.verify_node(self.root, None, 0, &mut stats)?;

        if stats.nodes != self.node_count {
            return Err(format!(
                "node count {} does not match {} linked nodes",
                self.node_count, stats.nodes
            ));
        }
        if stats.markers != self.valid_markers {
            return Err(format!(
                "valid marker count {} does not match {} markers in nodes",
                self.valid_markers, stats.markers
            ));
        }
        let attached = self
            .markers
            .values()
            .filter(|slot| slot.node.is_some())
            .count();
        if attached != self.valid_markers {
            return Err(format!(
                "{attached} markers point at nodes, expected {}",
                self.valid_markers
            ));
        }
        Ok(())
    }

    fn verify_node(
        &self,
        node: Option<NodeId>,
        expected_parent: Option<NodeId>,
        delta_above: i64,
        stats: &mut VerifyStats,
    ) -> std::result::Result<Subtree, String> {
        let Some(n) = node else {
            return Ok(Subtree::default());
        };
        let node = &self.nodes[n.index()];
        if node.parent != expected_parent {
            return Err(format!(
                "{n:?} has parent {:?}, expected {expected_parent:?}",
                node.parent
            ));
        }
        if node.red && (self.is_red(node.left) || self.is_red(node.right)) {
            return Err(format!("red node {n:?} has a red child"));
        }

        let delta = delta_above + node.delta;
        let left = self.verify_node(node.left, Some(n), delta, stats)?;

        let key = node.key(delta);
        if key.start < 0 || key.start > key.end {
            return Err(format!(
                "{n:?} has invalid range {}..{}",
                key.start, key.end
            ));
        }
        if let Some(prev) = stats.previous_key {
            if prev >= key {
                return Err(format!("{n:?} is out of order: {prev:?} >= {key:?}"));
            }
        }
        stats.previous_key = Some(key);
        self.verify_bucket(n, node)?;
        stats.nodes += 1;
        stats.markers += node.markers.len();

        let right = self.verify_node(node.right, Some(n), delta, stats)?;

        if left.black_height != right.black_height {
            return Err(format!(
                "{n:?} has black heights {} and {}",
                left.black_height, right.black_height
            ));
        }

        let mut max_end = key.end;
        for child in [left.max_end, right.max_end].into_iter().flatten() {
            max_end = max(max_end, child);
        }
        if node.max_end + delta != max_end {
            return Err(format!(
                "{n:?} caches max_end {}, actual {max_end}",
                node.max_end + delta
            ));
        }
        let value_sum = node
            .own_value
            .saturating_add(left.value_sum)
            .saturating_add(right.value_sum);
        if node.value_sum != value_sum {
            return Err(format!(
                "{n:?} caches value sum {}, actual {value_sum}",
                node.value_sum
            ));
        }
        let taste_mask = node.own_tastes | left.taste_mask | right.taste_mask;
        if node.taste_mask != taste_mask {
            return Err(format!(
                "{n:?} caches taste mask {:#x}, actual {taste_mask:#x}",
                node.taste_mask
            ));
        }

        Ok(Subtree {
            black_height: left.black_height + usize::from(!node.red),
            max_end: Some(max_end),
            value_sum,
            taste_mask,
        })
    }

    fn verify_bucket(&self, n: NodeId, node: &Node) -> std::result::Result<(), String> {
        if node.markers.is_empty() {
            return Err(format!("{n:?} is linked with no markers"));
        }
        let mut value: u64 = 0;
        let mut tastes = 0;
        for id in &node.markers {
            let Some(slot) = self.markers.get(id) else {
                return Err(format!("{n:?} holds unknown marker {id:?}"));
            };
            if slot.node != Some(n) {
                return Err(format!("{id:?} in {n:?} points at {:?}", slot.node));
            }
            if slot.affinity != node.affinity || slot.layer != node.layer {
                return Err(format!("{id:?} does not match the identity of {n:?}"));
            }
            value = value.saturating_add(slot.value);
            tastes |= slot.tastes.bits();
        }
        if value != node.own_value || tastes != node.own_tastes {
            return Err(format!("{n:?} has stale per-node value or tastes"));
        }
        Ok(())
    }

    fn after_mutation(&self, operation: &str) {
        if !self.config.verify_after_mutation {
            return;
        }
        if let Err(msg) = self.verify_properties() {
            tracing::error!(operation, "marker tree corrupted: {msg}");
            panic!("marker tree corrupted after {operation}: {msg}");
        }
    }
}

#[derive(Debug, Default)]
struct VerifyStats {
    previous_key: Option<NodeKey>,
    nodes: usize,
    markers: usize,
}

#[derive(Debug, Default)]
struct Subtree {
    black_height: usize,
    /// Real max end, `None` for an empty subtree
    max_end: Option<i64>,
    value_sum: u64,
    taste_mask: u32,
}

// ---
// 6. Node Helpers (Pushing Deltas, Aggregates, Buckets)
// ---

impl MarkerTree {
    fn left(&self, n: NodeId) -> Option<NodeId> {
        self.nodes[n.index()].left
    }

    fn right(&self, n: NodeId) -> Option<NodeId> {
        self.nodes[n.index()].right
    }

    fn parent(&self, n: NodeId) -> Option<NodeId> {
        self.nodes[n.index()].parent
    }

    fn is_red(&self, n: Option<NodeId>) -> bool {
        n.is_some_and(|n| self.nodes[n.index()].red)
    }

    fn set_red(&mut self, n: NodeId, red: bool) {
        self.nodes[n.index()].red = red;
    }

    fn alloc_node(&mut self, node: Node) -> NodeId {
        match self.free_list.pop() {
            Some(id) => {
                self.nodes[id.index()] = node;
                id
            }
            None => {
                let id = NodeId(self.nodes.len() as u32);
                self.nodes.push(node);
                id
            }
        }
    }

    fn free_node(&mut self, n: NodeId) {
        let node = &mut self.nodes[n.index()];
        node.markers.clear();
        node.parent = None;
        node.left = None;
        node.right = None;
        self.free_list.push(n);
    }

    /// Real range of a linked node
    fn node_range(&self, n: NodeId) -> TextRange {
        let node = &self.nodes[n.index()];
        let mut delta = 0;
        let mut cur = Some(n);
        while let Some(c) = cur {
            delta += self.nodes[c.index()].delta;
            cur = self.parent(c);
        }
        TextRange::new((node.start + delta) as usize, (node.end + delta) as usize)
    }

    /// Pushes this node's delta down to its immediate children.
    /// Only valid when every ancestor's delta is zero.
    fn push_delta(&mut self, n: NodeId) {
        let node = &mut self.nodes[n.index()];
        let delta = node.delta;
        if delta == 0 {
            return;
        }
        node.start += delta;
        node.end += delta;
        node.max_end += delta;
        node.delta = 0;
        let (left, right) = (node.left, node.right);
        for child in [left, right].into_iter().flatten() {
            self.nodes[child.index()].delta += delta;
        }
    }

    /// Zero the deltas from the root down to `n`, so `n` holds real offsets
    fn push_path(&mut self, n: NodeId) {
        let mut path = Vec::new();
        let mut cur = Some(n);
        while let Some(c) = cur {
            path.push(c);
            cur = self.parent(c);
        }
        for &c in path.iter().rev() {
            self.push_delta(c);
        }
    }

    fn update_aggregates(&mut self, n: NodeId) {
        let node = &self.nodes[n.index()];
        let mut max_end = node.end;
        let mut value_sum = node.own_value;
        let mut taste_mask = node.own_tastes;
        for child in [node.left, node.right].into_iter().flatten() {
            let child = &self.nodes[child.index()];
            max_end = max(max_end, child.max_end + child.delta);
            value_sum = value_sum.saturating_add(child.value_sum);
            taste_mask |= child.taste_mask;
        }
        let node = &mut self.nodes[n.index()];
        node.max_end = max_end;
        node.value_sum = value_sum;
        node.taste_mask = taste_mask;
    }

    fn update_up(&mut self, from: Option<NodeId>) {
        let mut cur = from;
        while let Some(n) = cur {
            self.update_aggregates(n);
            cur = self.parent(n);
        }
    }

    /// Recompute a node's own value and tastes from its markers
    fn refresh_own(&mut self, n: NodeId) {
        let (value, tastes) = self.nodes[n.index()]
            .markers
            .iter()
            .filter_map(|id| self.markers.get(id))
            .fold((0u64, 0), |(value, tastes), slot| {
                (
                    value.saturating_add(slot.value),
                    tastes | slot.tastes.bits(),
                )
            });
        let node = &mut self.nodes[n.index()];
        node.own_value = value;
        node.own_tastes = tastes;
    }

    /// Put `markers` into the node for `(range, affinity, layer)`, creating
    /// it if needed
    fn attach(
        &mut self,
        markers: Vec<MarkerId>,
        range: TextRange,
        affinity: Affinity,
        layer: i32,
    ) -> NodeId {
        let mut node = Node::detached(range, affinity, layer);
        node.markers = markers;
        let n = self.alloc_node(node);
        self.refresh_own(n);
        self.update_aggregates(n);
        self.insert_or_merge(n)
    }

    /// Remove one marker from its node, dropping the node once empty
    fn detach_marker(&mut self, n: NodeId, id: MarkerId) {
        self.nodes[n.index()].markers.retain(|m| *m != id);
        if self.nodes[n.index()].markers.is_empty() {
            self.unlink(n);
            self.free_node(n);
            self.trace("node removed", n);
        } else {
            self.refresh_own(n);
            self.update_up(Some(n));
        }
    }

    /// Turn an unlinked node back into a detached node at `range`
    fn reset_detached(&mut self, n: NodeId, range: TextRange) {
        let node = &mut self.nodes[n.index()];
        node.start = range.start as i64;
        node.end = range.end as i64;
        node.delta = 0;
        node.parent = None;
        node.left = None;
        node.right = None;
        node.red = true;
        self.update_aggregates(n);
    }

    /// Link a detached node into the tree, or move its markers into the
    /// existing node with the same key. Returns the node now holding them.
    fn insert_or_merge(&mut self, n: NodeId) -> NodeId {
        let target = self.find_or_insert(n);
        let markers = if target == n {
            self.nodes[n.index()].markers.clone()
        } else {
            let moved = std::mem::take(&mut self.nodes[n.index()].markers);
            self.nodes[target.index()].markers.extend_from_slice(&moved);
            self.refresh_own(target);
            self.update_up(Some(target));
            self.free_node(n);
            self.trace("nodes merged", target);
            moved
        };
        for id in markers {
            if let Some(slot) = self.markers.get_mut(&id) {
                slot.node = Some(target);
            }
        }
        target
    }

    /// Mark every marker of an unlinked node invalid and free the node
    fn invalidate_node(&mut self, n: NodeId, last_range: TextRange) -> usize {
        let markers = std::mem::take(&mut self.nodes[n.index()].markers);
        for id in &markers {
            if let Some(slot) = self.markers.get_mut(id) {
                slot.node = None;
                slot.range = last_range;
            }
        }
        self.valid_markers -= markers.len();
        self.free_node(n);
        markers.len()
    }

    fn trace(&self, what: &str, n: NodeId) {
        if self.config.trace_structural_changes {
            tracing::trace!(node = n.0, nodes = self.node_count, "{what}");
        }
    }

    fn successor(&self, n: NodeId) -> Option<NodeId> {
        if let Some(mut cur) = self.right(n) {
            while let Some(l) = self.left(cur) {
                cur = l;
            }
            return Some(cur);
        }
        let mut child = n;
        let mut parent = self.parent(n);
        while let Some(p) = parent {
            if self.left(p) == Some(child) {
                return Some(p);
            }
            child = p;
            parent = self.parent(p);
        }
        None
    }

    fn predecessor(&self, n: NodeId) -> Option<NodeId> {
        if let Some(mut cur) = self.left(n) {
            while let Some(r) = self.right(cur) {
                cur = r;
            }
            return Some(cur);
        }
        let mut child = n;
        let mut parent = self.parent(n);
        while let Some(p) = parent {
            if self.right(p) == Some(child) {
                return Some(p);
            }
            child = p;
            parent = self.parent(p);
        }
        None
    }

    /// Shift everything after the change and collect the nodes touching
    /// `[start, end]` together with their pre-change ranges.
    fn collect_affected(
        &mut self,
        n: NodeId,
        start: i64,
        end: i64,
        length_delta: i64,
        out: &mut Vec<(NodeId, TextRange)>,
    ) {
        self.push_delta(n);
        let node = &self.nodes[n.index()];
        let (node_start, node_end, left, right) = (node.start, node.end, node.left, node.right);
        if start > node.max_end {
            return;
        }

        if end < node_start {
            // this node and its right subtree lie after the change
            let node = &mut self.nodes[n.index()];
            node.start += length_delta;
            node.end += length_delta;
            if let Some(r) = right {
                self.nodes[r.index()].delta += length_delta;
            }
            if let Some(l) = left {
                self.collect_affected(l, start, end, length_delta, out);
            }
        } else {
            if start <= node_end {
                out.push((n, TextRange::new(node_start as usize, node_end as usize)));
            }
            if let Some(l) = left {
                self.collect_affected(l, start, end, length_delta, out);
            }
            if let Some(r) = right {
                self.collect_affected(r, start, end, length_delta, out);
            }
        }
        self.update_aggregates(n);
    }

    /// Nodes whose real range lies inside `[start, end]`
    fn collect_contained(
        &self,
        node: Option<NodeId>,
        delta_above: i64,
        start: i64,
        end: i64,
        out: &mut Vec<(NodeId, TextRange)>,
    ) {
        let Some(n) = node else {
            return;
        };
        let node = &self.nodes[n.index()];
        let delta = delta_above + node.delta;
        if start > node.max_end + delta {
            return;
        }
        self.collect_contained(node.left, delta, start, end, out);
        let node_start = node.start + delta;
        let node_end = node.end + delta;
        if node_start >= start && node_end <= end {
            out.push((n, TextRange::new(node_start as usize, node_end as usize)));
        }
        if node_start <= end {
            self.collect_contained(node.right, delta, start, end, out);
        }
    }
}

// ---
// 7. Red-black maintenance
// ---

impl MarkerTree {
    /// Link detached node `n` at its key position and rebalance.
    /// Returns the existing node instead if one has the same key.
    fn find_or_insert(&mut self, n: NodeId) -> NodeId {
        let key = self.nodes[n.index()].key(0);
        let mut parent = None;
        let mut go_left = false;
        let mut cur = self.root;
        while let Some(c) = cur {
            self.push_delta(c);
            match key.cmp(&self.nodes[c.index()].key(0)) {
                Ordering::Equal => return c,
                Ordering::Less => {
                    parent = Some(c);
                    go_left = true;
                    cur = self.left(c);
                }
                Ordering::Greater => {
                    parent = Some(c);
                    go_left = false;
                    cur = self.right(c);
                }
            }
        }

        {
            let node = &mut self.nodes[n.index()];
            node.parent = parent;
            node.red = true;
        }
        match parent {
            None => self.root = Some(n),
            Some(p) if go_left => self.nodes[p.index()].left = Some(n),
            Some(p) => self.nodes[p.index()].right = Some(n),
        }
        self.update_up(Some(n));
        self.node_count += 1;
        self.insert_fix(n);
        self.trace("node inserted", n);
        n
    }

    fn insert_fix(&mut self, mut n: NodeId) {
        while let Some(p) = self.parent(n) {
            if !self.nodes[p.index()].red {
                break;
            }
            let Some(g) = self.parent(p) else {
                break;
            };
            if self.left(g) == Some(p) {
                if let Some(uncle) = self.right(g).filter(|&u| self.nodes[u.index()].red) {
                    self.set_red(p, false);
                    self.set_red(uncle, false);
                    self.set_red(g, true);
                    n = g;
                } else {
                    if self.right(p) == Some(n) {
                        n = p;
                        self.rotate_left(n);
                    }
                    let Some(p) = self.parent(n) else {
                        break;
                    };
                    let Some(g) = self.parent(p) else {
                        break;
                    };
                    self.set_red(p, false);
                    self.set_red(g, true);
                    self.rotate_right(g);
                }
            } else if let Some(uncle) = self.left(g).filter(|&u| self.nodes[u.index()].red) {
                self.set_red(p, false);
                self.set_red(uncle, false);
                self.set_red(g, true);
                n = g;
            } else {
                if self.left(p) == Some(n) {
                    n = p;
                    self.rotate_right(n);
                }
                let Some(p) = self.parent(n) else {
                    break;
                };
                let Some(g) = self.parent(p) else {
                    break;
                };
                self.set_red(p, false);
                self.set_red(g, true);
                self.rotate_left(g);
            }
        }
        if let Some(root) = self.root {
            self.set_red(root, false);
        }
    }

    /// Point `old`'s parent (or the root) at `new`
    fn replace_child(&mut self, old: NodeId, new: Option<NodeId>) {
        let parent = self.parent(old);
        match parent {
            None => self.root = new,
            Some(p) => {
                if self.left(p) == Some(old) {
                    self.nodes[p.index()].left = new;
                } else {
                    self.nodes[p.index()].right = new;
                }
            }
        }
        if let Some(c) = new {
            self.nodes[c.index()].parent = parent;
        }
    }

    /// Unlink `z` from the tree. The node keeps its markers and holds real
    /// offsets afterwards.
    fn unlink(&mut self, z: NodeId) {
        self.push_path(z);

        let (x, x_parent, removed_black) = match (self.left(z), self.right(z)) {
            (None, child) | (child, None) => {
                let removed_black = !self.nodes[z.index()].red;
                let x_parent = self.parent(z);
                self.replace_child(z, child);
                (child, x_parent, removed_black)
            }
            (Some(zl), Some(zr)) => {
                let mut y = zr;
                self.push_delta(y);
                while let Some(l) = self.left(y) {
                    self.push_delta(l);
                    y = l;
                }
                let removed_black = !self.nodes[y.index()].red;
                let x = self.right(y);
                let x_parent = if self.parent(y) == Some(z) {
                    Some(y)
                } else {
                    let x_parent = self.parent(y);
                    self.replace_child(y, x);
                    self.nodes[y.index()].right = Some(zr);
                    self.nodes[zr.index()].parent = Some(y);
                    x_parent
                };
                self.replace_child(z, Some(y));
                self.nodes[y.index()].left = Some(zl);
                self.nodes[zl.index()].parent = Some(y);
                let z_red = self.nodes[z.index()].red;
                self.set_red(y, z_red);
                (x, x_parent, removed_black)
            }
        };

        {
            let node = &mut self.nodes[z.index()];
            node.parent = None;
            node.left = None;
            node.right = None;
        }
        self.update_aggregates(z);
        self.update_up(x_parent);
        if removed_black {
            self.remove_fix(x, x_parent);
        }
        self.node_count -= 1;
    }

    fn remove_fix(&mut self, mut x: Option<NodeId>, mut parent: Option<NodeId>) {
        while let Some(p) = parent {
            if self.is_red(x) {
                break;
            }
            if self.left(p) == x {
                let Some(mut w) = self.right(p) else {
                    break;
                };
                if self.nodes[w.index()].red {
                    self.set_red(w, false);
                    self.set_red(p, true);
                    self.rotate_left(p);
                    let Some(nw) = self.right(p) else {
                        break;
                    };
                    w = nw;
                }
                if !self.is_red(self.left(w)) && !self.is_red(self.right(w)) {
                    self.set_red(w, true);
                    x = Some(p);
                    parent = self.parent(p);
                } else {
                    if !self.is_red(self.right(w)) {
                        if let Some(wl) = self.left(w) {
                            self.set_red(wl, false);
                        }
                        self.set_red(w, true);
                        self.rotate_right(w);
                        let Some(nw) = self.right(p) else {
                            break;
                        };
                        w = nw;
                    }
                    let p_red = self.nodes[p.index()].red;
                    self.set_red(w, p_red);
                    self.set_red(p, false);
                    if let Some(wr) = self.right(w) {
                        self.set_red(wr, false);
                    }
                    self.rotate_left(p);
                    x = self.root;
                    parent = None;
                }
            } else {
                let Some(mut w) = self.left(p) else {
                    break;
                };
                if self.nodes[w.index()].red {
                    self.set_red(w, false);
                    self.set_red(p, true);
                    self.rotate_right(p);
                    let Some(nw) = self.left(p) else {
                        break;
                    };
                    w = nw;
                }
                if !self.is_red(self.left(w)) && !self.is_red(self.right(w)) {
                    self.set_red(w, true);
                    x = Some(p);
                    parent = self.parent(p);
                } else {
                    if !self.is_red(self.left(w)) {
                        if let Some(wr) = self.right(w) {
                            self.set_red(wr, false);
                        }
                        self.set_red(w, true);
                        self.rotate_left(w);
                        let Some(nw) = self.left(p) else {
                            break;
                        };
                        w = nw;
                    }
                    let p_red = self.nodes[p.index()].red;
                    self.set_red(w, p_red);
                    self.set_red(p, false);
                    if let Some(wl) = self.left(w) {
                        self.set_red(wl, false);
                    }
                    self.rotate_right(p);
                    x = self.root;
                    parent = None;
                }
            }
        }
        if let Some(x) = x {
            self.set_red(x, false);
        }
    }

    fn rotate_left(&mut self, x: NodeId) {
        let Some(y) = self.right(x) else {
            return;
        };
        self.push_path(x);
        self.push_delta(y);

        let y_left = self.left(y);
        self.nodes[x.index()].right = y_left;
        if let Some(b) = y_left {
            self.nodes[b.index()].parent = Some(x);
        }
        self.replace_child(x, Some(y));
        self.nodes[y.index()].left = Some(x);
        self.nodes[x.index()].parent = Some(y);

        self.update_aggregates(x);
        self.update_aggregates(y);
    }

    fn rotate_right(&mut self, x: NodeId) {
        let Some(y) = self.left(x) else {
            return;
        };
        self.push_path(x);
        self.push_delta(y);

        let y_right = self.right(y);
        self.nodes[x.index()].left = y_right;
        if let Some(b) = y_right {
            self.nodes[b.index()].parent = Some(x);
        }
        self.replace_child(x, Some(y));
        self.nodes[y.index()].right = Some(x);
        self.nodes[x.index()].parent = Some(y);

        self.update_aggregates(x);
        self.update_aggregates(y);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tree() -> MarkerTree {
        MarkerTree::with_config(MarkerTreeConfig::verifying())
    }

    /// Helper to insert a plain marker and return the ID
    fn insert_marker(tree: &mut MarkerTree, start: usize, end: usize) -> MarkerId {
        tree.add_interval(start, end, MarkerOptions::new()).unwrap()
    }

    /// Helper to get a range, or panic with a clear message
    fn get_pos(tree: &MarkerTree, id: MarkerId) -> (usize, usize) {
        let range = tree
            .range(id)
            .unwrap_or_else(|| panic!("Marker ID {id:?} not found."));
        (range.start, range.end)
    }

    #[test]
    fn test_initial_insert_and_remove() {
        let mut tree = tree();
        let id1 = insert_marker(&mut tree, 10, 20);
        let id2 = insert_marker(&mut tree, 30, 40);

        assert_eq!(get_pos(&tree, id1), (10, 20));
        assert_eq!(get_pos(&tree, id2), (30, 40));
        assert_eq!(tree.len(), 2);

        assert!(tree.remove_interval(id1));
        assert!(!tree.is_valid(id1));
        assert!(!tree.remove_interval(id1), "second removal is a no-op");
        assert_eq!(get_pos(&tree, id1), (10, 20), "last range is kept");
        assert_eq!(get_pos(&tree, id2), (30, 40));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_inverted_range_rejected() {
        let mut tree = tree();
        assert!(tree.add_interval(5, 2, MarkerOptions::new()).is_err());
        assert!(tree.is_empty());
    }

    #[test]
    fn test_equal_markers_share_a_node() {
        let mut tree = tree();
        let a = insert_marker(&mut tree, 3, 7);
        let b = insert_marker(&mut tree, 3, 7);
        let c = tree
            .add_interval(3, 7, MarkerOptions::new().greedy(true, false))
            .unwrap();

        assert_eq!(tree.node_count(), 2);
        assert_eq!(tree.len(), 3);

        tree.remove_interval(a);
        assert_eq!(tree.node_count(), 2);
        assert!(tree.is_valid(b));
        tree.remove_interval(b);
        assert_eq!(tree.node_count(), 1);
        assert!(tree.is_valid(c));
    }

    #[test]
    fn test_insert_shifts_later_markers() {
        let mut tree = tree();
        let before = insert_marker(&mut tree, 10, 20);
        let after = insert_marker(&mut tree, 30, 40);

        tree.update_on_change(&DocumentChange::insert(30, "xxxxx"), 100);

        assert_eq!(get_pos(&tree, before), (10, 20));
        assert_eq!(get_pos(&tree, after), (35, 45));
    }

    #[test]
    fn test_lazy_delta_does_not_leak_left() {
        let mut tree = tree();
        let p = insert_marker(&mut tree, 200, 250);
        let r = insert_marker(&mut tree, 300, 350);
        let l = insert_marker(&mut tree, 100, 150);

        tree.update_on_change(&DocumentChange::insert(280, "x".repeat(10)), 1000);
        assert_eq!(get_pos(&tree, l), (100, 150));
        assert_eq!(get_pos(&tree, p), (200, 250));
        assert_eq!(get_pos(&tree, r), (310, 360));

        tree.update_on_change(&DocumentChange::delete(0, "y".repeat(50)), 1000);
        assert_eq!(get_pos(&tree, l), (50, 100));
        assert_eq!(get_pos(&tree, p), (150, 200));
        assert_eq!(get_pos(&tree, r), (260, 310));
    }

    #[test]
    fn test_change_inside_marker_resizes_it() {
        let mut tree = tree();
        let id = insert_marker(&mut tree, 10, 20);

        tree.update_on_change(&DocumentChange::insert(15, "abc"), 100);
        assert_eq!(get_pos(&tree, id), (10, 23));

        tree.update_on_change(&DocumentChange::delete(12, "xy"), 100);
        assert_eq!(get_pos(&tree, id), (10, 21));
    }

    #[test]
    fn test_deletion_engulfing_marker_invalidates() {
        let mut tree = tree();
        let id = insert_marker(&mut tree, 10, 20);
        let other = insert_marker(&mut tree, 40, 50);

        tree.update_on_change(&DocumentChange::delete(5, "z".repeat(20)), 100);

        assert!(!tree.is_valid(id));
        assert_eq!(get_pos(&tree, id), (10, 20), "pre-change range is retained");
        assert_eq!(get_pos(&tree, other), (20, 30));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_marker_past_document_end_invalidates() {
        let mut tree = tree();
        let id = insert_marker(&mut tree, 2, 8);
        tree.update_on_change(&DocumentChange::insert(5, "ab"), 6);
        assert!(!tree.is_valid(id));
    }

    #[test]
    fn test_translated_nodes_merge_with_existing() {
        let mut tree = tree();
        // both end up at (2, 2) after the delete
        let a = insert_marker(&mut tree, 2, 2);
        let b = insert_marker(&mut tree, 2, 5);

        tree.update_on_change(&DocumentChange::delete(2, "abc"), 10);

        assert_eq!(get_pos(&tree, a), (2, 2));
        assert_eq!(get_pos(&tree, b), (2, 2));
        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_sum_of_values() {
        let mut tree = tree();
        let one = tree
            .add_interval(1, 1, MarkerOptions::new().value(1))
            .unwrap();
        let _two = tree
            .add_interval(1, 1, MarkerOptions::new().value(2))
            .unwrap();
        tree.add_interval(5, 9, MarkerOptions::new().value(10))
            .unwrap();

        assert_eq!(tree.sum_of_values_up_to(0), 0);
        assert_eq!(tree.sum_of_values_up_to(1), 3);
        assert_eq!(tree.sum_of_values_up_to(4), 3);
        assert_eq!(tree.sum_of_values_up_to(5), 13);

        tree.remove_interval(one);
        assert_eq!(tree.sum_of_values_up_to(1), 2);

        tree.update_on_change(&DocumentChange::insert(0, "xx"), 20);
        assert_eq!(tree.sum_of_values_up_to(2), 0);
        assert_eq!(tree.sum_of_values_up_to(3), 2);
    }

    #[test]
    fn test_set_value_updates_sums() {
        let mut tree = tree();
        let id = tree
            .add_interval(4, 6, MarkerOptions::new().value(3))
            .unwrap();
        assert!(tree.set_value(id, 7));
        assert_eq!(tree.sum_of_values_up_to(10), 7);
        assert!(!tree.set_value(MarkerId(999), 1));
    }

    #[test]
    fn test_sums_saturate_on_huge_values() {
        let mut tree = tree();
        let big = tree
            .add_interval(1, 2, MarkerOptions::new().value(u64::MAX))
            .unwrap();
        tree.add_interval(3, 4, MarkerOptions::new().value(1))
            .unwrap();
        let _shared = tree
            .add_interval(1, 2, MarkerOptions::new().value(u64::MAX - 1))
            .unwrap();

        assert_eq!(tree.sum_of_values_up_to(0), 0);
        assert_eq!(tree.sum_of_values_up_to(1), u64::MAX);
        assert_eq!(tree.sum_of_values_up_to(10), u64::MAX);
        tree.verify_properties().unwrap();

        tree.remove_interval(big);
        assert_eq!(tree.sum_of_values_up_to(1), u64::MAX - 1);
        assert_eq!(tree.sum_of_values_up_to(3), u64::MAX);
        tree.verify_properties().unwrap();
    }

    #[test]
    fn test_processors() {
        let mut tree = tree();
        let a = insert_marker(&mut tree, 0, 5);
        let b = insert_marker(&mut tree, 3, 8);
        let c = insert_marker(&mut tree, 10, 12);
        let d = insert_marker(&mut tree, 5, 5);

        let mut seen = Vec::new();
        tree.process_overlapping_with(5, 9, |id| {
            seen.push(id);
            true
        });
        assert_eq!(seen, vec![a, b, d]);

        let mut seen = Vec::new();
        tree.process_containing(4, |id| {
            seen.push(id);
            true
        });
        assert_eq!(seen, vec![a, b]);

        let mut seen = Vec::new();
        tree.process_overlapping_with_outside(2, 9, |id| {
            seen.push(id);
            true
        });
        assert_eq!(seen, vec![a, c]);

        let mut count = 0;
        let finished = tree.process_all(|_| {
            count += 1;
            count < 2
        });
        assert!(!finished);
        assert_eq!(count, 2);
    }

    #[test]
    fn test_find_marker_neighbours() {
        let mut tree = tree();
        let a = insert_marker(&mut tree, 0, 5);
        let b = insert_marker(&mut tree, 0, 5);
        let c = insert_marker(&mut tree, 7, 9);

        assert_eq!(tree.find_marker_after(a), Some(b));
        assert_eq!(tree.find_marker_after(b), Some(c));
        assert_eq!(tree.find_marker_after(c), None);
        assert_eq!(tree.find_marker_before(c), Some(b));
        assert_eq!(tree.find_marker_before(a), None);
    }

    #[test]
    fn test_change_attributes_moves_marker() {
        let mut tree = tree();
        let a = insert_marker(&mut tree, 2, 4);
        let b = insert_marker(&mut tree, 2, 4);
        assert_eq!(tree.node_count(), 1);

        assert!(tree.change_attributes(a, MarkerOptions::new().layer(3)));
        assert_eq!(tree.node_count(), 2);
        assert_eq!(tree.layer(a), Some(3));
        assert_eq!(get_pos(&tree, a), (2, 4));
        assert!(tree.is_valid(b));
    }

    #[test]
    fn test_clear_keeps_last_ranges() {
        let mut tree = tree();
        let a = insert_marker(&mut tree, 2, 4);
        tree.update_on_change(&DocumentChange::insert(0, "x"), 10);
        tree.clear();

        assert!(tree.is_empty());
        assert_eq!(tree.node_count(), 0);
        assert!(!tree.is_valid(a));
        assert_eq!(get_pos(&tree, a), (3, 5));
        tree.verify_properties().unwrap();
    }

    #[test]
    fn test_retarget_moves_contained_markers() {
        let mut tree = tree();
        let inside = insert_marker(&mut tree, 12, 14);
        let edge = insert_marker(&mut tree, 10, 15);
        let outside = insert_marker(&mut tree, 9, 12);

        tree.retarget(10, 15, 0);

        assert_eq!(get_pos(&tree, inside), (2, 4));
        assert_eq!(get_pos(&tree, edge), (0, 5));
        assert_eq!(get_pos(&tree, outside), (9, 12));
    }

    #[test]
    fn test_height_stays_logarithmic() {
        let mut tree = MarkerTree::new();
        for i in 0..1024 {
            insert_marker(&mut tree, i, i + 1);
        }
        tree.verify_properties().unwrap();
        // red-black bound: 2 * log2(n + 1)
        assert!(tree.max_height() <= 2 * 11);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(usize, usize, bool, bool, u64, u32),
        Remove(usize),
        Insert(usize, usize),
        Delete(usize, usize),
        SetValue(usize, u64),
        SetTastes(usize, u32),
        ChangeAttributes(usize, bool, bool, i32, u32),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (
                0usize..200,
                0usize..20,
                any::<bool>(),
                any::<bool>(),
                0u64..10,
                0u32..16,
            )
                .prop_map(|(s, l, gl, gr, v, t)| Op::Add(s, s + l, gl, gr, v, t)),
            (0usize..64).prop_map(Op::Remove),
            (0usize..220, 1usize..10).prop_map(|(o, l)| Op::Insert(o, l)),
            (0usize..220, 1usize..30).prop_map(|(o, l)| Op::Delete(o, l)),
            (0usize..64, 0u64..10).prop_map(|(i, v)| Op::SetValue(i, v)),
            (0usize..64, 0u32..16).prop_map(|(i, t)| Op::SetTastes(i, t)),
            (0usize..64, any::<bool>(), any::<bool>(), 0i32..3, 0u32..16)
                .prop_map(|(i, gl, gr, layer, t)| {
                    Op::ChangeAttributes(i, gl, gr, layer, t)
                }),
        ]
    }

    /// Taste-pruned iteration must see exactly what filtering a plain walk sees
    fn check_delicious(
        tree: &MarkerTree,
        start: usize,
        end: usize,
    ) -> std::result::Result<(), TestCaseError> {
        for bit in 0..4 {
            let taste = Taste::new(bit).unwrap();
            let plain: Vec<_> = tree
                .overlapping(start, end)
                .filter(|id| tree.tastes(*id).unwrap().contains(taste))
                .collect();
            let delicious: Vec<_> = tree.overlapping_delicious(start, end, taste).collect();
            prop_assert_eq!(plain, delicious);
        }
        Ok(())
    }

    proptest! {
        #[test]
        fn prop_tree_stays_consistent(
            ops in prop::collection::vec(op_strategy(), 1..120),
            query in (0usize..260, 0usize..40),
        ) {
            let (qs, ql) = query;
            let mut tree = MarkerTree::new();
            let mut ids = Vec::new();
            let mut expected: HashMap<MarkerId, TextRange> = HashMap::new();
            let mut doc_len = 250usize;

            for op in ops {
                match op {
                    Op::Add(s, e, gl, gr, v, t) => {
                        if e <= doc_len {
                            let options = MarkerOptions::new()
                                .greedy(gl, gr)
                                .value(v)
                                .tastes(TasteSet::from_bits(t));
                            let id = tree.add_interval(s, e, options).unwrap();
                            ids.push(id);
                            expected.insert(id, TextRange::new(s, e));
                        }
                    }
                    Op::Remove(i) => {
                        if let Some(&id) = ids.get(i) {
                            tree.remove_interval(id);
                            expected.remove(&id);
                        }
                    }
                    Op::Insert(o, l) => {
                        let o = o.min(doc_len);
                        let change = DocumentChange::insert(o, "a".repeat(l));
                        doc_len += l;
                        tree.update_on_change(&change, doc_len);
                        expected.retain(|id, range| {
                            let affinity = tree.affinity(*id).unwrap();
                            match apply_change(*range, affinity, &change) {
                                Some(r) => { *range = r; true }
                                None => false,
                            }
                        });
                    }
                    Op::Delete(o, l) => {
                        let o = o.min(doc_len);
                        let l = l.min(doc_len - o);
                        let change = DocumentChange::delete(o, "a".repeat(l));
                        doc_len -= l;
                        tree.update_on_change(&change, doc_len);
                        expected.retain(|id, range| {
                            let affinity = tree.affinity(*id).unwrap();
                            let translated = apply_change(*range, affinity, &change)
                                .filter(|r| r.end <= doc_len);
                            match translated {
                                Some(r) => { *range = r; true }
                                None => false,
                            }
                        });
                    }
                    Op::SetValue(i, v) => {
                        if let Some(&id) = ids.get(i) {
                            tree.set_value(id, v);
                        }
                    }
                    Op::SetTastes(i, t) => {
                        if let Some(&id) = ids.get(i) {
                            tree.set_tastes(id, TasteSet::from_bits(t));
                        }
                    }
                    Op::ChangeAttributes(i, gl, gr, layer, t) => {
                        if let Some(&id) = ids.get(i) {
                            let options = MarkerOptions::new()
                                .greedy(gl, gr)
                                .layer(layer)
                                .tastes(TasteSet::from_bits(t));
                            tree.change_attributes(id, options);
                        }
                    }
                }
                prop_assert_eq!(tree.verify_properties(), Ok(()));
                check_delicious(&tree, qs, qs + ql)?;
                check_delicious(&tree, 0, doc_len)?;
            }

            prop_assert_eq!(tree.len(), expected.len());
            for (id, range) in &expected {
                prop_assert!(tree.is_valid(*id));
                prop_assert_eq!(tree.range(*id), Some(*range));
            }

            let mut previous = 0;
            for offset in 0..=doc_len {
                let sum = tree.sum_of_values_up_to(offset);
                prop_assert!(sum >= previous);
                previous = sum;
            }
        }
    }
}
