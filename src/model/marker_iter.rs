/// In-order iteration over markers overlapping a range
///
/// The iterator keeps an explicit stack of pending nodes together with the
/// delta accumulated on the way down, so positions are resolved without
/// mutating the tree. Subtrees ending before the range are pruned through
/// `max_end`; with a taste filter, subtrees whose `taste_mask` lacks the
/// taste are pruned as well.
use crate::model::marker::{MarkerId, Taste};
use crate::model::marker_tree::{MarkerTree, Node, NodeId};

pub struct OverlappingIter<'a> {
    tree: &'a MarkerTree,
    start: i64,
    end: i64,
    filter: Option<Taste>,
    /// Nodes whose left subtree has been queued, with their full delta
    stack: Vec<(NodeId, i64)>,
    bucket: &'a [MarkerId],
    finished: bool,
    visited: usize,
}

impl<'a> OverlappingIter<'a> {
    pub(crate) fn new(tree: &'a MarkerTree, start: i64, end: i64, filter: Option<Taste>) -> Self {
        let mut iter = Self {
            tree,
            start,
            end,
            filter,
            stack: Vec::new(),
            bucket: &[],
            finished: false,
            visited: 0,
        };
        iter.descend_left(tree.root(), 0);
        iter
    }

    /// Number of nodes inspected so far
    pub fn visited_nodes(&self) -> usize {
        self.visited
    }

    fn admits_subtree(&self, node: &Node) -> bool {
        self.filter
            .map_or(true, |taste| node.taste_mask & taste.bit() != 0)
    }

    fn descend_left(&mut self, mut cur: Option<NodeId>, mut delta_above: i64) {
        let tree = self.tree;
        while let Some(n) = cur {
            let node = tree.node(n);
            self.visited += 1;
            let delta = delta_above + node.delta;
            if self.start > node.max_end + delta || !self.admits_subtree(node) {
                break;
            }
            self.stack.push((n, delta));
            cur = node.left;
            delta_above = delta;
        }
    }
}

impl<'a> Iterator for OverlappingIter<'a> {
    type Item = MarkerId;

    fn next(&mut self) -> Option<MarkerId> {
        let tree = self.tree;
        loop {
            while let Some((&id, rest)) = self.bucket.split_first() {
                self.bucket = rest;
                let tasty = self
                    .filter
                    .map_or(true, |taste| tree.marker_tastes(id).contains(taste));
                if tasty {
                    return Some(id);
                }
            }
            if self.finished {
                return None;
            }

            let Some((n, delta)) = self.stack.pop() else {
                self.finished = true;
                return None;
            };
            let node = tree.node(n);
            if node.start + delta > self.end {
                // every remaining node starts later still
                self.stack.clear();
                self.finished = true;
                return None;
            }
            let own_match = self
                .filter
                .map_or(true, |taste| node.own_tastes & taste.bit() != 0);
            if node.end + delta >= self.start && own_match {
                self.bucket = &node.markers;
            }
            self.descend_left(node.right, delta);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::MarkerTreeConfig;
    use crate::model::edit::DocumentChange;
    use crate::model::marker::{MarkerOptions, Taste, TasteSet, TextRange};
    use crate::model::marker_tree::MarkerTree;
    use proptest::prelude::*;

    fn tree() -> MarkerTree {
        MarkerTree::with_config(MarkerTreeConfig::verifying())
    }

    #[test]
    fn test_overlapping_is_closed_and_ordered() {
        let mut tree = tree();
        let a = tree.add_interval(0, 2, MarkerOptions::new()).unwrap();
        let b = tree.add_interval(2, 6, MarkerOptions::new()).unwrap();
        let c = tree.add_interval(6, 6, MarkerOptions::new()).unwrap();
        let _d = tree.add_interval(7, 9, MarkerOptions::new()).unwrap();

        let found: Vec<_> = tree.overlapping(2, 6).collect();
        assert_eq!(found, vec![a, b, c]);

        let found: Vec<_> = tree.overlapping(3, 3).collect();
        assert_eq!(found, vec![b]);
    }

    #[test]
    fn test_overlapping_after_lazy_shift() {
        let mut tree = tree();
        let ids: Vec<_> = (0..50)
            .map(|i| {
                tree.add_interval(i * 10, i * 10 + 5, MarkerOptions::new())
                    .unwrap()
            })
            .collect();
        tree.update_on_change(&DocumentChange::insert(0, "x".repeat(3)), 600);

        let found: Vec<_> = tree.overlapping(95, 104).collect();
        assert_eq!(found, vec![ids[9], ids[10]]);
    }

    #[test]
    fn test_delicious_filters_by_taste() {
        let red = Taste::new(0).unwrap();
        let blue = Taste::new(1).unwrap();
        let mut tree = tree();
        let r = tree
            .add_interval(1, 4, MarkerOptions::new().taste(red))
            .unwrap();
        let rb = tree
            .add_interval(1, 4, MarkerOptions::new().taste(red).taste(blue))
            .unwrap();
        let b = tree
            .add_interval(3, 8, MarkerOptions::new().taste(blue))
            .unwrap();

        let found: Vec<_> = tree.overlapping_delicious(0, 10, red).collect();
        assert_eq!(found, vec![r, rb]);
        let found: Vec<_> = tree.overlapping_delicious(0, 10, blue).collect();
        assert_eq!(found, vec![rb, b]);

        tree.set_tastes(rb, TasteSet::empty());
        let found: Vec<_> = tree.overlapping_delicious(0, 10, blue).collect();
        assert_eq!(found, vec![b]);
    }

    #[test]
    fn test_rare_taste_skips_untasty_subtrees() {
        let rare = Taste::new(5).unwrap();
        let mut tree = MarkerTree::new();
        let count = 20_000;
        for i in 0..count {
            tree.add_interval(i, i + 1, MarkerOptions::new()).unwrap();
        }
        let tasty = tree
            .add_interval(count / 2, count / 2 + 1, MarkerOptions::new().taste(rare))
            .unwrap();

        let mut plain = tree.overlapping(0, count);
        assert_eq!(plain.by_ref().count(), count + 1);
        // the rare marker shares a node with a plain one
        assert_eq!(tree.node_count(), count);
        assert!(plain.visited_nodes() >= count);

        let mut delicious = tree.overlapping_delicious(0, count, rare);
        assert_eq!(delicious.next(), Some(tasty));
        assert_eq!(delicious.next(), None);
        assert!(
            delicious.visited_nodes() < 200,
            "visited {} nodes",
            delicious.visited_nodes()
        );
    }

    #[test]
    fn test_iter_empty_tree() {
        let tree = MarkerTree::new();
        assert_eq!(tree.iter().count(), 0);
        assert_eq!(tree.overlapping(0, 100).visited_nodes(), 0);
    }

    proptest! {
        #[test]
        fn prop_delicious_matches_filtered_plain(
            markers in prop::collection::vec((0usize..300, 0usize..30, 0u32..16), 0..150),
            query in (0usize..330, 0usize..60),
            taste in 0u8..4,
        ) {
            let taste = Taste::new(taste).unwrap();
            let mut tree = MarkerTree::new();
            for (start, len, bits) in markers {
                let options = MarkerOptions::new().tastes(TasteSet::from_bits(bits));
                tree.add_interval(start, start + len, options).unwrap();
            }
            let (qs, ql) = query;

            let plain: Vec<_> = tree
                .overlapping(qs, qs + ql)
                .filter(|id| tree.tastes(*id).unwrap().contains(taste))
                .collect();
            let delicious: Vec<_> = tree.overlapping_delicious(qs, qs + ql, taste).collect();
            prop_assert_eq!(&plain, &delicious);

            for id in &plain {
                let range: TextRange = tree.range(*id).unwrap();
                prop_assert!(range.intersects(qs, qs + ql));
            }
            let brute = tree
                .iter()
                .filter(|id| tree.range(*id).unwrap().intersects(qs, qs + ql))
                .count();
            prop_assert_eq!(tree.overlapping(qs, qs + ql).count(), brute);
        }
    }
}
