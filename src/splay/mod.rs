//! Ordered map backed by a top-down splay tree
//!
//! Every single-key operation splays the accessed key (or the last node on its
//! search path) to the root, giving amortized O(log n) access for the
//! temporally clustered address patterns produced by profiler logs.
//!
//! Alongside the tree shape, nodes are threaded into a doubly linked list in
//! key order. The thread is updated on every insert and remove, so in-order
//! iteration and neighbor queries never re-derive position from tree shape.
//!
//! # Example
//! ```
//! use v8lens::splay::SplayTree;
//!
//! let mut tree = SplayTree::new();
//! tree.insert(0x2000u64, "b");
//! tree.insert(0x1000u64, "a");
//! let node = tree.find_greatest_less_than(&0x1fff).unwrap();
//! assert_eq!(*tree.key(node), 0x1000);
//! assert_eq!(tree.keys().copied().collect::<Vec<_>>(), vec![0x1000, 0x2000]);
//! ```

use std::cmp::Ordering;
use std::fmt;

/// Handle to a live node of a [`SplayTree`]
///
/// Handles stay valid until the node they name is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone)]
struct Node<K, V> {
    key: K,
    value: V,
    left: Option<usize>,
    right: Option<usize>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// A splay tree with an in-order thread
#[derive(Clone)]
pub struct SplayTree<K, V> {
    nodes: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    root: Option<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl<K, V> SplayTree<K, V> {
    /// Create an empty tree
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            root: None,
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// Number of keys in the tree
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the tree holds no keys
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Remove every key
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.root = None;
        self.head = None;
        self.tail = None;
        self.len = 0;
    }

    /// Key stored at `id`
    pub fn key(&self, id: NodeId) -> &K {
        &self.node(id.0).key
    }

    /// Value stored at `id`
    pub fn value(&self, id: NodeId) -> &V {
        &self.node(id.0).value
    }

    /// Mutable value stored at `id`
    pub fn value_mut(&mut self, id: NodeId) -> &mut V {
        &mut self.node_mut(id.0).value
    }

    /// Node holding the smallest key, O(1) through the thread
    pub fn find_min(&self) -> Option<NodeId> {
        self.head.map(NodeId)
    }

    /// Node holding the largest key, O(1) through the thread
    pub fn find_max(&self) -> Option<NodeId> {
        self.tail.map(NodeId)
    }

    /// Smallest node of the subtree rooted at `from`
    pub fn find_min_from(&self, from: NodeId) -> NodeId {
        let mut current = from.0;
        while let Some(left) = self.node(current).left {
            current = left;
        }
        NodeId(current)
    }

    /// Largest node of the subtree rooted at `from`
    pub fn find_max_from(&self, from: NodeId) -> NodeId {
        let mut current = from.0;
        while let Some(right) = self.node(current).right {
            current = right;
        }
        NodeId(current)
    }

    /// In-order successor of `id`
    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        self.node(id.0).next.map(NodeId)
    }

    /// In-order predecessor of `id`
    pub fn prev(&self, id: NodeId) -> Option<NodeId> {
        self.node(id.0).prev.map(NodeId)
    }

    /// Iterate all entries in ascending key order (reversible)
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            tree: self,
            front: self.head,
            back: self.tail,
            remaining: self.len,
        }
    }

    /// Iterate keys in ascending order
    pub fn keys(&self) -> impl DoubleEndedIterator<Item = &K> + '_ {
        self.iter().map(|(k, _)| k)
    }

    /// Iterate values in ascending key order
    pub fn values(&self) -> impl DoubleEndedIterator<Item = &V> + '_ {
        self.iter().map(|(_, v)| v)
    }

    /// Walk forward from `from` (inclusive) to the largest key
    pub fn iter_from(&self, from: NodeId) -> Walk<'_, K, V> {
        Walk {
            tree: self,
            cursor: Some(from.0),
            forward: true,
        }
    }

    /// Walk backward from `from` (inclusive) to the smallest key
    pub fn iter_back_from(&self, from: NodeId) -> Walk<'_, K, V> {
        Walk {
            tree: self,
            cursor: Some(from.0),
            forward: false,
        }
    }

    fn node(&self, idx: usize) -> &Node<K, V> {
        match &self.nodes[idx] {
            Some(node) => node,
            None => unreachable!("splay node {idx} was freed while still linked"),
        }
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node<K, V> {
        match &mut self.nodes[idx] {
            Some(node) => node,
            None => unreachable!("splay node {idx} was freed while still linked"),
        }
    }

    fn alloc(&mut self, node: Node<K, V>) -> usize {
        self.len += 1;
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, idx: usize) -> Node<K, V> {
        self.len -= 1;
        self.free.push(idx);
        match self.nodes[idx].take() {
            Some(node) => node,
            None => unreachable!("splay node {idx} released twice"),
        }
    }
}

impl<K: Ord, V> SplayTree<K, V> {
    /// Insert `key` unless it is already present.
    ///
    /// Returns `false` and leaves the stored value untouched when the key
    /// exists; overwrite policy belongs to the caller.
    pub fn insert(&mut self, key: K, value: V) -> bool {
        let Some(_) = self.root else {
            let idx = self.alloc(Node {
                key,
                value,
                left: None,
                right: None,
                prev: None,
                next: None,
            });
            self.root = Some(idx);
            self.head = Some(idx);
            self.tail = Some(idx);
            return true;
        };

        self.splay(&key);
        let Some(root) = self.root else {
            unreachable!("splay emptied a non-empty tree")
        };

        // The splayed root is the in-order neighbor of the new key.
        let idx = match key.cmp(&self.node(root).key) {
            Ordering::Equal => return false,
            Ordering::Greater => {
                let right = self.node(root).right;
                let next = self.node(root).next;
                let idx = self.alloc(Node {
                    key,
                    value,
                    left: Some(root),
                    right,
                    prev: Some(root),
                    next,
                });
                let root_node = self.node_mut(root);
                root_node.right = None;
                root_node.next = Some(idx);
                match next {
                    Some(n) => self.node_mut(n).prev = Some(idx),
                    None => self.tail = Some(idx),
                }
                idx
            }
            Ordering::Less => {
                let left = self.node(root).left;
                let prev = self.node(root).prev;
                let idx = self.alloc(Node {
                    key,
                    value,
                    left,
                    right: Some(root),
                    prev,
                    next: Some(root),
                });
                let root_node = self.node_mut(root);
                root_node.left = None;
                root_node.prev = Some(idx);
                match prev {
                    Some(p) => self.node_mut(p).next = Some(idx),
                    None => self.head = Some(idx),
                }
                idx
            }
        };
        self.root = Some(idx);
        true
    }

    /// Remove `key`, returning its value if it was present
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.remove_entry(key).map(|(_, v)| v)
    }

    /// Remove `key`, returning the stored key and value if it was present
    pub fn remove_entry(&mut self, key: &K) -> Option<(K, V)> {
        self.root?;
        self.splay(key);
        let root = self.root?;
        if self.node(root).key.cmp(key) != Ordering::Equal {
            return None;
        }

        let (left, right, prev, next) = {
            let node = self.node(root);
            (node.left, node.right, node.prev, node.next)
        };

        match left {
            None => self.root = right,
            Some(left) => {
                self.root = Some(left);
                // Every key in the left subtree is smaller, so splaying leaves
                // the new root without a right child.
                self.splay(key);
                if let Some(new_root) = self.root {
                    self.node_mut(new_root).right = right;
                }
            }
        }

        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }

        let node = self.release(root);
        Some((node.key, node.value))
    }

    /// Find the node holding `key`, splaying it to the root
    pub fn find(&mut self, key: &K) -> Option<NodeId> {
        self.root?;
        self.splay(key);
        let root = self.root?;
        (self.node(root).key.cmp(key) == Ordering::Equal).then_some(NodeId(root))
    }

    /// Value stored under `key`
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let id = self.find(key)?;
        Some(self.value(id))
    }

    /// Mutable value stored under `key`
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let id = self.find(key)?;
        Some(self.value_mut(id))
    }

    /// Whether `key` is present
    pub fn contains_key(&mut self, key: &K) -> bool {
        self.find(key).is_some()
    }

    /// Node with the greatest key strictly less than `key`
    pub fn find_greatest_less_than(&mut self, key: &K) -> Option<NodeId> {
        self.root?;
        self.splay(key);
        let root = self.root?;
        if self.node(root).key < *key {
            Some(NodeId(root))
        } else {
            self.node(root).prev.map(NodeId)
        }
    }

    /// Node with the greatest key less than or equal to `key`
    pub fn find_greatest_less_than_or_equal(&mut self, key: &K) -> Option<NodeId> {
        self.root?;
        self.splay(key);
        let root = self.root?;
        if self.node(root).key <= *key {
            Some(NodeId(root))
        } else {
            self.node(root).prev.map(NodeId)
        }
    }

    /// Node with the least key strictly greater than `key`
    pub fn find_least_greater_than(&mut self, key: &K) -> Option<NodeId> {
        self.root?;
        self.splay(key);
        let root = self.root?;
        if self.node(root).key > *key {
            Some(NodeId(root))
        } else {
            self.node(root).next.map(NodeId)
        }
    }

    /// Exact lookup that leaves the tree shape untouched
    pub fn peek(&self, key: &K) -> Option<NodeId> {
        let mut current = self.root;
        while let Some(idx) = current {
            let node = self.node(idx);
            current = match key.cmp(&node.key) {
                Ordering::Equal => return Some(NodeId(idx)),
                Ordering::Less => node.left,
                Ordering::Greater => node.right,
            };
        }
        None
    }

    /// Like [`SplayTree::find_greatest_less_than_or_equal`], without splaying.
    ///
    /// Used by readers that only hold a shared reference.
    pub fn peek_greatest_less_than_or_equal(&self, key: &K) -> Option<NodeId> {
        let mut best = None;
        let mut current = self.root;
        while let Some(idx) = current {
            let node = self.node(idx);
            match key.cmp(&node.key) {
                Ordering::Equal => return Some(NodeId(idx)),
                Ordering::Less => current = node.left,
                Ordering::Greater => {
                    best = Some(NodeId(idx));
                    current = node.right;
                }
            }
        }
        best
    }

    /// Keep only the entries for which `f` returns `true`.
    ///
    /// Removal happens while walking the thread; the successor is read before
    /// each removal so tree restructuring never disturbs the walk.
    pub fn retain(&mut self, mut f: impl FnMut(&K, &mut V) -> bool)
    where
        K: Clone,
    {
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            cursor = self.node(idx).next;
            let keep = {
                let node = self.node_mut(idx);
                f(&node.key, &mut node.value)
            };
            if !keep {
                let key = self.node(idx).key.clone();
                self.remove(&key);
            }
        }
    }

    /// Top-down splay: moves `key`, or the last node on its search path, to
    /// the root.
    fn splay(&mut self, key: &K) {
        let Some(mut current) = self.root else {
            return;
        };

        let mut left_head: Option<usize> = None;
        let mut left_tail: Option<usize> = None;
        let mut right_head: Option<usize> = None;
        let mut right_tail: Option<usize> = None;

        loop {
            match key.cmp(&self.node(current).key) {
                Ordering::Less => {
                    let Some(mut left) = self.node(current).left else {
                        break;
                    };
                    if *key < self.node(left).key {
                        // Rotate right.
                        let left_right = self.node(left).right;
                        self.node_mut(current).left = left_right;
                        self.node_mut(left).right = Some(current);
                        current = left;
                        match self.node(current).left {
                            Some(next) => left = next,
                            None => break,
                        }
                    }
                    // Link right.
                    match right_tail {
                        Some(tail) => self.node_mut(tail).left = Some(current),
                        None => right_head = Some(current),
                    }
                    right_tail = Some(current);
                    current = left;
                }
                Ordering::Greater => {
                    let Some(mut right) = self.node(current).right else {
                        break;
                    };
                    if *key > self.node(right).key {
                        // Rotate left.
                        let right_left = self.node(right).left;
                        self.node_mut(current).right = right_left;
                        self.node_mut(right).left = Some(current);
                        current = right;
                        match self.node(current).right {
                            Some(next) => right = next,
                            None => break,
                        }
                    }
                    // Link left.
                    match left_tail {
                        Some(tail) => self.node_mut(tail).right = Some(current),
                        None => left_head = Some(current),
                    }
                    left_tail = Some(current);
                    current = right;
                }
                Ordering::Equal => break,
            }
        }

        // Assemble.
        let current_left = self.node(current).left;
        let current_right = self.node(current).right;
        if let Some(tail) = left_tail {
            self.node_mut(tail).right = current_left;
            self.node_mut(current).left = left_head;
        }
        if let Some(tail) = right_tail {
            self.node_mut(tail).left = current_right;
            self.node_mut(current).right = right_head;
        }
        self.root = Some(current);
    }
}

impl<K, V> Default for SplayTree<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for SplayTree<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

/// Double-ended in-order iterator over a [`SplayTree`]
pub struct Iter<'a, K, V> {
    tree: &'a SplayTree<K, V>,
    front: Option<usize>,
    back: Option<usize>,
    remaining: usize,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let idx = self.front?;
        let node = self.tree.node(idx);
        self.front = node.next;
        self.remaining -= 1;
        Some((&node.key, &node.value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<K, V> DoubleEndedIterator for Iter<'_, K, V> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let idx = self.back?;
        let node = self.tree.node(idx);
        self.back = node.prev;
        self.remaining -= 1;
        Some((&node.key, &node.value))
    }
}

impl<K, V> ExactSizeIterator for Iter<'_, K, V> {}

/// One-directional walk along the thread starting at an arbitrary node
pub struct Walk<'a, K, V> {
    tree: &'a SplayTree<K, V>,
    cursor: Option<usize>,
    forward: bool,
}

impl<'a, K, V> Iterator for Walk<'a, K, V> {
    type Item = (NodeId, &'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.cursor?;
        let node = self.tree.node(idx);
        self.cursor = if self.forward { node.next } else { node.prev };
        Some((NodeId(idx), &node.key, &node.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// In-order keys derived from tree shape, independent of the thread
    fn shape_keys<K: Clone, V>(tree: &SplayTree<K, V>) -> Vec<K> {
        let mut out = Vec::new();
        let mut stack = Vec::new();
        let mut current = tree.root;
        while current.is_some() || !stack.is_empty() {
            while let Some(idx) = current {
                stack.push(idx);
                current = tree.node(idx).left;
            }
            if let Some(idx) = stack.pop() {
                out.push(tree.node(idx).key.clone());
                current = tree.node(idx).right;
            }
        }
        out
    }

    fn assert_consistent(tree: &SplayTree<u64, u64>) {
        let threaded: Vec<u64> = tree.keys().copied().collect();
        let reversed: Vec<u64> = tree.keys().rev().copied().collect();
        assert_eq!(threaded, shape_keys(tree));
        assert_eq!(threaded.len(), tree.len());
        assert!(threaded.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(reversed, threaded.iter().rev().copied().collect::<Vec<_>>());
    }

    #[test]
    fn test_insert_and_find() {
        let mut tree = SplayTree::new();
        for key in [50u64, 20, 80, 10, 30, 70, 90] {
            assert!(tree.insert(key, key * 2));
        }
        assert_consistent(&tree);
        assert_eq!(tree.get(&30), Some(&60));
        assert_eq!(tree.get(&31), None);
        assert_eq!(tree.len(), 7);
    }

    #[test]
    fn test_insert_existing_key_keeps_first_value() {
        let mut tree = SplayTree::new();
        assert!(tree.insert(1u64, 10u64));
        assert!(!tree.insert(1, 20));
        assert_eq!(tree.get(&1), Some(&10));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_remove() {
        let mut tree = SplayTree::new();
        for key in 0u64..20 {
            tree.insert(key, key);
        }
        assert_eq!(tree.remove(&7), Some(7));
        assert_eq!(tree.remove(&7), None);
        assert_eq!(tree.remove(&100), None);
        assert_consistent(&tree);
        assert_eq!(tree.len(), 19);
        assert!(!tree.contains_key(&7));
    }

    #[test]
    fn test_remove_from_empty() {
        let mut tree: SplayTree<u64, u64> = SplayTree::new();
        assert_eq!(tree.remove(&1), None);
        assert!(tree.is_empty());
    }

    #[test]
    fn test_min_max() {
        let mut tree = SplayTree::new();
        assert!(tree.find_min().is_none());
        for key in [5u64, 3, 9, 1, 7] {
            tree.insert(key, ());
        }
        assert_eq!(*tree.key(tree.find_min().unwrap()), 1);
        assert_eq!(*tree.key(tree.find_max().unwrap()), 9);
        tree.remove(&1);
        tree.remove(&9);
        assert_eq!(*tree.key(tree.find_min().unwrap()), 3);
        assert_eq!(*tree.key(tree.find_max().unwrap()), 7);
    }

    #[test]
    fn test_subtree_min_max() {
        let mut tree = SplayTree::new();
        for key in [5u64, 3, 9, 1, 7] {
            tree.insert(key, ());
        }
        let root = tree.find(&5).unwrap();
        assert_eq!(*tree.key(tree.find_min_from(root)), 1);
        assert_eq!(*tree.key(tree.find_max_from(root)), 9);
    }

    #[test]
    fn test_neighbor_queries() {
        let mut tree = SplayTree::new();
        for key in [10u64, 20, 30] {
            tree.insert(key, ());
        }
        let glt = |tree: &mut SplayTree<u64, ()>, k| tree.find_greatest_less_than(&k).map(|n| *tree.key(n));
        let lgt = |tree: &mut SplayTree<u64, ()>, k| tree.find_least_greater_than(&k).map(|n| *tree.key(n));
        let gle = |tree: &mut SplayTree<u64, ()>, k| {
            tree.find_greatest_less_than_or_equal(&k).map(|n| *tree.key(n))
        };

        assert_eq!(glt(&mut tree, 5), None);
        assert_eq!(glt(&mut tree, 10), None);
        assert_eq!(glt(&mut tree, 11), Some(10));
        assert_eq!(glt(&mut tree, 20), Some(10));
        assert_eq!(glt(&mut tree, 99), Some(30));

        assert_eq!(lgt(&mut tree, 5), Some(10));
        assert_eq!(lgt(&mut tree, 10), Some(20));
        assert_eq!(lgt(&mut tree, 29), Some(30));
        assert_eq!(lgt(&mut tree, 30), None);

        assert_eq!(gle(&mut tree, 20), Some(20));
        assert_eq!(gle(&mut tree, 25), Some(20));
        assert_eq!(gle(&mut tree, 9), None);
    }

    #[test]
    fn test_walk_from_node() {
        let mut tree = SplayTree::new();
        for key in 1u64..=5 {
            tree.insert(key, key * 10);
        }
        let start = tree.find(&3).unwrap();
        let forward: Vec<u64> = tree.iter_from(start).map(|(_, k, _)| *k).collect();
        let backward: Vec<u64> = tree.iter_back_from(start).map(|(_, k, _)| *k).collect();
        assert_eq!(forward, vec![3, 4, 5]);
        assert_eq!(backward, vec![3, 2, 1]);
    }

    #[test]
    fn test_remove_while_walking_thread() {
        let mut tree = SplayTree::new();
        for key in 0u64..64 {
            tree.insert(key * 3 % 64, key);
        }
        let mut cursor = tree.find_min();
        while let Some(node) = cursor {
            cursor = tree.next(node);
            let key = *tree.key(node);
            if key % 2 == 0 {
                tree.remove(&key);
                assert_consistent(&tree);
            }
        }
        let keys: Vec<u64> = tree.keys().copied().collect();
        assert_eq!(keys, (0u64..64).filter(|k| k % 2 == 1).collect::<Vec<_>>());
    }

    #[test]
    fn test_retain() {
        let mut tree = SplayTree::new();
        for key in 0u64..100 {
            tree.insert(key, key);
        }
        tree.retain(|k, v| {
            *v += 1;
            k % 10 == 0
        });
        assert_consistent(&tree);
        assert_eq!(tree.values().copied().collect::<Vec<_>>(), vec![1, 11, 21, 31, 41, 51, 61, 71, 81, 91]);
    }

    #[test]
    fn test_slot_reuse_after_remove() {
        let mut tree = SplayTree::new();
        for key in 0u64..10 {
            tree.insert(key, key);
        }
        for key in 0u64..10 {
            tree.remove(&key);
        }
        assert!(tree.is_empty());
        for key in (100u64..110).rev() {
            tree.insert(key, key);
        }
        assert_consistent(&tree);
        assert_eq!(tree.nodes.len(), 10);
    }

    #[test]
    fn test_peek_does_not_restructure() {
        let mut tree = SplayTree::new();
        for key in [50u64, 20, 80, 10, 30] {
            tree.insert(key, ());
        }
        let root_before = tree.root;
        assert_eq!(tree.peek(&30).map(|id| *tree.key(id)), Some(30));
        assert!(tree.peek(&31).is_none());
        assert_eq!(tree.peek_greatest_less_than_or_equal(&35).map(|id| *tree.key(id)), Some(30));
        assert_eq!(tree.peek_greatest_less_than_or_equal(&80).map(|id| *tree.key(id)), Some(80));
        assert!(tree.peek_greatest_less_than_or_equal(&9).is_none());
        assert_eq!(tree.root, root_before);
    }
}
