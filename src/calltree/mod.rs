//! Call trees built from profiler samples
//!
//! A [`CallTree`] is top-down while samples are recorded: the root is
//! `(root)` and each level below is a callee. Children are keyed by their
//! rendered label, so two different code entries that render the same name
//! share a node. Derived trees (bottom-up, flat, cloned subtrees) are built
//! as new trees and never modify the source tree.
//!
//! Node ids come from a counter shared by a tree, its clones and every tree
//! derived from them, so ids are never reused across that lineage.

pub mod cpuprofile;
pub mod view;

pub use cpuprofile::{CallFrame, CpuProfile, CpuProfileNode, PositionTick};
pub use view::{ProfileView, ProfileViewNode, ViewBuilder};

use rustc_hash::FxHashMap as HashMap;
use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::codemap::CodeId;

/// Handle to a node of one [`CallTree`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallNodeId(u32);

impl CallNodeId {
    /// Position of the node in its tree
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One node of a [`CallTree`]
#[derive(Debug, Clone)]
pub struct CallTreeNode {
    /// Stable id, unique across a tree and the trees derived from it
    pub id: u32,
    pub label: String,
    /// The first code entry that created this node
    pub entry: Option<CodeId>,
    pub parent: Option<CallNodeId>,
    /// Samples that ended in this node
    pub self_weight: u64,
    /// `self_weight` plus the totals of all children, once computed
    pub total_weight: u64,
    /// 1-based source line to sample count
    pub line_ticks: BTreeMap<u32, u64>,
    children: Vec<CallNodeId>,
    by_label: HashMap<String, CallNodeId>,
}

impl CallTreeNode {
    /// Children in insertion order
    pub fn children(&self) -> &[CallNodeId] {
        &self.children
    }
}

/// Which weight a ranking uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightKind {
    SelfWeight,
    TotalWeight,
}

/// One row of a top-N listing
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCost {
    pub label: String,
    pub self_weight: u64,
    pub total_weight: u64,
    /// Share of the root's total, in percent
    pub self_percent: f64,
    pub total_percent: f64,
}

/// A call tree
#[derive(Debug, Clone)]
pub struct CallTree {
    nodes: Vec<CallTreeNode>,
    /// Next free node id
    ids: Arc<AtomicU32>,
    totals_valid: bool,
}

impl CallTree {
    /// Label of the root of every top-down tree
    pub const ROOT_LABEL: &'static str = "(root)";

    /// Create a tree with a `(root)` node
    pub fn new() -> Self {
        Self::with_root(Self::ROOT_LABEL, None)
    }

    /// Create a tree whose root has the given label and entry
    pub fn with_root(label: &str, entry: Option<CodeId>) -> Self {
        Self::with_ids(label, entry, Arc::new(AtomicU32::new(1)))
    }

    fn with_ids(label: &str, entry: Option<CodeId>, ids: Arc<AtomicU32>) -> Self {
        let mut tree = Self {
            nodes: Vec::new(),
            ids,
            totals_valid: true,
        };
        tree.push_node(label, entry, None);
        tree
    }

    /// A fresh tree drawing ids from this tree's counter
    fn derived(&self, label: &str, entry: Option<CodeId>) -> Self {
        Self::with_ids(label, entry, Arc::clone(&self.ids))
    }

    // ========================================================================
    // Access
    // ========================================================================

    /// The root node
    pub fn root(&self) -> CallNodeId {
        CallNodeId(0)
    }

    /// Node behind `id`
    pub fn node(&self, id: CallNodeId) -> &CallTreeNode {
        &self.nodes[id.index()]
    }

    /// Number of nodes, root included
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree has only its root
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// All nodes in creation order (parents before children)
    pub fn nodes(&self) -> impl Iterator<Item = (CallNodeId, &CallTreeNode)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| (CallNodeId(idx as u32), node))
    }

    /// Whether [`CallTree::compute_total_weights`] is up to date
    pub fn totals_valid(&self) -> bool {
        self.totals_valid
    }

    /// Child of `parent` with `label`
    pub fn find_child(&self, parent: CallNodeId, label: &str) -> Option<CallNodeId> {
        self.node(parent).by_label.get(label).copied()
    }

    /// Node reached by following `labels` from the root
    pub fn find_path<'a>(&self, labels: impl IntoIterator<Item = &'a str>) -> Option<CallNodeId> {
        labels
            .into_iter()
            .try_fold(self.root(), |node, label| self.find_child(node, label))
    }

    /// Ancestor directly below the root, or `None` for the root itself
    pub fn top_level_ancestor(&self, id: CallNodeId) -> Option<CallNodeId> {
        let mut current = id;
        loop {
            let parent = self.node(current).parent?;
            if parent == self.root() {
                return Some(current);
            }
            current = parent;
        }
    }

    /// Labels from the node below the root down to `id`
    pub fn path_labels(&self, id: CallNodeId) -> Vec<&str> {
        let mut labels = Vec::new();
        let mut current = Some(id);
        while let Some(node) = current {
            if node == self.root() {
                break;
            }
            labels.push(self.node(node).label.as_str());
            current = self.node(node).parent;
        }
        labels.reverse();
        labels
    }

    // ========================================================================
    // Construction
    // ========================================================================

    fn push_node(&mut self, label: &str, entry: Option<CodeId>, parent: Option<CallNodeId>) -> CallNodeId {
        let id = CallNodeId(self.nodes.len() as u32);
        self.nodes.push(CallTreeNode {
            id: self.ids.fetch_add(1, Ordering::Relaxed),
            label: label.to_string(),
            entry,
            parent,
            self_weight: 0,
            total_weight: 0,
            line_ticks: BTreeMap::new(),
            children: Vec::new(),
            by_label: HashMap::default(),
        });
        id
    }

    /// Child of `parent` with `label`, created on demand
    pub fn find_or_add_child(&mut self, parent: CallNodeId, label: &str, entry: Option<CodeId>) -> CallNodeId {
        if let Some(child) = self.find_child(parent, label) {
            return child;
        }
        let child = self.push_node(label, entry, Some(parent));
        let parent_node = &mut self.nodes[parent.index()];
        parent_node.children.push(child);
        parent_node.by_label.insert(label.to_string(), child);
        self.totals_valid = false;
        child
    }

    /// Walk `path` (outermost frame first) from the root, creating nodes as
    /// needed, and return the last node
    pub fn add_path<'a>(&mut self, path: impl IntoIterator<Item = (&'a str, Option<CodeId>)>) -> CallNodeId {
        let mut node = self.root();
        for (label, entry) in path {
            node = self.find_or_add_child(node, label, entry);
        }
        node
    }

    /// Count one sample ending at `node`
    pub fn record_sample(&mut self, node: CallNodeId, line: Option<u32>) {
        let target = &mut self.nodes[node.index()];
        target.self_weight += 1;
        if let Some(line) = line {
            *target.line_ticks.entry(line).or_insert(0) += 1;
        }
        self.totals_valid = false;
    }

    /// Move one sample from `from` to `to`
    pub fn move_sample(&mut self, from: CallNodeId, from_line: Option<u32>, to: CallNodeId, to_line: Option<u32>) {
        let source = &mut self.nodes[from.index()];
        source.self_weight = source.self_weight.saturating_sub(1);
        if let Some(line) = from_line {
            if let Some(count) = source.line_ticks.get_mut(&line) {
                *count -= 1;
                if *count == 0 {
                    source.line_ticks.remove(&line);
                }
            }
        }
        self.record_sample(to, to_line);
    }

    /// Compute `total_weight` for every node in one bottom-up pass
    pub fn compute_total_weights(&mut self) {
        // Children are always created after their parent.
        for node in &mut self.nodes {
            node.total_weight = node.self_weight;
        }
        for idx in (1..self.nodes.len()).rev() {
            let weight = self.nodes[idx].total_weight;
            if let Some(parent) = self.nodes[idx].parent {
                self.nodes[parent.index()].total_weight += weight;
            }
        }
        self.totals_valid = true;
    }

    // ========================================================================
    // Traversal
    // ========================================================================

    /// Breadth-first walk. `f` receives each node and the value its parent
    /// returned (`None` for the root) and returns the value for its children.
    pub fn traverse<P: Clone>(&self, mut f: impl FnMut(CallNodeId, &CallTreeNode, Option<&P>) -> Option<P>) {
        let mut queue: VecDeque<(CallNodeId, Option<P>)> = VecDeque::new();
        queue.push_back((self.root(), None));
        while let Some((id, param)) = queue.pop_front() {
            let node = self.node(id);
            let next = f(id, node, param.as_ref());
            for &child in &node.children {
                queue.push_back((child, next.clone()));
            }
        }
    }

    /// Depth-first walk calling `enter` before and `exit` after each subtree
    pub fn traverse_in_depth(
        &self,
        mut enter: impl FnMut(CallNodeId, &CallTreeNode),
        mut exit: impl FnMut(CallNodeId, &CallTreeNode),
    ) {
        let mut stack = vec![(self.root(), false)];
        while let Some((id, done)) = stack.pop() {
            let node = self.node(id);
            if done {
                exit(id, node);
                continue;
            }
            enter(id, node);
            stack.push((id, true));
            for &child in node.children.iter().rev() {
                stack.push((child, false));
            }
        }
    }

    // ========================================================================
    // Derived trees
    // ========================================================================

    /// Copy every subtree rooted at a node labeled `label` under a new root,
    /// merging same-labeled siblings and summing their self weights
    pub fn clone_subtree(&self, label: &str) -> CallTree {
        let mut out = self.derived(Self::ROOT_LABEL, None);
        let mut queue: VecDeque<(CallNodeId, Option<CallNodeId>)> = VecDeque::new();
        queue.push_back((self.root(), None));
        while let Some((id, clone_parent)) = queue.pop_front() {
            let node = self.node(id);
            let cloned = match clone_parent {
                None if node.label != label => None,
                parent => {
                    let parent = parent.unwrap_or(out.root());
                    let child = out.find_or_add_child(parent, &node.label, node.entry);
                    let target = &mut out.nodes[child.index()];
                    target.self_weight += node.self_weight;
                    for (line, count) in &node.line_ticks {
                        *target.line_ticks.entry(*line).or_insert(0) += count;
                    }
                    Some(child)
                }
            };
            for &child in &node.children {
                queue.push_back((child, cloned));
            }
        }
        out.compute_total_weights();
        out
    }

    /// Invert the tree: each sampled node's caller chain becomes a path from
    /// the root, leaf first, with the samples counted at the outermost caller.
    /// First-level totals are therefore each function's self time.
    pub fn bottom_up(&self) -> CallTree {
        let mut out = self.derived(&self.node(self.root()).label, self.node(self.root()).entry);
        for (id, node) in self.nodes().skip(1) {
            if node.self_weight == 0 {
                continue;
            }
            let mut chain = Vec::new();
            let mut current = Some(id);
            while let Some(c) = current {
                if c == self.root() {
                    break;
                }
                chain.push(c);
                current = self.node(c).parent;
            }
            let leaf = out.add_path(chain.iter().map(|c| {
                let n = self.node(*c);
                (n.label.as_str(), n.entry)
            }));
            out.nodes[leaf.index()].self_weight += node.self_weight;
        }
        out.nodes[0].self_weight = self.node(self.root()).self_weight;
        out.compute_total_weights();
        out
    }

    /// One node per distinct label below `label` (or below the root), with
    /// self weights summed over all occurrences and total weights counted
    /// once per outermost occurrence, so recursion is not double counted.
    pub fn flat(&self, label: Option<&str>) -> CallTree {
        if !self.totals_valid {
            let mut totals = self.clone();
            totals.compute_total_weights();
            return totals.flat(label);
        }
        let root_label = label.unwrap_or(Self::ROOT_LABEL);
        let mut out = self.derived(root_label, None);
        let flat_root = out.root();
        let mut depth: HashMap<&str, u32> = HashMap::default();
        let mut root_self = 0;
        let mut root_total = 0;
        let mut stack = vec![(self.root(), false)];

        while let Some((id, done)) = stack.pop() {
            let node = &self.nodes[id.index()];
            let is_root_label = node.label == root_label;
            let inside = depth.get(root_label).copied().unwrap_or(0) > 0;
            if done {
                if is_root_label || inside {
                    if let Some(d) = depth.get_mut(node.label.as_str()) {
                        *d -= 1;
                    }
                }
                continue;
            }
            if is_root_label || inside {
                if !inside {
                    root_self += node.self_weight;
                    root_total += node.total_weight;
                } else {
                    let outermost = is_root_label || depth.get(node.label.as_str()).copied().unwrap_or(0) == 0;
                    let rec = out.find_or_add_child(flat_root, &node.label, node.entry);
                    let target = &mut out.nodes[rec.index()];
                    target.self_weight += node.self_weight;
                    if outermost {
                        target.total_weight += node.total_weight;
                    }
                }
                *depth.entry(node.label.as_str()).or_insert(0) += 1;
            }
            stack.push((id, true));
            for &child in node.children.iter().rev() {
                stack.push((child, false));
            }
        }

        let root = &mut out.nodes[0];
        root.self_weight = root_self;
        root.total_weight = root_total;
        out.totals_valid = true;
        out
    }

    // ========================================================================
    // Reports
    // ========================================================================

    /// Folded stacks (`a;b;c weight` per line), the input format of
    /// flamegraph tools. The root is omitted.
    pub fn folded_stacks(&self) -> String {
        let mut out = String::new();
        for (id, node) in self.nodes().skip(1) {
            if node.self_weight == 0 {
                continue;
            }
            let path: Vec<String> = self
                .path_labels(id)
                .into_iter()
                .map(|label| label.replace(';', ":"))
                .collect();
            let _ = writeln!(out, "{} {}", path.join(";"), node.self_weight);
        }
        out
    }

    /// The `n` most expensive functions, aggregated per label
    pub fn top_functions(&self, n: usize, by: WeightKind) -> Vec<FunctionCost> {
        let flat = self.flat(None);
        let total = flat.node(flat.root()).total_weight.max(1) as f64;
        let mut rows: Vec<FunctionCost> = flat
            .node(flat.root())
            .children
            .iter()
            .map(|&id| {
                let node = flat.node(id);
                FunctionCost {
                    label: node.label.clone(),
                    self_weight: node.self_weight,
                    total_weight: node.total_weight,
                    self_percent: node.self_weight as f64 * 100.0 / total,
                    total_percent: node.total_weight as f64 * 100.0 / total,
                }
            })
            .collect();
        rows.sort_by(|a, b| {
            let (wa, wb) = match by {
                WeightKind::SelfWeight => (a.self_weight, b.self_weight),
                WeightKind::TotalWeight => (a.total_weight, b.total_weight),
            };
            wb.cmp(&wa).then_with(|| a.label.cmp(&b.label))
        });
        rows.truncate(n);
        rows
    }
}

impl Default for CallTree {
    fn default() -> Self {
        Self::new()
    }
}
