//! Presentation views over call trees
//!
//! A [`ProfileView`] is a detached copy of a call tree with weights scaled
//! by the sampling rate and percentages filled in, ready to be sorted and
//! rendered by a front end.

use std::cmp::Ordering;

use super::{CallNodeId, CallTree};
use crate::codemap::CodeId;

/// One node of a [`ProfileView`]
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileViewNode {
    pub label: String,
    pub entry: Option<CodeId>,
    pub total_time: f64,
    pub self_time: f64,
    /// Share of the head's total time
    pub total_percent: f64,
    pub self_percent: f64,
    /// Share of the parent's total time; 100 for the head
    pub parent_total_percent: f64,
    pub children: Vec<ProfileViewNode>,
}

impl ProfileViewNode {
    /// Child with `label`
    pub fn child(&self, label: &str) -> Option<&ProfileViewNode> {
        self.children.iter().find(|c| c.label == label)
    }

    fn sort_recursive(&mut self, cmp: &mut impl FnMut(&ProfileViewNode, &ProfileViewNode) -> Ordering) {
        self.children.sort_by(|a, b| cmp(a, b));
        for child in &mut self.children {
            child.sort_recursive(cmp);
        }
    }

    fn fill_percents(&mut self, head_total: f64, parent_total: f64) {
        self.total_percent = percent(self.total_time, head_total);
        self.self_percent = percent(self.self_time, head_total);
        self.parent_total_percent = percent(self.total_time, parent_total);
        let total = self.total_time;
        for child in &mut self.children {
            child.fill_percents(head_total, total);
        }
    }
}

fn percent(part: f64, whole: f64) -> f64 {
    if whole > 0.0 {
        part * 100.0 / whole
    } else {
        0.0
    }
}

/// A view rooted at `head`
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileView {
    pub head: ProfileViewNode,
}

impl ProfileView {
    /// Sort children at every level
    pub fn sort(&mut self, mut cmp: impl FnMut(&ProfileViewNode, &ProfileViewNode) -> Ordering) {
        self.head.sort_recursive(&mut cmp);
    }

    /// Sort by descending total time, then label
    pub fn sort_by_total(&mut self) {
        self.sort(|a, b| {
            b.total_time
                .partial_cmp(&a.total_time)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.label.cmp(&b.label))
        });
    }

    /// Pre-order walk with depth
    pub fn traverse(&self, mut f: impl FnMut(&ProfileViewNode, usize)) {
        let mut stack = vec![(&self.head, 0usize)];
        while let Some((node, depth)) = stack.pop() {
            f(node, depth);
            for child in node.children.iter().rev() {
                stack.push((child, depth + 1));
            }
        }
    }
}

/// Builds [`ProfileView`]s from call trees
#[derive(Debug, Clone, Copy)]
pub struct ViewBuilder {
    sampling_rate: f64,
}

impl ViewBuilder {
    /// `sampling_rate` is the time represented by one sample
    pub fn new(sampling_rate: f64) -> Self {
        Self { sampling_rate }
    }

    /// Build a view of `tree`.
    ///
    /// With `bottom_up_weights` the tree is taken to be a bottom-up tree:
    /// first-level nodes show their total as self time, deeper nodes have no
    /// self time of their own.
    pub fn build_view(&self, tree: &CallTree, bottom_up_weights: bool) -> ProfileView {
        if !tree.totals_valid() {
            let mut computed = tree.clone();
            computed.compute_total_weights();
            return self.build_view(&computed, bottom_up_weights);
        }
        let mut head = self.build_node(tree, tree.root(), 0, bottom_up_weights);
        let total = head.total_time;
        head.fill_percents(total, total);
        ProfileView { head }
    }

    fn build_node(&self, tree: &CallTree, id: CallNodeId, depth: usize, bottom_up: bool) -> ProfileViewNode {
        let node = tree.node(id);
        let total_time = node.total_weight as f64 * self.sampling_rate;
        let self_time = if bottom_up {
            if depth == 1 {
                total_time
            } else {
                0.0
            }
        } else {
            node.self_weight as f64 * self.sampling_rate
        };
        ProfileViewNode {
            label: node.label.clone(),
            entry: node.entry,
            total_time,
            self_time,
            total_percent: 0.0,
            self_percent: 0.0,
            parent_total_percent: 0.0,
            children: node
                .children()
                .iter()
                .map(|&child| self.build_node(tree, child, depth + 1, bottom_up))
                .collect(),
        }
    }
}

impl Default for ViewBuilder {
    fn default() -> Self {
        Self::new(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> CallTree {
        let mut tree = CallTree::new();
        for path in [&["main", "a", "b"][..], &["main", "a", "b"], &["main", "a"], &["main", "c", "b"]] {
            let leaf = tree.add_path(path.iter().map(|l| (*l, None)));
            tree.record_sample(leaf, None);
        }
        tree
    }

    #[test]
    fn test_top_down_view_scales_and_percents() {
        let view = ViewBuilder::new(2.0).build_view(&tree(), false);
        assert_eq!(view.head.total_time, 8.0);
        let main = view.head.child("main").unwrap();
        let a = main.child("a").unwrap();
        assert_eq!(a.total_time, 6.0);
        assert_eq!(a.self_time, 2.0);
        assert!((a.total_percent - 75.0).abs() < 1e-9);
        assert!((a.self_percent - 25.0).abs() < 1e-9);
        assert!((a.parent_total_percent - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_bottom_up_view_self_time() {
        let bottom_up = tree().bottom_up();
        let view = ViewBuilder::default().build_view(&bottom_up, true);
        let b = view.head.child("b").unwrap();
        assert_eq!(b.self_time, 3.0);
        assert_eq!(b.total_time, 3.0);
        assert_eq!(b.child("a").unwrap().self_time, 0.0);
        assert_eq!(view.head.self_time, 0.0);
    }

    #[test]
    fn test_sort_and_traverse() {
        let mut view = ViewBuilder::default().build_view(&tree(), false);
        view.sort_by_total();
        let mut labels = Vec::new();
        view.traverse(|node, depth| labels.push(format!("{}{}", " ".repeat(depth), node.label)));
        assert_eq!(labels, vec!["(root)", " main", "  a", "   b", "  c", "   b"]);
    }
}
