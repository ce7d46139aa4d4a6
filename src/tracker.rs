//! Change tracker: accumulates the per-cycle touched-node set.

use crate::node::Node;
use std::collections::HashSet;

/// Result of draining the tracker for one layout cycle.
pub struct ChangeSet {
    pub nodes: Vec<Node>,
    pub structure_changed: bool,
    pub cycle: u64,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && !self.structure_changed
    }
}

pub struct ChangeTracker {
    enabled: bool,
    /// Once the structural flag is set, at most this many nodes are tracked
    /// individually; past the cap the cycle degrades to a full pass.
    cap: Option<usize>,
    nodes: Vec<Node>,
    seen: HashSet<u32>,
    structure_changed: bool,
    capped: bool,
    cycle: u64,
    /// Ids detached this cycle; filtered out on flush so layout never runs
    /// on nodes without a live parent chain.
    removed: HashSet<u32>,
    root_id: Option<u32>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self {
            enabled: true,
            cap: None,
            nodes: Vec::new(),
            seen: HashSet::new(),
            structure_changed: false,
            capped: false,
            cycle: 0,
            removed: HashSet::new(),
            root_id: None,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn set_cap(&mut self, cap: Option<usize>) {
        self.cap = cap;
    }

    pub(crate) fn set_root(&mut self, root: &Node) {
        self.root_id = Some(root.id());
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn has_pending(&self) -> bool {
        !self.nodes.is_empty() || self.structure_changed
    }

    pub fn track_change(&mut self, node: Node) {
        if !self.enabled || self.capped {
            return;
        }
        if let Some(cap) = self.cap {
            if self.structure_changed && self.nodes.len() >= cap {
                self.capped = true;
                return;
            }
        }
        if self.seen.insert(node.id()) {
            self.nodes.push(node);
        }
    }

    pub fn track_added(&mut self, _parent: &Node, child: &Node) {
        if !self.enabled {
            return;
        }
        self.structure_changed = true;
        self.enroll_subtree(child);
    }

    pub fn track_removed(&mut self, _parent: &Node, child: &Node) {
        if !self.enabled {
            return;
        }
        self.structure_changed = true;
        self.remember_removed(child);
    }

    fn enroll_subtree(&mut self, node: &Node) {
        self.track_change(node.clone());
        for c in node.children() {
            self.enroll_subtree(&c);
        }
    }

    fn remember_removed(&mut self, node: &Node) {
        self.removed.insert(node.id());
        for c in node.children() {
            self.remember_removed(&c);
        }
    }

    /// Drain the accumulated set and start a new cycle.
    pub fn flush(&mut self) -> ChangeSet {
        let removed = std::mem::take(&mut self.removed);
        let root_id = self.root_id;
        let mut nodes = std::mem::take(&mut self.nodes);
        nodes.retain(|n| !removed.contains(&n.id()) && Self::attached(n, root_id));
        self.seen.clear();
        let structure_changed = self.structure_changed || self.capped;
        self.structure_changed = false;
        self.capped = false;
        self.cycle += 1;
        ChangeSet {
            nodes,
            structure_changed,
            cycle: self.cycle,
        }
    }

    /// True when the node still reaches the tracked root.
    fn attached(node: &Node, root_id: Option<u32>) -> bool {
        let root_id = match root_id {
            Some(id) => id,
            None => return true,
        };
        let mut current = node.clone();
        loop {
            if current.id() == root_id {
                return true;
            }
            match current.parent() {
                Some(p) => current = p,
                None => return false,
            }
        }
    }
}

impl Default for ChangeTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;

    #[test]
    fn test_flush_clears_and_bumps_cycle() {
        let mut t = ChangeTracker::new();
        let n = Node::branch();
        t.track_change(n.clone());
        t.track_change(n.clone());
        assert!(t.has_pending());
        let set = t.flush();
        assert_eq!(1, set.nodes.len());
        assert_eq!(1, set.cycle);
        assert!(!t.has_pending());
        assert!(t.flush().is_empty());
        assert_eq!(2, t.cycle());
    }

    #[test]
    fn test_disabled_tracker_ignores_changes() {
        let mut t = ChangeTracker::new();
        t.set_enabled(false);
        t.track_change(Node::branch());
        assert!(!t.has_pending());
    }

    #[test]
    fn test_added_subtree_is_enrolled() {
        let mut t = ChangeTracker::new();
        let parent = Node::branch();
        let child = Node::branch();
        let grandchild = Node::branch();
        child.add_child(grandchild);
        t.track_added(&parent, &child);
        let set = t.flush();
        assert!(set.structure_changed);
        assert_eq!(2, set.nodes.len());
    }

    #[test]
    fn test_removed_remainder_is_filtered() {
        let mut t = ChangeTracker::new();
        let root = Node::branch();
        t.set_root(&root);
        let child = Node::branch();
        root.add_child(child.clone());

        t.track_change(child.clone());
        root.remove_child(&child);
        t.track_removed(&root, &child);
        let set = t.flush();
        assert!(set.structure_changed);
        assert!(set.nodes.is_empty());
    }

    #[test]
    fn test_cap_degrades_to_structural() {
        let mut t = ChangeTracker::new();
        t.set_cap(Some(2));
        let parent = Node::branch();
        t.track_added(&parent, &Node::branch());
        t.track_change(Node::branch());
        t.track_change(Node::branch());
        t.track_change(Node::branch());
        let set = t.flush();
        assert!(set.structure_changed);
        assert!(set.nodes.len() <= 2);
    }
}
