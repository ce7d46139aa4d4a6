//! Incremental layout: expands the touched-node set to the minimal recompute
//! set, recomputes matrices then bounds in dependency order, and emits layout
//! blocks carrying before/after world-bounds deltas.

use crate::base::Rect;
use crate::dirty::{DirtyFlags, Tier};
use crate::node::Node;
use crate::tracker::ChangeSet;
use log::{error, warn};
use measure_time::debug_time;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

/// Re-entrancy guard shared by layout and render passes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum RunState {
    Idle,
    Running,
    AgainRequested,
}

/// How many queued re-runs a single `update` drains before deferring to the
/// next frame.
pub const MAX_RERUNS: u32 = 8;

/// Touched nodes with the union world render-bounds captured before and
/// after recompute. Both snapshots must be repainted: a node that shrank
/// leaves its old footprint behind, one that grew exposes a new one.
pub struct LayoutBlock {
    pub nodes: Vec<Node>,
    pub before: Rect,
    pub after: Rect,
}

impl LayoutBlock {
    pub fn damage(&self) -> Rect {
        self.before.union(&self.after)
    }
}

/// Summary of a block, safe to hand to event listeners.
#[derive(Debug, Clone, Serialize)]
pub struct LayoutBlockInfo {
    pub before: Rect,
    pub after: Rect,
    pub node_count: usize,
}

impl LayoutBlockInfo {
    pub fn of(block: &LayoutBlock) -> Self {
        Self {
            before: block.before,
            after: block.after,
            node_count: block.nodes.len(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LayoutMode {
    Full,
    Partial,
    Skipped,
}

pub struct LayoutResult {
    pub mode: LayoutMode,
    pub blocks: Vec<LayoutBlock>,
}

impl LayoutResult {
    fn skipped() -> Self {
        Self {
            mode: LayoutMode::Skipped,
            blocks: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct LayoutStats {
    pub passes: u32,
    pub full_passes: u32,
    pub partial_passes: u32,
    pub enrolled_nodes: u32,
}

pub struct LayoutEngine {
    state: RunState,
    run_again: bool,
    performed_first: bool,
    partial_enabled: bool,
    stats: LayoutStats,
}

impl LayoutEngine {
    pub fn new() -> Self {
        Self {
            state: RunState::Idle,
            run_again: false,
            performed_first: false,
            partial_enabled: true,
            stats: LayoutStats::default(),
        }
    }

    pub fn set_partial_enabled(&mut self, enabled: bool) {
        self.partial_enabled = enabled;
    }

    pub fn performed_first(&self) -> bool {
        self.performed_first
    }

    pub fn stats(&self) -> &LayoutStats {
        &self.stats
    }

    /// True when a re-entrant call was queued during the last pass.
    pub fn take_run_again(&mut self) -> bool {
        std::mem::replace(&mut self.run_again, false)
    }

    /// Run one layout pass. Re-entrant calls are queued, never nested; all
    /// recompute errors are contained here and logged.
    pub fn layout(&mut self, root: &Node, change: ChangeSet) -> LayoutResult {
        if self.state == RunState::Running {
            self.state = RunState::AgainRequested;
            self.run_again = true;
            return LayoutResult::skipped();
        }
        self.state = RunState::Running;
        let result = if !self.performed_first || change.structure_changed || !self.partial_enabled {
            self.full_layout(root)
        } else if change.nodes.is_empty() {
            LayoutResult::skipped()
        } else {
            self.partial_layout(root, change)
        };
        if self.state == RunState::AgainRequested {
            self.run_again = true;
        }
        self.state = RunState::Idle;
        result
    }

    /// Unconditional whole-tree recompute: matrices top-down, bounds
    /// bottom-up. First activation and structural resets land here.
    fn full_layout(&mut self, root: &Node) -> LayoutResult {
        debug_time!("full layout");
        let before = root.cached_world_bounds(Tier::Render);
        mark_all_dirty(root);
        update_matrices_recursive(root);
        if let Err(e) = update_bounds_recursive(root) {
            error!("full layout aborted: {}", e);
            return LayoutResult::skipped();
        }
        let after = root.world_bounds(Tier::Render);
        clear_pass_flags_recursive(root);
        self.performed_first = true;
        self.stats.passes += 1;
        self.stats.full_passes += 1;
        LayoutResult {
            mode: LayoutMode::Full,
            blocks: vec![LayoutBlock {
                nodes: vec![root.clone()],
                before,
                after,
            }],
        }
    }

    /// Steady-state incremental pass over the touched set.
    fn partial_layout(&mut self, _root: &Node, change: ChangeSet) -> LayoutResult {
        debug_time!("partial layout, {} touched", change.nodes.len());
        fn enroll(node: &Node, list: &mut Vec<Node>, ids: &mut HashSet<u32>) {
            if ids.insert(node.id()) {
                list.push(node.clone());
            }
        }

        let mut enrolled: Vec<Node> = Vec::new();
        let mut enrolled_ids: HashSet<u32> = HashSet::new();
        let mut matrix_roots: Vec<Node> = Vec::new();

        for node in &change.nodes {
            let matrix_dirty = node.has_flags(DirtyFlags::MATRIX);
            enroll(node, &mut enrolled, &mut enrolled_ids);
            let mut current = node.parent();
            while let Some(p) = current {
                enroll(&p, &mut enrolled, &mut enrolled_ids);
                current = p.parent();
            }
            if matrix_dirty {
                matrix_roots.push(node.clone());
                if node.is_branch() {
                    // world matrices of every descendant branch are stale now
                    collect_descendant_branches(node, &mut |b| {
                        enroll(b, &mut enrolled, &mut enrolled_ids)
                    });
                }
            }
        }

        // dependencies discovered before recompute: a dirty child of an
        // enrolled branch that the tracker never saw gets its own block so
        // its old footprint is still repainted
        let mut extra: Vec<Node> = Vec::new();
        for node in &enrolled {
            if !node.is_branch() {
                continue;
            }
            for c in node.children() {
                if enrolled_ids.contains(&c.id()) {
                    continue;
                }
                if c.has_flags(DirtyFlags::BOUNDS_CHANGED) {
                    enrolled_ids.insert(c.id());
                    extra.push(c);
                }
            }
        }

        // per-node before-snapshots, taken while every cache is still stale
        let touched_ids: HashSet<u32> = change.nodes.iter().map(|n| n.id()).collect();
        let before_map: Vec<(Node, Rect)> = enrolled
            .iter()
            .map(|n| (n.clone(), n.cached_world_bounds(Tier::Render)))
            .collect();
        let extra_before = union_cached_world(&extra);

        // matrices before the bounds that depend on them; parents first so
        // each chain is walked once
        matrix_roots.sort_by_key(|n| n.depth());
        for node in &matrix_roots {
            node.ensure_world_matrix();
            if node.is_branch() {
                update_matrices_recursive(node);
            }
        }

        // deepest first: children are always up to date before their parent
        let mut by_depth: BTreeMap<usize, Vec<Node>> = BTreeMap::new();
        for node in enrolled.iter().chain(extra.iter()) {
            by_depth.entry(node.depth()).or_default().push(node.clone());
        }
        for (_, nodes) in by_depth.iter().rev() {
            for node in nodes {
                if let Err(e) = node.update_bounds() {
                    error!("partial layout aborted at {:?}: {}", node, e);
                    return LayoutResult::skipped();
                }
            }
        }

        // the block carries the touched nodes plus any enrolled ancestor
        // whose bounds actually moved; an ancestor whose footprint is
        // unchanged must not inflate the damage to its whole subtree
        let mut block_nodes = Vec::new();
        let mut before = Rect::empty();
        let mut after = Rect::empty();
        for (node, before_bounds) in &before_map {
            let after_bounds = if node.is_visible() {
                node.world_bounds(Tier::Render)
            } else {
                node.cached_world_bounds(Tier::Render)
            };
            if touched_ids.contains(&node.id()) || after_bounds != *before_bounds {
                before = before.union(before_bounds);
                after = after.union(&after_bounds);
                block_nodes.push(node.clone());
            }
        }
        let extra_after = union_world(&extra);
        for node in enrolled.iter().chain(extra.iter()) {
            node.clear_pass_flags();
        }

        self.stats.passes += 1;
        self.stats.partial_passes += 1;
        self.stats.enrolled_nodes += (enrolled.len() + extra.len()) as u32;

        let mut blocks = vec![LayoutBlock {
            nodes: block_nodes,
            before,
            after,
        }];
        if !extra.is_empty() {
            blocks.push(LayoutBlock {
                nodes: extra,
                before: extra_before,
                after: extra_after,
            });
        }
        LayoutResult {
            mode: LayoutMode::Partial,
            blocks,
        }
    }
}

impl Default for LayoutEngine {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn warn_retry_ceiling(what: &str) {
    warn!(
        "{} requested again more than {} times in one frame, deferring to the next frame",
        what, MAX_RERUNS
    );
}

fn union_cached_world(nodes: &[Node]) -> Rect {
    let mut acc = Rect::empty();
    for n in nodes {
        acc = acc.union(&n.cached_world_bounds(Tier::Render));
    }
    acc
}

fn union_world(nodes: &[Node]) -> Rect {
    let mut acc = Rect::empty();
    for n in nodes {
        if n.is_visible() {
            acc = acc.union(&n.world_bounds(Tier::Render));
        } else {
            acc = acc.union(&n.cached_world_bounds(Tier::Render));
        }
    }
    acc
}

fn mark_all_dirty(node: &Node) {
    node.add_flags(
        DirtyFlags::MATRIX
            | DirtyFlags::LOCAL_BOX
            | DirtyFlags::CONTENT
            | DirtyFlags::STROKE
            | DirtyFlags::RENDER,
    );
    for c in node.children() {
        mark_all_dirty(&c);
    }
}

fn update_matrices_recursive(node: &Node) {
    node.ensure_world_matrix();
    for c in node.children() {
        update_matrices_recursive(&c);
    }
}

fn update_bounds_recursive(node: &Node) -> anyhow::Result<()> {
    for c in node.children() {
        update_bounds_recursive(&c)?;
    }
    node.update_bounds()
}

fn clear_pass_flags_recursive(node: &Node) {
    node.clear_pass_flags();
    for c in node.children() {
        clear_pass_flags_recursive(&c);
    }
}

fn collect_descendant_branches(node: &Node, visit: &mut dyn FnMut(&Node)) {
    for c in node.children() {
        if c.is_branch() {
            visit(&c);
            collect_descendant_branches(&c, visit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use crate::shape::RectShape;
    use crate::tracker::ChangeTracker;

    fn leaf(w: f32, h: f32) -> Node {
        Node::leaf(Box::new(RectShape::new(w, h)))
    }

    fn tracked_tree() -> (Node, crate::node::TrackerHandle) {
        let tracker = std::rc::Rc::new(std::cell::RefCell::new(ChangeTracker::new()));
        let root = Node::branch();
        root.set_tracker_recursive(Some(tracker.clone()));
        tracker.borrow_mut().set_root(&root);
        (root, tracker)
    }

    fn run_first_layout(engine: &mut LayoutEngine, root: &Node, tracker: &crate::node::TrackerHandle) {
        let set = tracker.borrow_mut().flush();
        let result = engine.layout(root, set);
        assert_eq!(LayoutMode::Full, result.mode);
    }

    #[test]
    fn test_first_pass_is_full() {
        let (root, tracker) = tracked_tree();
        root.add_child(leaf(10.0, 10.0));
        let mut engine = LayoutEngine::new();
        run_first_layout(&mut engine, &root, &tracker);
        assert!(engine.performed_first());
        assert_eq!(1, engine.stats().full_passes);
    }

    #[test]
    fn test_partial_pass_emits_before_after_damage() {
        let (root, tracker) = tracked_tree();
        let child = leaf(100.0, 100.0);
        root.add_child(child.clone());
        let mut engine = LayoutEngine::new();
        run_first_layout(&mut engine, &root, &tracker);

        child.set_x(50.0);
        let set = tracker.borrow_mut().flush();
        let result = engine.layout(&root, set);
        assert_eq!(LayoutMode::Partial, result.mode);
        assert_eq!(1, result.blocks.len());
        let damage = result.blocks[0].damage();
        // old footprint (0,0,100,100) plus new (50,0,100,100)
        assert_eq!(Rect::new(0.0, 0.0, 150.0, 100.0), damage);
    }

    #[test]
    fn test_structure_change_forces_full() {
        let (root, tracker) = tracked_tree();
        root.add_child(leaf(10.0, 10.0));
        let mut engine = LayoutEngine::new();
        run_first_layout(&mut engine, &root, &tracker);

        root.add_child(leaf(20.0, 20.0));
        let set = tracker.borrow_mut().flush();
        assert!(set.structure_changed);
        let result = engine.layout(&root, set);
        assert_eq!(LayoutMode::Full, result.mode);
    }

    #[test]
    fn test_idempotent_second_pass_does_no_work() {
        let (root, tracker) = tracked_tree();
        let child = leaf(10.0, 10.0);
        root.add_child(child.clone());
        let mut engine = LayoutEngine::new();
        run_first_layout(&mut engine, &root, &tracker);

        child.set_x(5.0);
        let set = tracker.borrow_mut().flush();
        engine.layout(&root, set);

        root.reset_update_counts();
        let set = tracker.borrow_mut().flush();
        let result = engine.layout(&root, set);
        assert_eq!(LayoutMode::Skipped, result.mode);
        assert_eq!(0, child.matrix_update_count());
        assert_eq!(0, child.bounds_update_count());
    }

    #[test]
    fn test_minimality_siblings_untouched() {
        let (root, tracker) = tracked_tree();
        let moved = leaf(10.0, 10.0);
        let mut siblings = Vec::new();
        root.add_child(moved.clone());
        for i in 0..50 {
            let s = leaf(10.0, 10.0);
            s.set_x(i as f32 * 20.0);
            root.add_child(s.clone());
            siblings.push(s);
        }
        let mut engine = LayoutEngine::new();
        run_first_layout(&mut engine, &root, &tracker);
        root.reset_update_counts();

        moved.set_x(500.0);
        let set = tracker.borrow_mut().flush();
        let result = engine.layout(&root, set);
        assert_eq!(LayoutMode::Partial, result.mode);
        assert!(moved.matrix_update_count() > 0);
        assert!(root.bounds_update_count() > 0);
        for s in &siblings {
            assert_eq!(0, s.matrix_update_count(), "sibling matrix recomputed");
            assert_eq!(0, s.bounds_update_count(), "sibling bounds recomputed");
        }
    }

    #[test]
    fn test_reentrant_layout_queues_run_again() {
        let (root, tracker) = tracked_tree();
        root.add_child(leaf(10.0, 10.0));
        let mut engine = LayoutEngine::new();
        // simulate a pass already running
        engine.state = RunState::Running;
        let set = tracker.borrow_mut().flush();
        let result = engine.layout(&root, set);
        assert_eq!(LayoutMode::Skipped, result.mode);
        engine.state = RunState::Idle;
        assert!(engine.take_run_again());
        assert!(!engine.take_run_again());
    }

    #[test]
    fn test_extra_block_for_undiscovered_dirty_child() {
        let (root, tracker) = tracked_tree();
        let branch = Node::branch();
        let tracked = leaf(10.0, 10.0);
        let untracked = leaf(10.0, 10.0);
        branch.add_child(tracked.clone());
        branch.add_child(untracked.clone());
        root.add_child(branch.clone());
        let mut engine = LayoutEngine::new();
        run_first_layout(&mut engine, &root, &tracker);

        // mutate one child with tracking off: the tracker never sees it
        tracker.borrow_mut().set_enabled(false);
        untracked.set_width(Some(40.0));
        tracker.borrow_mut().set_enabled(true);
        tracked.set_x(5.0);

        let set = tracker.borrow_mut().flush();
        let result = engine.layout(&root, set);
        assert_eq!(LayoutMode::Partial, result.mode);
        assert_eq!(2, result.blocks.len(), "expected the extra block");
        assert!(result.blocks[1].nodes.contains(&untracked));
    }
}
