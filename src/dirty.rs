//! Dirty flags and the invalidation cascade.
//!
//! All cascade rules live here. Property setters call one `mark_*` entry
//! point; each returns whether the mark was newly applied so cascades stay
//! idempotent and stop at already-dirty ancestors.

use crate::node::Node;
use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DirtyFlags: u16 {
        /// Local (and hence world) transform must be recomputed.
        const MATRIX          = 1 << 0;
        /// Own-geometry box bounds must be recomputed.
        const LOCAL_BOX       = 1 << 1;
        /// Content bounds must be recomputed.
        const CONTENT         = 1 << 2;
        /// Stroke bounds must be recomputed.
        const STROKE          = 1 << 3;
        /// Render bounds must be recomputed.
        const RENDER          = 1 << 4;
        /// Aggregate: some bounds tier changed since the last layout pass.
        const BOUNDS_CHANGED  = 1 << 5;
        /// Children were added, removed or reordered (branch only).
        const CHILD_STRUCTURE = 1 << 6;
        /// Cached hit-test data is stale.
        const HIT_CACHE       = 1 << 7;
        /// Sticky: scale/rotation/skew changed, so the next matrix update
        /// must fully recompose instead of patching the translation.
        const SCALE_ROTATION  = 1 << 8;
    }
}

/// Bounds tier. Box, stroke and render form a superset-by-spread chain;
/// content is independent of stroke and render.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Tier {
    Box,
    Content,
    Stroke,
    Render,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Box, Tier::Content, Tier::Stroke, Tier::Render];

    pub(crate) fn index(self) -> usize {
        match self {
            Tier::Box => 0,
            Tier::Content => 1,
            Tier::Stroke => 2,
            Tier::Render => 3,
        }
    }

    pub(crate) fn flag(self) -> DirtyFlags {
        match self {
            Tier::Box => DirtyFlags::LOCAL_BOX,
            Tier::Content => DirtyFlags::CONTENT,
            Tier::Stroke => DirtyFlags::STROKE,
            Tier::Render => DirtyFlags::RENDER,
        }
    }
}

/// Position or around-point changed.
pub(crate) fn mark_matrix(node: &Node) -> bool {
    let newly = node.add_flags(DirtyFlags::MATRIX | DirtyFlags::HIT_CACHE);
    // the parent unions this node through its local matrix, so the box
    // chain upward is stale even though the node's own geometry is not
    mark_bounds(node, DirtyFlags::LOCAL_BOX | DirtyFlags::CONTENT | DirtyFlags::STROKE | DirtyFlags::RENDER);
    newly.contains(DirtyFlags::MATRIX)
}

/// Scale, rotation or skew changed: matrix plus the sticky recompose hint.
pub(crate) fn mark_scale_rotation(node: &Node) -> bool {
    node.add_flags(DirtyFlags::SCALE_ROTATION);
    mark_matrix(node)
}

/// Size or path geometry changed.
pub(crate) fn mark_local_box(node: &Node) -> bool {
    let newly = mark_bounds(
        node,
        DirtyFlags::LOCAL_BOX | DirtyFlags::CONTENT | DirtyFlags::STROKE | DirtyFlags::RENDER,
    );
    // a center origin moves with the box
    if node.around_depends_on_size() {
        node.add_flags(DirtyFlags::MATRIX | DirtyFlags::HIT_CACHE);
    }
    newly
}

/// Stroke declaration changed. Render is a superset of stroke.
pub(crate) fn mark_stroke(node: &Node) -> bool {
    mark_bounds(node, DirtyFlags::STROKE | DirtyFlags::RENDER)
}

/// Shadow/blur/filter spread changed.
pub(crate) fn mark_render(node: &Node) -> bool {
    mark_bounds(node, DirtyFlags::RENDER)
}

/// Content tier changed without the box changing (clip toggled).
pub(crate) fn mark_content(node: &Node) -> bool {
    mark_bounds(node, DirtyFlags::CONTENT)
}

/// A child was added, removed or reordered under `node`.
pub(crate) fn mark_structure(node: &Node) -> bool {
    let newly = node.add_flags(DirtyFlags::CHILD_STRUCTURE);
    mark_bounds(
        node,
        DirtyFlags::LOCAL_BOX | DirtyFlags::CONTENT | DirtyFlags::STROKE | DirtyFlags::RENDER,
    );
    newly.contains(DirtyFlags::CHILD_STRUCTURE)
}

/// Apply tier flags to `node` and walk them up the parent chain. Branch
/// unions depend on children, so every ancestor's matching tiers go stale
/// too. Stops as soon as an ancestor already carries all the flags.
fn mark_bounds(node: &Node, tiers: DirtyFlags) -> bool {
    let flags = tiers | DirtyFlags::BOUNDS_CHANGED | DirtyFlags::HIT_CACHE;
    let newly = node.add_flags(flags);
    if newly.is_empty() {
        return false;
    }
    let mut current = node.parent();
    while let Some(p) = current {
        if p.add_flags(flags).is_empty() {
            break;
        }
        current = p.parent();
    }
    true
}
