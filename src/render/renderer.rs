//! Dirty-region compositor: merges damage, clips, and redraws only the
//! intersecting subtree, compositing one-unit groups through pooled scratch
//! surfaces.

use crate::base::{Rect, StateMarker};
use crate::dirty::Tier;
use crate::layout::RunState;
use crate::math::Matrix;
use crate::node::Node;
use crate::paint::InvalidArea;
use crate::render::surface::{DrawSurface, RenderBackend, SurfacePool};
use log::warn;
use measure_time::debug_time;

/// Pixels added around the merged damage rect to absorb anti-aliasing and
/// stroke edge bleed.
pub const DAMAGE_MARGIN: f32 = 2.0;

#[derive(Debug, Clone, PartialEq)]
pub enum RenderOutcome {
    Full(Rect),
    Partial(Rect),
    Skipped,
}

#[derive(Debug, Default, Clone)]
pub struct RenderStats {
    pub full_renders: u32,
    pub partial_renders: u32,
    pub drawn_nodes: u32,
}

pub struct Renderer {
    state: RunState,
    run_again: bool,
    pending: InvalidArea,
    need_full: StateMarker,
    pool: SurfacePool,
    stats: RenderStats,
}

impl Renderer {
    pub fn new() -> Self {
        let mut need_full = StateMarker::new();
        // nothing has ever been drawn, the first pass must paint everything
        need_full.mark();
        Self {
            state: RunState::Idle,
            run_again: false,
            pending: InvalidArea::None,
            need_full,
            pool: SurfacePool::default(),
            stats: RenderStats::default(),
        }
    }

    pub fn stats(&self) -> &RenderStats {
        &self.stats
    }

    pub fn invalidate_rect(&mut self, rect: &Rect) {
        self.pending.add_rect(rect);
    }

    /// Full-surface damage: resize, pixel-ratio change, forced invalidation.
    pub fn invalidate_all(&mut self) {
        self.pending.set_full();
        self.need_full.mark();
    }

    pub fn has_pending(&self) -> bool {
        self.need_full.is_marked() || !self.pending.is_none()
    }

    pub fn take_run_again(&mut self) -> bool {
        std::mem::replace(&mut self.run_again, false)
    }

    pub fn pool_mut(&mut self) -> &mut SurfacePool {
        &mut self.pool
    }

    /// Draw one frame. Always runs against fully laid-out state; the caller
    /// (the stage) drains layout first.
    pub fn render(
        &mut self,
        root: &Node,
        target: &mut dyn DrawSurface,
        backend: &mut dyn RenderBackend,
    ) -> RenderOutcome {
        if self.state == RunState::Running {
            self.state = RunState::AgainRequested;
            self.run_again = true;
            return RenderOutcome::Skipped;
        }
        self.state = RunState::Running;
        let pending = std::mem::replace(&mut self.pending, InvalidArea::None);
        let outcome = self.render_inner(root, target, backend, pending);
        if self.state == RunState::AgainRequested {
            self.run_again = true;
        }
        self.state = RunState::Idle;
        outcome
    }

    fn render_inner(
        &mut self,
        root: &Node,
        target: &mut dyn DrawSurface,
        backend: &mut dyn RenderBackend,
        pending: InvalidArea,
    ) -> RenderOutcome {
        let ratio = target.pixel_ratio();
        let surface_rect = Rect::from_size(
            target.width() as f32 / ratio,
            target.height() as f32 / ratio,
        );
        if self.need_full.unmark() || pending == InvalidArea::Full {
            debug_time!("full render");
            target.save();
            target.set_transform(&Matrix::identity());
            target.clear(None);
            let mut drawn = 0;
            draw_node(
                target,
                backend,
                &mut self.pool,
                root,
                &Matrix::identity(),
                None,
                false,
                &mut drawn,
            );
            target.restore();
            self.stats.full_renders += 1;
            self.stats.drawn_nodes += drawn;
            return RenderOutcome::Full(surface_rect);
        }
        let rects = match pending {
            InvalidArea::Partial(rects) => rects,
            _ => return RenderOutcome::Skipped,
        };
        let merged = crate::some_or_return!(rects.union_rect(), RenderOutcome::Skipped);
        let damage = merged.expand(DAMAGE_MARGIN).intersect(&surface_rect);
        if damage.is_empty() {
            return RenderOutcome::Skipped;
        }
        debug_time!("partial render");
        target.save();
        target.set_transform(&Matrix::identity());
        target.clip(&damage);
        target.clear(Some(&damage));
        let mut drawn = 0;
        draw_node(
            target,
            backend,
            &mut self.pool,
            root,
            &Matrix::identity(),
            Some(&damage),
            false,
            &mut drawn,
        );
        target.restore();
        self.stats.partial_renders += 1;
        self.stats.drawn_nodes += drawn;
        RenderOutcome::Partial(damage)
    }
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

/// Recursive node draw. `base` maps world space into the surface's logical
/// space (offset when drawing into a scratch surface). `clip` is the damage
/// rect in world space; nodes fully inside it stop testing their children.
/// `skip_opacity` is set when the node is the root of an opacity composite
/// already being blitted with its opacity.
#[allow(clippy::too_many_arguments)]
fn draw_node(
    surface: &mut dyn DrawSurface,
    backend: &mut dyn RenderBackend,
    pool: &mut SurfacePool,
    node: &Node,
    base: &Matrix,
    clip: Option<&Rect>,
    skip_opacity: bool,
    drawn: &mut u32,
) {
    if !node.is_visible() {
        return;
    }
    let opacity = node.opacity();
    if opacity <= 0.0 {
        return;
    }
    let bounds = node.world_bounds(Tier::Render);
    let child_clip = match clip {
        Some(c) => {
            if !c.intersects(&bounds) {
                return;
            }
            if c.contains_rect(&bounds) {
                // fully inside the damage region, no more per-node tests
                None
            } else {
                clip
            }
        }
        None => None,
    };

    if opacity < 1.0 && !skip_opacity {
        composite_opacity_group(surface, backend, pool, node, base, &bounds, opacity, drawn);
        return;
    }

    *drawn += 1;
    let matrix = base.multiply(&node.world_matrix());
    surface.save();
    surface.set_transform(&matrix);
    node.render_content().run(surface);
    if node.is_branch() {
        if node.clips_children() {
            surface.clip(&node.local_bounds(Tier::Box));
        }
        for child in node.children_in_paint_order() {
            draw_node(surface, backend, pool, &child, base, child_clip, false, drawn);
        }
    }
    surface.restore();
}

/// Draw the subtree into a pooled scratch surface and blit it once with the
/// group's opacity. Allocation failure degrades to direct drawing (the group
/// loses one-unit opacity semantics but the frame still completes).
#[allow(clippy::too_many_arguments)]
fn composite_opacity_group(
    surface: &mut dyn DrawSurface,
    backend: &mut dyn RenderBackend,
    pool: &mut SurfacePool,
    node: &Node,
    base: &Matrix,
    bounds: &Rect,
    opacity: f32,
    drawn: &mut u32,
) {
    let ratio = surface.pixel_ratio();
    let width = (bounds.width * ratio).ceil() as u32;
    let height = (bounds.height * ratio).ceil() as u32;
    if width == 0 || height == 0 {
        return;
    }
    let mut scratch = match pool.get(backend, width, height, ratio) {
        Ok(s) => s,
        Err(e) => {
            warn!("scratch surface unavailable, drawing group without compositing: {}", e);
            draw_node(surface, backend, pool, node, base, None, true, drawn);
            return;
        }
    };
    scratch.set_transform(&Matrix::identity());
    scratch.clear(None);
    let scratch_base = Matrix::translation(-bounds.x, -bounds.y);
    draw_node(
        scratch.as_mut(),
        backend,
        pool,
        node,
        &scratch_base,
        None,
        true,
        drawn,
    );
    surface.save();
    surface.set_transform(base);
    surface.draw_surface(
        scratch.as_ref(),
        &Rect::from_size(width as f32, height as f32),
        bounds,
        opacity,
    );
    surface.restore();
    pool.recycle(scratch);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use crate::render::raster::RasterBackend;
    use crate::shape::RectShape;
    use crate::style::{Color, Paint};

    fn colored_leaf(w: f32, h: f32, color: Color) -> Node {
        let n = Node::leaf(Box::new(RectShape::new(w, h)));
        n.set_paint(Paint::fill(color));
        n
    }

    fn new_target(w: u32, h: u32) -> Box<dyn DrawSurface> {
        RasterBackend.create_surface(w, h, 1.0).unwrap()
    }

    #[test]
    fn test_first_render_is_full() {
        let root = Node::branch();
        root.add_child(colored_leaf(10.0, 10.0, Color::rgb(255, 0, 0)));
        let mut renderer = Renderer::new();
        let mut target = new_target(20, 20);
        let mut backend = RasterBackend;
        let outcome = renderer.render(&root, target.as_mut(), &mut backend);
        assert_eq!(RenderOutcome::Full(Rect::from_size(20.0, 20.0)), outcome);
        assert_eq!(
            vec![255, 0, 0, 255],
            target.read_pixels(&Rect::new(5.0, 5.0, 1.0, 1.0))
        );
    }

    #[test]
    fn test_partial_render_redraws_only_damage() {
        let root = Node::branch();
        let leaf = colored_leaf(10.0, 10.0, Color::rgb(0, 0, 255));
        root.add_child(leaf.clone());
        let mut renderer = Renderer::new();
        let mut target = new_target(40, 40);
        let mut backend = RasterBackend;
        renderer.render(&root, target.as_mut(), &mut backend);

        leaf.set_x(20.0);
        renderer.invalidate_rect(&Rect::new(0.0, 0.0, 30.0, 10.0));
        let outcome = renderer.render(&root, target.as_mut(), &mut backend);
        match outcome {
            RenderOutcome::Partial(damage) => {
                assert!(damage.contains_rect(&Rect::new(0.0, 0.0, 30.0, 10.0)));
            }
            other => panic!("expected partial render, got {:?}", other),
        }
        // old footprint cleared, new footprint drawn
        assert_eq!(
            vec![0, 0, 0, 0],
            target.read_pixels(&Rect::new(5.0, 5.0, 1.0, 1.0))
        );
        assert_eq!(
            vec![0, 0, 255, 255],
            target.read_pixels(&Rect::new(25.0, 5.0, 1.0, 1.0))
        );
    }

    #[test]
    fn test_no_pending_damage_skips() {
        let root = Node::branch();
        let mut renderer = Renderer::new();
        let mut target = new_target(10, 10);
        let mut backend = RasterBackend;
        renderer.render(&root, target.as_mut(), &mut backend);
        assert!(!renderer.has_pending());
        let outcome = renderer.render(&root, target.as_mut(), &mut backend);
        assert_eq!(RenderOutcome::Skipped, outcome);
    }

    #[test]
    fn test_opacity_group_composites_once() {
        let root = Node::branch();
        let group = Node::branch();
        // two overlapping opaque children; with group opacity the overlap
        // must not double-blend
        group.add_child(colored_leaf(10.0, 10.0, Color::rgb(255, 0, 0)));
        group.add_child(colored_leaf(10.0, 10.0, Color::rgb(255, 0, 0)));
        group.set_opacity(0.5);
        root.add_child(group);
        let mut renderer = Renderer::new();
        let mut target = new_target(20, 20);
        let mut backend = RasterBackend;
        renderer.render(&root, target.as_mut(), &mut backend);
        let px = target.read_pixels(&Rect::new(5.0, 5.0, 1.0, 1.0));
        // premultiplied half-opacity red; double blending would push alpha
        // toward 191
        assert!((126..=129).contains(&px[3]), "alpha {}", px[3]);
        assert!((126..=129).contains(&px[0]), "red {}", px[0]);
        assert!(renderer.pool_mut().free_count() > 0, "scratch was recycled");
    }

    #[test]
    fn test_invisible_subtree_not_drawn() {
        let root = Node::branch();
        let leaf = colored_leaf(10.0, 10.0, Color::rgb(1, 1, 1));
        leaf.set_visible(false);
        root.add_child(leaf);
        let mut renderer = Renderer::new();
        let mut target = new_target(10, 10);
        let mut backend = RasterBackend;
        renderer.render(&root, target.as_mut(), &mut backend);
        assert_eq!(
            vec![0, 0, 0, 0],
            target.read_pixels(&Rect::new(5.0, 5.0, 1.0, 1.0))
        );
    }
}
