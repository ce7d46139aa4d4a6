use crate::base::{Point, Rect, TwoPointBounds};
use crate::dirty::{self, DirtyFlags, Tier};
use crate::math::{Decomposed, Matrix};
use crate::number::normalize_rotation;
use crate::render::RenderFn;
use crate::shape::Group;
use crate::style::{Paint, Stroke};
use crate::tracker::ChangeTracker;
use anyhow::Result;
use log::{error, warn};
use std::cell::{Cell, RefCell};
use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};

thread_local! {
    static NEXT_NODE_ID: Cell<u32> = Cell::new(1);
}

pub(crate) type TrackerHandle = Rc<RefCell<ChangeTracker>>;

/// Geometry and drawing hooks a node's content provides. Shape kinds (path
/// generation, text layout) live outside the pipeline behind this trait.
pub trait NodeContent {
    fn name(&self) -> &str;

    /// Natural box when the node's width/height are auto.
    fn compute_own_box(&mut self) -> Result<Rect> {
        Ok(Rect::empty())
    }

    /// Pre-effect drawable content, usually the box itself.
    fn compute_own_content(&mut self, own_box: &Rect) -> Result<Rect> {
        Ok(*own_box)
    }

    /// Extra margin the content's own sub-shapes add around the stroke.
    fn declared_stroke_spread(&self) -> f32 {
        0.0
    }

    /// Extra margin shadow/blur/filter rendering needs around the stroke.
    fn declared_render_spread(&self) -> f32 {
        0.0
    }

    fn render(&mut self, ctx: ShapeContext) -> RenderFn {
        let _ = ctx;
        RenderFn::empty()
    }
}

/// Resolved inputs handed to a content's `render` hook.
pub struct ShapeContext {
    pub box_bounds: Rect,
    pub paint: Paint,
}

/// Transform origin for scale/rotation/skew.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Around {
    Point(Point),
    Center,
}

#[derive(Debug, Copy, Clone, Default)]
struct TierCache {
    local: Rect,
    world: Rect,
    world_seen: u64,
    world_valid: bool,
}

struct NodeData {
    id: u32,
    is_branch: bool,
    content: Box<dyn NodeContent>,
    parent: Option<NodeWeak>,
    children: Vec<Node>,
    tracker: Option<TrackerHandle>,

    transform: Decomposed,
    around: Option<Around>,
    width: Option<f32>,
    height: Option<f32>,
    visible: bool,
    opacity: f32,
    z_index: Option<i32>,
    scroll_x: f32,
    scroll_y: f32,
    clip_children: bool,
    paint: Paint,
    effect_spread: f32,

    local_matrix: Matrix,
    local_ready: bool,
    world_matrix: Matrix,
    world_ready: bool,
    /// Bumped whenever the frame children derive from (world matrix plus
    /// scroll offset) changes value.
    world_version: u64,
    world_parent_seen: u64,
    tiers: [TierCache; 4],
    dirty: DirtyFlags,

    matrix_updates: u32,
    bounds_updates: u32,
}

impl NodeData {
    fn new(is_branch: bool, content: Box<dyn NodeContent>) -> Self {
        let id = NEXT_NODE_ID.with(|k| {
            let id = k.get();
            k.set(id + 1);
            id
        });
        Self {
            id,
            is_branch,
            content,
            parent: None,
            children: Vec::new(),
            tracker: None,
            transform: Decomposed::default(),
            around: None,
            width: None,
            height: None,
            visible: true,
            opacity: 1.0,
            z_index: None,
            scroll_x: 0.0,
            scroll_y: 0.0,
            clip_children: false,
            paint: Paint::default(),
            effect_spread: 0.0,
            local_matrix: Matrix::identity(),
            local_ready: false,
            world_matrix: Matrix::identity(),
            world_ready: false,
            world_version: 0,
            world_parent_seen: 0,
            tiers: [TierCache::default(); 4],
            dirty: DirtyFlags::all(),
            matrix_updates: 0,
            bounds_updates: 0,
        }
    }

    fn world_for_children(&self) -> Matrix {
        if self.scroll_x == 0.0 && self.scroll_y == 0.0 {
            self.world_matrix
        } else {
            self.world_matrix
                .multiply(&Matrix::translation(-self.scroll_x, -self.scroll_y))
        }
    }

    fn resolved_around(&self) -> Option<Point> {
        match self.around {
            None => None,
            Some(Around::Point(p)) => Some(p),
            Some(Around::Center) => {
                let b = self.tiers[Tier::Box.index()].local;
                Some(Point::new(b.x + b.width / 2.0, b.y + b.height / 2.0))
            }
        }
    }
}

/// Shared handle to a scene node.
#[derive(Clone)]
pub struct Node {
    inner: Rc<RefCell<NodeData>>,
}

#[derive(Clone)]
pub struct NodeWeak {
    inner: Weak<RefCell<NodeData>>,
}

impl NodeWeak {
    pub fn upgrade(&self) -> Option<Node> {
        self.inner.upgrade().map(|inner| Node { inner })
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl Debug for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let d = self.inner.borrow();
        write!(f, "Node({}, {})", d.id, d.content.name())
    }
}

impl Node {
    pub fn leaf(content: Box<dyn NodeContent>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(NodeData::new(false, content))),
        }
    }

    pub fn branch() -> Self {
        Self {
            inner: Rc::new(RefCell::new(NodeData::new(true, Box::new(Group)))),
        }
    }

    pub fn id(&self) -> u32 {
        self.inner.borrow().id
    }

    pub fn is_branch(&self) -> bool {
        self.inner.borrow().is_branch
    }

    pub fn as_weak(&self) -> NodeWeak {
        NodeWeak {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn parent(&self) -> Option<Node> {
        self.inner.borrow().parent.as_ref().and_then(|p| p.upgrade())
    }

    pub fn children(&self) -> Vec<Node> {
        self.inner.borrow().children.clone()
    }

    pub fn child_count(&self) -> usize {
        self.inner.borrow().children.len()
    }

    /// Children in paint order: insertion order, overridden by `z_index`.
    pub fn children_in_paint_order(&self) -> Vec<Node> {
        let mut children = self.children();
        children.sort_by_key(|c| c.inner.borrow().z_index.unwrap_or(0));
        children
    }

    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self.parent();
        while let Some(p) = current {
            depth += 1;
            current = p.parent();
        }
        depth
    }

    // ---- dirty flag plumbing (used by the dirty module and the engine) ----

    pub(crate) fn add_flags(&self, flags: DirtyFlags) -> DirtyFlags {
        let mut d = self.inner.borrow_mut();
        let newly = flags - d.dirty;
        d.dirty |= flags;
        newly
    }

    pub(crate) fn clear_flags(&self, flags: DirtyFlags) {
        self.inner.borrow_mut().dirty -= flags;
    }

    pub(crate) fn has_flags(&self, flags: DirtyFlags) -> bool {
        self.inner.borrow().dirty.contains(flags)
    }

    pub(crate) fn around_depends_on_size(&self) -> bool {
        matches!(self.inner.borrow().around, Some(Around::Center))
    }

    fn track_change(&self) {
        let tracker = self.inner.borrow().tracker.clone();
        if let Some(t) = tracker {
            t.borrow_mut().track_change(self.clone());
        }
    }

    pub(crate) fn set_tracker_recursive(&self, tracker: Option<TrackerHandle>) {
        self.inner.borrow_mut().tracker = tracker.clone();
        for c in self.children() {
            c.set_tracker_recursive(tracker.clone());
        }
    }

    fn invalidate_world_recursive(&self) {
        {
            let mut d = self.inner.borrow_mut();
            d.world_ready = false;
            for tc in &mut d.tiers {
                tc.world_valid = false;
            }
        }
        for c in self.children() {
            c.invalidate_world_recursive();
        }
    }

    // ---- property setters ----

    pub fn x(&self) -> f32 {
        self.inner.borrow().transform.x
    }

    pub fn set_x(&self, value: f32) {
        if !Self::check_finite("x", value) {
            return;
        }
        {
            let mut d = self.inner.borrow_mut();
            if d.transform.x == value {
                return;
            }
            d.transform.x = value;
        }
        dirty::mark_matrix(self);
        self.track_change();
    }

    pub fn y(&self) -> f32 {
        self.inner.borrow().transform.y
    }

    pub fn set_y(&self, value: f32) {
        if !Self::check_finite("y", value) {
            return;
        }
        {
            let mut d = self.inner.borrow_mut();
            if d.transform.y == value {
                return;
            }
            d.transform.y = value;
        }
        dirty::mark_matrix(self);
        self.track_change();
    }

    pub fn set_position(&self, x: f32, y: f32) {
        self.set_x(x);
        self.set_y(y);
    }

    pub fn scale_x(&self) -> f32 {
        self.inner.borrow().transform.scale_x
    }

    pub fn set_scale_x(&self, value: f32) {
        if !Self::check_finite("scale_x", value) {
            return;
        }
        {
            let mut d = self.inner.borrow_mut();
            if d.transform.scale_x == value {
                return;
            }
            d.transform.scale_x = value;
        }
        dirty::mark_scale_rotation(self);
        self.track_change();
    }

    pub fn scale_y(&self) -> f32 {
        self.inner.borrow().transform.scale_y
    }

    pub fn set_scale_y(&self, value: f32) {
        if !Self::check_finite("scale_y", value) {
            return;
        }
        {
            let mut d = self.inner.borrow_mut();
            if d.transform.scale_y == value {
                return;
            }
            d.transform.scale_y = value;
        }
        dirty::mark_scale_rotation(self);
        self.track_change();
    }

    pub fn set_scale(&self, value: f32) {
        self.set_scale_x(value);
        self.set_scale_y(value);
    }

    pub fn rotation(&self) -> f32 {
        self.inner.borrow().transform.rotation
    }

    pub fn set_rotation(&self, value: f32) {
        if !Self::check_finite("rotation", value) {
            return;
        }
        let value = normalize_rotation(value);
        {
            let mut d = self.inner.borrow_mut();
            if d.transform.rotation == value {
                return;
            }
            d.transform.rotation = value;
        }
        dirty::mark_scale_rotation(self);
        self.track_change();
    }

    pub fn set_skew_x(&self, value: f32) {
        if !Self::check_finite("skew_x", value) {
            return;
        }
        {
            let mut d = self.inner.borrow_mut();
            if d.transform.skew_x == value {
                return;
            }
            d.transform.skew_x = value;
        }
        dirty::mark_scale_rotation(self);
        self.track_change();
    }

    pub fn set_skew_y(&self, value: f32) {
        if !Self::check_finite("skew_y", value) {
            return;
        }
        {
            let mut d = self.inner.borrow_mut();
            if d.transform.skew_y == value {
                return;
            }
            d.transform.skew_y = value;
        }
        dirty::mark_scale_rotation(self);
        self.track_change();
    }

    pub fn set_around(&self, around: Option<Around>) {
        {
            let mut d = self.inner.borrow_mut();
            if d.around == around {
                return;
            }
            d.around = around;
        }
        dirty::mark_scale_rotation(self);
        self.track_change();
    }

    pub fn width(&self) -> Option<f32> {
        self.inner.borrow().width
    }

    pub fn set_width(&self, value: Option<f32>) {
        if let Some(v) = value {
            if !Self::check_finite("width", v) {
                return;
            }
        }
        {
            let mut d = self.inner.borrow_mut();
            if d.width == value {
                return;
            }
            d.width = value;
        }
        dirty::mark_local_box(self);
        self.track_change();
    }

    pub fn height(&self) -> Option<f32> {
        self.inner.borrow().height
    }

    pub fn set_height(&self, value: Option<f32>) {
        if let Some(v) = value {
            if !Self::check_finite("height", v) {
                return;
            }
        }
        {
            let mut d = self.inner.borrow_mut();
            if d.height == value {
                return;
            }
            d.height = value;
        }
        dirty::mark_local_box(self);
        self.track_change();
    }

    pub fn set_size(&self, width: f32, height: f32) {
        self.set_width(Some(width));
        self.set_height(Some(height));
    }

    pub fn is_visible(&self) -> bool {
        self.inner.borrow().visible
    }

    pub fn set_visible(&self, value: bool) {
        {
            let mut d = self.inner.borrow_mut();
            if d.visible == value {
                return;
            }
            d.visible = value;
        }
        // parents union only visible children, so the box chain is stale
        dirty::mark_local_box(self);
        self.track_change();
    }

    pub fn opacity(&self) -> f32 {
        self.inner.borrow().opacity
    }

    pub fn set_opacity(&self, value: f32) {
        if !Self::check_finite("opacity", value) {
            return;
        }
        let value = value.clamp(0.0, 1.0);
        {
            let mut d = self.inner.borrow_mut();
            if d.opacity == value {
                return;
            }
            d.opacity = value;
        }
        // repaint only, no geometry change
        self.track_change();
    }

    pub fn z_index(&self) -> Option<i32> {
        self.inner.borrow().z_index
    }

    pub fn set_z_index(&self, value: Option<i32>) {
        {
            let mut d = self.inner.borrow_mut();
            if d.z_index == value {
                return;
            }
            d.z_index = value;
        }
        if let Some(p) = self.parent() {
            dirty::mark_structure(&p);
            p.track_change();
        }
        self.track_change();
    }

    pub fn paint(&self) -> Paint {
        self.inner.borrow().paint
    }

    pub fn set_paint(&self, paint: Paint) {
        let stroke_changed = {
            let mut d = self.inner.borrow_mut();
            if d.paint == paint {
                return;
            }
            let changed = d.paint.stroke.map(|s| (s.width, s.align))
                != paint.stroke.map(|s| (s.width, s.align));
            d.paint = paint;
            changed
        };
        if stroke_changed {
            dirty::mark_stroke(self);
        }
        self.track_change();
    }

    pub fn set_stroke(&self, stroke: Option<Stroke>) {
        let mut paint = self.paint();
        paint.stroke = stroke;
        self.set_paint(paint);
    }

    pub fn effect_spread(&self) -> f32 {
        self.inner.borrow().effect_spread
    }

    /// Declared shadow/blur/filter margin around the stroke bounds.
    pub fn set_effect_spread(&self, value: f32) {
        if !Self::check_finite("effect_spread", value) {
            return;
        }
        let value = value.max(0.0);
        {
            let mut d = self.inner.borrow_mut();
            if d.effect_spread == value {
                return;
            }
            d.effect_spread = value;
        }
        dirty::mark_render(self);
        self.track_change();
    }

    pub fn scroll(&self) -> (f32, f32) {
        let d = self.inner.borrow();
        (d.scroll_x, d.scroll_y)
    }

    /// Scroll offset applied to children's world transforms.
    pub fn set_scroll(&self, x: f32, y: f32) {
        if !Self::check_finite("scroll_x", x) || !Self::check_finite("scroll_y", y) {
            return;
        }
        {
            let mut d = self.inner.borrow_mut();
            if d.scroll_x == x && d.scroll_y == y {
                return;
            }
            d.scroll_x = x;
            d.scroll_y = y;
            // children derive their world transform from this frame
            d.world_version += 1;
        }
        dirty::mark_matrix(self);
        self.track_change();
    }

    pub fn clips_children(&self) -> bool {
        self.inner.borrow().clip_children
    }

    pub fn set_clip_children(&self, value: bool) {
        {
            let mut d = self.inner.borrow_mut();
            if d.clip_children == value {
                return;
            }
            d.clip_children = value;
        }
        dirty::mark_content(self);
        self.track_change();
    }

    /// External content mutation (a path or text changed behind the hook).
    pub fn mark_content_changed(&self) {
        dirty::mark_local_box(self);
        self.track_change();
    }

    fn check_finite(name: &str, value: f32) -> bool {
        if value.is_finite() {
            true
        } else {
            warn!("ignoring non-finite {}: {}", name, value);
            false
        }
    }

    // ---- tree structure ----

    pub fn add_child(&self, child: Node) {
        self.insert_child(child, None);
    }

    pub fn insert_child(&self, child: Node, position: Option<usize>) {
        if !self.is_branch() {
            warn!("ignoring add_child on a leaf node {:?}", self);
            return;
        }
        if child.parent().is_some() {
            warn!("ignoring add_child: {:?} already has a parent", child);
            return;
        }
        let tracker = self.inner.borrow().tracker.clone();
        {
            let mut d = self.inner.borrow_mut();
            let pos = position.unwrap_or(d.children.len()).min(d.children.len());
            d.children.insert(pos, child.clone());
        }
        {
            let mut cd = child.inner.borrow_mut();
            cd.parent = Some(self.as_weak());
        }
        child.set_tracker_recursive(tracker.clone());
        child.invalidate_world_recursive();
        dirty::mark_structure(self);
        if let Some(t) = tracker {
            t.borrow_mut().track_added(self, &child);
        }
    }

    pub fn remove_child_at(&self, position: usize) -> Option<Node> {
        let child = {
            let mut d = self.inner.borrow_mut();
            if position >= d.children.len() {
                return None;
            }
            d.children.remove(position)
        };
        self.detach_child(&child);
        Some(child)
    }

    pub fn remove_child(&self, child: &Node) -> bool {
        let removed = {
            let mut d = self.inner.borrow_mut();
            let before = d.children.len();
            d.children.retain(|c| c != child);
            before != d.children.len()
        };
        if removed {
            self.detach_child(child);
        }
        removed
    }

    fn detach_child(&self, child: &Node) {
        let tracker = self.inner.borrow().tracker.clone();
        child.inner.borrow_mut().parent = None;
        if let Some(t) = &tracker {
            t.borrow_mut().track_removed(self, child);
        }
        child.set_tracker_recursive(None);
        child.invalidate_world_recursive();
        dirty::mark_structure(self);
    }

    /// Detach from the parent and tear down the whole subtree.
    pub fn destroy(&self) {
        if let Some(p) = self.parent() {
            p.remove_child(self);
        }
        let children = {
            let mut d = self.inner.borrow_mut();
            std::mem::take(&mut d.children)
        };
        for c in children {
            c.inner.borrow_mut().parent = None;
            c.destroy();
        }
        self.inner.borrow_mut().tracker = None;
    }

    // ---- matrices ----

    /// Recompute the local matrix if flagged. Returns whether its value changed.
    pub(crate) fn ensure_local_matrix(&self) -> bool {
        if !self.has_flags(DirtyFlags::MATRIX) {
            let ready = self.inner.borrow().local_ready;
            if ready {
                return false;
            }
        }
        if self.around_depends_on_size() {
            if let Err(e) = self.ensure_local_bounds(Tier::Box) {
                error!("box recompute failed for {:?}: {}", self, e);
            }
        }
        let mut d = self.inner.borrow_mut();
        let old = d.local_matrix;
        let full = d.dirty.contains(DirtyFlags::SCALE_ROTATION) || !d.local_ready;
        let around = d.resolved_around();
        if full {
            d.local_matrix = Matrix::compose(&d.transform, around);
        } else {
            // translate-only: patch e/f, the linear part is unchanged
            let (ox, oy) = match around {
                Some(p) => (
                    p.x - (d.local_matrix.a * p.x + d.local_matrix.c * p.y),
                    p.y - (d.local_matrix.b * p.x + d.local_matrix.d * p.y),
                ),
                None => (0.0, 0.0),
            };
            d.local_matrix.e = d.transform.x + ox;
            d.local_matrix.f = d.transform.y + oy;
        }
        d.local_ready = true;
        d.dirty -= DirtyFlags::MATRIX | DirtyFlags::SCALE_ROTATION;
        d.matrix_updates += 1;
        old != d.local_matrix
    }

    /// Walk the parent chain and bring the world matrix up to date.
    pub(crate) fn ensure_world_matrix(&self) {
        let local_changed = self.ensure_local_matrix();
        let base = match self.parent() {
            Some(p) => {
                p.ensure_world_matrix();
                let pd = p.inner.borrow();
                Some((pd.world_for_children(), pd.world_version))
            }
            None => None,
        };
        let mut d = self.inner.borrow_mut();
        let (base_matrix, base_version) = base.unwrap_or((Matrix::identity(), 0));
        if local_changed || !d.world_ready || d.world_parent_seen != base_version {
            let new_world = base_matrix.multiply(&d.local_matrix);
            if !d.world_ready || new_world != d.world_matrix {
                d.world_matrix = new_world;
                d.world_version += 1;
            }
            d.world_ready = true;
            d.world_parent_seen = base_version;
        }
    }

    pub fn local_matrix(&self) -> Matrix {
        self.ensure_local_matrix();
        self.inner.borrow().local_matrix
    }

    pub fn world_matrix(&self) -> Matrix {
        self.ensure_world_matrix();
        self.inner.borrow().world_matrix
    }

    // ---- bounds tiers ----

    /// Union of visible children's `tier` bounds mapped into this node's
    /// coordinates (scroll offset applied).
    fn union_children(&self, tier: Tier) -> Result<Rect> {
        let children = self.children();
        let (scroll_x, scroll_y) = self.scroll();
        let mut acc = TwoPointBounds::new();
        for c in &children {
            if !c.is_visible() {
                continue;
            }
            c.ensure_local_bounds(tier)?;
            c.ensure_local_matrix();
            let cd = c.inner.borrow();
            let mapped = cd.local_matrix.map_rect(&cd.tiers[tier.index()].local);
            acc.add_rect(&mapped.translate(-scroll_x, -scroll_y));
        }
        Ok(acc.to_rect())
    }

    /// Bring a local bounds tier up to date, recursing into dependencies.
    /// Returns whether the cached value changed.
    pub(crate) fn ensure_local_bounds(&self, tier: Tier) -> Result<bool> {
        match tier {
            Tier::Box => {
                if !self.has_flags(DirtyFlags::LOCAL_BOX) {
                    return Ok(false);
                }
                let rect = if self.is_branch() {
                    // explicit size wins, otherwise grow from children;
                    // zero children resets to the empty rect at origin
                    let d = self.inner.borrow();
                    let (w, h) = (d.width, d.height);
                    drop(d);
                    match (w, h) {
                        (Some(w), Some(h)) => Rect::from_size(w, h),
                        _ => {
                            let auto = self.union_children(Tier::Box)?;
                            Rect::from_size(
                                w.unwrap_or(auto.right().max(0.0)),
                                h.unwrap_or(auto.bottom().max(0.0)),
                            )
                        }
                    }
                } else {
                    let mut d = self.inner.borrow_mut();
                    let (w, h) = (d.width, d.height);
                    match (w, h) {
                        (Some(w), Some(h)) => Rect::from_size(w, h),
                        _ => {
                            let own = d.content.compute_own_box()?;
                            Rect::from_size(w.unwrap_or(own.width), h.unwrap_or(own.height))
                        }
                    }
                };
                Ok(self.commit_tier(Tier::Box, rect))
            }
            Tier::Content => {
                if !self.has_flags(DirtyFlags::CONTENT) {
                    return Ok(false);
                }
                self.ensure_local_bounds(Tier::Box)?;
                let own_box = self.inner.borrow().tiers[Tier::Box.index()].local;
                let rect = if self.is_branch() {
                    if self.clips_children() {
                        own_box
                    } else {
                        own_box.union(&self.union_children(Tier::Content)?)
                    }
                } else {
                    let mut d = self.inner.borrow_mut();
                    d.content.compute_own_content(&own_box)?
                };
                Ok(self.commit_tier(Tier::Content, rect))
            }
            Tier::Stroke => {
                if !self.has_flags(DirtyFlags::STROKE) {
                    return Ok(false);
                }
                self.ensure_local_bounds(Tier::Box)?;
                let (own_box, spread) = {
                    let d = self.inner.borrow();
                    let spread = d
                        .paint
                        .stroke_spread()
                        .max(d.content.declared_stroke_spread());
                    (d.tiers[Tier::Box.index()].local, spread)
                };
                let own = own_box.expand(spread);
                let rect = if self.is_branch() {
                    own.union(&self.union_children(Tier::Stroke)?)
                } else {
                    own
                };
                Ok(self.commit_tier(Tier::Stroke, rect))
            }
            Tier::Render => {
                if !self.has_flags(DirtyFlags::RENDER) {
                    return Ok(false);
                }
                self.ensure_local_bounds(Tier::Stroke)?;
                let (stroke, spread) = {
                    let d = self.inner.borrow();
                    let spread = d.effect_spread.max(d.content.declared_render_spread());
                    (d.tiers[Tier::Stroke.index()].local, spread)
                };
                let own = stroke.expand(spread);
                let rect = if self.is_branch() {
                    own.union(&self.union_children(Tier::Render)?)
                } else {
                    own
                };
                Ok(self.commit_tier(Tier::Render, rect))
            }
        }
    }

    fn commit_tier(&self, tier: Tier, rect: Rect) -> bool {
        let mut d = self.inner.borrow_mut();
        let d = &mut *d;
        let tc = &mut d.tiers[tier.index()];
        let changed = tc.local != rect;
        tc.local = rect;
        if changed {
            tc.world_valid = false;
        }
        d.dirty -= tier.flag();
        d.bounds_updates += 1;
        changed
    }

    /// Local-space bounds for a tier, self-healing on access.
    pub fn local_bounds(&self, tier: Tier) -> Rect {
        if let Err(e) = self.ensure_local_bounds(tier) {
            error!("bounds recompute failed for {:?}: {}", self, e);
        }
        self.inner.borrow().tiers[tier.index()].local
    }

    /// World-space bounds for a tier, self-healing on access.
    pub fn world_bounds(&self, tier: Tier) -> Rect {
        if let Err(e) = self.ensure_local_bounds(tier) {
            error!("bounds recompute failed for {:?}: {}", self, e);
        }
        self.ensure_world_matrix();
        let mut d = self.inner.borrow_mut();
        let version = d.world_version;
        let world_matrix = d.world_matrix;
        let tc = &mut d.tiers[tier.index()];
        if !tc.world_valid || tc.world_seen != version {
            tc.world = world_matrix.map_rect(&tc.local);
            tc.world_seen = version;
            tc.world_valid = true;
        }
        tc.world
    }

    /// Last computed world bounds without any recompute; may be stale. Used
    /// for before-snapshots so damage covers the previous footprint.
    pub(crate) fn cached_world_bounds(&self, tier: Tier) -> Rect {
        let d = self.inner.borrow();
        let tc = &d.tiers[tier.index()];
        if tc.world_valid || tc.world_seen > 0 {
            tc.world
        } else {
            Rect::empty()
        }
    }

    // ---- engine entry points ----

    pub(crate) fn update_bounds(&self) -> Result<()> {
        for tier in Tier::ALL {
            self.ensure_local_bounds(tier)?;
        }
        Ok(())
    }

    pub(crate) fn clear_pass_flags(&self) {
        self.clear_flags(
            DirtyFlags::BOUNDS_CHANGED | DirtyFlags::CHILD_STRUCTURE | DirtyFlags::HIT_CACHE,
        );
    }

    pub fn matrix_update_count(&self) -> u32 {
        self.inner.borrow().matrix_updates
    }

    pub fn bounds_update_count(&self) -> u32 {
        self.inner.borrow().bounds_updates
    }

    pub fn reset_update_counts(&self) {
        let mut d = self.inner.borrow_mut();
        d.matrix_updates = 0;
        d.bounds_updates = 0;
        drop(d);
        for c in self.children() {
            c.reset_update_counts();
        }
    }

    // ---- hit testing and drawing hooks ----

    /// Deepest visible node whose world bounds contain the point, children
    /// top-most first.
    pub fn hit_test(&self, x: f32, y: f32, radius: f32) -> Option<Node> {
        if !self.is_visible() {
            return None;
        }
        if !self
            .world_bounds(Tier::Render)
            .contains_point_with_radius(x, y, radius)
        {
            return None;
        }
        let mut children = self.children_in_paint_order();
        children.reverse();
        for c in children {
            if let Some(hit) = c.hit_test(x, y, radius) {
                return Some(hit);
            }
        }
        if self
            .world_bounds(Tier::Box)
            .contains_point_with_radius(x, y, radius)
        {
            Some(self.clone())
        } else {
            None
        }
    }

    pub(crate) fn render_content(&self) -> RenderFn {
        let ctx = ShapeContext {
            box_bounds: self.local_bounds(Tier::Box),
            paint: self.paint(),
        };
        self.inner.borrow_mut().content.render(ctx)
    }
}
