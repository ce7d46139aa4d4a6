//! The stage ties the pipeline together: root branch, change tracker,
//! layout engine, renderer and target surface, driven synchronously from an
//! external frame callback.

use crate::base::{EventContext, EventListener, EventRegistration, Rect};
use crate::layout::{
    warn_retry_ceiling, LayoutBlockInfo, LayoutEngine, LayoutMode, LayoutStats, MAX_RERUNS,
};
use crate::node::{Node, TrackerHandle};
use crate::render::renderer::{RenderOutcome, RenderStats, Renderer};
use crate::render::surface::{DrawSurface, RenderBackend};
use crate::tracker::ChangeTracker;
use anyhow::Result;
use serde::Serialize;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

#[derive(Debug, Clone, Serialize)]
pub struct LayoutStartedEvent {
    pub cycle: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LayoutBlocksEvent {
    pub blocks: Vec<LayoutBlockInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RenderStartedEvent;

#[derive(Debug, Clone, Serialize)]
pub struct RenderBlockEvent {
    pub rect: Rect,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResizeAppliedEvent {
    pub width: f32,
    pub height: f32,
}

struct StageData {
    root: Node,
    tracker: TrackerHandle,
    layout: LayoutEngine,
    renderer: Renderer,
    backend: Box<dyn RenderBackend>,
    target: Box<dyn DrawSurface>,
    width: f32,
    height: f32,
    pixel_ratio: f32,
    events: EventRegistration<StageWeak>,
}

#[derive(Clone)]
pub struct Stage {
    inner: Rc<RefCell<StageData>>,
}

#[derive(Clone)]
pub struct StageWeak {
    inner: Weak<RefCell<StageData>>,
}

impl StageWeak {
    pub fn upgrade(&self) -> Option<Stage> {
        self.inner.upgrade().map(|inner| Stage { inner })
    }
}

impl Stage {
    pub fn new(
        mut backend: Box<dyn RenderBackend>,
        width: f32,
        height: f32,
        pixel_ratio: f32,
    ) -> Result<Self> {
        let target = backend.create_surface(
            (width * pixel_ratio).ceil() as u32,
            (height * pixel_ratio).ceil() as u32,
            pixel_ratio,
        )?;
        let tracker: TrackerHandle = Rc::new(RefCell::new(ChangeTracker::new()));
        let root = Node::branch();
        root.set_tracker_recursive(Some(tracker.clone()));
        tracker.borrow_mut().set_root(&root);
        Ok(Self {
            inner: Rc::new(RefCell::new(StageData {
                root,
                tracker,
                layout: LayoutEngine::new(),
                renderer: Renderer::new(),
                backend,
                target,
                width,
                height,
                pixel_ratio,
                events: EventRegistration::new(),
            })),
        })
    }

    pub fn as_weak(&self) -> StageWeak {
        StageWeak {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn root(&self) -> Node {
        self.inner.borrow().root.clone()
    }

    pub fn width(&self) -> f32 {
        self.inner.borrow().width
    }

    pub fn height(&self) -> f32 {
        self.inner.borrow().height
    }

    pub fn pixel_ratio(&self) -> f32 {
        self.inner.borrow().pixel_ratio
    }

    /// Whether the next frame callback has work to do.
    pub fn needs_update(&self) -> bool {
        let d = self.inner.borrow();
        !d.layout.performed_first()
            || d.tracker.borrow().has_pending()
            || d.renderer.has_pending()
    }

    pub fn set_change_tracking_enabled(&self, enabled: bool) {
        self.inner.borrow().tracker.borrow_mut().set_enabled(enabled);
    }

    pub fn set_tracker_cap(&self, cap: Option<usize>) {
        self.inner.borrow().tracker.borrow_mut().set_cap(cap);
    }

    pub fn set_partial_layout_enabled(&self, enabled: bool) {
        self.inner.borrow_mut().layout.set_partial_enabled(enabled);
    }

    pub fn layout_stats(&self) -> LayoutStats {
        self.inner.borrow().layout.stats().clone()
    }

    pub fn render_stats(&self) -> RenderStats {
        self.inner.borrow().renderer.stats().clone()
    }

    /// One frame: drain layout to completion, then render. Re-runs queued
    /// from listeners are coalesced and bounded by the retry ceiling; this
    /// never panics or returns an error.
    pub fn update(&self) {
        let root = self.root();
        self.run_layout_passes(&root);
        self.run_render_passes(&root);
    }

    fn run_layout_passes(&self, root: &Node) {
        let mut attempts = 0u32;
        loop {
            let (set, first_done) = {
                let d = self.inner.borrow();
                let set = d.tracker.borrow_mut().flush();
                (set, d.layout.performed_first())
            };
            if set.is_empty() && first_done {
                break;
            }
            self.emit(&mut LayoutStartedEvent { cycle: set.cycle });
            let result = {
                let mut d = self.inner.borrow_mut();
                d.layout.layout(root, set)
            };
            let infos: Vec<LayoutBlockInfo> =
                result.blocks.iter().map(LayoutBlockInfo::of).collect();
            {
                let mut d = self.inner.borrow_mut();
                match result.mode {
                    LayoutMode::Full => d.renderer.invalidate_all(),
                    LayoutMode::Partial => {
                        for block in &result.blocks {
                            d.renderer.invalidate_rect(&block.damage());
                        }
                    }
                    LayoutMode::Skipped => {}
                }
            }
            if !infos.is_empty() {
                self.emit(&mut LayoutBlocksEvent { blocks: infos });
            }
            let again = {
                let mut d = self.inner.borrow_mut();
                let queued = d.layout.take_run_again();
                queued || d.tracker.borrow().has_pending()
            };
            if !again {
                break;
            }
            attempts += 1;
            if attempts >= MAX_RERUNS {
                warn_retry_ceiling("layout");
                break;
            }
        }
    }

    fn run_render_passes(&self, root: &Node) {
        let mut attempts = 0u32;
        loop {
            if !self.inner.borrow().renderer.has_pending() {
                break;
            }
            self.emit(&mut RenderStartedEvent);
            let outcome = {
                let mut guard = self.inner.borrow_mut();
                let d = &mut *guard;
                d.renderer
                    .render(root, d.target.as_mut(), d.backend.as_mut())
            };
            match outcome {
                RenderOutcome::Full(rect) | RenderOutcome::Partial(rect) => {
                    self.emit(&mut RenderBlockEvent { rect });
                }
                RenderOutcome::Skipped => {}
            }
            let again = self.inner.borrow_mut().renderer.take_run_again();
            if !again {
                break;
            }
            attempts += 1;
            if attempts >= MAX_RERUNS {
                warn_retry_ceiling("render");
                break;
            }
        }
    }

    /// Replace the target surface and repaint everything.
    pub fn resize(&self, width: f32, height: f32) -> Result<()> {
        {
            let mut d = self.inner.borrow_mut();
            if d.width == width && d.height == height {
                return Ok(());
            }
            let ratio = d.pixel_ratio;
            let target = d.backend.create_surface(
                (width * ratio).ceil() as u32,
                (height * ratio).ceil() as u32,
                ratio,
            )?;
            d.target = target;
            d.width = width;
            d.height = height;
            d.renderer.invalidate_all();
        }
        self.emit(&mut ResizeAppliedEvent { width, height });
        Ok(())
    }

    pub fn set_pixel_ratio(&self, pixel_ratio: f32) -> Result<()> {
        let (width, height) = {
            let mut d = self.inner.borrow_mut();
            if d.pixel_ratio == pixel_ratio {
                return Ok(());
            }
            let (w, h) = (d.width, d.height);
            let target = d.backend.create_surface(
                (w * pixel_ratio).ceil() as u32,
                (h * pixel_ratio).ceil() as u32,
                pixel_ratio,
            )?;
            d.target = target;
            d.pixel_ratio = pixel_ratio;
            d.renderer.invalidate_all();
            (d.width, d.height)
        };
        self.emit(&mut ResizeAppliedEvent { width, height });
        Ok(())
    }

    /// Force a full-surface repaint on the next update.
    pub fn invalidate(&self) {
        self.inner.borrow_mut().renderer.invalidate_all();
    }

    /// Queue an extra damage rect outside the layout path.
    pub fn invalidate_rect(&self, rect: &Rect) {
        self.inner.borrow_mut().renderer.invalidate_rect(rect);
    }

    pub fn hit_test(&self, x: f32, y: f32, radius: f32) -> Option<Node> {
        self.root().hit_test(x, y, radius)
    }

    /// Premultiplied RGBA8 rows from the target surface, device-space rect.
    pub fn read_pixels(&self, rect: &Rect) -> Vec<u8> {
        self.inner.borrow().target.read_pixels(rect)
    }

    pub fn register_event_listener<T: 'static, H: EventListener<T, StageWeak> + 'static>(
        &self,
        listener: H,
    ) -> u32 {
        self.inner
            .borrow_mut()
            .events
            .register_event_listener(listener)
    }

    pub fn bind_event_listener<
        T: 'static,
        F: FnMut(&mut T, &mut EventContext<StageWeak>) + 'static,
    >(
        &self,
        handler: F,
    ) -> u32 {
        self.inner.borrow_mut().events.bind_event_listener(handler)
    }

    pub fn unregister_event_listener(&self, id: u32) {
        self.inner
            .borrow_mut()
            .events
            .unregister_event_listener(id);
    }

    /// Dispatch with the registration moved out, so listeners can call back
    /// into the stage without re-entrant borrows.
    fn emit<T: 'static>(&self, event: &mut T) {
        let mut events = self.inner.borrow_mut().events.take_preserving_counter();
        let mut ctx = EventContext::new(self.as_weak());
        events.emit(event, &mut ctx);
        let mut d = self.inner.borrow_mut();
        let added = std::mem::replace(&mut d.events, events);
        d.events.merge(added);
    }
}
