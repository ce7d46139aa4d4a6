pub mod raster;
pub mod renderer;
pub mod surface;

pub use surface::{DrawSurface, PathCommand, RenderBackend, SurfacePool};

/// Deferred draw closure produced by a node's content hook and executed
/// against whichever surface the renderer picked (target or scratch).
pub struct RenderFn {
    render: Box<dyn FnOnce(&mut dyn DrawSurface)>,
}

impl RenderFn {
    pub fn empty() -> RenderFn {
        RenderFn::new(|_surface| {})
    }

    pub fn new<F: FnOnce(&mut dyn DrawSurface) + 'static>(render: F) -> RenderFn {
        Self {
            render: Box::new(render),
        }
    }

    pub fn merge(renders: Vec<RenderFn>) -> RenderFn {
        RenderFn::new(move |surface| {
            for render in renders {
                render.run(surface);
            }
        })
    }

    pub fn run(self, surface: &mut dyn DrawSurface) {
        (self.render)(surface);
    }
}
