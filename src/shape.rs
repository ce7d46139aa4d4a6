//! Minimal in-tree content kinds. Real shape catalogs (ellipse, polygon,
//! text) plug in through the same `NodeContent` trait from outside.

use crate::base::Rect;
use crate::node::{NodeContent, ShapeContext};
use crate::render::{PathCommand, RenderFn};
use anyhow::Result;

/// Branch content: no geometry of its own, children provide everything.
pub struct Group;

impl NodeContent for Group {
    fn name(&self) -> &str {
        "group"
    }
}

/// A solid rectangle with a natural size.
pub struct RectShape {
    pub width: f32,
    pub height: f32,
}

impl RectShape {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }
}

impl NodeContent for RectShape {
    fn name(&self) -> &str {
        "rect"
    }

    fn compute_own_box(&mut self) -> Result<Rect> {
        Ok(Rect::from_size(self.width, self.height))
    }

    fn render(&mut self, ctx: ShapeContext) -> RenderFn {
        let path = vec![PathCommand::Rect(ctx.box_bounds)];
        let paint = ctx.paint;
        RenderFn::new(move |surface| {
            surface.draw_path(&path, &paint);
        })
    }
}
