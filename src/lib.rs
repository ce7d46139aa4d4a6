//! Retained-mode 2d scene graph with incremental layout and dirty-region
//! rendering. Build a tree of nodes, mutate properties, and call
//! [`Stage::update`] from a frame callback; only the touched matrices,
//! bounds and canvas regions are recomputed and redrawn.

pub mod base;
pub mod dirty;
pub mod layout;
pub mod macro_mod;
pub mod math;
pub mod node;
pub mod number;
pub mod paint;
pub mod render;
pub mod shape;
pub mod stage;
pub mod style;
pub mod tracker;

pub use base::{Point, Rect, Size};
pub use dirty::Tier;
pub use layout::{LayoutBlock, LayoutBlockInfo, LayoutMode};
pub use math::{Decomposed, Matrix};
pub use node::{Around, Node, NodeContent, NodeWeak, ShapeContext};
pub use render::raster::{RasterBackend, RasterSurface};
pub use render::{DrawSurface, PathCommand, RenderBackend, RenderFn, SurfacePool};
pub use shape::{Group, RectShape};
pub use stage::{Stage, StageWeak};
pub use style::{Color, Paint, Stroke, StrokeAlign};
pub use tracker::{ChangeSet, ChangeTracker};
