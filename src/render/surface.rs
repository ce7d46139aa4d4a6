//! Drawing backend seam and the scratch-surface pool.

use crate::base::{Point, Rect};
use crate::math::Matrix;
use crate::style::Paint;
use anyhow::Result;
use log::debug;
use ordered_float::OrderedFloat;
use std::any::Any;
use std::collections::HashMap;

/// Opaque path geometry handed through the pipeline. How commands are
/// produced (shape kinds, text, flattening) is not the pipeline's concern.
#[derive(Debug, Clone, PartialEq)]
pub enum PathCommand {
    MoveTo(Point),
    LineTo(Point),
    QuadTo(Point, Point),
    CubicTo(Point, Point, Point),
    Close,
    Rect(Rect),
}

/// An immediate-mode 2d surface. Transforms are absolute; `clip` and
/// `clear` rects are interpreted in the current transform's space, pixel
/// ratio applied by the implementation.
pub trait DrawSurface: Any {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn pixel_ratio(&self) -> f32;

    fn save(&mut self);
    fn restore(&mut self);
    fn set_transform(&mut self, matrix: &Matrix);
    /// Intersect the clip with `rect`.
    fn clip(&mut self, rect: &Rect);
    /// Clear a region, or the whole surface when `None`.
    fn clear(&mut self, rect: Option<&Rect>);
    fn draw_path(&mut self, path: &[PathCommand], paint: &Paint);
    /// Blit another surface of the same backend.
    fn draw_surface(&mut self, src: &dyn DrawSurface, src_rect: &Rect, dst_rect: &Rect, opacity: f32);
    /// Premultiplied RGBA8 rows for a device-space region.
    fn read_pixels(&self, rect: &Rect) -> Vec<u8>;

    fn as_any(&self) -> &dyn Any;
}

pub trait RenderBackend {
    fn create_surface(&mut self, width: u32, height: u32, pixel_ratio: f32) -> Result<Box<dyn DrawSurface>>;
}

type PoolKey = (u32, u32, OrderedFloat<f32>);

/// Free-list of reusable scratch surfaces keyed by size and pixel ratio.
/// Surfaces past `capacity` are dropped instead of pooled so memory stays
/// bounded under bursty compositing.
pub struct SurfacePool {
    free: HashMap<PoolKey, Vec<Box<dyn DrawSurface>>>,
    free_count: usize,
    capacity: usize,
}

pub const DEFAULT_POOL_CAPACITY: usize = 8;

impl SurfacePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: HashMap::new(),
            free_count: 0,
            capacity,
        }
    }

    pub fn free_count(&self) -> usize {
        self.free_count
    }

    /// Pop a pooled surface of the exact key or create a fresh one.
    pub fn get(
        &mut self,
        backend: &mut dyn RenderBackend,
        width: u32,
        height: u32,
        pixel_ratio: f32,
    ) -> Result<Box<dyn DrawSurface>> {
        let key = (width, height, OrderedFloat(pixel_ratio));
        if let Some(list) = self.free.get_mut(&key) {
            if let Some(surface) = list.pop() {
                self.free_count -= 1;
                return Ok(surface);
            }
        }
        debug!("allocating scratch surface {}x{}@{}", width, height, pixel_ratio);
        backend.create_surface(width, height, pixel_ratio)
    }

    /// Hand a surface back. Dropped once the pool is at capacity.
    pub fn recycle(&mut self, surface: Box<dyn DrawSurface>) {
        if self.free_count >= self.capacity {
            return;
        }
        let key = (
            surface.width(),
            surface.height(),
            OrderedFloat(surface.pixel_ratio()),
        );
        self.free.entry(key).or_insert_with(Vec::new).push(surface);
        self.free_count += 1;
    }

    pub fn clear(&mut self) {
        self.free.clear();
        self.free_count = 0;
    }
}

impl Default for SurfacePool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::raster::RasterBackend;

    #[test]
    fn test_pool_reuses_and_bounds_memory() {
        let mut backend = RasterBackend;
        let mut pool = SurfacePool::new(2);
        let a = pool.get(&mut backend, 16, 16, 1.0).unwrap();
        let b = pool.get(&mut backend, 16, 16, 1.0).unwrap();
        let c = pool.get(&mut backend, 16, 16, 1.0).unwrap();
        pool.recycle(a);
        pool.recycle(b);
        pool.recycle(c);
        // third recycle exceeds capacity and is dropped
        assert_eq!(2, pool.free_count());
        let _ = pool.get(&mut backend, 16, 16, 1.0).unwrap();
        assert_eq!(1, pool.free_count());
        // a different key never reuses pooled surfaces
        let other = pool.get(&mut backend, 8, 8, 1.0).unwrap();
        assert_eq!(8, other.width());
        assert_eq!(1, pool.free_count());
    }
}
