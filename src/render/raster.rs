//! CPU raster implementation of the drawing backend, on tiny-skia.

use crate::base::Rect;
use crate::math::Matrix;
use crate::render::surface::{DrawSurface, PathCommand, RenderBackend};
use crate::style::Paint;
use anyhow::{anyhow, Result};
use log::warn;
use std::any::Any;
use tiny_skia::{
    BlendMode, Color as SkColor, FillRule, FilterQuality, Mask, PathBuilder, Pixmap, PixmapPaint,
    Transform,
};

pub struct RasterBackend;

impl RenderBackend for RasterBackend {
    fn create_surface(
        &mut self,
        width: u32,
        height: u32,
        pixel_ratio: f32,
    ) -> Result<Box<dyn DrawSurface>> {
        Ok(Box::new(RasterSurface::new(width, height, pixel_ratio)?))
    }
}

/// Surface dimensions are device pixels; `pixel_ratio` maps the logical
/// coordinates all draw calls use onto them.
pub struct RasterSurface {
    pixmap: Pixmap,
    pixel_ratio: f32,
    transform: Matrix,
    /// Device-space clip rect. Rect-only clipping is all the pipeline needs.
    clip: Option<Rect>,
    stack: Vec<(Matrix, Option<Rect>)>,
    mask_cache: Option<(Rect, Mask)>,
}

impl RasterSurface {
    pub fn new(width: u32, height: u32, pixel_ratio: f32) -> Result<Self> {
        let pixmap = Pixmap::new(width.max(1), height.max(1))
            .ok_or_else(|| anyhow!("cannot allocate {}x{} surface", width, height))?;
        Ok(Self {
            pixmap,
            pixel_ratio,
            transform: Matrix::identity(),
            clip: None,
            stack: Vec::new(),
            mask_cache: None,
        })
    }

    pub fn pixmap(&self) -> &Pixmap {
        &self.pixmap
    }

    fn device_transform(&self) -> Matrix {
        let pr = self.pixel_ratio;
        let m = &self.transform;
        Matrix {
            a: m.a * pr,
            b: m.b * pr,
            c: m.c * pr,
            d: m.d * pr,
            e: m.e * pr,
            f: m.f * pr,
        }
    }

    fn ts_transform(&self) -> Transform {
        let m = self.device_transform();
        Transform::from_row(m.a, m.b, m.c, m.d, m.e, m.f)
    }

    fn ensure_mask(&mut self) {
        let clip = match self.clip {
            Some(c) => c,
            None => {
                self.mask_cache = None;
                return;
            }
        };
        if let Some((cached, _)) = &self.mask_cache {
            if *cached == clip {
                return;
            }
        }
        let mut mask = match Mask::new(self.pixmap.width(), self.pixmap.height()) {
            Some(m) => m,
            None => return,
        };
        if let Some(r) = tiny_skia::Rect::from_xywh(clip.x, clip.y, clip.width, clip.height) {
            let path = PathBuilder::from_rect(r);
            mask.fill_path(&path, FillRule::Winding, false, Transform::identity());
        }
        self.mask_cache = Some((clip, mask));
    }

    fn build_path(commands: &[PathCommand]) -> Option<tiny_skia::Path> {
        let mut pb = PathBuilder::new();
        for cmd in commands {
            match cmd {
                PathCommand::MoveTo(p) => pb.move_to(p.x, p.y),
                PathCommand::LineTo(p) => pb.line_to(p.x, p.y),
                PathCommand::QuadTo(c, p) => pb.quad_to(c.x, c.y, p.x, p.y),
                PathCommand::CubicTo(c1, c2, p) => {
                    pb.cubic_to(c1.x, c1.y, c2.x, c2.y, p.x, p.y)
                }
                PathCommand::Close => pb.close(),
                PathCommand::Rect(r) => {
                    if let Some(sr) = tiny_skia::Rect::from_xywh(r.x, r.y, r.width, r.height) {
                        pb.push_rect(sr);
                    }
                }
            }
        }
        pb.finish()
    }

    fn to_sk_color(color: crate::style::Color) -> SkColor {
        SkColor::from_rgba8(color.r, color.g, color.b, color.a)
    }
}

impl DrawSurface for RasterSurface {
    fn width(&self) -> u32 {
        self.pixmap.width()
    }

    fn height(&self) -> u32 {
        self.pixmap.height()
    }

    fn pixel_ratio(&self) -> f32 {
        self.pixel_ratio
    }

    fn save(&mut self) {
        self.stack.push((self.transform, self.clip));
    }

    fn restore(&mut self) {
        if let Some((transform, clip)) = self.stack.pop() {
            self.transform = transform;
            self.clip = clip;
        }
    }

    fn set_transform(&mut self, matrix: &Matrix) {
        self.transform = *matrix;
    }

    fn clip(&mut self, rect: &Rect) {
        let device = self.device_transform().map_rect(rect);
        self.clip = Some(match self.clip {
            Some(existing) => existing.intersect(&device),
            None => device,
        });
    }

    fn clear(&mut self, rect: Option<&Rect>) {
        let rect = match rect {
            None => {
                self.pixmap.fill(SkColor::TRANSPARENT);
                return;
            }
            Some(r) => r,
        };
        let mut device = self.device_transform().map_rect(rect);
        if let Some(clip) = self.clip {
            device = device.intersect(&clip);
        }
        if device.is_empty() {
            return;
        }
        if let Some(r) = tiny_skia::Rect::from_xywh(device.x, device.y, device.width, device.height)
        {
            let mut paint = tiny_skia::Paint::default();
            paint.blend_mode = BlendMode::Clear;
            self.pixmap
                .fill_rect(r, &paint, Transform::identity(), None);
        }
    }

    fn draw_path(&mut self, path: &[PathCommand], paint: &Paint) {
        let sk_path = match Self::build_path(path) {
            Some(p) => p,
            None => return,
        };
        self.ensure_mask();
        let transform = self.ts_transform();
        if let Some(fill) = paint.fill {
            if !fill.is_transparent() {
                let mut sk_paint = tiny_skia::Paint::default();
                sk_paint.set_color(Self::to_sk_color(fill));
                sk_paint.anti_alias = true;
                self.pixmap.fill_path(
                    &sk_path,
                    &sk_paint,
                    FillRule::Winding,
                    transform,
                    self.mask_cache.as_ref().map(|(_, m)| m),
                );
            }
        }
        if let Some(stroke) = paint.stroke {
            if stroke.width > 0.0 && !stroke.color.is_transparent() {
                let mut sk_paint = tiny_skia::Paint::default();
                sk_paint.set_color(Self::to_sk_color(stroke.color));
                sk_paint.anti_alias = true;
                let sk_stroke = tiny_skia::Stroke {
                    width: stroke.width,
                    ..tiny_skia::Stroke::default()
                };
                self.pixmap.stroke_path(
                    &sk_path,
                    &sk_paint,
                    &sk_stroke,
                    transform,
                    self.mask_cache.as_ref().map(|(_, m)| m),
                );
            }
        }
    }

    fn draw_surface(
        &mut self,
        src: &dyn DrawSurface,
        src_rect: &Rect,
        dst_rect: &Rect,
        opacity: f32,
    ) {
        let src = match src.as_any().downcast_ref::<RasterSurface>() {
            Some(s) => s,
            None => {
                warn!("draw_surface: source is not a raster surface");
                return;
            }
        };
        if src_rect.is_empty() || dst_rect.is_empty() {
            return;
        }
        let device_dst = self.device_transform().map_rect(dst_rect);
        let sx = device_dst.width / src_rect.width;
        let sy = device_dst.height / src_rect.height;
        let transform = Transform::from_row(
            sx,
            0.0,
            0.0,
            sy,
            device_dst.x - src_rect.x * sx,
            device_dst.y - src_rect.y * sy,
        );
        self.ensure_mask();
        let paint = PixmapPaint {
            opacity,
            blend_mode: BlendMode::SourceOver,
            quality: if sx == 1.0 && sy == 1.0 {
                FilterQuality::Nearest
            } else {
                FilterQuality::Bilinear
            },
        };
        self.pixmap.draw_pixmap(
            0,
            0,
            src.pixmap.as_ref(),
            &paint,
            transform,
            self.mask_cache.as_ref().map(|(_, m)| m),
        );
    }

    fn read_pixels(&self, rect: &Rect) -> Vec<u8> {
        let width = self.pixmap.width() as i64;
        let height = self.pixmap.height() as i64;
        let x0 = (rect.x.floor() as i64).clamp(0, width);
        let y0 = (rect.y.floor() as i64).clamp(0, height);
        let x1 = (rect.right().ceil() as i64).clamp(0, width);
        let y1 = (rect.bottom().ceil() as i64).clamp(0, height);
        let data = self.pixmap.data();
        let stride = width as usize * 4;
        let mut out = Vec::with_capacity(((x1 - x0).max(0) * (y1 - y0).max(0) * 4) as usize);
        for y in y0..y1 {
            let start = y as usize * stride + x0 as usize * 4;
            let end = y as usize * stride + x1 as usize * 4;
            out.extend_from_slice(&data[start..end]);
        }
        out
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::Point;
    use crate::style::Color;

    #[test]
    fn test_fill_rect_and_read_pixels() {
        let mut s = RasterSurface::new(10, 10, 1.0).unwrap();
        s.draw_path(
            &[PathCommand::Rect(Rect::from_size(10.0, 10.0))],
            &Paint::fill(Color::rgb(255, 0, 0)),
        );
        let px = s.read_pixels(&Rect::new(5.0, 5.0, 1.0, 1.0));
        assert_eq!(vec![255, 0, 0, 255], px);
    }

    #[test]
    fn test_clip_limits_drawing() {
        let mut s = RasterSurface::new(10, 10, 1.0).unwrap();
        s.save();
        s.clip(&Rect::new(0.0, 0.0, 5.0, 10.0));
        s.draw_path(
            &[PathCommand::Rect(Rect::from_size(10.0, 10.0))],
            &Paint::fill(Color::rgb(0, 255, 0)),
        );
        s.restore();
        let inside = s.read_pixels(&Rect::new(2.0, 2.0, 1.0, 1.0));
        let outside = s.read_pixels(&Rect::new(8.0, 2.0, 1.0, 1.0));
        assert_eq!(vec![0, 255, 0, 255], inside);
        assert_eq!(vec![0, 0, 0, 0], outside);
    }

    #[test]
    fn test_transform_applies_to_paths() {
        let mut s = RasterSurface::new(20, 20, 1.0).unwrap();
        s.set_transform(&Matrix::translation(10.0, 0.0));
        s.draw_path(
            &[PathCommand::Rect(Rect::from_size(5.0, 5.0))],
            &Paint::fill(Color::rgb(0, 0, 255)),
        );
        assert_eq!(
            vec![0, 0, 255, 255],
            s.read_pixels(&Rect::new(12.0, 2.0, 1.0, 1.0))
        );
        assert_eq!(
            vec![0, 0, 0, 0],
            s.read_pixels(&Rect::new(2.0, 2.0, 1.0, 1.0))
        );
    }

    #[test]
    fn test_pixel_ratio_scales_device_output() {
        let mut s = RasterSurface::new(20, 20, 2.0).unwrap();
        s.draw_path(
            &[PathCommand::Rect(Rect::from_size(5.0, 5.0))],
            &Paint::fill(Color::rgb(9, 9, 9)),
        );
        // logical (5,5) box covers device pixels up to (10,10)
        assert_eq!(
            vec![9, 9, 9, 255],
            s.read_pixels(&Rect::new(9.0, 9.0, 1.0, 1.0))
        );
    }

    #[test]
    fn test_draw_surface_blits() {
        let mut src = RasterSurface::new(4, 4, 1.0).unwrap();
        src.draw_path(
            &[PathCommand::Rect(Rect::from_size(4.0, 4.0))],
            &Paint::fill(Color::rgb(7, 7, 7)),
        );
        let mut dst = RasterSurface::new(10, 10, 1.0).unwrap();
        dst.draw_surface(
            &src,
            &Rect::from_size(4.0, 4.0),
            &Rect::new(3.0, 3.0, 4.0, 4.0),
            1.0,
        );
        assert_eq!(
            vec![7, 7, 7, 255],
            dst.read_pixels(&Rect::new(4.0, 4.0, 1.0, 1.0))
        );
        assert_eq!(
            vec![0, 0, 0, 0],
            dst.read_pixels(&Rect::new(1.0, 1.0, 1.0, 1.0))
        );
    }

    #[test]
    fn test_path_commands_beyond_rect() {
        let mut s = RasterSurface::new(10, 10, 1.0).unwrap();
        s.draw_path(
            &[
                PathCommand::MoveTo(Point::new(0.0, 0.0)),
                PathCommand::LineTo(Point::new(10.0, 0.0)),
                PathCommand::LineTo(Point::new(10.0, 10.0)),
                PathCommand::LineTo(Point::new(0.0, 10.0)),
                PathCommand::Close,
            ],
            &Paint::fill(Color::rgb(1, 2, 3)),
        );
        assert_eq!(
            vec![1, 2, 3, 255],
            s.read_pixels(&Rect::new(5.0, 5.0, 1.0, 1.0))
        );
    }
}
