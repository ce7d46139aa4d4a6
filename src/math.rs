use crate::base::{Point, Rect, TwoPointBounds};
use crate::number::{normalize_rotation, snap_zero};
use serde::{Deserialize, Serialize};

/// Affine 2d transform:
///
/// ```text
/// | a c e |
/// | b d f |
/// ```
///
/// maps `(x, y)` to `(a*x + c*y + e, b*x + d*y + f)`.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    pub a: f32,
    pub b: f32,
    pub c: f32,
    pub d: f32,
    pub e: f32,
    pub f: f32,
}

/// Decomposed transform inputs. Rotation and skew are in degrees.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decomposed {
    pub x: f32,
    pub y: f32,
    pub scale_x: f32,
    pub scale_y: f32,
    pub rotation: f32,
    pub skew_x: f32,
    pub skew_y: f32,
}

impl Default for Decomposed {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            scale_x: 1.0,
            scale_y: 1.0,
            rotation: 0.0,
            skew_x: 0.0,
            skew_y: 0.0,
        }
    }
}

impl Decomposed {
    /// True when the linear part is the identity, so composing is a pure translate.
    pub fn is_translation(&self) -> bool {
        self.scale_x == 1.0
            && self.scale_y == 1.0
            && self.rotation == 0.0
            && self.skew_x == 0.0
            && self.skew_y == 0.0
    }
}

impl Matrix {
    pub fn identity() -> Self {
        Self {
            a: 1.0,
            b: 0.0,
            c: 0.0,
            d: 1.0,
            e: 0.0,
            f: 0.0,
        }
    }

    pub fn translation(x: f32, y: f32) -> Self {
        Self {
            e: x,
            f: y,
            ..Self::identity()
        }
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::identity()
    }

    /// No rotation or skew: rects map to rects.
    #[inline]
    pub fn is_axis_aligned(&self) -> bool {
        self.b == 0.0 && self.c == 0.0
    }

    /// Compose from decomposed inputs. Scale, skew and rotation are applied
    /// about `around` (a point in the node's own coordinates), then the
    /// result is translated by `(x, y)`.
    pub fn compose(t: &Decomposed, around: Option<Point>) -> Self {
        let mut m = if t.is_translation() {
            Self::translation(t.x, t.y)
        } else {
            let r = t.rotation.to_radians();
            let (sin, cos) = (snap_zero(r.sin()), snap_zero(r.cos()));
            let tan_kx = snap_zero(t.skew_x.to_radians().tan());
            let tan_ky = snap_zero(t.skew_y.to_radians().tan());
            Self {
                a: t.scale_x * (cos - sin * tan_ky),
                b: t.scale_x * (sin + cos * tan_ky),
                c: t.scale_y * (cos * tan_kx - sin),
                d: t.scale_y * (sin * tan_kx + cos),
                e: t.x,
                f: t.y,
            }
        };
        if let Some(p) = around {
            // keep the around point fixed under the linear part
            m.e += p.x - (m.a * p.x + m.c * p.y);
            m.f += p.y - (m.b * p.x + m.d * p.y);
        }
        m
    }

    /// Recover decomposed inputs. Shear is attributed entirely to `skew_x`;
    /// a matrix composed with nonzero `skew_y` decomposes to an equivalent
    /// transform, not the original inputs. Must not be used with `around`
    /// composition (the around offset folds into `x`/`y`).
    pub fn decompose(&self) -> Decomposed {
        let det = self.a * self.d - self.b * self.c;
        let scale_x = (self.a * self.a + self.b * self.b).sqrt();
        let rotation = if scale_x == 0.0 {
            0.0
        } else {
            normalize_rotation(self.b.atan2(self.a).to_degrees())
        };
        let (scale_y, skew_x) = if det == 0.0 || scale_x == 0.0 {
            ((self.c * self.c + self.d * self.d).sqrt(), 0.0)
        } else {
            (
                det / scale_x,
                ((self.a * self.c + self.b * self.d) / det)
                    .atan()
                    .to_degrees(),
            )
        };
        Decomposed {
            x: self.e,
            y: self.f,
            scale_x,
            scale_y,
            rotation: snap_zero(rotation),
            skew_x: snap_zero(skew_x),
            skew_y: 0.0,
        }
    }

    /// `self * other`: apply `other` first, then `self`.
    pub fn multiply(&self, other: &Matrix) -> Matrix {
        Matrix {
            a: self.a * other.a + self.c * other.b,
            b: self.b * other.a + self.d * other.b,
            c: self.a * other.c + self.c * other.d,
            d: self.b * other.c + self.d * other.d,
            e: self.a * other.e + self.c * other.f + self.e,
            f: self.b * other.e + self.d * other.f + self.f,
        }
    }

    pub fn invert(&self) -> Option<Matrix> {
        let det = self.a * self.d - self.b * self.c;
        if det == 0.0 || !det.is_finite() {
            return None;
        }
        let inv = 1.0 / det;
        Some(Matrix {
            a: self.d * inv,
            b: -self.b * inv,
            c: -self.c * inv,
            d: self.a * inv,
            e: (self.c * self.f - self.d * self.e) * inv,
            f: (self.b * self.e - self.a * self.f) * inv,
        })
    }

    /// Map a point, translation included.
    #[inline]
    pub fn transform_point(&self, p: Point) -> Point {
        Point {
            x: self.a * p.x + self.c * p.y + self.e,
            y: self.b * p.x + self.d * p.y + self.f,
        }
    }

    /// Map a vector, translation excluded.
    #[inline]
    pub fn transform_vector(&self, v: Point) -> Point {
        Point {
            x: self.a * v.x + self.c * v.y,
            y: self.b * v.x + self.d * v.y,
        }
    }

    /// Axis-aligned bounds of `rect` mapped through this matrix. Axis-aligned
    /// transforms take the cheap two-corner path; anything else projects all
    /// four corners.
    pub fn map_rect(&self, rect: &Rect) -> Rect {
        if self.is_axis_aligned() {
            let p1 = self.transform_point(Point::new(rect.x, rect.y));
            let p2 = self.transform_point(Point::new(rect.right(), rect.bottom()));
            let x = f32::min(p1.x, p2.x);
            let y = f32::min(p1.y, p2.y);
            Rect::new(x, y, (p2.x - p1.x).abs(), (p2.y - p1.y).abs())
        } else {
            let mut acc = TwoPointBounds::new();
            for (cx, cy) in [
                (rect.x, rect.y),
                (rect.right(), rect.y),
                (rect.right(), rect.bottom()),
                (rect.x, rect.bottom()),
            ] {
                let p = self.transform_point(Point::new(cx, cy));
                acc.add_point(p.x, p.y);
            }
            acc.to_rect()
        }
    }
}

impl Default for Matrix {
    fn default() -> Self {
        Self::identity()
    }
}
