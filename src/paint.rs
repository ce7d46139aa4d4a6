//! Damage accumulation between layout and rendering.

use crate::base::Rect;

/// Region of the target surface that must be redrawn.
#[derive(PartialEq, Debug, Clone)]
pub enum InvalidArea {
    Full,
    Partial(DamageRects),
    None,
}

impl InvalidArea {
    /// Add a damage rect, upgrading `None` to `Partial`. `Full` absorbs
    /// everything.
    pub fn add_rect(&mut self, rect: &Rect) {
        if rect.is_empty() {
            return;
        }
        match self {
            InvalidArea::Full => {}
            InvalidArea::Partial(rects) => rects.add_rect(rect),
            InvalidArea::None => {
                let mut rects = DamageRects::new();
                rects.add_rect(rect);
                *self = InvalidArea::Partial(rects);
            }
        }
    }

    pub fn set_full(&mut self) {
        *self = InvalidArea::Full;
    }

    pub fn is_none(&self) -> bool {
        matches!(self, InvalidArea::None)
    }
}

/// Pending damage rects. Rects may overlap; only the union is required to
/// cover all damage, so consumers are free to merge them.
#[derive(PartialEq, Debug, Clone, Default)]
pub struct DamageRects {
    rects: Vec<Rect>,
}

impl DamageRects {
    pub fn new() -> DamageRects {
        Self { rects: Vec::new() }
    }

    pub fn add_rect(&mut self, rect: &Rect) {
        if !rect.is_empty() {
            self.rects.push(*rect);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn has_intersects(&self, rect: &Rect) -> bool {
        self.rects.iter().any(|r| r.intersects(rect))
    }

    /// Single bounding rect covering every pending rect.
    pub fn union_rect(&self) -> Option<Rect> {
        let mut it = self.rects.iter();
        let first = *it.next()?;
        Some(it.fold(first, |acc, r| acc.union(r)))
    }

    pub fn offset(&mut self, x: f32, y: f32) {
        for r in &mut self.rects {
            *r = r.translate(x, y);
        }
    }
}
