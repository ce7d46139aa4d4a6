use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::collections::HashMap;

#[derive(Debug, Copy, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn empty() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: 0.0,
            height: 0.0,
        }
    }

    pub fn from_size(width: f32, height: f32) -> Self {
        Self::new(0.0, 0.0, width, height)
    }

    #[inline]
    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    #[inline]
    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    #[inline]
    pub fn translate(&self, x: f32, y: f32) -> Self {
        Self {
            x: self.x + x,
            y: self.y + y,
            width: self.width,
            height: self.height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }

    /// Smallest rect covering both. An empty rect contributes nothing.
    pub fn union(&self, other: &Rect) -> Self {
        if other.is_empty() {
            return *self;
        }
        if self.is_empty() {
            return *other;
        }
        let x = f32::min(self.x, other.x);
        let y = f32::min(self.y, other.y);
        let r = f32::max(self.right(), other.right());
        let b = f32::max(self.bottom(), other.bottom());
        Self::new(x, y, r - x, b - y)
    }

    /// Grow by the same margin on every side.
    pub fn expand(&self, spread: f32) -> Self {
        self.expand_edges(spread, spread, spread, spread)
    }

    /// Grow by per-edge margins (top, right, bottom, left).
    pub fn expand_edges(&self, top: f32, right: f32, bottom: f32, left: f32) -> Self {
        Self {
            x: self.x - left,
            y: self.y - top,
            width: self.width + left + right,
            height: self.height + top + bottom,
        }
    }

    pub fn intersect(&self, other: &Rect) -> Self {
        let x = f32::max(self.x, other.x);
        let y = f32::max(self.y, other.y);
        let r = f32::min(self.right(), other.right());
        let b = f32::min(self.bottom(), other.bottom());
        Self {
            x,
            y,
            width: f32::max(0.0, r - x),
            height: f32::max(0.0, b - y),
        }
    }

    #[inline]
    pub fn intersects(&self, other: &Rect) -> bool {
        f32::min(self.right(), other.right()) > f32::max(self.x, other.x)
            && f32::min(self.bottom(), other.bottom()) > f32::max(self.y, other.y)
    }

    /// True when `other` lies entirely inside this rect.
    pub fn contains_rect(&self, other: &Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    #[inline]
    pub fn contains_point(&self, x: f32, y: f32) -> bool {
        x >= self.x && x <= self.right() && y >= self.y && y <= self.bottom()
    }

    /// Point test with a tolerance radius around the rect edges.
    pub fn contains_point_with_radius(&self, x: f32, y: f32, radius: f32) -> bool {
        self.expand(radius).contains_point(x, y)
    }
}

/// Accumulation box kept as two corner points, cheaper to grow than a `Rect`.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct TwoPointBounds {
    pub min_x: f32,
    pub min_y: f32,
    pub max_x: f32,
    pub max_y: f32,
}

impl TwoPointBounds {
    pub fn new() -> Self {
        Self {
            min_x: f32::INFINITY,
            min_y: f32::INFINITY,
            max_x: f32::NEG_INFINITY,
            max_y: f32::NEG_INFINITY,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min_x > self.max_x || self.min_y > self.max_y
    }

    pub fn add_point(&mut self, x: f32, y: f32) {
        self.min_x = f32::min(self.min_x, x);
        self.min_y = f32::min(self.min_y, y);
        self.max_x = f32::max(self.max_x, x);
        self.max_y = f32::max(self.max_y, y);
    }

    pub fn add_rect(&mut self, rect: &Rect) {
        if rect.is_empty() {
            return;
        }
        self.add_point(rect.x, rect.y);
        self.add_point(rect.right(), rect.bottom());
    }

    pub fn to_rect(&self) -> Rect {
        if self.is_empty() {
            Rect::empty()
        } else {
            Rect::new(
                self.min_x,
                self.min_y,
                self.max_x - self.min_x,
                self.max_y - self.min_y,
            )
        }
    }
}

impl Default for TwoPointBounds {
    fn default() -> Self {
        Self::new()
    }
}

pub struct StateMarker {
    state: bool,
}

impl StateMarker {
    pub fn new() -> Self {
        Self { state: false }
    }

    pub fn mark(&mut self) {
        self.state = true
    }

    pub fn is_marked(&self) -> bool {
        self.state
    }

    pub fn unmark(&mut self) -> bool {
        if self.state {
            self.state = false;
            true
        } else {
            false
        }
    }
}

pub struct EventContext<E> {
    pub target: E,
    pub propagation_cancelled: bool,
    pub prevent_default: bool,
}

impl<E> EventContext<E> {
    pub fn new(target: E) -> Self {
        Self {
            target,
            propagation_cancelled: false,
            prevent_default: false,
        }
    }
}

pub trait EventListener<T, E> {
    fn handle_event(&mut self, event: &mut T, ctx: &mut EventContext<E>);
}

type DynListener<E> = Box<dyn FnMut(&mut dyn Any, &mut EventContext<E>)>;

/// Listener table dispatched by event `TypeId`.
pub struct EventRegistration<E> {
    next_listener_id: u32,
    typed_listeners: HashMap<TypeId, Vec<(u32, DynListener<E>)>>,
    listener_types: HashMap<u32, TypeId>,
}

impl<E> EventRegistration<E> {
    pub fn new() -> Self {
        Self {
            next_listener_id: 1,
            typed_listeners: HashMap::new(),
            listener_types: HashMap::new(),
        }
    }

    pub fn register_event_listener<T: 'static, H: EventListener<T, E> + 'static>(
        &mut self,
        mut listener: H,
    ) -> u32 {
        self.register(
            Box::new(move |any, ctx| {
                if let Some(e) = any.downcast_mut::<T>() {
                    listener.handle_event(e, ctx);
                }
            }),
            TypeId::of::<T>(),
        )
    }

    pub fn bind_event_listener<T: 'static, F: FnMut(&mut T, &mut EventContext<E>) + 'static>(
        &mut self,
        mut handler: F,
    ) -> u32 {
        self.register(
            Box::new(move |any, ctx| {
                if let Some(e) = any.downcast_mut::<T>() {
                    handler(e, ctx);
                }
            }),
            TypeId::of::<T>(),
        )
    }

    fn register(&mut self, listener: DynListener<E>, type_id: TypeId) -> u32 {
        let id = self.next_listener_id;
        self.next_listener_id += 1;
        self.typed_listeners
            .entry(type_id)
            .or_insert_with(Vec::new)
            .push((id, listener));
        self.listener_types.insert(id, type_id);
        id
    }

    pub fn unregister_event_listener(&mut self, id: u32) {
        let type_id = crate::some_or_return!(self.listener_types.remove(&id));
        if let Some(listeners) = self.typed_listeners.get_mut(&type_id) {
            listeners.retain(|(i, _)| *i != id);
        }
    }

    pub fn emit<T: 'static>(&mut self, event: &mut T, ctx: &mut EventContext<E>) {
        if let Some(listeners) = self.typed_listeners.get_mut(&TypeId::of::<T>()) {
            for (_, listener) in listeners {
                listener(event, ctx);
            }
        }
    }

    /// Move the table out for dispatch, leaving an empty one that keeps
    /// allocating from the same id sequence.
    pub fn take_preserving_counter(&mut self) -> Self {
        let mut empty = Self::new();
        empty.next_listener_id = self.next_listener_id;
        std::mem::replace(self, empty)
    }

    /// Fold listeners registered during a dispatch back in.
    pub fn merge(&mut self, other: Self) {
        for (type_id, listeners) in other.typed_listeners {
            self.typed_listeners
                .entry(type_id)
                .or_insert_with(Vec::new)
                .extend(listeners);
        }
        self.listener_types.extend(other.listener_types);
        self.next_listener_id = self.next_listener_id.max(other.next_listener_id);
    }
}

impl<E> Default for EventRegistration<E> {
    fn default() -> Self {
        Self::new()
    }
}
