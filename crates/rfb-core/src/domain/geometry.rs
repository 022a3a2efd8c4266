//! Integer rectangle and region algebra.
//!
//! Coordinates are framebuffer pixels with the origin at the top-left corner.
//! A [`Rect`] stores its top-left corner (inclusive) and bottom-right corner
//! (exclusive), so `Rect::new(0, 0, 10, 10)` covers pixels `0..10` on both
//! axes and has an area of 100.
//!
//! A [`Region`] is an arbitrary set of pixels stored as a list of rectangles
//! that never overlap.  Two regions compare equal when they cover the same
//! pixels, regardless of how each one happens to be cut into rectangles.

use std::fmt;
use std::ops::{Add, Neg, Sub};

use serde::{Deserialize, Serialize};

// ── Point ─────────────────────────────────────────────────────────────────────

/// A position or a translation vector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Returns `true` for the zero vector.
    pub fn is_origin(&self) -> bool {
        self.x == 0 && self.y == 0
    }
}

impl Add for Point {
    type Output = Point;

    fn add(self, rhs: Point) -> Point {
        Point::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Point {
    type Output = Point;

    fn sub(self, rhs: Point) -> Point {
        Point::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Neg for Point {
    type Output = Point;

    fn neg(self) -> Point {
        Point::new(-self.x, -self.y)
    }
}

// ── Rect ──────────────────────────────────────────────────────────────────────

/// An axis-aligned rectangle with an exclusive bottom-right corner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    /// Top-left corner (inclusive).
    pub tl: Point,
    /// Bottom-right corner (exclusive).
    pub br: Point,
}

impl Rect {
    /// Builds a rectangle from its corner coordinates.
    pub const fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self {
            tl: Point::new(x1, y1),
            br: Point::new(x2, y2),
        }
    }

    /// Builds a rectangle from a top-left corner and a size.
    pub fn from_size(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self::new(x, y, x + width as i32, y + height as i32)
    }

    pub fn width(&self) -> i32 {
        self.br.x - self.tl.x
    }

    pub fn height(&self) -> i32 {
        self.br.y - self.tl.y
    }

    /// Returns `true` if the rectangle covers no pixels.
    pub fn is_empty(&self) -> bool {
        self.br.x <= self.tl.x || self.br.y <= self.tl.y
    }

    /// Number of pixels covered; zero for an empty rectangle.
    pub fn area(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.width() as u64 * self.height() as u64
        }
    }

    /// Returns the overlapping part of two rectangles.
    ///
    /// The result is empty (see [`Rect::is_empty`]) when they do not overlap.
    pub fn intersect(&self, other: &Rect) -> Rect {
        Rect::new(
            self.tl.x.max(other.tl.x),
            self.tl.y.max(other.tl.y),
            self.br.x.min(other.br.x),
            self.br.y.min(other.br.y),
        )
    }

    /// Returns the smallest rectangle enclosing both.  Empty inputs are ignored.
    pub fn union_boundary(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Rect::new(
            self.tl.x.min(other.tl.x),
            self.tl.y.min(other.tl.y),
            self.br.x.max(other.br.x),
            self.br.y.max(other.br.y),
        )
    }

    /// Returns `true` if the two rectangles share at least one pixel.
    pub fn overlaps(&self, other: &Rect) -> bool {
        !self.intersect(other).is_empty()
    }

    /// Returns `true` if every pixel of `self` is inside `other`.
    ///
    /// An empty rectangle is enclosed by anything.
    pub fn enclosed_by(&self, other: &Rect) -> bool {
        self.is_empty()
            || (self.tl.x >= other.tl.x
                && self.tl.y >= other.tl.y
                && self.br.x <= other.br.x
                && self.br.y <= other.br.y)
    }

    pub fn contains(&self, point: Point) -> bool {
        point.x >= self.tl.x && point.x < self.br.x && point.y >= self.tl.y && point.y < self.br.y
    }

    /// Moves the rectangle by `delta`.
    pub fn translate(&self, delta: Point) -> Rect {
        Rect {
            tl: self.tl + delta,
            br: self.br + delta,
        }
    }

    /// Returns the parts of `self` not covered by `cut`, as at most four
    /// disjoint rectangles.
    fn subtract(&self, cut: &Rect) -> Vec<Rect> {
        let inner = self.intersect(cut);
        if inner.is_empty() {
            return vec![*self];
        }

        let mut pieces = Vec::with_capacity(4);
        if inner.tl.y > self.tl.y {
            pieces.push(Rect::new(self.tl.x, self.tl.y, self.br.x, inner.tl.y));
        }
        if inner.br.y < self.br.y {
            pieces.push(Rect::new(self.tl.x, inner.br.y, self.br.x, self.br.y));
        }
        if inner.tl.x > self.tl.x {
            pieces.push(Rect::new(self.tl.x, inner.tl.y, inner.tl.x, inner.br.y));
        }
        if inner.br.x < self.br.x {
            pieces.push(Rect::new(inner.br.x, inner.tl.y, self.br.x, inner.br.y));
        }
        pieces
    }

    /// Joins two rectangles that share a full edge into one.
    fn merge(&self, other: &Rect) -> Option<Rect> {
        let same_columns = self.tl.x == other.tl.x && self.br.x == other.br.x;
        if same_columns && (self.br.y == other.tl.y || other.br.y == self.tl.y) {
            return Some(Rect::new(
                self.tl.x,
                self.tl.y.min(other.tl.y),
                self.br.x,
                self.br.y.max(other.br.y),
            ));
        }

        let same_rows = self.tl.y == other.tl.y && self.br.y == other.br.y;
        if same_rows && (self.br.x == other.tl.x || other.br.x == self.tl.x) {
            return Some(Rect::new(
                self.tl.x.min(other.tl.x),
                self.tl.y,
                self.br.x.max(other.br.x),
                self.br.y,
            ));
        }

        None
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} at ({},{})",
            self.width(),
            self.height(),
            self.tl.x,
            self.tl.y
        )
    }
}

// ── Region ────────────────────────────────────────────────────────────────────

/// A set of pixels stored as non-overlapping rectangles.
#[derive(Debug, Clone, Default)]
pub struct Region {
    rects: Vec<Rect>,
}

impl Region {
    /// Creates an empty region.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rect(rect: Rect) -> Self {
        if rect.is_empty() {
            Self::new()
        } else {
            Self { rects: vec![rect] }
        }
    }

    /// Builds a region covering every pixel of every input rectangle.
    ///
    /// The inputs may overlap.
    pub fn from_rects<I: IntoIterator<Item = Rect>>(rects: I) -> Self {
        let mut region = Region::new();
        for rect in rects {
            region.assign_union(&Region::from_rect(rect));
        }
        region
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    /// The disjoint rectangles making up this region, top to bottom.
    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    pub fn num_rects(&self) -> usize {
        self.rects.len()
    }

    /// Number of pixels covered.
    pub fn area(&self) -> u64 {
        self.rects.iter().map(Rect::area).sum()
    }

    /// Smallest rectangle enclosing the whole region.
    pub fn bounding_rect(&self) -> Rect {
        self.rects
            .iter()
            .fold(Rect::default(), |acc, r| acc.union_boundary(r))
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }

    pub fn union(&self, other: &Region) -> Region {
        if self.is_empty() {
            return other.clone();
        }
        let mut rects = self.rects.clone();
        rects.extend(other.subtract(self).rects);
        Region::from_disjoint(rects)
    }

    pub fn intersect(&self, other: &Region) -> Region {
        let mut rects = Vec::new();
        for a in &self.rects {
            for b in &other.rects {
                let inner = a.intersect(b);
                if !inner.is_empty() {
                    rects.push(inner);
                }
            }
        }
        Region::from_disjoint(rects)
    }

    pub fn subtract(&self, other: &Region) -> Region {
        let mut pieces = self.rects.clone();
        for cut in &other.rects {
            if pieces.is_empty() {
                break;
            }
            pieces = pieces
                .into_iter()
                .flat_map(|piece| piece.subtract(cut))
                .collect();
        }
        Region::from_disjoint(pieces)
    }

    /// Returns the region moved by `delta`.
    pub fn translate(&self, delta: Point) -> Region {
        Region {
            rects: self.rects.iter().map(|r| r.translate(delta)).collect(),
        }
    }

    pub fn assign_union(&mut self, other: &Region) {
        *self = self.union(other);
    }

    pub fn assign_intersect(&mut self, other: &Region) {
        *self = self.intersect(other);
    }

    pub fn assign_subtract(&mut self, other: &Region) {
        *self = self.subtract(other);
    }

    /// Returns `true` if the two regions share at least one pixel.
    pub fn intersects(&self, other: &Region) -> bool {
        self.rects
            .iter()
            .any(|a| other.rects.iter().any(|b| a.overlaps(b)))
    }

    /// Returns `true` if every pixel of `self` is also in `other`.
    pub fn enclosed_by(&self, other: &Region) -> bool {
        self.subtract(other).is_empty()
    }

    pub fn contains(&self, point: Point) -> bool {
        self.rects.iter().any(|r| r.contains(point))
    }

    /// Normalises a list of already disjoint rectangles: drops empty ones,
    /// merges neighbours sharing a full edge and sorts top to bottom.
    fn from_disjoint(mut rects: Vec<Rect>) -> Region {
        rects.retain(|r| !r.is_empty());

        let mut i = 0;
        while i < rects.len() {
            let mut grew = false;
            let mut j = i + 1;
            while j < rects.len() {
                if let Some(merged) = rects[i].merge(&rects[j]) {
                    rects[i] = merged;
                    rects.swap_remove(j);
                    grew = true;
                } else {
                    j += 1;
                }
            }
            // A grown rectangle may now touch one we already passed.
            i = if grew { 0 } else { i + 1 };
        }

        rects.sort_by_key(|r| (r.tl.y, r.tl.x));
        Region { rects }
    }
}

impl From<Rect> for Region {
    fn from(rect: Rect) -> Self {
        Region::from_rect(rect)
    }
}

impl PartialEq for Region {
    fn eq(&self, other: &Region) -> bool {
        self.area() == other.area() && self.enclosed_by(other)
    }
}

impl Eq for Region {}

// ── Tests ─────────────────────────────────────────────────────────────────────
