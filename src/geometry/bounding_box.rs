//! Axis-aligned bounding boxes in bed coordinates.

use super::PointF;
use crate::CoordF;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A 2D axis-aligned bounding box with floating-point coordinates.
///
/// Starts undefined; the first merged point defines it.
#[derive(Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBoxF {
    pub min: PointF,
    pub max: PointF,
    defined: bool,
}

impl Default for BoundingBoxF {
    fn default() -> Self {
        Self::new()
    }
}

impl BoundingBoxF {
    /// Create a new empty (undefined) bounding box.
    #[inline]
    pub fn new() -> Self {
        Self {
            min: PointF::new(CoordF::MAX, CoordF::MAX),
            max: PointF::new(CoordF::MIN, CoordF::MIN),
            defined: false,
        }
    }

    /// Create a bounding box from corner coordinates.
    #[inline]
    pub fn from_coords(min_x: CoordF, min_y: CoordF, max_x: CoordF, max_y: CoordF) -> Self {
        Self {
            min: PointF::new(min_x, min_y),
            max: PointF::new(max_x, max_y),
            defined: true,
        }
    }

    /// Check if the bounding box has been merged with at least one point.
    #[inline]
    pub fn is_defined(&self) -> bool {
        self.defined
    }

    /// Merge a point into the bounding box.
    pub fn merge_point(&mut self, p: PointF) {
        if self.defined {
            self.min.x = self.min.x.min(p.x);
            self.min.y = self.min.y.min(p.y);
            self.max.x = self.max.x.max(p.x);
            self.max.y = self.max.y.max(p.y);
        } else {
            self.min = p;
            self.max = p;
            self.defined = true;
        }
    }

    /// Merge another bounding box into this one.
    pub fn merge(&mut self, other: &BoundingBoxF) {
        if other.defined {
            self.merge_point(other.min);
            self.merge_point(other.max);
        }
    }

    /// Get the width (X extent).
    #[inline]
    pub fn width(&self) -> CoordF {
        if self.defined {
            self.max.x - self.min.x
        } else {
            0.0
        }
    }

    /// Get the height (Y extent).
    #[inline]
    pub fn height(&self) -> CoordF {
        if self.defined {
            self.max.y - self.min.y
        } else {
            0.0
        }
    }

    /// Get the center point.
    #[inline]
    pub fn center(&self) -> PointF {
        PointF::new(
            (self.min.x + self.max.x) / 2.0,
            (self.min.y + self.max.y) / 2.0,
        )
    }

    /// Get the area.
    #[inline]
    pub fn area(&self) -> CoordF {
        self.width() * self.height()
    }

    /// Check if a point is inside (inclusive).
    pub fn contains_point(&self, p: &PointF) -> bool {
        self.defined
            && p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
    }

    /// Check if this bounding box overlaps another.
    pub fn intersects(&self, other: &BoundingBoxF) -> bool {
        self.defined
            && other.defined
            && self.min.x < other.max.x
            && self.max.x > other.min.x
            && self.min.y < other.max.y
            && self.max.y > other.min.y
    }
}

impl fmt::Debug for BoundingBoxF {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.defined {
            write!(f, "BoundingBoxF({:?} - {:?})", self.min, self.max)
        } else {
            write!(f, "BoundingBoxF(undefined)")
        }
    }
}
