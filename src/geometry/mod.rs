//! Geometry primitives in bed coordinates (millimetres).

mod bounding_box;
mod point;

pub use bounding_box::BoundingBoxF;
pub use point::PointF;
