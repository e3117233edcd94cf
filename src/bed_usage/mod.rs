//! BedUsageGrid - coarse occupancy map of the build plate.
//!
//! Every extrusion of the input program is rasterized onto a grid of
//! [`CELL_SIZE`] mm cells, one bitmap per layer. Free space for the transition
//! block is then found by brute force over every grid origin.
//!
//! # Accuracy
//!
//! The rasterizer marks the cells a segment's centre line passes through and
//! ignores extrusion width. Queries compensate by dilating the occupied cells
//! by one cell in all eight directions, so anything placed keeps at least one
//! full free cell between itself and the model.
//!
//! # Example
//!
//! ```rust,ignore
//! use splicer::bed_usage::BedUsageGrid;
//! use splicer::config::BedShape;
//!
//! let mut grid = BedUsageGrid::new(BedShape::Rectangular { width: 200.0, depth: 200.0 });
//! grid.new_layer(0.2);
//! grid.extrude(80.0, 80.0, 120.0, 80.0);
//!
//! let origin = grid.place_and_add(20.0, 30.0, 0.2, 'T');
//! ```

use crate::config::BedShape;
use crate::geometry::PointF;
use crate::CoordF;
use std::fmt;

/// Edge length of one grid cell (mm).
pub const CELL_SIZE: CoordF = 5.0;

/// What occupies a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupant {
    /// Model extrusion.
    Extrusion,
    /// An object reserved on the base layer, tagged for display.
    Reserved(char),
}

#[derive(Debug, Clone)]
struct UsageLayer {
    z: CoordF,
    cells: Vec<Option<Occupant>>,
    used: usize,
}

impl UsageLayer {
    fn new(z: CoordF, cell_count: usize) -> Self {
        Self {
            z,
            cells: vec![None; cell_count],
            used: 0,
        }
    }
}

/// Per-layer occupancy grid over the bed.
///
/// Layer 0 is the base layer. It receives extrusion seen before the first
/// [`new_layer`](Self::new_layer) and every reservation, and it always counts
/// as occupied regardless of the queried height.
#[derive(Debug, Clone)]
pub struct BedUsageGrid {
    bed: BedShape,
    width: usize,
    height: usize,
    layers: Vec<UsageLayer>,
}

impl BedUsageGrid {
    /// Create an empty grid covering the bed.
    pub fn new(bed: BedShape) -> Self {
        let (w, d) = bed.extent();
        let width = (w / CELL_SIZE).ceil().max(0.0) as usize;
        let height = (d / CELL_SIZE).ceil().max(0.0) as usize;
        Self {
            bed,
            width,
            height,
            layers: vec![UsageLayer::new(0.0, width * height)],
        }
    }

    /// Grid dimensions in cells.
    pub fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// Number of layers including the base layer.
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Start recording extrusion for a new layer at height `z`.
    ///
    /// A current layer that received no marks is reused.
    pub fn new_layer(&mut self, z: CoordF) {
        let cell_count = self.width * self.height;
        let reusable = self.layers.len() > 1 && self.layers.last().map_or(false, |l| l.used == 0);
        match self.layers.last_mut() {
            Some(current) if reusable => current.z = z,
            _ => self.layers.push(UsageLayer::new(z, cell_count)),
        }
    }

    /// Mark every cell crossed by an extrusion from `(x0, y0)` to `(x1, y1)`.
    ///
    /// The segment is clipped to the grid first. Segments with non-finite
    /// coordinates mark nothing.
    pub fn extrude(&mut self, x0: CoordF, y0: CoordF, x1: CoordF, y1: CoordF) {
        let Some((x0, y0, x1, y1)) = self.clip(x0, y0, x1, y1) else {
            return;
        };
        let (mut cx, mut cy) = self.to_cell(x0, y0);
        let (ex, ey) = self.to_cell(x1, y1);

        let dx = (ex - cx).abs();
        let dy = -(ey - cy).abs();
        let sx = if cx < ex { 1 } else { -1 };
        let sy = if cy < ey { 1 } else { -1 };
        let mut err = dx + dy;

        loop {
            self.mark(cx, cy);
            if cx == ex && cy == ey {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                cx += sx;
            }
            if e2 <= dx {
                err += dx;
                cy += sy;
            }
        }
    }

    /// Occupancy of every cell at or below `z`, dilated by one cell.
    pub fn usage_up_to(&self, z: CoordF) -> Vec<bool> {
        let mut used = vec![false; self.width * self.height];
        for (i, layer) in self.layers.iter().enumerate() {
            if i == 0 || layer.z <= z + 1e-9 {
                for (u, cell) in used.iter_mut().zip(&layer.cells) {
                    *u |= cell.is_some();
                }
            }
        }

        let mut expanded = vec![false; used.len()];
        for y in 0..self.height {
            for x in 0..self.width {
                if !used[y * self.width + x] {
                    continue;
                }
                for ny in y.saturating_sub(1)..=(y + 1).min(self.height - 1) {
                    for nx in x.saturating_sub(1)..=(x + 1).min(self.width - 1) {
                        expanded[ny * self.width + nx] = true;
                    }
                }
            }
        }
        expanded
    }

    /// Find room for a `w` x `h` object up to height `z`, as close to the
    /// middle of the bed as possible.
    pub fn place(&self, w: CoordF, h: CoordF, z: CoordF) -> Option<PointF> {
        let center = PointF::new(
            self.width as CoordF * CELL_SIZE / 2.0,
            self.height as CoordF * CELL_SIZE / 2.0,
        ) - self.bed.origin_offset();
        self.place_near(w, h, z, center)
    }

    /// Find room for a `w` x `h` object up to height `z` whose centre is as
    /// close as possible to `target`.
    ///
    /// Returns the object's origin (lower-left corner), centred inside its
    /// cell-rounded footprint.
    pub fn place_near(&self, w: CoordF, h: CoordF, z: CoordF, target: PointF) -> Option<PointF> {
        let cw = cells_for(w);
        let ch = cells_for(h);
        if cw == 0 || ch == 0 || cw > self.width || ch > self.height {
            return None;
        }

        let usage = self.usage_up_to(z);
        let mut best: Option<(CoordF, PointF)> = None;

        for x in 0..=self.width - cw {
            for y in 0..=self.height - ch {
                if !self.cells_are_free(&usage, x, y, cw, ch) {
                    continue;
                }
                let origin = self.footprint_origin(x, y, cw, ch, w, h);
                let center = PointF::new(origin.x + w / 2.0, origin.y + h / 2.0);
                let d = center.distance_squared(&target);
                if best.map_or(true, |(best_d, _)| d < best_d) {
                    best = Some((d, origin));
                }
            }
        }

        best.map(|(_, origin)| origin)
    }

    /// Check a single candidate: the object at origin `(x, y)` touches no
    /// occupied (dilated) cell and lies entirely on the bed.
    pub fn footprint_is_free(&self, x: CoordF, y: CoordF, w: CoordF, h: CoordF, z: CoordF) -> bool {
        let Some((cx, cy, cw, ch)) = self.footprint_cells(x, y, w, h) else {
            return false;
        };
        let usage = self.usage_up_to(z);
        self.cells_are_free(&usage, cx, cy, cw, ch)
    }

    /// Permanently reserve a footprint on the base layer.
    pub fn add(&mut self, x: CoordF, y: CoordF, w: CoordF, h: CoordF, tag: char) {
        let (x0, y0) = self.to_cell(x, y);
        let (x1, y1) = self.to_cell_ceil(x + w, y + h);
        let base = &mut self.layers[0];
        for cy in y0.max(0)..y1.min(self.height as i64) {
            for cx in x0.max(0)..x1.min(self.width as i64) {
                let cell = &mut base.cells[cy as usize * self.width + cx as usize];
                if cell.is_none() {
                    base.used += 1;
                }
                *cell = Some(Occupant::Reserved(tag));
            }
        }
    }

    /// [`place`](Self::place) followed by [`add`](Self::add).
    pub fn place_and_add(&mut self, w: CoordF, h: CoordF, z: CoordF, tag: char) -> Option<PointF> {
        let origin = self.place(w, h, z)?;
        self.add(origin.x, origin.y, w, h, tag);
        Some(origin)
    }

    /// The occupant of a cell on a given layer.
    pub fn occupant(&self, layer: usize, cx: usize, cy: usize) -> Option<Occupant> {
        if cx >= self.width || cy >= self.height {
            return None;
        }
        self.layers
            .get(layer)
            .and_then(|l| l.cells[cy * self.width + cx])
    }

    /// Cell containing a G-code coordinate, if it is on the grid.
    pub fn cell_of(&self, x: CoordF, y: CoordF) -> Option<(usize, usize)> {
        let (cx, cy) = self.to_cell(x, y);
        self.in_grid(cx, cy).then_some((cx as usize, cy as usize))
    }

    /// Liang-Barsky clip of a segment against the grid extent.
    fn clip(&self, x0: CoordF, y0: CoordF, x1: CoordF, y1: CoordF) -> Option<(CoordF, CoordF, CoordF, CoordF)> {
        if ![x0, y0, x1, y1].iter().all(|v| v.is_finite()) {
            return None;
        }
        let offset = self.bed.origin_offset();
        let min = PointF::new(-offset.x, -offset.y);
        let max = PointF::new(
            self.width as CoordF * CELL_SIZE - offset.x,
            self.height as CoordF * CELL_SIZE - offset.y,
        );

        let (dx, dy) = (x1 - x0, y1 - y0);
        let mut t0: CoordF = 0.0;
        let mut t1: CoordF = 1.0;
        for (p, q) in [(-dx, x0 - min.x), (dx, max.x - x0), (-dy, y0 - min.y), (dy, max.y - y0)] {
            if p == 0.0 {
                if q < 0.0 {
                    return None;
                }
            } else {
                let r = q / p;
                if p < 0.0 {
                    if r > t1 {
                        return None;
                    }
                    t0 = t0.max(r);
                } else {
                    if r < t0 {
                        return None;
                    }
                    t1 = t1.min(r);
                }
            }
        }

        let clipped = (x0 + t0 * dx, y0 + t0 * dy, x0 + t1 * dx, y0 + t1 * dy);
        [clipped.0, clipped.1, clipped.2, clipped.3]
            .iter()
            .all(|v| v.is_finite())
            .then_some(clipped)
    }

    fn to_cell(&self, x: CoordF, y: CoordF) -> (i64, i64) {
        let offset = self.bed.origin_offset();
        (
            ((x + offset.x) / CELL_SIZE).floor() as i64,
            ((y + offset.y) / CELL_SIZE).floor() as i64,
        )
    }

    fn to_cell_ceil(&self, x: CoordF, y: CoordF) -> (i64, i64) {
        let offset = self.bed.origin_offset();
        (
            ((x + offset.x) / CELL_SIZE - 1e-9).ceil() as i64,
            ((y + offset.y) / CELL_SIZE - 1e-9).ceil() as i64,
        )
    }

    /// G-code coordinate of a cell's lower-left corner.
    fn cell_to_xy(&self, cx: usize, cy: usize) -> PointF {
        PointF::new(cx as CoordF * CELL_SIZE, cy as CoordF * CELL_SIZE) - self.bed.origin_offset()
    }

    fn in_grid(&self, cx: i64, cy: i64) -> bool {
        cx >= 0 && cy >= 0 && (cx as usize) < self.width && (cy as usize) < self.height
    }

    fn mark(&mut self, cx: i64, cy: i64) {
        if !self.in_grid(cx, cy) {
            return;
        }
        let index = cy as usize * self.width + cx as usize;
        if let Some(current) = self.layers.last_mut() {
            if current.cells[index].is_none() {
                current.cells[index] = Some(Occupant::Extrusion);
                current.used += 1;
            }
        }
    }

    /// A cell is usable only when all four of its corners are on the bed.
    fn cell_is_valid(&self, cx: usize, cy: usize) -> bool {
        let p = self.cell_to_xy(cx, cy);
        [(0.0, 0.0), (CELL_SIZE, 0.0), (0.0, CELL_SIZE), (CELL_SIZE, CELL_SIZE)]
            .iter()
            .all(|(dx, dy)| self.bed.contains(p.x + dx, p.y + dy))
    }

    fn cells_are_free(&self, usage: &[bool], x: usize, y: usize, cw: usize, ch: usize) -> bool {
        (y..y + ch).all(|cy| {
            (x..x + cw).all(|cx| !usage[cy * self.width + cx] && self.cell_is_valid(cx, cy))
        })
    }

    fn footprint_cells(&self, x: CoordF, y: CoordF, w: CoordF, h: CoordF) -> Option<(usize, usize, usize, usize)> {
        let (x0, y0) = self.to_cell(x, y);
        let (x1, y1) = self.to_cell_ceil(x + w, y + h);
        if !self.in_grid(x0, y0) || x1 > self.width as i64 || y1 > self.height as i64 || x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some((x0 as usize, y0 as usize, (x1 - x0) as usize, (y1 - y0) as usize))
    }

    fn footprint_origin(&self, cx: usize, cy: usize, cw: usize, ch: usize, w: CoordF, h: CoordF) -> PointF {
        let corner = self.cell_to_xy(cx, cy);
        PointF::new(
            corner.x + (cw as CoordF * CELL_SIZE - w) / 2.0,
            corner.y + (ch as CoordF * CELL_SIZE - h) / 2.0,
        )
    }
}

fn cells_for(length: CoordF) -> usize {
    if length <= 0.0 {
        0
    } else {
        (length / CELL_SIZE - 1e-9).ceil().max(1.0) as usize
    }
}

impl fmt::Display for BedUsageGrid {
    /// Render the base layer, back of the bed first.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = &self.layers[0];
        for cy in (0..self.height).rev() {
            for cx in 0..self.width {
                let p = self.cell_to_xy(cx, cy);
                let on_bed = !self.bed.is_circular()
                    || self.bed.contains(p.x + CELL_SIZE / 2.0, p.y + CELL_SIZE / 2.0);
                let sym = match base.cells[cy * self.width + cx] {
                    Some(Occupant::Extrusion) => '*',
                    Some(Occupant::Reserved(tag)) => tag,
                    None if on_bed => ' ',
                    None => '.',
                };
                write!(f, "{}", sym)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_bed(size: CoordF) -> BedUsageGrid {
        BedUsageGrid::new(BedShape::Rectangular {
            width: size,
            depth: size,
        })
    }

    fn marked(grid: &BedUsageGrid, layer: usize) -> Vec<(usize, usize)> {
        let (w, h) = grid.dimensions();
        let mut cells = Vec::new();
        for cy in 0..h {
            for cx in 0..w {
                if grid.occupant(layer, cx, cy).is_some() {
                    cells.push((cx, cy));
                }
            }
        }
        cells
    }

    #[test]
    fn test_dimensions() {
        let grid = BedUsageGrid::new(BedShape::Rectangular {
            width: 252.0,
            depth: 210.0,
        });
        assert_eq!(grid.dimensions(), (51, 42));
        assert_eq!(grid.layer_count(), 1);

        let delta = BedUsageGrid::new(BedShape::Circular { diameter: 170.0 });
        assert_eq!(delta.dimensions(), (34, 34));
    }

    #[test]
    fn test_horizontal_rasterization() {
        let mut grid = square_bed(100.0);
        grid.new_layer(0.2);
        grid.extrude(0.0, 0.0, 12.0, 0.0);
        assert_eq!(marked(&grid, 1), vec![(0, 0), (1, 0), (2, 0)]);
    }

    #[test]
    fn test_steep_and_reversed_segments() {
        let mut grid = square_bed(100.0);
        grid.new_layer(0.2);
        grid.extrude(7.0, 24.0, 7.0, 1.0);
        assert_eq!(marked(&grid, 1), vec![(1, 0), (1, 1), (1, 2), (1, 3), (1, 4)]);

        grid.new_layer(0.4);
        grid.extrude(26.0, 1.0, 1.0, 26.0);
        let cells = marked(&grid, 2);
        assert_eq!(cells.len(), 6);
        assert!(cells.contains(&(5, 0)));
        assert!(cells.contains(&(0, 5)));
    }

    #[test]
    fn test_single_cell_and_off_grid() {
        let mut grid = square_bed(50.0);
        grid.new_layer(0.2);
        grid.extrude(3.0, 3.0, 3.0, 3.0);
        grid.extrude(-20.0, 60.0, -10.0, 70.0);
        assert_eq!(marked(&grid, 1), vec![(0, 0)]);
    }

    #[test]
    fn test_far_and_non_finite_segments() {
        let mut grid = square_bed(50.0);
        grid.new_layer(0.2);
        grid.extrude(10.0, 10.0, 1e300, 10.0);
        assert_eq!(marked(&grid, 1), (2..10).map(|cx| (cx, 2)).collect::<Vec<_>>());

        let mut grid = square_bed(50.0);
        grid.new_layer(0.2);
        grid.extrude(f64::INFINITY, 0.0, 10.0, 10.0);
        grid.extrude(f64::NAN, 5.0, 10.0, 10.0);
        grid.extrude(-1e300, -1e300, -1e299, 1e300);
        assert!(marked(&grid, 1).is_empty());
    }

    #[test]
    fn test_empty_layer_is_reused() {
        let mut grid = square_bed(100.0);
        grid.new_layer(0.2);
        grid.new_layer(0.4);
        assert_eq!(grid.layer_count(), 2);

        grid.extrude(10.0, 10.0, 20.0, 10.0);
        grid.new_layer(0.6);
        assert_eq!(grid.layer_count(), 3);
    }

    #[test]
    fn test_usage_respects_height() {
        let mut grid = square_bed(100.0);
        grid.new_layer(0.2);
        grid.extrude(50.0, 50.0, 50.0, 50.0);
        grid.new_layer(5.0);
        grid.extrude(20.0, 20.0, 20.0, 20.0);

        let low = grid.usage_up_to(0.2);
        let high = grid.usage_up_to(5.0);
        let (w, _) = grid.dimensions();
        assert!(low[10 * w + 10]);
        assert!(low[11 * w + 11]);
        assert!(!low[4 * w + 4]);
        assert!(high[4 * w + 4]);
        assert!(high[3 * w + 5]);
    }

    #[test]
    fn test_placement_respects_dilation() {
        let mut grid = square_bed(100.0);
        grid.new_layer(0.2);
        grid.extrude(52.0, 52.0, 52.0, 52.0);

        // cell 10 is used, cell 11 is its dilation
        assert!(!grid.footprint_is_free(55.0, 55.0, 5.0, 5.0, 0.2));
        assert!(grid.footprint_is_free(60.0, 60.0, 5.0, 5.0, 0.2));
        assert!(grid.footprint_is_free(60.0, 50.0, 5.0, 5.0, 0.2));
    }

    #[test]
    fn test_place_prefers_center() {
        let grid = square_bed(100.0);
        let origin = grid.place(10.0, 10.0, 1.0).unwrap();
        assert_eq!(origin, PointF::new(45.0, 45.0));

        // odd sizes are centred inside their rounded footprint
        let origin = grid.place(8.0, 12.0, 1.0).unwrap();
        let center = PointF::new(origin.x + 4.0, origin.y + 6.0);
        assert!(center.distance(&PointF::new(50.0, 50.0)) <= 2.5 + 1e-9);
        assert_eq!(origin, PointF::new(46.0, 41.5));
    }

    #[test]
    fn test_place_avoids_model() {
        let mut grid = square_bed(100.0);
        grid.new_layer(0.2);
        for y in [40.0, 45.0, 50.0, 55.0] {
            grid.extrude(40.0, y, 60.0, y);
        }

        let origin = grid.place(10.0, 10.0, 0.2).unwrap();
        assert!(grid.footprint_is_free(origin.x, origin.y, 10.0, 10.0, 0.2));

        // above the model's height the centre is free again
        grid.new_layer(0.4);
        let origin = grid.place(10.0, 10.0, 0.1).unwrap();
        assert_eq!(origin, PointF::new(45.0, 45.0));
    }

    #[test]
    fn test_place_near_target() {
        let grid = square_bed(100.0);
        let origin = grid.place_near(10.0, 10.0, 1.0, PointF::new(0.0, 0.0)).unwrap();
        assert_eq!(origin, PointF::new(0.0, 0.0));
    }

    #[test]
    fn test_place_too_large() {
        let grid = square_bed(20.0);
        assert!(grid.place(25.0, 5.0, 1.0).is_none());
        assert!(grid.place(0.0, 5.0, 1.0).is_none());
    }

    #[test]
    fn test_place_and_add_reserves_base() {
        let mut grid = square_bed(100.0);
        let first = grid.place_and_add(10.0, 10.0, 1.0, 'T').unwrap();
        assert_eq!(grid.occupant(0, 9, 9), Some(Occupant::Reserved('T')));
        assert_eq!(grid.occupant(0, 10, 10), Some(Occupant::Reserved('T')));
        assert_eq!(grid.occupant(0, 11, 11), None);

        let second = grid.place(10.0, 10.0, 1.0).unwrap();
        assert_ne!(first, second);
        assert!(grid.footprint_is_free(second.x, second.y, 10.0, 10.0, 1.0));

        let map = grid.to_string();
        assert_eq!(map.lines().count(), 20);
        assert_eq!(map.matches('T').count(), 4);
    }

    #[test]
    fn test_circular_bed_validity() {
        let grid = BedUsageGrid::new(BedShape::Circular { diameter: 100.0 });
        // the corners of a circular bed are not usable
        assert!(!grid.footprint_is_free(-50.0, -50.0, 5.0, 5.0, 1.0));
        assert!(grid.footprint_is_free(-2.5, -2.5, 5.0, 5.0, 1.0));

        let origin = grid.place(10.0, 10.0, 1.0).unwrap();
        assert_eq!(origin, PointF::new(-5.0, -5.0));
        assert!(grid.to_string().starts_with('.'));
    }
}
