//! Property-based invariant tests for the splicing pipeline.
//!
//! 1. Rasterizing a segment marks exactly one cell per Bresenham step,
//!    including both end cells.
//! 2. Placement results never touch occupied (dilated) cells.
//! 3. Extracted runs have non-decreasing heights per tool and account for
//!    every millimetre of extrusion.
//! 4. Planned transitions conserve purge and the ledger is strictly increasing.

use proptest::prelude::*;
use splicer::bed_usage::{BedUsageGrid, Occupant};
use splicer::config::{BedShape, MaterialTable, PrinterProfile};
use splicer::gcode::{Dialect, RunExtractor, TransitionPlanner};

// ── Helpers ─────────────────────────────────────────────────────────────

fn bed() -> BedShape {
    BedShape::Rectangular {
        width: 250.0,
        depth: 210.0,
    }
}

fn marked_cells(grid: &BedUsageGrid, layer: usize) -> usize {
    let (w, h) = grid.dimensions();
    (0..h)
        .flat_map(|cy| (0..w).map(move |cx| (cx, cy)))
        .filter(|&(cx, cy)| grid.occupant(layer, cx, cy) == Some(Occupant::Extrusion))
        .count()
}

/// A relative-extrusion program built from (tool, new layer, moves) segments.
fn program(segments: &[(usize, bool, usize)]) -> (String, usize) {
    let mut out = String::from("M83\nG1 Z0.2 F1200\n");
    let mut tool = 0;
    let mut z = 0.2;
    let mut moves = 0;
    for &(next_tool, bump, count) in segments {
        if bump {
            z += 0.2;
            out.push_str(&format!("G1 Z{:.1}\n", z));
        }
        if next_tool != tool {
            out.push_str(&format!("T{}\n", next_tool));
            tool = next_tool;
        }
        for _ in 0..count {
            let x = if moves % 2 == 0 { 60.0 } else { 50.0 };
            let y = 50.0 + (moves % 3) as f64 * 5.0;
            out.push_str(&format!("G1 X{:.1} Y{:.1} E1.0\n", x, y));
            moves += 1;
        }
    }
    (out, moves)
}

fn segments(max_len: usize) -> impl Strategy<Value = Vec<(usize, bool, usize)>> {
    proptest::collection::vec((0usize..4, any::<bool>(), 1usize..4), 1..=max_len)
}

// ═════════════════════════════════════════════════════════════════════════
// 1. Rasterization
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn segment_marks_one_cell_per_step(
        x0 in 0.0f64..249.0, y0 in 0.0f64..209.0,
        x1 in 0.0f64..249.0, y1 in 0.0f64..209.0,
    ) {
        let mut grid = BedUsageGrid::new(bed());
        grid.new_layer(0.2);
        grid.extrude(x0, y0, x1, y1);

        let (ax, ay) = grid.cell_of(x0, y0).unwrap();
        let (bx, by) = grid.cell_of(x1, y1).unwrap();
        let steps = (ax as i64 - bx as i64).abs().max((ay as i64 - by as i64).abs()) as usize;

        prop_assert_eq!(grid.occupant(1, ax, ay), Some(Occupant::Extrusion));
        prop_assert_eq!(grid.occupant(1, bx, by), Some(Occupant::Extrusion));
        prop_assert_eq!(marked_cells(&grid, 1), steps + 1);
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 2. Placement
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn placement_avoids_model(
        lines in proptest::collection::vec((0.0f64..249.0, 0.0f64..209.0, 0.0f64..249.0, 0.0f64..209.0), 0..6),
        w in 5.0f64..40.0,
        h in 5.0f64..40.0,
    ) {
        let mut grid = BedUsageGrid::new(bed());
        grid.new_layer(0.2);
        for &(x0, y0, x1, y1) in &lines {
            grid.extrude(x0, y0, x1, y1);
        }

        if let Some(origin) = grid.place(w, h, 0.2) {
            prop_assert!(grid.footprint_is_free(origin.x, origin.y, w, h, 0.2));
        }
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 3. Run extraction
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn runs_are_monotonic_per_tool(segments in segments(12)) {
        let (src, moves) = program(&segments);
        let mut grid = BedUsageGrid::new(bed());
        let runs = RunExtractor::new(Dialect::Generic, 0.3).extract(&src, &mut grid).unwrap();

        for tool in 0..4 {
            let heights: Vec<f64> = runs
                .as_slice()
                .iter()
                .filter(|r| r.tool == tool)
                .map(|r| r.z)
                .collect();
            prop_assert!(heights.windows(2).all(|w| w[0] <= w[1] + 1e-9), "{:?}", heights);
        }
        prop_assert!((runs.total_e() - moves as f64).abs() < 1e-6);
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 4. Planning
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn plan_conserves_purge(segments in segments(6), in_infill in any::<bool>()) {
        let (src, _) = program(&segments);
        let mut profile = PrinterProfile::new("prop", bed());
        profile.purge.in_infill = in_infill;
        let materials = MaterialTable::new();

        let mut grid = BedUsageGrid::new(profile.bed);
        let runs = RunExtractor::new(Dialect::Generic, profile.max_layer_height)
            .extract(&src, &mut grid)
            .unwrap();
        let plan = TransitionPlanner::new(&profile, &materials)
            .plan(&runs, &mut grid)
            .unwrap();

        for t in &plan.transitions {
            prop_assert!((t.pre_mm + t.infill_mm - t.requested_pre_mm).abs() < 1e-6);
            prop_assert!((t.post_mm + t.support_mm - t.requested_post_mm).abs() < 1e-6);
        }
        for layer in &plan.layers {
            prop_assert!(layer.density <= 1.0 + 1e-9);
        }
        let ledger = &plan.ledger;
        prop_assert!(ledger.splices.windows(2).all(|w| w[0].length < w[1].length));
        prop_assert!(ledger.pings.windows(2).all(|w| w[0].length < w[1].length));
    }
}
