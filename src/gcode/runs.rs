//! Run extraction.
//!
//! A *run* is a maximal stretch of the input printed with one tool at one
//! layer height. [`RunExtractor`] streams the program once, records every run
//! with the byte offsets that open and close it, and feeds each extruding
//! move into the [`BedUsageGrid`].
//!
//! # Extrusion accounting
//!
//! Only moving extrusions decide where runs begin and end. Retractions and
//! unretractions (E changes without XY motion) are charged to the open run,
//! or held until the next run opens, so the sum of all run lengths equals the
//! net filament the program consumes after the print start.
//!
//! # Post-processing
//!
//! Runs go through three merge passes, in order:
//! 1. [`Runs::merge_consecutive_runs`] - adjacent runs with the same tool and
//!    height (split only by a path kind change) are joined
//! 2. [`Runs::merge_negative_height_runs`] - small height regressions are
//!    folded into the previous layer
//! 3. [`Runs::merge_compatible_runs`] - final compaction and the per-tool
//!    monotonic height check

use super::parser::{lines_with_offsets, Command, Dialect, ExtrusionTracker, Marker, PathKind};
use crate::bed_usage::BedUsageGrid;
use crate::config::DRIVE_COUNT;
use crate::geometry::{BoundingBoxF, PointF};
use crate::{CoordF, Error, Result, ToolId};
use std::collections::HashMap;
use std::ops::Index;

const Z_EPSILON: CoordF = 1e-6;

/// Index of a run in [`Runs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunId(pub usize);

/// A stretch of motion using one tool at one layer height.
#[derive(Debug, Clone, PartialEq)]
pub struct Run {
    pub tool: ToolId,
    /// Layer height of the run's extrusions
    pub z: CoordF,
    /// Net filament consumed (mm)
    pub e: f64,
    /// Byte offset of the line that opened the run
    pub start_offset: usize,
    /// Byte offset of the line that closed the run (source length at EOF)
    pub end_offset: usize,
    pub kind: PathKind,
    /// The last extruder movement of the run was a retraction
    pub ends_with_retraction: bool,
    /// Filament pulled back by that trailing retraction (mm)
    pub retraction_mm: f64,
    /// The first move after the closing line is a travel that positions
    /// both X and Y
    pub next_move_no_extrusion: bool,
    /// XY extent of the run's extrusion
    pub bounds: BoundingBoxF,
    /// Support extrusion at the start of the run (mm)
    pub leading_support_mm: f64,
    /// Infill extrusion at the end of the run (mm)
    pub trailing_infill_mm: f64,
}

impl Run {
    /// A run of `e` mm with tool `tool` at height `z`, spanning the given
    /// source offsets.
    pub fn new(tool: ToolId, z: CoordF, e: f64, start_offset: usize, end_offset: usize) -> Self {
        Self {
            e,
            end_offset,
            ..Self::open(tool, z, PathKind::Normal, start_offset)
        }
    }

    fn open(tool: ToolId, z: CoordF, kind: PathKind, start_offset: usize) -> Self {
        Self {
            tool,
            z,
            e: 0.0,
            start_offset,
            end_offset: start_offset,
            kind,
            ends_with_retraction: false,
            retraction_mm: 0.0,
            next_move_no_extrusion: false,
            bounds: BoundingBoxF::new(),
            leading_support_mm: 0.0,
            trailing_infill_mm: 0.0,
        }
    }

    /// Join `next` onto the end of this run.
    fn absorb(&mut self, next: &Run) {
        self.leading_support_mm = if self.kind == PathKind::Support {
            self.e + next.leading_support_mm
        } else {
            self.leading_support_mm
        };
        self.trailing_infill_mm = if next.kind == PathKind::Infill {
            self.trailing_infill_mm + next.e
        } else {
            next.trailing_infill_mm
        };
        if self.kind != next.kind {
            self.kind = PathKind::Normal;
        }
        self.e += next.e;
        self.end_offset = next.end_offset;
        self.ends_with_retraction = next.ends_with_retraction;
        self.retraction_mm = next.retraction_mm;
        self.next_move_no_extrusion = next.next_move_no_extrusion;
        self.bounds.merge(&next.bounds);
    }

    fn same_layer(&self, other: &Run) -> bool {
        self.tool == other.tool && (self.z - other.z).abs() < Z_EPSILON
    }
}

/// Arena of runs in program order.
#[derive(Debug, Clone, Default)]
pub struct Runs {
    runs: Vec<Run>,
}

impl Runs {
    pub fn new(runs: Vec<Run>) -> Self {
        Self { runs }
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn get(&self, id: RunId) -> Option<&Run> {
        self.runs.get(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (RunId, &Run)> {
        self.runs.iter().enumerate().map(|(i, r)| (RunId(i), r))
    }

    pub fn as_slice(&self) -> &[Run] {
        &self.runs
    }

    /// Net filament consumed by all runs.
    pub fn total_e(&self) -> f64 {
        self.runs.iter().map(|r| r.e).sum()
    }

    /// Extent of every run at or below `z`.
    pub fn bounds_up_to(&self, z: CoordF) -> BoundingBoxF {
        let mut bb = BoundingBoxF::new();
        for run in self.runs.iter().filter(|r| r.z <= z + Z_EPSILON) {
            bb.merge(&run.bounds);
        }
        bb
    }

    /// Collapse adjacent runs sharing tool and height.
    pub fn merge_consecutive_runs(&mut self) {
        let mut merged: Vec<Run> = Vec::with_capacity(self.runs.len());
        for run in self.runs.drain(..) {
            match merged.last_mut() {
                Some(prev) if prev.same_layer(&run) => prev.absorb(&run),
                _ => merged.push(run),
            }
        }
        self.runs = merged;
    }

    /// Fold runs that dip below the previous run by no more than one layer
    /// into the previous run's layer.
    pub fn merge_negative_height_runs(&mut self, max_layer_height: CoordF) {
        let mut merged: Vec<Run> = Vec::with_capacity(self.runs.len());
        for mut run in self.runs.drain(..) {
            if let Some(prev) = merged.last_mut() {
                let drop = prev.z - run.z;
                if drop > Z_EPSILON && drop <= max_layer_height + Z_EPSILON {
                    log::warn!(
                        "T{} run at z={:.3} is below the previous run at z={:.3}, printing it with that layer",
                        run.tool,
                        run.z,
                        prev.z
                    );
                    run.z = prev.z;
                    if prev.tool == run.tool {
                        prev.absorb(&run);
                        continue;
                    }
                }
            }
            merged.push(run);
        }
        self.runs = merged;
    }

    /// Final compaction; every tool's heights must never decrease.
    pub fn merge_compatible_runs(&mut self) -> Result<()> {
        self.merge_consecutive_runs();

        let mut last_z: HashMap<ToolId, CoordF> = HashMap::new();
        for run in &self.runs {
            if let Some(&previous) = last_z.get(&run.tool) {
                if run.z < previous - Z_EPSILON {
                    return Err(Error::NonMonotonicHeight {
                        tool: run.tool,
                        z: run.z,
                        previous,
                    });
                }
            }
            last_z.insert(run.tool, run.z);
        }
        Ok(())
    }
}

impl Index<RunId> for Runs {
    type Output = Run;

    fn index(&self, id: RunId) -> &Run {
        &self.runs[id.0]
    }
}

/// Single-pass classifier of the input program into runs.
#[derive(Debug)]
pub struct RunExtractor {
    dialect: Dialect,
    max_layer_height: CoordF,
    tracker: ExtrusionTracker,
    x: CoordF,
    y: CoordF,
    z: CoordF,
    tool: ToolId,
    kind: PathKind,
    started: bool,
    current: Option<Run>,
    pending_e: f64,
    grid_z: Option<CoordF>,
    /// Run whose `next_move_no_extrusion` is decided by the next move
    awaiting_next_move: Option<usize>,
    runs: Vec<Run>,
}

impl RunExtractor {
    pub fn new(dialect: Dialect, max_layer_height: CoordF) -> Self {
        Self {
            dialect,
            max_layer_height,
            tracker: ExtrusionTracker::new(),
            x: 0.0,
            y: 0.0,
            z: 0.0,
            tool: 0,
            kind: PathKind::Normal,
            started: dialect.starts_immediately(),
            current: None,
            pending_e: 0.0,
            grid_z: None,
            awaiting_next_move: None,
            runs: Vec::new(),
        }
    }

    /// Extract and merge the runs of `src`, rasterizing its extrusion onto
    /// `grid`.
    pub fn extract(mut self, src: &str, grid: &mut BedUsageGrid) -> Result<Runs> {
        for (offset, line) in lines_with_offsets(src) {
            self.process_line(offset, line, grid)?;
        }
        self.close_run(src.len(), true);

        log::debug!("extracted {} raw runs", self.runs.len());

        let mut runs = Runs::new(self.runs);
        runs.merge_consecutive_runs();
        runs.merge_negative_height_runs(self.max_layer_height);
        runs.merge_compatible_runs()?;
        Ok(runs)
    }

    fn process_line(&mut self, offset: usize, line: &str, grid: &mut BedUsageGrid) -> Result<()> {
        match Command::parse(line) {
            Command::Move(mov) => {
                let x = mov.x.unwrap_or(self.x);
                let y = mov.y.unwrap_or(self.y);
                let z = mov.z.unwrap_or(self.z);
                let de = mov.e.map_or(0.0, |e| self.tracker.process_e(e));
                let moving = (x - self.x).abs() > 1e-9 || (y - self.y).abs() > 1e-9;

                if moving || mov.z.is_some() {
                    if let Some(index) = self.awaiting_next_move.take() {
                        self.runs[index].next_move_no_extrusion =
                            de <= 0.0 && mov.x.is_some() && mov.y.is_some();
                    }
                }

                if moving && de > 0.0 {
                    self.extrude(offset, (self.x, self.y), (x, y), z, de, grid);
                } else if de != 0.0 {
                    self.add_stationary_e(de);
                }

                self.x = x;
                self.y = y;
                self.z = z;
            }
            Command::SetPosition { e: Some(e) } => self.tracker.reset_e(e),
            Command::AbsoluteExtrusion => self.tracker.set_absolute(),
            Command::RelativeExtrusion => self.tracker.set_relative(),
            Command::ToolSelect(tool) if tool != self.tool => {
                if !self.started {
                    return Err(Error::ToolChangeBeforeStart { tool, offset });
                }
                if tool >= DRIVE_COUNT {
                    return Err(Error::UnknownTool { tool });
                }
                self.close_run(offset, false);
                if let Some(last) = self.runs.last() {
                    if last.end_offset == offset {
                        self.awaiting_next_move = Some(self.runs.len() - 1);
                    }
                }
                self.tool = tool;
            }
            Command::Comment(comment) => match self.dialect.marker(comment) {
                Some(Marker::PrintStart) if !self.started => {
                    self.started = true;
                    self.pending_e = 0.0;
                }
                Some(Marker::Path(kind)) => self.kind = kind,
                _ => {}
            },
            _ => {}
        }
        Ok(())
    }

    fn extrude(
        &mut self,
        offset: usize,
        from: (CoordF, CoordF),
        to: (CoordF, CoordF),
        z: CoordF,
        de: f64,
        grid: &mut BedUsageGrid,
    ) {
        if self.grid_z.map_or(true, |gz| (gz - z).abs() > Z_EPSILON) {
            grid.new_layer(z);
            self.grid_z = Some(z);
        }
        grid.extrude(from.0, from.1, to.0, to.1);

        if !self.started {
            return;
        }

        let breaks = self
            .current
            .as_ref()
            .map_or(false, |run| (run.z - z).abs() > Z_EPSILON || run.kind != self.kind);
        if breaks {
            self.close_run(offset, false);
        }

        let run = self.current.get_or_insert_with(|| {
            let mut run = Run::open(self.tool, z, self.kind, offset);
            run.e = self.pending_e;
            self.pending_e = 0.0;
            run
        });
        run.e += de;
        run.ends_with_retraction = false;
        run.retraction_mm = 0.0;
        run.bounds.merge_point(PointF::new(from.0, from.1));
        run.bounds.merge_point(PointF::new(to.0, to.1));
    }

    fn add_stationary_e(&mut self, de: f64) {
        if !self.started {
            return;
        }
        match self.current.as_mut() {
            Some(run) => {
                run.e += de;
                if de < 0.0 {
                    let earlier = if run.ends_with_retraction { run.retraction_mm } else { 0.0 };
                    run.retraction_mm = earlier - de;
                    run.ends_with_retraction = true;
                } else {
                    run.retraction_mm = 0.0;
                    run.ends_with_retraction = false;
                }
            }
            None => self.pending_e += de,
        }
    }

    fn close_run(&mut self, end_offset: usize, at_eof: bool) {
        let Some(mut run) = self.current.take() else {
            return;
        };
        if run.e <= 0.0 {
            self.pending_e += run.e;
            return;
        }
        run.end_offset = end_offset;
        run.next_move_no_extrusion = at_eof;
        match run.kind {
            PathKind::Support => run.leading_support_mm = run.e,
            PathKind::Infill => run.trailing_infill_mm = run.e,
            _ => {}
        }
        self.runs.push(run);
    }
}
