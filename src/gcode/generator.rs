//! G-code generator.
//!
//! Second pass over the input: the original program is replayed line by line
//! and, at every planned transition offset, purge motion on the transition
//! block is spliced in. Tool-select lines after the print start are turned
//! into comments since the splicer feeds a single drive.
//!
//! # Purge Sequence
//!
//! 1. Retract (unless the outgoing run already did), hop and travel to the block
//! 2. Optional calibration ping pauses, one cell beside the block when configured
//! 3. Block perimeter on the first transition of a perimeter layer
//! 4. Boustrophedon fill continuing where the layer's previous transition stopped
//! 5. Retract, hop, return and restore the interrupted state

use super::parser::{lines_with_offsets, Command, Dialect, ExtrusionMode, ExtrusionTracker, Marker};
use super::runs::Runs;
use super::tower_writer::TowerWriter;
use super::transition::{Layer, Transition, TransitionBlock, TransitionPlan};
use crate::bed_usage::CELL_SIZE;
use crate::config::PrinterProfile;
use crate::geometry::PointF;
use crate::{CoordF, Result};
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// The rewritten program together with what the splicing pass did to it.
#[derive(Clone, Default)]
pub struct GCode {
    content: String,
    pub stats: GCodeStats,
}

impl GCode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Append `line` and a newline.
    pub fn append_line(&mut self, line: &str) {
        self.content.push_str(line);
        self.content.push('\n');
    }

    /// Append already newline-terminated text, such as a purge section.
    pub fn append(&mut self, content: &str) {
        self.content.push_str(content);
    }

    /// Write the program to `path`.
    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(self.content.as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.content.lines()
    }
}

impl fmt::Debug for GCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GCode({} bytes, {})", self.len(), self.stats)
    }
}

/// Statistics about the splicing pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GCodeStats {
    /// Transitions emitted, forced breaks included.
    pub transitions: usize,

    /// Calibration pings emitted.
    pub pings: usize,

    /// Filament purged on the transition block (mm).
    pub purge_mm: f64,

    /// Tool-select lines replaced by comments.
    pub replaced_tool_changes: usize,

    /// Block layers whose fill did not reach the end of the pattern.
    pub underfilled_layers: usize,
}

impl GCodeStats {
    /// Purged filament in meters.
    pub fn purge_meters(&self) -> f64 {
        self.purge_mm / 1000.0
    }
}

impl fmt::Display for GCodeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GCodeStats(transitions={}, pings={}, purge={:.2}m)",
            self.transitions,
            self.pings,
            self.purge_meters()
        )
    }
}

// ============================================================================
// Fill Pattern
// ============================================================================

/// Boustrophedon path over a rectangle, addressed by distance along the path.
///
/// Lines run along X on even block layers and along Y on odd ones. Between
/// lines the path steps sideways by one stride.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FillPattern {
    start: PointF,
    along_x: bool,
    length: CoordF,
    stride: CoordF,
    lines: usize,
}

impl FillPattern {
    /// Pattern over `region` for block layer `layer_index` with the given
    /// line stride.
    pub fn new(min: PointF, max: PointF, layer_index: usize, stride: CoordF) -> Self {
        let along_x = layer_index % 2 == 0;
        let (length, span) = if along_x {
            (max.x - min.x, max.y - min.y)
        } else {
            (max.y - min.y, max.x - min.x)
        };
        let length = length.max(0.0);
        let lines = if stride > 0.0 && span > 0.0 {
            (span / stride + 1e-9).floor() as usize + 1
        } else {
            1
        };
        Self {
            start: min,
            along_x,
            length,
            stride,
            lines,
        }
    }

    pub fn lines(&self) -> usize {
        self.lines
    }

    /// Length of the whole path.
    pub fn total(&self) -> f64 {
        self.lines as f64 * self.length + (self.lines - 1) as f64 * self.stride
    }

    fn period(&self) -> f64 {
        self.length + self.stride
    }

    /// Position after `progress` mm along the path.
    pub fn point_at(&self, progress: f64) -> PointF {
        let p = progress.clamp(0.0, self.total());
        let line = ((p / self.period()).floor() as usize).min(self.lines - 1);
        let rest = p - line as f64 * self.period();
        let forward = line % 2 == 0;

        let (u, v) = if rest <= self.length {
            let u = if forward { rest } else { self.length - rest };
            (u, line as f64 * self.stride)
        } else {
            let u = if forward { self.length } else { 0.0 };
            (u, line as f64 * self.stride + (rest - self.length))
        };

        if self.along_x {
            PointF::new(self.start.x + u, self.start.y + v)
        } else {
            PointF::new(self.start.x + v, self.start.y + u)
        }
    }

    /// Path vertices strictly after `from` up to and including `to`, with
    /// their progress values.
    pub fn vertices(&self, from: f64, to: f64) -> Vec<(f64, PointF)> {
        let to = to.min(self.total());
        let mut out = Vec::new();
        if to <= from {
            return out;
        }
        let period = self.period();
        let first = (from / period).floor() as usize;
        for line in first..self.lines {
            let base = line as f64 * period;
            for corner in [base + self.length, base + period] {
                if corner > from + 1e-9 && corner < to - 1e-9 {
                    out.push((corner, self.point_at(corner)));
                }
            }
            if base > to {
                break;
            }
        }
        out.push((to, self.point_at(to)));
        out
    }
}

// ============================================================================
// Generator
// ============================================================================

/// Interpreter state of the replayed program.
#[derive(Debug, Clone)]
struct ReplayState {
    tracker: ExtrusionTracker,
    pos: PointF,
    z: CoordF,
    feedrate: f64,
    started: bool,
}

impl ReplayState {
    fn update(&mut self, command: &Command<'_>, dialect: Dialect) {
        match command {
            Command::Move(mov) => {
                if let Some(e) = mov.e {
                    self.tracker.process_e(e);
                }
                self.pos = PointF::new(mov.x.unwrap_or(self.pos.x), mov.y.unwrap_or(self.pos.y));
                self.z = mov.z.unwrap_or(self.z);
                self.feedrate = mov.f.unwrap_or(self.feedrate);
            }
            Command::SetPosition { e: Some(e) } => self.tracker.reset_e(*e),
            Command::AbsoluteExtrusion => self.tracker.set_absolute(),
            Command::RelativeExtrusion => self.tracker.set_relative(),
            Command::Comment(comment) => {
                if dialect.marker(comment) == Some(Marker::PrintStart) {
                    self.started = true;
                }
            }
            _ => {}
        }
    }
}

/// Fill progress of one block layer.
#[derive(Debug, Clone, Copy, Default)]
struct LayerProgress {
    progress: f64,
    perimeter_done: bool,
}

/// Re-emits the input program with purge motion inserted.
#[derive(Debug, Clone, Copy)]
pub struct ToolpathGenerator<'a> {
    profile: &'a PrinterProfile,
    dialect: Dialect,
}

impl<'a> ToolpathGenerator<'a> {
    pub fn new(profile: &'a PrinterProfile, dialect: Dialect) -> Self {
        Self { profile, dialect }
    }

    /// Replay `src`, inserting every transition of `plan`.
    pub fn generate(&self, src: &str, runs: &Runs, plan: &TransitionPlan) -> GCode {
        let mut gcode = GCode::new();
        let mut state = ReplayState {
            tracker: ExtrusionTracker::new(),
            pos: PointF::zero(),
            z: 0.0,
            feedrate: self.profile.motion.print_speed,
            started: self.dialect.starts_immediately(),
        };
        let mut progress = vec![LayerProgress::default(); plan.layers.len()];
        let mut pending = plan.transitions.iter().enumerate().peekable();
        let mut pings = 0;

        for (offset, line) in lines_with_offsets(src) {
            while let Some((index, t)) = pending.next_if(|(_, t)| t.offset <= offset) {
                match plan.block {
                    Some(block) => {
                        if t.ping {
                            pings += 1;
                        }
                        let purge = self.purge(index, t, plan, runs, &block, &state, &mut progress, pings, &mut gcode.stats);
                        gcode.append(&purge);
                    }
                    None => log::warn!("transition {} has no block to purge on", index + 1),
                }
            }

            let command = Command::parse(line);
            match command {
                Command::ToolSelect(_) if state.started => {
                    gcode.append_line(&format!("; {} (replaced by splice)", line.trim()));
                    gcode.stats.replaced_tool_changes += 1;
                }
                _ => gcode.append_line(line),
            }
            state.update(&command, self.dialect);
        }

        let leftover = pending.count();
        if leftover > 0 {
            log::warn!("{} transitions past the end of the program were dropped", leftover);
        }

        log::info!("{}", gcode.stats);
        gcode
    }

    #[allow(clippy::too_many_arguments)]
    fn purge(
        &self,
        index: usize,
        t: &Transition,
        plan: &TransitionPlan,
        runs: &Runs,
        block: &TransitionBlock,
        state: &ReplayState,
        progress: &mut [LayerProgress],
        ping_number: usize,
        stats: &mut GCodeStats,
    ) -> String {
        let motion = &self.profile.motion;
        let ping = &self.profile.ping;
        let nozzle = self.profile.nozzle_diameter;
        let layer_index = t.layer.0;
        let layer: &Layer = &plan.layers[layer_index];
        let outgoing = runs.get(t.from_run);
        let ends_retracted = outgoing.map_or(false, |r| r.ends_with_retraction);
        let skip_return = outgoing.map_or(false, |r| r.next_move_no_extrusion);
        // an outgoing run that already retracted is primed by its own amount
        let retraction = match outgoing {
            Some(run) if run.ends_with_retraction => run.retraction_mm,
            _ => motion.retract_length,
        };

        let bead_per_mm = self.profile.bead_extrusion(1.0, layer.height);
        let inset = nozzle / 2.0;
        let min = PointF::new(block.origin.x + inset, block.origin.y + inset);
        let max = PointF::new(
            block.origin.x + block.width - inset,
            block.origin.y + block.height - inset,
        );
        let stride = nozzle / layer.density.clamp(1e-3, 1.0);
        let fill_inset = if layer.use_perimeter { nozzle } else { 0.0 };
        let pattern = FillPattern::new(
            PointF::new(min.x + fill_inset, min.y + fill_inset),
            PointF::new(max.x - fill_inset, max.y - fill_inset),
            layer_index,
            stride,
        );

        let range = layer.transitions();
        let lp = &mut progress[layer_index];
        let print_perimeter = layer.use_perimeter && !lp.perimeter_done && index == range.start;
        let corners = [
            min,
            PointF::new(max.x, min.y),
            max,
            PointF::new(min.x, max.y),
        ];
        let first_corner = layer_index % 4;
        let hop_z = layer.z.max(state.z) + motion.z_hop;

        let mut w = TowerWriter::new(state.pos, state.z);
        w.comment(&format!(
            "transition {} start (T{} -> T{}, {:.2} mm)",
            index + 1,
            t.from,
            t.to,
            t.purge_mm()
        ))
        .raw("M83");
        if !ends_retracted {
            w.retract(retraction, motion.retract_speed);
        }
        w.set_z(hop_z, motion.travel_speed);

        let start = if print_perimeter {
            corners[first_corner]
        } else {
            pattern.point_at(lp.progress)
        };

        let mut fill_mm = t.purge_mm();
        let mut pause_after: Option<f64> = None;
        if t.ping && ping.off_tower {
            let spot = self.off_block_point(block, runs, layer.z).unwrap_or_else(|| {
                log::warn!("no room beside the block for ping {}, pausing over it", ping_number);
                start
            });
            w.travel(spot, motion.travel_speed)
                .comment(&format!("ping {} pause 1", ping_number))
                .dwell(ping.pause_ms)
                .unretract(retraction, motion.retract_speed)
                .extrude_in_place(ping.purge_between_pauses)
                .comment(&format!("ping {} pause 2", ping_number))
                .dwell(ping.pause_ms)
                .retract(retraction, motion.retract_speed);
            fill_mm -= ping.purge_between_pauses;
            w.travel(start, motion.travel_speed);
        } else {
            w.travel(start, motion.travel_speed);
            if t.ping {
                w.comment(&format!("ping {} pause 1", ping_number)).dwell(ping.pause_ms);
                pause_after = Some(ping.purge_between_pauses);
            }
        }

        w.set_z(layer.z, motion.travel_speed)
            .unretract(retraction, motion.retract_speed);

        if print_perimeter {
            w.feedrate(motion.print_speed * motion.perimeter_speed_multiplier);
            for step in 1..=4 {
                let from = corners[(first_corner + step - 1) % 4];
                let to = corners[(first_corner + step) % 4];
                w.extrude(to, from.distance(&to) * bead_per_mm);
                if let Some(threshold) = pause_after {
                    if w.extruded() >= threshold {
                        w.comment(&format!("ping {} pause 2", ping_number)).dwell(ping.pause_ms);
                        pause_after = None;
                    }
                }
            }
            fill_mm -= self.profile.bead_extrusion(block.perimeter(), layer.height);
            lp.perimeter_done = true;
            let fill_start = pattern.point_at(lp.progress);
            if fill_start.distance(&w.pos()) > 1e-6 {
                w.travel(fill_start, motion.travel_speed);
            }
        }

        w.feedrate(motion.print_speed);
        let mut remaining_path = fill_mm.max(0.0) / bead_per_mm;
        if let Some(threshold) = pause_after {
            let before = ((threshold - w.extruded()) / bead_per_mm).clamp(0.0, remaining_path);
            self.fill(&mut w, &pattern, &mut lp.progress, before, bead_per_mm);
            remaining_path -= before;
            w.comment(&format!("ping {} pause 2", ping_number)).dwell(ping.pause_ms);
        }
        self.fill(&mut w, &pattern, &mut lp.progress, remaining_path, bead_per_mm);

        if !w.rescale(t.purge_mm()) {
            w.extrude_in_place(t.purge_mm());
        }

        if index + 1 == range.end {
            let left = pattern.total() - lp.progress;
            if left > pattern.period() + 1e-6 {
                log::warn!(
                    "block layer {} at z={:.3} is under-filled ({:.1} of {:.1} mm of fill path)",
                    layer_index,
                    layer.z,
                    lp.progress,
                    pattern.total()
                );
                stats.underfilled_layers += 1;
            }
        }

        w.retract(retraction, motion.retract_speed)
            .set_z(hop_z, motion.travel_speed);
        if !skip_return {
            w.travel(state.pos, motion.travel_speed);
        }
        w.set_z(state.z, motion.travel_speed)
            .raw(format!("G1 F{:.0}", state.feedrate));
        if !ends_retracted {
            w.unretract(retraction, motion.retract_speed);
        }
        if state.tracker.mode() == ExtrusionMode::Absolute {
            w.raw("M82")
                .raw(format!("G92 E{:.5}", state.tracker.e_position()));
        }
        w.comment(&format!("transition {} end", index + 1));

        stats.transitions += 1;
        stats.purge_mm += t.purge_mm();
        if t.ping {
            stats.pings += 1;
        }
        w.finish()
    }

    /// A spot one cell beside the block, on the bed and as far from the
    /// model as possible.
    fn off_block_point(&self, block: &TransitionBlock, runs: &Runs, z: CoordF) -> Option<PointF> {
        let b = block.bounds();
        let c = b.center();
        let model = runs.bounds_up_to(z);
        let candidates = [
            PointF::new(b.min.x - CELL_SIZE, c.y),
            PointF::new(b.max.x + CELL_SIZE, c.y),
            PointF::new(c.x, b.min.y - CELL_SIZE),
            PointF::new(c.x, b.max.y + CELL_SIZE),
        ];
        let clearance = |p: &PointF| {
            if model.is_defined() {
                p.distance(&model.center())
            } else {
                0.0
            }
        };
        candidates
            .into_iter()
            .filter(|p| self.profile.bed.contains(p.x, p.y))
            .filter(|p| !model.contains_point(p))
            .max_by(|a, b| clearance(a).total_cmp(&clearance(b)))
    }

    /// Extend the fill by `path` mm along the pattern.
    fn fill(
        &self,
        w: &mut TowerWriter,
        pattern: &FillPattern,
        progress: &mut f64,
        path: f64,
        bead_per_mm: f64,
    ) {
        if path <= 0.0 {
            return;
        }
        let target = (*progress + path).min(pattern.total());
        let mut at = *progress;
        for (p, point) in pattern.vertices(at, target) {
            w.extrude(point, (p - at) * bead_per_mm);
            at = p;
        }
        *progress = target;
    }
}
