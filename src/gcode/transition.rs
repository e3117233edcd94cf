//! Transition planning.
//!
//! Every tool change in the run list becomes a [`Transition`]: a stretch of
//! filament that is purged on a dedicated block next to the model so that the
//! incoming material is clean by the time the model resumes. This module
//! decides how long each purge is, where the splice lands inside it, which
//! transitions carry a calibration ping, and how large the transition block
//! must be so that every layer of it is printable.
//!
//! ## Key Concepts
//!
//! - **Transition layer**: all transitions purged at one block height
//! - **Forced break**: a short same-tool purge so a block layer is never empty
//! - **Diversion**: part of a purge printed as the model's own infill or support
//! - **Injection**: extra purge added to meet a density or length minimum
//!
//! ## Sizing
//!
//! Block size and per-layer densities depend on each other: a sparse layer
//! receives extra purge, which may make it the largest layer, which changes
//! the block. [`TransitionPlanner::size_block`] iterates until the block is
//! stable and nothing was injected.

use std::ops::Range;

use super::runs::{Run, RunId, Runs};
use crate::bed_usage::{BedUsageGrid, CELL_SIZE};
use crate::config::{BedShape, MaterialTable, PrinterProfile, SpliceSetting};
use crate::geometry::{BoundingBoxF, PointF};
use crate::{CoordF, Error, Result, ToolId};

// ============================================================================
// Constants
// ============================================================================

/// Width to depth ratio of the transition block
const GOLDEN_RATIO: f64 = 1.618_033_988_749_895;

/// Narrowest block the generator can fill sensibly (mm)
pub const MIN_BLOCK_WIDTH: CoordF = 10.0;

/// Purge length factor keyed by (outgoing, incoming) color strength
const PURGE_FACTORS: [[f64; 3]; 3] = [
    // incoming: weak, medium, strong
    [0.6, 0.4, 0.2], // outgoing weak
    [0.8, 0.6, 0.4], // outgoing medium
    [1.0, 0.8, 0.6], // outgoing strong
];

/// Filament kept past the final splice on top of the bowden length (mm)
pub const TAIL_ALLOWANCE: f64 = 50.0;

/// Tag used for the block on the bed usage map
pub const BLOCK_TAG: char = 'T';

const LENGTH_TOLERANCE: f64 = 1e-6;
const Z_EPSILON: CoordF = 1e-6;

// ============================================================================
// Plan Types
// ============================================================================

/// Index of a layer in [`TransitionPlan::layers`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(pub usize);

/// Index of a transition in [`TransitionPlan::transitions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransitionId(pub usize);

/// A planned purge between two runs.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// Outgoing tool
    pub from: ToolId,
    /// Incoming tool; equal to `from` for a forced break
    pub to: ToolId,
    /// Pause for a calibration ping during this purge
    pub ping: bool,
    /// Purge on the block before the splice reaches the nozzle (mm)
    pub pre_mm: f64,
    /// Purge on the block after the splice (mm)
    pub post_mm: f64,
    /// Pre-splice purge printed as the outgoing run's infill (mm)
    pub infill_mm: f64,
    /// Post-splice purge printed as the incoming run's support (mm)
    pub support_mm: f64,
    /// Infill available for diversion when the transition was created (mm)
    pub infill_budget: f64,
    /// Support available for diversion when the transition was created (mm)
    pub support_budget: f64,
    /// Run filament on the outgoing drive since its last splice (mm)
    pub mm_from_runs: f64,
    /// Run filament printed before this transition (mm)
    pub printed_mm: f64,
    pub requested_pre_mm: f64,
    pub requested_post_mm: f64,
    pub layer: LayerId,
    pub from_run: RunId,
    pub to_run: RunId,
    /// Byte offset in the source where the purge is inserted
    pub offset: usize,
}

impl Transition {
    /// Filament purged on the block.
    pub fn purge_mm(&self) -> f64 {
        self.pre_mm + self.post_mm
    }

    /// Total transition length including diverted filament.
    pub fn requested_mm(&self) -> f64 {
        self.requested_pre_mm + self.requested_post_mm
    }

    pub fn is_tool_change(&self) -> bool {
        self.from != self.to
    }

    /// Add purge, reclaiming diverted infill and support before growing the
    /// transition.
    pub fn inject(&mut self, amount: f64, target: f64) {
        let mut remaining = amount;
        remaining -= transfer(&mut self.infill_mm, &mut self.pre_mm, remaining);
        remaining -= transfer(&mut self.support_mm, &mut self.post_mm, remaining);
        if remaining > 0.0 {
            let pre = remaining * target;
            let post = remaining - pre;
            self.pre_mm += pre;
            self.requested_pre_mm += pre;
            self.post_mm += post;
            self.requested_post_mm += post;
        }
    }
}

/// Move up to `limit` from `from` into `to`; returns the amount moved.
pub fn transfer(from: &mut f64, to: &mut f64, limit: f64) -> f64 {
    let amount = from.min(limit).max(0.0);
    *from -= amount;
    *to += amount;
    amount
}

/// One height of the transition block.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub z: CoordF,
    pub height: CoordF,
    /// Filament purged on this layer of the block (mm)
    pub purge_mm: f64,
    /// Fill density excluding the perimeter, 0..=1
    pub density: f64,
    pub use_perimeter: bool,
    first_transition: usize,
    transition_count: usize,
}

impl Layer {
    pub fn transitions(&self) -> Range<usize> {
        self.first_transition..self.first_transition + self.transition_count
    }

    pub fn transition_count(&self) -> usize {
        self.transition_count
    }
}

/// The finalized purge region.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransitionBlock {
    /// Lower-left corner in G-code coordinates
    pub origin: PointF,
    pub width: CoordF,
    pub height: CoordF,
}

impl TransitionBlock {
    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    pub fn perimeter(&self) -> f64 {
        2.0 * (self.width + self.height)
    }

    pub fn bounds(&self) -> BoundingBoxF {
        BoundingBoxF::from_coords(
            self.origin.x,
            self.origin.y,
            self.origin.x + self.width,
            self.origin.y + self.height,
        )
    }

    fn approx_eq(&self, other: &TransitionBlock) -> bool {
        const EPS: f64 = 1e-9;
        (self.origin.x - other.origin.x).abs() < EPS
            && (self.origin.y - other.origin.y).abs() < EPS
            && (self.width - other.width).abs() < EPS
            && (self.height - other.height).abs() < EPS
    }
}

/// A cut on one drive of the splicer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Splice {
    pub drive: ToolId,
    /// Cumulative filament consumed when the cut reaches the nozzle (mm)
    pub length: f64,
    /// Full transition length including diverted filament (mm)
    pub transition_mm: f64,
    /// Filament purged on the block (mm)
    pub waste_mm: f64,
}

/// A calibration checkpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ping {
    /// Cumulative filament consumed at the checkpoint (mm)
    pub length: f64,
}

/// Splice settings used for one incoming/outgoing drive pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplicePairSetting {
    pub incoming: ToolId,
    pub outgoing: ToolId,
    pub setting: SpliceSetting,
}

/// Everything the device configuration writer needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpliceLedger {
    pub splices: Vec<Splice>,
    pub pings: Vec<Ping>,
    pub splice_settings: Vec<SplicePairSetting>,
    /// Filament kept past the last splice (mm)
    pub tail_waste_mm: f64,
    pub loading_offset: u32,
}

impl SpliceLedger {
    /// Total filament the print consumes, tail included.
    pub fn total_length(&self) -> f64 {
        self.splices.last().map_or(0.0, |s| s.length)
    }
}

/// Layers, transitions and the sized block.
#[derive(Debug, Clone, Default)]
pub struct TransitionPlan {
    pub layers: Vec<Layer>,
    pub transitions: Vec<Transition>,
    pub block: Option<TransitionBlock>,
    pub ledger: SpliceLedger,
}

impl TransitionPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    /// Open a new block layer on top of the existing ones.
    pub fn add_layer(&mut self, z: CoordF, height: CoordF) -> LayerId {
        self.layers.push(Layer {
            z,
            height,
            purge_mm: 0.0,
            density: 0.0,
            use_perimeter: false,
            first_transition: self.transitions.len(),
            transition_count: 0,
        });
        LayerId(self.layers.len() - 1)
    }

    /// Append a transition to `layer`, which must be the topmost layer.
    pub fn add_transition(
        &mut self,
        layer: LayerId,
        from: ToolId,
        to: ToolId,
        pre_mm: f64,
        post_mm: f64,
    ) -> TransitionId {
        debug_assert_eq!(layer.0 + 1, self.layers.len());
        self.transitions.push(Transition {
            from,
            to,
            ping: false,
            pre_mm,
            post_mm,
            infill_mm: 0.0,
            support_mm: 0.0,
            infill_budget: 0.0,
            support_budget: 0.0,
            mm_from_runs: 0.0,
            printed_mm: 0.0,
            requested_pre_mm: pre_mm,
            requested_post_mm: post_mm,
            layer,
            from_run: RunId(0),
            to_run: RunId(0),
            offset: 0,
        });
        let l = &mut self.layers[layer.0];
        l.transition_count += 1;
        l.purge_mm += pre_mm + post_mm;
        TransitionId(self.transitions.len() - 1)
    }

    pub fn layer_transitions(&self, layer: LayerId) -> &[Transition] {
        &self.transitions[self.layers[layer.0].transitions()]
    }

    /// Filament currently planned on a layer of the block.
    pub fn layer_purge_mm(&self, layer: LayerId) -> f64 {
        self.layer_transitions(layer).iter().map(Transition::purge_mm).sum()
    }

    /// Total filament purged on the block.
    pub fn total_purge_mm(&self) -> f64 {
        self.transitions.iter().map(Transition::purge_mm).sum()
    }

    /// Drop trailing layers that hold no real tool change.
    fn prune(&mut self) {
        while let Some(last) = self.layers.last() {
            if self.transitions[last.transitions()]
                .iter()
                .any(Transition::is_tool_change)
            {
                break;
            }
            self.transitions.truncate(last.first_transition);
            self.layers.pop();
        }
    }
}

// ============================================================================
// Planner
// ============================================================================

/// Builds a [`TransitionPlan`] from extracted runs.
#[derive(Debug, Clone, Copy)]
pub struct TransitionPlanner<'a> {
    profile: &'a PrinterProfile,
    materials: &'a MaterialTable,
}

impl<'a> TransitionPlanner<'a> {
    pub fn new(profile: &'a PrinterProfile, materials: &'a MaterialTable) -> Self {
        Self { profile, materials }
    }

    /// Plan every transition, size the block and reserve it on `grid`.
    pub fn plan(&self, runs: &Runs, grid: &mut BedUsageGrid) -> Result<TransitionPlan> {
        let mut plan = self.build(runs);
        self.schedule_pings(&mut plan);

        let iterations = self.size_block(&mut plan, runs, grid)?;
        if let Some(block) = plan.block {
            grid.add(block.origin.x, block.origin.y, block.width, block.height, BLOCK_TAG);
            log::info!(
                "transition block {:.1} x {:.1} mm at {} after {} iterations, {} layers, {} transitions",
                block.width,
                block.height,
                block.origin,
                iterations,
                plan.layers.len(),
                plan.transitions.len()
            );
        }

        plan.ledger = self.build_ledger(&plan, runs);
        Ok(plan)
    }

    /// Purge length for a tool change after `printed` mm of filament.
    pub fn purge_length(&self, from: ToolId, to: ToolId, printed: f64) -> f64 {
        if from == to {
            return 0.0;
        }
        let purge = &self.profile.purge;
        let factor = PURGE_FACTORS[self.materials.strength(from).index()]
            [self.materials.strength(to).index()];
        let length = purge.min_length + (purge.length - purge.min_length) * factor;
        if printed < purge.stabilization_length {
            length.min(purge.initial_length)
        } else {
            length
        }
    }

    /// Create layers and transitions from the run list.
    pub fn build(&self, runs: &Runs) -> TransitionPlan {
        let mut plan = TransitionPlan::new();
        let runs = runs.as_slice();
        let Some(first) = runs.first() else {
            return plan;
        };
        plan.add_layer(first.z, first.z);

        let mut printed = 0.0;
        let mut purged = 0.0;
        let mut since_splice = 0.0;

        for (i, pair) in runs.windows(2).enumerate() {
            let (prev, run) = (&pair[0], &pair[1]);
            printed += prev.e;
            since_splice += prev.e;
            let layer = LayerId(plan.layers.len() - 1);

            if run.tool != prev.tool {
                let length = self.purge_length(prev.tool, run.tool, printed + purged);
                self.push_transition(&mut plan, layer, (i, prev), (i + 1, run), length, printed, since_splice);
                since_splice = 0.0;
                purged += length;
            }

            let last_z = plan.layers[layer.0].z;
            if run.z > last_z + Z_EPSILON {
                if plan.layers[layer.0].transition_count == 0 {
                    let length = self.profile.purge.break_length;
                    self.push_transition(&mut plan, layer, (i, prev), (i + 1, run), length, printed, since_splice);
                    purged += length;
                }
                plan.add_layer(run.z, run.z - last_z);
            }
        }

        plan.prune();
        plan
    }

    #[allow(clippy::too_many_arguments)]
    fn push_transition(
        &self,
        plan: &mut TransitionPlan,
        layer: LayerId,
        (prev_index, prev): (usize, &Run),
        (run_index, run): (usize, &Run),
        length: f64,
        printed: f64,
        since_splice: f64,
    ) {
        let purge = &self.profile.purge;
        let pre = length * purge.target;
        let id = plan.add_transition(layer, prev.tool, run.tool, pre, length - pre);

        let t = &mut plan.transitions[id.0];
        t.from_run = RunId(prev_index);
        t.to_run = RunId(run_index);
        t.offset = prev.end_offset;
        t.printed_mm = printed;
        t.mm_from_runs = since_splice;
        t.infill_budget = prev.trailing_infill_mm;
        t.support_budget = run.leading_support_mm;

        if t.is_tool_change() {
            if purge.in_infill {
                transfer(&mut t.pre_mm, &mut t.infill_mm, t.infill_budget);
            }
            if purge.in_support {
                transfer(&mut t.post_mm, &mut t.support_mm, t.support_budget);
            }
        }
        let purge_mm = t.purge_mm();
        plan.layers[layer.0].purge_mm += purge_mm - length;
    }

    /// Filament position of each transition's start, given current lengths.
    fn positions(plan: &TransitionPlan) -> Vec<f64> {
        let mut purged = 0.0;
        plan.transitions
            .iter()
            .map(|t| {
                let position = t.printed_mm + purged;
                purged += t.purge_mm();
                position
            })
            .collect()
    }

    /// Mark the transitions that carry a calibration ping.
    pub fn schedule_pings(&self, plan: &mut TransitionPlan) {
        let positions = Self::positions(plan);
        let mut last_ping = 0.0;

        for (i, &position) in positions.iter().enumerate() {
            let since = position - last_ping;
            let threshold = self.profile.ping.threshold(position);
            let overshoot = positions
                .get(i + 1)
                .map(|next| next - last_ping - threshold);
            let ping = since >= threshold
                || overshoot.map_or(false, |over| over > threshold - since);
            if ping {
                last_ping = position;
            }
            plan.transitions[i].ping = ping;
        }
    }

    fn block_size(&self, plan: &TransitionPlan) -> (CoordF, CoordF) {
        let area = plan
            .layers
            .iter()
            .enumerate()
            .map(|(i, layer)| {
                self.profile.length_to_volume(plan.layer_purge_mm(LayerId(i))) / layer.height
            })
            .fold(0.0, f64::max);
        let width = (area / GOLDEN_RATIO).sqrt().max(MIN_BLOCK_WIDTH);
        (width, width * GOLDEN_RATIO)
    }

    /// Where the block should go: just outside the model on its roomiest side.
    fn anchor(&self, model: &BoundingBoxF, width: CoordF, height: CoordF) -> PointF {
        let bed = self.profile.bed.bounds();
        if !model.is_defined() {
            return bed.center();
        }

        let gap = 2.0 * CELL_SIZE;
        let center = model.center();
        match self.profile.bed {
            BedShape::Circular { diameter } => {
                let radius = diameter / 2.0;
                let corners = [(1.0, 1.0), (-1.0, 1.0), (-1.0, -1.0), (1.0, -1.0)].map(|(sx, sy)| {
                    let corner = PointF::new(
                        if sx > 0.0 { model.max.x } else { model.min.x },
                        if sy > 0.0 { model.max.y } else { model.min.y },
                    );
                    let clearance = radius - corner.distance(&PointF::zero());
                    let anchor = corner
                        + PointF::new(sx * (gap + width / 2.0), sy * (gap + height / 2.0));
                    (clearance, anchor)
                });
                best_anchor(&corners)
            }
            BedShape::Rectangular { .. } => {
                let sides = [
                    (
                        bed.max.x - model.max.x,
                        PointF::new(model.max.x + gap + width / 2.0, center.y),
                    ),
                    (
                        model.min.x - bed.min.x,
                        PointF::new(model.min.x - gap - width / 2.0, center.y),
                    ),
                    (
                        bed.max.y - model.max.y,
                        PointF::new(center.x, model.max.y + gap + height / 2.0),
                    ),
                    (
                        model.min.y - bed.min.y,
                        PointF::new(center.x, model.min.y - gap - height / 2.0),
                    ),
                ];
                best_anchor(&sides)
            }
        }
    }

    /// Run the sizing and placement loop until the block is stable.
    ///
    /// Returns the number of iterations taken.
    pub fn size_block(
        &self,
        plan: &mut TransitionPlan,
        runs: &Runs,
        grid: &BedUsageGrid,
    ) -> Result<usize> {
        let Some(top) = plan.layers.last() else {
            plan.block = None;
            return Ok(0);
        };
        let top_z = top.z;
        let model = runs.bounds_up_to(top_z);
        let cap = self.profile.max_sizing_iterations;

        for iteration in 1..=cap {
            let (width, height) = self.block_size(plan);
            let anchor = self.anchor(&model, width, height);
            let origin = grid
                .place_near(width, height, top_z, anchor)
                .ok_or(Error::NoPlacement { width, height })?;
            let block = TransitionBlock {
                origin,
                width,
                height,
            };

            let mut injected = false;
            for i in 0..plan.layers.len() {
                injected |= self.enforce_layer(plan, LayerId(i), &block);
            }
            injected |= self.enforce_transitions(plan);

            let stable = plan.block.map_or(false, |prev| prev.approx_eq(&block));
            log::debug!(
                "sizing iteration {}: block {:.2} x {:.2} at {}, injected={}",
                iteration,
                width,
                height,
                origin,
                injected
            );
            plan.block = Some(block);

            if stable && !injected {
                if let Some(layer) = plan.layers.iter().find(|l| l.density > 1.0 + 1e-9) {
                    return Err(Error::DensityOverflow {
                        z: layer.z,
                        density: layer.density,
                    });
                }
                return Ok(iteration);
            }
        }

        Err(Error::SizingDidNotConverge(cap))
    }

    /// Bring one layer up to its minimum density for `block`.
    ///
    /// Returns whether purge was injected.
    pub fn enforce_layer(
        &self,
        plan: &mut TransitionPlan,
        layer: LayerId,
        block: &TransitionBlock,
    ) -> bool {
        let density = &self.profile.density;
        let (height, range) = {
            let l = &plan.layers[layer.0];
            (l.height, l.transitions())
        };
        let block_volume = block.area() * height;
        let perimeter_mm = self.profile.bead_extrusion(block.perimeter(), height);

        let purge = plan.layer_purge_mm(layer);
        let raw_density = self.profile.length_to_volume(purge) / block_volume;
        let use_perimeter = layer.0 == 0 || raw_density <= density.perimeter_threshold;
        let min_density = if layer.0 == 0 {
            density.min_bottom
        } else {
            density.min
        };

        let mut required = self.profile.volume_to_length(min_density * block_volume);
        if use_perimeter {
            required += perimeter_mm;
        }

        let mut injected = false;
        if !range.is_empty() && purge < required - LENGTH_TOLERANCE {
            let share = (required - purge) / range.len() as f64;
            for t in &mut plan.transitions[range] {
                t.inject(share, self.profile.purge.target);
            }
            injected = true;
        }

        let purge = plan.layer_purge_mm(layer);
        let fill = if use_perimeter {
            purge - perimeter_mm
        } else {
            purge
        };
        let l = &mut plan.layers[layer.0];
        l.purge_mm = purge;
        l.use_perimeter = use_perimeter;
        l.density = (self.profile.length_to_volume(fill) / block_volume).max(0.0);
        injected
    }

    /// Enforce the minimum ping purge and the minimum splice lengths.
    ///
    /// Returns whether any transition grew.
    pub fn enforce_transitions(&self, plan: &mut TransitionPlan) -> bool {
        let ping = &self.profile.ping;
        let limits = &self.profile.splice;
        let target = self.profile.purge.target;

        let mut injected = false;
        let mut purged = 0.0;
        let mut last_splice: Option<f64> = None;

        for t in &mut plan.transitions {
            if t.ping && t.purge_mm() < ping.min_purge - LENGTH_TOLERANCE {
                t.inject(ping.min_purge - t.purge_mm(), target);
                injected = true;
            }

            if t.is_tool_change() {
                let splice_at = t.printed_mm + purged + t.pre_mm;
                let piece = splice_at - last_splice.unwrap_or(0.0);
                let min = if last_splice.is_none() {
                    limits.min_first_length
                } else {
                    limits.min_length
                };
                if piece < min - LENGTH_TOLERANCE {
                    let extra = min - piece;
                    t.pre_mm += extra;
                    t.requested_pre_mm += extra;
                    injected = true;
                }
                last_splice = Some(t.printed_mm + purged + t.pre_mm);
            }

            purged += t.purge_mm();
        }

        for i in 0..plan.layers.len() {
            plan.layers[i].purge_mm = plan.layer_purge_mm(LayerId(i));
        }
        injected
    }

    /// Walk runs and transitions in print order and record where every
    /// splice and ping lands.
    fn build_ledger(&self, plan: &TransitionPlan, runs: &Runs) -> SpliceLedger {
        let mut ledger = SpliceLedger {
            tail_waste_mm: self.profile.bowden_length + TAIL_ALLOWANCE,
            loading_offset: self.profile.loading_offset,
            ..Default::default()
        };

        let mut transitions = plan.transitions.iter().peekable();
        let mut consumed = 0.0;
        let mut last_tool = None;

        for (id, run) in runs.iter() {
            consumed += run.e;
            last_tool = Some(run.tool);

            while let Some(t) = transitions.next_if(|t| t.from_run == id) {
                if t.ping {
                    ledger.pings.push(Ping { length: consumed });
                }
                if t.is_tool_change() {
                    ledger.splices.push(Splice {
                        drive: t.from,
                        length: consumed + t.pre_mm,
                        transition_mm: t.requested_mm(),
                        waste_mm: t.purge_mm(),
                    });
                    let pair = SplicePairSetting {
                        incoming: t.to,
                        outgoing: t.from,
                        setting: self.materials.splice_setting(t.to, t.from),
                    };
                    if !ledger
                        .splice_settings
                        .iter()
                        .any(|s| s.incoming == pair.incoming && s.outgoing == pair.outgoing)
                    {
                        ledger.splice_settings.push(pair);
                    }
                }
                consumed += t.purge_mm();
            }
        }

        if let Some(drive) = last_tool {
            ledger.splices.push(Splice {
                drive,
                length: consumed + ledger.tail_waste_mm,
                transition_mm: 0.0,
                waste_mm: ledger.tail_waste_mm,
            });
        }
        ledger
    }
}

fn best_anchor(candidates: &[(f64, PointF)]) -> PointF {
    let mut best = candidates[0];
    for &candidate in &candidates[1..] {
        if candidate.0 > best.0 {
            best = candidate;
        }
    }
    best.1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ColorStrength;

    fn profile() -> PrinterProfile {
        PrinterProfile::new(
            "test",
            BedShape::Rectangular {
                width: 250.0,
                depth: 210.0,
            },
        )
    }

    fn grid(profile: &PrinterProfile) -> BedUsageGrid {
        BedUsageGrid::new(profile.bed)
    }

    fn run(tool: ToolId, z: CoordF, e: f64, offset: usize) -> Run {
        let mut run = Run::new(tool, z, e, offset, offset + 10);
        run.bounds = BoundingBoxF::from_coords(100.0, 80.0, 150.0, 130.0);
        run
    }

    fn three_runs() -> Runs {
        Runs::new(vec![
            run(0, 0.2, 10.0, 0),
            run(1, 0.2, 5.0, 10),
            run(0, 0.4, 8.0, 20),
        ])
    }

    #[test]
    fn test_purge_length_table() {
        let mut profile = profile();
        profile.purge.stabilization_length = 0.0;
        let mut materials = MaterialTable::new();
        materials.set_drive(0, "PLA", "Black", None).unwrap();
        materials.set_drive(1, "PLA", "White", None).unwrap();
        materials.set_drive(2, "PLA", "Purple", Some(ColorStrength::Medium)).unwrap();
        let planner = TransitionPlanner::new(&profile, &materials);

        assert_eq!(planner.purge_length(1, 1, 0.0), 0.0);
        // strong into weak needs the full purge
        assert!((planner.purge_length(0, 1, 0.0) - 130.0).abs() < 1e-9);
        // weak into strong needs the least
        assert!((planner.purge_length(1, 0, 0.0) - (60.0 + 70.0 * 0.2)).abs() < 1e-9);
        assert!((planner.purge_length(2, 3, 0.0) - (60.0 + 70.0 * 0.6)).abs() < 1e-9);
    }

    #[test]
    fn test_purge_length_stabilization() {
        let profile = profile();
        let materials = MaterialTable::new();
        let planner = TransitionPlanner::new(&profile, &materials);

        // medium to medium: 60 + 70 * 0.6 = 102, capped to 100 early on
        assert!((planner.purge_length(0, 1, 100.0) - 100.0).abs() < 1e-9);
        assert!((planner.purge_length(0, 1, 6000.0) - 102.0).abs() < 1e-9);
    }

    #[test]
    fn test_tool_changes_share_a_layer() {
        let profile = profile();
        let materials = MaterialTable::new();
        let planner = TransitionPlanner::new(&profile, &materials);
        let plan = planner.build(&three_runs());

        assert_eq!(plan.layers.len(), 1);
        assert!((plan.layers[0].z - 0.2).abs() < 1e-9);
        assert_eq!(plan.transitions.len(), 2);
        assert_eq!(plan.layers[0].transition_count(), 2);

        let first = &plan.transitions[0];
        assert_eq!((first.from, first.to), (0, 1));
        assert_eq!(first.offset, 10);
        assert_eq!(first.from_run, RunId(0));
        assert_eq!(first.to_run, RunId(1));
        assert!((first.printed_mm - 10.0).abs() < 1e-9);

        let second = &plan.transitions[1];
        assert_eq!((second.from, second.to), (1, 0));
        assert_eq!(second.offset, 20);
        assert!((second.printed_mm - 15.0).abs() < 1e-9);
        assert!((second.mm_from_runs - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_forced_break_on_empty_layer() {
        let profile = profile();
        let materials = MaterialTable::new();
        let planner = TransitionPlanner::new(&profile, &materials);
        let runs = Runs::new(vec![
            run(0, 0.2, 10.0, 0),
            run(0, 0.4, 10.0, 10),
            run(1, 0.4, 10.0, 20),
        ]);
        let plan = planner.build(&runs);

        assert_eq!(plan.layers.len(), 2);
        let forced = &plan.transitions[0];
        assert_eq!((forced.from, forced.to), (0, 0));
        assert!((forced.requested_mm() - 17.7).abs() < 1e-9);
        assert_eq!(forced.layer, LayerId(0));
        assert!((plan.layers[1].height - 0.2).abs() < 1e-9);
        assert!(plan.transitions[1].is_tool_change());
    }

    #[test]
    fn test_trailing_breaks_are_pruned() {
        let profile = profile();
        let materials = MaterialTable::new();
        let planner = TransitionPlanner::new(&profile, &materials);
        let runs = Runs::new(vec![
            run(0, 0.2, 10.0, 0),
            run(1, 0.2, 10.0, 10),
            run(1, 0.4, 10.0, 20),
            run(1, 0.6, 10.0, 30),
        ]);
        let plan = planner.build(&runs);
        assert_eq!(plan.layers.len(), 1);
        assert_eq!(plan.transitions.len(), 1);
    }

    #[test]
    fn test_diversion_conserves_purge() {
        let mut profile = profile();
        profile.purge.in_infill = true;
        profile.purge.in_support = true;
        let materials = MaterialTable::new();
        let planner = TransitionPlanner::new(&profile, &materials);

        let mut outgoing = run(0, 0.2, 100.0, 0);
        outgoing.trailing_infill_mm = 20.0;
        let mut incoming = run(1, 0.2, 100.0, 10);
        incoming.leading_support_mm = 80.0;
        let mut plan = planner.build(&Runs::new(vec![outgoing, incoming]));

        let t = &plan.transitions[0];
        assert!((t.infill_mm - 20.0).abs() < 1e-9);
        assert!((t.support_mm - 50.0).abs() < 1e-9);
        assert!((t.pre_mm - 30.0).abs() < 1e-9);
        assert!(t.post_mm.abs() < 1e-9);
        assert!((t.pre_mm + t.infill_mm - t.requested_pre_mm).abs() < 1e-9);
        assert!((t.post_mm + t.support_mm - t.requested_post_mm).abs() < 1e-9);
        assert!((plan.layers[0].purge_mm - 30.0).abs() < 1e-9);

        // injection reclaims diverted filament first
        let t = &mut plan.transitions[0];
        t.inject(60.0, 0.5);
        assert!(t.infill_mm.abs() < 1e-9);
        assert!((t.support_mm - 10.0).abs() < 1e-9);
        assert!((t.requested_mm() - 100.0).abs() < 1e-9);
        assert!((t.pre_mm + t.infill_mm - t.requested_pre_mm).abs() < 1e-9);
        assert!((t.post_mm + t.support_mm - t.requested_post_mm).abs() < 1e-9);

        t.inject(30.0, 0.5);
        assert!(t.support_mm.abs() < 1e-9);
        assert!((t.requested_mm() - 120.0).abs() < 1e-9);
        assert!((t.pre_mm + t.infill_mm - t.requested_pre_mm).abs() < 1e-9);
        assert!((t.post_mm + t.support_mm - t.requested_post_mm).abs() < 1e-9);
    }

    #[test]
    fn test_ping_lookahead() {
        let profile = profile();
        let materials = MaterialTable::new();
        let planner = TransitionPlanner::new(&profile, &materials);

        let mut plan = TransitionPlan::new();
        let layer = plan.add_layer(0.2, 0.2);
        for printed in [100.0, 340.0, 500.0, 700.0] {
            let id = plan.add_transition(layer, 0, 1, 0.0, 0.0);
            plan.transitions[id.0].printed_mm = printed;
        }
        planner.schedule_pings(&mut plan);

        // 340 undershoots 350 by 10, 500 would overshoot by 150
        let pings: Vec<bool> = plan.transitions.iter().map(|t| t.ping).collect();
        assert_eq!(pings, vec![false, true, false, true]);
    }

    #[test]
    fn test_forced_break_injection_reaches_min_density() {
        let mut profile = profile();
        profile.density.perimeter_threshold = 0.0;
        let materials = MaterialTable::new();
        let planner = TransitionPlanner::new(&profile, &materials);

        let mut plan = TransitionPlan::new();
        let bottom = plan.add_layer(0.2, 0.2);
        plan.add_transition(bottom, 0, 1, 60.0, 60.0);
        let layer = plan.add_layer(0.4, 0.2);
        plan.add_transition(layer, 1, 1, 8.85, 8.85);

        let block = TransitionBlock {
            origin: PointF::new(0.0, 0.0),
            width: 100.0,
            height: 100.0,
        };
        assert!(planner.enforce_layer(&mut plan, layer, &block));

        let l = &plan.layers[layer.0];
        assert!(!l.use_perimeter);
        assert!((l.density - 0.05).abs() < 1e-9);
        assert!(l.density <= 1.0);

        let t = &plan.transitions[1];
        assert!((t.pre_mm + t.infill_mm - t.requested_pre_mm).abs() < 1e-9);
        assert!((t.post_mm + t.support_mm - t.requested_post_mm).abs() < 1e-9);

        // already satisfied
        assert!(!planner.enforce_layer(&mut plan, layer, &block));
    }

    #[test]
    fn test_minimum_first_splice() {
        let profile = profile();
        let materials = MaterialTable::new();
        let planner = TransitionPlanner::new(&profile, &materials);
        let mut plan = planner.build(&three_runs());

        assert!(planner.enforce_transitions(&mut plan));
        let first = &plan.transitions[0];
        // 10 mm printed + pre must reach the first splice minimum
        assert!((first.printed_mm + first.pre_mm - 140.0).abs() < 1e-9);
        assert!(!planner.enforce_transitions(&mut plan));
    }

    #[test]
    fn test_size_block_is_idempotent() {
        let profile = profile();
        let materials = MaterialTable::new();
        let planner = TransitionPlanner::new(&profile, &materials);
        let runs = three_runs();
        let grid = grid(&profile);

        let mut plan = planner.build(&runs);
        planner.schedule_pings(&mut plan);
        let iterations = planner.size_block(&mut plan, &runs, &grid).unwrap();
        assert!(iterations >= 2);
        let block = plan.block.unwrap();

        let again = planner.size_block(&mut plan, &runs, &grid).unwrap();
        assert_eq!(again, 1);
        assert_eq!(plan.block.unwrap(), block);

        for layer in &plan.layers {
            assert!(layer.density <= 1.0 + 1e-9);
            assert!(layer.density >= profile.density.min_bottom - 1e-9);
        }
        assert!(block.width >= MIN_BLOCK_WIDTH);
        assert!((block.height / block.width - GOLDEN_RATIO).abs() < 1e-9);
        assert!(!block.bounds().intersects(&BoundingBoxF::from_coords(100.0, 80.0, 150.0, 130.0)));
    }

    #[test]
    fn test_plan_ledger() {
        let profile = profile();
        let materials = MaterialTable::new();
        let planner = TransitionPlanner::new(&profile, &materials);
        let runs = three_runs();
        let mut grid = grid(&profile);

        let plan = planner.plan(&runs, &mut grid).unwrap();
        let ledger = &plan.ledger;

        assert_eq!(ledger.splices.len(), 3);
        assert_eq!(ledger.splices[0].drive, 0);
        assert_eq!(ledger.splices[1].drive, 1);
        assert_eq!(ledger.splices[2].drive, 0);
        assert!(ledger.splices.windows(2).all(|w| w[0].length < w[1].length));
        assert!(ledger.pings.windows(2).all(|w| w[0].length < w[1].length));
        assert!((ledger.splices[0].length - 140.0).abs() < 1e-6);
        assert!((ledger.tail_waste_mm - (750.0 + TAIL_ALLOWANCE)).abs() < 1e-9);

        let expected = runs.total_e() + plan.total_purge_mm() + ledger.tail_waste_mm;
        assert!((ledger.total_length() - expected).abs() < 1e-6);
        assert_eq!(ledger.splice_settings.len(), 2);

        // the block is reserved on the bed
        let block = plan.block.unwrap();
        let center = block.bounds().center();
        let (cx, cy) = grid.cell_of(center.x, center.y).unwrap();
        assert_eq!(
            grid.occupant(0, cx, cy),
            Some(crate::bed_usage::Occupant::Reserved(BLOCK_TAG))
        );
    }

    #[test]
    fn test_single_tool_has_no_block() {
        let profile = profile();
        let materials = MaterialTable::new();
        let planner = TransitionPlanner::new(&profile, &materials);
        let runs = Runs::new(vec![run(0, 0.2, 10.0, 0), run(0, 0.4, 10.0, 10)]);
        let plan = planner.plan(&runs, &mut grid(&profile)).unwrap();

        assert!(plan.is_empty());
        assert!(plan.block.is_none());
        assert_eq!(plan.ledger.splices.len(), 1);
        assert!((plan.ledger.total_length() - (20.0 + 800.0)).abs() < 1e-9);
    }

    #[test]
    fn test_no_placement() {
        let profile = PrinterProfile::new(
            "tiny",
            BedShape::Rectangular {
                width: 15.0,
                depth: 15.0,
            },
        );
        let materials = MaterialTable::new();
        let planner = TransitionPlanner::new(&profile, &materials);
        let err = planner.plan(&three_runs(), &mut grid(&profile)).unwrap_err();
        assert!(matches!(err, Error::NoPlacement { .. }));
    }

    #[test]
    fn test_sizing_cap() {
        let mut profile = profile();
        profile.max_sizing_iterations = 1;
        let materials = MaterialTable::new();
        let planner = TransitionPlanner::new(&profile, &materials);
        let err = planner.plan(&three_runs(), &mut grid(&profile)).unwrap_err();
        assert!(matches!(err, Error::SizingDidNotConverge(1)));
    }
}
