//! G-code writer for purge motion on the transition block.
//!
//! A builder in the style of a wipe tower writer: every method appends one
//! command and returns `&mut Self`. Extrusion moves are kept symbolic until
//! [`TowerWriter::finish`] so that their E values can be rescaled to an exact
//! total after the path is known.
//!
//! The writer always emits relative extrusion; the caller is responsible for
//! switching the printer into `M83` first.

use crate::geometry::PointF;
use crate::CoordF;

#[derive(Debug, Clone, PartialEq)]
enum Line {
    Raw(String),
    /// Extruding move; `to` is `None` for extrusion in place
    Extrude { to: Option<PointF>, e: f64 },
}

/// Purge motion builder.
#[derive(Debug, Clone)]
pub struct TowerWriter {
    lines: Vec<Line>,
    pos: PointF,
    z: CoordF,
    feedrate: f64,
}

impl TowerWriter {
    /// Start at `pos`, height `z`.
    pub fn new(pos: PointF, z: CoordF) -> Self {
        Self {
            lines: Vec::new(),
            pos,
            z,
            feedrate: 0.0,
        }
    }

    pub fn pos(&self) -> PointF {
        self.pos
    }

    pub fn z(&self) -> CoordF {
        self.z
    }

    /// Append a comment line.
    pub fn comment(&mut self, text: &str) -> &mut Self {
        self.lines.push(Line::Raw(format!("; {}", text)));
        self
    }

    /// Append a raw command.
    pub fn raw(&mut self, command: impl Into<String>) -> &mut Self {
        self.lines.push(Line::Raw(command.into()));
        self
    }

    /// Set the feed rate (mm/min) if it changed.
    pub fn feedrate(&mut self, f: f64) -> &mut Self {
        if (self.feedrate - f).abs() > 1e-6 {
            self.lines.push(Line::Raw(format!("G1 F{:.0}", f)));
            self.feedrate = f;
        }
        self
    }

    /// Move to `z` without extruding.
    pub fn set_z(&mut self, z: CoordF, f: f64) -> &mut Self {
        self.lines.push(Line::Raw(format!("G1 Z{:.3} F{:.0}", z, f)));
        self.z = z;
        self.feedrate = f;
        self
    }

    /// Travel to a position without extruding.
    pub fn travel(&mut self, to: PointF, f: f64) -> &mut Self {
        self.lines
            .push(Line::Raw(format!("G0 X{:.3} Y{:.3} F{:.0}", to.x, to.y, f)));
        self.pos = to;
        self.feedrate = f;
        self
    }

    /// Extrude `e` mm of filament while moving to `to`.
    pub fn extrude(&mut self, to: PointF, e: f64) -> &mut Self {
        self.lines.push(Line::Extrude { to: Some(to), e });
        self.pos = to;
        self
    }

    /// Extrude `e` mm of filament without moving.
    pub fn extrude_in_place(&mut self, e: f64) -> &mut Self {
        self.lines.push(Line::Extrude { to: None, e });
        self
    }

    /// Pull `length` mm of filament back.
    pub fn retract(&mut self, length: f64, f: f64) -> &mut Self {
        self.lines
            .push(Line::Raw(format!("G1 E{:.5} F{:.0}", -length, f)));
        self.feedrate = f;
        self
    }

    /// Push `length` mm of filament forward after a retraction.
    pub fn unretract(&mut self, length: f64, f: f64) -> &mut Self {
        self.lines
            .push(Line::Raw(format!("G1 E{:.5} F{:.0}", length, f)));
        self.feedrate = f;
        self
    }

    /// Dwell for `ms` milliseconds.
    pub fn dwell(&mut self, ms: u64) -> &mut Self {
        self.lines.push(Line::Raw(format!("G4 P{}", ms)));
        self
    }

    /// Filament recorded by extrusion moves so far.
    pub fn extruded(&self) -> f64 {
        self.lines
            .iter()
            .map(|line| match line {
                Line::Extrude { e, .. } => *e,
                Line::Raw(_) => 0.0,
            })
            .sum()
    }

    /// Scale every recorded extrusion so that they sum to `total`.
    ///
    /// Returns `false` when nothing was extruded and `total` is positive.
    pub fn rescale(&mut self, total: f64) -> bool {
        let recorded = self.extruded();
        if recorded <= 0.0 {
            return total <= 0.0;
        }
        let factor = total / recorded;
        for line in &mut self.lines {
            if let Line::Extrude { e, .. } = line {
                *e *= factor;
            }
        }
        true
    }

    /// Render the accumulated commands, one per line.
    pub fn finish(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Raw(text) => out.push_str(text),
                Line::Extrude { to: Some(to), e } => {
                    out.push_str(&format!("G1 X{:.3} Y{:.3} E{:.5}", to.x, to.y, e))
                }
                Line::Extrude { to: None, e } => out.push_str(&format!("G1 E{:.5}", e)),
            }
            out.push('\n');
        }
        out
    }
}
