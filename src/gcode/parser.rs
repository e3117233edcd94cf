//! Line-level G-code parsing.
//!
//! # Overview
//!
//! Both passes over the input work on the original text held in memory and
//! address lines by their byte offset. This module provides:
//! - [`lines_with_offsets`] - line iteration with byte offsets
//! - [`Command`] - the handful of commands the planner cares about
//! - [`ExtrusionTracker`] - absolute/relative extrusion bookkeeping
//! - [`Dialect`] - slicer-specific comment markers
//!
//! # Extrusion Tracking
//!
//! The tracker handles:
//! - Absolute extrusion mode (M82) - E values are absolute positions
//! - Relative extrusion mode (M83) - E values are incremental deltas
//! - E resets (G92 E0) - Resets the E position without physical movement

use crate::{CoordF, ToolId};

/// Iterate over the lines of `src` with the byte offset each line starts at.
///
/// Line terminators (`\n` or `\r\n`) are stripped.
pub fn lines_with_offsets(src: &str) -> impl Iterator<Item = (usize, &str)> {
    let mut offset = 0;
    src.split_inclusive('\n').map(move |raw| {
        let start = offset;
        offset += raw.len();
        let line = raw.strip_suffix('\n').unwrap_or(raw);
        let line = line.strip_suffix('\r').unwrap_or(line);
        (start, line)
    })
}

// ============================================================================
// Extrusion Tracking
// ============================================================================

/// Extrusion mode for G-code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtrusionMode {
    /// Absolute extrusion (M82) - E values are absolute positions.
    #[default]
    Absolute,
    /// Relative extrusion (M83) - E values are deltas.
    Relative,
}

/// Tracks extrusion state across a G-code stream.
#[derive(Debug, Clone, Default)]
pub struct ExtrusionTracker {
    mode: ExtrusionMode,
    /// Logical E coordinate as the program sees it.
    e_position: f64,
    /// Net filament consumed (extrusion minus retraction).
    net_extrusion: f64,
}

impl ExtrusionTracker {
    /// Create a new extrusion tracker starting in absolute mode.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> ExtrusionMode {
        self.mode
    }

    /// Set to absolute extrusion mode (M82).
    pub fn set_absolute(&mut self) {
        self.mode = ExtrusionMode::Absolute;
    }

    /// Set to relative extrusion mode (M83).
    pub fn set_relative(&mut self) {
        self.mode = ExtrusionMode::Relative;
    }

    /// Handle an E reset (G92 E<value>).
    pub fn reset_e(&mut self, new_value: f64) {
        self.e_position = new_value;
    }

    /// Process an E value from a move command.
    /// Returns the extrusion delta for this move (positive for extrusion, negative for retraction).
    pub fn process_e(&mut self, e_value: f64) -> f64 {
        let delta = match self.mode {
            ExtrusionMode::Absolute => {
                let delta = e_value - self.e_position;
                self.e_position = e_value;
                delta
            }
            ExtrusionMode::Relative => {
                self.e_position += e_value;
                e_value
            }
        };
        self.net_extrusion += delta;
        delta
    }

    /// Net filament consumed so far.
    pub fn net_extrusion(&self) -> f64 {
        self.net_extrusion
    }

    /// Get the current E position.
    pub fn e_position(&self) -> f64 {
        self.e_position
    }
}

// ============================================================================
// Commands
// ============================================================================

/// A G0/G1 linear move.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GCodeMove {
    /// `G0` rather than `G1`
    pub rapid: bool,
    pub x: Option<CoordF>,
    pub y: Option<CoordF>,
    pub z: Option<CoordF>,
    pub e: Option<f64>,
    pub f: Option<f64>,
}

impl GCodeMove {
    /// Parse a G0/G1 line.
    pub fn parse(line: &str) -> Option<Self> {
        let code = strip_comment(line).trim();
        let mut words = code.split_whitespace();
        let rapid = match words.next()? {
            "G0" | "G00" => true,
            "G1" | "G01" => false,
            _ => return None,
        };

        let mut mov = GCodeMove {
            rapid,
            ..Default::default()
        };
        for (letter, value) in words.filter_map(parse_word) {
            match letter {
                'X' => mov.x = Some(value),
                'Y' => mov.y = Some(value),
                'Z' => mov.z = Some(value),
                'E' => mov.e = Some(value),
                'F' => mov.f = Some(value),
                _ => {}
            }
        }
        Some(mov)
    }

    /// Check if this move has position data.
    pub fn has_position(&self) -> bool {
        self.x.is_some() || self.y.is_some() || self.z.is_some()
    }
}

/// The commands that matter for splice planning.
#[derive(Debug, Clone, PartialEq)]
pub enum Command<'a> {
    /// G0/G1
    Move(GCodeMove),
    /// G92; only the E axis is tracked
    SetPosition { e: Option<f64> },
    /// M82
    AbsoluteExtrusion,
    /// M83
    RelativeExtrusion,
    /// M106
    FanOn,
    /// M107
    FanOff,
    /// Tn
    ToolSelect(ToolId),
    /// G4
    Dwell,
    /// A comment-only line, without the leading `;`
    Comment(&'a str),
    /// Anything else, including blank lines
    Other,
}

impl<'a> Command<'a> {
    /// Classify one line of G-code.
    pub fn parse(line: &'a str) -> Self {
        let trimmed = line.trim_start();
        if let Some(comment) = trimmed.strip_prefix(';') {
            return Command::Comment(comment);
        }

        let code = strip_comment(trimmed);
        let mut words = code.split_whitespace();
        let Some(head) = words.next() else {
            return Command::Other;
        };

        match head {
            "G0" | "G00" | "G1" | "G01" => GCodeMove::parse(code)
                .map(Command::Move)
                .unwrap_or(Command::Other),
            "G92" => Command::SetPosition {
                e: words
                    .filter_map(parse_word)
                    .find(|(letter, _)| *letter == 'E')
                    .map(|(_, value)| value),
            },
            "M82" => Command::AbsoluteExtrusion,
            "M83" => Command::RelativeExtrusion,
            "M106" => Command::FanOn,
            "M107" => Command::FanOff,
            "G4" | "G04" => Command::Dwell,
            _ => parse_tool(head).map(Command::ToolSelect).unwrap_or(Command::Other),
        }
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find(';') {
        Some(i) => &line[..i],
        None => line,
    }
}

fn parse_word(word: &str) -> Option<(char, f64)> {
    let mut chars = word.chars();
    let letter = chars.next()?.to_ascii_uppercase();
    let value = chars.as_str().parse::<f64>().ok().filter(|v| v.is_finite())?;
    Some((letter, value))
}

fn parse_tool(word: &str) -> Option<ToolId> {
    let digits = word.strip_prefix('T')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

// ============================================================================
// Slicer Dialects
// ============================================================================

/// What a stretch of extrusion is for, as announced by the slicer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathKind {
    #[default]
    Normal,
    Infill,
    Support,
    /// Support interface; never used for purge diversion.
    Interface,
}

/// A comment marker understood by a dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// The end of the start-up code.
    PrintStart,
    /// The following moves belong to a new path kind.
    Path(PathKind),
}

/// The slicer that produced the input, selected once from header comments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    Simplify3D,
    PrusaSlicer,
    Cura,
    #[default]
    Generic,
}

/// Number of leading lines searched for a slicer signature.
const HEADER_LINES: usize = 200;

impl Dialect {
    /// Detect the dialect from the header comments of a program.
    pub fn detect(src: &str) -> Self {
        for line in src.lines().take(HEADER_LINES) {
            let Some(comment) = line.trim_start().strip_prefix(';') else {
                continue;
            };
            let comment = comment.trim();
            if comment.contains("Simplify3D") {
                return Dialect::Simplify3D;
            }
            if comment.contains("PrusaSlicer") || comment.contains("Slic3r") {
                return Dialect::PrusaSlicer;
            }
            if comment.contains("Cura") || comment.starts_with("FLAVOR:") {
                return Dialect::Cura;
            }
        }
        Dialect::Generic
    }

    /// Whether the program starts printing without any marker.
    pub fn starts_immediately(&self) -> bool {
        matches!(self, Dialect::Generic)
    }

    /// Interpret a comment (text after the `;`).
    pub fn marker(&self, comment: &str) -> Option<Marker> {
        match self {
            Dialect::Simplify3D => {
                let c = comment.trim();
                if c.starts_with("layer 1,") || c.starts_with("*** Main G-code ***") {
                    return Some(Marker::PrintStart);
                }
                let feature = c.strip_prefix("feature ")?;
                Some(Marker::Path(match feature.trim() {
                    "infill" => PathKind::Infill,
                    "support" => PathKind::Support,
                    "dense support" => PathKind::Interface,
                    _ => PathKind::Normal,
                }))
            }
            Dialect::PrusaSlicer => {
                if comment.starts_with("LAYER_CHANGE") {
                    return Some(Marker::PrintStart);
                }
                let kind = comment.strip_prefix("TYPE:")?;
                Some(Marker::Path(match kind.trim() {
                    "Internal infill" => PathKind::Infill,
                    "Support material" => PathKind::Support,
                    "Support material interface" => PathKind::Interface,
                    _ => PathKind::Normal,
                }))
            }
            Dialect::Cura => {
                if comment.trim() == "LAYER:0" {
                    return Some(Marker::PrintStart);
                }
                let kind = comment.strip_prefix("TYPE:")?;
                Some(Marker::Path(match kind.trim() {
                    "FILL" => PathKind::Infill,
                    "SUPPORT" => PathKind::Support,
                    "SUPPORT-INTERFACE" => PathKind::Interface,
                    _ => PathKind::Normal,
                }))
            }
            Dialect::Generic => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_with_offsets() {
        let src = "G28\r\nG1 X1\n\nT1";
        let lines: Vec<_> = lines_with_offsets(src).collect();
        assert_eq!(lines, vec![(0, "G28"), (5, "G1 X1"), (11, ""), (12, "T1")]);
        assert_eq!(&src[12..], "T1");
    }

    #[test]
    fn test_parse_move() {
        let mov = GCodeMove::parse("G1 X10.5 Y-3 E0.25 F1800 ; perimeter").unwrap();
        assert!(!mov.rapid);
        assert_eq!(mov.x, Some(10.5));
        assert_eq!(mov.y, Some(-3.0));
        assert_eq!(mov.z, None);
        assert_eq!(mov.e, Some(0.25));
        assert_eq!(mov.f, Some(1800.0));
        assert!(mov.has_position());

        let mov = GCodeMove::parse("G0 Z0.3").unwrap();
        assert!(mov.rapid);
        assert_eq!(mov.z, Some(0.3));

        let mov = GCodeMove::parse("G1 Xinf Y1e999 Enan Z0.2").unwrap();
        assert_eq!(mov.x, None);
        assert_eq!(mov.y, None);
        assert_eq!(mov.e, None);
        assert_eq!(mov.z, Some(0.2));

        assert!(GCodeMove::parse("G28").is_none());
        assert!(GCodeMove::parse("G10").is_none());
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("G92 E0"), Command::SetPosition { e: Some(0.0) });
        assert_eq!(Command::parse("G92 X0 Y0"), Command::SetPosition { e: None });
        assert_eq!(Command::parse("M82"), Command::AbsoluteExtrusion);
        assert_eq!(Command::parse("M83 ; relative"), Command::RelativeExtrusion);
        assert_eq!(Command::parse("M106 S255"), Command::FanOn);
        assert_eq!(Command::parse("M107"), Command::FanOff);
        assert_eq!(Command::parse("G4 P500"), Command::Dwell);
        assert_eq!(Command::parse("T3"), Command::ToolSelect(3));
        assert_eq!(Command::parse("T12 ; tool"), Command::ToolSelect(12));
        assert_eq!(Command::parse("TX"), Command::Other);
        assert_eq!(Command::parse("; layer 1, Z = 0.2"), Command::Comment(" layer 1, Z = 0.2"));
        assert_eq!(Command::parse(""), Command::Other);
        assert_eq!(Command::parse("M104 S200"), Command::Other);
    }

    #[test]
    fn test_extrusion_tracker_absolute_mode() {
        let mut tracker = ExtrusionTracker::new();
        assert_eq!(tracker.mode(), ExtrusionMode::Absolute);

        let delta = tracker.process_e(0.5);
        assert!((delta - 0.5).abs() < 1e-6);

        let delta = tracker.process_e(1.8);
        assert!((delta - 1.3).abs() < 1e-6);

        // retraction is negative
        let delta = tracker.process_e(1.0);
        assert!((delta + 0.8).abs() < 1e-6);
        assert!((tracker.net_extrusion() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_extrusion_tracker_relative_mode() {
        let mut tracker = ExtrusionTracker::new();
        tracker.set_relative();

        assert!((tracker.process_e(0.5) - 0.5).abs() < 1e-6);
        assert!((tracker.process_e(-0.2) + 0.2).abs() < 1e-6);
        assert!((tracker.e_position() - 0.3).abs() < 1e-6);
        assert_eq!(tracker.mode(), ExtrusionMode::Relative);
    }

    #[test]
    fn test_extrusion_tracker_reset() {
        let mut tracker = ExtrusionTracker::new();
        tracker.process_e(5.0);
        tracker.reset_e(0.0);

        let delta = tracker.process_e(0.5);
        assert!((delta - 0.5).abs() < 1e-6);
        assert!((tracker.net_extrusion() - 5.5).abs() < 1e-6);
    }

    #[test]
    fn test_dialect_detection() {
        assert_eq!(
            Dialect::detect("; G-Code generated by Simplify3D(R) Version 4.1\nG28\n"),
            Dialect::Simplify3D
        );
        assert_eq!(
            Dialect::detect("; generated by PrusaSlicer 2.6.0\n"),
            Dialect::PrusaSlicer
        );
        assert_eq!(Dialect::detect(";FLAVOR:Marlin\n;Generated with Cura_SteamEngine 5.0\n"), Dialect::Cura);
        assert_eq!(Dialect::detect("G28\nG1 X0\n"), Dialect::Generic);
    }

    #[test]
    fn test_dialect_markers() {
        let s3d = Dialect::Simplify3D;
        assert_eq!(s3d.marker(" layer 1, Z = 0.200"), Some(Marker::PrintStart));
        assert_eq!(s3d.marker(" *** Main G-code ***"), Some(Marker::PrintStart));
        assert_eq!(s3d.marker(" feature infill"), Some(Marker::Path(PathKind::Infill)));
        assert_eq!(s3d.marker(" feature dense support"), Some(Marker::Path(PathKind::Interface)));
        assert_eq!(s3d.marker(" feature outer perimeter"), Some(Marker::Path(PathKind::Normal)));
        assert_eq!(s3d.marker(" layer 2, Z = 0.400"), None);

        let prusa = Dialect::PrusaSlicer;
        assert_eq!(prusa.marker("LAYER_CHANGE"), Some(Marker::PrintStart));
        assert_eq!(prusa.marker("TYPE:Support material"), Some(Marker::Path(PathKind::Support)));
        assert_eq!(prusa.marker("TYPE:Internal infill"), Some(Marker::Path(PathKind::Infill)));
        assert_eq!(prusa.marker("TYPE:Solid infill"), Some(Marker::Path(PathKind::Normal)));

        let cura = Dialect::Cura;
        assert_eq!(cura.marker("LAYER:0"), Some(Marker::PrintStart));
        assert_eq!(cura.marker("LAYER:1"), None);
        assert_eq!(cura.marker("TYPE:SUPPORT-INTERFACE"), Some(Marker::Path(PathKind::Interface)));

        assert!(Dialect::Generic.starts_immediately());
        assert_eq!(Dialect::Generic.marker("TYPE:FILL"), None);
    }
}
