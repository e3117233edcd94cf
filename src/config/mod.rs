//! Printer and material configuration.
//!
//! Profiles are plain JSON documents. Every field except the printer name and
//! bed shape has a default, so a minimal profile only describes the bed:
//!
//! ```rust,ignore
//! use splicer::config::PrinterProfile;
//!
//! let profile = PrinterProfile::from_json(r#"{
//!     "name": "i3",
//!     "bed": { "shape": "rectangular", "width": 250, "depth": 210 }
//! }"#)?;
//! assert_eq!(profile.purge.length, 130.0);
//! ```

mod materials;

pub use materials::{ColorStrength, DriveAssignment, Material, MaterialTable, SpliceSetting};

use crate::geometry::{BoundingBoxF, PointF};
use crate::{CoordF, Error, Result};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fs;
use std::path::Path;

/// Number of input drives on the splicing device.
pub const DRIVE_COUNT: usize = 4;

// ============================================================================
// Printer Profile Types
// ============================================================================

/// Shape of the build plate.
///
/// Rectangular beds have their origin in the front-left corner. Circular beds
/// (deltas) have their origin in the middle of the plate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum BedShape {
    Rectangular { width: CoordF, depth: CoordF },
    Circular { diameter: CoordF },
}

impl BedShape {
    /// Extent of the plate along X and Y.
    pub fn extent(&self) -> (CoordF, CoordF) {
        match *self {
            BedShape::Rectangular { width, depth } => (width, depth),
            BedShape::Circular { diameter } => (diameter, diameter),
        }
    }

    /// Offset that maps a G-code coordinate into plate-relative coordinates
    /// starting at zero.
    pub fn origin_offset(&self) -> PointF {
        match *self {
            BedShape::Rectangular { .. } => PointF::zero(),
            BedShape::Circular { diameter } => PointF::new(diameter / 2.0, diameter / 2.0),
        }
    }

    /// Check if a G-code coordinate lies on the plate.
    pub fn contains(&self, x: CoordF, y: CoordF) -> bool {
        match *self {
            BedShape::Rectangular { width, depth } => {
                x >= 0.0 && y >= 0.0 && x <= width && y <= depth
            }
            BedShape::Circular { diameter } => (x * x + y * y).sqrt() <= diameter / 2.0,
        }
    }

    /// The plate bounds in G-code coordinates.
    pub fn bounds(&self) -> BoundingBoxF {
        let (w, d) = self.extent();
        let offset = self.origin_offset();
        BoundingBoxF::from_coords(-offset.x, -offset.y, w - offset.x, d - offset.y)
    }

    pub fn is_circular(&self) -> bool {
        matches!(self, BedShape::Circular { .. })
    }
}

/// How much filament a tool change wastes and where it may go.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeSettings {
    /// Purge length between the weakest and strongest color pair (mm)
    #[serde(default = "default_purge_length")]
    pub length: f64,

    /// Purge length when the incoming color easily covers the outgoing one (mm)
    #[serde(default = "default_min_purge_length")]
    pub min_length: f64,

    /// Purge length cap while the print is still stabilizing (mm)
    #[serde(default = "default_initial_purge_length")]
    pub initial_length: f64,

    /// Fraction of the purge extruded before the splice reaches the nozzle
    #[serde(default = "default_purge_target")]
    pub target: f64,

    /// Filament printed before the regular purge length applies (mm)
    #[serde(default = "default_stabilization_length")]
    pub stabilization_length: f64,

    /// Purge length for a forced same-tool break (mm)
    #[serde(default = "default_break_length")]
    pub break_length: f64,

    /// Divert the start of the purge into the outgoing run's infill
    #[serde(default)]
    pub in_infill: bool,

    /// Divert the end of the purge into the incoming run's support
    #[serde(default)]
    pub in_support: bool,
}

impl Default for PurgeSettings {
    fn default() -> Self {
        Self {
            length: default_purge_length(),
            min_length: default_min_purge_length(),
            initial_length: default_initial_purge_length(),
            target: default_purge_target(),
            stabilization_length: default_stabilization_length(),
            break_length: default_break_length(),
            in_infill: false,
            in_support: false,
        }
    }
}

/// Density limits for the transition block layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DensitySettings {
    /// Minimum fill density of any block layer
    #[serde(default = "default_min_density")]
    pub min: f64,

    /// Minimum fill density of the first block layer
    #[serde(default = "default_min_bottom_density")]
    pub min_bottom: f64,

    /// Layers at or below this density get a perimeter
    #[serde(default = "default_perimeter_threshold")]
    pub perimeter_threshold: f64,
}

impl Default for DensitySettings {
    fn default() -> Self {
        Self {
            min: default_min_density(),
            min_bottom: default_min_bottom_density(),
            perimeter_threshold: default_perimeter_threshold(),
        }
    }
}

/// Calibration checkpoint ("ping") scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingSettings {
    /// Ping interval at the start of the print (mm)
    #[serde(default = "default_initial_ping_interval")]
    pub initial_interval: f64,

    /// Filament printed before the steady interval applies (mm)
    #[serde(default = "default_initial_ping_span")]
    pub initial_span: f64,

    /// Steady ping interval (mm)
    #[serde(default = "default_ping_interval")]
    pub interval: f64,

    /// Grow the interval as the print gets longer
    #[serde(default)]
    pub reduce_pings: bool,

    /// Interval growth per mm printed when `reduce_pings` is set
    #[serde(default = "default_ping_growth")]
    pub growth_rate: f64,

    /// Upper bound on the grown interval (mm)
    #[serde(default = "default_max_ping_interval")]
    pub max_interval: f64,

    /// Pause away from the transition block instead of over it
    #[serde(default)]
    pub off_tower: bool,

    /// Minimum purge on a pinging transition (mm)
    #[serde(default = "default_min_ping_purge")]
    pub min_purge: f64,

    /// Filament extruded between the two pauses of a ping (mm)
    #[serde(default = "default_ping_purge_between_pauses")]
    pub purge_between_pauses: f64,

    /// Length of each pause (ms)
    #[serde(default = "default_ping_pause_ms")]
    pub pause_ms: u64,
}

impl Default for PingSettings {
    fn default() -> Self {
        Self {
            initial_interval: default_initial_ping_interval(),
            initial_span: default_initial_ping_span(),
            interval: default_ping_interval(),
            reduce_pings: false,
            growth_rate: default_ping_growth(),
            max_interval: default_max_ping_interval(),
            off_tower: false,
            min_purge: default_min_ping_purge(),
            purge_between_pauses: default_ping_purge_between_pauses(),
            pause_ms: default_ping_pause_ms(),
        }
    }
}

impl PingSettings {
    /// Filament between pings once `printed` mm have been consumed.
    pub fn threshold(&self, printed: f64) -> f64 {
        if printed < self.initial_span {
            self.initial_interval
        } else if self.reduce_pings {
            let grown = self.interval + (printed - self.initial_span) * self.growth_rate;
            grown.min(self.max_interval.max(self.interval))
        } else {
            self.interval
        }
    }
}

/// Shortest pieces the splicer can produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpliceLimits {
    /// Minimum piece length (mm)
    #[serde(default = "default_min_splice_length")]
    pub min_length: f64,

    /// Minimum length of the very first piece (mm)
    #[serde(default = "default_min_first_splice_length")]
    pub min_first_length: f64,
}

impl Default for SpliceLimits {
    fn default() -> Self {
        Self {
            min_length: default_min_splice_length(),
            min_first_length: default_min_first_splice_length(),
        }
    }
}

/// Motion parameters used for the synthesized purge moves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionSettings {
    /// Purge extrusion feed rate (mm/min)
    #[serde(default = "default_print_speed")]
    pub print_speed: f64,

    /// Travel feed rate (mm/min)
    #[serde(default = "default_travel_speed")]
    pub travel_speed: f64,

    /// Feed rate multiplier for the block perimeter
    #[serde(default = "default_perimeter_speed_multiplier")]
    pub perimeter_speed_multiplier: f64,

    /// Retraction length (mm)
    #[serde(default = "default_retract_length")]
    pub retract_length: f64,

    /// Retraction feed rate (mm/min)
    #[serde(default = "default_retract_speed")]
    pub retract_speed: f64,

    /// Z lift while travelling to and from the block (mm)
    #[serde(default = "default_z_hop")]
    pub z_hop: f64,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            print_speed: default_print_speed(),
            travel_speed: default_travel_speed(),
            perimeter_speed_multiplier: default_perimeter_speed_multiplier(),
            retract_length: default_retract_length(),
            retract_speed: default_retract_speed(),
            z_hop: default_z_hop(),
        }
    }
}

/// A printer paired with a splicing device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterProfile {
    /// Human-readable printer name
    pub name: String,

    /// Build plate shape and size
    pub bed: BedShape,

    /// Nozzle diameter (mm)
    #[serde(default = "default_nozzle_diameter")]
    pub nozzle_diameter: f64,

    /// Filament diameter (mm)
    #[serde(default = "default_filament_diameter")]
    pub filament_diameter: f64,

    /// Largest layer height the slicer may produce (mm)
    #[serde(default = "default_max_layer_height")]
    pub max_layer_height: f64,

    /// Filament between the splicer and the nozzle (mm)
    #[serde(default = "default_bowden_length")]
    pub bowden_length: f64,

    /// Device loading offset, passed through to the device configuration
    #[serde(default = "default_loading_offset")]
    pub loading_offset: u32,

    #[serde(default)]
    pub purge: PurgeSettings,

    #[serde(default)]
    pub density: DensitySettings,

    #[serde(default)]
    pub ping: PingSettings,

    #[serde(default)]
    pub splice: SpliceLimits,

    #[serde(default)]
    pub motion: MotionSettings,

    /// Cap on the transition block sizing loop
    #[serde(default = "default_max_sizing_iterations")]
    pub max_sizing_iterations: usize,
}

// ============================================================================
// Default Value Functions
// ============================================================================

fn default_nozzle_diameter() -> f64 {
    0.4
}

fn default_filament_diameter() -> f64 {
    1.75
}

fn default_max_layer_height() -> f64 {
    0.3
}

fn default_bowden_length() -> f64 {
    750.0
}

fn default_loading_offset() -> u32 {
    25_000
}

fn default_purge_length() -> f64 {
    130.0
}

fn default_min_purge_length() -> f64 {
    60.0
}

fn default_initial_purge_length() -> f64 {
    100.0
}

fn default_purge_target() -> f64 {
    0.5
}

fn default_stabilization_length() -> f64 {
    5000.0
}

fn default_break_length() -> f64 {
    17.7
}

fn default_min_density() -> f64 {
    0.05
}

fn default_min_bottom_density() -> f64 {
    0.4
}

fn default_perimeter_threshold() -> f64 {
    0.25
}

fn default_initial_ping_interval() -> f64 {
    350.0
}

fn default_initial_ping_span() -> f64 {
    3000.0
}

fn default_ping_interval() -> f64 {
    425.0
}

fn default_ping_growth() -> f64 {
    0.02
}

fn default_max_ping_interval() -> f64 {
    1500.0
}

fn default_min_ping_purge() -> f64 {
    20.0
}

fn default_ping_purge_between_pauses() -> f64 {
    10.0
}

fn default_ping_pause_ms() -> u64 {
    7000
}

fn default_min_splice_length() -> f64 {
    80.0
}

fn default_min_first_splice_length() -> f64 {
    140.0
}

fn default_print_speed() -> f64 {
    2400.0
}

fn default_travel_speed() -> f64 {
    9000.0
}

fn default_perimeter_speed_multiplier() -> f64 {
    0.5
}

fn default_retract_length() -> f64 {
    1.0
}

fn default_retract_speed() -> f64 {
    2100.0
}

fn default_z_hop() -> f64 {
    0.4
}

fn default_max_sizing_iterations() -> usize {
    50
}

// ============================================================================
// Profile Loading
// ============================================================================

impl PrinterProfile {
    /// Create a profile with default settings for the given bed.
    pub fn new(name: impl Into<String>, bed: BedShape) -> Self {
        Self {
            name: name.into(),
            bed,
            nozzle_diameter: default_nozzle_diameter(),
            filament_diameter: default_filament_diameter(),
            max_layer_height: default_max_layer_height(),
            bowden_length: default_bowden_length(),
            loading_offset: default_loading_offset(),
            purge: PurgeSettings::default(),
            density: DensitySettings::default(),
            ping: PingSettings::default(),
            splice: SpliceLimits::default(),
            motion: MotionSettings::default(),
            max_sizing_iterations: default_max_sizing_iterations(),
        }
    }

    /// Load a printer profile from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse a printer profile from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let profile: Self = serde_json::from_str(json)?;
        profile.validate()?;
        Ok(profile)
    }

    /// Validate the profile.
    pub fn validate(&self) -> Result<()> {
        let (w, d) = self.bed.extent();
        if w <= 0.0 || d <= 0.0 {
            return Err(Error::InvalidProfile(
                "bed dimensions must be positive".to_string(),
            ));
        }
        if self.nozzle_diameter <= 0.0 || self.filament_diameter <= 0.0 {
            return Err(Error::InvalidProfile(
                "nozzle and filament diameters must be positive".to_string(),
            ));
        }
        if self.max_layer_height <= 0.0 {
            return Err(Error::InvalidProfile(
                "max layer height must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.purge.target) {
            return Err(Error::InvalidProfile(format!(
                "purge target {} must be between 0 and 1",
                self.purge.target
            )));
        }
        if self.purge.min_length < 0.0 || self.purge.min_length > self.purge.length {
            return Err(Error::InvalidProfile(
                "min purge length must be between 0 and the purge length".to_string(),
            ));
        }
        let density = &self.density;
        for (name, value) in [
            ("min density", density.min),
            ("min bottom density", density.min_bottom),
            ("perimeter threshold", density.perimeter_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::InvalidProfile(format!(
                    "{} {} must be between 0 and 1",
                    name, value
                )));
            }
        }
        if self.ping.initial_interval <= 0.0 || self.ping.interval <= 0.0 {
            return Err(Error::InvalidProfile(
                "ping intervals must be positive".to_string(),
            ));
        }
        if self.ping.purge_between_pauses > self.ping.min_purge {
            return Err(Error::InvalidProfile(
                "ping purge between pauses exceeds the minimum ping purge".to_string(),
            ));
        }
        if self.max_sizing_iterations == 0 {
            return Err(Error::InvalidProfile(
                "max sizing iterations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Cross-section of the filament (mm²).
    pub fn filament_area(&self) -> f64 {
        let r = self.filament_diameter / 2.0;
        PI * r * r
    }

    /// Volume of a length of filament (mm³).
    pub fn length_to_volume(&self, length: f64) -> f64 {
        length * self.filament_area()
    }

    /// Length of filament holding a volume (mm).
    pub fn volume_to_length(&self, volume: f64) -> f64 {
        volume / self.filament_area()
    }

    /// Filament needed to lay a nozzle-wide bead of the given length.
    pub fn bead_extrusion(&self, length: f64, layer_height: f64) -> f64 {
        self.volume_to_length(length * self.nozzle_diameter * layer_height)
    }
}
