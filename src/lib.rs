//! Splice planning for single-drive multi-material printing.
//!
//! This crate turns a multi-tool G-code program into one that can be printed
//! on a machine whose filament is switched upstream by a splicing device.
//! Every tool change becomes a purge on a dedicated transition block placed
//! next to the model, and the exact filament lengths at which the device must
//! cut and join are recorded in a [`SpliceLedger`](gcode::SpliceLedger).
//!
//! # Pipeline
//!
//! 1. [`bed_usage::BedUsageGrid`] rasterizes every extrusion onto a coarse
//!    per-layer occupancy map of the bed.
//! 2. [`gcode::runs::RunExtractor`] streams the program once and splits it
//!    into per-tool, per-height runs.
//! 3. [`gcode::transition::TransitionPlanner`] decides purge lengths, pings
//!    and splices, then sizes and places the transition block.
//! 4. [`gcode::generator::ToolpathGenerator`] replays the program with the
//!    purge moves inserted.
//!
//! [`gcode::SpliceCoordinator`] wires the stages together.
//!
//! ```rust,ignore
//! use splicer::config::{MaterialTable, PrinterProfile};
//! use splicer::gcode::SpliceCoordinator;
//!
//! let profile = PrinterProfile::from_file("printer.json")?;
//! let materials = MaterialTable::from_file("materials.json")?;
//! let coordinator = SpliceCoordinator::new(profile, materials)?;
//! let output = coordinator.process_file("model.gcode", "model.spliced.gcode")?;
//! println!("{} splices", output.ledger.splices.len());
//! ```

pub mod bed_usage;
pub mod config;
pub mod gcode;
pub mod geometry;

pub use bed_usage::BedUsageGrid;
pub use config::{MaterialTable, PrinterProfile};
pub use gcode::{SpliceCoordinator, SpliceLedger, SpliceOutput};
pub use geometry::{BoundingBoxF, PointF};

/// Floating point coordinate in millimetres.
pub type CoordF = f64;

/// Tool (and drive) index as it appears in `Tn` commands.
pub type ToolId = usize;

/// Errors produced while planning or writing splices.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid profile: {0}")]
    InvalidProfile(String),

    #[error("Tool change to T{tool} before the print start (byte offset {offset})")]
    ToolChangeBeforeStart { tool: ToolId, offset: usize },

    #[error("Tool T{tool} is not served by any drive")]
    UnknownTool { tool: ToolId },

    #[error("Layer height for T{tool} went down from {previous:.3} to {z:.3}")]
    NonMonotonicHeight {
        tool: ToolId,
        z: CoordF,
        previous: CoordF,
    },

    #[error("No room on the bed for a {width:.1} x {height:.1} mm transition block")]
    NoPlacement { width: CoordF, height: CoordF },

    #[error("Transition block sizing did not settle after {0} iterations")]
    SizingDidNotConverge(usize),

    #[error("Transition block layer at z={z:.3} needs density {density:.3} (above 1.0)")]
    DensityOverflow { z: CoordF, density: f64 },
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
