//! G-code analysis and regeneration.
//!
//! This module holds the splicing pipeline proper:
//!
//! - [`parser`] - line-level parsing, extrusion tracking and slicer dialects
//! - [`runs`] - first pass: per-tool runs of extrusion
//! - [`transition`] - purge planning, block sizing and the splice ledger
//! - [`generator`] - second pass: the rewritten program
//! - [`tower_writer`] - purge motion builder used by the generator
//! - [`multi_material`] - the coordinator running all of the above

pub mod generator;
pub mod multi_material;
pub mod parser;
pub mod runs;
pub mod tower_writer;
pub mod transition;

pub use generator::{FillPattern, GCode, GCodeStats, ToolpathGenerator};
pub use multi_material::{SpliceCoordinator, SpliceOutput};
pub use parser::{Command, Dialect, ExtrusionMode, ExtrusionTracker, PathKind};
pub use runs::{Run, RunExtractor, RunId, Runs};
pub use tower_writer::TowerWriter;
pub use transition::{
    Layer, LayerId, Ping, Splice, SpliceLedger, SplicePairSetting, Transition, TransitionBlock,
    TransitionId, TransitionPlan, TransitionPlanner,
};
