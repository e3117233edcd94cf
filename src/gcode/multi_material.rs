//! Multi-material integration module.
//!
//! This module wires the four splicing stages together:
//!
//! 1. Detect the slicer dialect from the header comments
//! 2. Extract per-tool runs, rasterizing the model onto a [`BedUsageGrid`]
//! 3. Plan transitions and size the transition block
//! 4. Regenerate the program with purge motion inserted
//!
//! The coordinator owns nothing but the profile and material table; every
//! call to [`SpliceCoordinator::process`] starts from a fresh grid.

use super::generator::{GCode, ToolpathGenerator};
use super::parser::Dialect;
use super::runs::{RunExtractor, Runs};
use super::transition::{SpliceLedger, TransitionPlan, TransitionPlanner};
use crate::bed_usage::BedUsageGrid;
use crate::config::{MaterialTable, PrinterProfile};
use crate::Result;
use std::path::Path;

/// Everything produced by one splicing pass.
#[derive(Debug, Clone)]
pub struct SpliceOutput {
    /// The rewritten program and its statistics
    pub gcode: GCode,
    /// Splices and pings for the device configuration
    pub ledger: SpliceLedger,
    pub plan: TransitionPlan,
    pub runs: Runs,
    pub dialect: Dialect,
    /// Bed occupancy after the block was reserved
    pub grid: BedUsageGrid,
}

impl SpliceOutput {
    /// Whether the input used more than one tool after the print start.
    pub fn is_multi_material(&self) -> bool {
        !self.plan.is_empty()
    }
}

/// Runs the splicing pipeline for one printer profile and material set.
#[derive(Debug, Clone)]
pub struct SpliceCoordinator {
    profile: PrinterProfile,
    materials: MaterialTable,
    dialect: Option<Dialect>,
}

impl SpliceCoordinator {
    /// Create a coordinator. The profile is validated up front.
    pub fn new(profile: PrinterProfile, materials: MaterialTable) -> Result<Self> {
        profile.validate()?;
        materials.validate()?;
        Ok(Self {
            profile,
            materials,
            dialect: None,
        })
    }

    /// Use a fixed dialect instead of detecting one from the input.
    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = Some(dialect);
        self
    }

    pub fn profile(&self) -> &PrinterProfile {
        &self.profile
    }

    pub fn materials(&self) -> &MaterialTable {
        &self.materials
    }

    /// Splice an in-memory program.
    pub fn process(&self, src: &str) -> Result<SpliceOutput> {
        let dialect = self.dialect.unwrap_or_else(|| Dialect::detect(src));
        log::info!("processing {} bytes of {:?} G-code for '{}'", src.len(), dialect, self.profile.name);

        let mut grid = BedUsageGrid::new(self.profile.bed);
        let runs = RunExtractor::new(dialect, self.profile.max_layer_height).extract(src, &mut grid)?;
        log::info!("{} runs using {:.1} mm of filament", runs.len(), runs.total_e());

        let plan = TransitionPlanner::new(&self.profile, &self.materials).plan(&runs, &mut grid)?;
        let gcode = ToolpathGenerator::new(&self.profile, dialect).generate(src, &runs, &plan);
        let ledger = plan.ledger.clone();

        Ok(SpliceOutput {
            gcode,
            ledger,
            plan,
            runs,
            dialect,
            grid,
        })
    }

    /// Splice a program read from `input`, writing the result to `output`.
    pub fn process_file<P: AsRef<Path>, Q: AsRef<Path>>(&self, input: P, output: Q) -> Result<SpliceOutput> {
        let src = std::fs::read_to_string(input)?;
        let result = self.process(&src)?;
        result.gcode.write_to_file(output)?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BedShape;
    use crate::Error;

    fn coordinator() -> SpliceCoordinator {
        let profile = PrinterProfile::new(
            "test",
            BedShape::Rectangular {
                width: 250.0,
                depth: 210.0,
            },
        );
        SpliceCoordinator::new(profile, MaterialTable::new()).unwrap()
    }

    const PRUSA: &str = "\
; generated by PrusaSlicer 2.6.0
M83
G1 Z0.2 F600
;LAYER_CHANGE
;TYPE:Perimeter
G1 X60 Y60 F6000
G1 X90 Y60 E2
G1 X90 Y90 E2
T1
G1 X60 Y90 E2
G1 X60 Y60 E2
;LAYER_CHANGE
G1 Z0.4
G1 X90 Y60 E2
T0
G1 X90 Y90 E2
";

    #[test]
    fn test_process_detects_dialect() {
        let out = coordinator().process(PRUSA).unwrap();
        assert_eq!(out.dialect, Dialect::PrusaSlicer);
        assert!(out.is_multi_material());
        assert_eq!(out.plan.transitions.len(), 2);
        assert_eq!(out.gcode.stats.transitions, 2);
        assert_eq!(out.ledger.splices.len(), 3);
        assert!(out.plan.block.is_some());
    }

    #[test]
    fn test_single_material_passes_through() {
        let src = "G1 Z0.2\nG1 X10 Y10 E1\nG1 X20 Y10 E2\n";
        let out = coordinator().process(src).unwrap();
        assert!(!out.is_multi_material());
        assert_eq!(out.gcode.content(), src);
        assert_eq!(out.ledger.splices.len(), 1);
    }

    #[test]
    fn test_invalid_profile_rejected() {
        let mut profile = PrinterProfile::new(
            "bad",
            BedShape::Circular { diameter: 200.0 },
        );
        profile.nozzle_diameter = 0.0;
        assert!(matches!(
            SpliceCoordinator::new(profile, MaterialTable::new()),
            Err(Error::InvalidProfile(_))
        ));
    }

    #[test]
    fn test_forced_dialect() {
        // under the generic dialect the first tool change is already in print
        let out = coordinator()
            .with_dialect(Dialect::Generic)
            .process(PRUSA)
            .unwrap();
        assert_eq!(out.dialect, Dialect::Generic);
        assert_eq!(out.plan.transitions.len(), 2);
    }
}
