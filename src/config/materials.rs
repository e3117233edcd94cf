//! Materials loaded on the splicer drives and how to splice them.

use super::DRIVE_COUNT;
use crate::{Error, Result, ToolId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// How strongly a color shows through the next one.
///
/// Purging from a strong color into a weak one takes the longest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ColorStrength {
    Weak,
    #[default]
    Medium,
    Strong,
}

impl ColorStrength {
    /// Guess the strength of a well-known color name. Unknown colors are medium.
    pub fn from_color_name(color: &str) -> Self {
        const KNOWN: [(&str, ColorStrength); 6] = [
            ("black", ColorStrength::Strong),
            ("yellow", ColorStrength::Weak),
            ("white", ColorStrength::Weak),
            ("transparent", ColorStrength::Weak),
            ("orange", ColorStrength::Medium),
            ("green", ColorStrength::Strong),
        ];

        KNOWN
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(color.trim()))
            .map(|(_, strength)| *strength)
            .unwrap_or_default()
    }

    /// Row/column in the purge factor table.
    pub(crate) fn index(self) -> usize {
        match self {
            ColorStrength::Weak => 0,
            ColorStrength::Medium => 1,
            ColorStrength::Strong => 2,
        }
    }
}

/// Splicer settings for one incoming/outgoing material pair.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SpliceSetting {
    #[serde(default)]
    pub heat_factor: f64,

    #[serde(default)]
    pub compression_factor: f64,

    #[serde(default)]
    pub reverse: bool,
}

/// A material type and its known splice combinations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Material {
    pub name: String,

    /// Material family (PLA, PETG, ...)
    #[serde(rename = "type", default = "default_material_type")]
    pub kind: String,

    /// Splice settings keyed by the outgoing material's name
    #[serde(default)]
    pub combinations: HashMap<String, SpliceSetting>,
}

/// The material loaded on one drive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveAssignment {
    #[serde(default = "default_material_name")]
    pub material: String,

    #[serde(default)]
    pub color: Option<String>,

    /// Explicit strength; inferred from `color` when absent
    #[serde(default)]
    pub strength: Option<ColorStrength>,
}

impl Default for DriveAssignment {
    fn default() -> Self {
        Self {
            material: default_material_name(),
            color: None,
            strength: None,
        }
    }
}

impl DriveAssignment {
    pub fn strength(&self) -> ColorStrength {
        match (self.strength, &self.color) {
            (Some(strength), _) => strength,
            (None, Some(color)) => ColorStrength::from_color_name(color),
            (None, None) => ColorStrength::Medium,
        }
    }
}

/// Materials library plus the current drive assignments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaterialTable {
    #[serde(default)]
    pub materials: Vec<Material>,

    #[serde(default)]
    pub drives: Vec<DriveAssignment>,
}

fn default_material_type() -> String {
    "PLA".to_string()
}

fn default_material_name() -> String {
    "Default PLA".to_string()
}

impl MaterialTable {
    /// A table with every drive holding the default material.
    pub fn new() -> Self {
        Self {
            materials: Vec::new(),
            drives: vec![DriveAssignment::default(); DRIVE_COUNT],
        }
    }

    /// Load a material table from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse a material table from a JSON string. Missing drives get the
    /// default material.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut table: Self = serde_json::from_str(json)?;
        table.validate()?;
        table.drives.resize_with(DRIVE_COUNT, DriveAssignment::default);
        Ok(table)
    }

    /// Validate the table.
    pub fn validate(&self) -> Result<()> {
        if self.drives.len() > DRIVE_COUNT {
            return Err(Error::InvalidProfile(format!(
                "{} drives assigned but the splicer has {}",
                self.drives.len(),
                DRIVE_COUNT
            )));
        }
        for drive in &self.drives {
            if !self.materials.is_empty() && self.find(&drive.material).is_none() {
                return Err(Error::InvalidProfile(format!(
                    "unknown material '{}'",
                    drive.material
                )));
            }
        }
        Ok(())
    }

    /// Assign a material to a drive.
    pub fn set_drive(
        &mut self,
        drive: ToolId,
        material: impl Into<String>,
        color: impl Into<String>,
        strength: Option<ColorStrength>,
    ) -> Result<()> {
        if drive >= DRIVE_COUNT {
            return Err(Error::UnknownTool { tool: drive });
        }
        if self.drives.len() < DRIVE_COUNT {
            self.drives.resize_with(DRIVE_COUNT, DriveAssignment::default);
        }
        self.drives[drive] = DriveAssignment {
            material: material.into(),
            color: Some(color.into()),
            strength,
        };
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<&Material> {
        self.materials.iter().find(|m| m.name == name)
    }

    pub fn drive(&self, drive: ToolId) -> Option<&DriveAssignment> {
        self.drives.get(drive)
    }

    /// Color strength of the material on a drive.
    pub fn strength(&self, drive: ToolId) -> ColorStrength {
        self.drive(drive)
            .map(DriveAssignment::strength)
            .unwrap_or_default()
    }

    /// Splice settings for switching from `outgoing` to `incoming`.
    pub fn splice_setting(&self, incoming: ToolId, outgoing: ToolId) -> SpliceSetting {
        let (Some(inc), Some(out)) = (self.drive(incoming), self.drive(outgoing)) else {
            return SpliceSetting::default();
        };
        self.find(&inc.material)
            .and_then(|m| m.combinations.get(&out.material))
            .copied()
            .unwrap_or_default()
    }
}
