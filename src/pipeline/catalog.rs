//! Per-stage requirements and quality gates.
//!
//! Built-in defaults cover every working stage; a YAML file may override
//! any subset:
//!
//! ```yaml
//! stages:
//!   content:
//!     requirements: "Write the narration script for the clip."
//!     gate: content_gate
//!     criteria: "Hook in the first 3 seconds; no factual claims without a source."
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::errors::ConfigurationError;
use crate::pipeline::transitions::STAGE_ORDER;
use crate::state::Stage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub requirements: String,
    pub gate: String,
    #[serde(default)]
    pub criteria: String,
}

impl StageSpec {
    pub fn gate_criteria(&self) -> GateCriteria {
        GateCriteria {
            gate: self.gate.clone(),
            criteria: self.criteria.clone(),
        }
    }
}

/// What the critic evaluates an artifact against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateCriteria {
    pub gate: String,
    pub criteria: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageCatalog {
    #[serde(default)]
    stages: BTreeMap<Stage, StageSpec>,
}

impl Default for StageCatalog {
    fn default() -> Self {
        let entries = [
            (
                Stage::Research,
                "Collect source metadata and the key moments worth clipping.",
                "research_gate",
            ),
            (
                Stage::Transcript,
                "Produce a timed transcript of the source with speaker labels.",
                "transcript_gate",
            ),
            (
                Stage::Content,
                "Select clip boundaries and write titles and captions.",
                "content_gate",
            ),
            (
                Stage::Layout,
                "Classify the framing layout and compute crop regions.",
                "layout_gate",
            ),
            (
                Stage::Render,
                "Crop and encode each clip segment.",
                "render_gate",
            ),
            (
                Stage::Assembly,
                "Assemble segments, captions and audio into final clips.",
                "assembly_gate",
            ),
            (
                Stage::Delivery,
                "Package the final clips with their delivery metadata.",
                "delivery_gate",
            ),
        ];
        let stages = entries
            .into_iter()
            .map(|(stage, requirements, gate)| {
                (
                    stage,
                    StageSpec {
                        requirements: requirements.to_string(),
                        gate: gate.to_string(),
                        criteria: String::new(),
                    },
                )
            })
            .collect();
        Self { stages }
    }
}

impl StageCatalog {
    /// Built-in defaults overlaid with the entries from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        let content =
            fs::read_to_string(path).map_err(|source| ConfigurationError::CatalogRead {
                path: path.to_path_buf(),
                source,
            })?;
        let overrides: StageCatalog =
            serde_yaml::from_str(&content).map_err(|source| ConfigurationError::Catalog {
                path: path.to_path_buf(),
                source,
            })?;
        let mut catalog = Self::default();
        catalog.stages.extend(overrides.stages);
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for stage in STAGE_ORDER {
            let spec = self
                .stages
                .get(&stage)
                .ok_or(ConfigurationError::MissingStage(stage))?;
            if spec.gate.trim().is_empty() {
                return Err(ConfigurationError::EmptyGate(stage));
            }
        }
        Ok(())
    }

    pub fn spec(&self, stage: Stage) -> Option<&StageSpec> {
        self.stages.get(&stage)
    }

    pub fn insert(&mut self, stage: Stage, spec: StageSpec) {
        self.stages.insert(stage, spec);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_cover_every_working_stage() {
        let catalog = StageCatalog::default();
        catalog.validate().unwrap();
        assert_eq!(catalog.spec(Stage::Content).unwrap().gate, "content_gate");
        assert!(catalog.spec(Stage::Completed).is_none());
    }

    #[test]
    fn yaml_overrides_merge_onto_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"stages:
  content:
    requirements: "Write the narration script."
    gate: script_gate
    criteria: "Hook within 3 seconds""#
        )
        .unwrap();

        let catalog = StageCatalog::load(file.path()).unwrap();
        let content = catalog.spec(Stage::Content).unwrap();
        assert_eq!(content.gate, "script_gate");
        assert_eq!(content.gate_criteria().criteria, "Hook within 3 seconds");
        assert_eq!(catalog.spec(Stage::Render).unwrap().gate, "render_gate");
    }

    #[test]
    fn empty_gate_is_a_configuration_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"stages:
  layout:
    requirements: "x"
    gate: "  ""#
        )
        .unwrap();
        assert!(matches!(
            StageCatalog::load(file.path()),
            Err(ConfigurationError::EmptyGate(Stage::Layout))
        ));
    }

    #[test]
    fn invalid_yaml_is_reported() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "stages: [broken").unwrap();
        assert!(matches!(
            StageCatalog::load(file.path()),
            Err(ConfigurationError::Catalog { .. })
        ));
    }
}
