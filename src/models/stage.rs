use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::Schema;
use crate::error::PipelineError;

/// Unique key of a pipeline stage (e.g. "ux", "data")
pub type StageType = String;

/// Role a stage plays in the convergence protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageRole {
    /// Ordinary artifact-producing stage
    #[default]
    Content,
    /// Structured self-review of every other stage
    Critic,
    /// Final deliverable composition
    Composition,
}

/// Static description of one pipeline stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDescriptor {
    /// Unique stage key
    pub stage_type: StageType,
    /// Display name
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// Stage-specific instructions given to the backend
    pub prompt_template: String,
    /// Schema the stage output must satisfy
    pub schema: Schema,
    #[serde(default)]
    pub role: StageRole,
}

/// Ordered, immutable list of stages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageCatalogue {
    pub stages: Vec<StageDescriptor>,
}

impl StageCatalogue {
    /// Create a catalogue, checking that it can drive a full run
    pub fn new(stages: Vec<StageDescriptor>) -> Result<Self, PipelineError> {
        let catalogue = Self { stages };
        catalogue.check()?;
        Ok(catalogue)
    }

    /// Load a catalogue from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalogue: {:?}", path))?;
        let catalogue: StageCatalogue =
            serde_json::from_str(&content).context("Failed to parse catalogue JSON")?;
        catalogue.check()?;
        Ok(catalogue)
    }

    fn check(&self) -> Result<(), PipelineError> {
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.stage_type.as_str()) {
                return Err(PipelineError::Catalogue(format!(
                    "duplicate stage type {}",
                    stage.stage_type
                )));
            }
        }

        let critic = self
            .position_of_role(StageRole::Critic)
            .ok_or_else(|| PipelineError::Catalogue("no critic stage".to_string()))?;
        let composition = self
            .position_of_role(StageRole::Composition)
            .ok_or_else(|| PipelineError::Catalogue("no composition stage".to_string()))?;

        if composition != self.stages.len() - 1 {
            return Err(PipelineError::Catalogue(
                "composition stage must be last".to_string(),
            ));
        }
        if critic > composition {
            return Err(PipelineError::Catalogue(
                "critic stage must run before composition".to_string(),
            ));
        }
        let roles = |role| self.stages.iter().filter(|s| s.role == role).count();
        if roles(StageRole::Critic) > 1 || roles(StageRole::Composition) > 1 {
            return Err(PipelineError::Catalogue(
                "only one critic and one composition stage allowed".to_string(),
            ));
        }
        Ok(())
    }

    fn position_of_role(&self, role: StageRole) -> Option<usize> {
        self.stages.iter().position(|s| s.role == role)
    }

    pub fn get(&self, stage_type: &str) -> Option<&StageDescriptor> {
        self.stages.iter().find(|s| s.stage_type == stage_type)
    }

    /// Position of a stage in the fixed order
    pub fn position(&self, stage_type: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.stage_type == stage_type)
    }

    pub fn critic(&self) -> &StageDescriptor {
        // check() guarantees presence
        &self.stages[self.position_of_role(StageRole::Critic).unwrap_or(0)]
    }

    pub fn composition(&self) -> &StageDescriptor {
        &self.stages[self.stages.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(stage_type: &str, role: StageRole) -> StageDescriptor {
        StageDescriptor {
            stage_type: stage_type.to_string(),
            name: stage_type.to_string(),
            description: String::new(),
            prompt_template: String::new(),
            schema: Schema::default(),
            role,
        }
    }

    #[test]
    fn test_catalogue_requires_roles() {
        let result = StageCatalogue::new(vec![stage("a", StageRole::Content)]);
        assert!(matches!(result, Err(PipelineError::Catalogue(_))));
    }

    #[test]
    fn test_catalogue_composition_last() {
        let result = StageCatalogue::new(vec![
            stage("compose", StageRole::Composition),
            stage("critic", StageRole::Critic),
        ]);
        assert!(result.is_err());

        let catalogue = StageCatalogue::new(vec![
            stage("a", StageRole::Content),
            stage("critic", StageRole::Critic),
            stage("compose", StageRole::Composition),
        ])
        .unwrap();
        assert_eq!(catalogue.critic().stage_type, "critic");
        assert_eq!(catalogue.composition().stage_type, "compose");
        assert_eq!(catalogue.position("critic"), Some(1));
    }

    #[test]
    fn test_catalogue_rejects_duplicates() {
        let result = StageCatalogue::new(vec![
            stage("a", StageRole::Content),
            stage("a", StageRole::Critic),
            stage("compose", StageRole::Composition),
        ]);
        assert!(result.is_err());
    }
}
