use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{ChecklistItem, StageType};

/// Lifecycle status of a stage result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Run-level status of a project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Draft,
    Planning,
    Completed,
}

/// Read-only inputs shared by every stage of a run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectContext {
    /// Free-text project description
    pub description: String,
    /// Free-form auxiliary inputs (research snippets, notes)
    #[serde(default)]
    pub auxiliary: Vec<String>,
}

/// Stored project row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: String,
    pub context: ProjectContext,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProjectRecord {
    pub fn new(id: impl Into<String>, context: ProjectContext) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            context,
            status: ProjectStatus::Draft,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Output and metadata of one stage for one project
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub id: Uuid,
    pub project_id: String,
    pub stage_type: StageType,
    pub status: StageStatus,
    /// Validated output; present once completed
    #[serde(default)]
    pub output: Option<Value>,
    /// Identifier of the generation backend that produced the output
    #[serde(default)]
    pub backend: Option<String>,
    pub attempts: u32,
    /// Advisory cross-stage findings recorded at completion
    #[serde(default)]
    pub advisories: Vec<ChecklistItem>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StageResult {
    /// New result row in the `processing` state
    pub fn processing(project_id: &str, stage_type: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id: project_id.to_string(),
            stage_type: stage_type.to_string(),
            status: StageStatus::Processing,
            output: None,
            backend: None,
            attempts: 0,
            advisories: Vec::new(),
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == StageStatus::Completed
    }
}

/// Live stage results of a run, in completion order.
///
/// Holds at most one result per stage type; replacing a stage moves it to
/// the end so the order always reflects when each live result completed.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    results: Vec<StageResult>,
}

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the result for its stage type (last-write-wins)
    pub fn replace(&mut self, result: StageResult) {
        self.results.retain(|r| r.stage_type != result.stage_type);
        self.results.push(result);
    }

    pub fn get(&self, stage_type: &str) -> Option<&StageResult> {
        self.results.iter().find(|r| r.stage_type == stage_type)
    }

    pub fn output(&self, stage_type: &str) -> Option<&Value> {
        self.get(stage_type)
            .filter(|r| r.is_completed())
            .and_then(|r| r.output.as_ref())
    }

    /// Completed results in completion order
    pub fn completed(&self) -> impl Iterator<Item = &StageResult> {
        self.results.iter().filter(|r| r.is_completed())
    }

    pub fn completed_types(&self) -> Vec<StageType> {
        self.completed().map(|r| r.stage_type.clone()).collect()
    }

    /// All results in completion order
    pub fn iter(&self) -> impl Iterator<Item = &StageResult> {
        self.results.iter()
    }

    pub fn into_vec(self) -> Vec<StageResult> {
        self.results
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(stage: &str, output: Value) -> StageResult {
        let mut result = StageResult::processing("p1", stage);
        result.status = StageStatus::Completed;
        result.output = Some(output);
        result
    }

    #[test]
    fn test_replace_is_last_write_wins() {
        let mut set = ResultSet::new();
        set.replace(completed("a", serde_json::json!({"v": 1})));
        set.replace(completed("b", serde_json::json!({"v": 2})));
        set.replace(completed("a", serde_json::json!({"v": 3})));

        assert_eq!(set.len(), 2);
        assert_eq!(set.output("a"), Some(&serde_json::json!({"v": 3})));
        assert_eq!(set.completed_types(), vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_output_ignores_incomplete() {
        let mut set = ResultSet::new();
        set.replace(StageResult::processing("p1", "a"));
        assert!(set.output("a").is_none());
        assert!(set.completed_types().is_empty());
    }
}
