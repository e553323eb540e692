use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::StageType;

/// Outcome of one checklist rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub rule: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Request to re-run one stage with an actionable instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRequest {
    #[serde(alias = "target_stage", alias = "stage_type")]
    pub stage: StageType,
    pub request: String,
}

impl RevisionRequest {
    pub fn new(stage: &str, request: impl Into<String>) -> Self {
        Self {
            stage: stage.to_string(),
            request: request.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Pass,
    Fail,
}

/// Result of evaluating the whole checklist
#[derive(Debug, Clone, Serialize)]
pub struct ChecklistReport {
    pub status: OverallStatus,
    pub items: Vec<ChecklistItem>,
    pub revision_requests: Vec<RevisionRequest>,
}

impl ChecklistReport {
    pub fn failed_items(&self) -> impl Iterator<Item = &ChecklistItem> {
        self.items.iter().filter(|i| !i.passed)
    }
}

/// The critic stage's structured review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticReview {
    /// Overall severity, 0 (clean) to 1 (severe)
    pub severity: f64,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub revision_requests: Vec<RevisionRequest>,
}

impl CriticReview {
    /// Read a review from the critic stage output
    pub fn from_output(output: &Value) -> Option<Self> {
        let mut review: CriticReview = serde_json::from_value(output.clone()).ok()?;
        review.severity = review.severity.clamp(0.0, 1.0);
        Some(review)
    }

    /// Whether the review calls for a targeted revision cycle
    pub fn escalates(&self, threshold: f64) -> bool {
        !self.revision_requests.is_empty() || self.severity >= threshold
    }
}
