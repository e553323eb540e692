use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;

use crate::models::{DecisionLedger, DecisionLedgerEntry, ResultSet, StageCatalogue};
use crate::stages::RunReport;

/// Machine-readable deliverable: the composed plan plus the decisions it
/// was composed under
#[derive(Debug, Clone, Serialize)]
pub struct PlanDocument {
    pub project_id: String,
    pub backend: String,
    pub plan: Value,
    pub decisions: Vec<DecisionLedgerEntry>,
}

impl PlanDocument {
    /// Build from a finished run; `None` when nothing was composed
    pub fn from_report(report: &RunReport, catalogue: &StageCatalogue) -> Option<Self> {
        let plan = report
            .output(&catalogue.composition().stage_type)?
            .clone();

        let mut results = ResultSet::new();
        for result in &report.results {
            results.replace(result.clone());
        }
        let decisions = DecisionLedger::fold(&results).entries;

        Some(Self {
            project_id: report.project_id.clone(),
            backend: report.backend.clone(),
            plan,
            decisions,
        })
    }

    /// Write to a JSON file
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create file: {:?}", path))?;
        serde_json::to_writer_pretty(file, self).context("Failed to write JSON")?;
        Ok(())
    }
}

/// Human-readable run summary
pub struct RunSummary<'a> {
    report: &'a RunReport,
    catalogue: &'a StageCatalogue,
}

impl<'a> RunSummary<'a> {
    pub fn new(report: &'a RunReport, catalogue: &'a StageCatalogue) -> Self {
        Self { report, catalogue }
    }

    /// Format the summary as plain text
    pub fn format(&self) -> String {
        let report = self.report;
        let mut output = String::new();

        output.push_str(&format!("Project: {}\n", report.project_id));
        output.push_str(&format!("Backend: {}\n\n", report.backend));

        output.push_str("Stages:\n");
        for stage in &self.catalogue.stages {
            match report.result(&stage.stage_type) {
                Some(result) => {
                    output.push_str(&format!(
                        "  {:<12} {:?} ({} attempt{})\n",
                        stage.stage_type,
                        result.status,
                        result.attempts,
                        if result.attempts == 1 { "" } else { "s" }
                    ));
                    for advisory in &result.advisories {
                        output.push_str(&format!(
                            "    ! {}: {}\n",
                            advisory.rule,
                            advisory.detail.as_deref().unwrap_or("failed")
                        ));
                    }
                }
                None => output.push_str(&format!("  {:<12} not run\n", stage.stage_type)),
            }
        }

        let convergence = &report.convergence;
        let phases: Vec<String> = convergence
            .phases
            .iter()
            .map(|p| format!("{:?}", p))
            .collect();
        output.push_str(&format!("\nConvergence: {}\n", phases.join(" -> ")));
        output.push_str(&format!(
            "Checklist: {:?} ({} failed rule(s))\n",
            convergence.checklist.status,
            convergence.checklist.failed_items().count()
        ));
        for item in convergence.checklist.failed_items() {
            output.push_str(&format!(
                "  - {}: {}\n",
                item.rule,
                item.detail.as_deref().unwrap_or("")
            ));
        }
        if !convergence.auto_fixed.is_empty() {
            output.push_str(&format!("Auto-fixed: {}\n", convergence.auto_fixed.join(", ")));
        }
        if !convergence.revised.is_empty() {
            output.push_str(&format!("Revised: {}\n", convergence.revised.join(", ")));
        }
        match convergence.state.last_severity {
            Some(severity) => output.push_str(&format!("Critic severity: {:.2}\n", severity)),
            None => output.push_str("Critic severity: n/a\n"),
        }
        if !convergence.state.outstanding.is_empty() {
            output.push_str("Outstanding critic requests:\n");
            for request in &convergence.state.outstanding {
                output.push_str(&format!("  - [{}] {}\n", request.stage, request.request));
            }
        }

        output
    }

    /// Write to a text file
    pub fn write_file(&self, path: &Path) -> Result<()> {
        let mut file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create file: {:?}", path))?;
        write!(file, "{}", self.format())?;
        Ok(())
    }
}

/// Write `<project>-plan.json` and `<project>-summary.txt` into a directory.
///
/// Returns the paths written.
pub fn write_deliverables(
    report: &RunReport,
    catalogue: &StageCatalogue,
    dir: &Path,
) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory: {:?}", dir))?;
    let mut written = Vec::new();

    if let Some(plan) = PlanDocument::from_report(report, catalogue) {
        let path = dir.join(format!("{}-plan.json", report.project_id));
        plan.write_json(&path)?;
        written.push(path);
    }

    let path = dir.join(format!("{}-summary.txt", report.project_id));
    RunSummary::new(report, catalogue).write_file(&path)?;
    written.push(path);

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        ChecklistReport, CriticReview, OverallStatus, RevisionRequest, StageResult, StageStatus,
    };
    use crate::stages::{default_catalogue, ConvergencePhase, ConvergenceReport, ConvergenceState};
    use serde_json::json;

    fn completed(stage: &str, output: Value, attempts: u32) -> StageResult {
        let mut result = StageResult::processing("demo", stage);
        result.status = StageStatus::Completed;
        result.output = Some(output);
        result.attempts = attempts;
        result
    }

    fn report() -> RunReport {
        RunReport {
            project_id: "demo".to_string(),
            backend: "scripted".to_string(),
            results: vec![
                completed(
                    "ux",
                    json!({"auth": {"choice": "firebase"}, "decisions": [{"key": "auth", "value": "firebase"}]}),
                    2,
                ),
                completed("composition", json!({"title": "Plan", "summary": "A plan", "sections": []}), 1),
            ],
            convergence: ConvergenceReport {
                phases: vec![
                    ConvergencePhase::FirstPass,
                    ConvergencePhase::AutoFix,
                    ConvergencePhase::CriticReview,
                    ConvergencePhase::Recompose,
                    ConvergencePhase::Done,
                ],
                checklist: ChecklistReport {
                    status: OverallStatus::Pass,
                    items: vec![],
                    revision_requests: vec![],
                },
                auto_fixed: vec![],
                review: Some(CriticReview {
                    severity: 0.2,
                    summary: String::new(),
                    revision_requests: vec![],
                }),
                revised: vec![],
                state: ConvergenceState {
                    iteration: 0,
                    last_severity: Some(0.2),
                    outstanding: vec![RevisionRequest::new("tasks", "split task 3")],
                },
            },
        }
    }

    #[test]
    fn test_plan_document_carries_decisions() {
        let catalogue = default_catalogue().unwrap();
        let plan = PlanDocument::from_report(&report(), &catalogue).unwrap();
        assert_eq!(plan.plan["title"], "Plan");
        assert_eq!(plan.decisions.len(), 1);
        assert_eq!(plan.decisions[0].value, "firebase");
    }

    #[test]
    fn test_summary_lists_stages_and_convergence() {
        let catalogue = default_catalogue().unwrap();
        let report = report();
        let text = RunSummary::new(&report, &catalogue).format();
        assert!(text.contains("ux           Completed (2 attempts)"));
        assert!(text.contains("insights     not run"));
        assert!(text.contains("FirstPass -> AutoFix -> CriticReview -> Recompose -> Done"));
        assert!(text.contains("Critic severity: 0.20"));
        assert!(text.contains("[tasks] split task 3"));
    }

    #[test]
    fn test_write_deliverables() {
        let dir = tempfile::tempdir().unwrap();
        let catalogue = default_catalogue().unwrap();
        let written = write_deliverables(&report(), &catalogue, dir.path()).unwrap();
        assert_eq!(written.len(), 2);
        assert!(dir.path().join("demo-plan.json").exists());
        assert!(dir.path().join("demo-summary.txt").exists());
    }
}
