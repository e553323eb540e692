use serde::Serialize;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::models::{
    ChecklistReport, CriticReview, OverallStatus, RevisionRequest, StageCatalogue, StageRole,
    StageType,
};
use crate::stages::{ChecklistEngine, RunSession};

/// Phases of the post-pass protocol, in the only order they can occur
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergencePhase {
    FirstPass,
    AutoFix,
    CriticReview,
    TargetedRerun,
    ReCritic,
    Recompose,
    Done,
}

/// Per-run convergence bookkeeping
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConvergenceState {
    /// Targeted-revision cycles performed (0 or 1)
    pub iteration: u32,
    /// Severity of the most recent critic review
    pub last_severity: Option<f64>,
    /// Requests of the most recent critic review
    pub outstanding: Vec<RevisionRequest>,
}

/// What the controller did during a run
#[derive(Debug, Clone, Serialize)]
pub struct ConvergenceReport {
    pub phases: Vec<ConvergencePhase>,
    pub checklist: ChecklistReport,
    /// Stages re-run by the auto-fix pass
    pub auto_fixed: Vec<StageType>,
    /// Critic review read after the auto-fix pass
    pub review: Option<CriticReview>,
    /// Stages re-run by the targeted revision cycle
    pub revised: Vec<StageType>,
    pub state: ConvergenceState,
}

/// Drives the checklist auto-fix pass, at most one critic revision cycle
/// and the final recomposition
pub struct ConvergenceController<'a> {
    catalogue: &'a StageCatalogue,
    checklist: &'a ChecklistEngine,
    severity_threshold: f64,
}

impl<'a> ConvergenceController<'a> {
    pub fn new(
        catalogue: &'a StageCatalogue,
        checklist: &'a ChecklistEngine,
        severity_threshold: f64,
    ) -> Self {
        Self {
            catalogue,
            checklist,
            severity_threshold,
        }
    }

    /// Run every post-pass phase against a session whose first pass is done
    pub async fn converge(
        &self,
        session: &mut RunSession<'_>,
    ) -> Result<ConvergenceReport, PipelineError> {
        let mut phases = vec![ConvergencePhase::FirstPass];
        let mut state = ConvergenceState::default();

        // AutoFix: a single best-effort pass
        phases.push(ConvergencePhase::AutoFix);
        let checklist = self.checklist.evaluate(session.results());
        if checklist.status == OverallStatus::Fail {
            info!(
                "Checklist: {} rule(s) failed, {} revision request(s)",
                checklist.failed_items().count(),
                checklist.revision_requests.len()
            );
        }
        let mut auto_fixed = Vec::new();
        for (stage_type, requests) in self.group_requests(&checklist.revision_requests) {
            if let Some(stage) = self.catalogue.get(&stage_type) {
                info!("Auto-fix: re-running {}", stage_type);
                session.execute(stage, &requests).await?;
                auto_fixed.push(stage_type);
            }
        }

        // CriticReview
        phases.push(ConvergencePhase::CriticReview);
        let critic = self.catalogue.critic();
        let review = session
            .results()
            .output(&critic.stage_type)
            .and_then(CriticReview::from_output);
        if let Some(review) = &review {
            state.last_severity = Some(review.severity);
            state.outstanding = review.revision_requests.clone();
        } else {
            warn!("Critic output missing or unreadable; skipping revision cycle");
        }

        let mut revised = Vec::new();
        let escalates = review
            .as_ref()
            .is_some_and(|r| r.escalates(self.severity_threshold));
        if escalates {
            state.iteration = 1;

            phases.push(ConvergencePhase::TargetedRerun);
            for (stage_type, requests) in self.group_requests(&state.outstanding) {
                if let Some(stage) = self.catalogue.get(&stage_type) {
                    info!("Targeted rerun: {}", stage_type);
                    session.execute(stage, &requests).await?;
                    revised.push(stage_type);
                }
            }

            phases.push(ConvergencePhase::ReCritic);
            session.execute(critic, &[]).await?;
            if let Some(after) = session
                .results()
                .output(&critic.stage_type)
                .and_then(CriticReview::from_output)
            {
                if after.escalates(self.severity_threshold) {
                    info!(
                        "Critic severity still {:.2} after revision; no further cycle",
                        after.severity
                    );
                }
                state.last_severity = Some(after.severity);
                state.outstanding = after.revision_requests;
            }
        } else {
            info!("Critic review below threshold; skipping revision cycle");
        }

        phases.push(ConvergencePhase::Recompose);
        session.execute(self.catalogue.composition(), &[]).await?;
        phases.push(ConvergencePhase::Done);

        Ok(ConvergenceReport {
            phases,
            checklist,
            auto_fixed,
            review,
            revised,
            state,
        })
    }

    /// Group requests per target stage in first-mention order, dropping
    /// repeated texts.
    ///
    /// Unknown targets and the critic/composition stages are dropped; those
    /// are run by the protocol itself.
    fn group_requests(&self, requests: &[RevisionRequest]) -> Vec<(StageType, Vec<String>)> {
        let mut grouped: Vec<(StageType, Vec<String>)> = Vec::new();
        for request in requests {
            match self.catalogue.get(&request.stage) {
                Some(stage) if stage.role == StageRole::Content => {}
                Some(_) => continue,
                None => {
                    warn!("Ignoring revision request for unknown stage {}", request.stage);
                    continue;
                }
            }
            match grouped.iter_mut().find(|(stage, _)| *stage == request.stage) {
                Some((_, texts)) => {
                    if !texts.contains(&request.request) {
                        texts.push(request.request.clone());
                    }
                }
                None => grouped.push((request.stage.clone(), vec![request.request.clone()])),
            }
        }
        grouped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::{default_catalogue, API, COMPOSITION, CRITIC, DATA, UX};

    #[test]
    fn test_group_requests_first_mention_order() {
        let catalogue = default_catalogue().unwrap();
        let checklist = ChecklistEngine::new();
        let controller = ConvergenceController::new(&catalogue, &checklist, 0.5);

        let grouped = controller.group_requests(&[
            RevisionRequest::new(DATA, "add password_hash"),
            RevisionRequest::new(UX, "drop the wizard"),
            RevisionRequest::new(DATA, "index users.email"),
            RevisionRequest::new(DATA, "add password_hash"),
            RevisionRequest::new(API, "add /login"),
        ]);

        assert_eq!(
            grouped,
            vec![
                (
                    DATA.to_string(),
                    vec!["add password_hash".to_string(), "index users.email".to_string()]
                ),
                (UX.to_string(), vec!["drop the wizard".to_string()]),
                (API.to_string(), vec!["add /login".to_string()]),
            ]
        );
    }

    #[test]
    fn test_group_requests_drops_protocol_and_unknown_stages() {
        let catalogue = default_catalogue().unwrap();
        let checklist = ChecklistEngine::new();
        let controller = ConvergenceController::new(&catalogue, &checklist, 0.5);

        let grouped = controller.group_requests(&[
            RevisionRequest::new(CRITIC, "be harsher"),
            RevisionRequest::new(COMPOSITION, "shorter summary"),
            RevisionRequest::new("marketing", "add a slogan"),
        ]);

        assert!(grouped.is_empty());
    }
}
