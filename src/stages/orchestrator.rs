use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{error, info};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::io::{LoggingObserver, PipelineStore, ProgressObserver, ProgressReporter};
use crate::llm::{
    AnthropicClient, AnthropicConfig, GenerationBackend, OpenAiClient, OpenAiConfig,
    ScriptedBackend,
};
use crate::models::{ProjectRecord, ProjectStatus, StageCatalogue, StageResult, StageType};
use crate::stages::{ChecklistEngine, ConvergenceController, ConvergenceReport, RunSession, StageRunner};

/// Resolves backend selectors (`anthropic[:model]`, `openai[:model]`,
/// `scripted:<path>`) to generation backends
#[derive(Default)]
pub struct BackendRegistry {
    registered: HashMap<String, Arc<dyn GenerationBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under an exact selector; takes precedence over the
    /// built-in selectors
    pub fn register(mut self, selector: impl Into<String>, backend: Arc<dyn GenerationBackend>) -> Self {
        self.registered.insert(selector.into(), backend);
        self
    }

    pub fn resolve(&self, selector: &str) -> Result<Arc<dyn GenerationBackend>, PipelineError> {
        if let Some(backend) = self.registered.get(selector) {
            return Ok(Arc::clone(backend));
        }

        let (kind, argument) = match selector.split_once(':') {
            Some((kind, argument)) => (kind, Some(argument).filter(|a| !a.is_empty())),
            None => (selector, None),
        };
        let unavailable = |reason: String| PipelineError::BackendUnavailable {
            selector: selector.to_string(),
            reason,
        };

        match kind {
            "anthropic" => {
                let mut config = AnthropicConfig::from_env().map_err(|e| unavailable(e.to_string()))?;
                if let Some(model) = argument {
                    config = config.with_model(model);
                }
                Ok(Arc::new(AnthropicClient::new(config)))
            }
            "openai" => {
                let mut config = OpenAiConfig::from_env().map_err(|e| unavailable(e.to_string()))?;
                if let Some(model) = argument {
                    config = config.with_model(model);
                }
                Ok(Arc::new(OpenAiClient::new(config)))
            }
            "scripted" => {
                let path = argument.ok_or_else(|| unavailable("missing script path".to_string()))?;
                let backend = ScriptedBackend::from_file(Path::new(path))
                    .map_err(|e| unavailable(format!("{:#}", e)))?;
                Ok(Arc::new(backend))
            }
            _ => Err(PipelineError::UnknownBackend(selector.to_string())),
        }
    }
}

/// Outcome of a successful run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub project_id: String,
    pub backend: String,
    /// Final results in completion order
    pub results: Vec<StageResult>,
    pub convergence: ConvergenceReport,
}

impl RunReport {
    pub fn result(&self, stage_type: &str) -> Option<&StageResult> {
        self.results.iter().find(|r| r.stage_type == stage_type)
    }

    pub fn output(&self, stage_type: &str) -> Option<&Value> {
        self.result(stage_type).and_then(|r| r.output.as_ref())
    }
}

/// Sequences the fixed stage list and drives the post-pass phases
pub struct Orchestrator {
    store: Arc<dyn PipelineStore>,
    catalogue: StageCatalogue,
    checklist: ChecklistEngine,
    config: PipelineConfig,
    registry: BackendRegistry,
    observer: Arc<dyn ProgressObserver>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn PipelineStore>, catalogue: StageCatalogue, config: PipelineConfig) -> Self {
        let order: Vec<StageType> = catalogue
            .stages
            .iter()
            .map(|s| s.stage_type.clone())
            .collect();
        Self {
            store,
            checklist: ChecklistEngine::with_default_rules(&order),
            catalogue,
            config,
            registry: BackendRegistry::new(),
            observer: Arc::new(LoggingObserver),
        }
    }

    pub fn with_registry(mut self, registry: BackendRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_checklist(mut self, checklist: ChecklistEngine) -> Self {
        self.checklist = checklist;
        self
    }

    pub fn catalogue(&self) -> &StageCatalogue {
        &self.catalogue
    }

    /// Pipeline entry point: success or the error that aborted the run
    pub async fn trigger(&self, project_id: &str, selector: &str) -> Result<(), PipelineError> {
        self.run(project_id, selector).await.map(|_| ())
    }

    /// Run the whole pipeline for a project.
    ///
    /// On failure the project status is restored to its pre-run value and
    /// the aborting error is returned unchanged.
    pub async fn run(&self, project_id: &str, selector: &str) -> Result<RunReport, PipelineError> {
        let backend = self.registry.resolve(selector)?;
        let project = self
            .store
            .project(project_id)
            .await?
            .ok_or_else(|| PipelineError::ProjectNotFound(project_id.to_string()))?;

        let previous_status = project.status;
        self.store
            .set_project_status(project_id, ProjectStatus::Planning)
            .await?;
        info!(
            "Planning project {} with {} ({} stages)",
            project_id,
            backend.id(),
            self.catalogue.len()
        );

        match self.execute(&project, backend.as_ref()).await {
            Ok(report) => {
                self.store
                    .set_project_status(project_id, ProjectStatus::Completed)
                    .await?;
                info!("Project {} completed", project_id);
                Ok(report)
            }
            Err(err) => {
                error!("Project {} aborted: {}", project_id, err);
                if let Err(restore) = self.store.set_project_status(project_id, previous_status).await {
                    error!("Failed to restore status of {}: {}", project_id, restore);
                }
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        project: &ProjectRecord,
        backend: &dyn GenerationBackend,
    ) -> Result<RunReport, PipelineError> {
        let runner = StageRunner::new(backend, self.store.as_ref(), &self.checklist, &self.config);
        let progress = ProgressReporter::new(self.observer.as_ref(), self.catalogue.len());
        let mut session = RunSession::new(runner, &project.id, &project.context, progress);

        for stage in &self.catalogue.stages {
            session.execute(stage, &[]).await?;
        }

        let controller = ConvergenceController::new(
            &self.catalogue,
            &self.checklist,
            self.config.critic_severity_threshold,
        );
        let convergence = controller.converge(&mut session).await?;
        session.progress().run_finished(session.results());

        Ok(RunReport {
            project_id: project.id.clone(),
            backend: backend.id(),
            results: session.into_results().into_vec(),
            convergence,
        })
    }
}
