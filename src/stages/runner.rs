use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, TransportFailure};
use crate::io::{PipelineStore, ProgressReporter};
use crate::llm::{
    build_repair_messages, build_stage_messages, parse_generated_json, validate_output,
    ChatMessage, GenerationBackend, GenerationRequest, GenerationResponse, StageInput,
};
use crate::models::{
    ChecklistItem, DecisionLedger, ProjectContext, ResultSet, Schema, StageDescriptor,
    StageResult, StageStatus, ValidationIssue,
};
use crate::stages::ChecklistEngine;

/// State of one generation attempt
#[derive(Debug)]
pub enum AttemptOutcome {
    /// JSON recovered, not yet validated
    Parsed(Value),
    /// No JSON could be recovered
    ParseFailed(PipelineError),
    /// JSON recovered but violates the schema
    Invalid {
        value: Value,
        errors: Vec<ValidationIssue>,
    },
    /// JSON recovered and satisfies the schema
    Valid(Value),
}

impl AttemptOutcome {
    /// Parse raw generated text
    pub fn parse(raw: &str) -> Self {
        match parse_generated_json(raw) {
            Ok(value) => AttemptOutcome::Parsed(value),
            Err(err) => AttemptOutcome::ParseFailed(err),
        }
    }

    /// Advance a parsed outcome through validation; other states are final
    pub fn check(self, schema: &Schema) -> Self {
        match self {
            AttemptOutcome::Parsed(value) => {
                let validation = validate_output(&value, schema);
                if validation.is_valid {
                    AttemptOutcome::Valid(value)
                } else {
                    AttemptOutcome::Invalid {
                        value,
                        errors: validation.errors,
                    }
                }
            }
            other => other,
        }
    }

    /// Parse then validate
    pub fn evaluate(raw: &str, schema: &Schema) -> Self {
        Self::parse(raw).check(schema)
    }
}

/// One request to execute a stage
#[derive(Debug, Clone, Copy)]
pub struct StageInvocation<'a> {
    pub stage: &'a StageDescriptor,
    pub project_id: &'a str,
    pub context: &'a ProjectContext,
    /// Current results of the run (prior artifacts)
    pub prior: &'a ResultSet,
    /// Revision requests to address; empty on a first pass
    pub revisions: &'a [String],
}

/// Executes one stage end-to-end: prompt, generate, parse, validate,
/// repair, persist
pub struct StageRunner<'a> {
    backend: &'a dyn GenerationBackend,
    store: &'a dyn PipelineStore,
    checklist: &'a ChecklistEngine,
    config: &'a PipelineConfig,
}

impl<'a> StageRunner<'a> {
    pub fn new(
        backend: &'a dyn GenerationBackend,
        store: &'a dyn PipelineStore,
        checklist: &'a ChecklistEngine,
        config: &'a PipelineConfig,
    ) -> Self {
        Self {
            backend,
            store,
            checklist,
            config,
        }
    }

    /// Run a stage and persist every status transition.
    ///
    /// Fails with `ExhaustedRetries` when the attempt budget is spent; the
    /// persisted row is then marked `failed`.
    pub async fn run(&self, invocation: StageInvocation<'_>) -> Result<StageResult, PipelineError> {
        let stage = invocation.stage;
        let mut result = StageResult::processing(invocation.project_id, &stage.stage_type);
        self.store.insert_result(&result).await?;

        info!("Stage {}: processing", stage.stage_type);

        match self.generate_valid_output(&invocation).await {
            Ok((output, attempts, backend)) => {
                result.advisories = self.side_checks(&invocation, &result, &output);
                result.status = StageStatus::Completed;
                result.output = Some(output);
                result.attempts = attempts;
                result.backend = Some(backend);
                result.completed_at = Some(Utc::now());
                self.store.update_result(&result).await?;

                info!(
                    "Stage {}: completed in {} attempt(s)",
                    stage.stage_type, attempts
                );
                Ok(result)
            }
            Err(err) => {
                if let PipelineError::ExhaustedRetries { attempts, .. } = &err {
                    result.attempts = *attempts;
                }
                result.status = StageStatus::Failed;
                result.error = Some(err.to_string());
                result.backend = Some(self.backend.id());
                self.store.update_result(&result).await?;

                warn!("Stage {}: failed: {}", stage.stage_type, err);
                Err(err)
            }
        }
    }

    /// The attempt loop. Returns (output, attempts used, backend id).
    async fn generate_valid_output(
        &self,
        invocation: &StageInvocation<'_>,
    ) -> Result<(Value, u32, String), PipelineError> {
        let stage = invocation.stage;
        let messages = self.stage_messages(invocation);
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_failure = None;

        for attempt in 1..=max_attempts {
            let response = self
                .generate(stage, attempt, &messages, self.config.temperature)
                .await?;

            let mut outcome = AttemptOutcome::parse(&response.text);
            loop {
                match outcome {
                    AttemptOutcome::Parsed(value) => {
                        outcome = AttemptOutcome::Parsed(value).check(&stage.schema);
                    }
                    AttemptOutcome::Valid(value) => {
                        return Ok((value, attempt, response.backend));
                    }
                    AttemptOutcome::ParseFailed(err) => {
                        warn!(
                            "Stage {} attempt {}: unparseable output: {}",
                            stage.stage_type, attempt, err
                        );
                        last_failure = Some(err);
                        break;
                    }
                    AttemptOutcome::Invalid { errors, .. } => {
                        warn!(
                            "Stage {} attempt {}: {} schema error(s)",
                            stage.stage_type,
                            attempt,
                            errors.len()
                        );
                        if attempt == max_attempts {
                            last_failure = Some(PipelineError::SchemaViolation {
                                stage: stage.stage_type.clone(),
                                errors,
                            });
                            break;
                        }

                        let repair = self
                            .repair(stage, attempt, &response.text, &errors)
                            .await?;
                        match repair {
                            AttemptOutcome::Valid(value) => {
                                info!(
                                    "Stage {} attempt {}: repair succeeded",
                                    stage.stage_type, attempt
                                );
                                return Ok((value, attempt, response.backend));
                            }
                            AttemptOutcome::Invalid { errors, .. } => {
                                last_failure = Some(PipelineError::SchemaViolation {
                                    stage: stage.stage_type.clone(),
                                    errors,
                                });
                            }
                            AttemptOutcome::ParseFailed(err) => last_failure = Some(err),
                            AttemptOutcome::Parsed(_) => {}
                        }
                        break;
                    }
                }
            }
        }

        Err(PipelineError::ExhaustedRetries {
            stage: stage.stage_type.clone(),
            attempts: max_attempts,
            cause: Box::new(last_failure.unwrap_or_else(|| PipelineError::MalformedOutput {
                preview: String::new(),
            })),
        })
    }

    /// One repair call: prior raw output plus the validation errors, at the
    /// lower repair temperature
    async fn repair(
        &self,
        stage: &StageDescriptor,
        attempt: u32,
        raw_output: &str,
        errors: &[ValidationIssue],
    ) -> Result<AttemptOutcome, PipelineError> {
        debug!("Stage {} attempt {}: issuing repair call", stage.stage_type, attempt);
        let messages = build_repair_messages(stage, raw_output, errors);
        let response = self
            .generate(stage, attempt, &messages, self.config.repair_temperature)
            .await?;
        Ok(AttemptOutcome::evaluate(&response.text, &stage.schema))
    }

    /// Call the backend with a timeout, backing off on transport failures.
    ///
    /// Retries stay within the same attempt slot; exhausting them fails the
    /// stage.
    async fn generate(
        &self,
        stage: &StageDescriptor,
        attempt: u32,
        messages: &[ChatMessage],
        temperature: f64,
    ) -> Result<GenerationResponse, PipelineError> {
        let request = GenerationRequest {
            messages: messages.to_vec(),
            temperature,
            top_p: self.config.top_p,
            max_tokens: self.config.max_tokens,
            timeout: self.config.request_timeout,
        };

        let mut retry = 0;
        loop {
            let result = match tokio::time::timeout(
                self.config.request_timeout,
                self.backend.generate(&request),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(TransportFailure::Timeout(self.config.request_timeout)),
            };

            let failure = match result {
                Ok(response) => return Ok(response),
                Err(failure) => failure,
            };

            if retry >= self.config.retry.max_retries {
                return Err(PipelineError::ExhaustedRetries {
                    stage: stage.stage_type.clone(),
                    attempts: attempt,
                    cause: Box::new(PipelineError::Transport(failure)),
                });
            }

            let delay = self.config.retry.delay(retry);
            warn!(
                "Stage {} attempt {}: {} (retrying in {:?})",
                stage.stage_type, attempt, failure, delay
            );
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }

    fn stage_messages(&self, invocation: &StageInvocation<'_>) -> Vec<ChatMessage> {
        let stage = invocation.stage;
        let ledger = DecisionLedger::fold(invocation.prior);

        let mut artifacts = Map::new();
        for result in invocation.prior.completed() {
            if result.stage_type == stage.stage_type {
                continue;
            }
            if let Some(output) = &result.output {
                artifacts.insert(result.stage_type.clone(), output.clone());
            }
        }

        let input = StageInput {
            project: invocation.context,
            artifacts,
            decisions: &ledger,
        };
        let previous = invocation.prior.output(&stage.stage_type);
        build_stage_messages(stage, &input, previous, invocation.revisions)
    }

    /// Advisory cross-stage checks against prior results; never blocking
    fn side_checks(
        &self,
        invocation: &StageInvocation<'_>,
        result: &StageResult,
        output: &Value,
    ) -> Vec<ChecklistItem> {
        let mut snapshot = invocation.prior.clone();
        let mut candidate = result.clone();
        candidate.status = StageStatus::Completed;
        candidate.output = Some(output.clone());
        snapshot.replace(candidate);

        let failures: Vec<_> = self
            .checklist
            .side_check(&invocation.stage.stage_type, &snapshot)
            .into_iter()
            .filter(|item| !item.passed)
            .collect();

        for item in &failures {
            warn!(
                "Stage {}: advisory check {} failed: {}",
                invocation.stage.stage_type,
                item.rule,
                item.detail.as_deref().unwrap_or("")
            );
        }
        failures
    }
}

/// Live state of one pipeline run.
///
/// The session is the only writer of the run's results; every stage
/// execution replaces the result for its stage type and reports progress.
pub struct RunSession<'a> {
    runner: StageRunner<'a>,
    project_id: &'a str,
    context: &'a ProjectContext,
    progress: ProgressReporter<'a>,
    results: ResultSet,
}

impl<'a> RunSession<'a> {
    pub fn new(
        runner: StageRunner<'a>,
        project_id: &'a str,
        context: &'a ProjectContext,
        progress: ProgressReporter<'a>,
    ) -> Self {
        Self {
            runner,
            project_id,
            context,
            progress,
            results: ResultSet::new(),
        }
    }

    /// Run one stage against the current results and fold its result in
    pub async fn execute(
        &mut self,
        stage: &StageDescriptor,
        revisions: &[String],
    ) -> Result<(), PipelineError> {
        self.progress.stage_started(&stage.stage_type, &self.results);

        let invocation = StageInvocation {
            stage,
            project_id: self.project_id,
            context: self.context,
            prior: &self.results,
            revisions,
        };

        match self.runner.run(invocation).await {
            Ok(result) => {
                self.results.replace(result);
                self.progress
                    .stage_completed(&stage.stage_type, &self.results);
                Ok(())
            }
            Err(err) => {
                self.progress
                    .stage_failed(&stage.stage_type, &self.results, &err.to_string());
                Err(err)
            }
        }
    }

    pub fn results(&self) -> &ResultSet {
        &self.results
    }

    pub fn progress(&self) -> &ProgressReporter<'a> {
        &self.progress
    }

    pub fn into_results(self) -> ResultSet {
        self.results
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::io::MemoryStore;
    use crate::llm::{stage_marker, RetryPolicy, ScriptedBackend, ScriptedReply};
    use crate::models::{ProjectRecord, StageRole};

    const PROJECT: &str = "p1";

    fn stage(stage_type: &str) -> StageDescriptor {
        StageDescriptor {
            stage_type: stage_type.to_string(),
            name: stage_type.to_uppercase(),
            description: "test stage".to_string(),
            prompt_template: "Name the thing.".to_string(),
            schema: Schema::from_value(json!({
                "type": "object",
                "properties": {"name": {"type": "string"}},
                "required": ["name"]
            }))
            .unwrap(),
            role: StageRole::Content,
        }
    }

    fn context() -> ProjectContext {
        ProjectContext {
            description: "A recipe sharing app".to_string(),
            auxiliary: vec![],
        }
    }

    async fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .insert_project(&ProjectRecord::new(PROJECT, context()))
            .await
            .unwrap();
        store
    }

    fn config() -> PipelineConfig {
        PipelineConfig::default().with_retry(RetryPolicy::immediate(4))
    }

    async fn run_stage(
        backend: &dyn GenerationBackend,
        store: &MemoryStore,
        config: &PipelineConfig,
        stage: &StageDescriptor,
        prior: &ResultSet,
    ) -> Result<StageResult, PipelineError> {
        let checklist = ChecklistEngine::new();
        let runner = StageRunner::new(backend, store, &checklist, config);
        let context = context();
        runner
            .run(StageInvocation {
                stage,
                project_id: PROJECT,
                context: &context,
                prior,
                revisions: &[],
            })
            .await
    }

    fn completed(stage_type: &str, output: Value) -> StageResult {
        let mut result = StageResult::processing(PROJECT, stage_type);
        result.status = StageStatus::Completed;
        result.output = Some(output);
        result
    }

    /// The context JSON embedded in a stage prompt
    fn prompt_context(request: &GenerationRequest) -> Value {
        let prompt = &request.messages[1].content;
        let start = prompt.find("## Context\n").unwrap() + "## Context\n".len();
        let end = prompt.find("\n\n## Output Schema").unwrap();
        serde_json::from_str(&prompt[start..end]).unwrap()
    }

    #[tokio::test]
    async fn test_valid_first_call_completes_in_one_attempt() {
        let backend = ScriptedBackend::new();
        backend.push_for_stage("a", ScriptedReply::json(&json!({"name": "Basil"})));
        let store = store().await;

        let result = run_stage(&backend, &store, &config(), &stage("a"), &ResultSet::new())
            .await
            .unwrap();

        assert_eq!(result.status, StageStatus::Completed);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.output, Some(json!({"name": "Basil"})));
        assert_eq!(result.backend.as_deref(), Some("scripted"));
        assert_eq!(backend.call_count(), 1);
        assert!(
            backend
                .requests()
                .iter()
                .all(|r| !stage_marker(r).unwrap().repair)
        );

        let stored = store.result(result.id).unwrap();
        assert_eq!(stored.status, StageStatus::Completed);
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_missing_property_drives_one_repair_call() {
        let backend = ScriptedBackend::new();
        backend.push_for_stage("a", ScriptedReply::Text("{}".to_string()));
        backend.push_for_stage("a", ScriptedReply::json(&json!({"name": "Basil"})));
        let store = store().await;
        let config = config();

        let result = run_stage(&backend, &store, &config, &stage("a"), &ResultSet::new())
            .await
            .unwrap();

        assert_eq!(result.attempts, 1);
        let requests = backend.requests();
        assert_eq!(requests.len(), 2);

        let repair = &requests[1];
        assert!(stage_marker(repair).unwrap().repair);
        assert!(repair.temperature < requests[0].temperature);
        assert_eq!(repair.temperature, config.repair_temperature);
        let prompt = &repair.messages[1].content;
        assert!(prompt.contains("## Original Output\n{}"));
        assert!(prompt.contains("1. name: is a required property that is missing"));
    }

    #[tokio::test]
    async fn test_exhausted_attempts_surface_final_validation_errors() {
        let backend = ScriptedBackend::new();
        backend.push_for_stage("a", ScriptedReply::Text("{}".to_string()));
        let store = store().await;

        let err = run_stage(&backend, &store, &config(), &stage("a"), &ResultSet::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::ExhaustedRetries { attempts: 3, .. }
        ));
        assert_eq!(
            err.validation_errors().unwrap(),
            &[ValidationIssue::new("name", "is a required property that is missing")]
        );
        // Three generations, a repair after each but the last
        assert_eq!(backend.call_count(), 5);

        let stored = store.results_for_project(PROJECT).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, StageStatus::Failed);
        assert_eq!(stored[0].attempts, 3);
        assert!(stored[0].error.is_some());
    }

    #[tokio::test]
    async fn test_unparseable_output_gets_a_fresh_generation() {
        let backend = ScriptedBackend::new();
        backend.push_for_stage("a", ScriptedReply::Text("I cannot help with that".to_string()));
        backend.push_for_stage("a", ScriptedReply::json(&json!({"name": "Basil"})));
        let store = store().await;

        let result = run_stage(&backend, &store, &config(), &stage("a"), &ResultSet::new())
            .await
            .unwrap();

        assert_eq!(result.attempts, 2);
        assert_eq!(backend.call_count(), 2);
        assert!(
            backend
                .requests()
                .iter()
                .all(|r| !stage_marker(r).unwrap().repair)
        );
    }

    #[tokio::test]
    async fn test_transport_failures_retry_within_the_attempt() {
        let backend = ScriptedBackend::new();
        backend.push_for_stage(
            "a",
            ScriptedReply::Fail(TransportFailure::Network("connection reset".to_string())),
        );
        backend.push_for_stage(
            "a",
            ScriptedReply::Fail(TransportFailure::Status {
                code: 503,
                body: "overloaded".to_string(),
            }),
        );
        backend.push_for_stage("a", ScriptedReply::json(&json!({"name": "Basil"})));
        let store = store().await;

        let result = run_stage(&backend, &store, &config(), &stage("a"), &ResultSet::new())
            .await
            .unwrap();

        assert_eq!(result.attempts, 1);
        assert_eq!(backend.call_count(), 3);
    }

    #[tokio::test]
    async fn test_transport_retries_are_bounded() {
        let backend = ScriptedBackend::new();
        backend.push_for_stage(
            "a",
            ScriptedReply::Fail(TransportFailure::Network("down".to_string())),
        );
        let store = store().await;
        let config = PipelineConfig::default().with_retry(RetryPolicy::immediate(2));

        let err = run_stage(&backend, &store, &config, &stage("a"), &ResultSet::new())
            .await
            .unwrap_err();

        match err {
            PipelineError::ExhaustedRetries { cause, .. } => {
                assert!(matches!(*cause, PipelineError::Transport(TransportFailure::Network(_))));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(backend.call_count(), 3);
    }

    struct StalledBackend;

    #[async_trait]
    impl GenerationBackend for StalledBackend {
        fn id(&self) -> String {
            "stalled".to_string()
        }

        async fn generate(
            &self,
            _request: &GenerationRequest,
        ) -> Result<GenerationResponse, TransportFailure> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Err(TransportFailure::Network("unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_calls_are_bounded_by_timeout() {
        let store = store().await;
        let config = PipelineConfig::default()
            .with_request_timeout(Duration::from_millis(20))
            .with_retry(RetryPolicy::immediate(0));

        let err = run_stage(&StalledBackend, &store, &config, &stage("a"), &ResultSet::new())
            .await
            .unwrap_err();

        match err {
            PipelineError::ExhaustedRetries { cause, .. } => {
                assert!(matches!(*cause, PipelineError::Transport(TransportFailure::Timeout(_))));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_prompt_sees_last_completed_decision() {
        let mut prior = ResultSet::new();
        prior.replace(completed(
            "a",
            json!({"name": "A", "decisions": [{"key": "auth", "value": "x", "reason": "first"}]}),
        ));
        prior.replace(completed(
            "b",
            json!({"name": "B", "decisions": [{"key": "auth", "value": "y", "reason": "later"}]}),
        ));

        let backend = ScriptedBackend::new();
        backend.push_for_stage("c", ScriptedReply::json(&json!({"name": "C"})));
        let store = store().await;

        run_stage(&backend, &store, &config(), &stage("c"), &prior)
            .await
            .unwrap();

        let context = prompt_context(&backend.requests()[0]);
        let entries = context["decisions"]["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["key"], "auth");
        assert_eq!(entries[0]["value"], "y");
        assert_eq!(context["artifacts"]["a"]["name"], "A");
        assert_eq!(context["project"]["description"], "A recipe sharing app");
    }

    #[test]
    fn test_attempt_outcome_states() {
        let schema = stage("a").schema;
        assert!(matches!(
            AttemptOutcome::evaluate("```json\n{\"name\": \"x\"}\n```", &schema),
            AttemptOutcome::Valid(_)
        ));
        assert!(matches!(
            AttemptOutcome::evaluate("{\"name\": 3}", &schema),
            AttemptOutcome::Invalid { .. }
        ));
        assert!(matches!(
            AttemptOutcome::evaluate("no json here", &schema),
            AttemptOutcome::ParseFailed(_)
        ));
        assert!(matches!(
            AttemptOutcome::parse("[1, 2]"),
            AttemptOutcome::Parsed(_)
        ));
    }
}
