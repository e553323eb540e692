use std::collections::{HashMap, HashSet};

use serde_json::Value;
use tracing::{debug, warn};

use crate::models::{
    declarations, ChecklistItem, ChecklistReport, OverallStatus, ResultSet, RevisionRequest,
    StageType,
};
use crate::stages::catalogue::{API, DATA, INSIGHTS, PRIORITIES, TASKS, UX};

/// Third-party identity providers that own user credentials
const EXTERNAL_AUTH_PROVIDERS: &[&str] = &["firebase", "auth0", "supabase", "clerk", "cognito", "okta"];

/// Entity names treated as the user table
const USER_ENTITY_NAMES: &[&str] = &["user", "users", "account", "accounts", "app_user", "app_users"];

const STOP_WORDS: &[&str] = &[
    "about", "after", "also", "because", "been", "being", "could", "does", "each", "from", "have",
    "into", "more", "most", "need", "needs", "only", "other", "over", "should", "some", "such",
    "than", "that", "their", "them", "then", "there", "these", "they", "this", "very", "want",
    "when", "where", "which", "while", "will", "with", "without", "would", "your",
];

/// Verdict of one rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleOutcome {
    pub passed: bool,
    pub detail: Option<String>,
    /// Each request names exactly one target stage
    pub requests: Vec<RevisionRequest>,
}

impl RuleOutcome {
    pub fn pass() -> Self {
        Self {
            passed: true,
            detail: None,
            requests: vec![],
        }
    }

    pub fn pass_with(detail: impl Into<String>) -> Self {
        Self {
            passed: true,
            detail: Some(detail.into()),
            requests: vec![],
        }
    }

    pub fn fail(detail: impl Into<String>, requests: Vec<RevisionRequest>) -> Self {
        Self {
            passed: false,
            detail: Some(detail.into()),
            requests,
        }
    }
}

/// A cross-stage consistency rule.
///
/// Rules are pure predicates over a snapshot of completed stage outputs and
/// never mutate anything.
pub trait ChecklistRule: Send + Sync {
    fn name(&self) -> &str;

    /// Stage types the rule reads; empty means it applies to every stage
    fn stages(&self) -> Vec<&str>;

    fn evaluate(&self, results: &ResultSet) -> RuleOutcome;
}

/// Evaluates the registered rules against the current results
#[derive(Default)]
pub struct ChecklistEngine {
    rules: Vec<Box<dyn ChecklistRule>>,
}

impl ChecklistEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine with the five built-in rules, wired to the default stage types
    pub fn with_default_rules(stage_order: &[StageType]) -> Self {
        Self::new()
            .with_rule(AuthDataConsistency::new(UX, DATA, API))
            .with_rule(RequiredItemRule {
                name: "tasks_include_testing".to_string(),
                stage: TASKS.to_string(),
                array: "tasks".to_string(),
                field: "title".to_string(),
                needle: "test".to_string(),
                request: "Add at least one task dedicated to testing (unit, integration or end-to-end tests).".to_string(),
            })
            .with_rule(StructuralPresenceRule {
                name: "api_error_model_present".to_string(),
                stage: API.to_string(),
                field: "error_model".to_string(),
                required_keys: vec!["format".to_string(), "codes".to_string()],
            })
            .with_rule(LedgerIntegrity::new(stage_order.to_vec()))
            .with_rule(UpstreamSignal {
                source: INSIGHTS.to_string(),
                source_array: "findings".to_string(),
                target: PRIORITIES.to_string(),
                target_array: "items".to_string(),
            })
    }

    pub fn with_rule(mut self, rule: impl ChecklistRule + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    /// Evaluate every rule against the full set of completed outputs
    pub fn evaluate(&self, results: &ResultSet) -> ChecklistReport {
        let mut items = Vec::new();
        let mut revision_requests = Vec::new();

        for rule in &self.rules {
            let missing = missing_inputs(rule.as_ref(), results);
            if !missing.is_empty() {
                debug!("Checklist {}: skipped, missing {:?}", rule.name(), missing);
                items.push(ChecklistItem {
                    rule: rule.name().to_string(),
                    passed: true,
                    detail: Some(format!("skipped: no output for {}", missing.join(", "))),
                });
                continue;
            }

            let outcome = rule.evaluate(results);
            if !outcome.passed {
                warn!(
                    "Checklist {} failed: {}",
                    rule.name(),
                    outcome.detail.as_deref().unwrap_or("")
                );
            }
            items.push(ChecklistItem {
                rule: rule.name().to_string(),
                passed: outcome.passed,
                detail: outcome.detail,
            });
            revision_requests.extend(outcome.requests);
        }

        let status = if items.iter().all(|i| i.passed) {
            OverallStatus::Pass
        } else {
            OverallStatus::Fail
        };

        ChecklistReport {
            status,
            items,
            revision_requests,
        }
    }

    /// Evaluate the rules involving one stage whose inputs are all present
    pub fn side_check(&self, stage_type: &str, results: &ResultSet) -> Vec<ChecklistItem> {
        let mut items = Vec::new();
        for rule in &self.rules {
            let stages = rule.stages();
            if !stages.is_empty() && !stages.contains(&stage_type) {
                continue;
            }
            if !missing_inputs(rule.as_ref(), results).is_empty() {
                continue;
            }
            let outcome = rule.evaluate(results);
            items.push(ChecklistItem {
                rule: rule.name().to_string(),
                passed: outcome.passed,
                detail: outcome.detail,
            });
        }
        items
    }
}

fn missing_inputs<'r>(rule: &'r dyn ChecklistRule, results: &ResultSet) -> Vec<&'r str> {
    rule.stages()
        .into_iter()
        .filter(|stage| results.output(stage).is_none())
        .collect()
}

/// Authentication choice in the UX stage must match the user table in the
/// data stage (and the API surface)
pub struct AuthDataConsistency {
    ux: String,
    data: String,
    api: String,
}

impl AuthDataConsistency {
    pub fn new(ux: &str, data: &str, api: &str) -> Self {
        Self {
            ux: ux.to_string(),
            data: data.to_string(),
            api: api.to_string(),
        }
    }
}

impl ChecklistRule for AuthDataConsistency {
    fn name(&self) -> &str {
        "auth_data_consistency"
    }

    fn stages(&self) -> Vec<&str> {
        vec![self.ux.as_str(), self.data.as_str()]
    }

    fn evaluate(&self, results: &ResultSet) -> RuleOutcome {
        let (Some(ux), Some(data)) = (results.output(&self.ux), results.output(&self.data)) else {
            return RuleOutcome::pass_with("skipped: missing stage output");
        };
        let Some(choice) = ux.pointer("/auth/choice").and_then(Value::as_str) else {
            return RuleOutcome::pass_with("no authentication choice recorded");
        };
        let choice_lower = choice.to_lowercase();
        let Some(columns) = user_columns(data) else {
            return RuleOutcome::pass_with("no users entity in data model");
        };

        let has_column = |name: &str| columns.iter().any(|c| c == name);
        let mut requests = Vec::new();
        let mut problems = Vec::new();

        let provider = EXTERNAL_AUTH_PROVIDERS
            .iter()
            .find(|p| choice_lower.contains(*p));

        match provider {
            Some(provider) => {
                let mut fixes = Vec::new();
                let uid = format!("{}_uid", provider);
                let linked = has_column(&uid)
                    || has_column(&format!("{}_id", provider))
                    || has_column("external_id")
                    || has_column("auth_provider_id");
                if !linked {
                    problems.push(format!("users has no {} column", uid));
                    fixes.push(format!("add a `{}` column to the users entity", uid));
                }
                if has_column("password_hash") {
                    problems.push("users stores password_hash".to_string());
                    fixes.push("remove the `password_hash` column".to_string());
                }
                if !fixes.is_empty() {
                    requests.push(RevisionRequest::new(
                        &self.data,
                        format!(
                            "Authentication is handled by {} ({}): {}.",
                            provider,
                            choice,
                            fixes.join(" and ")
                        ),
                    ));
                }

                let password_paths = password_endpoints(results.output(&self.api));
                if !password_paths.is_empty() {
                    problems.push(format!("api exposes {}", password_paths.join(", ")));
                    requests.push(RevisionRequest::new(
                        &self.api,
                        format!(
                            "Remove password endpoints ({}): credentials are managed by {}.",
                            password_paths.join(", "),
                            provider
                        ),
                    ));
                }
            }
            None if choice_lower.contains("password") || choice_lower.contains("email") => {
                if !has_column("password_hash") {
                    problems.push("users has no password_hash column".to_string());
                    requests.push(RevisionRequest::new(
                        &self.data,
                        format!(
                            "Authentication uses {}: add a `password_hash` column to the users entity.",
                            choice
                        ),
                    ));
                }
            }
            None => {}
        }

        if requests.is_empty() {
            RuleOutcome::pass()
        } else {
            RuleOutcome::fail(
                format!("auth choice '{}' conflicts: {}", choice, problems.join("; ")),
                requests,
            )
        }
    }
}

/// Lower-cased column names of the users entity, if there is one
fn user_columns(data: &Value) -> Option<Vec<String>> {
    let entities = data.get("entities")?.as_array()?;
    let users = entities.iter().find(|e| {
        e.get("name")
            .and_then(Value::as_str)
            .is_some_and(|n| USER_ENTITY_NAMES.contains(&n.to_lowercase().as_str()))
    })?;

    let columns = users
        .get("columns")
        .and_then(Value::as_array)
        .map(|cols| {
            cols.iter()
                .filter_map(|c| match c {
                    Value::String(s) => Some(s.to_lowercase()),
                    Value::Object(_) => c.get("name").and_then(Value::as_str).map(str::to_lowercase),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    Some(columns)
}

fn password_endpoints(api: Option<&Value>) -> Vec<String> {
    api.and_then(|a| a.get("endpoints"))
        .and_then(Value::as_array)
        .map(|endpoints| {
            endpoints
                .iter()
                .filter_map(|e| e.get("path").and_then(Value::as_str))
                .filter(|p| p.to_lowercase().contains("password"))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// A stage's output array must contain an element whose field contains a
/// substring (case-insensitive)
pub struct RequiredItemRule {
    pub name: String,
    pub stage: String,
    pub array: String,
    pub field: String,
    pub needle: String,
    pub request: String,
}

impl ChecklistRule for RequiredItemRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn stages(&self) -> Vec<&str> {
        vec![self.stage.as_str()]
    }

    fn evaluate(&self, results: &ResultSet) -> RuleOutcome {
        let Some(output) = results.output(&self.stage) else {
            return RuleOutcome::pass_with("skipped: missing stage output");
        };
        let needle = self.needle.to_lowercase();
        let found = output
            .get(&self.array)
            .and_then(Value::as_array)
            .is_some_and(|items| {
                items.iter().any(|item| {
                    item.get(&self.field)
                        .and_then(Value::as_str)
                        .is_some_and(|text| text.to_lowercase().contains(&needle))
                })
            });

        if found {
            RuleOutcome::pass()
        } else {
            RuleOutcome::fail(
                format!(
                    "no {}.{} entry mentions '{}'",
                    self.array, self.field, self.needle
                ),
                vec![RevisionRequest::new(&self.stage, self.request.clone())],
            )
        }
    }
}

/// A nested object with required sub-keys must be present and non-empty
pub struct StructuralPresenceRule {
    pub name: String,
    pub stage: String,
    pub field: String,
    pub required_keys: Vec<String>,
}

impl ChecklistRule for StructuralPresenceRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn stages(&self) -> Vec<&str> {
        vec![self.stage.as_str()]
    }

    fn evaluate(&self, results: &ResultSet) -> RuleOutcome {
        let Some(output) = results.output(&self.stage) else {
            return RuleOutcome::pass_with("skipped: missing stage output");
        };

        let missing: Vec<&str> = match output.get(&self.field).and_then(Value::as_object) {
            Some(object) if !object.is_empty() => self
                .required_keys
                .iter()
                .filter(|key| object.get(key.as_str()).is_none_or(is_empty_value))
                .map(String::as_str)
                .collect(),
            _ => self.required_keys.iter().map(String::as_str).collect(),
        };

        if missing.is_empty() {
            RuleOutcome::pass()
        } else {
            RuleOutcome::fail(
                format!("{} is missing or empty: {}", self.field, missing.join(", ")),
                vec![RevisionRequest::new(
                    &self.stage,
                    format!(
                        "Add a non-empty `{}` object with {}.",
                        self.field,
                        missing
                            .iter()
                            .map(|k| format!("`{}`", k))
                            .collect::<Vec<_>>()
                            .join(" and ")
                    ),
                )],
            )
        }
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Decision keys must have a single owner.
///
/// The stage earliest in pipeline order owns a key; any other stage that
/// declares it must mark the entry `supersedes`. A stage declaring the same
/// key twice is always flagged.
pub struct LedgerIntegrity {
    stage_order: Vec<StageType>,
}

impl LedgerIntegrity {
    pub fn new(stage_order: Vec<StageType>) -> Self {
        Self { stage_order }
    }

    fn rank(&self, stage: &str) -> usize {
        self.stage_order
            .iter()
            .position(|s| s == stage)
            .unwrap_or(usize::MAX)
    }
}

impl ChecklistRule for LedgerIntegrity {
    fn name(&self) -> &str {
        "ledger_integrity"
    }

    fn stages(&self) -> Vec<&str> {
        vec![]
    }

    fn evaluate(&self, results: &ResultSet) -> RuleOutcome {
        let mut declared = declarations(results);
        declared.sort_by_key(|d| self.rank(&d.stage_type));

        let mut owners: HashMap<&str, &str> = HashMap::new();
        let mut seen_in_stage: HashSet<(&str, &str)> = HashSet::new();
        // stage -> offending keys, in first-seen order
        let mut offenders: Vec<(String, Vec<String>)> = Vec::new();

        for declaration in &declared {
            let stage = declaration.stage_type.as_str();
            let key = declaration.entry.key.as_str();

            let duplicate_in_stage = !seen_in_stage.insert((stage, key));
            let conflicting_owner = match owners.get(key) {
                Some(owner) => *owner != stage && !declaration.entry.supersedes,
                None => {
                    owners.insert(key, stage);
                    false
                }
            };

            if duplicate_in_stage || conflicting_owner {
                match offenders.iter_mut().find(|(s, _)| s == stage) {
                    Some((_, keys)) => {
                        if !keys.iter().any(|k| k == key) {
                            keys.push(key.to_string());
                        }
                    }
                    None => offenders.push((stage.to_string(), vec![key.to_string()])),
                }
            }
        }

        if offenders.is_empty() {
            return RuleOutcome::pass();
        }

        let detail = offenders
            .iter()
            .map(|(stage, keys)| format!("{} re-declares {}", stage, keys.join(", ")))
            .collect::<Vec<_>>()
            .join("; ");
        let requests = offenders
            .into_iter()
            .map(|(stage, keys)| {
                RevisionRequest::new(
                    &stage,
                    format!(
                        "Decision key(s) {} are already declared elsewhere: adopt the existing value and drop the duplicate, or set \"supersedes\": true if the override is intentional.",
                        keys.join(", ")
                    ),
                )
            })
            .collect();
        RuleOutcome::fail(detail, requests)
    }
}

/// Findings from an upstream insights stage must surface in a downstream
/// priorities stage
pub struct UpstreamSignal {
    pub source: String,
    pub source_array: String,
    pub target: String,
    pub target_array: String,
}

impl ChecklistRule for UpstreamSignal {
    fn name(&self) -> &str {
        "insights_reach_priorities"
    }

    fn stages(&self) -> Vec<&str> {
        vec![self.source.as_str(), self.target.as_str()]
    }

    fn evaluate(&self, results: &ResultSet) -> RuleOutcome {
        let (Some(source), Some(target)) =
            (results.output(&self.source), results.output(&self.target))
        else {
            return RuleOutcome::pass_with("skipped: missing stage output");
        };

        let findings = source
            .get(&self.source_array)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if findings.is_empty() {
            return RuleOutcome::pass_with("no upstream findings");
        }

        let ids: Vec<String> = findings
            .iter()
            .filter_map(|f| f.get("id").and_then(Value::as_str))
            .map(str::to_lowercase)
            .collect();
        let finding_words: HashSet<String> = findings
            .iter()
            .filter_map(|f| f.get("title").and_then(Value::as_str))
            .flat_map(significant_words)
            .collect();

        let items = target
            .get(&self.target_array)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let linked = items.iter().any(|item| {
            let text = collect_text(item).to_lowercase();
            ids.iter().any(|id| text.contains(id.as_str()))
                || significant_words(&text).any(|w| finding_words.contains(&w))
        });

        if linked {
            RuleOutcome::pass()
        } else {
            let example = findings
                .first()
                .and_then(|f| f.get("title"))
                .and_then(Value::as_str)
                .unwrap_or("the first finding");
            RuleOutcome::fail(
                format!(
                    "none of {} {} items derive from {} {}",
                    items.len(),
                    self.target,
                    findings.len(),
                    self.source_array
                ),
                vec![RevisionRequest::new(
                    &self.target,
                    format!(
                        "Ground at least one priority in the {} findings (for example \"{}\") and reference the finding it derives from.",
                        self.source, example
                    ),
                )],
            )
        }
    }
}

/// All string leaves of a value, space separated
fn collect_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(collect_text).collect::<Vec<_>>().join(" "),
        Value::Object(map) => map.values().map(collect_text).collect::<Vec<_>>().join(" "),
        _ => String::new(),
    }
}

fn significant_words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 4)
        .map(str::to_lowercase)
        .filter(|w| !STOP_WORDS.contains(&w.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{StageResult, StageStatus};
    use serde_json::json;

    fn completed(stage: &str, output: Value) -> StageResult {
        let mut result = StageResult::processing("p1", stage);
        result.status = StageStatus::Completed;
        result.output = Some(output);
        result
    }

    fn results(outputs: Vec<(&str, Value)>) -> ResultSet {
        let mut set = ResultSet::new();
        for (stage, output) in outputs {
            set.replace(completed(stage, output));
        }
        set
    }

    fn default_engine() -> ChecklistEngine {
        let order: Vec<StageType> = [INSIGHTS, PRIORITIES, UX, DATA, API, TASKS]
            .iter()
            .map(|s| s.to_string())
            .collect();
        ChecklistEngine::with_default_rules(&order)
    }

    #[test]
    fn test_firebase_auth_with_password_hash_targets_data() {
        let set = results(vec![
            (UX, json!({"auth": {"choice": "firebase"}})),
            (
                DATA,
                json!({"entities": [{"name": "users", "columns": [
                    {"name": "id", "type": "uuid"},
                    {"name": "password_hash", "type": "text"}
                ]}]}),
            ),
        ]);

        let report = default_engine().evaluate(&set);

        assert_eq!(report.status, OverallStatus::Fail);
        let item = report
            .items
            .iter()
            .find(|i| i.rule == "auth_data_consistency")
            .unwrap();
        assert!(!item.passed);
        let data_requests: Vec<_> = report
            .revision_requests
            .iter()
            .filter(|r| r.stage == DATA)
            .collect();
        assert_eq!(data_requests.len(), 1);
        assert!(data_requests[0].request.contains("firebase_uid"));
        assert!(data_requests[0].request.contains("password_hash"));
    }

    #[test]
    fn test_firebase_auth_consistent() {
        let set = results(vec![
            (UX, json!({"auth": {"choice": "Firebase Auth"}})),
            (
                DATA,
                json!({"entities": [{"name": "User", "columns": ["id", "firebase_uid"]}]}),
            ),
            (API, json!({"endpoints": [{"method": "GET", "path": "/me"}]})),
        ]);
        let outcome = AuthDataConsistency::new(UX, DATA, API).evaluate(&set);
        assert!(outcome.passed);
    }

    #[test]
    fn test_firebase_auth_flags_password_endpoints() {
        let set = results(vec![
            (UX, json!({"auth": {"choice": "firebase"}})),
            (DATA, json!({"entities": [{"name": "users", "columns": ["firebase_uid"]}]})),
            (API, json!({"endpoints": [{"method": "POST", "path": "/auth/reset-password"}]})),
        ]);
        let outcome = AuthDataConsistency::new(UX, DATA, API).evaluate(&set);
        assert!(!outcome.passed);
        assert_eq!(outcome.requests.len(), 1);
        assert_eq!(outcome.requests[0].stage, API);
    }

    #[test]
    fn test_password_auth_requires_hash() {
        let set = results(vec![
            (UX, json!({"auth": {"choice": "email_password"}})),
            (DATA, json!({"entities": [{"name": "users", "columns": ["id", "email"]}]})),
        ]);
        let outcome = AuthDataConsistency::new(UX, DATA, API).evaluate(&set);
        assert!(!outcome.passed);
        assert_eq!(outcome.requests[0].stage, DATA);
    }

    #[test]
    fn test_rules_skip_when_inputs_missing() {
        let report = default_engine().evaluate(&ResultSet::new());
        assert_eq!(report.status, OverallStatus::Pass);
        assert!(report.revision_requests.is_empty());
        assert!(
            report
                .items
                .iter()
                .filter(|i| i.rule != "ledger_integrity")
                .all(|i| i.detail.as_deref().unwrap_or("").starts_with("skipped"))
        );
    }

    #[test]
    fn test_tasks_must_include_testing() {
        let set = results(vec![(TASKS, json!({"tasks": [{"title": "Set up CI"}]}))]);
        let report = default_engine().evaluate(&set);
        assert_eq!(report.status, OverallStatus::Fail);
        assert_eq!(report.revision_requests[0].stage, TASKS);

        let set = results(vec![(TASKS, json!({"tasks": [{"title": "Write integration Tests"}]}))]);
        assert_eq!(default_engine().evaluate(&set).status, OverallStatus::Pass);
    }

    #[test]
    fn test_structural_presence() {
        let rule = StructuralPresenceRule {
            name: "api_error_model_present".to_string(),
            stage: API.to_string(),
            field: "error_model".to_string(),
            required_keys: vec!["format".to_string(), "codes".to_string()],
        };

        let empty_codes = results(vec![(
            API,
            json!({"error_model": {"format": "problem+json", "codes": []}}),
        )]);
        let outcome = rule.evaluate(&empty_codes);
        assert!(!outcome.passed);
        assert!(outcome.requests[0].request.contains("`codes`"));

        let absent = results(vec![(API, json!({"endpoints": []}))]);
        assert!(!rule.evaluate(&absent).passed);

        let present = results(vec![(
            API,
            json!({"error_model": {"format": "problem+json", "codes": ["E_NOT_FOUND"]}}),
        )]);
        assert!(rule.evaluate(&present).passed);
    }

    #[test]
    fn test_ledger_integrity_requires_supersedes() {
        let order = vec![UX.to_string(), DATA.to_string()];
        let rule = LedgerIntegrity::new(order);

        let conflicting = results(vec![
            (UX, json!({"decisions": [{"key": "auth", "value": "firebase"}]})),
            (DATA, json!({"decisions": [{"key": "auth", "value": "password"}]})),
        ]);
        let outcome = rule.evaluate(&conflicting);
        assert!(!outcome.passed);
        assert_eq!(outcome.requests.len(), 1);
        assert_eq!(outcome.requests[0].stage, DATA);

        let superseding = results(vec![
            (UX, json!({"decisions": [{"key": "auth", "value": "firebase"}]})),
            (
                DATA,
                json!({"decisions": [{"key": "auth", "value": "password", "supersedes": true}]}),
            ),
        ]);
        assert!(rule.evaluate(&superseding).passed);
    }

    #[test]
    fn test_ledger_integrity_ownership_follows_pipeline_order() {
        let rule = LedgerIntegrity::new(vec![UX.to_string(), DATA.to_string()]);
        // ux re-ran and completed after data; ux still owns the key
        let set = results(vec![
            (DATA, json!({"decisions": [{"key": "auth", "value": "x", "supersedes": true}]})),
            (UX, json!({"decisions": [{"key": "auth", "value": "y"}]})),
        ]);
        assert!(rule.evaluate(&set).passed);
    }

    #[test]
    fn test_ledger_integrity_flags_duplicates_within_stage() {
        let rule = LedgerIntegrity::new(vec![UX.to_string()]);
        let set = results(vec![(
            UX,
            json!({"decisions": [
                {"key": "theme", "value": "dark"},
                {"key": "theme", "value": "light"}
            ]}),
        )]);
        let outcome = rule.evaluate(&set);
        assert!(!outcome.passed);
        assert_eq!(outcome.requests[0].stage, UX);
    }

    #[test]
    fn test_upstream_signal() {
        let insights = json!({"findings": [
            {"id": "F1", "title": "Recipe discovery is slow", "detail": "..."}
        ]});

        let unrelated = results(vec![
            (INSIGHTS, insights.clone()),
            (PRIORITIES, json!({"items": [{"title": "Dark mode", "rationale": "looks nice"}]})),
        ]);
        let report = default_engine().evaluate(&unrelated);
        let failing: Vec<_> = report.failed_items().map(|i| i.rule.as_str()).collect();
        assert_eq!(failing, vec!["insights_reach_priorities"]);
        assert_eq!(report.revision_requests[0].stage, PRIORITIES);

        let by_word = results(vec![
            (INSIGHTS, insights.clone()),
            (PRIORITIES, json!({"items": [{"title": "Faster discovery feed"}]})),
        ]);
        assert_eq!(default_engine().evaluate(&by_word).status, OverallStatus::Pass);

        let by_id = results(vec![
            (INSIGHTS, insights),
            (PRIORITIES, json!({"items": [{"title": "Search", "derived_from": ["F1"]}]})),
        ]);
        assert_eq!(default_engine().evaluate(&by_id).status, OverallStatus::Pass);
    }

    #[test]
    fn test_side_check_only_runs_ready_rules() {
        let set = results(vec![(UX, json!({"auth": {"choice": "firebase"}}))]);
        let items = default_engine().side_check(UX, &set);
        // auth rule needs data; only the ledger rule is ready
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].rule, "ledger_integrity");
    }
}
