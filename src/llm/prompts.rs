use serde::Serialize;
use serde_json::{Map, Value};

use super::{ChatMessage, GenerationRequest, Role};
use crate::models::{DecisionLedger, ProjectContext, StageDescriptor, ValidationIssue};

/// System prompt shared by every stage (non-negotiable output rules)
pub const SYSTEM_PROMPT: &str = r#"You are one stage of a multi-stage product planning pipeline. Each stage produces one structured artifact. You MUST follow these rules:

1. Output ONLY a single JSON value matching the provided schema. No prose, no markdown fences.
2. Stay consistent with the artifacts produced by earlier stages and with the decision ledger.
3. If you make a decision later stages must respect, record it in the "decisions" array as {"key", "value", "reason"}.
4. Only re-declare a decision key owned by another stage when you intend to override it, and then set "supersedes": true.
5. Be concrete. Prefer specific names, numbers and examples over generalities."#;

/// System prompt for repair calls
pub const REPAIR_SYSTEM_PROMPT: &str = r#"You repair structured artifacts that failed schema validation.

RULES:
- Output ONLY the corrected JSON, nothing else
- Fix every listed validation error
- Preserve all content that was already valid
- Do not invent fields the schema does not allow"#;

const MARKER_PREFIX: &str = "# Stage: ";
const REPAIR_SUFFIX: &str = " (repair)";

/// Stage marker carried by the first line of every user prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageMarker {
    pub stage: String,
    pub repair: bool,
}

/// Read the stage marker back out of a request
pub fn stage_marker(request: &GenerationRequest) -> Option<StageMarker> {
    let message = request.messages.iter().find(|m| m.role == Role::User)?;
    let line = message.content.lines().next()?;
    let rest = line.strip_prefix(MARKER_PREFIX)?;
    match rest.strip_suffix(REPAIR_SUFFIX) {
        Some(stage) => Some(StageMarker {
            stage: stage.to_string(),
            repair: true,
        }),
        None => Some(StageMarker {
            stage: rest.to_string(),
            repair: false,
        }),
    }
}

/// Everything a stage sees besides its own instructions
#[derive(Debug, Serialize)]
pub struct StageInput<'a> {
    pub project: &'a ProjectContext,
    /// Prior artifacts keyed by stage type
    pub artifacts: Map<String, Value>,
    pub decisions: &'a DecisionLedger,
}

/// Build the messages for a regular stage call
pub fn build_stage_messages(
    stage: &StageDescriptor,
    input: &StageInput<'_>,
    previous_output: Option<&Value>,
    revisions: &[String],
) -> Vec<ChatMessage> {
    let mut prompt = String::new();

    prompt.push_str(&format!("{}{}\n\n", MARKER_PREFIX, stage.stage_type));
    prompt.push_str(&format!("## Task: {}\n", stage.name));
    prompt.push_str(&format!("{}\n\n", stage.description));
    prompt.push_str(&format!("{}\n\n", stage.prompt_template.trim()));

    prompt.push_str("## Context\n");
    prompt.push_str(
        &serde_json::to_string_pretty(input).unwrap_or_else(|_| "{}".to_string()),
    );
    prompt.push_str("\n\n");

    if !revisions.is_empty() {
        if let Some(previous) = previous_output {
            prompt.push_str("## Your Previous Output\n");
            prompt.push_str(&previous.to_string());
            prompt.push_str("\n\n");
        }
        prompt.push_str("## Revision Requests\n");
        prompt.push_str("Produce a revised artifact that addresses every request:\n");
        for revision in revisions {
            prompt.push_str(&format!("- {}\n", revision));
        }
        prompt.push('\n');
    }

    prompt.push_str("## Output Schema\n");
    prompt.push_str(&stage.schema.to_pretty_json());
    prompt.push_str("\n\nRespond with the JSON artifact only.");

    vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt)]
}

/// Build the messages for a repair call
pub fn build_repair_messages(
    stage: &StageDescriptor,
    raw_output: &str,
    errors: &[ValidationIssue],
) -> Vec<ChatMessage> {
    let mut prompt = String::new();

    prompt.push_str(&format!(
        "{}{}{}\n\n",
        MARKER_PREFIX, stage.stage_type, REPAIR_SUFFIX
    ));
    prompt.push_str("## Original Output\n");
    prompt.push_str(raw_output.trim());
    prompt.push_str("\n\n## Validation Errors\n");
    for (i, error) in errors.iter().enumerate() {
        prompt.push_str(&format!("{}. {}\n", i + 1, error));
    }
    prompt.push_str("\n## Output Schema\n");
    prompt.push_str(&stage.schema.to_pretty_json());
    prompt.push_str("\n\nOutput ONLY the corrected JSON:");

    vec![
        ChatMessage::system(REPAIR_SYSTEM_PROMPT),
        ChatMessage::user(prompt),
    ]
}
