use serde_json::{json, Value};

use crate::error::PipelineError;
use crate::models::{Schema, StageCatalogue, StageDescriptor, StageRole};

pub const INSIGHTS: &str = "insights";
pub const PRIORITIES: &str = "priorities";
pub const UX: &str = "ux";
pub const DATA: &str = "data";
pub const API: &str = "api";
pub const TASKS: &str = "tasks";
pub const CRITIC: &str = "critic";
pub const COMPOSITION: &str = "composition";

/// Built-in eight stage planning catalogue
pub fn default_catalogue() -> Result<StageCatalogue, PipelineError> {
    let stages = vec![
        descriptor(
            INSIGHTS,
            "Insights",
            "Research findings and opportunities behind the project.",
            "Analyse the project description and any auxiliary research. List the key user problems as findings, each with a short id (F1, F2, ...), and the opportunities they open.",
            content_schema(
                json!({
                    "findings": array_of(object(
                        json!({
                            "id": string(1),
                            "title": string(3),
                            "detail": {"type": "string"},
                            "evidence": {"type": "string"}
                        }),
                        &["id", "title"],
                    ), 1),
                    "opportunities": {"type": "array", "items": {"type": "string"}}
                }),
                &["findings"],
            ),
            StageRole::Content,
        ),
        descriptor(
            PRIORITIES,
            "Priorities",
            "Ranked product priorities derived from the insights.",
            "Turn the findings into a ranked list of priorities. Reference the finding ids each priority derives from in `derived_from`.",
            content_schema(
                json!({
                    "items": array_of(object(
                        json!({
                            "title": string(3),
                            "rationale": {"type": "string"},
                            "rank": {"type": "integer", "minimum": 1},
                            "impact": {"type": "string", "enum": ["high", "medium", "low"]},
                            "derived_from": {"type": "array", "items": {"type": "string"}}
                        }),
                        &["title", "rank", "impact"],
                    ), 1)
                }),
                &["items"],
            ),
            StageRole::Content,
        ),
        descriptor(
            UX,
            "User Experience",
            "Screens, flows and the authentication approach.",
            "Design the main screens and user flows for the top priorities. Choose an authentication approach (for example email_password, firebase, auth0, magic_link) and record it as a decision with key `auth`.",
            content_schema(
                json!({
                    "screens": array_of(object(
                        json!({
                            "name": string(1),
                            "purpose": {"type": "string"},
                            "components": {"type": "array", "items": {"type": "string"}}
                        }),
                        &["name", "purpose"],
                    ), 1),
                    "flows": {"type": "array", "items": {"type": "string"}},
                    "auth": object(
                        json!({
                            "choice": string(1),
                            "reason": {"type": "string"}
                        }),
                        &["choice"],
                    )
                }),
                &["screens", "auth"],
            ),
            StageRole::Content,
        ),
        descriptor(
            DATA,
            "Data Model",
            "Entities, columns and relationships.",
            "Define the persistent data model that supports the screens. The users entity must match the authentication approach chosen by the UX stage.",
            content_schema(
                json!({
                    "entities": array_of(object(
                        json!({
                            "name": string(1),
                            "columns": array_of(object(
                                json!({
                                    "name": string(1),
                                    "type": string(1),
                                    "nullable": {"type": "boolean"}
                                }),
                                &["name", "type"],
                            ), 1),
                            "relationships": {"type": "array", "items": {"type": "string"}}
                        }),
                        &["name", "columns"],
                    ), 1)
                }),
                &["entities"],
            ),
            StageRole::Content,
        ),
        descriptor(
            API,
            "API Surface",
            "Endpoints and the shared error model.",
            "Specify the HTTP API over the data model, including a shared error model with a response format and the list of error codes.",
            content_schema(
                json!({
                    "endpoints": array_of(object(
                        json!({
                            "method": {"type": "string", "enum": ["GET", "POST", "PUT", "PATCH", "DELETE"]},
                            "path": string(1),
                            "summary": {"type": "string"},
                            "auth_required": {"type": "boolean"}
                        }),
                        &["method", "path"],
                    ), 1),
                    "error_model": object(
                        json!({
                            "format": {"type": "string"},
                            "codes": {"type": "array", "items": {"type": "string"}}
                        }),
                        &["format", "codes"],
                    )
                }),
                &["endpoints", "error_model"],
            ),
            StageRole::Content,
        ),
        descriptor(
            TASKS,
            "Delivery Tasks",
            "Ordered implementation tasks with estimates.",
            "Break the plan into implementation tasks, each small enough for one or two days of work. Include testing work explicitly.",
            content_schema(
                json!({
                    "tasks": array_of(object(
                        json!({
                            "title": string(3),
                            "description": {"type": "string"},
                            "estimate_days": {"type": "number", "minimum": 0, "maximum": 30},
                            "depends_on": {"type": "array", "items": {"type": "string"}}
                        }),
                        &["title", "estimate_days"],
                    ), 1)
                }),
                &["tasks"],
            ),
            StageRole::Content,
        ),
        descriptor(
            CRITIC,
            "Critic",
            "Structured review of every other artifact.",
            "Review every artifact for gaps and contradictions. Score the overall severity from 0 (ready) to 1 (severely flawed) and list concrete revision requests, each naming exactly one target stage.",
            object(
                json!({
                    "severity": {"type": "number", "minimum": 0, "maximum": 1},
                    "summary": {"type": "string"},
                    "revision_requests": {
                        "type": "array",
                        "items": object(
                            json!({
                                "stage": {
                                    "type": "string",
                                    "enum": [INSIGHTS, PRIORITIES, UX, DATA, API, TASKS]
                                },
                                "request": string(1)
                            }),
                            &["stage", "request"],
                        )
                    }
                }),
                &["severity", "revision_requests"],
            ),
            StageRole::Critic,
        ),
        descriptor(
            COMPOSITION,
            "Composition",
            "Final deliverable merging every artifact.",
            "Compose the final plan document from all artifacts and the decision ledger. Resolve remaining inconsistencies in favour of the ledger.",
            object(
                json!({
                    "title": string(1),
                    "summary": string(10),
                    "sections": array_of(object(
                        json!({
                            "heading": string(1),
                            "body": string(1)
                        }),
                        &["heading", "body"],
                    ), 1),
                    "open_questions": {"type": "array", "items": {"type": "string"}}
                }),
                &["title", "summary", "sections"],
            ),
            StageRole::Composition,
        ),
    ];

    let stages = stages.into_iter().collect::<Result<Vec<_>, _>>()?;
    StageCatalogue::new(stages)
}

fn descriptor(
    stage_type: &str,
    name: &str,
    description: &str,
    prompt_template: &str,
    schema: Value,
    role: StageRole,
) -> Result<StageDescriptor, PipelineError> {
    let schema = Schema::from_value(schema)
        .map_err(|e| PipelineError::Catalogue(format!("{}: {}", stage_type, e)))?;
    Ok(StageDescriptor {
        stage_type: stage_type.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        prompt_template: prompt_template.to_string(),
        schema,
        role,
    })
}

fn string(min_length: usize) -> Value {
    json!({"type": "string", "minLength": min_length})
}

fn object(properties: Value, required: &[&str]) -> Value {
    json!({"type": "object", "properties": properties, "required": required})
}

fn array_of(items: Value, min_items: usize) -> Value {
    json!({"type": "array", "items": items, "minItems": min_items})
}

/// Object schema with the optional `decisions` array every content stage
/// may emit
fn content_schema(mut properties: Value, required: &[&str]) -> Value {
    if let Value::Object(map) = &mut properties {
        map.insert(
            "decisions".to_string(),
            json!({
                "type": "array",
                "items": object(
                    json!({
                        "key": string(1),
                        "value": {},
                        "reason": {"type": "string"},
                        "supersedes": {"type": "boolean"}
                    }),
                    &["key", "value"],
                )
            }),
        );
    }
    object(properties, required)
}
