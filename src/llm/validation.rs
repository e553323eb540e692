use jsonschema::error::{ValidationError, ValidationErrorKind};
use jsonschema::paths::{JSONPointer, PathChunk};
use jsonschema::{Draft, JSONSchema};
use serde_json::Value;
use tracing::warn;

use crate::models::{Schema, ValidationIssue};

/// Validation result for a stage output
#[derive(Debug, Clone)]
pub struct SchemaValidation {
    /// Whether the output satisfies the schema
    pub is_valid: bool,
    /// List of validation errors, ordered by path
    pub errors: Vec<ValidationIssue>,
}

impl SchemaValidation {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            errors: vec![],
        }
    }

    pub fn invalid(errors: Vec<ValidationIssue>) -> Self {
        Self {
            is_valid: false,
            errors,
        }
    }
}

/// Validate a JSON value against a stage schema.
///
/// Errors are ordered by path, then message, so repeated runs over the same
/// output produce the same repair prompt.
pub fn validate_output(value: &Value, schema: &Schema) -> SchemaValidation {
    let document = match serde_json::to_value(schema) {
        Ok(document) => document,
        Err(e) => {
            return SchemaValidation::invalid(vec![ValidationIssue::new(
                "",
                format!("schema could not be serialized: {}", e),
            )]);
        }
    };

    let compiled = match JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&document)
    {
        Ok(compiled) => compiled,
        Err(e) => {
            warn!("Stage schema failed to compile: {}", e);
            return SchemaValidation::invalid(vec![ValidationIssue::new(
                "",
                format!("schema could not be compiled: {}", e),
            )]);
        }
    };

    let mut errors: Vec<ValidationIssue> = match compiled.validate(value) {
        Ok(()) => return SchemaValidation::valid(),
        Err(errors) => errors.map(|e| issue_from(&e)).collect(),
    };
    errors.sort_by(|a, b| a.path.cmp(&b.path).then_with(|| a.message.cmp(&b.message)));
    errors.dedup();

    SchemaValidation::invalid(errors)
}

/// Map a validator error onto a dotted `path[i].field` issue.
///
/// A missing required property is reported at the property's own path.
fn issue_from(error: &ValidationError<'_>) -> ValidationIssue {
    let path = dotted_path(&error.instance_path);
    match &error.kind {
        ValidationErrorKind::Required { property } => {
            let name = property
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| property.to_string());
            ValidationIssue::new(join(&path, &name), "is a required property that is missing")
        }
        _ => ValidationIssue::new(path, error.to_string()),
    }
}

fn dotted_path(pointer: &JSONPointer) -> String {
    let mut path = String::new();
    for chunk in pointer.iter() {
        match chunk {
            PathChunk::Property(name) => path = join(&path, name),
            PathChunk::Index(index) => path.push_str(&format!("[{}]", index)),
            PathChunk::Keyword(keyword) => path = join(&path, keyword),
        }
    }
    path
}

fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", path, name)
    }
}
