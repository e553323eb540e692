use std::time::Duration;

use thiserror::Error;

use crate::models::ValidationIssue;

/// Failure surfaced by a generation backend.
///
/// Every transport-level problem (connection errors, non-success status
/// codes, elapsed timeouts) is mapped onto this type so the stage runner can
/// treat them uniformly as retryable with backoff.
#[derive(Debug, Clone, Error)]
pub enum TransportFailure {
    #[error("network error: {0}")]
    Network(String),
    #[error("backend returned {code}: {body}")]
    Status { code: u16, body: String },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("unexpected response shape: {0}")]
    Response(String),
}

impl From<reqwest::Error> for TransportFailure {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            TransportFailure::Response(err.to_string())
        } else {
            TransportFailure::Network(err.to_string())
        }
    }
}

/// Failure of the durable store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("project not found: {0}")]
    NotFound(String),
    #[error("stage result not found: {0}")]
    ResultNotFound(uuid::Uuid),
}

/// Errors raised while executing the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Transport(#[from] TransportFailure),

    #[error("could not recover JSON from generated output: {preview}")]
    MalformedOutput { preview: String },

    #[error("stage {stage} output violates its schema: {}", format_issues(.errors))]
    SchemaViolation {
        stage: String,
        errors: Vec<ValidationIssue>,
    },

    #[error("stage {stage} failed after {attempts} attempts: {cause}")]
    ExhaustedRetries {
        stage: String,
        attempts: u32,
        #[source]
        cause: Box<PipelineError>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("unknown generation backend selector: {0}")]
    UnknownBackend(String),

    #[error("generation backend {selector} is unavailable: {reason}")]
    BackendUnavailable { selector: String, reason: String },

    #[error("invalid stage catalogue: {0}")]
    Catalogue(String),

    #[error("project not found: {0}")]
    ProjectNotFound(String),
}

impl PipelineError {
    /// Final validator error list carried by this error, if any.
    ///
    /// Looks through `ExhaustedRetries` so callers receive the list the
    /// validator produced on the last attempt.
    pub fn validation_errors(&self) -> Option<&[ValidationIssue]> {
        match self {
            PipelineError::SchemaViolation { errors, .. } => Some(errors),
            PipelineError::ExhaustedRetries { cause, .. } => cause.validation_errors(),
            _ => None,
        }
    }
}

fn format_issues(errors: &[ValidationIssue]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_through_exhausted_retries() {
        let issue = ValidationIssue::new("name", "missing required property");
        let err = PipelineError::ExhaustedRetries {
            stage: "ux".to_string(),
            attempts: 3,
            cause: Box::new(PipelineError::SchemaViolation {
                stage: "ux".to_string(),
                errors: vec![issue.clone()],
            }),
        };

        assert_eq!(err.validation_errors(), Some(&[issue][..]));
        assert!(err.to_string().contains("missing required property"));
    }

    #[test]
    fn test_malformed_output_has_no_validation_errors() {
        let err = PipelineError::MalformedOutput {
            preview: "nope".to_string(),
        };
        assert!(err.validation_errors().is_none());
    }
}
