//! Error types for approval-core

use thiserror::Error;

use crate::ids::MergeRequestId;

/// A single field-scoped validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.field, self.message)
    }
}

/// Every validation failure for one rule, collected rather than raised one at
/// a time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Error)]
pub struct ValidationErrors {
    errors: Vec<ValidationError>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure on `field`.
    pub fn add(&mut self, field: &'static str, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field,
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Whether any failure was recorded on `field`.
    pub fn has(&self, field: &str) -> bool {
        self.errors.iter().any(|e| e.field == field)
    }

    /// Messages recorded on `field`, in insertion order.
    pub fn on(&self, field: &str) -> Vec<&str> {
        self.errors
            .iter()
            .filter(|e| e.field == field)
            .map(|e| e.message.as_str())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidationError> {
        self.errors.iter()
    }

    /// Fields with at least one failure, deduplicated, in first-seen order.
    pub fn fields(&self) -> Vec<&'static str> {
        let mut out: Vec<&'static str> = Vec::new();
        for e in &self.errors {
            if !out.contains(&e.field) {
                out.push(e.field);
            }
        }
        out
    }

    pub fn merge(&mut self, other: ValidationErrors) {
        self.errors.extend(other.errors);
    }

    /// `Ok(())` when nothing was recorded.
    pub fn into_result(self) -> std::result::Result<(), ValidationErrors> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let joined: Vec<String> = self.errors.iter().map(ToString::to_string).collect();
        write!(f, "{}", joined.join("; "))
    }
}

impl IntoIterator for ValidationErrors {
    type Item = ValidationError;
    type IntoIter = std::vec::IntoIter<ValidationError>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}

/// The evaluation context handed in by the caller is incomplete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("merge request {0} has no project")]
    MissingProject(MergeRequestId),

    #[error("tally belongs to merge request {actual}, expected {expected}")]
    MergeRequestMismatch {
        expected: MergeRequestId,
        actual: MergeRequestId,
    },
}

/// Invalid argument to reference rendering.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("Unknown format")]
    UnknownFormat(String),
}

/// Invalid argument to protected-environment lookups.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvironmentError {
    #[error("Environments must be in the same project")]
    MixedProjects,

    #[error("at least one environment is required")]
    NoEnvironments,
}

/// A rule definition cannot be projected onto a merge request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProjectionError {
    #[error("rule {0} has no report type to project")]
    MissingReportType(String),

    #[error("policy-driven rule {0} has no id to link the projection to")]
    MissingSourceRule(String),

    #[error("rule {rule} belongs to a different project than merge request {merge_request}")]
    ProjectMismatch {
        rule: String,
        merge_request: MergeRequestId,
    },
}

/// Umbrella error for callers that mix core operations.
#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Environment(#[from] EnvironmentError),

    #[error(transparent)]
    Projection(#[from] ProjectionError),
}

pub type Result<T> = std::result::Result<T, ApprovalError>;
