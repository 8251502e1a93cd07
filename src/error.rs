//! Typed errors, aggregated validation reports, and HTTP mapping.

use crate::migration::SchemaChange;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Registration and graph failures. Always fatal: a registry never holds a partially registered batch.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("invalid schema for '{resource}': {message}")]
    Invalid { resource: String, message: String },
    #[error("duplicate resource: {0}")]
    DuplicateResource(String),
    #[error("relationship '{resource}.{relationship}': {message}")]
    Relationship {
        resource: String,
        relationship: String,
        message: String,
    },
    #[error("ownership cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
    #[error("cannot order resources, unresolved: {}", unresolved.join(", "))]
    Unordered { unresolved: Vec<String> },
    #[error("hook or validator '{name}' referenced by '{resource}' is not bound")]
    UnboundHook { resource: String, name: String },
    #[error("registry is sealed; cannot register '{0}'")]
    Sealed(String),
    #[error("definition load: {0}")]
    Load(String),
}

impl SchemaError {
    pub(crate) fn invalid(resource: &str, message: impl Into<String>) -> Self {
        SchemaError::Invalid {
            resource: resource.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn relationship(resource: &str, relationship: &str, message: impl Into<String>) -> Self {
        SchemaError::Relationship {
            resource: resource.to_string(),
            relationship: relationship.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}'")]
    InvalidVar { key: &'static str, value: String },
}

/// One failing field or rule inside a [`ValidationReport`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Violation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub rule: String,
    pub message: String,
}

/// Every problem found across field constraints, invariants, procedural checks and uniqueness.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    violations: Vec<Violation>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: &str, rule: &str, message: impl Into<String>) {
        self.violations.push(Violation {
            field: Some(field.to_string()),
            rule: rule.to_string(),
            message: message.into(),
        });
    }

    /// Violation not tied to a single field (resource-level rule).
    pub fn add_resource(&mut self, rule: &str, message: impl Into<String>) {
        self.violations.push(Violation {
            field: None,
            rule: rule.to_string(),
            message: message.into(),
        });
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.violations.extend(other.violations);
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.violations.len()
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    /// True if a violation of `rule` was reported for `field`.
    pub fn has(&self, field: &str, rule: &str) -> bool {
        self.violations
            .iter()
            .any(|v| v.field.as_deref() == Some(field) && v.rule == rule)
    }

    pub fn into_result(self) -> Result<(), EngineError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Validation(self))
        }
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<&str> = self.violations.iter().map(|v| v.message.as_str()).collect();
        write!(f, "{}", messages.join("; "))
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("unknown resource: {0}")]
    UnknownResource(String),
    #[error("unknown field '{field}' for resource '{resource}'")]
    UnknownField { resource: String, field: String },
    #[error("relationship resolution: {0}")]
    RelationshipResolution(String),
    #[error("include depth {max_depth} exceeded at {}", path.join(" -> "))]
    DepthExceeded { path: Vec<String>, max_depth: usize },
    #[error("migration {version} requires confirmation: {}", describe_changes(changes))]
    MigrationSafety { version: i64, changes: Vec<SchemaChange> },
    #[error("migration: {0}")]
    Migration(String),
    #[error("query build: {0}")]
    QueryBuild(String),
    #[error("not found: {resource} {id}")]
    NotFound { resource: String, id: String },
    #[error("validation: {0}")]
    Validation(ValidationReport),
    #[error("transaction conflict: {0}")]
    TransactionConflict(String),
    #[error("transaction failed: {0}")]
    TransactionFatal(String),
    #[error("hook '{hook}' failed: {message}")]
    Hook { hook: String, message: String },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("database: {0}")]
    Db(sqlx::Error),
}

fn describe_changes(changes: &[SchemaChange]) -> String {
    changes
        .iter()
        .map(SchemaChange::describe)
        .collect::<Vec<_>>()
        .join("; ")
}

impl EngineError {
    /// Serialization failures and deadlocks; the only errors a unit of work is re-run for.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::TransactionConflict(_))
    }
}

/// SQLSTATE 40001 (serialization_failure) and 40P01 (deadlock_detected) are conflicts.
impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            if matches!(db.code().as_deref(), Some("40001") | Some("40P01")) {
                return EngineError::TransactionConflict(db.message().to_string());
            }
        }
        EngineError::Db(e)
    }
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            EngineError::Schema(_) | EngineError::Config(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "schema_error")
            }
            EngineError::UnknownResource(_) | EngineError::NotFound { .. } => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            EngineError::UnknownField { .. } | EngineError::QueryBuild(_) => {
                (StatusCode::BAD_REQUEST, "bad_request")
            }
            EngineError::RelationshipResolution(_) | EngineError::DepthExceeded { .. } => {
                (StatusCode::BAD_REQUEST, "relationship_error")
            }
            EngineError::MigrationSafety { .. } | EngineError::Migration(_) => {
                (StatusCode::CONFLICT, "migration_error")
            }
            EngineError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "validation_error"),
            EngineError::Hook { .. } => (StatusCode::BAD_REQUEST, "hook_error"),
            EngineError::TransactionConflict(_) => (StatusCode::CONFLICT, "conflict"),
            EngineError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            EngineError::TransactionFatal(_) | EngineError::Db(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "database_error")
            }
        };
        let details = match &self {
            EngineError::Validation(report) => serde_json::to_value(report.violations()).ok(),
            _ => None,
        };
        let body = ErrorBody {
            error: ErrorDetail {
                code: code.to_string(),
                message: self.to_string(),
                details,
            },
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_aggregates_and_renders_every_violation() {
        let mut report = ValidationReport::new();
        report.add("title", "required", "title is required");
        report.add("age", "minimum", "age must be at least 18");
        report.add_resource("check", "dates out of order");
        assert_eq!(report.len(), 3);
        assert!(report.has("age", "minimum"));
        assert!(!report.has("age", "required"));
        assert_eq!(
            report.to_string(),
            "title is required; age must be at least 18; dates out of order"
        );
        assert!(matches!(report.into_result(), Err(EngineError::Validation(r)) if r.len() == 3));
    }

    #[test]
    fn only_conflicts_are_retryable() {
        assert!(EngineError::TransactionConflict("40001".into()).is_retryable());
        assert!(!EngineError::TransactionFatal("boom".into()).is_retryable());
        assert!(!EngineError::QueryBuild("bad".into()).is_retryable());
    }

    #[test]
    fn validation_errors_map_to_unprocessable_entity() {
        let mut report = ValidationReport::new();
        report.add("email", "format", "email must be a valid email");
        let response = EngineError::Validation(report).into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let response = EngineError::NotFound {
            resource: "posts".into(),
            id: "7".into(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
