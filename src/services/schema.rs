// src/services/schema.rs
//! Boundary interface to the structural schema validator.
//!
//! Shape validation is an external collaborator's job; the stores only care
//! that a validator is consulted before a proposal or decision is persisted
//! and that a failure blocks the write. The in-tree default checks field
//! presence, nothing more; callers substitute their own implementation.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Proposal,
    Decision,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Proposal => "proposal",
            RecordKind::Decision => "decision",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Validation {
    pub valid: bool,
    pub error: Option<String>,
}

impl Validation {
    pub fn ok() -> Self {
        Self { valid: true, error: None }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(msg.into()),
        }
    }
}

pub trait SchemaValidator: Send + Sync {
    fn validate(&self, kind: RecordKind, record: &Value) -> Validation;
}

/// Minimal default: required string fields must be present and non-empty.
#[derive(Debug, Default)]
pub struct FieldPresenceValidator;

impl FieldPresenceValidator {
    fn required(kind: RecordKind) -> &'static [&'static str] {
        match kind {
            RecordKind::Proposal => &["id", "skill_name", "diff", "status"],
            RecordKind::Decision => &["proposal_id", "decision", "decided_by"],
        }
    }
}

impl SchemaValidator for FieldPresenceValidator {
    fn validate(&self, kind: RecordKind, record: &Value) -> Validation {
        for field in Self::required(kind) {
            match record.get(field) {
                Some(Value::String(s)) if !s.trim().is_empty() => {}
                Some(Value::String(_)) | None => {
                    return Validation::invalid(format!(
                        "{} record missing required field {:?}",
                        kind.as_str(),
                        field
                    ));
                }
                Some(_) => {}
            }
        }
        Validation::ok()
    }
}
