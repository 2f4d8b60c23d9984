//! Error taxonomy for the quota engine.
//!
//! Validation failures reject the offending object and leave in-memory state
//! unchanged; not-found conditions are logged and ignored by callers for
//! idempotency; admission denials are never errors; `OutOfSync` carries a BUG
//! marker because it indicates a missed invariant between the quota map and
//! the tree.

use api_types::ObjectParseError;
use error_stack::Report;

#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    #[error("quota already exists: {0}")]
    AlreadyExists(String),

    #[error("quota not found: {0}")]
    NotFound(String),

    #[error("namespace {namespace} is already bound to quota {quota}")]
    NamespaceAlreadyBound { namespace: String, quota: String },

    #[error("invalid quota {name}: {message}")]
    InvalidQuota { name: String, message: String },

    #[error("cannot modify reserved quota group {0}")]
    ForbiddenModify(String),

    #[error("cannot delete quota group {0}")]
    ForbiddenDelete(String),

    #[error("delete quota failed, quota {0} has child quota")]
    HasChildren(String),

    #[error("quota {0} still has pods")]
    HasPods(String),

    #[error("invalid quota object: {0}")]
    InvalidObject(String),

    #[error("BUG: quota map and quota tree out of sync, lost {0}")]
    OutOfSync(String),
}

impl From<Report<ObjectParseError>> for QuotaError {
    fn from(report: Report<ObjectParseError>) -> Self {
        QuotaError::InvalidObject(report.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QuotaError>;
