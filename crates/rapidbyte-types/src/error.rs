//! Structured error returned by destination flushes.
//!
//! [`ConnectorError`] carries a classification, retry hints for the outer
//! orchestrator, and optional diagnostic details. The buffer itself never
//! retries; it records the first error and fails the run with it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad classification of a connector error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Invalid connector configuration.
    Config,
    /// Authentication or permission failure at the destination.
    Auth,
    /// Destination throttled the write (retryable).
    RateLimit,
    /// Transient network error (retryable).
    TransientNetwork,
    /// Transient storage/database error (retryable).
    TransientDb,
    /// Records the destination refused to accept.
    Data,
    /// Destination schema does not match the records.
    Schema,
    /// Bug or unexpected state inside the connector.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Config => "config",
            Self::Auth => "auth",
            Self::RateLimit => "rate_limit",
            Self::TransientNetwork => "transient_network",
            Self::TransientDb => "transient_db",
            Self::Data => "data",
            Self::Schema => "schema",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Whether the failed write may already be visible at the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitState {
    /// Nothing from the batch was committed.
    BeforeCommit,
    /// Commit was attempted; outcome unknown.
    AfterCommitUnknown,
    /// Batch committed before the error was raised.
    AfterCommitConfirmed,
}

/// Error raised by a destination flush.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("[{category}] {code}: {message}")]
pub struct ConnectorError {
    pub category: ErrorCategory,
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_state: Option<CommitState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ConnectorError {
    fn new(
        category: ErrorCategory,
        retryable: bool,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retryable,
            retry_after_ms: None,
            commit_state: None,
            details: None,
        }
    }

    /// Configuration error (not retryable).
    #[must_use]
    pub fn config(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Config, false, code, message)
    }

    /// Authentication error (not retryable).
    #[must_use]
    pub fn auth(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Auth, false, code, message)
    }

    /// Rate limit error (retryable).
    #[must_use]
    pub fn rate_limit(
        code: impl Into<String>,
        message: impl Into<String>,
        retry_after_ms: Option<u64>,
    ) -> Self {
        let mut err = Self::new(ErrorCategory::RateLimit, true, code, message);
        err.retry_after_ms = retry_after_ms;
        err
    }

    /// Transient network error (retryable).
    #[must_use]
    pub fn transient_network(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::TransientNetwork, true, code, message)
    }

    /// Transient database error (retryable).
    #[must_use]
    pub fn transient_db(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::TransientDb, true, code, message)
    }

    /// Rejected data (not retryable).
    #[must_use]
    pub fn data(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Data, false, code, message)
    }

    /// Schema mismatch (not retryable).
    #[must_use]
    pub fn schema(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Schema, false, code, message)
    }

    /// Internal connector error (not retryable).
    #[must_use]
    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, false, code, message)
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    #[must_use]
    pub fn with_commit_state(mut self, state: CommitState) -> Self {
        self.commit_state = Some(state);
        self
    }

    /// True when retrying the run cannot duplicate or lose the failed batch.
    #[must_use]
    pub fn safe_to_retry(&self) -> bool {
        self.retryable && self.commit_state != Some(CommitState::AfterCommitUnknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_defaults() {
        let err = ConnectorError::config("MISSING_TABLE", "table is required");
        assert_eq!(err.category, ErrorCategory::Config);
        assert!(!err.retryable);
        assert!(!err.safe_to_retry());
    }

    #[test]
    fn transient_errors_are_retryable() {
        assert!(ConnectorError::transient_network("TIMEOUT", "timed out").safe_to_retry());
        assert!(ConnectorError::transient_db("DEADLOCK", "deadlock").safe_to_retry());
    }

    #[test]
    fn after_commit_unknown_is_not_safe_to_retry() {
        let err = ConnectorError::transient_db("COMMIT", "commit outcome unknown")
            .with_commit_state(CommitState::AfterCommitUnknown);
        assert!(err.retryable);
        assert!(!err.safe_to_retry());
    }

    #[test]
    fn serde_roundtrip_keeps_details() {
        let err = ConnectorError::rate_limit("THROTTLED", "slow down", Some(5000))
            .with_details(serde_json::json!({"bucket": "raw-events"}));
        let json = serde_json::to_string(&err).unwrap();
        let back: ConnectorError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);
    }

    #[test]
    fn display_format() {
        let err = ConnectorError::data("BAD_ROW", "null in non-null column");
        assert_eq!(err.to_string(), "[data] BAD_ROW: null in non-null column");
    }
}
