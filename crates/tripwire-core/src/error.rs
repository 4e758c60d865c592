//! Error types for tripwire operations.
//!
//! This module provides the error hierarchy for the automation engine, with
//! structured error codes and suggestions for resolution.

use std::collections::HashMap;
use thiserror::Error;

/// Result type alias for automation operations.
pub type AutomationResult<T> = Result<T, AutomationError>;

/// Main error type for all automation operations.
#[derive(Error, Debug)]
pub enum AutomationError {
    /// Input validation failed.
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        code: ErrorCode,
        details: HashMap<String, String>,
        suggestion: Option<String>,
    },

    /// Database operation failed.
    #[error("Database error: {message}")]
    Database {
        message: String,
        code: ErrorCode,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Parse error.
    #[error("Parse error: {message}")]
    Parse { message: String, code: ErrorCode },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The action executor reported a failure.
    #[error("Execution error: {message}")]
    Execution {
        message: String,
        code: ErrorCode,
        schedule_id: Option<String>,
    },

    /// The engine has not been started yet.
    #[error("Automation engine not initialized")]
    NotStarted,

    /// The engine has been torn down.
    #[error("Automation engine torn down")]
    TornDown,

    /// The request was still queued when the engine shut down.
    #[error("Operation cancelled")]
    Cancelled,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error codes for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Validation (VAL_xxx)
    ValInvalidInput,
    ValMissingField,
    ValInvalidWindow,

    // Database (DB_xxx)
    DbConnectionFailed,
    DbOperationFailed,

    // Parse (PARSE_xxx)
    ParseInvalidJson,
    ParseInvalidPredicate,

    // Execution (EXEC_xxx)
    ExecFailed,

    // Lifecycle (LIFE_xxx)
    LifeNotStarted,
    LifeTornDown,
    LifeCancelled,

    // Internal
    Internal,
}

impl ErrorCode {
    /// Get the string representation of the error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValInvalidInput => "VAL_001",
            ErrorCode::ValMissingField => "VAL_002",
            ErrorCode::ValInvalidWindow => "VAL_003",
            ErrorCode::DbConnectionFailed => "DB_001",
            ErrorCode::DbOperationFailed => "DB_002",
            ErrorCode::ParseInvalidJson => "PARSE_001",
            ErrorCode::ParseInvalidPredicate => "PARSE_002",
            ErrorCode::ExecFailed => "EXEC_001",
            ErrorCode::LifeNotStarted => "LIFE_001",
            ErrorCode::LifeTornDown => "LIFE_002",
            ErrorCode::LifeCancelled => "LIFE_003",
            ErrorCode::Internal => "INT_001",
        }
    }
}

impl AutomationError {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            code: ErrorCode::ValInvalidInput,
            details: HashMap::new(),
            suggestion: None,
        }
    }

    /// Create a validation error with suggestion.
    pub fn validation_with_suggestion(
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Validation {
            message: message.into(),
            code: ErrorCode::ValInvalidInput,
            details: HashMap::new(),
            suggestion: Some(suggestion.into()),
        }
    }

    /// Create a parse error.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
            code: ErrorCode::ParseInvalidJson,
        }
    }

    /// Create a predicate parse error.
    pub fn predicate(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
            code: ErrorCode::ParseInvalidPredicate,
        }
    }

    /// Create a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            code: ErrorCode::DbOperationFailed,
            source: None,
        }
    }

    /// Create an execution error for a schedule.
    pub fn execution(schedule_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            code: ErrorCode::ExecFailed,
            schedule_id: Some(schedule_id.into()),
        }
    }

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation { code, .. } => *code,
            Self::Database { code, .. } => *code,
            Self::Parse { code, .. } => *code,
            Self::Execution { code, .. } => *code,
            Self::NotStarted => ErrorCode::LifeNotStarted,
            Self::TornDown => ErrorCode::LifeTornDown,
            Self::Cancelled => ErrorCode::LifeCancelled,
            _ => ErrorCode::Internal,
        }
    }

    /// Get a user-friendly suggestion for resolving this error.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Validation { suggestion, .. } => suggestion.as_deref(),
            Self::Database { .. } => Some("Please check the automation database path and permissions"),
            Self::NotStarted => Some("Call start() before using the automation engine"),
            Self::TornDown => Some("Create and start a new automation engine"),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for AutomationError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database {
            message: err.to_string(),
            code: ErrorCode::DbOperationFailed,
            source: Some(Box::new(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error() {
        let err = AutomationError::validation("Invalid input");
        assert_eq!(err.code(), ErrorCode::ValInvalidInput);
        assert!(err.to_string().contains("Invalid input"));
    }

    #[test]
    fn test_lifecycle_errors() {
        assert_eq!(AutomationError::NotStarted.code(), ErrorCode::LifeNotStarted);
        assert_eq!(AutomationError::TornDown.code().as_str(), "LIFE_002");
        assert_eq!(AutomationError::Cancelled.code(), ErrorCode::LifeCancelled);
        assert!(AutomationError::NotStarted.suggestion().is_some());
    }

    #[test]
    fn test_predicate_error_code() {
        let err = AutomationError::predicate("bad matcher");
        assert_eq!(err.code(), ErrorCode::ParseInvalidPredicate);
        assert_eq!(err.code().as_str(), "PARSE_002");
    }

    #[test]
    fn test_sqlite_error_maps_to_database() {
        let err: AutomationError = rusqlite::Error::InvalidQuery.into();
        assert_eq!(err.code(), ErrorCode::DbOperationFailed);
    }
}
