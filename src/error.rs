//! Error types for the backrun orchestrator.
//!
//! This module provides a unified error type [`BackrunError`] for all backrun operations,
//! along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Request validation**: bad configuration, bad cron expressions, stale config writes
//!   and unknown ids. These are rejected before any state change.
//! - **Workflow execution**: the backup tool exiting non-zero or being cancelled. These are
//!   recorded on the enclosing operation rather than surfaced to the API caller.
//! - **Storage**: operation log and log store faults. Fatal to the enclosing operation only.
//!
//! # Example
//!
//! ```rust
//! use backrun::error::{BackrunError, Result};
//!
//! fn lookup_plan(id: &str) -> Result<()> {
//!     if id.is_empty() {
//!         return Err(BackrunError::Validation("plan id cannot be empty".into()));
//!     }
//!     Err(BackrunError::NotFound(format!("plan {}", id)))
//! }
//!
//! assert!(lookup_plan("nightly").is_err());
//! ```

use std::io;
use thiserror::Error;

/// Main error type for backrun operations.
#[derive(Error, Debug)]
pub enum BackrunError {
    // Request-time errors
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Stale config: expected modno {expected}, got {got}")]
    StaleConfig { expected: u64, got: u64 },

    #[error("Not found: {0}")]
    NotFound(String),

    // Workflow errors
    #[error("Command `{command}` failed ({}): {tail}", exit_description(.code))]
    Process {
        command: String,
        code: Option<i32>,
        tail: String,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Backup tool error: {0}")]
    Tool(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Storage errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn exit_description(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}

impl BackrunError {
    /// Check if the error is the distinguished cancellation outcome.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BackrunError::Cancelled)
    }
}

impl From<rocksdb::Error> for BackrunError {
    fn from(e: rocksdb::Error) -> Self {
        BackrunError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for BackrunError {
    fn from(e: serde_json::Error) -> Self {
        BackrunError::Serialization(e.to_string())
    }
}

/// Result type alias for backrun operations.
pub type Result<T> = std::result::Result<T, BackrunError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_error_display() {
        let err = BackrunError::Process {
            command: "restic backup".to_string(),
            code: Some(3),
            tail: "Fatal: unable to open repository".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("exit code 3"));
        assert!(msg.contains("unable to open repository"));

        let killed = BackrunError::Process {
            command: "restic backup".to_string(),
            code: None,
            tail: String::new(),
        };
        assert!(killed.to_string().contains("terminated by signal"));
    }

    #[test]
    fn test_classification() {
        assert!(BackrunError::Cancelled.is_cancelled());
        assert!(!BackrunError::Tool("bad json".into()).is_cancelled());
    }
}
