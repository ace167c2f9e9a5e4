//! Error types for the configuration store.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by foreground store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {message}")]
    ParseFailed { path: PathBuf, message: String },

    #[error("Config file '{path}' does not exist")]
    NotFound { path: PathBuf },

    #[error("Failed to write config file '{path}': {source}")]
    WriteFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to serialize config: {0}")]
    SerializeFailed(String),

    #[error("Failed to create directory '{path}': {source}")]
    DirectoryFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("No such field '{field}'{}", did_you_mean(.suggestion))]
    NoSuchField {
        field: String,
        suggestion: Option<String>,
    },

    #[error("Config '{path}' was never loaded successfully")]
    NotLoaded { path: PathBuf },

    #[error("Config '{path}' is closed")]
    Closed { path: PathBuf },

    #[error("Background task error: {0}")]
    Spawn(#[from] SpawnError),
}

fn did_you_mean(suggestion: &Option<String>) -> String {
    match suggestion {
        Some(s) => format!(" (did you mean '{}'?)", s),
        None => String::new(),
    }
}

impl StoreError {
    /// Returns true when the failure came from a file that exists but could not be parsed.
    pub fn is_parse_failure(&self) -> bool {
        matches!(self, StoreError::ParseFailed { .. })
    }
}

/// Failures starting work on the background runtime.
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("background runtime is being torn down")]
    TearingDown,

    #[error("failed to build background runtime: {0}")]
    Build(#[source] std::io::Error),
}

impl SpawnError {
    /// Whether this failure means the runtime is shutting down for good.
    pub fn is_teardown(&self) -> bool {
        matches!(self, SpawnError::TearingDown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_such_field_mentions_suggestion() {
        let err = StoreError::NoSuchField {
            field: "prot".into(),
            suggestion: Some("port".into()),
        };
        assert_eq!(err.to_string(), "No such field 'prot' (did you mean 'port'?)");

        let err = StoreError::NoSuchField {
            field: "zzz".into(),
            suggestion: None,
        };
        assert_eq!(err.to_string(), "No such field 'zzz'");
    }

    #[test]
    fn teardown_signature() {
        assert!(SpawnError::TearingDown.is_teardown());
        let build = SpawnError::Build(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert!(!build.is_teardown());
    }
}
