//! Error types for sandboxed script contexts

use crate::handle::Handle;
use crate::ContextId;
use rquickjs::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias for contextify operations
pub type Result<T> = std::result::Result<T, ContextifyError>;

/// Errors surfaced by sandbox construction and script execution
#[derive(Debug, Error)]
pub enum ContextifyError {
    /// The sandbox reference was absent or not an object
    #[error("Invalid sandbox object: {message}")]
    Construction { message: String },

    /// The supplied source failed to parse
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// The executed script threw
    #[error(transparent)]
    Thrown(#[from] ThrownException),

    /// The sandbox context has already been destroyed
    #[error("Sandbox context {id} has been destroyed")]
    Destroyed { id: ContextId },

    /// Engine failure that is not a script exception
    #[error("Engine error: {message}")]
    Engine { message: String },

    /// Conversion between JSON and engine values failed
    #[error("Type conversion error: {message}")]
    Conversion { message: String },

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),
}

impl ContextifyError {
    /// Create a construction error
    pub fn construction(msg: impl Into<String>) -> Self {
        Self::Construction {
            message: msg.into(),
        }
    }

    /// Create an engine error
    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine {
            message: msg.into(),
        }
    }

    /// Create a type conversion error
    pub fn conversion(msg: impl Into<String>) -> Self {
        Self::Conversion {
            message: msg.into(),
        }
    }
}

impl From<rquickjs::Error> for ContextifyError {
    fn from(error: rquickjs::Error) -> Self {
        Self::engine(error.to_string())
    }
}

/// Syntax error in source handed to [`crate::SandboxContext::run`]
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{filename}{}: SyntaxError: {message}", position(.line, .column))]
pub struct CompileError {
    /// Engine diagnostic
    pub message: String,
    /// Filename given to `run`, or the configured anonymous label
    pub filename: String,
    /// 1-based line, when the engine reports one
    pub line: Option<u32>,
    /// 1-based column, when the engine reports one
    pub column: Option<u32>,
}

fn position(line: &Option<u32>, column: &Option<u32>) -> String {
    match (*line, *column) {
        (Some(line), Some(column)) => format!(":{}:{}", line, column),
        (Some(line), None) => format!(":{}", line),
        _ => String::new(),
    }
}

/// Plain-data description of a thrown value
///
/// This is what survives once the value itself can no longer be restored,
/// e.g. after crossing a thread boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionReport {
    /// `name` of the thrown error object, if it had one
    pub name: Option<String>,
    /// `message` of an error object, or the string coercion of a primitive
    pub message: String,
    /// `stack` of the thrown error object, if it had one
    pub stack: Option<String>,
    /// Filename label of the `run` call that threw
    pub filename: String,
}

impl fmt::Display for ExceptionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}: {}", name, self.message),
            None => write!(f, "Uncaught {}", self.message),
        }
    }
}

/// An exception thrown by sandboxed script code
///
/// `value` is the exact thrown value, not a copy, so host code can compare
/// identity or inspect it further by restoring it in any context of the
/// engine. It keeps the engine alive, so the error may outlive the caller's
/// own engine handle.
#[derive(Error)]
#[error("{report}")]
pub struct ThrownException {
    /// The thrown value
    pub value: Handle<Value<'static>>,
    /// Extracted name, message and stack
    pub report: ExceptionReport,
}

impl fmt::Debug for ThrownException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrownException")
            .field("report", &self.report)
            .finish_non_exhaustive()
    }
}

impl ThrownException {
    /// Message of the thrown value
    pub fn message(&self) -> &str {
        &self.report.message
    }

    /// Name of the thrown error, if any
    pub fn name(&self) -> Option<&str> {
        self.report.name.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_error_display_with_position() {
        let error = CompileError {
            message: "unexpected token in expression: ')'".to_string(),
            filename: "config.js".to_string(),
            line: Some(3),
            column: Some(7),
        };
        assert_eq!(
            error.to_string(),
            "config.js:3:7: SyntaxError: unexpected token in expression: ')'"
        );
    }

    #[test]
    fn test_compile_error_display_without_position() {
        let error = CompileError {
            message: "expecting ';'".to_string(),
            filename: "evalmachine.<anonymous>".to_string(),
            line: None,
            column: None,
        };
        assert_eq!(
            error.to_string(),
            "evalmachine.<anonymous>: SyntaxError: expecting ';'"
        );
    }

    #[test]
    fn test_exception_report_display() {
        let report = ExceptionReport {
            name: Some("TypeError".to_string()),
            message: "x is not a function".to_string(),
            stack: None,
            filename: "a.js".to_string(),
        };
        assert_eq!(report.to_string(), "TypeError: x is not a function");

        let primitive = ExceptionReport {
            name: None,
            message: "42".to_string(),
            stack: None,
            filename: "a.js".to_string(),
        };
        assert_eq!(primitive.to_string(), "Uncaught 42");
    }

    #[test]
    fn test_construction_helper() {
        let error = ContextifyError::construction("expected an object, got number");
        assert_eq!(
            error.to_string(),
            "Invalid sandbox object: expected an object, got number"
        );
    }
}
