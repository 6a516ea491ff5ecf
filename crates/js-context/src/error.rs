//! Context error types.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Crate-specific result type.
pub type Result<T> = std::result::Result<T, ContextError>;

/// A thrown JavaScript value converted to a host-readable form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsException {
    /// Error class name (`Error`, `TypeError`, ...). Empty for non-error throws.
    pub name: String,
    /// The error message, or the stringified value for non-error throws.
    pub message: String,
    /// Stack trace, when the engine recorded one.
    pub stack: Option<String>,
    /// The thrown value itself.
    pub value: serde_json::Value,
}

impl JsException {
    /// Create an exception with only a name and message.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        let name = name.into();
        let message = message.into();
        let value = serde_json::json!({ "name": name, "message": message });
        Self {
            name,
            message,
            stack: None,
            value,
        }
    }

    pub(crate) fn is_syntax_error(&self) -> bool {
        self.name == "SyntaxError"
    }

    /// The exact error the engine throws when an allocation hits the heap limit.
    pub(crate) fn is_out_of_memory(&self) -> bool {
        self.name == "InternalError" && self.message == "out of memory"
    }

    pub(crate) fn is_reference_error(&self) -> bool {
        self.name == "ReferenceError"
    }
}

impl fmt::Display for JsException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "Uncaught {}", self.message)
        } else {
            write!(f, "Uncaught {}: {}", self.name, self.message)
        }
    }
}

/// Errors that can occur while driving a [`Context`](crate::Context).
#[derive(Error, Debug)]
pub enum ContextError {
    /// Source failed to parse or a static import could not be resolved.
    #[error("compile error: {0}")]
    Compile(JsException),

    /// The referenced binding does not exist or is not callable.
    #[error("name error: {0}")]
    Name(String),

    /// A handle or promise was used with a context that did not create it.
    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    /// An uncaught exception or promise rejection.
    #[error("runtime error: {0}")]
    Runtime(JsException),

    /// A promise was queried before it settled.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A synchronous operation ran past the configured timeout.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The heap ceiling was exceeded.
    #[error("out of memory (heap limit: {limit:?} bytes)")]
    OutOfMemory { limit: Option<usize> },

    /// The context can no longer be used.
    #[error("context is unusable: {0}")]
    Fatal(String),

    /// A value could not be converted between the host and the engine.
    #[error("conversion error: {0}")]
    Conversion(String),

    #[error("file not found: {}", path.display())]
    FileNotFound { path: PathBuf },

    #[error("not a directory: {}", path.display())]
    NotADirectory { path: PathBuf },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create the engine runtime or context.
    #[error("failed to initialize JS engine: {0}")]
    Init(String),

    /// Unexpected error reported by the engine binding.
    #[error("engine error: {0}")]
    Engine(#[from] rquickjs::Error),
}

impl ContextError {
    /// Create a name error.
    pub fn name(msg: impl Into<String>) -> Self {
        Self::Name(msg.into())
    }

    /// Create an invalid-handle error.
    pub fn invalid_handle(msg: impl Into<String>) -> Self {
        Self::InvalidHandle(msg.into())
    }

    /// Create an invalid-state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a conversion error.
    pub fn conversion(msg: impl Into<String>) -> Self {
        Self::Conversion(msg.into())
    }

    /// Create a fatal error.
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Whether the context must be discarded after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::OutOfMemory { .. } | Self::Fatal(_)
        )
    }

    /// The JS exception carried by this error, if any.
    pub fn exception(&self) -> Option<&JsException> {
        match self {
            Self::Compile(exc) | Self::Runtime(exc) => Some(exc),
            _ => None,
        }
    }
}
