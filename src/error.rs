use thiserror::Error;

/// Every failure the builder or its backend can report.
///
/// None of these are recovered locally: a layer constructor either returns
/// its output tensor with all parameters registered, or it returns `Err`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OpsError {
    /// Unrecognized dtype, initializer, regularizer or other enum-like setting.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A tensor argument was expected but something else was supplied.
    #[error("Expected a tensor but received {0}")]
    NotATensor(String),

    #[error("Shape mismatch in operation '{operation}': expected {expected}, got {got}")]
    ShapeMismatch {
        operation: String,
        expected: String,
        got: String,
    },

    /// A `function:` or `class:` path that is not present in the registry.
    #[error("Unresolved symbol: {0}")]
    UnresolvedSymbol(String),

    #[error("Backend error in operation '{operation}': {reason}")]
    Backend { operation: String, reason: String },

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Json(String),
}

pub type Result<T> = std::result::Result<T, OpsError>;

impl OpsError {
    pub fn shape_mismatch(
        operation: impl Into<String>,
        expected: impl ToString,
        got: impl ToString,
    ) -> Self {
        OpsError::ShapeMismatch {
            operation: operation.into(),
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }

    pub fn backend(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        OpsError::Backend {
            operation: operation.into(),
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for OpsError {
    fn from(err: std::io::Error) -> Self {
        OpsError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for OpsError {
    fn from(err: serde_json::Error) -> Self {
        OpsError::Json(err.to_string())
    }
}
