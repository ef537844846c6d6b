use serde_json::Value;
use thiserror::Error;

use outpost_protocol::ErrorCode;
use outpost_protocol::WireError;

pub type Result<T> = std::result::Result<T, ToolError>;

/// Error value for every outward-visible failure in the kernel.
///
/// Carries exactly one code from the closed set, a plain-English message
/// that is safe to log, and optional structured details (pattern, command,
/// path). Details must never include file contents or the auth token.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct ToolError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<Value>,
}

impl ToolError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(code: ErrorCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    /// Add one wrapping layer of diagnostic context without changing the code.
    pub fn context(mut self, context: &str) -> Self {
        self.message = format!("{context}: {}", self.message);
        self
    }

    pub fn to_wire(&self) -> WireError {
        WireError {
            code: self.code,
            message: self.message.clone(),
            details: self.details.clone(),
        }
    }
}

impl From<std::io::Error> for ToolError {
    fn from(err: std::io::Error) -> Self {
        let code = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorCode::PathNotFound,
            _ => ErrorCode::InternalError,
        };
        ToolError::new(code, err.to_string())
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(err: serde_json::Error) -> Self {
        ToolError::new(ErrorCode::InternalError, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_protocol::ErrorCode;
    use pretty_assertions::assert_eq;

    #[test]
    fn io_not_found_maps_to_path_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = ToolError::from(io);
        assert_eq!(err.code, ErrorCode::PathNotFound);
    }

    #[test]
    fn context_keeps_the_code() {
        let err = ToolError::new(ErrorCode::PatchFailed, "corrupt patch").context("fs.apply_patch");
        assert_eq!(err.code, ErrorCode::PatchFailed);
        assert_eq!(err.message, "fs.apply_patch: corrupt patch");
    }
}
