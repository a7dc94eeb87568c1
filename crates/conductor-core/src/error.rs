use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Symbolic error code carried by every failure surfaced from a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidInput,
    Timeout,
    ExecutionFailed,
    UnknownError,
    InitializationFailed,
    /// Caller-defined code raised from inside a handler.
    Custom(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            Self::InvalidInput => "INVALID_INPUT",
            Self::Timeout => "TIMEOUT",
            Self::ExecutionFailed => "EXECUTION_FAILED",
            Self::UnknownError => "UNKNOWN_ERROR",
            Self::InitializationFailed => "INITIALIZATION_FAILED",
            Self::Custom(code) => code,
        }
    }

    pub fn parse(code: &str) -> Self {
        match code {
            "INVALID_INPUT" => Self::InvalidInput,
            "TIMEOUT" => Self::Timeout,
            "EXECUTION_FAILED" => Self::ExecutionFailed,
            "UNKNOWN_ERROR" => Self::UnknownError,
            "INITIALIZATION_FAILED" => Self::InitializationFailed,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let code = String::deserialize(deserializer)?;
        Ok(Self::parse(&code))
    }
}

/// The typed error every run failure is normalized into.
///
/// Handlers may return one directly (wrapped in `anyhow::Error`) to control
/// the code a caller sees; anything else is wrapped as `UNKNOWN_ERROR`.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct AgentError {
    pub message: String,
    pub code: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl AgentError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code,
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self::new(
            ErrorCode::Timeout,
            format!("Operation timed out after {}ms", timeout_ms),
        )
        .with_details(serde_json::json!({ "timeout_ms": timeout_ms }))
    }

    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ExecutionFailed, message)
    }

    pub fn custom(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Custom(code.into()), message)
    }

    /// Normalize an arbitrary handler error.
    ///
    /// Typed errors pass through untouched. Anything else becomes
    /// `UNKNOWN_ERROR` with the original message and cause chain kept in
    /// `details`.
    pub fn normalize(err: anyhow::Error) -> Self {
        match err.downcast::<AgentError>() {
            Ok(typed) => typed,
            Err(raw) => {
                let chain: Vec<String> = raw.chain().skip(1).map(|c| c.to_string()).collect();
                Self::new(ErrorCode::UnknownError, raw.to_string()).with_details(
                    serde_json::json!({
                        "error": raw.to_string(),
                        "chain": chain,
                    }),
                )
            }
        }
    }

    /// Normalize the payload of a caught panic.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = panic_message(payload.as_ref());
        Self::new(ErrorCode::UnknownError, format!("panicked: {}", message))
            .with_details(serde_json::json!({ "panic": message }))
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Errors outside a run: configuration, CLI input, I/O.
#[derive(Debug, Error)]
pub enum ConductorError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConductorError>;
