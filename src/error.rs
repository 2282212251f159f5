use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use strum::{Display, EnumString};
use thiserror::Error;

/// Which resource limit a task ran into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResourceLimit {
    Timeout,
    ConcurrencyCap,
    RateLimited,
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    /// Rejected input, never enqueued. `code` is a stable machine-readable reason.
    #[error("Validation error ({code}): {message}")]
    Validation { code: String, message: String },

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Timeout, concurrency cap or rate limit
    #[error("Resource exhausted ({reason}): {message}")]
    ResourceExhausted { reason: ResourceLimit, message: String },

    /// One or more parse batches failed; the merge gate refuses a partial result
    #[error("Partial failure: batches {} failed", .failed_batches.join(", "))]
    PartialFailure { failed_batches: Vec<String> },

    /// Queue, store or ledger unreachable
    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    /// Job was cancelled
    #[error("Job cancelled: {0}")]
    Cancelled(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal server errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// Invalid state transition
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),
}

impl AppError {
    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::Validation {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn exhausted(reason: ResourceLimit, message: impl Into<String>) -> Self {
        AppError::ResourceExhausted {
            reason,
            message: message.into(),
        }
    }

    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation { .. } => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::ResourceExhausted { reason, .. } => match reason {
                ResourceLimit::RateLimited => StatusCode::TOO_MANY_REQUESTS,
                _ => StatusCode::SERVICE_UNAVAILABLE,
            },
            AppError::PartialFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Infrastructure(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Cancelled(_) => StatusCode::CONFLICT,
            AppError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::InvalidStateTransition(_) => StatusCode::CONFLICT,
        }
    }

    /// Get error code string
    pub fn error_code(&self) -> &str {
        match self {
            AppError::Validation { code, .. } => code.as_str(),
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::ResourceExhausted { .. } => "RESOURCE_EXHAUSTED",
            AppError::PartialFailure { .. } => "PARTIAL_FAILURE",
            AppError::Infrastructure(_) => "INFRASTRUCTURE",
            AppError::Cancelled(_) => "CANCELLED",
            AppError::Configuration(_) => "CONFIGURATION_ERROR",
            AppError::Io(_) => "IO_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
            AppError::InvalidStateTransition(_) => "INVALID_STATE_TRANSITION",
        }
    }
}

/// Coarse error class recorded on failed tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskErrorKind {
    Validation,
    ResourceExhausted,
    PartialFailure,
    Infrastructure,
    Cancelled,
    Internal,
}

/// Structured failure reported by a task to the ledger and the event bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub context: serde_json::Value,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            context: serde_json::Value::Null,
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    /// Resource exhaustion and infrastructure faults are worth another attempt
    pub fn retryable(&self) -> bool {
        matches!(
            self.kind,
            TaskErrorKind::ResourceExhausted | TaskErrorKind::Infrastructure
        )
    }

    /// Human-readable form stored as the job's `error` string
    pub fn display_message(&self) -> String {
        format!("{}: {}", self.code, self.message)
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.kind, self.code, self.message)
    }
}

impl From<&AppError> for TaskError {
    fn from(err: &AppError) -> Self {
        match err {
            AppError::Validation { code, message } => {
                TaskError::new(TaskErrorKind::Validation, code.clone(), message.clone())
            }
            AppError::ResourceExhausted { reason, message } => TaskError::new(
                TaskErrorKind::ResourceExhausted,
                reason.to_string(),
                message.clone(),
            ),
            AppError::PartialFailure { failed_batches } => TaskError::new(
                TaskErrorKind::PartialFailure,
                "batches_failed",
                err.to_string(),
            )
            .with_context(json!({ "failedBatches": failed_batches })),
            AppError::Infrastructure(msg) => {
                TaskError::new(TaskErrorKind::Infrastructure, "infrastructure", msg.clone())
            }
            AppError::Io(e) => {
                TaskError::new(TaskErrorKind::Infrastructure, "io", e.to_string())
            }
            AppError::Cancelled(msg) => {
                TaskError::new(TaskErrorKind::Cancelled, "cancelled", msg.clone())
            }
            other => TaskError::new(
                TaskErrorKind::Internal,
                other.error_code().to_lowercase(),
                other.to_string(),
            ),
        }
    }
}

impl From<AppError> for TaskError {
    fn from(err: AppError) -> Self {
        TaskError::from(&err)
    }
}

/// Convert AppError to HTTP response
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code().to_string();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(
                error_code = %error_code,
                status_code = status.as_u16(),
                message = %message,
                "Request error"
            );
        } else {
            tracing::warn!(
                error_code = %error_code,
                status_code = status.as_u16(),
                message = %message,
                "Request rejected"
            );
        }

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
                "status": status.as_u16(),
            }
        }));

        (status, body).into_response()
    }
}

/// Conversion from serde_json::Error
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

/// Conversion from validator::ValidationErrors
impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::Configuration(err.to_string())
    }
}

/// Conversion from config::ConfigError
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Configuration(err.to_string())
    }
}

impl From<sled::Error> for AppError {
    fn from(err: sled::Error) -> Self {
        AppError::Infrastructure(format!("sled: {}", err))
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::Infrastructure(format!("redis: {}", err))
    }
}

impl From<zip::result::ZipError> for AppError {
    fn from(err: zip::result::ZipError) -> Self {
        AppError::validation("zip_invalid", err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;
