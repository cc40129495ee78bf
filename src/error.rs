//! Error types
//!
//! `JobError` covers everything that can go wrong inside one validation job and is
//! always reported to the client as protocol messages. `ApiError` is the HTTP-facing
//! error used by the server routes.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for job operations
pub type JobResult<T> = Result<T, JobError>;

/// Failure kinds of a validation job
#[derive(Debug, Error)]
pub enum JobError {
    /// The engine process could not be started
    #[error("failed to launch engine `{program}`: {source}")]
    LaunchFailure {
        /// Program that was executed
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Engine exited unsuccessfully
    #[error("engine exited unsuccessfully ({detail})")]
    EngineRuntime {
        /// Exit code, if the process exited normally
        exit_code: Option<i32>,
        /// Human readable detail
        detail: String,
    },

    /// A result artifact is missing or unreadable
    #[error("failed to read result artifact `{name}`: {reason}")]
    ArtifactRead {
        /// Artifact file name
        name: String,
        /// Why the read failed
        reason: String,
    },

    /// The submitted document could not be persisted before launch
    #[error("failed to stage constraint document at {path:?}: {source}")]
    StagingWrite {
        /// Target path
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Workspace I/O outside staging and artifact reads
    #[error("I/O error: {context} (path: {path:?})")]
    Io {
        /// What was being done
        context: String,
        /// Path involved
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl JobError {
    /// Create an artifact read error
    pub fn artifact(name: impl Into<String>, reason: impl ToString) -> Self {
        Self::ArtifactRead {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    /// Create an I/O error with context
    pub fn io(context: impl Into<String>, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            path: path.into(),
            source,
        }
    }

    /// Whether this failure ends the job before the engine runs
    #[must_use]
    pub fn is_fatal_before_launch(&self) -> bool {
        matches!(self, Self::LaunchFailure { .. } | Self::StagingWrite { .. })
    }
}

#[cfg(feature = "server")]
pub use api::{ApiError, ApiResult};

#[cfg(feature = "server")]
mod api {
    use axum::{
        http::StatusCode,
        response::{IntoResponse, Response},
        Json,
    };
    use serde::Serialize;
    use thiserror::Error;

    /// Result type for API operations
    pub type ApiResult<T> = Result<T, ApiError>;

    /// API error with HTTP status code
    #[derive(Debug, Clone, Serialize, Error)]
    pub struct ApiError {
        /// HTTP status code
        #[serde(skip)]
        pub status: StatusCode,

        /// Error message
        pub message: String,

        /// Optional error code for client handling
        #[serde(skip_serializing_if = "Option::is_none")]
        pub code: Option<String>,
    }

    impl ApiError {
        /// Create a new API error
        pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
            Self {
                status,
                message: message.into(),
                code: None,
            }
        }

        /// Create a new API error with code
        pub fn with_code(
            status: StatusCode,
            message: impl Into<String>,
            code: impl Into<String>,
        ) -> Self {
            Self {
                code: Some(code.into()),
                ..Self::new(status, message)
            }
        }

        /// 500 Internal Server Error
        pub fn internal(message: impl Into<String>) -> Self {
            Self::with_code(StatusCode::INTERNAL_SERVER_ERROR, message, "INTERNAL_ERROR")
        }

        /// 503 Service Unavailable
        pub fn unavailable(message: impl Into<String>) -> Self {
            Self::with_code(StatusCode::SERVICE_UNAVAILABLE, message, "SERVICE_UNAVAILABLE")
        }
    }

    impl std::fmt::Display for ApiError {
        fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            match &self.code {
                Some(code) => write!(f, "[{:?}] [{}] {}", self.status, code, self.message),
                None => write!(f, "[{:?}] {}", self.status, self.message),
            }
        }
    }

    impl IntoResponse for ApiError {
        fn into_response(self) -> Response {
            let body = Json(serde_json::json!({
                "success": false,
                "error": self.message,
                "code": self.code,
            }));

            (self.status, body).into_response()
        }
    }

}
