//! Error taxonomy shared by the orchestrator and the HTTP surface.
//!
//! Every variant is reported as a value: the orchestrator logs it to the
//! relay, and handlers turn it into a JSON response. None of them take the
//! server down.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::identifier::IdentifierError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PanelError {
    /// Malformed batch request field; rejected before any side effect.
    #[error("invalid request: {0}")]
    Validation(String),

    #[error(transparent)]
    InvalidIdentifier(#[from] IdentifierError),

    /// Simulator configuration document missing, unreadable or malformed.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("failed to launch simulator: {0}")]
    ProcessLaunch(String),

    #[error("simulator timed out after {0} ms")]
    ProcessTimeout(u64),

    #[error("simulator exited with code {0}")]
    ProcessExit(i32),

    #[error("a batch is already running")]
    AlreadyRunning,

    #[error("schedule source error: {0}")]
    Schedule(String),
}

pub type PanelResult<T> = Result<T, PanelError>;

impl PanelError {
    /// Stable machine-readable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::InvalidIdentifier(_) => "InvalidIdentifier",
            Self::Configuration(_) => "ConfigurationError",
            Self::ProcessLaunch(_) => "ProcessLaunchError",
            Self::ProcessTimeout(_) => "ProcessTimeoutError",
            Self::ProcessExit(_) => "ProcessExitError",
            Self::AlreadyRunning => "AlreadyRunning",
            Self::Schedule(_) => "ScheduleError",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::InvalidIdentifier(_) => StatusCode::BAD_REQUEST,
            Self::Configuration(_) | Self::ProcessLaunch(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ProcessTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::ProcessExit(_) | Self::Schedule(_) => StatusCode::BAD_GATEWAY,
            Self::AlreadyRunning => StatusCode::CONFLICT,
        }
    }

    /// Shorthand used by request validation.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

impl IntoResponse for PanelError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "success": false,
            "error": self.to_string(),
            "kind": self.kind(),
        }));
        (self.status_code(), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(
            PanelError::validation("x").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(PanelError::AlreadyRunning.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            PanelError::ProcessTimeout(3000).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn identifier_errors_convert() {
        let err: PanelError = IdentifierError::NotNumeric("12ab".into()).into();
        assert_eq!(err.kind(), "InvalidIdentifier");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }
}
