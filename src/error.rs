//! Error types shared by the generation pipeline and the HTTP layer.

use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Error, Debug)]
pub enum AppError {
    /// User-correctable input problem, rejected before any network call.
    #[error("{0}")]
    Configuration(String),

    /// The provider key is not configured.
    #[error("{0} is not configured")]
    MissingCredentials(&'static str),

    /// The model answer could not be coerced into the expected JSON shape.
    #[error("{0}")]
    UpstreamParse(String),

    /// One-shot provider request failed or returned an unexpected body.
    #[error("provider error: {0}")]
    Provider(String),

    /// A chapter stream terminated with an error.
    #[error("{0}")]
    Stream(String),

    /// Internal state that should be impossible, e.g. a chapter without stub.
    #[error("{0}")]
    InvalidState(String),

    #[error("database error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("export failed: {0}")]
    Export(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        AppError::InvalidState(format!("serialization failed: {error}"))
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::Configuration(rejection.body_text())
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Configuration(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::UpstreamParse(_) | AppError::Provider(_) | AppError::Stream(_) => {
                StatusCode::BAD_GATEWAY
            }
            AppError::MissingCredentials(_)
            | AppError::InvalidState(_)
            | AppError::Persistence(_)
            | AppError::Export(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        (status, Json(json!({ "exito": false, "error": self.to_string() }))).into_response()
    }
}
