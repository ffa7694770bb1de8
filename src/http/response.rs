//! Error responses.
//!
//! # Responsibilities
//! - Map bridge error kinds to HTTP status codes
//! - Render a JSON error body
//!
//! # Design Decisions
//! - Client errors (404, 422) carry the handler's message
//! - Server errors (500, 503, 504) carry only the kind; details stay in logs

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::rpc::error::{CallError, ErrorKind};

/// Error returned by gateway handlers.
#[derive(Debug)]
pub struct ApiError {
    kind: ErrorKind,
    message: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn status(&self) -> StatusCode {
        status_for(self.kind)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Validation => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<CallError> for ApiError {
    fn from(err: CallError) -> Self {
        let kind = err.kind();
        match err {
            CallError::Remote(failure) => Self::new(kind, failure.message),
            CallError::Rpc(err) => Self::new(kind, err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(kind = self.kind.as_str(), error = %self.message, "Request failed");
        }

        let body = ErrorBody {
            error: self.kind.as_str(),
            message: status.is_client_error().then_some(self.message.as_str()),
        };
        (status, Json(body)).into_response()
    }
}
