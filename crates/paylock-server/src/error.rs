use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use paylock::{GateError, StateError};

/// Errors returned to HTTP callers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Gate(#[from] GateError),

    #[error("valid bearer token required")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(&'static str),

    #[error(transparent)]
    Lock(#[from] StateError),
}

impl ApiError {
    fn code(&self) -> &'static str {
        match self {
            ApiError::Gate(GateError::Unauthorized(_)) | ApiError::Unauthorized => "unauthorized",
            ApiError::Gate(GateError::MalformedRequest(_)) => "malformed_request",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::Lock(StateError::InvalidTransition { .. }) => "invalid_transition",
            ApiError::Lock(StateError::Actuation(_)) => "actuation_failed",
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Gate(GateError::Unauthorized(_)) | ApiError::Unauthorized => {
                StatusCode::UNAUTHORIZED
            }
            ApiError::Gate(GateError::MalformedRequest(_)) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Lock(StateError::InvalidTransition { .. }) => StatusCode::CONFLICT,
            ApiError::Lock(StateError::Actuation(_)) => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        }))
    }
}
