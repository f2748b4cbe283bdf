use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use corral_core::CorralError;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

/// A failed request: status plus a JSON `{ "error": ... }` body.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "missing or invalid bearer token")
    }
}

pub fn status_for(err: &CorralError) -> StatusCode {
    match err {
        CorralError::NotFound(_) => StatusCode::NOT_FOUND,
        CorralError::DuplicateIdentity(_) | CorralError::InvalidTransition { .. } => {
            StatusCode::CONFLICT
        }
        CorralError::RuntimeUnavailable { .. } | CorralError::Cancelled { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        CorralError::ResourceExhausted { .. } | CorralError::PortsExhausted { .. } => {
            StatusCode::INSUFFICIENT_STORAGE
        }
        CorralError::HealthCheckFailed { .. }
        | CorralError::Runtime { .. }
        | CorralError::Execution { .. } => StatusCode::BAD_GATEWAY,
        CorralError::InvalidArgument(_) | CorralError::UnsupportedRuntime(_) => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<CorralError> for ApiError {
    fn from(err: CorralError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            tracing::error!("Request failed: {}", err);
        } else {
            tracing::debug!("Request rejected: {}", err);
        }
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}
