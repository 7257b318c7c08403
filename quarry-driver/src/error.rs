use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use quarry_core::protocol::RpcResponse;
use quarry_core::{codes, ErrorEnvelope, QuarryError};

/// HTTP status for an error code. The body always carries the code itself.
pub fn status_for(code: &str) -> StatusCode {
    match code {
        codes::DATABASE_CORRUPTED | codes::QUEUE_FULL | codes::DRIVER_UNAVAILABLE => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        codes::JOB_NOT_FOUND
        | codes::FILE_NOT_FOUND
        | codes::PROJECT_NOT_FOUND
        | codes::TRANSACTION_NOT_FOUND => StatusCode::NOT_FOUND,
        codes::INVALID_REQUEST | codes::CONFIRMATION_REQUIRED => StatusCode::BAD_REQUEST,
        codes::TRANSACTION_FAILED => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Error from an admin or job endpoint, rendered as a bare envelope
pub struct AppError {
    pub status: StatusCode,
    pub body: ErrorEnvelope,
}

impl AppError {
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: ErrorEnvelope::internal(&msg.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, axum::Json(self.body)).into_response()
    }
}

impl From<QuarryError> for AppError {
    fn from(err: QuarryError) -> Self {
        let body = err.to_envelope();
        Self {
            status: status_for(&body.code),
            body,
        }
    }
}

/// `/rpc` answers with the tagged response envelope, errors included.
pub struct RpcReply(pub Result<quarry_core::RpcResult, QuarryError>);

impl IntoResponse for RpcReply {
    fn into_response(self) -> Response {
        match self.0 {
            Ok(result) => (StatusCode::OK, axum::Json(RpcResponse::Ok { result })).into_response(),
            Err(err) => {
                let error = err.to_envelope();
                let status = status_for(&error.code);
                (status, axum::Json(RpcResponse::Error { error })).into_response()
            }
        }
    }
}
