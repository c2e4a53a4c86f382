use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation failed")]
    Validation(Vec<tether_core::validate::FieldError>),
    #[error("internal server error")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, self.to_string()),
            ApiError::Validation(errors) => {
                return (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    Json(json!({ "error": "validation failed", "details": errors })),
                )
                    .into_response();
            }
            ApiError::Internal(err) => {
                tracing::error!("API internal error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message, "message": message }))).into_response()
    }
}

impl From<tether_core::CoreError> for ApiError {
    fn from(e: tether_core::CoreError) -> Self {
        use tether_core::CoreError;
        match e {
            CoreError::NotFound => ApiError::NotFound,
            CoreError::Authentication(_) => ApiError::Unauthorized,
            CoreError::BadRequest(msg) => ApiError::BadRequest(msg),
            CoreError::Policy(msg) => ApiError::Conflict(msg),
            CoreError::CapacityExceeded => ApiError::Conflict("capacity exceeded".into()),
            CoreError::Validation(errors) => ApiError::Validation(errors),
            CoreError::Store(e) => ApiError::Internal(anyhow::anyhow!(e.to_string())),
            CoreError::Internal(msg) => ApiError::Internal(anyhow::anyhow!(msg)),
        }
    }
}
