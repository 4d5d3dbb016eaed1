use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("bad request")]
    JsonBadRequest(Value),
    #[error("not found")]
    NotFound,
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::JsonBadRequest(payload) => {
                (StatusCode::BAD_REQUEST, Json(payload)).into_response()
            }
            other => {
                let status = match &other {
                    AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
                    AppError::NotFound => StatusCode::NOT_FOUND,
                    AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                    AppError::JsonBadRequest(_) => StatusCode::BAD_REQUEST,
                };
                (status, other.to_string()).into_response()
            }
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
