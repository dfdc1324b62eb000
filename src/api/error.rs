use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use log::error;
use serde::Serialize;
use thiserror::Error;

use crate::llm::ServiceError;

pub const DOCUMENT_NOT_FOUND: &str = "document not found";

#[derive(Debug, Serialize)]
pub struct ApiMessage {
    pub message: String,
}

impl ApiMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Service(ServiceError::Validation(message)) => {
                (StatusCode::BAD_REQUEST, message)
            }
            ApiError::Service(ServiceError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, DOCUMENT_NOT_FOUND.to_string())
            }
            ApiError::Service(err @ ServiceError::Store(_)) => {
                error!("{}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
            ApiError::Service(err @ ServiceError::Upstream(_)) => {
                error!("{}", err);
                (StatusCode::BAD_GATEWAY, "upstream service error".to_string())
            }
        };

        (status, Json(ApiMessage { message })).into_response()
    }
}
