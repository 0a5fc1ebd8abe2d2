use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::database::StoreError;
use crate::services::counters::SupportError;
use crate::services::reactions::ReactionError;
use crate::services::text::TextError;
use crate::utils::security::TokenError;

#[derive(Serialize)]
pub struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip)]
    status: StatusCode,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            status: StatusCode::OK,
        }
    }

    pub fn err(msg: &str) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.to_string()),
            status: StatusCode::OK,
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> axum::response::Response {
        let status = self.status;
        let json = axum::Json(self);
        (status, json).into_response()
    }
}

pub fn response<T>(data: T, status: StatusCode) -> ApiResponse<T> {
    ApiResponse::ok(data).with_status(status)
}

/// Failures a handler reports to the client as-is.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncError {
    #[error("UNAUTHORIZED")]
    Unauthorized,
    #[error("EXPIRED_TOKEN")]
    ExpiredToken,
    #[error("INVALID_TOKEN")]
    InvalidToken,
    #[error("ITEM_NOT_FOUND")]
    ItemNotFound,
    #[error("UNKNOWN_FEED")]
    UnknownFeed,
    #[error("UNKNOWN_FILTER")]
    UnknownFilter,
    #[error("INVALID_CURSOR")]
    InvalidCursor,
    #[error("UNKNOWN_TEMPLATE")]
    UnknownTemplate,
    #[error("MISSING_VARIABLE")]
    MissingVariable,
    #[error("ASSIST_UNAVAILABLE")]
    AssistUnavailable,
    #[error("UPSTREAM_FAILED")]
    UpstreamFailed,
    #[error("CONFLICT")]
    Conflict,
}

impl FuncError {
    pub fn status(&self) -> StatusCode {
        match self {
            FuncError::Unauthorized | FuncError::ExpiredToken | FuncError::InvalidToken => {
                StatusCode::UNAUTHORIZED
            }
            FuncError::ItemNotFound | FuncError::UnknownFeed | FuncError::UnknownTemplate => {
                StatusCode::NOT_FOUND
            }
            FuncError::UnknownFilter | FuncError::InvalidCursor => StatusCode::BAD_REQUEST,
            FuncError::MissingVariable => StatusCode::UNPROCESSABLE_ENTITY,
            FuncError::AssistUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            FuncError::UpstreamFailed => StatusCode::BAD_GATEWAY,
            FuncError::Conflict => StatusCode::CONFLICT,
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Func(#[from] FuncError),

    #[error("unauthorized: {0}")]
    Unauthorized(#[from] TokenError),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, msg) = match &self {
            AppError::Func(func) => (func.status(), func.to_string()),
            AppError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "INVALID_TOKEN".to_string()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.clone()),
            AppError::Internal(msg) => {
                error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR".to_string(),
                )
            }
        };
        ApiResponse::<()>::err(&msg)
            .with_status(status)
            .into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidCursor => FuncError::InvalidCursor.into(),
            StoreError::NotFound(_) => FuncError::ItemNotFound.into(),
            StoreError::Conflict { .. } => FuncError::Conflict.into(),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<ReactionError> for AppError {
    fn from(err: ReactionError) -> Self {
        match err {
            ReactionError::Unauthenticated => FuncError::Unauthorized.into(),
            ReactionError::ItemNotFound(_) => FuncError::ItemNotFound.into(),
            ReactionError::Store(store) => store.into(),
        }
    }
}

impl From<SupportError> for AppError {
    fn from(err: SupportError) -> Self {
        match err {
            SupportError::Unauthenticated => FuncError::Unauthorized.into(),
            SupportError::ItemNotFound(_) => FuncError::ItemNotFound.into(),
            SupportError::Store(store) => store.into(),
        }
    }
}

impl From<TextError> for AppError {
    fn from(err: TextError) -> Self {
        match err {
            TextError::MissingVariable { .. } => FuncError::MissingVariable.into(),
            other => {
                error!("Text service failed: {}", other);
                FuncError::UpstreamFailed.into()
            }
        }
    }
}
