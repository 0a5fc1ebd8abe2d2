use axum::{
    extract::{FromRequestParts, OptionalFromRequestParts},
    http::{header::AUTHORIZATION, request::Parts},
};
use tracing::debug;

use crate::utils::{
    response::{AppError, FuncError},
    security::decode_token,
    state::ArcAppState,
};

const ACCESS_KEY_TYPE: &str = "access";

#[derive(Debug, Clone)]
pub struct AuthSession {
    pub user_id: String,
    pub session_id: String,
}

fn session_from_token(token: &str, state: &ArcAppState) -> Result<AuthSession, AppError> {
    let decoded = decode_token(token, Some(ACCESS_KEY_TYPE), &state.config.signature_key)
        .map_err(AppError::Unauthorized)?;
    if decoded.is_expired {
        debug!("Rejected expired token of user {}", decoded.user_id);
        return Err(FuncError::ExpiredToken.into());
    }
    if decoded.user_id.is_empty() {
        return Err(FuncError::InvalidToken.into());
    }

    Ok(AuthSession {
        user_id: decoded.user_id,
        session_id: decoded.session_id,
    })
}

impl FromRequestParts<ArcAppState> for AuthSession {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ArcAppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(FuncError::Unauthorized)?;

        session_from_token(token, state)
    }
}

/// Anonymous readers are allowed; a header that is present must still be valid.
impl OptionalFromRequestParts<ArcAppState> for AuthSession {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ArcAppState,
    ) -> Result<Option<Self>, Self::Rejection> {
        match parts.headers.get(AUTHORIZATION) {
            None => Ok(None),
            Some(value) => {
                let token = value.to_str().map_err(|_| FuncError::InvalidToken)?;
                session_from_token(token, state).map(Some)
            }
        }
    }
}
