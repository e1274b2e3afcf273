//! Authentication middleware.
//!
//! When `AUTH_SECRET` is configured every sync route requires
//! `Authorization: Bearer <secret>`. Without it the server accepts anonymous
//! requests.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};

use crate::error::AppError;
use crate::AppState;

/// Authenticated caller extracted from the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthUser {
    Anonymous,
    Token(String),
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        authenticate(auth_header, state.config.auth_secret.as_deref())
    }
}

fn authenticate(header: Option<&str>, secret: Option<&str>) -> Result<AuthUser, AppError> {
    let token = match header {
        Some(header) => header
            .strip_prefix("Bearer ")
            .map(str::trim)
            .ok_or_else(|| AppError::Unauthorized("Invalid authorization header format".into()))?,
        None => {
            return match secret {
                None => Ok(AuthUser::Anonymous),
                Some(_) => Err(AppError::Unauthorized(
                    "Missing authorization header".into(),
                )),
            }
        }
    };

    if token.is_empty() {
        return Err(AppError::Unauthorized("Empty bearer token".into()));
    }

    match secret {
        Some(secret) if !constant_time_eq(token.as_bytes(), secret.as_bytes()) => {
            tracing::warn!("Rejected bearer token");
            Err(AppError::Unauthorized("Invalid bearer token".into()))
        }
        _ => Ok(AuthUser::Token(token.to_string())),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
