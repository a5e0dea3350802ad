//! Bearer-token authentication extractors.
//!
//! Token provisioning (signup, login, MFA) lives outside this service; a
//! request arrives with a bearer token that maps to a user row.

use std::sync::Arc;

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

use caresync_core::users::User;
use caresync_core::wire::ProtocolVersion;

use crate::error::ApiError;
use crate::main_lib::AppState;

/// The authenticated caller.
pub struct AuthUser(pub User);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ApiError::Unauthorized("missing bearer token".to_string()))?;
        let user = state
            .directory
            .find_user_by_token(token)?
            .ok_or_else(|| ApiError::Unauthorized("invalid token".to_string()))?;
        if !user.active {
            return Err(ApiError::Unauthorized("account is inactive".to_string()));
        }
        Ok(AuthUser(user))
    }
}

/// The protocol version a client speaks, from the `X-Protocol-Version`
/// header. Missing header means the current version.
pub struct Version(pub ProtocolVersion);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for Version {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let version = match parts
            .headers
            .get("x-protocol-version")
            .and_then(|value| value.to_str().ok())
        {
            None => ProtocolVersion::default(),
            Some(value) => ProtocolVersion::parse(value).ok_or_else(|| {
                ApiError::BadRequest(format!("unsupported protocol version: {}", value))
            })?,
        };
        Ok(Version(version))
    }
}
