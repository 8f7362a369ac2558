//! Bearer-token authentication extractor.
//!
//! Unlike the reference JWT middleware (which populates an optional
//! extension for handlers that may or may not require a caller), every
//! authenticated endpoint here requires a valid token, so `AuthUser` is an
//! axum extractor that itself produces the 401/403 responses rather than a
//! middleware that silently lets anonymous requests through.

use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;

use crate::common::DispatchError;
use crate::server::state::AppState;

#[derive(Clone, Debug)]
pub struct AuthUser {
    pub user_id: String,
    pub is_admin: bool,
}

impl AuthUser {
    pub fn owns_or_admin(&self, owner_user_id: &str) -> Result<(), DispatchError> {
        if self.is_admin || self.user_id == owner_user_id {
            Ok(())
        } else {
            Err(DispatchError::Forbidden)
        }
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = DispatchError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let app_state = AppState::from_ref(state);

        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .ok_or(DispatchError::MissingAuth)?;
        let header = header.to_str().map_err(|_| DispatchError::MissingAuth)?;
        let plaintext = header.strip_prefix("Bearer ").ok_or(DispatchError::MissingAuth)?;

        let identity = app_state
            .tokens
            .validate(plaintext)
            .await
            .map_err(DispatchError::Internal)?
            .ok_or(DispatchError::InvalidToken)?;

        Ok(AuthUser {
            user_id: identity.user_id,
            is_admin: identity.is_admin,
        })
    }
}
