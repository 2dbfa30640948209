use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{request::Parts, StatusCode},
};
use tracing::{debug, error};

use super::services::{read_cookie, SessionKeys, SESSION_COOKIE};
use crate::{
    errors::{api_error, unauthorized, ApiError},
    state::AppState,
    store::Account,
};

/// Account behind the request's session cookie.
pub struct AuthUser {
    pub account: Account,
    pub session_id: String,
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = read_cookie(&parts.headers, SESSION_COOKIE).ok_or_else(unauthorized)?;

        let keys = SessionKeys::from_ref(state);
        let claims = keys.verify(token).map_err(|e| {
            debug!(error = %e, "session cookie rejected");
            unauthorized()
        })?;

        // The cookie is only a pointer; logout removes the session it names.
        let session = match state.sessions.get(&claims.sid).await {
            Ok(Some(s)) if s.account_id == claims.sub => s,
            Ok(_) => return Err(unauthorized()),
            Err(e) => {
                error!(error = %e, "session lookup failed");
                return Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load session"));
            }
        };

        let account = match state.store.accounts().find_by_id(&session.account_id).await {
            Ok(Some(a)) => a,
            Ok(None) => {
                debug!(account_id = %session.account_id, "session names a missing account");
                return Err(unauthorized());
            }
            Err(e) => {
                error!(error = %e, "account lookup failed");
                return Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load session"));
            }
        };

        Ok(AuthUser {
            account,
            session_id: session.sid,
        })
    }
}
