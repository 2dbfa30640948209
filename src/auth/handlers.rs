use anyhow::Context;
use axum::{
    extract::{FromRef, Query, State},
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    response::{AppendHeaders, IntoResponse, Redirect, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tracing::{error, info, instrument, warn};

use crate::{
    auth::{
        dto::{CallbackQuery, MeResponse},
        extractors::AuthUser,
        services::{
            expired_cookie, find_or_create_account, random_state, read_cookie, session_cookie,
            state_cookie, SessionKeys, SESSION_COOKIE, STATE_COOKIE,
        },
        sessions::Session,
    },
    errors::api_error,
    state::AppState,
};

const LOGIN_FAILED_REDIRECT: &str = "/login.html?error=auth_failed";

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/google", get(google_login))
        .route("/auth/google/callback", get(google_callback))
        .route("/auth/logout", get(logout))
}

pub fn me_routes() -> Router<AppState> {
    Router::new().route("/api/auth/me", get(get_me))
}

#[instrument(skip(state))]
pub async fn google_login(State(state): State<AppState>) -> Response {
    let csrf = random_state();
    let Some(url) = state.identity.authorize_url(&csrf) else {
        warn!(provider = state.identity.name(), "login attempted but provider is not configured");
        return api_error(StatusCode::SERVICE_UNAVAILABLE, "Google OAuth is not configured").into_response();
    };

    let secure = state.config.session.secure_cookie;
    (
        AppendHeaders([(SET_COOKIE, state_cookie(&csrf, secure))]),
        Redirect::to(&url),
    )
        .into_response()
}

#[instrument(skip(state, headers, query))]
pub async fn google_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let secure = state.config.session.secure_cookie;
    let clear_state = expired_cookie(STATE_COOKIE, secure);

    match complete_login(&state, &headers, query).await {
        Ok((session, token)) => {
            info!(account_id = %session.account_id, "user logged in");
            let keys = SessionKeys::from_ref(&state);
            (
                AppendHeaders([
                    (SET_COOKIE, session_cookie(&token, &keys, secure)),
                    (SET_COOKIE, clear_state),
                ]),
                Redirect::to("/"),
            )
                .into_response()
        }
        Err(e) => {
            warn!(error = %e, "oauth callback failed");
            (
                AppendHeaders([(SET_COOKIE, clear_state)]),
                Redirect::to(LOGIN_FAILED_REDIRECT),
            )
                .into_response()
        }
    }
}

async fn complete_login(
    state: &AppState,
    headers: &HeaderMap,
    query: CallbackQuery,
) -> anyhow::Result<(Session, String)> {
    if let Some(err) = query.error {
        anyhow::bail!("provider returned error: {err}");
    }
    let expected = read_cookie(headers, STATE_COOKIE).context("missing state cookie")?;
    let got = query.state.context("missing state parameter")?;
    anyhow::ensure!(expected == got, "state mismatch");
    let code = query.code.context("missing authorization code")?;

    let profile = state.identity.exchange(&code).await?;
    let account = find_or_create_account(&state.store, &profile)
        .await
        .context("find or create account")?;

    let keys = SessionKeys::from_ref(state);
    let session = Session::new(&account.id, keys.session_ttl());
    state.sessions.create(&session).await.context("create session")?;
    let token = keys.sign(&session)?;
    Ok((session, token))
}

#[instrument(skip_all)]
pub async fn logout(State(state): State<AppState>, user: Option<AuthUser>) -> impl IntoResponse {
    if let Some(user) = user {
        match state.sessions.delete(&user.session_id).await {
            Ok(()) => info!(account_id = %user.account.id, "user logged out"),
            Err(e) => error!(error = %e, "session delete failed"),
        }
    }

    (
        AppendHeaders([(SET_COOKIE, expired_cookie(SESSION_COOKIE, state.config.session.secure_cookie))]),
        Json(json!({ "message": "Logged out successfully" })),
    )
}

#[instrument(skip_all)]
pub async fn get_me(user: Option<AuthUser>) -> Json<MeResponse> {
    Json(MeResponse {
        user: user.map(|u| u.account.into()),
    })
}
