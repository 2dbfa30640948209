use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Map, Value};
use time::OffsetDateTime;
use tracing::{error, info, instrument, warn};

use crate::{
    auth::extractors::AuthUser,
    errors::{api_error, store_failure, ApiError},
    state::AppState,
    store::{
        self,
        naming::{canonicalize_partial, Convention},
        QrCode, QrCodePatch, RecordKind,
    },
};

use super::{
    dto::{GenerateRequest, GenerateResponse, UpdateQrCodeRequest},
    expiry::is_expired,
    services::{build_qrcode, clean_description, present},
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/qrcode", get(list_qrcodes))
        .route("/api/qrcode/generate", post(generate_qrcode))
        .route(
            "/api/qrcode/:id",
            get(get_qrcode).patch(update_qrcode).delete(expire_qrcode),
        )
}

#[instrument(skip(state, user, payload), fields(user_id = %user.account.id))]
pub async fn generate_qrcode(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let Some(url) = payload.url.filter(|u| !u.trim().is_empty()) else {
        return Err(api_error(StatusCode::BAD_REQUEST, "URL is required"));
    };
    if url::Url::parse(&url).is_err() {
        warn!(%url, "rejected malformed url");
        return Err(api_error(StatusCode::BAD_REQUEST, "Invalid URL format"));
    }

    let qr = build_qrcode(
        &user.account.id,
        &url,
        payload.description,
        payload.expiration_hours,
        store::now_utc(),
    )
    .map_err(|e| {
        error!(error = %e, "qr render failed");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to generate QR code")
    })?;

    let created = state
        .store
        .qrcodes()
        .create(&qr)
        .await
        .map_err(|e| store_failure(e, "Failed to generate QR code"))?;

    info!(qrcode_id = %created.id, "qr code generated");
    Ok(Json(GenerateResponse {
        id: created.id,
        qr_code_data_url: created.qr_code_data_url,
        description: created.description,
        expires_at: created.expires_at,
    }))
}

#[instrument(skip(state, user), fields(user_id = %user.account.id))]
pub async fn list_qrcodes(State(state): State<AppState>, user: AuthUser) -> Result<Json<Vec<Value>>, ApiError> {
    let codes = state
        .store
        .qrcodes()
        .find_by_owner(&user.account.id)
        .await
        .map_err(|e| store_failure(e, "Failed to fetch QR codes"))?;

    let now = OffsetDateTime::now_utc();
    let items = codes
        .iter()
        .map(|qr| present(qr, now))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            error!(error = %e, "present qr codes failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch QR codes")
        })?;
    Ok(Json(items))
}

#[instrument(skip(state, user), fields(user_id = %user.account.id))]
pub async fn get_qrcode(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let qr = load_owned(&state, &user, &id, "Failed to fetch QR code").await?;
    respond(&qr, "Failed to fetch QR code")
}

#[instrument(skip(state, user, body), fields(user_id = %user.account.id))]
pub async fn update_qrcode(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(body): Json<Map<String, Value>>,
) -> Result<Json<Value>, ApiError> {
    let body = canonicalize_partial(&body, RecordKind::QrCode, Convention::Snake);
    let req: UpdateQrCodeRequest = serde_json::from_value(Value::Object(body)).map_err(|e| {
        warn!(error = %e, "rejected qr code update");
        api_error(StatusCode::BAD_REQUEST, "Only description can be updated")
    })?;

    let current = load_owned(&state, &user, &id, "Failed to update QR code").await?;
    let Some(description) = req.description else {
        return respond(&current, "Failed to update QR code");
    };

    let patch = QrCodePatch {
        description: Some(clean_description(description)),
        ..QrCodePatch::default()
    };
    let updated = state
        .store
        .qrcodes()
        .update(&id, &patch)
        .await
        .map_err(|e| store_failure(e, "Failed to update QR code"))?
        .ok_or_else(not_found)?;

    info!(qrcode_id = %id, "qr code updated");
    respond(&updated, "Failed to update QR code")
}

#[instrument(skip(state, user), fields(user_id = %user.account.id))]
pub async fn expire_qrcode(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let current = load_owned(&state, &user, &id, "Failed to expire QR code").await?;
    let was_expired = is_expired(&current);

    state
        .store
        .qrcodes()
        .expire(&id)
        .await
        .map_err(|e| store_failure(e, "Failed to expire QR code"))?
        .ok_or_else(not_found)?;

    info!(qrcode_id = %id, was_expired, "qr code expired");
    Ok(Json(json!({ "message": "QR code expired successfully", "id": id })))
}

fn not_found() -> ApiError {
    api_error(StatusCode::NOT_FOUND, "QR code not found")
}

async fn load_owned(state: &AppState, user: &AuthUser, id: &str, fallback: &str) -> Result<QrCode, ApiError> {
    let qr = state
        .store
        .qrcodes()
        .find_by_id(id)
        .await
        .map_err(|e| store_failure(e, fallback))?
        .ok_or_else(not_found)?;

    if !qr.is_owned_by(&user.account.id) {
        warn!(qrcode_id = %id, owner = %qr.user_id, "access to foreign qr code denied");
        return Err(api_error(StatusCode::FORBIDDEN, "Access denied"));
    }
    Ok(qr)
}

fn respond(qr: &QrCode, fallback: &str) -> Result<Json<Value>, ApiError> {
    present(qr, OffsetDateTime::now_utc()).map(Json).map_err(|e| {
        error!(error = %e, "present qr code failed");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, fallback)
    })
}
