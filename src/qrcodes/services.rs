use std::io::Cursor;

use anyhow::Context;
use base64ct::{Base64, Encoding};
use image::{DynamicImage, ImageFormat, Luma};
use qrcode::{EcLevel, QrCode as QrMatrix};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use super::expiry::is_expired_at;
use crate::store::{
    naming::{to_canonical_form, Convention},
    QrCode, RecordKind,
};

const MIN_IMAGE_SIDE: u32 = 300;
/// Upper bound on `expirationHours`, roughly a century.
const MAX_EXPIRATION_HOURS: f64 = 24.0 * 365.0 * 100.0;

/// Renders `content` as a PNG QR code (error correction M) and wraps it in a
/// `data:` URL.
pub fn render_data_url(content: &str) -> anyhow::Result<String> {
    let code = QrMatrix::with_error_correction_level(content.as_bytes(), EcLevel::M)
        .context("encode qr matrix")?;
    let img = code
        .render::<Luma<u8>>()
        .min_dimensions(MIN_IMAGE_SIDE, MIN_IMAGE_SIDE)
        .build();

    let mut png = Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(img)
        .write_to(&mut png, ImageFormat::Png)
        .context("encode png")?;
    let png = png.into_inner();
    debug!(bytes = png.len(), "qr png rendered");

    Ok(format!("data:image/png;base64,{}", Base64::encode_string(&png)))
}

/// Trimmed description; blank counts as none.
pub fn clean_description(raw: Option<String>) -> Option<String> {
    raw.map(|d| d.trim().to_string()).filter(|d| !d.is_empty())
}

/// Absolute expiry for an offset in hours. Non-positive or non-finite offsets
/// mean the code never time-expires.
pub fn expiry_from_hours(now: OffsetDateTime, hours: Option<f64>) -> Option<OffsetDateTime> {
    let hours = hours.filter(|h| h.is_finite() && *h > 0.0)?;
    let secs = (hours.min(MAX_EXPIRATION_HOURS) * 3600.0).round() as i64;
    now.checked_add(time::Duration::seconds(secs))
}

/// Builds a new, not yet persisted, QR code record for `owner_id`.
pub fn build_qrcode(
    owner_id: &str,
    url: &str,
    description: Option<String>,
    expiration_hours: Option<f64>,
    now: OffsetDateTime,
) -> anyhow::Result<QrCode> {
    Ok(QrCode {
        id: Uuid::new_v4().to_string(),
        user_id: owner_id.to_string(),
        url: url.to_string(),
        description: clean_description(description),
        qr_code_data_url: render_data_url(url)?,
        created_at: now,
        expires_at: expiry_from_hours(now, expiration_hours),
        is_manually_expired: false,
    })
}

/// Client view of a record: camelCase fields plus `isExpired` computed at `now`.
pub fn present(qr: &QrCode, now: OffsetDateTime) -> serde_json::Result<Value> {
    let doc = match serde_json::to_value(qr)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let mut out = to_canonical_form(&doc, RecordKind::QrCode, Convention::Camel);
    out.insert("isExpired".into(), Value::Bool(is_expired_at(qr, now)));
    Ok(Value::Object(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn renders_png_data_url() {
        let url = render_data_url("https://example.com").unwrap();
        let b64 = url.strip_prefix("data:image/png;base64,").expect("prefix");
        let png = Base64::decode_vec(b64).unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn description_is_trimmed() {
        assert_eq!(clean_description(Some("  menu ".into())).as_deref(), Some("menu"));
        assert_eq!(clean_description(Some("   ".into())), None);
        assert_eq!(clean_description(None), None);
    }

    #[test]
    fn expiration_hours() {
        let now = datetime!(2024-05-01 10:00 UTC);
        assert_eq!(expiry_from_hours(now, Some(1.0)), Some(datetime!(2024-05-01 11:00 UTC)));
        assert_eq!(expiry_from_hours(now, Some(0.5)), Some(datetime!(2024-05-01 10:30 UTC)));
        assert_eq!(expiry_from_hours(now, Some(0.0)), None);
        assert_eq!(expiry_from_hours(now, Some(-3.0)), None);
        assert_eq!(expiry_from_hours(now, Some(f64::NAN)), None);
        assert_eq!(expiry_from_hours(now, None), None);
        assert!(expiry_from_hours(now, Some(1e12)).is_some());
    }

    #[test]
    fn presented_record_is_camel_case_with_status() {
        let now = datetime!(2024-05-01 10:00 UTC);
        let qr = build_qrcode("u1", "https://example.com", Some(" hi ".into()), Some(1.0), now).unwrap();

        let view = present(&qr, now).unwrap();
        assert_eq!(view["userId"], "u1");
        assert_eq!(view["description"], "hi");
        assert_eq!(view["isManuallyExpired"], false);
        assert_eq!(view["isExpired"], false);
        assert!(view["qrCodeDataUrl"].as_str().unwrap().starts_with("data:image/png;base64,"));
        assert!(view.get("user_id").is_none());

        let later = present(&qr, now + time::Duration::minutes(61)).unwrap();
        assert_eq!(later["isExpired"], true);
    }
}
