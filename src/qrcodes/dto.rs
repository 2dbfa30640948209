use serde::{Deserialize, Deserializer, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "expiration_hours")]
    pub expiration_hours: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    pub id: String,
    pub qr_code_data_url: String,
    pub description: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

/// PATCH body, already canonicalized to snake_case. `description: null`
/// clears it; any other field is refused.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateQrCodeRequest {
    #[serde(default, deserialize_with = "present")]
    pub description: Option<Option<String>>,
}

// Distinguishes an explicit null from a missing key.
fn present<'de, D, T>(de: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(de).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_request_accepts_both_spellings() {
        let a: GenerateRequest = serde_json::from_str(r#"{"url":"https://x.io","expirationHours":2}"#).unwrap();
        let b: GenerateRequest = serde_json::from_str(r#"{"url":"https://x.io","expiration_hours":2.5}"#).unwrap();
        assert_eq!(a.expiration_hours, Some(2.0));
        assert_eq!(b.expiration_hours, Some(2.5));
        assert!(a.description.is_none());
    }

    #[test]
    fn update_request_null_vs_missing() {
        let cleared: UpdateQrCodeRequest = serde_json::from_str(r#"{"description":null}"#).unwrap();
        let untouched: UpdateQrCodeRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(cleared.description, Some(None));
        assert_eq!(untouched.description, None);
        assert!(serde_json::from_str::<UpdateQrCodeRequest>(r#"{"url":"https://evil"}"#).is_err());
    }
}
