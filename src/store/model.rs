use serde::{de::DeserializeOwned, Deserialize, Serialize};
use time::OffsetDateTime;

use super::naming::{Field, ACCOUNT_FIELDS, QRCODE_FIELDS};
use super::StoreError;

/// The two collections the store manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Account,
    QrCode,
}

impl RecordKind {
    /// Table name on the relational backend.
    pub fn table(self) -> &'static str {
        match self {
            RecordKind::Account => "users",
            RecordKind::QrCode => "qrcodes",
        }
    }

    /// File name on the flat-file backend.
    pub fn file_name(self) -> &'static str {
        match self {
            RecordKind::Account => "users.json",
            RecordKind::QrCode => "qrcodes.json",
        }
    }

    pub fn fields(self) -> &'static [Field] {
        match self {
            RecordKind::Account => ACCOUNT_FIELDS,
            RecordKind::QrCode => QRCODE_FIELDS,
        }
    }

    /// Fields that together identify at most one record besides `id`.
    pub fn unique_key(self) -> &'static [&'static str] {
        match self {
            RecordKind::Account => &["provider", "provider_id"],
            RecordKind::QrCode => &[],
        }
    }

    /// Field holding the owning account id. An account owns itself.
    pub fn owner_field(self) -> &'static str {
        match self {
            RecordKind::Account => "id",
            RecordKind::QrCode => "user_id",
        }
    }
}

/// A typed record the store can persist.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: RecordKind;

    /// Partial update; fields serialized by the patch are the only ones touched.
    type Patch: Serialize + Send + Sync;

    fn id(&self) -> &str;

    /// Structural checks run before a record is written.
    fn validate(&self) -> Result<(), StoreError> {
        if self.id().trim().is_empty() {
            return Err(StoreError::Validation("record id must not be empty".into()));
        }
        Ok(())
    }
}

/// An end user, keyed by an external identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub avatar: Option<String>,
    pub provider: String,
    pub provider_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Account fields that may change after creation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AccountPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<Option<String>>,
}

impl Record for Account {
    const KIND: RecordKind = RecordKind::Account;
    type Patch = AccountPatch;

    fn id(&self) -> &str {
        &self.id
    }
}

/// A generated QR code owned by one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QrCode {
    pub id: String,
    pub user_id: String,
    pub url: String,
    #[serde(default)]
    pub description: Option<String>,
    pub qr_code_data_url: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub is_manually_expired: bool,
}

impl QrCode {
    pub fn is_owned_by(&self, account_id: &str) -> bool {
        self.user_id == account_id
    }
}

/// QR code changes. The expiry timestamp is not patchable and the manual flag
/// can only be raised: a `false` here is never written.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QrCodePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<Option<String>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_manually_expired: bool,
}

impl QrCodePatch {
    pub fn expire() -> Self {
        Self {
            is_manually_expired: true,
            ..Self::default()
        }
    }
}

impl Record for QrCode {
    const KIND: RecordKind = RecordKind::QrCode;
    type Patch = QrCodePatch;

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), StoreError> {
        if self.id.trim().is_empty() {
            return Err(StoreError::Validation("record id must not be empty".into()));
        }
        url::Url::parse(&self.url)
            .map_err(|e| StoreError::Validation(format!("invalid url: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    #[test]
    fn qrcode_patch_never_writes_false_flag() {
        let patch = QrCodePatch {
            description: Some(Some("menu".into())),
            is_manually_expired: false,
        };
        assert_eq!(serde_json::to_value(&patch).unwrap(), json!({ "description": "menu" }));
        assert_eq!(
            serde_json::to_value(QrCodePatch::expire()).unwrap(),
            json!({ "is_manually_expired": true })
        );
    }

    #[test]
    fn account_patch_can_clear_avatar() {
        let patch = AccountPatch {
            avatar: Some(None),
            ..AccountPatch::default()
        };
        assert_eq!(serde_json::to_value(&patch).unwrap(), json!({ "avatar": null }));
    }

    #[test]
    fn qrcode_validation_rejects_bad_url() {
        let qr = QrCode {
            id: "q1".into(),
            user_id: "u1".into(),
            url: "not a url".into(),
            description: None,
            qr_code_data_url: String::new(),
            created_at: datetime!(2024-01-01 0:00 UTC),
            expires_at: None,
            is_manually_expired: false,
        };
        assert!(matches!(qr.validate(), Err(StoreError::Validation(_))));

        let ok = QrCode { url: "https://example.com".into(), ..qr };
        assert!(ok.validate().is_ok());
    }
}
