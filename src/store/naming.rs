//! Field-name normalization between the two spellings a record can arrive in.
//!
//! Rows coming out of PostgreSQL and the canonical on-disk form use
//! word-separated names (`user_id`), the browser client and older file
//! snapshots use capitalization-joined names (`userId`). Everything that
//! crosses the store boundary goes through here so callers only ever see one
//! spelling.

use serde_json::{Map, Value};

use super::model::RecordKind;

/// Which spelling a normalized record should carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convention {
    /// `qr_code_data_url`
    Snake,
    /// `qrCodeDataUrl`
    Camel,
}

/// Value a recognized field takes when a record does not carry it at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Empty {
    Null,
    False,
}

impl Empty {
    fn value(self) -> Value {
        match self {
            Empty::Null => Value::Null,
            Empty::False => Value::Bool(false),
        }
    }
}

/// One persisted field under both spellings.
#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub snake: &'static str,
    pub camel: &'static str,
    pub empty: Empty,
}

impl Field {
    const fn new(snake: &'static str, camel: &'static str) -> Self {
        Self { snake, camel, empty: Empty::Null }
    }

    const fn flag(snake: &'static str, camel: &'static str) -> Self {
        Self { snake, camel, empty: Empty::False }
    }

    pub fn name(&self, convention: Convention) -> &'static str {
        match convention {
            Convention::Snake => self.snake,
            Convention::Camel => self.camel,
        }
    }
}

pub const ACCOUNT_FIELDS: &[Field] = &[
    Field::new("id", "id"),
    Field::new("email", "email"),
    Field::new("name", "name"),
    Field::new("avatar", "avatar"),
    Field::new("provider", "provider"),
    Field::new("provider_id", "providerId"),
    Field::new("created_at", "createdAt"),
];

pub const QRCODE_FIELDS: &[Field] = &[
    Field::new("id", "id"),
    Field::new("user_id", "userId"),
    Field::new("url", "url"),
    Field::new("description", "description"),
    Field::new("qr_code_data_url", "qrCodeDataUrl"),
    Field::new("created_at", "createdAt"),
    Field::new("expires_at", "expiresAt"),
    Field::flag("is_manually_expired", "isManuallyExpired"),
];

/// Returns `record` with every field of `kind` present under the `target`
/// spelling and the other spelling removed.
///
/// A non-null value under the target spelling wins over one under the other
/// spelling. Fields the record does not carry at all come back as their empty
/// value; unknown keys are copied through untouched.
pub fn to_canonical_form(record: &Map<String, Value>, kind: RecordKind, target: Convention) -> Map<String, Value> {
    rename(record, kind, target, true)
}

/// Like [`to_canonical_form`] but leaves missing fields missing, so a partial
/// update stays partial.
pub fn canonicalize_partial(record: &Map<String, Value>, kind: RecordKind, target: Convention) -> Map<String, Value> {
    rename(record, kind, target, false)
}

/// Looks up the field of `kind` whose target or alternate spelling is `key`.
pub fn field_for(kind: RecordKind, key: &str) -> Option<&'static Field> {
    kind.fields().iter().find(|f| f.snake == key || f.camel == key)
}

fn rename(record: &Map<String, Value>, kind: RecordKind, target: Convention, fill: bool) -> Map<String, Value> {
    let fields = kind.fields();
    let mut out = Map::with_capacity(record.len().max(fields.len()));

    for (key, value) in record {
        if field_for(kind, key).is_none() {
            out.insert(key.clone(), value.clone());
        }
    }

    for field in fields {
        let wanted = field.name(target);
        let other = match target {
            Convention::Snake => field.camel,
            Convention::Camel => field.snake,
        };

        let explicit = record.get(wanted).filter(|v| !v.is_null());
        let derived = record.get(other).filter(|v| !v.is_null());
        let value = match (explicit, derived) {
            (Some(v), _) | (None, Some(v)) => Some(v.clone()),
            // Present but null under either spelling.
            (None, None) if record.contains_key(wanted) || record.contains_key(other) => Some(Value::Null),
            (None, None) if fill => Some(field.empty.value()),
            (None, None) => None,
        };

        if let Some(value) = value {
            out.insert(wanted.to_string(), value);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn camel_record_becomes_snake() {
        let input = obj(json!({
            "id": "q1",
            "userId": "u1",
            "url": "https://example.com",
            "qrCodeDataUrl": "data:image/png;base64,AAA",
            "createdAt": "2024-01-01T00:00:00Z",
            "expiresAt": null,
            "isManuallyExpired": true
        }));

        let out = to_canonical_form(&input, RecordKind::QrCode, Convention::Snake);

        assert_eq!(out["user_id"], json!("u1"));
        assert_eq!(out["qr_code_data_url"], json!("data:image/png;base64,AAA"));
        assert_eq!(out["created_at"], json!("2024-01-01T00:00:00Z"));
        assert_eq!(out["expires_at"], Value::Null);
        assert_eq!(out["is_manually_expired"], json!(true));
        assert!(!out.contains_key("userId"));
        assert!(!out.contains_key("isManuallyExpired"));
    }

    #[test]
    fn target_spelling_wins_when_both_differ() {
        let input = obj(json!({ "id": "q1", "user_id": "snake", "userId": "camel" }));

        let snake = to_canonical_form(&input, RecordKind::QrCode, Convention::Snake);
        let camel = to_canonical_form(&input, RecordKind::QrCode, Convention::Camel);

        assert_eq!(snake["user_id"], json!("snake"));
        assert_eq!(camel["userId"], json!("camel"));
    }

    #[test]
    fn null_under_target_spelling_falls_back_to_other() {
        let input = obj(json!({ "expires_at": null, "expiresAt": "2024-01-01T00:00:00Z" }));
        let out = to_canonical_form(&input, RecordKind::QrCode, Convention::Snake);
        assert_eq!(out["expires_at"], json!("2024-01-01T00:00:00Z"));
    }

    #[test]
    fn missing_fields_get_empty_values_and_unknown_pass_through() {
        let input = obj(json!({ "id": "a1", "theme": "dark" }));

        let account = to_canonical_form(&input, RecordKind::Account, Convention::Camel);
        assert_eq!(account["theme"], json!("dark"));
        assert_eq!(account["avatar"], Value::Null);
        assert_eq!(account["providerId"], Value::Null);

        let qr = to_canonical_form(&input, RecordKind::QrCode, Convention::Snake);
        assert_eq!(qr["is_manually_expired"], json!(false));
        assert_eq!(qr["description"], Value::Null);
    }

    #[test]
    fn partial_form_does_not_invent_fields() {
        let input = obj(json!({ "description": "menu" }));
        let out = canonicalize_partial(&input, RecordKind::QrCode, Convention::Snake);
        assert_eq!(out.len(), 1);
        assert_eq!(out["description"], json!("menu"));
    }

    #[test]
    fn partial_form_keeps_explicit_null() {
        let input = obj(json!({ "avatar": null, "providerId": "sub-1" }));
        let out = canonicalize_partial(&input, RecordKind::Account, Convention::Snake);
        assert_eq!(out["avatar"], Value::Null);
        assert_eq!(out["provider_id"], json!("sub-1"));
        assert_eq!(out.len(), 2);
    }
}
