pub(crate) use crate::auth::dto::{SessionClaims, SessionKeys};
use crate::auth::oauth::ExternalProfile;
use crate::auth::sessions::Session;
use crate::config::SessionConfig;
use crate::state::AppState;
use crate::store::{self, Account, AccountPatch, Store, StoreError, StoreResult};
use axum::extract::FromRef;
use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::{distributions::Alphanumeric, Rng};
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info};
use uuid::Uuid;

pub const SESSION_COOKIE: &str = "qr.sid";
pub const STATE_COOKIE: &str = "qr.oauth_state";
const STATE_COOKIE_MAX_AGE: u64 = 10 * 60;

impl FromRef<AppState> for SessionKeys {
    fn from_ref(state: &AppState) -> Self {
        SessionKeys::from_config(&state.config.session)
    }
}

impl SessionKeys {
    pub fn from_config(cfg: &SessionConfig) -> Self {
        let SessionConfig {
            secret,
            issuer,
            audience,
            ttl_minutes,
            ..
        } = cfg.clone();
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            issuer,
            audience,
            ttl: Duration::from_secs((ttl_minutes.max(1) as u64) * 60),
        }
    }

    pub fn session_ttl(&self) -> time::Duration {
        time::Duration::seconds(self.ttl.as_secs() as i64)
    }

    /// Signs a cookie value naming `session`, valid until the session expires.
    pub fn sign(&self, session: &Session) -> anyhow::Result<String> {
        let claims = SessionClaims {
            sid: session.sid.clone(),
            sub: session.account_id.clone(),
            iat: OffsetDateTime::now_utc().unix_timestamp() as usize,
            exp: session.expires_at.unix_timestamp() as usize,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };
        let token = encode(&Header::default(), &claims, &self.encoding)?;
        debug!(account_id = %session.account_id, "session token signed");
        Ok(token)
    }

    pub fn verify(&self, token: &str) -> anyhow::Result<SessionClaims> {
        let mut validation = Validation::default();
        validation.set_audience(std::slice::from_ref(&self.audience));
        validation.set_issuer(std::slice::from_ref(&self.issuer));
        let data = decode::<SessionClaims>(token, &self.decoding, &validation)?;
        Ok(data.claims)
    }
}

/// Looks the profile up by (provider, subject). A known account gets its
/// email, name and avatar refreshed; an unknown one is created.
pub async fn find_or_create_account(store: &Store, profile: &ExternalProfile) -> StoreResult<Account> {
    let accounts = store.accounts();

    if let Some(existing) = accounts
        .find_by_external_identity(&profile.provider, &profile.subject)
        .await?
    {
        return refresh_account(store, existing, profile).await;
    }

    let account = Account {
        id: Uuid::new_v4().to_string(),
        email: profile.email.clone(),
        name: profile.name.clone(),
        avatar: profile.avatar.clone(),
        provider: profile.provider.clone(),
        provider_id: profile.subject.clone(),
        created_at: store::now_utc(),
    };
    match accounts.create(&account).await {
        Ok(created) => {
            info!(account_id = %created.id, provider = %created.provider, "account created");
            Ok(created)
        }
        // A concurrent first login for the same identity won; use its account.
        Err(StoreError::Conflict(reason)) => {
            debug!(%reason, "account created concurrently");
            match accounts
                .find_by_external_identity(&profile.provider, &profile.subject)
                .await?
            {
                Some(existing) => refresh_account(store, existing, profile).await,
                None => Err(StoreError::Conflict(reason)),
            }
        }
        Err(e) => Err(e),
    }
}

async fn refresh_account(store: &Store, existing: Account, profile: &ExternalProfile) -> StoreResult<Account> {
    let patch = AccountPatch {
        email: Some(profile.email.clone()),
        name: Some(profile.name.clone()),
        avatar: Some(profile.avatar.clone()),
    };
    let updated = store
        .accounts()
        .update(&existing.id, &patch)
        .await?
        .unwrap_or(existing);
    debug!(account_id = %updated.id, "account refreshed from provider profile");
    Ok(updated)
}

pub fn random_state() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

fn cookie(name: &str, value: &str, max_age: u64, secure: bool) -> String {
    let mut c = format!("{name}={value}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age}");
    if secure {
        c.push_str("; Secure");
    }
    c
}

pub fn session_cookie(token: &str, keys: &SessionKeys, secure: bool) -> String {
    cookie(SESSION_COOKIE, token, keys.ttl.as_secs(), secure)
}

pub fn state_cookie(state: &str, secure: bool) -> String {
    cookie(STATE_COOKIE, state, STATE_COOKIE_MAX_AGE, secure)
}

pub fn expired_cookie(name: &str, secure: bool) -> String {
    cookie(name, "", 0, secure)
}

/// Value of the first cookie called `name` in the request headers.
pub fn read_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v)
        .filter(|v| !v.is_empty())
}


#[cfg(test)]
mod account_tests {
    use super::*;
    use crate::store::{file::FileBackend, test_support::temp_dir};
    use std::sync::Arc;

    fn profile(email: &str) -> ExternalProfile {
        ExternalProfile {
            provider: "google".into(),
            subject: "sub-123".into(),
            email: email.into(),
            name: "Ada".into(),
            avatar: None,
        }
    }

    #[tokio::test]
    async fn second_verification_updates_instead_of_duplicating() {
        let store = Store::from_backend(
            Arc::new(FileBackend::new(temp_dir("qr-auth"))),
            Duration::from_secs(5),
        );

        let first = find_or_create_account(&store, &profile("a@x.com")).await.unwrap();
        let found = store
            .accounts()
            .find_by_external_identity("google", "sub-123")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, first.id);
        assert_eq!(found.email, "a@x.com");

        let second = find_or_create_account(&store, &profile("a2@x.com")).await.unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.email, "a2@x.com");
        assert_eq!(second.created_at, first.created_at);

        let all = store.accounts().find_by_owner(&first.id).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].email, "a2@x.com");
    }

    #[tokio::test]
    async fn concurrent_first_logins_share_one_account() {
        let dir = temp_dir("qr-auth");
        let store = Store::from_backend(Arc::new(FileBackend::new(&dir)), Duration::from_secs(5));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                find_or_create_account(&store, &profile("a@x.com")).await.unwrap().id
            }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);

        let raw: Vec<serde_json::Value> =
            serde_json::from_slice(&tokio::fs::read(dir.join("users.json")).await.unwrap()).unwrap();
        let rows = raw.iter().filter(|r| r["provider_id"] == "sub-123").count();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn created_at_has_database_precision() {
        let store = Store::from_backend(
            Arc::new(FileBackend::new(temp_dir("qr-auth"))),
            Duration::from_secs(5),
        );
        let account = find_or_create_account(&store, &profile("a@x.com")).await.unwrap();
        assert_eq!(account.created_at.nanosecond() % 1_000, 0);
    }
}
