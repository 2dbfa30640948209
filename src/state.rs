use crate::auth::oauth::{GoogleProvider, IdentityProvider};
use crate::auth::sessions::{self, SessionStore};
use crate::config::AppConfig;
use crate::store::Store;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Store,
    pub sessions: Arc<dyn SessionStore>,
    pub identity: Arc<dyn IdentityProvider>,
}

impl AppState {
    pub async fn init(config: AppConfig) -> anyhow::Result<Self> {
        let store = Store::connect(&config.store).await?;
        let sessions = sessions::for_pool(store.pg_pool(), config.production);
        let identity = Arc::new(GoogleProvider::new(config.google.clone())?) as Arc<dyn IdentityProvider>;

        Ok(Self {
            config: Arc::new(config),
            store,
            sessions,
            identity,
        })
    }
}

/// Authorization code the fake identity provider accepts.
#[cfg(test)]
pub const FAKE_AUTH_CODE: &str = "fake-code";

#[cfg(test)]
impl AppState {
    /// File-backed store in a fresh temp dir, in-memory sessions and an
    /// identity provider that trusts [`FAKE_AUTH_CODE`].
    pub fn fake() -> Self {
        use crate::auth::oauth::ExternalProfile;
        use crate::auth::sessions::MemorySessionStore;
        use crate::config::{GoogleConfig, SessionConfig};
        use crate::store::{file::FileBackend, test_support::temp_dir, StoreConfig};
        use async_trait::async_trait;
        use std::time::Duration;

        struct FakeIdentity;
        #[async_trait]
        impl IdentityProvider for FakeIdentity {
            fn name(&self) -> &'static str {
                "google"
            }
            fn authorize_url(&self, state: &str) -> Option<String> {
                Some(format!("https://idp.test/authorize?state={state}"))
            }
            async fn exchange(&self, code: &str) -> anyhow::Result<ExternalProfile> {
                anyhow::ensure!(code == FAKE_AUTH_CODE, "unknown code");
                Ok(ExternalProfile {
                    provider: "google".into(),
                    subject: "fake-sub".into(),
                    email: "ada@example.com".into(),
                    name: "Ada".into(),
                    avatar: None,
                })
            }
        }

        let data_dir = temp_dir("qr-state");
        let config = Arc::new(AppConfig {
            production: false,
            store: StoreConfig {
                database_url: None,
                data_dir: data_dir.clone(),
                max_connections: 1,
                acquire_timeout: Duration::from_secs(1),
                op_timeout: Duration::from_secs(5),
            },
            session: SessionConfig {
                secret: "test".into(),
                issuer: "test".into(),
                audience: "test".into(),
                ttl_minutes: 60,
                secure_cookie: false,
            },
            google: GoogleConfig {
                client_id: None,
                client_secret: None,
                callback_url: "http://localhost/auth/google/callback".into(),
                http_timeout: Duration::from_secs(1),
            },
            static_dir: data_dir.join("public"),
        });

        Self {
            store: Store::from_backend(Arc::new(FileBackend::new(data_dir)), config.store.op_timeout),
            config,
            sessions: Arc::new(MemorySessionStore::new()),
            identity: Arc::new(FakeIdentity),
        }
    }
}
