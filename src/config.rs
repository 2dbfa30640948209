use std::{path::PathBuf, time::Duration};

use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use crate::store::StoreConfig;

const DEV_SESSION_SECRET: &str = "qrcodes-dev-session-secret-change-me";

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_minutes: i64,
    pub secure_cookie: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub callback_url: String,
    /// Bound on each request to Google's token and userinfo endpoints.
    pub http_timeout: Duration,
}

impl GoogleConfig {
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.client_id.as_deref(), self.client_secret.as_deref()) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => Some((id, secret)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub production: bool,
    pub store: StoreConfig,
    pub session: SessionConfig,
    pub google: GoogleConfig,
    pub static_dir: PathBuf,
}

fn is_postgres_url(url: &str) -> bool {
    lazy_static! {
        static ref PG_URL_RE: Regex = Regex::new(r"^postgres(ql)?://\S+$").unwrap();
    }
    PG_URL_RE.is_match(url)
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let production = std::env::var("APP_ENV").map(|v| v == "production").unwrap_or(false);

        let database_url = env_opt("DATABASE_URL").or_else(|| env_opt("SUPABASE_DB_URL"));
        if let Some(url) = &database_url {
            anyhow::ensure!(
                is_postgres_url(url),
                "DATABASE_URL must start with postgres:// or postgresql://"
            );
        }

        let store = StoreConfig {
            database_url,
            data_dir: env_opt("DATA_DIR").map(PathBuf::from).unwrap_or_else(|| "./storage".into()),
            max_connections: env_parse("DB_MAX_CONNECTIONS", 5),
            acquire_timeout: Duration::from_secs(env_parse("DB_ACQUIRE_TIMEOUT_SECS", 10)),
            op_timeout: Duration::from_millis(env_parse("STORE_TIMEOUT_MS", 10_000)),
        };

        let secret = match env_opt("SESSION_SECRET") {
            Some(s) => s,
            None if production => anyhow::bail!("SESSION_SECRET must be set in production"),
            None => {
                warn!("SESSION_SECRET not set; using development secret");
                DEV_SESSION_SECRET.to_string()
            }
        };
        let session = SessionConfig {
            secret,
            issuer: std::env::var("SESSION_ISSUER").unwrap_or_else(|_| "qrcodes".into()),
            audience: std::env::var("SESSION_AUDIENCE").unwrap_or_else(|_| "qrcodes-web".into()),
            ttl_minutes: env_parse("SESSION_TTL_MINUTES", 60 * 24),
            secure_cookie: env_parse("COOKIE_SECURE", production),
        };

        let port = std::env::var("APP_PORT").unwrap_or_else(|_| "8080".into());
        let google = GoogleConfig {
            client_id: env_opt("GOOGLE_CLIENT_ID"),
            client_secret: env_opt("GOOGLE_CLIENT_SECRET"),
            callback_url: env_opt("GOOGLE_CALLBACK_URL")
                .unwrap_or_else(|| format!("http://localhost:{port}/auth/google/callback")),
            http_timeout: Duration::from_secs(env_parse("GOOGLE_HTTP_TIMEOUT_SECS", 10)),
        };

        Ok(Self {
            production,
            store,
            session,
            google,
            static_dir: env_opt("STATIC_DIR").map(PathBuf::from).unwrap_or_else(|| "./public".into()),
        })
    }
}
