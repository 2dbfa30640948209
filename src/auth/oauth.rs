//! External identity verification.
//!
//! Only the Google authorization-code flow is wired up. The protocol work is
//! Google's: we build the consent URL, trade the code for an access token and
//! read the userinfo endpoint.

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::config::GoogleConfig;

const AUTHORIZE_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const USERINFO_URL: &str = "https://openidconnect.googleapis.com/v1/userinfo";

/// Identity asserted by a provider after a successful login.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalProfile {
    pub provider: String,
    pub subject: String,
    pub email: String,
    pub name: String,
    pub avatar: Option<String>,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` when the provider is not configured.
    fn authorize_url(&self, state: &str) -> Option<String>;

    async fn exchange(&self, code: &str) -> anyhow::Result<ExternalProfile>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct GoogleUserInfo {
    sub: String,
    email: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    picture: Option<String>,
}

impl From<GoogleUserInfo> for ExternalProfile {
    fn from(u: GoogleUserInfo) -> Self {
        Self {
            provider: "google".into(),
            name: u.name.unwrap_or_else(|| u.email.clone()),
            subject: u.sub,
            email: u.email,
            avatar: u.picture,
        }
    }
}

pub struct GoogleProvider {
    http: reqwest::Client,
    config: GoogleConfig,
    token_url: String,
    userinfo_url: String,
}

impl GoogleProvider {
    pub fn new(config: GoogleConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .context("build google http client")?;
        Ok(Self {
            http,
            config,
            token_url: TOKEN_URL.into(),
            userinfo_url: USERINFO_URL.into(),
        })
    }

    #[cfg(test)]
    fn with_endpoints(mut self, token_url: &str, userinfo_url: &str) -> Self {
        self.token_url = token_url.into();
        self.userinfo_url = userinfo_url.into();
        self
    }
}

#[async_trait]
impl IdentityProvider for GoogleProvider {
    fn name(&self) -> &'static str {
        "google"
    }

    fn authorize_url(&self, state: &str) -> Option<String> {
        let (client_id, _) = self.config.credentials()?;
        let url = url::Url::parse_with_params(
            AUTHORIZE_URL,
            &[
                ("client_id", client_id),
                ("redirect_uri", self.config.callback_url.as_str()),
                ("response_type", "code"),
                ("scope", "openid email profile"),
                ("state", state),
            ],
        )
        .ok()?;
        Some(url.into())
    }

    async fn exchange(&self, code: &str) -> anyhow::Result<ExternalProfile> {
        let (client_id, client_secret) = self
            .config
            .credentials()
            .context("google oauth is not configured")?;

        let token: TokenResponse = self
            .http
            .post(&self.token_url)
            .form(&[
                ("code", code),
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("redirect_uri", self.config.callback_url.as_str()),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await
            .context("google token request")?
            .error_for_status()
            .context("google token exchange rejected")?
            .json()
            .await
            .context("decode google token response")?;

        let info: GoogleUserInfo = self
            .http
            .get(&self.userinfo_url)
            .bearer_auth(&token.access_token)
            .send()
            .await
            .context("google userinfo request")?
            .error_for_status()
            .context("google userinfo rejected")?
            .json()
            .await
            .context("decode google userinfo")?;

        debug!(subject = %info.sub, "google identity verified");
        Ok(info.into())
    }
}
