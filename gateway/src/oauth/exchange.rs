//! Authorization-code flow.
//!
//! Builds the provider authorization URL (with optional PKCE) and exchanges
//! the returned code for credentials after the `state` has been validated
//! and consumed.

use std::fmt;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use openidconnect::url::Url;
use openidconnect::PkceCodeChallenge;
use serde::Deserialize;
use tracing::{info, warn};
use zeroize::Zeroizing;

use super::error::OAuthError;
use super::state::{OAuthStateManager, StateConfig};

/// Client registration with the provider.
#[derive(Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: Zeroizing<String>,
    pub authorize_url: String,
    pub token_url: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub state: StateConfig,
    pub use_pkce: bool,
    /// Timeout for the token endpoint request.
    pub request_timeout: Duration,
}

impl fmt::Debug for OAuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("authorize_url", &self.authorize_url)
            .field("token_url", &self.token_url)
            .field("redirect_uri", &self.redirect_uri)
            .field("scopes", &self.scopes)
            .field("use_pkce", &self.use_pkce)
            .finish_non_exhaustive()
    }
}

impl OAuthConfig {
    /// Load from environment variables.
    ///
    /// Returns `Ok(None)` unless `OAUTH_CLIENT_ID`, `OAUTH_CLIENT_SECRET`,
    /// `OAUTH_AUTHORIZE_URL`, `OAUTH_TOKEN_URL` and `OAUTH_REDIRECT_URI` are
    /// all set. Optional: `OAUTH_SCOPES` (comma or space separated),
    /// `OAUTH_STATE_TTL_SECS` (default: 600), `OAUTH_USE_PKCE` (default: true).
    pub fn from_env() -> anyhow::Result<Option<Self>> {
        let Ok(client_id) = std::env::var("OAUTH_CLIENT_ID") else {
            return Ok(None);
        };

        let client_secret =
            std::env::var("OAUTH_CLIENT_SECRET").context("OAUTH_CLIENT_SECRET must be set")?;
        let authorize_url =
            std::env::var("OAUTH_AUTHORIZE_URL").context("OAUTH_AUTHORIZE_URL must be set")?;
        let token_url = std::env::var("OAUTH_TOKEN_URL").context("OAUTH_TOKEN_URL must be set")?;
        let redirect_uri =
            std::env::var("OAUTH_REDIRECT_URI").context("OAUTH_REDIRECT_URI must be set")?;

        let scopes = std::env::var("OAUTH_SCOPES")
            .map(|s| {
                s.split([',', ' '])
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let mut state = StateConfig::default();
        if let Some(secs) = std::env::var("OAUTH_STATE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            state.ttl = Duration::from_secs(secs);
        }

        Ok(Some(Self {
            client_id,
            client_secret: Zeroizing::new(client_secret),
            authorize_url,
            token_url,
            redirect_uri,
            scopes,
            state,
            use_pkce: std::env::var("OAUTH_USE_PKCE")
                .map(|v| v.parse().unwrap_or(true))
                .unwrap_or(true),
            request_timeout: Duration::from_secs(10),
        }))
    }
}

/// Where to send the user, and the state token bound to the request.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
}

/// Tokens granted by the provider.
pub struct Credentials {
    pub access_token: Zeroizing<String>,
    pub token_type: String,
    pub scopes: Vec<String>,
    pub refresh_token: Option<Zeroizing<String>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("scopes", &self.scopes)
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Credentials {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Token endpoint response. Chat platforms answer 200 with `ok: false` on
/// error; standard providers use an `error` field.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    ok: Option<bool>,
    error: Option<String>,
    error_description: Option<String>,
    access_token: Option<String>,
    token_type: Option<String>,
    scope: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

impl TokenResponse {
    fn into_credentials(self, now: DateTime<Utc>) -> Result<Credentials, OAuthError> {
        if self.ok == Some(false) || self.error.is_some() {
            let error = self.error.as_deref().unwrap_or("unknown_error");
            let description = self.error_description.as_deref().unwrap_or("");
            return Err(OAuthError::Exchange(format!("{error} {description}").trim().to_string()));
        }
        let access_token = self
            .access_token
            .ok_or_else(|| OAuthError::Exchange("response has no access_token".to_string()))?;

        Ok(Credentials {
            access_token: Zeroizing::new(access_token),
            token_type: self.token_type.unwrap_or_else(|| "bearer".to_string()),
            scopes: self
                .scope
                .map(|s| {
                    s.split([',', ' '])
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            refresh_token: self.refresh_token.map(Zeroizing::new),
            expires_at: self
                .expires_in
                .and_then(|secs| i64::try_from(secs).ok())
                .and_then(chrono::TimeDelta::try_seconds)
                .map(|ttl| now + ttl),
        })
    }
}

/// Runs the authorization-code handshake for one provider registration.
pub struct OAuthClient<C> {
    config: OAuthConfig,
    authorize_url: Url,
    states: OAuthStateManager<C>,
    http: reqwest::Client,
}

impl<C> OAuthClient<C> {
    pub fn new(config: OAuthConfig) -> Result<Self, OAuthError> {
        let authorize_url = Url::parse(&config.authorize_url)
            .map_err(|e| OAuthError::Configuration(format!("authorize URL: {e}")))?;
        Url::parse(&config.token_url)
            .map_err(|e| OAuthError::Configuration(format!("token URL: {e}")))?;
        Url::parse(&config.redirect_uri)
            .map_err(|e| OAuthError::Configuration(format!("redirect URI: {e}")))?;

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            states: OAuthStateManager::new(config.state.clone()),
            authorize_url,
            config,
            http,
        })
    }

    pub const fn states(&self) -> &OAuthStateManager<C> {
        &self.states
    }

    /// Issue a state bound to `context` and build the provider URL.
    pub fn authorization_url(&self, context: C) -> Result<AuthorizationRequest, OAuthError> {
        let pkce = self
            .config
            .use_pkce
            .then(PkceCodeChallenge::new_random_sha256);
        let verifier = pkce
            .as_ref()
            .map(|(_, verifier)| Zeroizing::new(verifier.secret().clone()));
        let state = self.states.issue_with_verifier(context, verifier)?;

        let mut url = self.authorize_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", &self.config.client_id)
                .append_pair("redirect_uri", &self.config.redirect_uri)
                .append_pair("state", &state)
                .append_pair("response_type", "code");
            if !self.config.scopes.is_empty() {
                query.append_pair("scope", &self.config.scopes.join(" "));
            }
            if let Some((challenge, _)) = &pkce {
                query
                    .append_pair("code_challenge", challenge.as_str())
                    .append_pair("code_challenge_method", "S256");
            }
        }

        Ok(AuthorizationRequest {
            url: url.to_string(),
            state,
        })
    }

    /// Validate and consume `state`, then exchange `code` for credentials.
    ///
    /// The state is consumed even if the exchange fails, so a code can only
    /// be attempted once per authorization request.
    #[tracing::instrument(skip_all)]
    pub async fn complete(&self, code: &str, state: &str) -> Result<(Credentials, C), OAuthError> {
        let consumed = self.states.consume(state)?;

        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", "authorization_code"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
        ];
        if let Some(verifier) = &consumed.pkce_verifier {
            form.push(("code_verifier", verifier.as_str()));
        }

        let response = self
            .http
            .post(&self.config.token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        let body: TokenResponse = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                warn!(status = %status, "Token endpoint returned an unreadable body");
                return Err(OAuthError::Exchange(format!("HTTP {status}: {e}")));
            }
        };
        if !status.is_success() && body.error.is_none() {
            return Err(OAuthError::Exchange(format!("HTTP {status}")));
        }

        let credentials = body.into_credentials(Utc::now()).inspect_err(|e| {
            warn!(error = %e, "Authorization code exchange rejected");
        })?;
        info!(
            scopes = ?credentials.scopes,
            pending_ms = consumed.age.as_millis() as u64,
            "Authorization code exchanged"
        );
        Ok((credentials, consumed.context))
    }
}
