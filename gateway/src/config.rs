//! Gateway Configuration
//!
//! Loads configuration from environment variables.

use anyhow::{bail, Result};
use std::{env, fmt};
use zeroize::Zeroizing;

use crate::oauth::OAuthConfig;
use crate::outbound::OutboundConfig;
use crate::ratelimit::RateLimitConfig;
use crate::webhooks::signing::DEFAULT_TOLERANCE_SECS;
use crate::webhooks::{DedupConfig, ProviderProfile};

/// Gateway configuration loaded from environment variables.
#[derive(Clone)]
pub struct Config {
    /// Server bind address (e.g., "0.0.0.0:8080")
    pub bind_address: String,

    /// Signing secret for the chat platform (`CHAT_SIGNING_SECRET`)
    pub chat_secret: Option<Zeroizing<String>>,

    /// Webhook secret for the source host (`SOURCE_SIGNING_SECRET`)
    pub source_secret: Option<Zeroizing<String>>,

    /// Accepted signature timestamp skew in seconds (default: 300)
    pub signature_tolerance_secs: u64,

    pub dedup: DedupConfig,

    /// Outbound token bucket
    pub rate_limit: RateLimitConfig,

    /// Outbound queue, concurrency and retry
    pub outbound: OutboundConfig,

    /// Installation flow (optional)
    pub oauth: Option<OAuthConfig>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted = |s: &Option<Zeroizing<String>>| s.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("chat_secret", &redacted(&self.chat_secret))
            .field("source_secret", &redacted(&self.source_secret))
            .field("signature_tolerance_secs", &self.signature_tolerance_secs)
            .field("dedup", &self.dedup)
            .field("rate_limit", &self.rate_limit)
            .field("outbound", &self.outbound)
            .field("oauth", &self.oauth)
            .finish()
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// At least one of `CHAT_SIGNING_SECRET` and `SOURCE_SIGNING_SECRET`
    /// must be set.
    pub fn from_env() -> Result<Self> {
        let secret = |name: &str| {
            env::var(name)
                .ok()
                .filter(|s| !s.is_empty())
                .map(Zeroizing::new)
        };

        let config = Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            chat_secret: secret("CHAT_SIGNING_SECRET"),
            source_secret: secret("SOURCE_SIGNING_SECRET"),
            signature_tolerance_secs: env::var("SIGNATURE_TOLERANCE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_TOLERANCE_SECS),
            dedup: DedupConfig::from_env(),
            rate_limit: RateLimitConfig::from_env(),
            outbound: OutboundConfig::from_env(),
            oauth: OAuthConfig::from_env()?,
        };

        if config.chat_secret.is_none() && config.source_secret.is_none() {
            bail!("CHAT_SIGNING_SECRET or SOURCE_SIGNING_SECRET must be set");
        }
        Ok(config)
    }

    /// Ingress profiles for every configured provider.
    pub fn provider_profiles(&self) -> Vec<ProviderProfile> {
        let chat = self.chat_secret.as_ref().map(|secret| {
            ProviderProfile::chat_platform(secret.as_str())
                .with_tolerance(self.signature_tolerance_secs)
        });
        let source = self
            .source_secret
            .as_ref()
            .map(|secret| ProviderProfile::source_host(secret.as_str()));
        chat.into_iter().chain(source).collect()
    }

    /// Check if the installation flow is configured.
    #[must_use]
    pub const fn has_oauth(&self) -> bool {
        self.oauth.is_some()
    }

    /// Create a default configuration for testing.
    #[must_use]
    pub fn default_for_test() -> Self {
        Self {
            bind_address: "127.0.0.1:0".into(),
            chat_secret: Some(Zeroizing::new("test-chat-secret".into())),
            source_secret: Some(Zeroizing::new("test-source-secret".into())),
            signature_tolerance_secs: DEFAULT_TOLERANCE_SECS,
            dedup: DedupConfig::default(),
            rate_limit: RateLimitConfig::default(),
            outbound: OutboundConfig::default(),
            oauth: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 5] = [
        "BIND_ADDRESS",
        "CHAT_SIGNING_SECRET",
        "SOURCE_SIGNING_SECRET",
        "SIGNATURE_TOLERANCE_SECS",
        "OAUTH_CLIENT_ID",
    ];

    fn clear() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn requires_a_signing_secret() {
        clear();
        assert!(Config::from_env().is_err());
    }

    #[test]
    #[serial]
    fn loads_chat_only() {
        clear();
        env::set_var("CHAT_SIGNING_SECRET", "s3cret");
        env::set_var("SIGNATURE_TOLERANCE_SECS", "60");

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert!(config.source_secret.is_none());
        assert!(!config.has_oauth());

        let profiles = config.provider_profiles();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].name, "chat");
        assert_eq!(profiles[0].tolerance_secs, 60);
        clear();
    }

    #[test]
    fn test_config_has_both_providers() {
        let names: Vec<_> = Config::default_for_test()
            .provider_profiles()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["chat", "source"]);
    }
}
