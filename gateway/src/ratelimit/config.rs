//! Rate limiting configuration.

/// Configuration for the outbound token bucket.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Whether rate limiting is enabled
    pub enabled: bool,
    /// Budget granted by the remote service
    pub limit: LimitConfig,
}

/// A "requests per window" budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitConfig {
    /// Maximum requests allowed in the window (bucket capacity)
    pub requests: u32,
    /// Window duration in seconds
    pub window_secs: u64,
}

impl LimitConfig {
    /// Continuous refill rate that spreads `requests` over the window.
    pub fn refill_per_sec(&self) -> f64 {
        f64::from(self.requests) / self.window_secs.max(1) as f64
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            limit: LimitConfig {
                requests: 5000,
                window_secs: 3600,
            },
        }
    }
}

impl RateLimitConfig {
    /// Creates configuration from environment variables.
    ///
    /// Environment variables:
    /// - `RATE_LIMIT_ENABLED`: Enable/disable rate limiting (default: true)
    /// - `RATE_LIMIT_OUTBOUND`: Outbound budget as "requests,window_secs" (default: "5000,3600")
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("RATE_LIMIT_ENABLED") {
            config.enabled = val.parse().unwrap_or(true);
        }
        if let Ok(val) = std::env::var("RATE_LIMIT_OUTBOUND") {
            if let Some(limit) = parse_limit_config(&val) {
                config.limit = limit;
            }
        }

        config
    }

    /// A limiter that always grants.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

/// Parses a limit config from "requests,window_secs" format.
fn parse_limit_config(val: &str) -> Option<LimitConfig> {
    let parts: Vec<&str> = val.split(',').collect();
    if parts.len() == 2 {
        let requests = parts[0].trim().parse().ok()?;
        let window_secs = parts[1].trim().parse().ok()?;
        if requests == 0 || window_secs == 0 {
            return None;
        }
        Some(LimitConfig { requests, window_secs })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = RateLimitConfig::default();
        assert!(config.enabled);
        assert_eq!(config.limit.requests, 5000);
        assert_eq!(config.limit.window_secs, 3600);
    }

    #[test]
    fn test_refill_rate() {
        let limit = LimitConfig {
            requests: 120,
            window_secs: 60,
        };
        assert!((limit.refill_per_sec() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_limit_config() {
        let limit = parse_limit_config("10,60").unwrap();
        assert_eq!(limit.requests, 10);
        assert_eq!(limit.window_secs, 60);

        // With whitespace
        let limit = parse_limit_config(" 20 , 120 ").unwrap();
        assert_eq!(limit.requests, 20);
        assert_eq!(limit.window_secs, 120);

        // Invalid formats
        assert!(parse_limit_config("10").is_none());
        assert!(parse_limit_config("10,60,extra").is_none());
        assert!(parse_limit_config("abc,60").is_none());
        assert!(parse_limit_config("0,60").is_none());
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var("RATE_LIMIT_ENABLED", "false");
        std::env::set_var("RATE_LIMIT_OUTBOUND", "50,10");
        let config = RateLimitConfig::from_env();
        std::env::remove_var("RATE_LIMIT_ENABLED");
        std::env::remove_var("RATE_LIMIT_OUTBOUND");

        assert!(!config.enabled);
        assert_eq!(
            config.limit,
            LimitConfig {
                requests: 50,
                window_secs: 10
            }
        );
    }
}
