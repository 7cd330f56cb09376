//! OAuth State Manager
//!
//! Issues single-use anti-forgery `state` tokens for the authorization-code
//! redirect and binds each to caller context. Tokens are stored under their
//! SHA-256 digest, expire after a TTL, and are deleted on first use.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use openidconnect::CsrfToken;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::error::OAuthError;

/// Issues between opportunistic sweeps.
const SWEEP_EVERY: u64 = 64;

/// State-store settings.
#[derive(Debug, Clone)]
pub struct StateConfig {
    pub ttl: Duration,
    pub max_pending: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            max_pending: 10_000,
        }
    }
}

/// A pending authorization.
struct PendingState<C> {
    created_at: Instant,
    expires_at: Instant,
    context: C,
    pkce_verifier: Option<Zeroizing<String>>,
}

/// What a successfully consumed state carried.
pub struct ConsumedState<C> {
    pub context: C,
    pub pkce_verifier: Option<Zeroizing<String>>,
    /// How long the state was pending.
    pub age: Duration,
}

/// Store of outstanding `state` tokens.
pub struct OAuthStateManager<C> {
    states: DashMap<String, PendingState<C>>,
    ttl: Duration,
    max_pending: usize,
    issued: AtomicU64,
}

fn state_key(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

impl<C> OAuthStateManager<C> {
    pub fn new(config: StateConfig) -> Self {
        Self {
            states: DashMap::new(),
            ttl: config.ttl,
            max_pending: config.max_pending.max(1),
            issued: AtomicU64::new(0),
        }
    }

    /// Issue a fresh token bound to `context`.
    pub fn issue(&self, context: C) -> Result<String, OAuthError> {
        self.issue_with_verifier(context, None)
    }

    /// Issue a token that also remembers a PKCE code verifier.
    pub fn issue_with_verifier(
        &self,
        context: C,
        pkce_verifier: Option<Zeroizing<String>>,
    ) -> Result<String, OAuthError> {
        let now = Instant::now();
        if self.issued.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == 0 {
            self.sweep_expired_at(now);
        }
        if self.states.len() >= self.max_pending && self.sweep_expired_at(now) == 0 {
            warn!(max_pending = self.max_pending, "OAuth state table full");
            return Err(OAuthError::TooManyPendingStates);
        }

        let token = CsrfToken::new_random().secret().clone();
        self.states.insert(
            state_key(&token),
            PendingState {
                created_at: now,
                expires_at: now + self.ttl,
                context,
                pkce_verifier,
            },
        );
        Ok(token)
    }

    /// Destructively validate `token`, returning its bound context.
    ///
    /// Unknown, expired and replayed tokens all yield
    /// [`OAuthError::StateInvalid`].
    pub fn validate_and_consume(&self, token: &str) -> Result<C, OAuthError> {
        self.consume(token).map(|consumed| consumed.context)
    }

    /// Like [`Self::validate_and_consume`], returning the PKCE verifier too.
    pub fn consume(&self, token: &str) -> Result<ConsumedState<C>, OAuthError> {
        // Removal happens first so concurrent callers cannot both succeed.
        let Some((_, state)) = self.states.remove(&state_key(token)) else {
            debug!("OAuth state unknown or already used");
            return Err(OAuthError::StateInvalid);
        };

        let now = Instant::now();
        if now >= state.expires_at {
            debug!("OAuth state expired");
            return Err(OAuthError::StateInvalid);
        }

        Ok(ConsumedState {
            context: state.context,
            pkce_verifier: state.pkce_verifier,
            age: now.duration_since(state.created_at),
        })
    }

    /// Remove states expired at `now`. Returns how many were dropped.
    fn sweep_expired_at(&self, now: Instant) -> usize {
        let before = self.states.len();
        self.states.retain(|_, state| now < state.expires_at);
        before.saturating_sub(self.states.len())
    }

    pub fn pending(&self) -> usize {
        self.states.len()
    }

    pub const fn ttl(&self) -> Duration {
        self.ttl
    }
}
