//! Session and activity tracking on top of the state manager.
//!
//! Keeps the access token and the last user activity under the configured
//! key prefix (`auth/` by default) and answers the questions the console
//! asks on every tick: is the user idle, and is it time to refresh.

use serde_json::json;
use std::time::Duration;
use tracing::debug;

use crate::config::SessionConfig;
use crate::error::{Result, TokenError};
use crate::manager::{SetOptions, StateManager};
use crate::token::{self, TokenClaims};

const SOURCE: &str = "session";

/// Tracks the current session's token and user activity.
#[derive(Clone)]
pub struct SessionTracker {
    manager: StateManager,
    config: SessionConfig,
}

impl SessionTracker {
    pub fn new(manager: StateManager, config: SessionConfig) -> Self {
        Self { manager, config }
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.config.key_prefix, name)
    }

    fn now(&self) -> u64 {
        self.manager.clock().now_millis()
    }

    /// Start a session with `token`.
    ///
    /// The stored token carries a TTL matching its remaining lifetime, so the
    /// manager drops it on its own once it expires. A token that has already
    /// expired is rejected and nothing is stored.
    pub fn begin(&self, access_token: &str) -> Result<TokenClaims> {
        let claims = token::decode_claims(access_token)?;
        let mut options = SetOptions::source(SOURCE);
        if let Some(exp) = claims.expires_at() {
            let left = exp.saturating_sub(self.now());
            if left == 0 {
                return Err(TokenError::Expired(exp).into());
            }
            options = options.with_ttl(Duration::from_millis(left));
        }
        self.manager.set(&self.key("token"), json!(access_token), options)?;
        self.touch()?;
        debug!(sub = ?claims.sub, "Session started");
        Ok(claims)
    }

    /// Note user activity. Writes at most once per `activity_throttle`;
    /// returns whether this call wrote.
    pub fn record_activity(&self) -> Result<bool> {
        let now = self.now();
        let throttle = self.config.activity_throttle.as_millis() as u64;
        if self
            .last_activity()
            .is_some_and(|last| now.saturating_sub(last) < throttle)
        {
            return Ok(false);
        }
        self.touch()?;
        Ok(true)
    }

    fn touch(&self) -> Result<()> {
        let now = self.now();
        self.manager
            .set(&self.key("lastActivity"), json!(now), SetOptions::source(SOURCE))?;
        Ok(())
    }

    /// The stored token, unless absent or expired.
    pub fn token(&self) -> Option<String> {
        self.manager.get_json(&self.key("token")).ok().flatten()
    }

    /// Last recorded activity in Unix milliseconds.
    pub fn last_activity(&self) -> Option<u64> {
        self.manager
            .get_json(&self.key("lastActivity"))
            .ok()
            .flatten()
    }

    /// Whether a token is held and has not expired.
    pub fn is_active(&self) -> bool {
        self.token()
            .is_some_and(|t| !token::is_expired(&t, self.now()))
    }

    /// Whether no activity was recorded within `idle_timeout`.
    pub fn is_idle(&self, idle_timeout: Duration) -> bool {
        match self.last_activity() {
            Some(last) => self.now().saturating_sub(last) > idle_timeout.as_millis() as u64,
            None => true,
        }
    }

    /// Whether the held token is within the refresh threshold of expiry.
    /// `false` when there is no session.
    pub fn should_refresh(&self) -> bool {
        self.token()
            .is_some_and(|t| token::needs_refresh(&t, self.now(), self.config.refresh_threshold))
    }

    /// Time until the held token expires.
    pub fn time_until_expiry(&self) -> Option<Duration> {
        self.token()
            .and_then(|t| token::time_until_expiry(&t, self.now()))
    }

    /// Remove every key the tracker owns.
    pub fn end(&self) {
        for key in self.manager.keys() {
            if key.starts_with(&self.config.key_prefix) {
                self.manager.remove(&key);
            }
        }
        debug!("Session ended");
    }
}
