//! Session identity (§4.D): a reusable identity handle used to group
//! related requests, with usage/error scoring, TTL expiry, and a cookie
//! jar. Retirement is signalled to the owning pool through the event bus
//! rather than an inherited emitter (§9 redesign note).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::cookie::{CookieJar, StoredCookie};

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Tuning knobs for a single [`Session`], nested under
/// `SessionPoolOptions.sessionOptions` in configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SessionOptions {
    pub max_usage_count: u32,
    pub max_error_score: f64,
    pub error_score_decrement: f64,
    pub max_age_secs: u64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            max_usage_count: 50,
            max_error_score: 3.0,
            error_score_decrement: 0.5,
            max_age_secs: 3000,
        }
    }
}

/// `Fresh → InUse → (Fresh | Retired)`. `InUse` exists only for the
/// duration of a single borrow and is not observable between requests in
/// this single-threaded-cooperative model, so the persisted/observable
/// states are just `Active` and `Retired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Active,
    Retired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub usage_count: u32,
    pub max_usage_count: u32,
    pub error_score: f64,
    pub max_error_score: f64,
    pub error_score_decrement: f64,
    pub cookie_jar: CookieJar,
    pub user_data: std::collections::HashMap<String, Value>,
    pub state: SessionState,
}

impl Session {
    pub fn new(options: SessionOptions) -> Self {
        let created_at = now_millis();
        Session {
            id: Uuid::new_v4().to_string(),
            created_at,
            expires_at: created_at + (options.max_age_secs as i64 * 1000),
            usage_count: 0,
            max_usage_count: options.max_usage_count,
            error_score: 0.0,
            max_error_score: options.max_error_score,
            error_score_decrement: options.error_score_decrement,
            cookie_jar: CookieJar::new(),
            user_data: std::collections::HashMap::new(),
            state: SessionState::Active,
        }
    }

    pub fn is_expired(&self) -> bool {
        now_millis() >= self.expires_at
    }

    pub fn is_blocked(&self) -> bool {
        self.error_score >= self.max_error_score
    }

    pub fn is_max_usage_reached(&self) -> bool {
        self.usage_count >= self.max_usage_count
    }

    pub fn is_usable(&self) -> bool {
        self.state == SessionState::Active
            && !self.is_expired()
            && !self.is_blocked()
            && !self.is_max_usage_reached()
    }

    /// `usageCount++`; `errorScore = max(0, errorScore - errorScoreDecrement)`.
    /// Retires if the session becomes unusable as a result.
    pub fn mark_good(&mut self) {
        self.usage_count += 1;
        self.error_score = (self.error_score - self.error_score_decrement).max(0.0);
        self.maybe_retire();
    }

    /// `usageCount++`; `errorScore++`. Retires if the session becomes
    /// unusable as a result.
    pub fn mark_bad(&mut self) {
        self.usage_count += 1;
        self.error_score += 1.0;
        self.maybe_retire();
    }

    fn maybe_retire(&mut self) {
        if self.state == SessionState::Active
            && (self.is_expired() || self.is_blocked() || self.is_max_usage_reached())
        {
            self.retire();
        }
    }

    /// Transitions to `Retired`. The pool observes this (via the event
    /// bus or a direct post-call check) and removes the session.
    pub fn retire(&mut self) {
        if self.state != SessionState::Retired {
            debug!(session_id = %self.id, "session retired");
        }
        self.state = SessionState::Retired;
    }

    /// If `status_code` is in `blocked_status_codes` ∪ `extra`, retire
    /// and return true; otherwise false.
    pub fn retire_on_blocked_status_codes(
        &mut self,
        status_code: u16,
        blocked_status_codes: &[u16],
        extra: &[u16],
    ) -> bool {
        if blocked_status_codes.contains(&status_code) || extra.contains(&status_code) {
            self.retire();
            true
        } else {
            false
        }
    }

    pub fn set_cookies(&mut self, cookies: &[StoredCookie]) {
        self.cookie_jar.set_cookies(cookies);
    }

    pub fn set_cookies_from_response(&mut self, set_cookie_headers: &[String], url: &str) {
        self.cookie_jar.set_cookies_from_response(set_cookie_headers, url);
    }

    pub fn get_cookies(&self, url: &str) -> Vec<StoredCookie> {
        self.cookie_jar.get_cookies(url)
    }

    pub fn get_cookie_string(&self, url: &str) -> String {
        self.cookie_jar.get_cookie_string(url)
    }

    /// Already directly serializable through the external storage
    /// interface (`KeyValueStore`); this is just a named accessor so
    /// call sites read like the spec's `getState()`.
    pub fn get_state(&self) -> &Session {
        self
    }

    pub fn default_blocked_status_codes() -> Vec<u16> {
        vec![401, 403, 429]
    }
}

/// Duration remaining until expiry, for diagnostics.
pub fn time_to_expiry(session: &Session) -> Duration {
    let remaining_ms = (session.expires_at - now_millis()).max(0);
    Duration::from_millis(remaining_ms as u64)
}
