//! Session and anti-forgery token storage
//!
//! The provider is a Laravel Sanctum backend: POSTs need the `XSRF-TOKEN`
//! cookie echoed in a header plus the `sofia_traffic_session` cookie. One
//! [`TokenStore`] is shared by the token acquirer and the fetch client for the
//! lifetime of a coordinator.

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, SET_COOKIE};

/// Cookie carrying the XSRF token
pub const XSRF_COOKIE: &str = "XSRF-TOKEN";
/// Cookie carrying the Laravel session
pub const SESSION_COOKIE: &str = "sofia_traffic_session";

/// Default token lifespan in seconds
pub const DEFAULT_TOKEN_LIFESPAN_SECS: u64 = 3600;

/// Snapshot of the credentials used to sign a request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenState {
    /// Value of the `sofia_traffic_session` cookie
    pub session_cookie: Option<String>,
    /// Value of the `XSRF-TOKEN` cookie (URL-decoded)
    pub xsrf_token: Option<String>,
    /// `<meta name="csrf-token">` scraped from the public page
    pub csrf_meta_token: Option<String>,
    /// When the handshake last completed
    pub last_refreshed: Option<DateTime<Utc>>,
}

impl TokenState {
    /// Whether the tokens must be re-acquired before use
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, lifespan_secs: u64) -> bool {
        if self.session_cookie.is_none() || self.xsrf_token.is_none() {
            return true;
        }
        let Some(refreshed) = self.last_refreshed else {
            return true;
        };
        let lifespan = i64::try_from(lifespan_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX);
        now.signed_duration_since(refreshed) > lifespan
    }

    /// Value for the `Cookie` request header
    #[must_use]
    pub fn cookie_header(&self) -> String {
        format!(
            "{XSRF_COOKIE}={}; {SESSION_COOKIE}={}",
            self.xsrf_token.as_deref().unwrap_or_default(),
            self.session_cookie.as_deref().unwrap_or_default()
        )
    }

    /// Value for the `X-CSRF-TOKEN` header, falling back to the XSRF cookie
    #[must_use]
    pub fn csrf_header(&self) -> &str {
        self.csrf_meta_token
            .as_deref()
            .or(self.xsrf_token.as_deref())
            .unwrap_or_default()
    }
}

/// Shared, interior-mutable token holder
#[derive(Debug, Default)]
pub struct TokenStore {
    state: Mutex<TokenState>,
}

impl TokenStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear every field, forcing a fresh handshake
    pub fn reset(&self) {
        *self.state.lock() = TokenState::default();
    }

    /// Staleness check against the given clock
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, lifespan_secs: u64) -> bool {
        self.state.lock().is_stale(now, lifespan_secs)
    }

    /// Copy of the current state
    #[must_use]
    pub fn snapshot(&self) -> TokenState {
        self.state.lock().clone()
    }

    /// Store the meta csrf token scraped from HTML
    pub fn set_csrf_meta_token(&self, token: String) {
        self.state.lock().csrf_meta_token = Some(token);
    }

    /// Record a completed handshake
    pub fn mark_refreshed(&self, at: DateTime<Utc>) {
        self.state.lock().last_refreshed = Some(at);
    }

    /// Pick up rotated cookies from a response
    ///
    /// Returns the number of recognized cookies applied.
    pub fn absorb_set_cookies(&self, headers: &HeaderMap) -> usize {
        let mut applied = 0;
        let mut state = self.state.lock();

        for value in headers.get_all(SET_COOKIE) {
            let Ok(raw) = value.to_str() else {
                continue;
            };
            let Some((name, value)) = parse_set_cookie(raw) else {
                continue;
            };
            match name {
                XSRF_COOKIE => {
                    state.xsrf_token = Some(value);
                    applied += 1;
                },
                SESSION_COOKIE => {
                    state.session_cookie = Some(value);
                    applied += 1;
                },
                _ => {},
            }
        }

        applied
    }
}

/// Split `name=value; Path=/; ...` into a name and URL-decoded value
fn parse_set_cookie(raw: &str) -> Option<(&str, String)> {
    let pair = raw.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    let decoded = urlencoding::decode(value.trim())
        .map_or_else(|_| value.trim().to_string(), std::borrow::Cow::into_owned);
    Some((name.trim(), decoded))
}

/// Mask a token for logs
#[must_use]
pub fn mask(token: Option<&str>) -> String {
    match token {
        None | Some("") => "<empty>".to_string(),
        Some(t) if t.chars().count() <= 8 => "*".repeat(t.chars().count()),
        Some(t) => {
            let head: String = t.chars().take(4).collect();
            let tail: String = t
                .chars()
                .rev()
                .take(4)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            format!("{head}***{tail}")
        },
    }
}
