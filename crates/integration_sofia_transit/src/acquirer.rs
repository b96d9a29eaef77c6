//! Session handshake with sofiatraffic.bg
//!
//! Sanctum flow: `GET /sanctum/csrf-cookie` sets `XSRF-TOKEN` (and usually the
//! session cookie), then loading the public page warms the session and
//! carries the `<meta name="csrf-token">` value used for `X-CSRF-TOKEN`.

use std::sync::Arc;

use chrono::Utc;
use reqwest::Client;
use reqwest::header::{ACCEPT, REFERER};
use tracing::{debug, instrument, warn};

use crate::classify::extract_csrf_meta;
use crate::error::TransitError;
use crate::tokens::{TokenStore, mask};

/// Endpoint issuing the XSRF cookie
pub const CSRF_COOKIE_PATH: &str = "/sanctum/csrf-cookie";
/// Public page used to warm the session
pub const PUBLIC_PAGE_PATH: &str = "/bg/public-transport";

const HTML_ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8";

/// Populates a [`TokenStore`] through the two-step handshake
#[derive(Debug, Clone)]
pub struct TokenAcquirer {
    http: Client,
    base_url: String,
    tokens: Arc<TokenStore>,
}

impl TokenAcquirer {
    /// Create an acquirer sharing the caller's HTTP client and token store
    #[must_use]
    pub fn new(http: Client, base_url: impl Into<String>, tokens: Arc<TokenStore>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            tokens,
        }
    }

    /// Run the handshake
    ///
    /// Cookies from the first step stay applied even if the second step fails.
    /// The refresh timestamp is only written once both steps completed.
    ///
    /// # Errors
    ///
    /// Returns [`TransitError::Network`] on connection failure or timeout.
    #[instrument(skip(self))]
    pub async fn acquire(&self) -> Result<(), TransitError> {
        let page_url = format!("{}{PUBLIC_PAGE_PATH}", self.base_url);

        let response = self
            .http
            .get(format!("{}{CSRF_COOKIE_PATH}", self.base_url))
            .header(ACCEPT, "*/*")
            .header("X-Requested-With", "XMLHttpRequest")
            .header(REFERER, &page_url)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "Failed to fetch tokens (csrf-cookie)");
                TransitError::from_reqwest(&e)
            })?;
        let applied = self.tokens.absorb_set_cookies(response.headers());
        debug!(
            status = response.status().as_u16(),
            cookies = applied,
            "Token fetch GET(sanctum/csrf-cookie)"
        );

        let response = self
            .http
            .get(&page_url)
            .header(ACCEPT, HTML_ACCEPT)
            .header("Upgrade-Insecure-Requests", "1")
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "Failed to fetch tokens (public page)");
                TransitError::from_reqwest(&e)
            })?;
        let status = response.status().as_u16();
        let applied = self.tokens.absorb_set_cookies(response.headers());
        debug!(status, cookies = applied, "Token warm-up GET(public-transport)");

        match response.text().await {
            Ok(body) => {
                if let Some(meta) = extract_csrf_meta(&body) {
                    self.tokens.set_csrf_meta_token(meta);
                }
            },
            Err(e) => debug!(error = %e, "Could not read public page body"),
        }

        self.tokens.mark_refreshed(Utc::now());

        let state = self.tokens.snapshot();
        debug!(
            xsrf = %mask(state.xsrf_token.as_deref()),
            session = %mask(state.session_cookie.as_deref()),
            meta_csrf = %mask(state.csrf_meta_token.as_deref()),
            "Fetched tokens"
        );
        if state.xsrf_token.is_none() || state.session_cookie.is_none() {
            warn!("Handshake finished without both session and XSRF cookies");
        }

        Ok(())
    }
}
