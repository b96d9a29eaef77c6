//! sofiatraffic.bg virtual-table client
//!
//! Fetches the live arrival table of one stop, handling token freshness,
//! cookie rotation, rate limiting, HTML error pages and retries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{
    ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL, CONTENT_TYPE, COOKIE, HeaderMap, HeaderValue, ORIGIN,
    PRAGMA, REFERER, USER_AGENT,
};
use reqwest::{Client, StatusCode};
use tracing::{debug, info, instrument, warn};

use crate::acquirer::{PUBLIC_PAGE_PATH, TokenAcquirer};
use crate::backoff::pause;
use crate::classify::{Classification, HtmlDiagnostics, classify};
use crate::config::SofiaTransitConfig;
use crate::error::{FailureKind, TransitError};
use crate::models::RawProviderPayload;
use crate::tokens::{TokenStore, mask};

/// Data endpoint returning the arrival table of a stop
pub const VIRTUAL_TABLE_PATH: &str = "/bg/trip/getVirtualTable";

const JSON_ACCEPT: &str = "application/json, text/javascript, */*; q=0.01";

/// Trait for per-stop arrival sources
#[async_trait]
pub trait StopFetcher: Send + Sync {
    /// Fetch the raw arrival table of a stop
    async fn fetch(&self, stop_id: &str) -> Result<RawProviderPayload, TransitError>;

    /// Forget any session state so the next fetch starts from scratch
    fn reset_session(&self) {}
}

/// Request body encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyEncoding {
    Form,
    Json,
}

/// Raw pieces of one data-endpoint response
struct Exchange {
    status: StatusCode,
    headers: HeaderMap,
    body: String,
}

/// HTTP client for sofiatraffic.bg
#[derive(Debug)]
pub struct SofiaTrafficClient {
    http: Client,
    config: SofiaTransitConfig,
    tokens: Arc<TokenStore>,
    acquirer: TokenAcquirer,
}

impl SofiaTrafficClient {
    /// Create a new client around a shared token store
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be initialized.
    pub fn new(config: &SofiaTransitConfig, tokens: Arc<TokenStore>) -> Result<Self, TransitError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent)
                .map_err(|e| TransitError::Configuration(format!("user_agent: {e}")))?,
        );
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_str(&config.accept_language)
                .map_err(|e| TransitError::Configuration(format!("accept_language: {e}")))?,
        );

        let http = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| TransitError::Configuration(e.to_string()))?;

        let base_url = config.base_url.trim_end_matches('/').to_string();
        let acquirer = TokenAcquirer::new(http.clone(), base_url.clone(), Arc::clone(&tokens));

        Ok(Self {
            http,
            config: SofiaTransitConfig {
                base_url,
                ..config.clone()
            },
            tokens,
            acquirer,
        })
    }

    /// Token store shared with the acquirer
    #[must_use]
    pub const fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    /// Send one POST for `stop_id` with the current tokens
    async fn exchange(
        &self,
        stop_id: &str,
        encoding: BodyEncoding,
    ) -> Result<Exchange, reqwest::Error> {
        let tokens = self.tokens.snapshot();

        let request = self
            .http
            .post(format!("{}{VIRTUAL_TABLE_PATH}", self.config.base_url))
            .header(ACCEPT, JSON_ACCEPT)
            .header("X-Requested-With", "XMLHttpRequest")
            .header(ORIGIN, &self.config.base_url)
            .header(REFERER, format!("{}{PUBLIC_PAGE_PATH}", self.config.base_url))
            .header(PRAGMA, "no-cache")
            .header(CACHE_CONTROL, "no-cache")
            .header("X-XSRF-TOKEN", tokens.xsrf_token.as_deref().unwrap_or_default())
            .header("X-CSRF-TOKEN", tokens.csrf_header())
            .header(COOKIE, tokens.cookie_header());

        let request = match encoding {
            BodyEncoding::Form => request.form(&[("stop", stop_id)]),
            BodyEncoding::Json => request.json(&serde_json::json!({ "stop": stop_id })),
        };

        let response = request.send().await?;
        // Rotated cookies count even when the body never arrives
        let rotated = self.tokens.absorb_set_cookies(response.headers());
        if rotated > 0 {
            debug!(stop_id, rotated, "Absorbed rotated cookies");
        }

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;

        Ok(Exchange {
            status,
            headers,
            body,
        })
    }

    /// Log an HTML (or otherwise unexpected) body
    fn log_unexpected_shape(
        stop_id: &str,
        attempt: u32,
        max_attempts: u32,
        content_type: &str,
        parse_error: Option<&str>,
        diagnostics: &HtmlDiagnostics,
    ) {
        let content_type = if content_type.is_empty() {
            "<none>"
        } else {
            content_type
        };
        warn!(
            stop_id,
            attempt,
            max_attempts,
            content_type,
            parse_error,
            title = ?diagnostics.title,
            html_text_len = diagnostics.text_length,
            truncated = diagnostics.truncated,
            indicators = ?diagnostics.indicators,
            "Unexpected response shape"
        );

        if !diagnostics.text_excerpt.is_empty() {
            if attempt == max_attempts {
                warn!(stop_id, excerpt = %diagnostics.text_excerpt, "HTML excerpt");
            } else {
                debug!(stop_id, excerpt = %diagnostics.text_excerpt, "HTML excerpt");
            }
        }

        if diagnostics.csrf_meta.is_some() {
            debug!(
                csrf_meta = %mask(diagnostics.csrf_meta.as_deref()),
                "HTML meta csrf-token present"
            );
        }
    }
}

#[async_trait]
impl StopFetcher for SofiaTrafficClient {
    #[instrument(skip(self))]
    async fn fetch(&self, stop_id: &str) -> Result<RawProviderPayload, TransitError> {
        if self
            .tokens
            .is_stale(Utc::now(), self.config.token_lifespan_secs)
        {
            debug!("Tokens missing or stale, fetching fresh tokens");
            self.acquirer.acquire().await?;
        }

        let max_attempts = self.config.max_attempts;
        let backoff = &self.config.backoff;
        let mut encoding = BodyEncoding::Form;
        let mut last_failure = FailureKind::Network;

        for attempt in 0..max_attempts {
            let number = attempt + 1;

            let failure = match self.exchange(stop_id, encoding).await {
                Err(e) => {
                    warn!(
                        stop_id,
                        attempt = number,
                        max_attempts,
                        timeout = e.is_timeout(),
                        error = %e,
                        "Network error"
                    );
                    FailureKind::Network
                },
                Ok(exchange) => {
                    debug!(
                        status = exchange.status.as_u16(),
                        content_type = ?exchange.headers.get(CONTENT_TYPE),
                        stop_id,
                        attempt = number,
                        max_attempts,
                        ?encoding,
                        "POST getVirtualTable"
                    );

                    match classify(exchange.status, &exchange.headers, &exchange.body) {
                        Classification::Success(value) => {
                            if let Some(payload) = RawProviderPayload::from_json(&value) {
                                debug!(routes = payload.len(), attempt = number, "Fetched stop");
                                return Ok(payload);
                            }
                            warn!(
                                stop_id,
                                attempt = number,
                                "JSON body is neither an object nor an array"
                            );
                            FailureKind::MalformedResponse
                        },
                        Classification::AuthFailure { status } => {
                            info!(status, stop_id, attempt = number, "Auth failure, refreshing tokens");
                            self.tokens.reset();
                            if let Err(e) = self.acquirer.acquire().await {
                                warn!(
                                    stop_id,
                                    attempt = number,
                                    error = %e,
                                    "Token refresh after auth failure failed"
                                );
                            }
                            FailureKind::Auth
                        },
                        Classification::RateLimited { retry_after_secs } => {
                            warn!(
                                stop_id,
                                attempt = number,
                                retry_after = ?retry_after_secs,
                                "Rate limited (429)"
                            );
                            pause(backoff.rate_limit_delay(retry_after_secs)).await;
                            FailureKind::RateLimited
                        },
                        Classification::ServerError {
                            status,
                            diagnostics,
                        } => {
                            warn!(
                                status,
                                stop_id,
                                attempt = number,
                                title = ?diagnostics.title,
                                "Server error"
                            );
                            FailureKind::ServerError
                        },
                        Classification::UnexpectedShape {
                            content_type,
                            parse_error,
                            diagnostics,
                        } => {
                            Self::log_unexpected_shape(
                                stop_id,
                                number,
                                max_attempts,
                                &content_type,
                                parse_error.as_deref(),
                                &diagnostics,
                            );
                            if diagnostics.indicators.too_many_requests {
                                pause(backoff.html_rate_limit_delay()).await;
                            }
                            if encoding == BodyEncoding::Form {
                                debug!(stop_id, "Switching request body to JSON");
                                encoding = BodyEncoding::Json;
                            }
                            FailureKind::MalformedResponse
                        },
                    }
                },
            };

            last_failure = failure;

            if number < max_attempts {
                pause(backoff.delay_for_attempt(attempt)).await;
            }
        }

        Err(TransitError::ExhaustedRetries {
            stop_id: stop_id.to_string(),
            attempts: max_attempts,
            last_failure,
        })
    }

    fn reset_session(&self) {
        self.tokens.reset();
    }
}
