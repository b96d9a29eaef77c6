//! Response classification and HTML error-page diagnostics
//!
//! The data endpoint answers with JSON when everything is fine. When the
//! session is wrong, the site is rate limiting, or a CDN challenge is in the
//! way, it answers with an HTML page instead, sometimes with a 200 status.
//! [`classify`] turns a raw response into a [`Classification`] that the fetch
//! loop can act on, and [`HtmlDiagnostics`] summarizes the page for logs.

use std::sync::LazyLock;

use regex::Regex;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, HeaderMap, RETRY_AFTER};

/// Maximum number of characters kept from the visible page text
pub const EXCERPT_MAX_CHARS: usize = 8192;

static TITLE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"(?is)<title[^>]*>(.*?)</title>"));
static CSRF_META_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r#"(?i)<meta[^>]*name=["']csrf-token["'][^>]*content=["']([^"']+)["']"#)
});
static SCRIPT_STYLE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?is)<script[^>]*>.*?</script>|<style[^>]*>.*?</style>")
});
static TAG_REGEX: LazyLock<Regex> = LazyLock::new(|| pattern(r"<[^>]+>"));
static WHITESPACE_REGEX: LazyLock<Regex> = LazyLock::new(|| pattern(r"\s+"));

static CAPTCHA_REGEX: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"(?i)captcha|recaptcha"));
static FORBIDDEN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"(?i)403 Forbidden"));
static TOO_MANY_REQUESTS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"(?i)429|Too Many Requests"));
static NOT_FOUND_REGEX: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"(?i)404|Not Found"));
static CDN_CHALLENGE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"(?i)cloudflare|cf-ray|cf-"));

#[allow(clippy::unwrap_used)]
fn pattern(source: &str) -> Regex {
    Regex::new(source).unwrap()
}

/// Outcome of one data-endpoint response
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// JSON body parsed
    Success(serde_json::Value),
    /// 401 or 403
    AuthFailure {
        /// HTTP status
        status: u16,
    },
    /// 429, with the numeric `Retry-After` value when present
    RateLimited {
        /// Seconds requested by the server
        retry_after_secs: Option<u64>,
    },
    /// 5xx
    ServerError {
        /// HTTP status
        status: u16,
        /// Summary of the body, for logging only
        diagnostics: HtmlDiagnostics,
    },
    /// Not JSON, or JSON that did not parse
    UnexpectedShape {
        /// Content-Type header as received
        content_type: String,
        /// JSON parse error when the body claimed to be JSON
        parse_error: Option<String>,
        /// Summary of the body
        diagnostics: HtmlDiagnostics,
    },
}

/// Markers looked for in an error page
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageIndicators {
    /// Page mentions a captcha
    pub has_captcha: bool,
    /// "403 Forbidden"
    pub forbidden: bool,
    /// "429" or "Too Many Requests"
    pub too_many_requests: bool,
    /// "404" or "Not Found"
    pub not_found: bool,
    /// Cloudflare challenge markers
    pub cdn_challenge: bool,
}

/// Summary of an unexpected (usually HTML) body
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HtmlDiagnostics {
    /// Decoded `<title>` text
    pub title: Option<String>,
    /// Visible text, capped at [`EXCERPT_MAX_CHARS`]
    pub text_excerpt: String,
    /// Length of the full visible text in characters
    pub text_length: usize,
    /// Whether the excerpt was cut
    pub truncated: bool,
    /// Marker flags
    pub indicators: PageIndicators,
    /// `<meta name="csrf-token">` content, if any
    pub csrf_meta: Option<String>,
}

impl HtmlDiagnostics {
    /// Extract diagnostics from a page body
    #[must_use]
    pub fn from_html(text: &str) -> Self {
        let title = TITLE_REGEX
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| decode_entities(m.as_str().trim()));

        let without_scripts = SCRIPT_STYLE_REGEX.replace_all(text, " ");
        let without_tags = TAG_REGEX.replace_all(&without_scripts, " ");
        let collapsed = WHITESPACE_REGEX.replace_all(&without_tags, " ");
        let visible = decode_entities(collapsed.trim());

        let text_length = visible.chars().count();
        let text_excerpt: String = visible.chars().take(EXCERPT_MAX_CHARS).collect();

        Self {
            title,
            text_excerpt,
            text_length,
            truncated: text_length > EXCERPT_MAX_CHARS,
            indicators: PageIndicators {
                has_captcha: CAPTCHA_REGEX.is_match(text),
                forbidden: FORBIDDEN_REGEX.is_match(text),
                too_many_requests: TOO_MANY_REQUESTS_REGEX.is_match(text),
                not_found: NOT_FOUND_REGEX.is_match(text),
                cdn_challenge: CDN_CHALLENGE_REGEX.is_match(text),
            },
            csrf_meta: extract_csrf_meta(text),
        }
    }
}

/// Find `<meta name="csrf-token" content="...">` in a page
#[must_use]
pub fn extract_csrf_meta(html: &str) -> Option<String> {
    CSRF_META_REGEX
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Classify a data-endpoint response
#[must_use]
pub fn classify(status: StatusCode, headers: &HeaderMap, body: &str) -> Classification {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Classification::AuthFailure {
            status: status.as_u16(),
        };
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Classification::RateLimited {
            retry_after_secs: headers
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok()),
        };
    }

    if status.is_server_error() {
        return Classification::ServerError {
            status: status.as_u16(),
            diagnostics: HtmlDiagnostics::from_html(body),
        };
    }

    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let parse_error = if content_type.to_ascii_lowercase().contains("application/json") {
        match serde_json::from_str(body) {
            Ok(value) => return Classification::Success(value),
            Err(e) => Some(e.to_string()),
        }
    } else {
        None
    };

    Classification::UnexpectedShape {
        content_type,
        parse_error,
        diagnostics: HtmlDiagnostics::from_html(body),
    }
}

fn decode_entities(text: &str) -> String {
    html_escape::decode_html_entities(text).into_owned()
}
