use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::core::error::TransportError;

/// Tokens that legitimately change between two requests for the same page:
/// timestamps, CSRF nonces, random ids. They are stripped before any textual
/// comparison so that page rotation does not masquerade as an oracle signal.
static VOLATILE_TOKENS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // ISO-ish dates and clock times
        r"\d{4}-\d{2}-\d{2}[T ]?\d{0,2}:?\d{0,2}:?\d{0,2}",
        r"\b\d{1,2}:\d{2}(:\d{2})?\b",
        // UUIDs and long hex identifiers
        r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b",
        r"\b[0-9a-fA-F]{16,}\b",
        // hidden CSRF / viewstate inputs
        r#"(?i)<input[^>]*(?:csrf|token|nonce|viewstate)[^>]*>"#,
        // epoch-sized numbers
        r"\b\d{10,}\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("volatile token pattern"))
    .collect()
});

/// Strip volatile tokens from a body prior to line-set or ratio comparison.
pub fn strip_volatile(body: &str) -> String {
    let mut filtered = body.to_string();
    for re in VOLATILE_TOKENS.iter() {
        filtered = re.replace_all(&filtered, "").into_owned();
    }
    filtered
}

/// One observation from the transport. Immutable once built.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub filtered_body: String,
    pub content_length: usize,
    /// Monotonic seconds between request write and response read.
    pub response_time: f64,
    pub redirected: bool,
    pub error_kind: Option<TransportError>,
}

impl Response {
    pub fn new(
        status: u16,
        reason: impl Into<String>,
        headers: Vec<(String, String)>,
        body: impl Into<String>,
        response_time: f64,
        redirected: bool,
    ) -> Self {
        let body = body.into();
        Self {
            status,
            reason: reason.into(),
            filtered_body: strip_volatile(&body),
            content_length: body.len(),
            body,
            headers,
            response_time,
            redirected,
            error_kind: None,
        }
    }

    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Line set of the filtered body, the unit of the stability comparison.
    pub fn filtered_lines(&self) -> HashSet<&str> {
        self.filtered_body
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect()
    }
}

/// The persistable subset of a [`Response`], stored alongside a confirmed
/// injection so later runs can replay the oracle without re-probing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub status: u16,
    pub reason: String,
    pub body: String,
    pub content_length: usize,
    pub response_time: f64,
    pub redirected: bool,
}

impl From<&Response> for ResponseEnvelope {
    fn from(r: &Response) -> Self {
        Self {
            status: r.status,
            reason: r.reason.clone(),
            body: r.body.clone(),
            content_length: r.content_length,
            response_time: r.response_time,
            redirected: r.redirected,
        }
    }
}

impl From<ResponseEnvelope> for Response {
    fn from(e: ResponseEnvelope) -> Self {
        let mut r = Response::new(
            e.status,
            e.reason,
            Vec::new(),
            e.body,
            e.response_time,
            e.redirected,
        );
        r.content_length = e.content_length;
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volatile_tokens_are_stripped() {
        let body = "<p>Hello</p>\n<span>2024-03-01 10:22:31</span>\n\
                    <input type=\"hidden\" name=\"csrf_token\" value=\"abc\">\n\
                    <i>550e8400-e29b-41d4-a716-446655440000</i>";
        let filtered = strip_volatile(body);
        assert!(filtered.contains("<p>Hello</p>"));
        assert!(!filtered.contains("2024-03-01"));
        assert!(!filtered.contains("csrf_token"));
        assert!(!filtered.contains("550e8400"));
    }

    #[test]
    fn rotating_nonce_yields_equal_line_sets() {
        let a = Response::new(200, "OK", vec![], "static line\ntoken 7f3a9b2c4d5e6f1a", 0.1, false);
        let b = Response::new(200, "OK", vec![], "static line\ntoken 1a2b3c4d5e6f7f3a", 0.1, false);
        assert_eq!(a.filtered_lines(), b.filtered_lines());
    }

    #[test]
    fn content_length_tracks_raw_body() {
        let r = Response::new(200, "OK", vec![], "abcd", 0.0, false);
        assert_eq!(r.content_length, 4);
    }
}
