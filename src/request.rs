//! The `Request` data model (§3) and the small value types that travel
//! alongside it through the queue and the dispatch loop.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Stable identifier assigned by the queue on first insertion.
pub type RequestId = String;

/// A unit of work: the URL, method, headers, payload, and user data to be
/// dispatched once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Assigned by the queue; empty until `addRequest` returns.
    pub id: RequestId,

    /// Deduplication key. Derived from a canonical form of `url` when the
    /// caller does not supply one (see [`canonicalize_url`]).
    pub unique_key: String,

    pub url: String,

    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default)]
    pub payload: Option<Vec<u8>>,

    /// Opaque, application-defined data carried alongside the request.
    #[serde(default)]
    pub user_data: HashMap<String, Value>,

    /// Application-defined routing tag consumed by `router.rs`. Added in
    /// this expansion to make `MissingRoute` (§7) expressible at all.
    #[serde(default)]
    pub label: Option<String>,

    #[serde(default)]
    pub retry_count: u32,

    #[serde(default)]
    pub error_messages: Vec<String>,

    /// Set once the request is terminally handled (success or permanent
    /// failure). `None` while pending or in progress.
    #[serde(default)]
    pub handled_at: Option<i64>,

    #[serde(default)]
    pub no_retry: bool,

    #[serde(default)]
    pub skip_navigation: bool,
}

fn default_method() -> String {
    "GET".to_string()
}

impl Request {
    /// Construct a new, unhandled request. `id` is left empty; the queue
    /// assigns it on `add_request`.
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let unique_key = canonicalize_url(&url);
        Request {
            id: String::new(),
            unique_key,
            url,
            method: default_method(),
            headers: HashMap::new(),
            payload: None,
            user_data: HashMap::new(),
            label: None,
            retry_count: 0,
            error_messages: Vec::new(),
            handled_at: None,
            no_retry: false,
            skip_navigation: false,
        }
    }

    pub fn with_unique_key(mut self, unique_key: impl Into<String>) -> Self {
        self.unique_key = unique_key.into();
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_no_retry(mut self, no_retry: bool) -> Self {
        self.no_retry = no_retry;
        self
    }

    /// Once `handled_at` is set, the request is terminal.
    pub fn is_handled(&self) -> bool {
        self.handled_at.is_some()
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.error_messages.push(message.into());
    }
}

/// Canonical form of a URL used to derive `unique_key` when the caller
/// doesn't supply one: lowercase scheme/host, strip a trailing `/`, drop
/// a fragment. Not a full RFC 3986 normalizer — just enough to dedupe the
/// obvious equivalents (`http://EXAMPLE.com/a` == `http://example.com/a`).
pub fn canonicalize_url(url: &str) -> String {
    let without_fragment = url.split('#').next().unwrap_or(url);

    let (scheme_and_authority, rest) = match without_fragment.split_once("://") {
        Some((scheme, rest)) => (format!("{}://", scheme.to_lowercase()), rest),
        None => (String::new(), without_fragment),
    };

    let (authority, path_and_query) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };

    let mut normalized = format!("{}{}", scheme_and_authority, authority.to_lowercase());
    let trimmed_path = path_and_query.strip_suffix('/').unwrap_or(path_and_query);
    normalized.push_str(trimmed_path);
    normalized
}

/// Result of `addRequest`/each item of `addRequests`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueOperationInfo {
    pub request_id: RequestId,
    pub was_already_present: bool,
    pub was_already_handled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_request_derives_unique_key_from_url() {
        let req = Request::new("https://example.com/path");
        assert_eq!(req.unique_key, "https://example.com/path");
    }

    #[test]
    fn canonicalize_lowercases_scheme_and_host() {
        assert_eq!(
            canonicalize_url("HTTPS://Example.COM/Path"),
            "https://example.com/Path"
        );
    }

    #[test]
    fn canonicalize_strips_trailing_slash() {
        assert_eq!(
            canonicalize_url("https://example.com/path/"),
            "https://example.com/path"
        );
    }

    #[test]
    fn canonicalize_strips_fragment() {
        assert_eq!(
            canonicalize_url("https://example.com/path#section"),
            "https://example.com/path"
        );
    }

    #[test]
    fn canonicalize_keeps_root_slash_when_path_empty() {
        // authority-only URL has no explicit path to strip past root
        assert_eq!(canonicalize_url("https://example.com"), "https://example.com");
    }

    #[test]
    fn with_unique_key_overrides_derived_key() {
        let req = Request::new("https://example.com/a").with_unique_key("custom-key");
        assert_eq!(req.unique_key, "custom-key");
    }

    #[test]
    fn fresh_request_is_not_handled() {
        let req = Request::new("https://example.com");
        assert!(!req.is_handled());
    }

    #[test]
    fn record_error_appends_message() {
        let mut req = Request::new("https://example.com");
        req.record_error("timeout");
        req.record_error("connection reset");
        assert_eq!(req.error_messages, vec!["timeout", "connection reset"]);
    }
}
