//! A URL-scoped cookie jar for [`crate::session::Session`], implementing
//! the RFC 6265 domain-match semantics §4.D calls for: a bare
//! `Domain=example.com` host-matches or subdomain-matches depending on
//! `host_only`, a leading dot on a stored cookie is tolerated and
//! stripped, and invalid cookie strings are silently ignored rather than
//! surfaced as errors.

use cookie::Cookie as RawCookie;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single stored cookie, independent of the `cookie` crate's borrowed
/// `Cookie<'_>` so it can be owned, serialized, and diffed freely.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    /// `true` when the cookie has no `Domain` attribute at all (an
    /// exact-host cookie per RFC 6265 §5.3); `false` when it carries a
    /// `Domain` attribute (matches the host and its subdomains).
    pub host_only: bool,
    pub path: String,
}

/// A URL-scoped cookie jar. One jar per [`crate::session::Session`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CookieJar {
    /// Keyed by `(domain, name)` so same-name cookies on different
    /// domains coexist; RFC 6265 doesn't require path-granularity here
    /// and the spec doesn't ask for it.
    cookies: HashMap<(String, String), StoredCookie>,
}

fn host_of(url: &str) -> Option<String> {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
    let host = authority.split('@').last().unwrap_or(authority);
    let host = host.split(':').next().unwrap_or(host);
    if host.is_empty() {
        None
    } else {
        Some(host.to_lowercase())
    }
}

fn domain_matches(cookie_domain: &str, host_only: bool, request_host: &str) -> bool {
    if host_only {
        cookie_domain.eq_ignore_ascii_case(request_host)
    } else {
        let cd = cookie_domain.to_lowercase();
        let rh = request_host.to_lowercase();
        rh == cd || rh.ends_with(&format!(".{}", cd))
    }
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and store a single `Set-Cookie`-style string scoped to
    /// `url`. Invalid strings are silently ignored per §4.D.
    pub fn set_cookie_str(&mut self, raw: &str, url: &str) {
        let Some(host) = host_of(url) else { return };
        let Ok(parsed) = RawCookie::parse(raw.to_string()) else {
            return;
        };

        let (domain, host_only) = match parsed.domain() {
            // A leading dot is tolerated and stripped; presence of any
            // Domain attribute means subdomain-matching (host_only = false).
            Some(d) => (d.trim_start_matches('.').to_lowercase(), false),
            None => (host.clone(), true),
        };

        let name = parsed.name().to_string();
        let value = parsed.value().to_string();
        let path = parsed.path().unwrap_or("/").to_string();

        self.cookies.insert(
            (domain.clone(), name.clone()),
            StoredCookie {
                name,
                value,
                domain,
                host_only,
                path,
            },
        );
    }

    /// Apply every `Set-Cookie` header value observed on a response.
    pub fn set_cookies_from_response(&mut self, set_cookie_headers: &[String], url: &str) {
        for raw in set_cookie_headers {
            self.set_cookie_str(raw, url);
        }
    }

    pub fn set_cookies(&mut self, cookies: &[StoredCookie]) {
        for c in cookies {
            self.cookies.insert((c.domain.clone(), c.name.clone()), c.clone());
        }
    }

    /// Cookies applicable to `url` under the domain-match rule above.
    pub fn get_cookies(&self, url: &str) -> Vec<StoredCookie> {
        let Some(host) = host_of(url) else {
            return Vec::new();
        };
        self.cookies
            .values()
            .filter(|c| domain_matches(&c.domain, c.host_only, &host))
            .cloned()
            .collect()
    }

    /// `name=value; name2=value2` form suitable for a `Cookie` header.
    pub fn get_cookie_string(&self, url: &str) -> String {
        self.get_cookies(url)
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }
}

/// `diffCookies(url, prior, next) = next \ prior` (by cookie name),
/// restricted to cookies applicable to `url`. Used by the crawler's
/// redirect-handling path to compute what changed across a hop.
pub fn diff_cookies(url: &str, prior: &CookieJar, next: &CookieJar) -> Vec<StoredCookie> {
    let prior_names: std::collections::HashSet<String> =
        prior.get_cookies(url).into_iter().map(|c| c.name).collect();
    next.get_cookies(url)
        .into_iter()
        .filter(|c| !prior_names.contains(&c.name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_and_retrieves_simple_cookie() {
        let mut jar = CookieJar::new();
        jar.set_cookie_str("foo=bar", "https://example.com/path");
        assert_eq!(jar.get_cookie_string("https://example.com/path"), "foo=bar");
    }

    #[test]
    fn host_only_cookie_does_not_match_subdomain() {
        let mut jar = CookieJar::new();
        jar.set_cookie_str("foo=bar", "https://example.com");
        assert!(jar.get_cookies("https://sub.example.com").is_empty());
    }

    #[test]
    fn domain_cookie_matches_subdomain() {
        let mut jar = CookieJar::new();
        jar.set_cookie_str("foo=bar; Domain=example.com", "https://example.com");
        let cookies = jar.get_cookies("https://sub.example.com");
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].name, "foo");
    }

    #[test]
    fn leading_dot_in_domain_is_stripped_and_tolerated() {
        let mut jar = CookieJar::new();
        jar.set_cookie_str("foo=bar; Domain=.example.com", "https://example.com");
        let cookies = jar.get_cookies("https://www.example.com");
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].domain, "example.com");
    }

    #[test]
    fn invalid_cookie_string_is_silently_ignored() {
        let mut jar = CookieJar::new();
        jar.set_cookie_str("", "https://example.com");
        jar.set_cookie_str("\u{0000}garbage", "https://example.com");
        assert!(jar.is_empty());
    }

    #[test]
    fn diff_cookies_returns_only_new_names() {
        let mut prior = CookieJar::new();
        prior.set_cookie_str("a=1", "https://example.com");

        let mut next = prior.clone();
        next.set_cookie_str("b=2", "https://example.com");

        let diff = diff_cookies("https://example.com", &prior, &next);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].name, "b");
    }

    #[test]
    fn diff_cookies_empty_when_nothing_new() {
        let mut prior = CookieJar::new();
        prior.set_cookie_str("a=1", "https://example.com");
        let next = prior.clone();

        let diff = diff_cookies("https://example.com", &prior, &next);
        assert!(diff.is_empty());
    }

    #[test]
    fn set_cookies_from_response_applies_each_header() {
        let mut jar = CookieJar::new();
        jar.set_cookies_from_response(
            &["a=1".to_string(), "b=2; Domain=example.com".to_string()],
            "https://example.com",
        );
        assert_eq!(jar.get_cookies("https://example.com").len(), 2);
    }

    #[test]
    fn later_set_cookie_overwrites_same_name_same_domain() {
        let mut jar = CookieJar::new();
        jar.set_cookie_str("foo=bar", "https://example.com");
        jar.set_cookie_str("foo=baz", "https://example.com");
        assert_eq!(jar.get_cookie_string("https://example.com"), "foo=baz");
    }
}
