//! Session cookie jars for the identity provider and the destination console.

mod blob;
mod persist;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub(crate) use blob::HOST_PREFIX;
pub use blob::{legacy_session_cookies, normalize_blob, normalize_entries};
pub use persist::{persist_jar, PersistOutcome};

/// Errors produced while reading or writing cookie blobs.
#[derive(Debug, Error)]
pub enum CookieError {
    #[error("cookie blob is not a valid JSON list: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SameSite {
    None,
    #[default]
    Lax,
    Strict,
}

impl SameSite {
    /// Case-insensitive parse; anything unrecognised falls back to `Lax`.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "none" | "no_restriction" => SameSite::None,
            "strict" => SameSite::Strict,
            _ => SameSite::Lax,
        }
    }
}

/// One canonical cookie record, serialized in the browser's camelCase shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    /// Absolute expiry in seconds since the epoch; `None` for session cookies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<f64>,
    #[serde(default)]
    pub http_only: bool,
    pub secure: bool,
    #[serde(default)]
    pub same_site: SameSite,
}

impl Cookie {
    pub fn session(name: impl Into<String>, value: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: "/".to_owned(),
            expires: None,
            http_only: false,
            secure: true,
            same_site: SameSite::Lax,
        }
    }

    fn is_usable(&self) -> bool {
        !self.name.trim().is_empty() && !self.value.is_empty()
    }
}

/// Which domain family a jar belongs to. The two families never mix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieFamily {
    IdentityProvider,
    Destination,
}

impl CookieFamily {
    /// Substring a cookie's domain must contain to belong to this family.
    pub fn domain_filter(self) -> &'static str {
        match self {
            CookieFamily::IdentityProvider => "github",
            CookieFamily::Destination => "claw.cloud",
        }
    }

    /// Name of the secret the serialized jar is stored under.
    pub fn secret_name(self) -> &'static str {
        match self {
            CookieFamily::IdentityProvider => "GH_COOKIES",
            CookieFamily::Destination => "CLAW_COOKIES",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            CookieFamily::IdentityProvider => "GitHub",
            CookieFamily::Destination => "ClawCloud",
        }
    }
}

/// Ordered cookies of a single family.
#[derive(Debug, Clone, PartialEq)]
pub struct CookieJar {
    family: CookieFamily,
    cookies: Vec<Cookie>,
}

impl CookieJar {
    pub fn empty(family: CookieFamily) -> Self {
        Self {
            family,
            cookies: Vec::new(),
        }
    }

    /// Build a jar from raw browser cookies, keeping only this family's
    /// domains and canonicalising every entry.
    pub fn extract(family: CookieFamily, raw: Vec<Cookie>) -> Self {
        let cookies = raw
            .into_iter()
            .filter(|cookie| cookie.domain.contains(family.domain_filter()))
            .filter_map(canonicalize)
            .collect();
        Self { family, cookies }
    }

    pub(crate) fn from_cookies(family: CookieFamily, cookies: Vec<Cookie>) -> Self {
        Self { family, cookies }
    }

    pub fn family(&self) -> CookieFamily {
        self.family
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// JSON list form, the same shape accepted by [`normalize_blob`].
    pub fn to_json(&self) -> Result<String, CookieError> {
        Ok(serde_json::to_string(&self.cookies)?)
    }
}

/// Apply the persistence policy: secure always, positive expiry only.
fn canonicalize(mut cookie: Cookie) -> Option<Cookie> {
    if !cookie.is_usable() {
        return None;
    }
    cookie.secure = true;
    cookie.expires = cookie.expires.filter(|ts| ts.is_finite() && *ts > 0.0);
    if cookie.path.is_empty() {
        cookie.path = "/".to_owned();
    }
    Some(cookie)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn browser_cookie(name: &str, value: &str, domain: &str, expires: f64) -> Cookie {
        Cookie {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: "/".into(),
            expires: Some(expires),
            http_only: true,
            secure: false,
            same_site: SameSite::Strict,
        }
    }

    #[test]
    fn extract_filters_by_family_and_drops_session_expiry() {
        let raw = vec![
            browser_cookie("user_session", "abc", ".github.com", -1.0),
            browser_cookie("_gh_sess", "def", "github.com", 1_900_000_000.0),
            browser_cookie("sid", "xyz", ".run.claw.cloud", 1_900_000_000.0),
            browser_cookie("", "orphan", "github.com", 0.0),
        ];

        let jar = CookieJar::extract(CookieFamily::IdentityProvider, raw);

        assert_eq!(jar.len(), 2);
        assert_eq!(jar.cookies()[0].name, "user_session");
        assert_eq!(jar.cookies()[0].expires, None);
        assert!(jar.cookies()[0].secure);
        assert!(jar.cookies()[0].http_only);
        assert_eq!(jar.cookies()[1].expires, Some(1_900_000_000.0));
    }

    #[test]
    fn serialized_jar_omits_missing_expiry() {
        let jar = CookieJar::from_cookies(
            CookieFamily::Destination,
            vec![Cookie::session("sid", "xyz", ".run.claw.cloud")],
        );
        let json = jar.to_json().unwrap();
        assert!(!json.contains("expires"));
        assert!(json.contains("\"sameSite\":\"Lax\""));
        assert!(json.contains("\"httpOnly\":false"));
    }

    #[test]
    fn same_site_parses_leniently() {
        assert_eq!(SameSite::parse_lenient("strict"), SameSite::Strict);
        assert_eq!(SameSite::parse_lenient("None"), SameSite::None);
        assert_eq!(SameSite::parse_lenient("unspecified"), SameSite::Lax);
    }
}
