use serde_json::Value;

use super::{canonicalize, Cookie, CookieError, CookieFamily, CookieJar, SameSite};

pub(crate) const HOST_PREFIX: &str = "__Host-";

/// Parse a persisted blob, either a JSON list of cookie records or a
/// `name=value; name2=value2` string, into a canonical jar.
///
/// `default_domain` is applied to string-form entries and to JSON entries
/// that carry no domain of their own.
pub fn normalize_blob(
    blob: &str,
    family: CookieFamily,
    default_domain: &str,
) -> Result<CookieJar, CookieError> {
    let blob = blob.trim();
    if blob.starts_with('[') {
        let entries: Vec<Value> = serde_json::from_str(blob)?;
        return Ok(normalize_entries(&entries, family, default_domain));
    }

    let cookies = blob
        .split(';')
        .filter_map(|item| item.trim().split_once('='))
        .filter_map(|(name, value)| pair_cookie(name.trim(), value.trim(), default_domain))
        .collect();
    Ok(CookieJar::from_cookies(family, cookies))
}

/// Normalize structured entries. Entries without a usable name or value are dropped.
pub fn normalize_entries(entries: &[Value], family: CookieFamily, default_domain: &str) -> CookieJar {
    let cookies = entries
        .iter()
        .filter_map(|entry| entry_cookie(entry, default_domain))
        .collect();
    CookieJar::from_cookies(family, cookies)
}

/// Cookies restoring a bare `user_session` value from older configurations.
pub fn legacy_session_cookies(session: &str) -> CookieJar {
    let session = session.trim();
    if session.is_empty() {
        return CookieJar::empty(CookieFamily::IdentityProvider);
    }
    CookieJar::from_cookies(
        CookieFamily::IdentityProvider,
        vec![
            Cookie::session("user_session", session, "github.com"),
            Cookie::session("logged_in", "yes", "github.com"),
        ],
    )
}

fn pair_cookie(name: &str, value: &str, default_domain: &str) -> Option<Cookie> {
    let mut cookie = Cookie::session(name, value, default_domain);
    if name.starts_with(HOST_PREFIX) {
        cookie.domain = default_domain.trim_start_matches('.').to_owned();
        cookie.path = "/".to_owned();
    }
    canonicalize(cookie)
}

fn entry_cookie(entry: &Value, default_domain: &str) -> Option<Cookie> {
    let object = entry.as_object()?;
    let text = |key: &str| object.get(key).and_then(Value::as_str).map(str::to_owned);

    let cookie = Cookie {
        name: text("name")?,
        value: text("value")?,
        domain: text("domain")
            .filter(|domain| !domain.is_empty())
            .unwrap_or_else(|| default_domain.to_owned()),
        path: text("path").unwrap_or_else(|| "/".to_owned()),
        expires: object.get("expires").and_then(Value::as_f64),
        http_only: object
            .get("httpOnly")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        secure: true,
        same_site: text("sameSite")
            .map(|raw| SameSite::parse_lenient(&raw))
            .unwrap_or_default(),
    };
    canonicalize(cookie)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn non_positive_or_non_numeric_expiry_becomes_session_cookie() {
        let entries = vec![
            json!({"name": "a", "value": "1", "expires": -1}),
            json!({"name": "b", "value": "2", "expires": 0}),
            json!({"name": "c", "value": "3", "expires": "tomorrow"}),
            json!({"name": "d", "value": "4", "expires": null}),
            json!({"name": "e", "value": "5"}),
            json!({"name": "f", "value": "6", "expires": 1_900_000_000.5}),
        ];

        let jar = normalize_entries(&entries, CookieFamily::Destination, ".run.claw.cloud");

        let expiries: Vec<_> = jar.cookies().iter().map(|c| c.expires).collect();
        assert_eq!(
            expiries,
            vec![None, None, None, None, None, Some(1_900_000_000.5)]
        );
    }

    #[test]
    fn structured_entries_get_explicit_defaults() {
        let blob = r#"[
            {"name": "sid", "value": "xyz", "secure": false, "sameSite": "Strict", "httpOnly": true},
            {"name": "plain", "value": "v", "domain": "console.claw.cloud", "path": "/apps"},
            {"name": "", "value": "dropped"},
            {"value": "no-name"},
            "not-an-object"
        ]"#;

        let jar = normalize_blob(blob, CookieFamily::Destination, ".run.claw.cloud").unwrap();

        assert_eq!(jar.len(), 2);
        let sid = &jar.cookies()[0];
        assert_eq!(sid.domain, ".run.claw.cloud");
        assert!(sid.secure);
        assert!(sid.http_only);
        assert_eq!(sid.same_site, SameSite::Strict);

        let plain = &jar.cookies()[1];
        assert_eq!(plain.domain, "console.claw.cloud");
        assert_eq!(plain.path, "/apps");
        assert!(!plain.http_only);
        assert_eq!(plain.same_site, SameSite::Lax);
    }

    #[test]
    fn semicolon_pairs_are_parsed_with_default_domain() {
        let jar = normalize_blob(
            "user_session=abc; __Host-user_session_same_site=def ; junk; empty=",
            CookieFamily::IdentityProvider,
            ".github.com",
        )
        .unwrap();

        assert_eq!(jar.len(), 2);
        assert_eq!(jar.cookies()[0].domain, ".github.com");
        assert_eq!(jar.cookies()[1].name, "__Host-user_session_same_site");
        assert_eq!(jar.cookies()[1].domain, "github.com");
        assert_eq!(jar.cookies()[1].value, "def");
        assert!(jar.cookies().iter().all(|c| c.expires.is_none() && c.secure));
    }

    #[test]
    fn value_containing_equals_is_preserved() {
        let jar =
            normalize_blob("token=a=b==", CookieFamily::Destination, ".run.claw.cloud").unwrap();
        assert_eq!(jar.cookies()[0].value, "a=b==");
    }

    #[test]
    fn malformed_json_blob_is_rejected() {
        let err = normalize_blob("[{\"name\": 1", CookieFamily::Destination, "x").unwrap_err();
        assert!(matches!(err, CookieError::Json(_)));
    }

    #[test]
    fn legacy_session_produces_login_pair() {
        let jar = legacy_session_cookies(" sess ");
        let names: Vec<_> = jar.cookies().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["user_session", "logged_in"]);
        assert_eq!(jar.cookies()[0].value, "sess");
        assert!(legacy_session_cookies("").is_empty());
    }
}
