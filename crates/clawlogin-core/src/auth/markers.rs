//! Classification of the page the browser is currently showing.

use url::Url;

const PROVIDER_HOST: &str = "github.com";
const DEVICE_MARKERS: [&str; 2] = ["verified-device", "device-verification"];
const TWO_FACTOR_PATH: &str = "/sessions/two-factor";
const MOBILE_PATH: &str = "/sessions/two-factor/mobile";
const WEBAUTHN_PATH: &str = "/sessions/two-factor/webauthn";
const AUTHORIZE_PATH: &str = "/login/oauth/authorize";

pub const REGION_UNAVAILABLE_MARKER: &str = "REGION_NOT_AVAILABLE";
pub const FLASH_ERROR_SELECTOR: &str = ".flash-error";

/// True when the URL, page markup, or a visible error element carries the
/// region-unavailable marker.
pub const REGION_UNAVAILABLE_SCRIPT: &str = r#"(() => {
    const marker = 'REGION_NOT_AVAILABLE';
    if (window.location.href.includes(marker)) return true;
    if (document.body && document.body.innerHTML.includes(marker)) return true;
    for (const sel of ['.flash-error', '.error-message', '[class*="error"]', '[role="alert"]']) {
        const el = document.querySelector(sel);
        if (el && el.offsetParent !== null && (el.textContent || '').includes(marker)) return true;
    }
    return false;
})()"#;

/// Which stage of the sign-in protocol a URL belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// Console page outside any sign-in path.
    Destination,
    /// Console sign-in page.
    DestinationSignIn,
    /// Identity-provider username/password form.
    CredentialForm,
    DeviceVerification,
    TwoFactorMobile,
    TwoFactorWebAuthn,
    TwoFactorCode,
    Authorize,
    Other,
}

impl PageKind {
    /// Classify by host first, so query strings that mention another host
    /// (such as `redirect_uri`) never change the answer.
    pub fn classify(raw: &str, destination_domain: &str) -> Self {
        let Ok(url) = Url::parse(raw) else {
            return PageKind::Other;
        };
        let Some(host) = url.host_str() else {
            return PageKind::Other;
        };
        let path = url.path();

        if host_within(host, PROVIDER_HOST) {
            if path.starts_with(AUTHORIZE_PATH) {
                PageKind::Authorize
            } else if DEVICE_MARKERS.iter().any(|marker| path.contains(marker)) {
                PageKind::DeviceVerification
            } else if path.starts_with(MOBILE_PATH) {
                PageKind::TwoFactorMobile
            } else if path.starts_with(WEBAUTHN_PATH) {
                PageKind::TwoFactorWebAuthn
            } else if path.starts_with(TWO_FACTOR_PATH) {
                PageKind::TwoFactorCode
            } else if matches!(path.trim_end_matches('/'), "/login" | "/session") {
                PageKind::CredentialForm
            } else {
                PageKind::Other
            }
        } else if host_within(host, destination_domain) {
            if raw.to_ascii_lowercase().contains("signin") {
                PageKind::DestinationSignIn
            } else {
                PageKind::Destination
            }
        } else {
            PageKind::Other
        }
    }

    pub fn is_two_factor(self) -> bool {
        matches!(
            self,
            PageKind::TwoFactorMobile | PageKind::TwoFactorWebAuthn | PageKind::TwoFactorCode
        )
    }
}

/// `host` is `domain` itself or one of its subdomains.
pub(crate) fn host_within(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}
