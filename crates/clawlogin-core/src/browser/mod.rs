//! Browser-control capability consumed by the sign-in flow.
//!
//! The flow never drives a browser process directly; it talks to a [`Browser`]
//! obtained from a [`BrowserLauncher`] and releases it exactly once through
//! [`Browser::close`].

mod chromium;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::cookies::Cookie;

pub use chromium::{ChromiumBrowser, ChromiumLauncher};

/// Errors raised by browser-control operations.
#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("failed to launch browser: {0}")]
    Launch(String),
    #[error("browser protocol error: {0}")]
    Protocol(String),
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
    #[error("script evaluation failed: {0}")]
    Script(String),
    #[error("element interaction failed: {0}")]
    Element(String),
    #[error("browser session already closed")]
    Closed,
}

/// How long a navigation waits before handing control back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    /// Return once the DOM is parsed.
    DomContentLoaded,
    /// Return once network activity has been quiet for a short while.
    NetworkIdle,
}

/// One strategy for locating an element on the current page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Css(String),
    XPath(String),
    /// Scan every element matching `scope` for one whose text contains `text`.
    Text { scope: String, text: String },
}

impl Selector {
    pub fn css(selector: impl Into<String>) -> Self {
        Selector::Css(selector.into())
    }

    pub fn xpath(expr: impl Into<String>) -> Self {
        Selector::XPath(expr.into())
    }

    /// `<tag>` whose visible text contains `text`.
    pub fn tag_with_text(tag: &str, text: &str) -> Self {
        Selector::XPath(format!("//{tag}[contains(normalize-space(.), \"{text}\")]"))
    }

    pub fn text_scan(scope: impl Into<String>, text: impl Into<String>) -> Self {
        Selector::Text {
            scope: scope.into(),
            text: text.into(),
        }
    }

    /// Short human-readable form used in log lines.
    pub fn describe(&self) -> &str {
        match self {
            Selector::Css(css) => css,
            Selector::XPath(xpath) => xpath,
            Selector::Text { text, .. } => text,
        }
    }
}

/// Capability surface of one controlled browser page.
#[async_trait]
pub trait Browser: Send + Sync {
    type Element: Send + Sync;

    async fn navigate(&self, url: &str, wait: WaitPolicy) -> Result<(), BrowserError>;

    async fn current_url(&self) -> Result<String, BrowserError>;

    /// Evaluate a script in the page and return its JSON result.
    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, BrowserError>;

    /// First element matching `selector` that is neither `display: none` nor
    /// `visibility: hidden`.
    async fn find_first_visible(
        &self,
        selector: &Selector,
    ) -> Result<Option<Self::Element>, BrowserError>;

    async fn click(&self, element: &Self::Element) -> Result<(), BrowserError>;

    async fn type_text(&self, element: &Self::Element, text: &str) -> Result<(), BrowserError>;

    async fn press_enter(&self, element: &Self::Element) -> Result<(), BrowserError>;

    async fn inner_text(&self, element: &Self::Element) -> Result<String, BrowserError>;

    /// Block until network activity settles or `timeout` passes. Expiry is not an error.
    async fn wait_for_settle(&self, timeout: Duration) -> Result<(), BrowserError>;

    async fn screenshot(&self) -> Result<Vec<u8>, BrowserError>;

    async fn cookies(&self) -> Result<Vec<Cookie>, BrowserError>;

    async fn set_cookies(&self, cookies: &[Cookie]) -> Result<(), BrowserError>;

    async fn reload(&self) -> Result<(), BrowserError>;

    async fn close(&self) -> Result<(), BrowserError>;

    /// Convenience wrapper for predicates that evaluate to a boolean.
    async fn evaluate_bool(&self, script: &str) -> Result<bool, BrowserError> {
        Ok(self.evaluate(script).await?.as_bool().unwrap_or(false))
    }

    /// Try each strategy in order and return the first visible match.
    async fn find_any(
        &self,
        selectors: &[Selector],
    ) -> Result<Option<(Self::Element, usize)>, BrowserError> {
        for (index, selector) in selectors.iter().enumerate() {
            match self.find_first_visible(selector).await {
                Ok(Some(element)) => return Ok(Some((element, index))),
                Ok(None) => {}
                Err(err) => {
                    tracing::debug!(selector = selector.describe(), error = %err, "selector lookup failed");
                }
            }
        }
        Ok(None)
    }
}

/// Starts a browser session for one run.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    type Browser: Browser;

    async fn launch(&self) -> Result<Self::Browser, BrowserError>;
}
