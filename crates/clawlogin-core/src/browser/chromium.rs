use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::network::{
    Cookie as CdpCookie, CookieParam, CookieSameSite, TimeSinceEpoch,
};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::element::Element;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::{Browser as CdpBrowser, BrowserConfig, Handler, Page};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Browser, BrowserError, BrowserLauncher, Selector, WaitPolicy};
use crate::config::BrowserSettings;
use crate::cookies::{Cookie, SameSite, HOST_PREFIX};

const IS_VISIBLE_FN: &str = "function() { \
    const style = window.getComputedStyle(this); \
    return style.display !== 'none' && style.visibility !== 'hidden'; }";

const TEXT_MATCH_ATTR: &str = "data-clawlogin-match";

/// Launches a local Chromium through the DevTools protocol.
#[derive(Debug, Clone, Default)]
pub struct ChromiumLauncher {
    settings: BrowserSettings,
}

impl ChromiumLauncher {
    pub fn new(settings: BrowserSettings) -> Self {
        Self { settings }
    }

    fn config(&self) -> Result<BrowserConfig, BrowserError> {
        let (width, height) = self.settings.window;
        let mut builder = BrowserConfig::builder()
            .window_size(width, height)
            .args(self.settings.args.iter().map(String::as_str));
        if !self.settings.headless {
            builder = builder.with_head();
        }
        if let Some(path) = &self.settings.executable {
            builder = builder.chrome_executable(path);
        }
        if let Some(dir) = &self.settings.user_data_dir {
            builder = builder.user_data_dir(dir);
        }
        builder.build().map_err(BrowserError::Launch)
    }
}

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    type Browser = ChromiumBrowser;

    async fn launch(&self) -> Result<ChromiumBrowser, BrowserError> {
        let config = self.config()?;
        let (browser, handler) = CdpBrowser::launch(config)
            .await
            .map_err(|err| BrowserError::Launch(err.to_string()))?;
        let handler_task = spawn_handler_task(handler);

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(protocol)?;
        page.set_user_agent(self.settings.user_agent.clone())
            .await
            .map_err(protocol)?;

        info!(headless = self.settings.headless, "browser launched");
        Ok(ChromiumBrowser {
            browser: Mutex::new(Some(browser)),
            page,
            handler_task: StdMutex::new(Some(handler_task)),
        })
    }
}

/// One Chromium instance driving a single page.
pub struct ChromiumBrowser {
    browser: Mutex<Option<CdpBrowser>>,
    page: Page,
    handler_task: StdMutex<Option<JoinHandle<()>>>,
}

impl ChromiumBrowser {
    async fn network_idle(&self, timeout: Duration) {
        let timeout_ms = timeout.as_millis().min(u128::from(u64::MAX)) as u64;
        let js = format!(
            r#"(async () => {{
                const timeoutMs = {timeout_ms};
                const idleMs = 1000;
                const interval = 250;
                const start = Date.now();
                let lastCount = 0;
                let stableMs = 0;
                try {{ lastCount = performance.getEntriesByType('resource').length; }} catch (_) {{ lastCount = 0; }}
                while (Date.now() - start < timeoutMs) {{
                    await new Promise(r => setTimeout(r, interval));
                    let curCount = lastCount;
                    try {{ curCount = performance.getEntriesByType('resource').length; }} catch (_) {{ curCount = lastCount; }}
                    if (document.readyState === 'complete' && curCount === lastCount) {{
                        stableMs += interval;
                        if (stableMs >= idleMs) {{
                            return {{ ok: true, waitedMs: Date.now() - start }};
                        }}
                    }} else {{
                        stableMs = 0;
                    }}
                    lastCount = curCount;
                }}
                return {{ ok: false, waitedMs: Date.now() - start }};
            }})()"#
        );

        match self.page.evaluate(js).await {
            Ok(result) => {
                let info = result
                    .into_value::<serde_json::Value>()
                    .unwrap_or_default();
                let ok = info.get("ok").and_then(|v| v.as_bool()).unwrap_or(false);
                let waited = info.get("waitedMs").and_then(|v| v.as_u64()).unwrap_or(0);
                if ok {
                    debug!(waited_ms = waited, "network idle");
                } else {
                    debug!(waited_ms = waited, "network-idle wait timed out");
                }
            }
            // Navigations tear down the execution context mid-wait.
            Err(err) => debug!(error = %err, "network-idle heuristic interrupted"),
        }
    }

    async fn is_visible(&self, element: &Element) -> bool {
        match element.call_js_fn(IS_VISIBLE_FN, false).await {
            Ok(returns) => returns
                .result
                .value
                .and_then(|value| value.as_bool())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn first_visible(&self, candidates: Vec<Element>) -> Option<Element> {
        for element in candidates {
            if self.is_visible(&element).await {
                return Some(element);
            }
        }
        None
    }

    /// Tag the first visible element in `scope` whose text contains `text`
    /// so it can be resolved as a node handle.
    async fn find_by_text(&self, scope: &str, text: &str) -> Result<Option<Element>, BrowserError> {
        let scope_json = serde_json::to_string(scope).map_err(|err| BrowserError::Script(err.to_string()))?;
        let text_json = serde_json::to_string(text).map_err(|err| BrowserError::Script(err.to_string()))?;
        let script = format!(
            r#"(() => {{
                document.querySelectorAll('[{TEXT_MATCH_ATTR}]').forEach(el => el.removeAttribute('{TEXT_MATCH_ATTR}'));
                for (const el of document.querySelectorAll({scope_json})) {{
                    const style = window.getComputedStyle(el);
                    if ((el.textContent || '').includes({text_json})
                        && style.display !== 'none' && style.visibility !== 'hidden') {{
                        el.setAttribute('{TEXT_MATCH_ATTR}', '1');
                        return true;
                    }}
                }}
                return false;
            }})()"#
        );
        if !self.evaluate_bool(&script).await? {
            return Ok(None);
        }
        let mut found = self
            .page
            .find_elements(format!("[{TEXT_MATCH_ATTR}]"))
            .await
            .map_err(|err| BrowserError::Element(err.to_string()))?;
        Ok(if found.is_empty() {
            None
        } else {
            Some(found.swap_remove(0))
        })
    }
}

#[async_trait]
impl Browser for ChromiumBrowser {
    type Element = Element;

    async fn navigate(&self, url: &str, wait: WaitPolicy) -> Result<(), BrowserError> {
        self.page
            .goto(url)
            .await
            .map_err(|err| BrowserError::Navigation {
                url: url.to_owned(),
                reason: err.to_string(),
            })?;
        if wait == WaitPolicy::NetworkIdle {
            self.network_idle(Duration::from_secs(10)).await;
        }
        Ok(())
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        Ok(self.page.url().await.map_err(protocol)?.unwrap_or_default())
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, BrowserError> {
        let result = self
            .page
            .evaluate(script)
            .await
            .map_err(|err| BrowserError::Script(err.to_string()))?;
        // `undefined` has no JSON form.
        Ok(result.into_value().unwrap_or(serde_json::Value::Null))
    }

    async fn find_first_visible(&self, selector: &Selector) -> Result<Option<Element>, BrowserError> {
        match selector {
            Selector::Css(css) => {
                let candidates = self
                    .page
                    .find_elements(css.as_str())
                    .await
                    .map_err(|err| BrowserError::Element(err.to_string()))?;
                Ok(self.first_visible(candidates).await)
            }
            Selector::XPath(xpath) => {
                let candidates = self
                    .page
                    .find_xpaths(xpath.as_str())
                    .await
                    .map_err(|err| BrowserError::Element(err.to_string()))?;
                Ok(self.first_visible(candidates).await)
            }
            Selector::Text { scope, text } => self.find_by_text(scope, text).await,
        }
    }

    async fn click(&self, element: &Element) -> Result<(), BrowserError> {
        element
            .click()
            .await
            .map_err(|err| BrowserError::Element(err.to_string()))?;
        Ok(())
    }

    async fn type_text(&self, element: &Element, text: &str) -> Result<(), BrowserError> {
        element
            .click()
            .await
            .map_err(|err| BrowserError::Element(err.to_string()))?
            .type_str(text)
            .await
            .map_err(|err| BrowserError::Element(err.to_string()))?;
        Ok(())
    }

    async fn press_enter(&self, element: &Element) -> Result<(), BrowserError> {
        element
            .press_key("Enter")
            .await
            .map_err(|err| BrowserError::Element(err.to_string()))?;
        Ok(())
    }

    async fn inner_text(&self, element: &Element) -> Result<String, BrowserError> {
        Ok(element
            .inner_text()
            .await
            .map_err(|err| BrowserError::Element(err.to_string()))?
            .unwrap_or_default())
    }

    async fn wait_for_settle(&self, timeout: Duration) -> Result<(), BrowserError> {
        self.network_idle(timeout).await;
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, BrowserError> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(false)
            .build();
        self.page.screenshot(params).await.map_err(protocol)
    }

    /// Every cookie in the browser's store, not only those of the current page.
    async fn cookies(&self) -> Result<Vec<Cookie>, BrowserError> {
        let guard = self.browser.lock().await;
        let browser = guard.as_ref().ok_or(BrowserError::Closed)?;
        let cookies = browser.get_cookies().await.map_err(protocol)?;
        Ok(cookies.into_iter().map(from_cdp_cookie).collect())
    }

    /// Writes straight into the browser's store so it works before the
    /// first navigation, while the page is still `about:blank`.
    async fn set_cookies(&self, cookies: &[Cookie]) -> Result<(), BrowserError> {
        let params = cookies
            .iter()
            .map(to_cookie_param)
            .collect::<Result<Vec<_>, _>>()?;
        let guard = self.browser.lock().await;
        let browser = guard.as_ref().ok_or(BrowserError::Closed)?;
        browser.set_cookies(params).await.map_err(protocol)?;
        Ok(())
    }

    async fn reload(&self) -> Result<(), BrowserError> {
        self.page.reload().await.map_err(protocol)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BrowserError> {
        let mut guard = self.browser.lock().await;
        let Some(mut browser) = guard.take() else {
            return Err(BrowserError::Closed);
        };
        if let Err(err) = browser.close().await {
            warn!(error = %err, "browser close command failed");
        }
        if let Err(err) = browser.wait().await {
            warn!(error = %err, "waiting for browser exit failed");
        }
        if let Ok(mut task) = self.handler_task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
        info!("browser closed");
        Ok(())
    }
}

fn spawn_handler_task(mut handler: Handler) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(err) = event {
                debug!(error = %err, "devtools handler event error");
            }
        }
    })
}

fn protocol(err: chromiumoxide::error::CdpError) -> BrowserError {
    BrowserError::Protocol(err.to_string())
}

fn from_cdp_cookie(cookie: CdpCookie) -> Cookie {
    let same_site = match cookie.same_site {
        Some(CookieSameSite::Strict) => SameSite::Strict,
        Some(CookieSameSite::None) => SameSite::None,
        _ => SameSite::Lax,
    };
    Cookie {
        name: cookie.name,
        value: cookie.value,
        domain: cookie.domain,
        path: cookie.path,
        expires: (!cookie.session && cookie.expires > 0.0).then_some(cookie.expires),
        http_only: cookie.http_only,
        secure: cookie.secure,
        same_site,
    }
}

fn to_cookie_param(cookie: &Cookie) -> Result<CookieParam, BrowserError> {
    let same_site = match cookie.same_site {
        SameSite::Strict => CookieSameSite::Strict,
        SameSite::None => CookieSameSite::None,
        SameSite::Lax => CookieSameSite::Lax,
    };
    let host = cookie.domain.trim_start_matches('.');
    let mut builder = CookieParam::builder()
        .name(cookie.name.clone())
        .value(cookie.value.clone())
        .url(format!("https://{host}{}", cookie.path))
        .path(cookie.path.clone())
        .secure(cookie.secure)
        .http_only(cookie.http_only)
        .same_site(same_site);
    // `__Host-` cookies are rejected when they carry a Domain attribute.
    if !cookie.name.starts_with(HOST_PREFIX) {
        builder = builder.domain(cookie.domain.clone());
    }
    if let Some(expires) = cookie.expires {
        builder = builder.expires(TimeSinceEpoch::new(expires));
    }
    builder.build().map_err(BrowserError::Protocol)
}
