//! In-memory doubles for the browser, messaging, and storage seams.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use tokio::time::Instant;
use url::Url;

use crate::artifacts::{ArtifactError, ArtifactStore};
use crate::auth::REGION_UNAVAILABLE_MARKER;
use crate::browser::{Browser, BrowserError, BrowserLauncher, Selector, WaitPolicy};
use crate::channel::{ChannelError, ChannelUpdate, MessageChannel};
use crate::cookies::Cookie;
use crate::secrets::{SecretError, SecretStore};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct ChannelState {
    updates: Vec<ChannelUpdate>,
    pending: Vec<ChannelUpdate>,
    failing_polls: usize,
    fail_sends: bool,
    texts: Vec<String>,
    photos: usize,
    polls: usize,
}

/// Scripted operator chat.
///
/// Updates pushed with [`FakeChannel::push_after_flush`] only become visible
/// to long polls, so a zero-timeout backlog flush never sees them.
#[derive(Clone)]
pub struct FakeChannel {
    chat: String,
    state: Arc<Mutex<ChannelState>>,
}

impl FakeChannel {
    pub fn new(chat: &str) -> Self {
        Self {
            chat: chat.to_owned(),
            state: Arc::default(),
        }
    }

    pub fn push(&self, update: ChannelUpdate) {
        locked(&self.state).updates.push(update);
    }

    pub fn push_after_flush(&self, update: ChannelUpdate) {
        locked(&self.state).pending.push(update);
    }

    pub fn fail_next_polls(&self, count: usize) {
        locked(&self.state).failing_polls = count;
    }

    pub fn fail_sends(&self, fail: bool) {
        locked(&self.state).fail_sends = fail;
    }

    pub fn sent_texts(&self) -> Vec<String> {
        locked(&self.state).texts.clone()
    }

    pub fn sent_photos(&self) -> usize {
        locked(&self.state).photos
    }

    pub fn poll_count(&self) -> usize {
        locked(&self.state).polls
    }
}

#[async_trait]
impl MessageChannel for FakeChannel {
    async fn send_text(&self, message: &str) -> Result<(), ChannelError> {
        let mut state = locked(&self.state);
        if state.fail_sends {
            return Err(ChannelError::Rejected("send disabled".into()));
        }
        state.texts.push(message.to_owned());
        Ok(())
    }

    async fn send_photo(&self, _png: Vec<u8>, _caption: &str) -> Result<(), ChannelError> {
        let mut state = locked(&self.state);
        if state.fail_sends {
            return Err(ChannelError::Rejected("send disabled".into()));
        }
        state.photos += 1;
        Ok(())
    }

    async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout: Duration,
    ) -> Result<Vec<ChannelUpdate>, ChannelError> {
        let visible: Vec<ChannelUpdate> = {
            let mut state = locked(&self.state);
            state.polls += 1;
            if !timeout.is_zero() {
                if state.failing_polls > 0 {
                    state.failing_polls -= 1;
                    return Err(ChannelError::Rejected("poll failed".into()));
                }
                let pending = std::mem::take(&mut state.pending);
                state.updates.extend(pending);
            }
            state
                .updates
                .iter()
                .filter(|update| offset.map_or(true, |offset| update.id >= offset))
                .cloned()
                .collect()
        };

        if visible.is_empty() && !timeout.is_zero() {
            tokio::time::sleep(timeout).await;
        }
        Ok(visible)
    }

    fn chat_id(&self) -> &str {
        &self.chat
    }
}

struct BrowserState {
    url: String,
    entered_at: Instant,
    visible: Vec<String>,
    clicks: HashMap<String, String>,
    redirects: HashMap<String, (Duration, String)>,
    read_redirects: HashMap<String, (usize, String)>,
    url_reads: usize,
    panic_on: Option<String>,
    fail_reloads: bool,
    reloads: usize,
    typed: Vec<(String, String)>,
    navigations: Vec<String>,
    cookies: Vec<Cookie>,
    preloaded: Vec<Cookie>,
    closes: usize,
}

impl BrowserState {
    fn enter(&mut self, url: &str) {
        self.url = url.to_owned();
        self.entered_at = Instant::now();
        self.url_reads = 0;
    }

    /// Count a URL read and leave the page once its read budget is spent.
    fn settle_read(&mut self) {
        self.url_reads += 1;
        if let Some((nth, to)) = self.read_redirects.get(&self.url).cloned() {
            if self.url_reads >= nth {
                self.enter(&to);
            }
        }
    }

    /// Apply a pending timed redirect for the current page.
    fn settle_redirect(&mut self) {
        if let Some((delay, to)) = self.redirects.get(&self.url).cloned() {
            if self.entered_at.elapsed() >= delay {
                self.enter(&to);
            }
        }
    }
}

/// Scripted page whose elements are addressed by selector text.
///
/// A shown key matches a selector when it equals [`Selector::describe`], or
/// appears quoted inside an XPath expression.
#[derive(Clone)]
pub struct FakeBrowser {
    state: Arc<Mutex<BrowserState>>,
}

impl FakeBrowser {
    pub fn new(url: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrowserState {
                url: url.to_owned(),
                entered_at: Instant::now(),
                visible: Vec::new(),
                clicks: HashMap::new(),
                redirects: HashMap::new(),
                read_redirects: HashMap::new(),
                url_reads: 0,
                panic_on: None,
                fail_reloads: false,
                reloads: 0,
                typed: Vec::new(),
                navigations: Vec::new(),
                cookies: Vec::new(),
                preloaded: Vec::new(),
                closes: 0,
            })),
        }
    }

    pub fn show(&self, key: &str) {
        let mut state = locked(&self.state);
        if !state.visible.iter().any(|shown| shown == key) {
            state.visible.push(key.to_owned());
        }
    }

    pub fn hide(&self, key: &str) {
        locked(&self.state).visible.retain(|shown| shown != key);
    }

    /// Clicking `key` moves the page to `url`.
    pub fn on_click(&self, key: &str, url: &str) {
        locked(&self.state)
            .clicks
            .insert(key.to_owned(), url.to_owned());
    }

    /// `delay` after the page arrives at `from`, it moves on to `to`.
    pub fn redirect_after(&self, from: &str, delay: Duration, to: &str) {
        locked(&self.state)
            .redirects
            .insert(from.to_owned(), (delay, to.to_owned()));
    }

    /// The `nth` URL read on `from` already reports `to`.
    pub fn redirect_on_read(&self, from: &str, nth: usize, to: &str) {
        locked(&self.state)
            .read_redirects
            .insert(from.to_owned(), (nth, to.to_owned()));
    }

    pub fn fail_reloads(&self, fail: bool) {
        locked(&self.state).fail_reloads = fail;
    }

    pub fn panic_on_navigate(&self, url: &str) {
        locked(&self.state).panic_on = Some(url.to_owned());
    }

    pub fn set_cookies_raw(&self, cookies: Vec<Cookie>) {
        locked(&self.state).cookies = cookies;
    }

    pub fn reload_count(&self) -> usize {
        locked(&self.state).reloads
    }

    pub fn typed(&self) -> Vec<(String, String)> {
        locked(&self.state).typed.clone()
    }

    pub fn navigations(&self) -> Vec<String> {
        locked(&self.state).navigations.clone()
    }

    pub fn preloaded(&self) -> Vec<Cookie> {
        locked(&self.state).preloaded.clone()
    }

    pub fn close_count(&self) -> usize {
        locked(&self.state).closes
    }
}

fn selector_matches(selector: &Selector, key: &str) -> bool {
    if selector.describe() == key {
        return true;
    }
    matches!(selector, Selector::XPath(expr) if expr.contains(&format!("\"{key}\"")))
}

#[async_trait]
impl Browser for FakeBrowser {
    type Element = String;

    async fn navigate(&self, url: &str, _wait: WaitPolicy) -> Result<(), BrowserError> {
        let should_panic = {
            let mut state = locked(&self.state);
            state.navigations.push(url.to_owned());
            state.panic_on.as_deref() == Some(url)
        };
        if should_panic {
            panic!("navigation to {url} crashed");
        }
        locked(&self.state).enter(url);
        Ok(())
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        let mut state = locked(&self.state);
        state.settle_redirect();
        state.settle_read();
        Ok(state.url.clone())
    }

    async fn evaluate(&self, script: &str) -> Result<Value, BrowserError> {
        if !script.contains(REGION_UNAVAILABLE_MARKER) {
            return Ok(Value::Null);
        }
        let mut state = locked(&self.state);
        state.settle_redirect();
        Ok(Value::Bool(state.url.contains(REGION_UNAVAILABLE_MARKER)))
    }

    async fn find_first_visible(&self, selector: &Selector) -> Result<Option<String>, BrowserError> {
        Ok(locked(&self.state)
            .visible
            .iter()
            .find(|key| selector_matches(selector, key))
            .cloned())
    }

    async fn click(&self, element: &String) -> Result<(), BrowserError> {
        let mut state = locked(&self.state);
        if let Some(to) = state.clicks.get(element).cloned() {
            state.enter(&to);
        }
        Ok(())
    }

    async fn type_text(&self, element: &String, text: &str) -> Result<(), BrowserError> {
        locked(&self.state)
            .typed
            .push((element.clone(), text.to_owned()));
        Ok(())
    }

    async fn press_enter(&self, _element: &String) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn inner_text(&self, element: &String) -> Result<String, BrowserError> {
        Ok(element.clone())
    }

    async fn wait_for_settle(&self, _timeout: Duration) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, BrowserError> {
        Ok(b"png".to_vec())
    }

    async fn cookies(&self) -> Result<Vec<Cookie>, BrowserError> {
        Ok(locked(&self.state).cookies.clone())
    }

    async fn set_cookies(&self, cookies: &[Cookie]) -> Result<(), BrowserError> {
        let mut state = locked(&self.state);
        state.preloaded.extend_from_slice(cookies);
        state.cookies.extend_from_slice(cookies);
        Ok(())
    }

    async fn reload(&self) -> Result<(), BrowserError> {
        let mut state = locked(&self.state);
        state.reloads += 1;
        if state.fail_reloads {
            return Err(BrowserError::Protocol("reload refused".into()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrowserError> {
        let mut state = locked(&self.state);
        state.closes += 1;
        if state.closes > 1 {
            return Err(BrowserError::Closed);
        }
        Ok(())
    }
}

/// Hands out clones of one [`FakeBrowser`].
#[derive(Clone)]
pub struct FakeLauncher {
    browser: FakeBrowser,
    launches: Arc<Mutex<usize>>,
}

impl FakeLauncher {
    pub fn new(browser: FakeBrowser) -> Self {
        Self {
            browser,
            launches: Arc::default(),
        }
    }

    pub fn launch_count(&self) -> usize {
        *locked(&self.launches)
    }
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    type Browser = FakeBrowser;

    async fn launch(&self) -> Result<FakeBrowser, BrowserError> {
        *locked(&self.launches) += 1;
        Ok(self.browser.clone())
    }
}

#[derive(Default)]
pub struct MemorySecretStore {
    failing: bool,
    written: Mutex<Vec<(String, String)>>,
}

impl MemorySecretStore {
    /// A store whose every write is refused.
    pub fn failing() -> Self {
        Self {
            failing: true,
            written: Mutex::default(),
        }
    }

    pub fn written_names(&self) -> Vec<String> {
        locked(&self.written)
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn value_of(&self, name: &str) -> Option<String> {
        locked(&self.written)
            .iter()
            .rev()
            .find(|(written, _)| written == name)
            .map(|(_, value)| value.clone())
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn write(&self, name: &str, value: &str) -> Result<(), SecretError> {
        if self.failing {
            return Err(SecretError::Api {
                status: StatusCode::FORBIDDEN,
                body: "Resource not accessible by integration".into(),
            });
        }
        locked(&self.written).push((name.to_owned(), value.to_owned()));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryArtifactStore {
    uploaded: Mutex<Vec<String>>,
}

impl MemoryArtifactStore {
    pub fn uploaded_names(&self) -> Vec<String> {
        locked(&self.uploaded).clone()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn upload(&self, _bytes: Vec<u8>, name: &str) -> Result<Option<Url>, ArtifactError> {
        locked(&self.uploaded).push(name.to_owned());
        let url = Url::parse("https://github.com/acme/claw/releases/download/screenshots/")?
            .join(name)?;
        Ok(Some(url))
    }
}
