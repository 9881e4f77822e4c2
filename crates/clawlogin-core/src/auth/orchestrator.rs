use std::any::Any;
use std::mem::discriminant;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::challenge::{send_checkpoint, ChallengeContext, ChallengeResult, VerificationChallenge};
use super::markers::{PageKind, FLASH_ERROR_SELECTOR, REGION_UNAVAILABLE_SCRIPT};
use super::session::{Checkpoint, LogLevel, Session};
use super::{LoginError, RegionResolver, RunOutcome};
use crate::artifacts::ArtifactStore;
use crate::browser::{Browser, BrowserLauncher, Selector, WaitPolicy};
use crate::channel::{escape_html, CodeRelay, Notifier};
use crate::config::{Credentials, LoginConfig};
use crate::cookies::{
    legacy_session_cookies, normalize_blob, persist_jar, CookieFamily, CookieJar, PersistOutcome,
};
use crate::secrets::SecretStore;

const IDENTITY_COOKIE_DOMAIN: &str = ".github.com";
const KEEPALIVE_PAGES: [(&str, &str); 2] = [("/", "console"), ("/apps", "apps")];
const RECENT_LOG_LINES: usize = 6;
const FAILURE_PHOTOS: usize = 3;
const UPLOAD_SUMMARY_LIMIT: usize = 10;

/// Ordered from most to least precise; later strategies only run when the
/// earlier ones miss.
fn provider_triggers() -> [Selector; 4] {
    [
        Selector::css(r#"[data-provider="github"]"#),
        Selector::xpath(
            r#"//button[contains(normalize-space(.), "GitHub") or contains(@aria-label, "GitHub")]"#,
        ),
        Selector::xpath(
            r#"//a[contains(normalize-space(.), "GitHub") or contains(@aria-label, "GitHub")]"#,
        ),
        Selector::text_scan(r#"button, a[role="button"]"#, "GitHub"),
    ]
}

fn authorize_button() -> Selector {
    Selector::css(r#"button[name="authorize"]"#)
}

/// Drives one ClawCloud sign-in through GitHub and persists the session.
pub struct LoginOrchestrator<L> {
    config: LoginConfig,
    launcher: L,
    notifier: Notifier,
    relay: Option<CodeRelay>,
    secrets: Option<Arc<dyn SecretStore>>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
}

impl<L> LoginOrchestrator<L>
where
    L: BrowserLauncher,
{
    pub fn new(config: LoginConfig, launcher: L) -> Self {
        Self {
            config,
            launcher,
            notifier: Notifier::disabled(),
            relay: None,
            secrets: None,
            artifacts: None,
        }
    }

    /// Route notifications through `notifier`; its channel also relays
    /// verification codes.
    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.relay = notifier.channel().map(|channel| {
            CodeRelay::new(
                Arc::clone(channel),
                self.config.timeouts.relay_poll,
                self.config.timeouts.relay_backoff,
            )
        });
        self.notifier = notifier;
        self
    }

    pub fn with_secret_store(mut self, store: Arc<dyn SecretStore>) -> Self {
        self.secrets = Some(store);
        self
    }

    pub fn with_artifact_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(store);
        self
    }

    pub async fn run(&self) -> RunOutcome {
        let Some(credentials) = self.config.credentials.clone() else {
            let err = LoginError::CredentialsMissing;
            error!(error = %err, "refusing to start");
            self.notifier
                .send(&format!("❌ <b>ClawCloud sign-in</b>\n\n{err}"))
                .await;
            return err.outcome();
        };

        let mut session = Session::new(
            credentials.username.clone(),
            self.config.artifacts.clone(),
            RegionResolver::new(&self.config.endpoints),
        );

        let browser = match self.launcher.launch().await {
            Ok(browser) => browser,
            Err(err) => {
                let err = LoginError::from(err);
                session.log(LogLevel::Error, err.to_string());
                self.report(&session, RunOutcome::UnhandledException, Some(&err.to_string()))
                    .await;
                return RunOutcome::UnhandledException;
            }
        };

        let driven = AssertUnwindSafe(self.drive(&browser, &credentials, &mut session))
            .catch_unwind()
            .await;
        let failure = match driven {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some((err.outcome(), err.to_string())),
            Err(panic) => {
                let err = LoginError::Unhandled(panic_message(panic.as_ref()));
                Some((err.outcome(), err.to_string()))
            }
        };

        let outcome = match failure {
            None => {
                session.log(LogLevel::Success, "sign-in complete");
                self.report(&session, RunOutcome::Success, None).await;
                RunOutcome::Success
            }
            Some((outcome, message)) => {
                session.log(LogLevel::Error, message.clone());
                session.checkpoint(&browser, "failure").await;
                self.report(&session, outcome, Some(&message)).await;
                outcome
            }
        };

        self.teardown(&browser, &mut session).await;
        outcome
    }

    async fn drive(
        &self,
        browser: &L::Browser,
        credentials: &Credentials,
        session: &mut Session,
    ) -> Result<(), LoginError> {
        self.preload_cookies(browser, session).await;

        session.log(LogLevel::Step, "step 1: open the ClawCloud sign-in page");
        let signin = self.config.endpoints.signin_url();
        browser
            .navigate(signin.as_str(), WaitPolicy::NetworkIdle)
            .await?;
        session.checkpoint(browser, "clawcloud").await;
        let url = browser.current_url().await?;
        session.log(LogLevel::Info, format!("current URL: {url}"));

        session.log(LogLevel::Step, "step 2: choose GitHub sign-in");
        let Some((trigger, index)) = browser.find_any(&provider_triggers()).await? else {
            session.log(LogLevel::Error, "GitHub sign-in button not found");
            return Err(LoginError::LoginFailed(
                "GitHub sign-in button not found".into(),
            ));
        };
        browser.click(&trigger).await?;
        session.log(
            LogLevel::Success,
            format!("clicked GitHub ({})", provider_triggers()[index].describe()),
        );
        browser.wait_for_settle(self.config.timeouts.settle).await?;
        session.checkpoint(browser, "after_click").await;

        self.ensure_region_available(browser, session).await?;
        let url = browser.current_url().await?;
        session.log(LogLevel::Info, format!("current URL: {url}"));

        match self.classify(&url) {
            PageKind::Destination => {
                session.log(LogLevel::Success, "already signed in");
            }
            PageKind::CredentialForm => {
                session.log(LogLevel::Step, "step 3: GitHub authentication");
                self.submit_credentials(browser, credentials, session).await?;
                self.authorize(browser, session).await?;
            }
            PageKind::Authorize => {
                session.log(LogLevel::Success, "stored GitHub cookies are valid");
                self.authorize(browser, session).await?;
            }
            kind if VerificationChallenge::for_page(kind, self.config.timeouts.two_factor_wait)
                .is_some() =>
            {
                session.log(LogLevel::Step, "step 3: GitHub verification");
                self.clear_challenges(browser, session).await?;
                self.authorize(browser, session).await?;
            }
            _ => {
                session.log(LogLevel::Warn, "unexpected page, waiting for redirect");
            }
        }

        session.log(LogLevel::Step, "step 4: wait for redirect");
        self.wait_redirect(browser, session).await?;
        session.checkpoint(browser, "redirected").await;

        self.keepalive(browser, session).await?;

        session.log(LogLevel::Step, "step 5: persist cookies");
        self.persist_cookies(browser, session).await;
        Ok(())
    }

    fn classify(&self, url: &str) -> PageKind {
        PageKind::classify(url, &self.config.endpoints.destination_domain)
    }

    async fn preload_cookies(&self, browser: &L::Browser, session: &mut Session) {
        let preload = &self.config.cookies;
        let mut jars = Vec::new();

        match non_blank(preload.identity_provider.as_deref()) {
            Some(blob) => match normalize_blob(blob, CookieFamily::IdentityProvider, IDENTITY_COOKIE_DOMAIN) {
                Ok(jar) => jars.push(jar),
                Err(err) => session.log(LogLevel::Warn, format!("GH_COOKIES ignored: {err}")),
            },
            None => {
                if let Some(legacy) = non_blank(preload.legacy_session.as_deref()) {
                    jars.push(legacy_session_cookies(legacy));
                }
            }
        }
        if let Some(blob) = non_blank(preload.destination.as_deref()) {
            match normalize_blob(blob, CookieFamily::Destination, &preload.destination_domain) {
                Ok(jar) => jars.push(jar),
                Err(err) => session.log(LogLevel::Warn, format!("CLAW_COOKIES ignored: {err}")),
            }
        }

        for jar in jars.iter().filter(|jar| !jar.is_empty()) {
            let label = jar.family().label();
            match browser.set_cookies(jar.cookies()).await {
                Ok(()) => session.log(
                    LogLevel::Success,
                    format!("preloaded {} {label} cookies", jar.len()),
                ),
                Err(err) => session.log(
                    LogLevel::Warn,
                    format!("failed to preload {label} cookies: {err}"),
                ),
            }
        }
    }

    async fn submit_credentials(
        &self,
        browser: &L::Browser,
        credentials: &Credentials,
        session: &mut Session,
    ) -> Result<(), LoginError> {
        session.log(LogLevel::Step, "signing in to GitHub");
        session.checkpoint(browser, "github_login").await;

        let login = browser
            .find_first_visible(&Selector::css(r#"input[name="login"]"#))
            .await?;
        let password = browser
            .find_first_visible(&Selector::css(r#"input[name="password"]"#))
            .await?;
        let (Some(login), Some(password)) = (login, password) else {
            session.log(LogLevel::Error, "credential form fields not found");
            return Err(LoginError::LoginFailed(
                "GitHub credential form fields not found".into(),
            ));
        };

        let typed = async {
            browser.type_text(&login, &credentials.username).await?;
            browser.type_text(&password, &credentials.password).await
        }
        .await;
        if let Err(err) = typed {
            session.log(LogLevel::Error, format!("entering credentials failed: {err}"));
            return Err(LoginError::LoginFailed(format!(
                "entering credentials failed: {err}"
            )));
        }
        session.log(LogLevel::Info, "credentials entered");
        session.checkpoint(browser, "github_filled").await;

        let submits = [
            Selector::css(r#"input[type="submit"]"#),
            Selector::css(r#"button[type="submit"]"#),
        ];
        match browser.find_any(&submits).await? {
            Some((button, _)) => browser.click(&button).await?,
            None => browser.press_enter(&password).await?,
        }
        browser.wait_for_settle(self.config.timeouts.settle).await?;
        session.checkpoint(browser, "github_submitted").await;
        let url = browser.current_url().await?;
        session.log(LogLevel::Info, format!("current URL: {url}"));

        self.clear_challenges(browser, session).await?;

        if let Some(flash) = browser
            .find_first_visible(&Selector::css(FLASH_ERROR_SELECTOR))
            .await?
        {
            let text = browser.inner_text(&flash).await.unwrap_or_default();
            let text = text.trim();
            session.log(LogLevel::Error, format!("GitHub error: {text}"));
            return Err(LoginError::LoginFailed(format!("GitHub sign-in failed: {text}")));
        }

        session.log(LogLevel::Success, "GitHub sign-in accepted");
        Ok(())
    }

    /// Answer every verification interstitial the provider shows, each at
    /// most once.
    async fn clear_challenges(&self, browser: &L::Browser, session: &mut Session) -> Result<(), LoginError> {
        let mut answered = Vec::new();
        loop {
            let url = browser.current_url().await?;
            let kind = self.classify(&url);
            let Some(challenge) =
                VerificationChallenge::for_page(kind, self.config.timeouts.two_factor_wait)
            else {
                return Ok(());
            };
            if answered.contains(&discriminant(&challenge)) {
                return Ok(());
            }
            answered.push(discriminant(&challenge));
            if kind.is_two_factor() {
                session.log(LogLevel::Warn, "two-factor authentication required");
            }

            let mut cx = ChallengeContext {
                browser,
                session: &mut *session,
                notifier: &self.notifier,
                relay: self.relay.as_ref(),
                settle: self.config.timeouts.settle,
                destination_domain: &self.config.endpoints.destination_domain,
            };
            let result = challenge.resolve(&mut cx).await?;

            match (&challenge, result) {
                (_, ChallengeResult::Passed) => {
                    browser.wait_for_settle(self.config.timeouts.settle).await?;
                    session.checkpoint(browser, "verified").await;
                }
                (VerificationChallenge::DeviceApproval, _) => {
                    return Err(LoginError::ChallengeTimedOut(
                        "device verification timed out".into(),
                    ));
                }
                (VerificationChallenge::TwoFactorMobilePush { .. }, ChallengeResult::Rejected) => {
                    return Err(LoginError::ChallengeRejected);
                }
                (VerificationChallenge::TwoFactorMobilePush { .. }, _) => {
                    return Err(LoginError::ChallengeTimedOut(
                        "two-factor approval timed out".into(),
                    ));
                }
                (VerificationChallenge::TwoFactorCode { .. }, ChallengeResult::Rejected) => {
                    return Err(LoginError::LoginFailed(
                        "verification code was not accepted".into(),
                    ));
                }
                (VerificationChallenge::TwoFactorCode { .. }, _) => {
                    return Err(LoginError::ChallengeTimedOut(
                        "timed out waiting for verification code".into(),
                    ));
                }
            }
        }
    }

    /// Approve the OAuth application. No-op off the authorize page.
    async fn authorize(&self, browser: &L::Browser, session: &mut Session) -> Result<(), LoginError> {
        let url = browser.current_url().await?;
        if self.classify(&url) != PageKind::Authorize {
            return Ok(());
        }

        session.log(LogLevel::Step, "authorizing OAuth application");
        session.checkpoint(browser, "oauth").await;
        match browser.find_first_visible(&authorize_button()).await? {
            Some(button) => {
                browser.click(&button).await?;
                session.log(LogLevel::Success, "authorization granted");
            }
            None => session.log(LogLevel::Warn, "authorize button not found"),
        }
        browser.wait_for_settle(self.config.timeouts.settle).await?;
        Ok(())
    }

    async fn wait_redirect(&self, browser: &L::Browser, session: &mut Session) -> Result<(), LoginError> {
        let wait = self.config.timeouts.redirect_wait;
        let expires_at = Instant::now() + wait;
        let mut tick: u64 = 0;

        while Instant::now() < expires_at {
            self.ensure_region_available(browser, session).await?;

            let url = browser.current_url().await?;
            match self.classify(&url) {
                PageKind::Destination => {
                    session.log(LogLevel::Success, format!("redirected to {url}"));
                    session.region.resolve(&url);
                    return Ok(());
                }
                PageKind::Authorize => {
                    if let Some(button) = browser.find_first_visible(&authorize_button()).await? {
                        browser.click(&button).await?;
                        session.log(LogLevel::Success, "authorization granted");
                    }
                }
                _ => {}
            }

            tokio::time::sleep(Duration::from_secs(1)).await;
            if tick % 10 == 0 {
                session.log(LogLevel::Info, format!("  waiting... ({tick}s)"));
            }
            tick += 1;
        }

        session.log(LogLevel::Error, "redirect timed out");
        Err(LoginError::RedirectFailed(wait.as_secs()))
    }

    async fn ensure_region_available(&self, browser: &L::Browser, session: &mut Session) -> Result<(), LoginError> {
        match browser.evaluate_bool(REGION_UNAVAILABLE_SCRIPT).await {
            Ok(true) => {
                session.log(LogLevel::Error, "REGION_NOT_AVAILABLE reported by the console");
                Err(LoginError::RegionUnavailable)
            }
            Ok(false) => Ok(()),
            Err(err) => {
                debug!(error = %err, "region check skipped");
                Ok(())
            }
        }
    }

    async fn keepalive(&self, browser: &L::Browser, session: &mut Session) -> Result<(), LoginError> {
        session.log(LogLevel::Step, "keepalive");
        session.log(
            LogLevel::Info,
            format!("using base URL {}", session.region.base_url()),
        );

        for (path, name) in KEEPALIVE_PAGES {
            let url = match session.region.base_url().join(path) {
                Ok(url) => url,
                Err(err) => {
                    session.log(LogLevel::Warn, format!("skipping {name}: {err}"));
                    continue;
                }
            };
            if let Err(err) = browser
                .navigate(url.as_str(), WaitPolicy::DomContentLoaded)
                .await
            {
                session.log(LogLevel::Warn, format!("visiting {name} failed: {err}"));
                continue;
            }
            let _ = browser.wait_for_settle(self.config.timeouts.settle).await;

            if let Err(err) = self.ensure_region_available(browser, session).await {
                session.log(LogLevel::Error, format!("region unavailable while visiting {name}"));
                return Err(err);
            }
            match browser.current_url().await {
                Ok(landed) => {
                    session.region.resolve(&landed);
                }
                Err(err) => debug!(error = %err, "landed URL unavailable"),
            }
            session.log(LogLevel::Success, format!("visited {name}"));
        }

        if let Some(region) = session.region.region().map(str::to_owned) {
            session.log(LogLevel::Info, format!("current region: {region}"));
        }
        session.checkpoint(browser, "keepalive").await;
        Ok(())
    }

    async fn persist_cookies(&self, browser: &L::Browser, session: &mut Session) {
        let raw = match browser.cookies().await {
            Ok(raw) => raw,
            Err(err) => {
                session.log(LogLevel::Warn, format!("reading cookies failed: {err}"));
                Vec::new()
            }
        };

        for family in [CookieFamily::IdentityProvider, CookieFamily::Destination] {
            let label = family.label();
            let jar = CookieJar::extract(family, raw.clone());
            if jar.is_empty() {
                session.log(LogLevel::Warn, format!("no new {label} cookies"));
                continue;
            }
            session.log(
                LogLevel::Success,
                format!("new {label} cookies ({} entries)", jar.len()),
            );

            match persist_jar(&jar, self.secrets.as_deref(), &self.notifier).await {
                Ok(PersistOutcome::SecretUpdated) => session.log(
                    LogLevel::Success,
                    format!("{} updated automatically", family.secret_name()),
                ),
                Ok(PersistOutcome::RelayedToOperator) => session.log(
                    LogLevel::Success,
                    format!("{} sent to the operator", family.secret_name()),
                ),
                Ok(PersistOutcome::Empty) => {}
                Err(err) => session.log(
                    LogLevel::Warn,
                    format!("persisting {label} cookies failed: {err}"),
                ),
            }
        }
    }

    async fn report(&self, session: &Session, outcome: RunOutcome, error: Option<&str>) {
        let status = if outcome.is_success() {
            "✅ success".to_owned()
        } else {
            format!("❌ failed ({outcome})")
        };
        let mut message = format!(
            "<b>🤖 ClawCloud sign-in</b>\n\n<b>Status:</b> {status}\n<b>User:</b> {}",
            escape_html(session.username())
        );
        if let Some(region) = session.region.region() {
            message.push_str(&format!("\n<b>Region:</b> {}", escape_html(region)));
        }
        message.push_str(&format!(
            "\n<b>Time:</b> {}",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        ));
        if let Some(error) = error {
            message.push_str(&format!("\n<b>Error:</b> {}", escape_html(error)));
        }
        let recent: Vec<String> = session
            .recent_logs(RECENT_LOG_LINES)
            .iter()
            .map(|line| escape_html(line))
            .collect();
        message.push_str("\n\n<b>Log:</b>\n");
        message.push_str(&recent.join("\n"));
        self.notifier.send(&message).await;

        let checkpoints = session.checkpoints();
        if outcome.is_success() {
            send_checkpoint(&self.notifier, checkpoints.last(), "done").await;
        } else {
            let start = checkpoints.len().saturating_sub(FAILURE_PHOTOS);
            for checkpoint in &checkpoints[start..] {
                send_checkpoint(&self.notifier, Some(checkpoint), &checkpoint.file_name()).await;
            }
        }
    }

    /// Upload and delete local checkpoints, then release the browser.
    async fn teardown(&self, browser: &L::Browser, session: &mut Session) {
        let checkpoints = session.take_checkpoints();
        self.upload_checkpoints(&checkpoints, session).await;

        for checkpoint in &checkpoints {
            if let Err(err) = tokio::fs::remove_file(&checkpoint.path).await {
                debug!(path = %checkpoint.path.display(), error = %err, "checkpoint cleanup failed");
            }
        }

        if let Err(err) = browser.close().await {
            warn!(error = %err, "closing browser failed");
        }
    }

    async fn upload_checkpoints(&self, checkpoints: &[Checkpoint], session: &mut Session) {
        if checkpoints.is_empty() {
            session.log(LogLevel::Warn, "no checkpoints to upload");
            return;
        }
        let Some(store) = &self.artifacts else {
            session.log(LogLevel::Warn, "artifact store not configured, skipping upload");
            return;
        };

        session.log(
            LogLevel::Info,
            format!("uploading {} checkpoints", checkpoints.len()),
        );
        let prefix = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let mut urls = Vec::new();
        for checkpoint in checkpoints {
            let bytes = match tokio::fs::read(&checkpoint.path).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    session.log(
                        LogLevel::Warn,
                        format!("reading {} failed: {err}", checkpoint.file_name()),
                    );
                    continue;
                }
            };
            let name = format!("{prefix}_{}", checkpoint.file_name());
            match store.upload(bytes, &name).await {
                Ok(Some(url)) => {
                    session.log(LogLevel::Success, format!("{} -> {url}", checkpoint.file_name()));
                    urls.push(url);
                }
                Ok(None) => {}
                Err(err) => session.log(
                    LogLevel::Warn,
                    format!("uploading {} failed: {err}", checkpoint.file_name()),
                ),
            }
        }

        if urls.is_empty() {
            session.log(LogLevel::Error, "checkpoint upload failed");
            return;
        }
        session.log(
            LogLevel::Success,
            format!("uploaded {} checkpoints", urls.len()),
        );

        let mut message = String::from("📸 Checkpoints uploaded to GitHub Releases:\n");
        let listed: Vec<String> = urls
            .iter()
            .take(UPLOAD_SUMMARY_LIMIT)
            .map(|url| format!("• {url}"))
            .collect();
        message.push_str(&listed.join("\n"));
        if urls.len() > UPLOAD_SUMMARY_LIMIT {
            message.push_str(&format!("\n... {} more", urls.len() - UPLOAD_SUMMARY_LIMIT));
        }
        self.notifier.send(&message).await;
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_owned()
    }
}
