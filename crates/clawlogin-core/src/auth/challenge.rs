//! Verification interstitials the identity provider may put between the
//! credential form and the OAuth authorize page.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::markers::PageKind;
use super::session::{Checkpoint, LogLevel, Session};
use super::LoginError;
use crate::browser::{Browser, Selector};
use crate::channel::{CodeRelay, Notifier};

/// Device approval wait. Fixed; not tunable from the outside.
pub const DEVICE_VERIFY_WAIT: Duration = Duration::from_secs(30);

const TICK: Duration = Duration::from_secs(1);
const RELOAD_SETTLE: Duration = Duration::from_secs(2);

const OTP_INPUTS: [&str; 6] = [
    r#"input[autocomplete="one-time-code"]"#,
    r#"input[name="app_otp"]"#,
    r#"input[name="otp"]"#,
    "input#app_totp",
    "input#otp",
    r#"input[inputmode="numeric"]"#,
];
const VERIFY_BUTTON_XPATH: &str =
    r#"//button[contains(text(), "Verify") or contains(text(), "verify")]"#;

/// How a challenge ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeResult {
    Passed,
    TimedOut,
    Rejected,
}

/// The one interstitial currently being answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationChallenge {
    DeviceApproval,
    TwoFactorMobilePush { wait: Duration },
    TwoFactorCode { wait: Duration, hardware_key: bool },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct TickActions {
    status: bool,
    capture: bool,
    reload: bool,
}

/// Borrowed run state a challenge handler works against.
pub(crate) struct ChallengeContext<'a, B: Browser> {
    pub browser: &'a B,
    pub session: &'a mut Session,
    pub notifier: &'a Notifier,
    pub relay: Option<&'a CodeRelay>,
    pub settle: Duration,
    pub destination_domain: &'a str,
}

impl VerificationChallenge {
    /// Challenge shown on a page of `kind`, if any.
    pub fn for_page(kind: PageKind, two_factor_wait: Duration) -> Option<Self> {
        match kind {
            PageKind::DeviceVerification => Some(VerificationChallenge::DeviceApproval),
            PageKind::TwoFactorMobile => Some(VerificationChallenge::TwoFactorMobilePush {
                wait: two_factor_wait,
            }),
            PageKind::TwoFactorWebAuthn => Some(VerificationChallenge::TwoFactorCode {
                wait: two_factor_wait,
                hardware_key: true,
            }),
            PageKind::TwoFactorCode => Some(VerificationChallenge::TwoFactorCode {
                wait: two_factor_wait,
                hardware_key: false,
            }),
            _ => None,
        }
    }

    pub fn deadline(&self) -> Duration {
        match self {
            VerificationChallenge::DeviceApproval => DEVICE_VERIFY_WAIT,
            VerificationChallenge::TwoFactorMobilePush { wait }
            | VerificationChallenge::TwoFactorCode { wait, .. } => *wait,
        }
    }

    /// Termination predicate for the page-watching challenges.
    fn probe(&self, kind: PageKind) -> Option<ChallengeResult> {
        match self {
            VerificationChallenge::DeviceApproval => {
                (kind != PageKind::DeviceVerification).then_some(ChallengeResult::Passed)
            }
            VerificationChallenge::TwoFactorMobilePush { .. } => {
                if kind == PageKind::CredentialForm {
                    Some(ChallengeResult::Rejected)
                } else if !kind.is_two_factor() {
                    Some(ChallengeResult::Passed)
                } else {
                    None
                }
            }
            VerificationChallenge::TwoFactorCode { .. } => {
                (!kind.is_two_factor()).then_some(ChallengeResult::Passed)
            }
        }
    }

    fn actions_at(&self, tick: u64) -> TickActions {
        match self {
            VerificationChallenge::DeviceApproval => TickActions {
                status: tick % 5 == 0,
                capture: false,
                reload: tick % 5 == 0,
            },
            VerificationChallenge::TwoFactorMobilePush { .. } => TickActions {
                status: tick != 0 && tick % 10 == 0,
                capture: tick != 0 && tick % 10 == 0,
                reload: tick != 0 && tick % 30 == 0,
            },
            VerificationChallenge::TwoFactorCode { .. } => TickActions::default(),
        }
    }

    /// Drive the challenge to a result. Only a missing code input is an error;
    /// every other ending is a [`ChallengeResult`].
    pub(crate) async fn resolve<B: Browser>(
        &self,
        cx: &mut ChallengeContext<'_, B>,
    ) -> Result<ChallengeResult, LoginError> {
        match self {
            VerificationChallenge::DeviceApproval => Ok(self.resolve_device(cx).await),
            VerificationChallenge::TwoFactorMobilePush { .. } => Ok(self.resolve_mobile(cx).await),
            VerificationChallenge::TwoFactorCode { wait, hardware_key } => {
                enter_code(cx, *wait, *hardware_key).await
            }
        }
    }

    async fn resolve_device<B: Browser>(&self, cx: &mut ChallengeContext<'_, B>) -> ChallengeResult {
        let secs = self.deadline().as_secs();
        cx.session.log(
            LogLevel::Warn,
            format!("device verification required, waiting {secs}s"),
        );
        let shot = cx.session.checkpoint(cx.browser, "device_verification").await;
        cx.notifier
            .send(&format!(
                "⚠️ <b>Device verification required</b>\n\nApprove within {secs} seconds:\n1️⃣ open the link in the verification email\n2️⃣ or approve in the GitHub app"
            ))
            .await;
        send_checkpoint(cx.notifier, shot.as_ref(), "device verification page").await;

        let result = self.watch(cx).await;
        match result {
            ChallengeResult::Passed => {
                cx.session.log(LogLevel::Success, "device verification passed");
                cx.notifier.send("✅ <b>Device verification passed</b>").await;
            }
            _ => {
                cx.session.log(LogLevel::Error, "device verification timed out");
                cx.notifier.send("❌ <b>Device verification timed out</b>").await;
            }
        }
        result
    }

    async fn resolve_mobile<B: Browser>(&self, cx: &mut ChallengeContext<'_, B>) -> ChallengeResult {
        let secs = self.deadline().as_secs();
        cx.session.log(
            LogLevel::Warn,
            format!("two-factor approval (GitHub Mobile) required, waiting {secs}s"),
        );
        let shot = cx.session.checkpoint(cx.browser, "two_factor_mobile").await;
        cx.notifier
            .send(&format!(
                "⚠️ <b>Two-factor approval required (GitHub Mobile)</b>\n\nOpen the GitHub app and approve this sign-in; it will ask you to confirm a number.\nWaiting {secs} seconds"
            ))
            .await;
        send_checkpoint(cx.notifier, shot.as_ref(), "two-factor page (the number is in the picture)").await;

        let result = self.watch(cx).await;
        match result {
            ChallengeResult::Passed => {
                cx.session.log(LogLevel::Success, "two-factor approval passed");
                cx.notifier.send("✅ <b>Two-factor approval passed</b>").await;
            }
            ChallengeResult::Rejected => {
                cx.session.log(
                    LogLevel::Error,
                    "two-factor approval returned to the sign-in form",
                );
            }
            ChallengeResult::TimedOut => {
                cx.session.log(LogLevel::Error, "two-factor approval timed out");
                cx.notifier.send("❌ <b>Two-factor approval timed out</b>").await;
            }
        }
        result
    }

    /// Shared polling loop: one probe per tick plus the variant's periodic
    /// side effects, bounded by the variant's deadline.
    async fn watch<B: Browser>(&self, cx: &mut ChallengeContext<'_, B>) -> ChallengeResult {
        let secs = self.deadline().as_secs();
        let mut ticker = Ticker::new(self.deadline());

        while let Some(tick) = ticker.next().await {
            if let Some(result) = self.probe_page(cx).await {
                return result;
            }

            let actions = self.actions_at(tick);
            if actions.status {
                cx.session
                    .log(LogLevel::Info, format!("  waiting... ({tick}/{secs}s)"));
            }
            if actions.capture {
                let shot = cx
                    .session
                    .checkpoint(cx.browser, &format!("two_factor_{tick}s"))
                    .await;
                send_checkpoint(cx.notifier, shot.as_ref(), &format!("two-factor page ({tick}s)")).await;
            }
            if actions.reload {
                match cx.browser.reload().await {
                    Ok(()) => {
                        let _ = cx.browser.wait_for_settle(RELOAD_SETTLE).await;
                    }
                    Err(err) => debug!(error = %err, "reload failed, still waiting"),
                }
            }
        }

        // A marker that cleared right at the deadline still counts for
        // device approval.
        match self {
            VerificationChallenge::DeviceApproval => match self.probe_page(cx).await {
                Some(ChallengeResult::Passed) => ChallengeResult::Passed,
                _ => ChallengeResult::TimedOut,
            },
            _ => ChallengeResult::TimedOut,
        }
    }

    async fn probe_page<B: Browser>(&self, cx: &ChallengeContext<'_, B>) -> Option<ChallengeResult> {
        match cx.browser.current_url().await {
            Ok(url) => self.probe(PageKind::classify(&url, cx.destination_domain)),
            Err(err) => {
                debug!(error = %err, "could not read current URL");
                None
            }
        }
    }
}

/// One-second ticks until a wall-clock deadline passes.
struct Ticker {
    expires_at: Instant,
    tick: u64,
}

impl Ticker {
    fn new(deadline: Duration) -> Self {
        Self {
            expires_at: Instant::now() + deadline,
            tick: 0,
        }
    }

    async fn next(&mut self) -> Option<u64> {
        if Instant::now() >= self.expires_at {
            return None;
        }
        tokio::time::sleep(TICK).await;
        let tick = self.tick;
        self.tick += 1;
        Some(tick)
    }
}

pub(crate) async fn send_checkpoint(notifier: &Notifier, checkpoint: Option<&Checkpoint>, caption: &str) {
    let Some(checkpoint) = checkpoint else {
        return;
    };
    if !notifier.is_configured() {
        return;
    }
    match tokio::fs::read(&checkpoint.path).await {
        Ok(bytes) => notifier.photo(bytes, caption).await,
        Err(err) => debug!(path = %checkpoint.path.display(), error = %err, "checkpoint unreadable"),
    }
}

async fn enter_code<B: Browser>(
    cx: &mut ChallengeContext<'_, B>,
    wait: Duration,
    hardware_key: bool,
) -> Result<ChallengeResult, LoginError> {
    let secs = wait.as_secs();
    cx.session.log(LogLevel::Warn, "verification code required");
    let shot = cx.session.checkpoint(cx.browser, "two_factor_code").await;

    if hardware_key {
        switch_to_authenticator(cx).await;
    }

    cx.notifier
        .send(&format!(
            "🔐 <b>Verification code required</b>\n\nUser {} is signing in. Reply in this chat with:\n<code>/code 123456</code>\n\nWaiting {secs} seconds",
            crate::channel::escape_html(cx.session.username())
        ))
        .await;
    send_checkpoint(cx.notifier, shot.as_ref(), "two-factor page").await;

    cx.session
        .log(LogLevel::Warn, format!("waiting for verification code ({secs}s)"));
    let code = match cx.relay {
        Some(relay) => relay.wait_for_code(wait).await,
        None => {
            cx.session
                .log(LogLevel::Warn, "no operator channel configured to relay a code");
            None
        }
    };
    let Some(code) = code else {
        cx.session
            .log(LogLevel::Error, "timed out waiting for verification code");
        cx.notifier
            .send("❌ <b>Timed out waiting for verification code</b>")
            .await;
        return Ok(ChallengeResult::TimedOut);
    };

    cx.session.log(LogLevel::Success, "code received, entering it");
    cx.notifier.send("✅ Code received, entering it...").await;

    let inputs: Vec<Selector> = OTP_INPUTS.iter().map(|css| Selector::css(*css)).collect();
    let Some((input, _)) = cx.browser.find_any(&inputs).await? else {
        cx.session
            .log(LogLevel::Error, "verification code input not found");
        cx.notifier
            .send("❌ <b>Verification code input not found</b>")
            .await;
        return Err(LoginError::CodeInputMissing);
    };

    cx.browser.type_text(&input, &code).await?;
    cx.session.log(LogLevel::Success, "code entered");
    tokio::time::sleep(TICK).await;

    let submits = [
        Selector::xpath(VERIFY_BUTTON_XPATH),
        Selector::css(r#"button[type="submit"]"#),
        Selector::css(r#"input[type="submit"]"#),
    ];
    match cx.browser.find_any(&submits).await? {
        Some((button, index)) => {
            cx.browser.click(&button).await?;
            cx.session
                .log(LogLevel::Success, format!("clicked {}", submits[index].describe()));
        }
        None => {
            cx.browser.press_enter(&input).await?;
            cx.session.log(LogLevel::Success, "submitted with Enter");
        }
    }

    let _ = cx.browser.wait_for_settle(cx.settle).await;
    cx.session.checkpoint(cx.browser, "code_submitted").await;

    let url = cx.browser.current_url().await?;
    if PageKind::classify(&url, cx.destination_domain).is_two_factor() {
        cx.session.log(LogLevel::Error, "verification code was not accepted");
        cx.notifier
            .send("❌ <b>Verification code may be wrong, check it and try again</b>")
            .await;
        Ok(ChallengeResult::Rejected)
    } else {
        cx.session.log(LogLevel::Success, "verification code accepted");
        cx.notifier.send("✅ <b>Verification code accepted</b>").await;
        Ok(ChallengeResult::Passed)
    }
}

/// Move a hardware-key prompt over to authenticator-app entry. Best effort.
async fn switch_to_authenticator<B: Browser>(cx: &mut ChallengeContext<'_, B>) {
    cx.session
        .log(LogLevel::Info, "security key prompt detected, switching method");

    let more = Selector::tag_with_text("button", "More options");
    match cx.browser.find_first_visible(&more).await {
        Ok(Some(button)) => {
            if let Err(err) = cx.browser.click(&button).await {
                cx.session
                    .log(LogLevel::Warn, format!("could not open more options: {err}"));
                return;
            }
            cx.session.log(LogLevel::Success, "clicked 'More options'");
        }
        Ok(None) => {
            cx.session.log(LogLevel::Warn, "'More options' not found");
            return;
        }
        Err(err) => {
            cx.session
                .log(LogLevel::Warn, format!("switching method failed: {err}"));
            return;
        }
    }
    tokio::time::sleep(TICK).await;
    cx.session.checkpoint(cx.browser, "more_options").await;

    let app = Selector::tag_with_text("button", "Authenticator app");
    match cx.browser.find_first_visible(&app).await {
        Ok(Some(button)) => match cx.browser.click(&button).await {
            Ok(()) => {
                cx.session
                    .log(LogLevel::Success, "selected 'Authenticator app'");
                let _ = cx.browser.wait_for_settle(cx.settle).await;
                cx.session.checkpoint(cx.browser, "authenticator_app").await;
            }
            Err(err) => cx
                .session
                .log(LogLevel::Warn, format!("could not select authenticator app: {err}")),
        },
        Ok(None) => cx.session.log(LogLevel::Warn, "'Authenticator app' not found"),
        Err(err) => cx
            .session
            .log(LogLevel::Warn, format!("switching method failed: {err}")),
    }
}
