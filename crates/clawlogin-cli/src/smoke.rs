use anyhow::{Context, Result};
use clawlogin_core::browser::{Browser, BrowserLauncher, ChromiumLauncher, WaitPolicy};
use clawlogin_core::config::BrowserSettings;
use tracing::{info, warn};

const SMOKE_URL: &str = "https://github.com";
const SIGN_BUTTONS_SCRIPT: &str = r#"Array.from(document.querySelectorAll('button'))
    .filter(el => (el.innerText || '').includes('Sign')).length"#;

struct SmokeReport {
    title: String,
    sign_buttons: u64,
}

/// Launch the browser, render the GitHub home page, and print what it saw.
pub async fn run(settings: BrowserSettings) -> Result<()> {
    let browser = ChromiumLauncher::new(settings)
        .launch()
        .await
        .context("failed to launch browser")?;
    info!(url = SMOKE_URL, "browser launched");

    let report = probe(&browser).await;
    if let Err(err) = browser.close().await {
        warn!(error = %err, "closing browser failed");
    }
    let report = report?;

    println!("title: {}", report.title);
    println!("buttons containing \"Sign\": {}", report.sign_buttons);
    Ok(())
}

async fn probe<B: Browser>(browser: &B) -> Result<SmokeReport> {
    browser
        .navigate(SMOKE_URL, WaitPolicy::DomContentLoaded)
        .await
        .with_context(|| format!("failed to open {SMOKE_URL}"))?;

    let title = browser
        .evaluate("document.title")
        .await
        .context("failed to read page title")?
        .as_str()
        .unwrap_or_default()
        .to_owned();
    let sign_buttons = browser
        .evaluate(SIGN_BUTTONS_SCRIPT)
        .await
        .context("failed to count sign-in buttons")?
        .as_u64()
        .unwrap_or(0);

    Ok(SmokeReport {
        title,
        sign_buttons,
    })
}
