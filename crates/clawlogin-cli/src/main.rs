use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

mod smoke;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use clawlogin_core::artifacts::GithubReleases;
use clawlogin_core::auth::LoginOrchestrator;
use clawlogin_core::browser::ChromiumLauncher;
use clawlogin_core::channel::{Notifier, TelegramClient, TelegramConfig};
use clawlogin_core::config::{
    ArtifactLocator, BrowserSettings, Credentials, LoginConfig, PreloadedCookies,
    DEFAULT_DESTINATION_COOKIE_DOMAIN,
};
use clawlogin_core::secrets::GithubSecretStore;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

const DEFAULT_LOG_FILTER: &str = "clawlogin=info,clawlogin_core=info";

#[derive(Parser, Debug)]
#[command(author, version, about = "Unattended ClawCloud sign-in through GitHub OAuth")]
struct Cli {
    /// Emit log lines as JSON
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sign in, keep the console session alive, and persist fresh cookies
    Run(RunArgs),
    /// Check that the browser can launch and render the GitHub home page
    Smoke(BrowserArgs),
}

#[derive(Args, Debug)]
struct BrowserArgs {
    /// Show the browser window instead of running headless
    #[arg(long)]
    headed: bool,
    /// Chrome/Chromium executable to launch
    #[arg(long = "chrome", env = "CHROME_PATH")]
    executable: Option<PathBuf>,
    /// Persistent browser profile directory
    #[arg(long = "user-data-dir")]
    user_data_dir: Option<PathBuf>,
}

impl BrowserArgs {
    fn settings(&self) -> BrowserSettings {
        BrowserSettings {
            headless: !self.headed,
            executable: self.executable.clone(),
            user_data_dir: self.user_data_dir.clone(),
            ..BrowserSettings::default()
        }
    }
}

#[derive(Args, Debug)]
struct RunArgs {
    /// GitHub username
    #[arg(long, env = "GH_USERNAME")]
    username: Option<String>,
    /// GitHub password
    #[arg(long, env = "GH_PASSWORD", hide_env_values = true)]
    password: Option<String>,
    /// Legacy bare `user_session` cookie value
    #[arg(long = "gh-session", env = "GH_SESSION", hide_env_values = true)]
    gh_session: Option<String>,
    /// Saved GitHub cookies (JSON list or `name=value; ...`)
    #[arg(long = "gh-cookies", env = "GH_COOKIES", hide_env_values = true)]
    gh_cookies: Option<String>,
    /// Saved ClawCloud cookies (JSON list or `name=value; ...`)
    #[arg(long = "claw-cookies", env = "CLAW_COOKIES", hide_env_values = true)]
    claw_cookies: Option<String>,
    /// Domain applied to ClawCloud cookies given as `name=value` pairs
    #[arg(long = "claw-cookie-domain", env = "CLAW_COOKIE_DOMAIN", default_value = DEFAULT_DESTINATION_COOKIE_DOMAIN)]
    claw_cookie_domain: String,
    /// Seconds to wait for two-factor approval or a relayed code
    #[arg(long = "two-factor-wait", env = "TWO_FACTOR_WAIT", default_value_t = 120)]
    two_factor_wait: u64,
    /// Console entry URL
    #[arg(long = "entry-url")]
    entry_url: Option<Url>,
    /// Telegram bot token for notifications and code relay
    #[arg(long = "tg-bot-token", env = "TG_BOT_TOKEN", hide_env_values = true)]
    tg_bot_token: Option<String>,
    /// Telegram chat the operator talks from
    #[arg(long = "tg-chat-id", env = "TG_CHAT_ID")]
    tg_chat_id: Option<String>,
    /// Token allowed to write repository Actions secrets
    #[arg(long = "repo-token", env = "REPO_TOKEN", hide_env_values = true)]
    repo_token: Option<String>,
    /// Repository (`owner/name`) the workflow runs in
    #[arg(long, env = "GITHUB_REPOSITORY")]
    repository: Option<String>,
    /// Token used to publish checkpoint screenshots as release assets
    #[arg(long = "release-token", env = "GH_TOKEN", hide_env_values = true)]
    release_token: Option<String>,
    /// Repository receiving screenshot releases (defaults to --repository)
    #[arg(long = "release-repo", env = "GH_REPO")]
    release_repo: Option<String>,
    /// Directory for checkpoint screenshots (defaults to the user cache dir)
    #[arg(long = "artifact-dir")]
    artifact_dir: Option<PathBuf>,
    #[command(flatten)]
    browser: BrowserArgs,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let result = match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Smoke(args) => smoke::run(args.settings())
            .await
            .map(|()| ExitCode::SUCCESS),
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(args: RunArgs) -> Result<ExitCode> {
    let artifacts = match &args.artifact_dir {
        Some(dir) => ArtifactLocator::at(dir),
        None => ArtifactLocator::new(),
    }
    .context("unable to prepare checkpoint directory")?;

    let mut config = LoginConfig::new(
        Credentials::from_parts(args.username, args.password),
        artifacts,
    );
    config.cookies = PreloadedCookies {
        identity_provider: args.gh_cookies,
        legacy_session: args.gh_session,
        destination: args.claw_cookies,
        destination_domain: args.claw_cookie_domain,
    };
    config.timeouts.two_factor_wait = Duration::from_secs(args.two_factor_wait);
    if let Some(entry_url) = args.entry_url {
        config.endpoints.entry_url = entry_url;
    }

    let notifier = match TelegramConfig::from_parts(args.tg_bot_token, args.tg_chat_id) {
        Some(telegram) => {
            let client = TelegramClient::new(telegram).context("failed to build Telegram client")?;
            Notifier::new(Some(Arc::new(client)))
        }
        None => {
            warn!("TG_BOT_TOKEN / TG_CHAT_ID not set; notifications and code relay disabled");
            Notifier::disabled()
        }
    };

    let launcher = ChromiumLauncher::new(args.browser.settings());
    let mut orchestrator = LoginOrchestrator::new(config, launcher).with_notifier(notifier);

    match (args.repo_token, args.repository.clone()) {
        (Some(token), Some(repo)) => {
            let store = GithubSecretStore::new(token, repo)
                .context("failed to build secret store client")?;
            orchestrator = orchestrator.with_secret_store(Arc::new(store));
        }
        _ => info!("REPO_TOKEN not set; fresh cookies will be sent to the operator"),
    }

    match (args.release_token, args.release_repo.or(args.repository)) {
        (Some(token), Some(repo)) => {
            let releases =
                GithubReleases::new(token, repo).context("failed to build release uploader")?;
            info!(tag = releases.tag(), "checkpoint screenshots will be uploaded");
            orchestrator = orchestrator.with_artifact_store(Arc::new(releases));
        }
        _ => info!("GH_TOKEN not set; checkpoint screenshots stay local"),
    }

    let outcome = orchestrator.run().await;
    info!(%outcome, exit_code = outcome.exit_code(), "run finished");
    Ok(ExitCode::from(outcome.exit_code()))
}
