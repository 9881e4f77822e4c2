use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use thiserror::Error;
use url::Url;

pub const DEFAULT_ENTRY_URL: &str = "https://console.run.claw.cloud";
pub const DEFAULT_DESTINATION_DOMAIN: &str = "claw.cloud";
pub const DEFAULT_REGION_DOMAIN: &str = "console.claw.cloud";
pub const DEFAULT_REGION_LABEL: &str = "console";
pub const DEFAULT_DESTINATION_COOKIE_DOMAIN: &str = ".run.claw.cloud";

/// Username/password pair submitted to the identity provider.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Both halves must be present and non-blank.
    pub fn from_parts(username: Option<String>, password: Option<String>) -> Option<Self> {
        let username = username.filter(|value| !value.trim().is_empty())?;
        let password = password.filter(|value| !value.is_empty())?;
        Some(Self { username, password })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Where the run starts and which hosts count as the destination console.
#[derive(Debug, Clone)]
pub struct LoginEndpoints {
    pub entry_url: Url,
    /// Registrable domain every console host lives under.
    pub destination_domain: String,
    /// Parent domain of region shards, e.g. `<region>.console.claw.cloud`.
    pub region_domain: String,
    /// Shard label that denotes "no particular region".
    pub default_region_label: String,
}

impl LoginEndpoints {
    pub fn signin_url(&self) -> Url {
        let mut url = self.entry_url.clone();
        url.set_path("/signin");
        url
    }
}

impl Default for LoginEndpoints {
    fn default() -> Self {
        Self {
            entry_url: Url::parse(DEFAULT_ENTRY_URL).expect("valid default entry URL"),
            destination_domain: DEFAULT_DESTINATION_DOMAIN.to_owned(),
            region_domain: DEFAULT_REGION_DOMAIN.to_owned(),
            default_region_label: DEFAULT_REGION_LABEL.to_owned(),
        }
    }
}

/// Time budgets for the externally tunable waits.
#[derive(Debug, Clone)]
pub struct Timeouts {
    pub two_factor_wait: Duration,
    pub redirect_wait: Duration,
    pub settle: Duration,
    pub relay_poll: Duration,
    pub relay_backoff: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            two_factor_wait: Duration::from_secs(120),
            redirect_wait: Duration::from_secs(60),
            settle: Duration::from_secs(30),
            relay_poll: Duration::from_secs(20),
            relay_backoff: Duration::from_secs(2),
        }
    }
}

/// Previously persisted cookie blobs to load before the first navigation.
#[derive(Debug, Clone, Default)]
pub struct PreloadedCookies {
    /// `GH_COOKIES`: JSON list or `name=value; ...` string.
    pub identity_provider: Option<String>,
    /// `GH_SESSION`: bare `user_session` value, only used without `identity_provider`.
    pub legacy_session: Option<String>,
    /// `CLAW_COOKIES`: JSON list or `name=value; ...` string.
    pub destination: Option<String>,
    /// Domain applied to destination cookies parsed from the string form.
    pub destination_domain: String,
}

impl PreloadedCookies {
    pub fn new() -> Self {
        Self {
            destination_domain: DEFAULT_DESTINATION_COOKIE_DOMAIN.to_owned(),
            ..Self::default()
        }
    }
}

/// Launch options for the controlled Chromium instance.
#[derive(Debug, Clone)]
pub struct BrowserSettings {
    pub headless: bool,
    pub executable: Option<PathBuf>,
    pub user_data_dir: Option<PathBuf>,
    pub window: (u32, u32),
    pub user_agent: String,
    pub args: Vec<String>,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            executable: None,
            user_data_dir: None,
            window: (1920, 1080),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36".to_owned(),
            args: vec![
                "--no-sandbox".to_owned(),
                "--disable-blink-features=AutomationControlled".to_owned(),
                "--disable-infobars".to_owned(),
            ],
        }
    }
}

/// Everything one sign-in run needs, resolved up front by the caller.
#[derive(Debug, Clone)]
pub struct LoginConfig {
    pub credentials: Option<Credentials>,
    pub cookies: PreloadedCookies,
    pub endpoints: LoginEndpoints,
    pub timeouts: Timeouts,
    pub artifacts: ArtifactLocator,
}

impl LoginConfig {
    pub fn new(credentials: Option<Credentials>, artifacts: ArtifactLocator) -> Self {
        Self {
            credentials,
            cookies: PreloadedCookies::new(),
            endpoints: LoginEndpoints::default(),
            timeouts: Timeouts::default(),
            artifacts,
        }
    }
}

/// Locates the directory that holds transient checkpoint screenshots.
#[derive(Debug, Clone)]
pub struct ArtifactLocator {
    root: PathBuf,
}

impl ArtifactLocator {
    /// Discover the per-user cache directory, creating it if needed.
    pub fn new() -> Result<Self, ConfigError> {
        let dirs = ProjectDirs::from("cloud", "claw", "clawlogin")
            .ok_or(ConfigError::MissingProjectDirs)?;
        Self::at(dirs.cache_dir().join("checkpoints"))
    }

    /// Use an explicit directory, creating it if needed.
    pub fn at(root: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(ConfigError::CreateDir)?;
        set_user_only_permissions(&root)?;
        Ok(Self { root })
    }

    /// Path for the `seq`-th checkpoint, e.g. `03_github_login.png`.
    pub fn checkpoint_file(&self, seq: u32, label: &str) -> PathBuf {
        self.root.join(format!("{seq:02}_{}.png", sanitize_label(label)))
    }
}

fn sanitize_label(label: &str) -> String {
    label
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn set_user_only_permissions(path: &Path) -> Result<(), ConfigError> {
    #[cfg(unix)]
    {
        let metadata = fs::metadata(path)?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(0o700);
        fs::set_permissions(path, permissions)?;
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

/// Errors that can occur while resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to determine cache directory for clawlogin")]
    MissingProjectDirs,
    #[error("failed to create artifact directory: {0}")]
    CreateDir(#[source] std::io::Error),
    #[error("filesystem error: {0}")]
    Io(#[source] std::io::Error),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn checkpoint_file_is_numbered_and_sanitized() {
        let temp_dir = TempDir::new().unwrap();
        let locator = ArtifactLocator::at(temp_dir.path()).unwrap();
        let path = locator.checkpoint_file(3, "GitHub Login/after");
        assert!(path.ends_with("03_github_login_after.png"));
    }

    #[test]
    fn credentials_require_both_halves() {
        assert!(Credentials::from_parts(Some("ada".into()), None).is_none());
        assert!(Credentials::from_parts(Some("  ".into()), Some("pw".into())).is_none());
        let creds = Credentials::from_parts(Some("ada".into()), Some("pw".into())).unwrap();
        assert_eq!(creds.username, "ada");
        assert!(format!("{creds:?}").contains("<redacted>"));
    }

    #[test]
    fn signin_url_replaces_path() {
        let endpoints = LoginEndpoints::default();
        assert_eq!(
            endpoints.signin_url().as_str(),
            "https://console.run.claw.cloud/signin"
        );
    }
}
