//! Remote storage for checkpoint screenshots.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use url::Url;

const DEFAULT_API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = "clawlogin/0.1.0";
const UPLOAD_TEMPLATE_SUFFIX: &str = "{?name,label}";

/// Errors raised while uploading an artifact.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("release API returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("invalid release URL: {0}")]
    Url(#[from] url::ParseError),
}

/// Blob storage for diagnostic artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes` under `name`, returning a public download URL when the
    /// store hands one back.
    async fn upload(&self, bytes: Vec<u8>, name: &str) -> Result<Option<Url>, ArtifactError>;
}

/// Uploads artifacts as assets of a per-run GitHub release.
#[derive(Debug)]
pub struct GithubReleases {
    http: Client,
    api_base: Url,
    token: String,
    repo: String,
    tag: String,
    upload_url: OnceCell<String>,
}

impl GithubReleases {
    pub fn new(token: impl Into<String>, repo: impl Into<String>) -> Result<Self, ArtifactError> {
        Self::with_api_base(token, repo, DEFAULT_API_BASE, Utc::now())
    }

    pub fn with_api_base(
        token: impl Into<String>,
        repo: impl Into<String>,
        api_base: &str,
        started_at: DateTime<Utc>,
    ) -> Result<Self, ArtifactError> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            api_base: Url::parse(api_base)?,
            token: token.into(),
            repo: repo.into(),
            tag: release_tag(started_at),
            upload_url: OnceCell::new(),
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Upload endpoint of this run's release, creating the release on first use.
    async fn upload_endpoint(&self) -> Result<&str, ArtifactError> {
        self.upload_url
            .get_or_try_init(|| async {
                let release = match self.find_release().await? {
                    Some(release) => release,
                    None => self.create_release().await?,
                };
                Ok::<_, ArtifactError>(
                    release
                        .upload_url
                        .trim_end_matches(UPLOAD_TEMPLATE_SUFFIX)
                        .to_owned(),
                )
            })
            .await
            .map(String::as_str)
    }

    async fn find_release(&self) -> Result<Option<Release>, ArtifactError> {
        let url = self
            .api_base
            .join(&format!("/repos/{}/releases/tags/{}", self.repo, self.tag))?;
        let response = self
            .http
            .get(url)
            .header("Authorization", format!("token {}", self.token))
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(Some(response.json().await?)),
            StatusCode::NOT_FOUND => Ok(None),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(ArtifactError::Api { status, body })
            }
        }
    }

    async fn create_release(&self) -> Result<Release, ArtifactError> {
        debug!(tag = %self.tag, "creating screenshot release");
        let url = self
            .api_base
            .join(&format!("/repos/{}/releases", self.repo))?;
        let response = self
            .http
            .post(url)
            .header("Authorization", format!("token {}", self.token))
            .json(&serde_json::json!({
                "tag_name": self.tag,
                "name": self.tag,
                "draft": false,
                "prerelease": false,
            }))
            .send()
            .await?;

        if response.status() != StatusCode::CREATED {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ArtifactError::Api { status, body });
        }
        info!(tag = %self.tag, "screenshot release created");
        Ok(response.json().await?)
    }
}

#[async_trait]
impl ArtifactStore for GithubReleases {
    async fn upload(&self, bytes: Vec<u8>, name: &str) -> Result<Option<Url>, ArtifactError> {
        let mut url = Url::parse(self.upload_endpoint().await?)?;
        url.query_pairs_mut().append_pair("name", name);

        let response = self
            .http
            .post(url)
            .header("Authorization", format!("token {}", self.token))
            .header("Content-Type", "image/png")
            .body(bytes)
            .send()
            .await?;

        if response.status() != StatusCode::CREATED {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ArtifactError::Api { status, body });
        }

        let asset: Asset = response.json().await?;
        Ok(Url::parse(&asset.browser_download_url).ok())
    }
}

/// Release tag for a run started at `at`, e.g. `screenshots_20240131_235959`.
pub fn release_tag(at: DateTime<Utc>) -> String {
    format!("screenshots_{}", at.format("%Y%m%d_%H%M%S"))
}

#[derive(Debug, Deserialize)]
struct Release {
    upload_url: String,
}

#[derive(Debug, Deserialize)]
struct Asset {
    browser_download_url: String,
}
