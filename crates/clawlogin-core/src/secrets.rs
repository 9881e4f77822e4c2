//! Repository secret storage used to persist refreshed cookie jars.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use crypto_box::aead::OsRng;
use crypto_box::PublicKey;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

const DEFAULT_API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = "clawlogin/0.1.0";

/// Errors raised while writing a secret.
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("secret API returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("repository public key is malformed: {0}")]
    InvalidPublicKey(String),
    #[error("sealed-box encryption failed")]
    Encryption,
    #[error("invalid secret endpoint: {0}")]
    Url(#[from] url::ParseError),
}

/// Write-only secret storage.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn write(&self, name: &str, value: &str) -> Result<(), SecretError>;
}

/// GitHub Actions repository secrets.
#[derive(Debug, Clone)]
pub struct GithubSecretStore {
    http: Client,
    api_base: Url,
    token: String,
    repo: String,
}

impl GithubSecretStore {
    pub fn new(token: impl Into<String>, repo: impl Into<String>) -> Result<Self, SecretError> {
        Self::with_api_base(token, repo, DEFAULT_API_BASE)
    }

    pub fn with_api_base(
        token: impl Into<String>,
        repo: impl Into<String>,
        api_base: &str,
    ) -> Result<Self, SecretError> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            api_base: Url::parse(api_base)?,
            token: token.into(),
            repo: repo.into(),
        })
    }

    async fn public_key(&self) -> Result<RepoPublicKey, SecretError> {
        let url = self
            .api_base
            .join(&format!("/repos/{}/actions/secrets/public-key", self.repo))?;
        let response = self
            .http
            .get(url)
            .header("Authorization", format!("token {}", self.token))
            .header("Accept", "application/vnd.github.v3+json")
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(SecretError::Api { status, body });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl SecretStore for GithubSecretStore {
    async fn write(&self, name: &str, value: &str) -> Result<(), SecretError> {
        let key = self.public_key().await?;
        let encrypted_value = seal_value(&key.key, value)?;

        let url = self
            .api_base
            .join(&format!("/repos/{}/actions/secrets/{name}", self.repo))?;
        let response = self
            .http
            .put(url)
            .header("Authorization", format!("token {}", self.token))
            .header("Accept", "application/vnd.github.v3+json")
            .json(&serde_json::json!({
                "encrypted_value": encrypted_value,
                "key_id": key.key_id,
            }))
            .send()
            .await?;

        match response.status() {
            StatusCode::CREATED | StatusCode::NO_CONTENT => Ok(()),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(SecretError::Api { status, body })
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RepoPublicKey {
    key_id: String,
    key: String,
}

/// Encrypt `value` to a base64 X25519 public key as a libsodium sealed box,
/// returning the base64 ciphertext.
pub(crate) fn seal_value(public_key_b64: &str, value: &str) -> Result<String, SecretError> {
    let raw = STANDARD
        .decode(public_key_b64.trim())
        .map_err(|err| SecretError::InvalidPublicKey(err.to_string()))?;
    let bytes: [u8; 32] = raw
        .try_into()
        .map_err(|raw: Vec<u8>| SecretError::InvalidPublicKey(format!("{} bytes", raw.len())))?;
    let public_key = PublicKey::from(bytes);
    let sealed = public_key
        .seal(&mut OsRng, value.as_bytes())
        .map_err(|_| SecretError::Encryption)?;
    Ok(STANDARD.encode(sealed))
}
