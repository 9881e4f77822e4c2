use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

use super::{ChannelError, ChannelUpdate, MessageChannel};

const DEFAULT_API_BASE: &str = "https://api.telegram.org";
const USER_AGENT: &str = "clawlogin/0.1.0";
const CAPTION_LIMIT: usize = 1024;

/// Bot credentials and the single chat the bot talks to.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
}

impl TelegramConfig {
    /// Returns `None` unless both the token and the chat id are set.
    pub fn from_parts(bot_token: Option<String>, chat_id: Option<String>) -> Option<Self> {
        let bot_token = bot_token.filter(|value| !value.trim().is_empty())?;
        let chat_id = chat_id.filter(|value| !value.trim().is_empty())?;
        Some(Self { bot_token, chat_id })
    }
}

/// Telegram Bot API transport.
#[derive(Debug, Clone)]
pub struct TelegramClient {
    http: Client,
    api_base: Url,
    config: TelegramConfig,
}

impl TelegramClient {
    pub fn new(config: TelegramConfig) -> Result<Self, ChannelError> {
        Self::with_api_base(config, DEFAULT_API_BASE)
    }

    /// Build a client against a custom Bot API host (useful for testing).
    pub fn with_api_base(config: TelegramConfig, api_base: &str) -> Result<Self, ChannelError> {
        let api_base = Url::parse(api_base)?;
        let http = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self {
            http,
            api_base,
            config,
        })
    }

    fn method_url(&self, method: &str) -> Result<Url, ChannelError> {
        Ok(self
            .api_base
            .join(&format!("/bot{}/{method}", self.config.bot_token))?)
    }

    async fn decode<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ChannelError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChannelError::HttpStatus { status, body });
        }

        let envelope: ApiEnvelope<T> = response.json().await?;
        match (envelope.ok, envelope.result) {
            (true, Some(result)) => Ok(result),
            _ => Err(ChannelError::Rejected(
                envelope
                    .description
                    .unwrap_or_else(|| "no description".into()),
            )),
        }
    }
}

#[async_trait]
impl MessageChannel for TelegramClient {
    async fn send_text(&self, message: &str) -> Result<(), ChannelError> {
        let response = self
            .http
            .post(self.method_url("sendMessage")?)
            .json(&serde_json::json!({
                "chat_id": self.config.chat_id,
                "text": message,
                "parse_mode": "HTML",
            }))
            .timeout(Duration::from_secs(30))
            .send()
            .await?;
        self.decode::<serde_json::Value>(response).await?;
        Ok(())
    }

    async fn send_photo(&self, png: Vec<u8>, caption: &str) -> Result<(), ChannelError> {
        let caption: String = caption.chars().take(CAPTION_LIMIT).collect();
        let photo = Part::bytes(png)
            .file_name("checkpoint.png")
            .mime_str("image/png")?;
        let form = Form::new()
            .text("chat_id", self.config.chat_id.clone())
            .text("caption", caption)
            .part("photo", photo);

        let response = self
            .http
            .post(self.method_url("sendPhoto")?)
            .multipart(form)
            .timeout(Duration::from_secs(60))
            .send()
            .await?;
        self.decode::<serde_json::Value>(response).await?;
        Ok(())
    }

    async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout: Duration,
    ) -> Result<Vec<ChannelUpdate>, ChannelError> {
        let mut query = vec![("timeout", timeout.as_secs().to_string())];
        if let Some(offset) = offset {
            query.push(("offset", offset.to_string()));
        }

        let response = self
            .http
            .get(self.method_url("getUpdates")?)
            .query(&query)
            .timeout(timeout + Duration::from_secs(10))
            .send()
            .await?;

        let updates: Vec<RawUpdate> = self.decode(response).await?;
        Ok(updates.into_iter().map(RawUpdate::into_update).collect())
    }

    fn chat_id(&self) -> &str {
        &self.config.chat_id
    }
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawUpdate {
    update_id: i64,
    message: Option<RawMessage>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    chat: RawChat,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawChat {
    id: i64,
}

impl RawUpdate {
    fn into_update(self) -> ChannelUpdate {
        let (chat_id, text) = match self.message {
            Some(message) => (message.chat.id.to_string(), message.text.unwrap_or_default()),
            None => (String::new(), String::new()),
        };
        ChannelUpdate {
            id: self.update_id,
            chat_id,
            text,
        }
    }
}
