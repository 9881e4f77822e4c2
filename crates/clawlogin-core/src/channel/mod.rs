//! Operator messaging channel: notifications out, one-time codes in.

mod notifier;
mod relay;
mod telegram;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;

pub use notifier::{escape_html, Notifier};
pub use relay::CodeRelay;
pub use telegram::{TelegramClient, TelegramConfig};

/// Errors returned by messaging channel transports.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP status {status} body: {body}")]
    HttpStatus { status: StatusCode, body: String },
    #[error("channel rejected request: {0}")]
    Rejected(String),
    #[error("invalid channel endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
}

/// One inbound message as seen by the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUpdate {
    pub id: i64,
    pub chat_id: String,
    pub text: String,
}

/// Transport for a single operator chat.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    async fn send_text(&self, message: &str) -> Result<(), ChannelError>;

    async fn send_photo(&self, png: Vec<u8>, caption: &str) -> Result<(), ChannelError>;

    /// Fetch updates with id `>= offset`, long-polling up to `timeout`.
    async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout: Duration,
    ) -> Result<Vec<ChannelUpdate>, ChannelError>;

    /// Chat the operator talks from; messages from any other chat are ignored.
    fn chat_id(&self) -> &str;
}
