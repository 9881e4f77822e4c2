use std::sync::Arc;

use tracing::{debug, warn};

use super::MessageChannel;

/// Fire-and-forget delivery to the operator chat.
///
/// Failures are logged and swallowed; with no channel configured, messages are
/// only logged.
#[derive(Clone, Default)]
pub struct Notifier {
    channel: Option<Arc<dyn MessageChannel>>,
}

impl Notifier {
    pub fn new(channel: Option<Arc<dyn MessageChannel>>) -> Self {
        Self { channel }
    }

    pub fn disabled() -> Self {
        Self { channel: None }
    }

    pub fn is_configured(&self) -> bool {
        self.channel.is_some()
    }

    pub fn channel(&self) -> Option<&Arc<dyn MessageChannel>> {
        self.channel.as_ref()
    }

    pub async fn send(&self, message: &str) {
        debug!(message, "notify");
        let Some(channel) = &self.channel else {
            return;
        };
        if let Err(err) = channel.send_text(message).await {
            warn!(error = %err, "failed to deliver notification");
        }
    }

    pub async fn photo(&self, png: Vec<u8>, caption: &str) {
        let Some(channel) = &self.channel else {
            return;
        };
        if let Err(err) = channel.send_photo(png, caption).await {
            warn!(error = %err, caption, "failed to deliver checkpoint photo");
        }
    }
}

/// Escape text interpolated into an HTML-formatted message.
pub fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
    out
}
