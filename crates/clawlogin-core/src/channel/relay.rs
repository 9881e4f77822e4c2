use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::MessageChannel;

const MIN_POLL: Duration = Duration::from_secs(1);

fn code_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^/code\s+([0-9]{6,8})$").expect("valid code pattern"))
}

/// Extract the digits from a `/code 123456` command, if `text` is one.
pub(crate) fn parse_code(text: &str) -> Option<String> {
    code_pattern()
        .captures(text.trim())
        .map(|captures| captures[1].to_owned())
}

/// Waits for an operator to relay a one-time code through the channel.
#[derive(Clone)]
pub struct CodeRelay {
    channel: Arc<dyn MessageChannel>,
    poll: Duration,
    backoff: Duration,
}

impl CodeRelay {
    pub fn new(channel: Arc<dyn MessageChannel>, poll: Duration, backoff: Duration) -> Self {
        Self {
            channel,
            poll,
            backoff,
        }
    }

    /// Offset one past the newest message currently visible, so that anything
    /// already sent is never consumed as a fresh code.
    async fn flush_backlog(&self) -> Option<i64> {
        match self.channel.get_updates(None, Duration::ZERO).await {
            Ok(updates) => updates.iter().map(|update| update.id + 1).max(),
            Err(err) => {
                warn!(error = %err, "failed to flush message backlog");
                None
            }
        }
    }

    /// Block until a matching `/code` message arrives from the operator chat
    /// or `deadline` elapses.
    pub async fn wait_for_code(&self, deadline: Duration) -> Option<String> {
        let expires_at = Instant::now() + deadline;
        let mut offset = self.flush_backlog().await;
        debug!(?offset, "message backlog flushed");

        loop {
            let now = Instant::now();
            if now >= expires_at {
                return None;
            }
            let poll = self.poll.min(expires_at - now).max(MIN_POLL);

            match self.channel.get_updates(offset, poll).await {
                Ok(updates) => {
                    for update in updates {
                        offset = Some(update.id + 1);
                        if update.chat_id != self.channel.chat_id() {
                            continue;
                        }
                        if let Some(code) = parse_code(&update.text) {
                            info!(update_id = update.id, "verification code received");
                            return Some(code);
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "polling for verification code failed");
                    tokio::time::sleep(self.backoff).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelUpdate;
    use crate::testing::FakeChannel;

    fn update(id: i64, chat: &str, text: &str) -> ChannelUpdate {
        ChannelUpdate {
            id,
            chat_id: chat.into(),
            text: text.into(),
        }
    }

    fn relay(channel: &FakeChannel) -> CodeRelay {
        CodeRelay::new(
            Arc::new(channel.clone()),
            Duration::from_secs(20),
            Duration::from_secs(2),
        )
    }

    #[test]
    fn code_pattern_is_strict() {
        assert_eq!(parse_code("/code 123456").as_deref(), Some("123456"));
        assert_eq!(parse_code("  /code\t12345678 ").as_deref(), Some("12345678"));
        assert_eq!(parse_code("/code 12345"), None);
        assert_eq!(parse_code("/code 123456789"), None);
        assert_eq!(parse_code("code 123456"), None);
        assert_eq!(parse_code("/code 123456 please"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_backlog_is_never_consumed() {
        let channel = FakeChannel::new("42");
        channel.push(update(1, "42", "/code 111111"));
        channel.push(update(2, "42", "/code 222222"));
        channel.push_after_flush(update(3, "42", "/code 333333"));

        let code = relay(&channel).wait_for_code(Duration::from_secs(120)).await;

        assert_eq!(code.as_deref(), Some("333333"));
    }

    #[tokio::test(start_paused = true)]
    async fn other_chats_and_chatter_are_skipped() {
        let channel = FakeChannel::new("42");
        channel.push_after_flush(update(10, "99", "/code 999999"));
        channel.push_after_flush(update(11, "42", "hello"));
        channel.push_after_flush(update(12, "42", "/code 654321"));

        let code = relay(&channel).wait_for_code(Duration::from_secs(60)).await;

        assert_eq!(code.as_deref(), Some("654321"));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_without_code_returns_none() {
        let channel = FakeChannel::new("42");
        let started = Instant::now();

        let code = relay(&channel).wait_for_code(Duration::from_secs(30)).await;

        assert!(code.is_none());
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(started.elapsed() < Duration::from_secs(32));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_back_off_and_retry() {
        let channel = FakeChannel::new("42");
        channel.fail_next_polls(2);
        channel.push_after_flush(update(5, "42", "/code 246810"));

        let started = Instant::now();
        let code = relay(&channel).wait_for_code(Duration::from_secs(60)).await;

        assert_eq!(code.as_deref(), Some("246810"));
        assert!(started.elapsed() >= Duration::from_secs(4));
    }
}
