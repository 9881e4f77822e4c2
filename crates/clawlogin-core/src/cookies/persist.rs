use tracing::{info, warn};

use super::{CookieError, CookieJar};
use crate::channel::{escape_html, Notifier};
use crate::secrets::SecretStore;

/// Where a persisted jar ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// Written to the secret store.
    SecretUpdated,
    /// Secret store unavailable; the serialized jar was sent to the operator.
    RelayedToOperator,
    /// Nothing to persist.
    Empty,
}

/// Store `jar` under its family's secret name, falling back to handing it to
/// the operator. Exactly one of the two paths is taken.
pub async fn persist_jar(
    jar: &CookieJar,
    secrets: Option<&dyn SecretStore>,
    notifier: &Notifier,
) -> Result<PersistOutcome, CookieError> {
    if jar.is_empty() {
        return Ok(PersistOutcome::Empty);
    }

    let family = jar.family();
    let name = family.secret_name();
    let value = jar.to_json()?;
    info!(secret = name, cookies = jar.len(), bytes = value.len(), "persisting cookie jar");

    if let Some(store) = secrets {
        match store.write(name, &value).await {
            Ok(()) => {
                info!(secret = name, "secret updated");
                notifier
                    .send(&format!(
                        "🍪 <b>{} cookies updated automatically</b>\n\n{name} saved",
                        family.label()
                    ))
                    .await;
                return Ok(PersistOutcome::SecretUpdated);
            }
            Err(err) => warn!(secret = name, error = %err, "secret write failed, relaying to operator"),
        }
    }

    notifier
        .send(&format!(
            "🍪 <b>New {} cookies</b>\n\nPlease update secret <b>{name}</b> (tap to reveal):\n<tg-spoiler>{}</tg-spoiler>",
            family.label(),
            escape_html(&value)
        ))
        .await;
    Ok(PersistOutcome::RelayedToOperator)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cookies::{Cookie, CookieFamily};
    use crate::testing::{FakeChannel, MemorySecretStore};

    fn jar(family: CookieFamily) -> CookieJar {
        CookieJar::from_cookies(family, vec![Cookie::session("sid", "a<b", ".run.claw.cloud")])
    }

    fn notifier(channel: &FakeChannel) -> Notifier {
        Notifier::new(Some(Arc::new(channel.clone())))
    }

    #[tokio::test]
    async fn secret_write_success_only_notifies() {
        let channel = FakeChannel::new("42");
        let store = MemorySecretStore::default();

        let outcome = persist_jar(&jar(CookieFamily::Destination), Some(&store), &notifier(&channel))
            .await
            .unwrap();

        assert_eq!(outcome, PersistOutcome::SecretUpdated);
        assert_eq!(store.written_names(), vec!["CLAW_COOKIES".to_owned()]);
        let texts = channel.sent_texts();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].contains("updated automatically"));
        assert!(!texts[0].contains("tg-spoiler"));
    }

    #[tokio::test]
    async fn failed_write_relays_escaped_jar() {
        let channel = FakeChannel::new("42");
        let store = MemorySecretStore::failing();

        let outcome = persist_jar(
            &jar(CookieFamily::IdentityProvider),
            Some(&store),
            &notifier(&channel),
        )
        .await
        .unwrap();

        assert_eq!(outcome, PersistOutcome::RelayedToOperator);
        let texts = channel.sent_texts();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].contains("<b>GH_COOKIES</b>"));
        assert!(texts[0].contains("a&lt;b"));
        assert!(!texts[0].contains("updated automatically"));
    }

    #[tokio::test]
    async fn missing_store_relays_and_empty_jar_is_skipped() {
        let channel = FakeChannel::new("42");

        let relayed = persist_jar(&jar(CookieFamily::Destination), None, &notifier(&channel))
            .await
            .unwrap();
        let empty = persist_jar(
            &CookieJar::empty(CookieFamily::Destination),
            None,
            &notifier(&channel),
        )
        .await
        .unwrap();

        assert_eq!(relayed, PersistOutcome::RelayedToOperator);
        assert_eq!(empty, PersistOutcome::Empty);
        assert_eq!(channel.sent_texts().len(), 1);
    }
}
