use std::sync::OnceLock;

use regex::Regex;
use tracing::{info, warn};
use url::Url;

use super::markers::host_within;
use crate::config::LoginEndpoints;

/// Classification of one post-redirect URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Region {
    /// Named region shard, e.g. `ap-southeast-1`.
    Shard(String),
    /// Main console host or anything that names no region.
    Default,
}

fn region_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z]{2,}-[a-z]+-[0-9]+$").expect("valid region pattern"))
}

/// Tracks the detected region and the base URL later navigation is built on.
///
/// A detected region is sticky: only another detection can replace it.
#[derive(Debug, Clone)]
pub struct RegionResolver {
    destination_domain: String,
    region_domain: String,
    default_label: String,
    fallback: Url,
    region: Option<String>,
    base_url: Option<Url>,
}

impl RegionResolver {
    pub fn new(endpoints: &LoginEndpoints) -> Self {
        Self {
            destination_domain: endpoints.destination_domain.clone(),
            region_domain: endpoints.region_domain.clone(),
            default_label: endpoints.default_region_label.clone(),
            fallback: endpoints.entry_url.clone(),
            region: None,
            base_url: None,
        }
    }

    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    /// Base for keepalive navigation, falling back to the entry URL.
    pub fn base_url(&self) -> &Url {
        self.base_url.as_ref().unwrap_or(&self.fallback)
    }

    pub fn resolve(&mut self, raw: &str) -> Region {
        let url = match Url::parse(raw) {
            Ok(url) => url,
            Err(err) => {
                warn!(url = raw, error = %err, "region detection skipped: unparseable URL");
                return Region::Default;
            }
        };
        let Some(host) = url.host_str().map(str::to_owned) else {
            warn!(url = raw, "region detection skipped: URL has no host");
            return Region::Default;
        };
        if !host_within(&host, &self.destination_domain) {
            warn!(url = raw, "region detection skipped: not a console host");
            return Region::Default;
        }

        if let Some(label) = self.shard_label(&host) {
            let origin = origin_of(&url);
            info!(region = %label, base = %origin, "region detected");
            self.region = Some(label.clone());
            self.base_url = Some(origin);
            return Region::Shard(label);
        }

        if let Some(id) = path_region(&url) {
            match Url::parse(&format!("https://{id}.{}", self.region_domain)) {
                Ok(base) => {
                    info!(region = %id, base = %base, "region detected from path");
                    self.region = Some(id.clone());
                    self.base_url = Some(base);
                    return Region::Shard(id);
                }
                Err(err) => warn!(region = %id, error = %err, "ignoring unusable region id"),
            }
        }

        if self.region.is_none() {
            let origin = origin_of(&url);
            info!(base = %origin, "no region shard, using current host");
            self.base_url = Some(origin);
        }
        Region::Default
    }

    /// `<label>.<region domain>` with a single non-default label.
    fn shard_label(&self, host: &str) -> Option<String> {
        let label = host.strip_suffix(&self.region_domain)?.strip_suffix('.')?;
        if label.is_empty() || label.contains('.') || label == self.default_label {
            return None;
        }
        Some(label.to_owned())
    }
}

fn origin_of(url: &Url) -> Url {
    let mut origin = url.clone();
    origin.set_path("");
    origin.set_query(None);
    origin.set_fragment(None);
    origin
}

/// Region id from a `/region/<id>` or `/r/<id>` path.
fn path_region(url: &Url) -> Option<String> {
    let mut segments = url.path_segments()?;
    while let Some(segment) = segments.next() {
        if segment == "region" || segment == "r" {
            let id = segments.next()?;
            return region_id_pattern().is_match(id).then(|| id.to_owned());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> RegionResolver {
        RegionResolver::new(&LoginEndpoints::default())
    }

    #[test]
    fn default_label_yields_no_region() {
        let mut resolver = resolver();
        assert_eq!(resolver.resolve("https://console.console.claw.cloud/"), Region::Default);
        assert_eq!(resolver.region(), None);
    }

    #[test]
    fn shard_label_becomes_region_and_base() {
        let mut resolver = resolver();
        let region = resolver.resolve("https://ap-southeast-1.console.claw.cloud/apps?x=1");
        assert_eq!(region, Region::Shard("ap-southeast-1".into()));
        assert_eq!(resolver.region(), Some("ap-southeast-1"));
        assert_eq!(
            resolver.base_url().as_str(),
            "https://ap-southeast-1.console.claw.cloud/"
        );
    }

    #[test]
    fn detected_region_survives_later_misses() {
        let mut resolver = resolver();
        resolver.resolve("https://eu-central-1.console.claw.cloud/");
        resolver.resolve("::not a url::");
        resolver.resolve("https://console.run.claw.cloud/");
        resolver.resolve("https://github.com/");
        assert_eq!(resolver.region(), Some("eu-central-1"));
        assert_eq!(
            resolver.base_url().as_str(),
            "https://eu-central-1.console.claw.cloud/"
        );
    }

    #[test]
    fn bare_console_host_sets_base_without_region() {
        let mut resolver = resolver();
        assert_eq!(resolver.base_url().as_str(), "https://console.run.claw.cloud/");
        resolver.resolve("https://claw.cloud/dashboard");
        assert_eq!(resolver.region(), None);
        assert_eq!(resolver.base_url().as_str(), "https://claw.cloud/");
    }

    #[test]
    fn path_segment_names_region() {
        let mut resolver = resolver();
        let region = resolver.resolve("https://console.run.claw.cloud/region/us-west-2/apps");
        assert_eq!(region, Region::Shard("us-west-2".into()));
        assert_eq!(resolver.base_url().as_str(), "https://us-west-2.console.claw.cloud/");

        let mut other = RegionResolver::new(&LoginEndpoints::default());
        assert_eq!(other.resolve("https://console.run.claw.cloud/r/apps"), Region::Default);
    }
}
