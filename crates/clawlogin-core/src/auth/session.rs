use std::path::PathBuf;

use chrono::Local;
use tracing::{error, info, warn};

use super::RegionResolver;
use crate::browser::Browser;
use crate::config::ArtifactLocator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Success,
    Warn,
    Error,
    Step,
}

impl LogLevel {
    fn icon(self) -> &'static str {
        match self {
            LogLevel::Info => "ℹ️",
            LogLevel::Success => "✅",
            LogLevel::Warn => "⚠️",
            LogLevel::Error => "❌",
            LogLevel::Step => "🔹",
        }
    }
}

/// A screenshot written to the local artifact directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub path: PathBuf,
    pub label: String,
}

impl Checkpoint {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.label.clone())
    }
}

/// Mutable state of one run, owned by the orchestrator.
#[derive(Debug)]
pub struct Session {
    username: String,
    logs: Vec<String>,
    checkpoints: Vec<Checkpoint>,
    counter: u32,
    artifacts: ArtifactLocator,
    pub region: RegionResolver,
}

impl Session {
    pub fn new(username: impl Into<String>, artifacts: ArtifactLocator, region: RegionResolver) -> Self {
        Self {
            username: username.into(),
            logs: Vec::new(),
            checkpoints: Vec::new(),
            counter: 0,
            artifacts,
            region,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Record a run log line and mirror it to `tracing`.
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Warn => warn!("{message}"),
            LogLevel::Error => error!("{message}"),
            _ => info!("{message}"),
        }
        let time = Local::now().format("%H:%M:%S");
        self.logs.push(format!("[{time}] {} {message}", level.icon()));
    }

    pub fn recent_logs(&self, count: usize) -> &[String] {
        &self.logs[self.logs.len().saturating_sub(count)..]
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    pub(crate) fn take_checkpoints(&mut self) -> Vec<Checkpoint> {
        std::mem::take(&mut self.checkpoints)
    }

    /// Screenshot the page into the artifact directory. Capture failures are
    /// logged and yield `None`.
    pub async fn checkpoint<B: Browser + ?Sized>(&mut self, browser: &B, label: &str) -> Option<Checkpoint> {
        self.counter += 1;
        let path = self.artifacts.checkpoint_file(self.counter, label);

        let bytes = match browser.screenshot().await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(label, error = %err, "screenshot failed");
                return None;
            }
        };
        if let Err(err) = tokio::fs::write(&path, bytes).await {
            warn!(path = %path.display(), error = %err, "failed to write checkpoint");
            return None;
        }

        let checkpoint = Checkpoint {
            path,
            label: label.to_owned(),
        };
        self.checkpoints.push(checkpoint.clone());
        Some(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoginEndpoints;
    use crate::testing::FakeBrowser;
    use tempfile::TempDir;

    fn session(dir: &TempDir) -> Session {
        Session::new(
            "ada",
            ArtifactLocator::at(dir.path()).unwrap(),
            RegionResolver::new(&LoginEndpoints::default()),
        )
    }

    #[test]
    fn recent_logs_keep_order_and_icons() {
        let dir = TempDir::new().unwrap();
        let mut session = session(&dir);
        for i in 0..8 {
            session.log(LogLevel::Info, format!("line {i}"));
        }
        session.log(LogLevel::Error, "boom");

        let recent = session.recent_logs(6);
        assert_eq!(recent.len(), 6);
        assert!(recent[0].ends_with("line 3"));
        assert!(recent[5].contains("❌ boom"));
    }

    #[tokio::test]
    async fn checkpoints_are_numbered_files() {
        let dir = TempDir::new().unwrap();
        let mut session = session(&dir);
        let browser = FakeBrowser::new("https://console.run.claw.cloud/signin");

        let first = session.checkpoint(&browser, "entry").await.unwrap();
        let second = session.checkpoint(&browser, "after click").await.unwrap();

        assert_eq!(first.file_name(), "01_entry.png");
        assert_eq!(second.file_name(), "02_after_click.png");
        assert_eq!(std::fs::read(&second.path).unwrap(), b"png");
        assert_eq!(session.checkpoints().len(), 2);
    }
}
