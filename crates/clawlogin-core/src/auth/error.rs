use thiserror::Error;

use super::RunOutcome;
use crate::browser::BrowserError;

/// Errors that end a sign-in run.
#[derive(Debug, Error)]
pub enum LoginError {
    #[error("GH_USERNAME and GH_PASSWORD must both be set")]
    CredentialsMissing,
    #[error("{0}")]
    LoginFailed(String),
    #[error("{0}")]
    ChallengeTimedOut(String),
    #[error("two-factor approval bounced back to the sign-in form")]
    ChallengeRejected,
    #[error("verification code input not found")]
    CodeInputMissing,
    #[error("redirect to the console did not complete within {0}s")]
    RedirectFailed(u64),
    #[error("REGION_NOT_AVAILABLE: the console refused this region")]
    RegionUnavailable,
    #[error("browser error: {0}")]
    Browser(#[from] BrowserError),
    #[error("unexpected failure: {0}")]
    Unhandled(String),
}

impl LoginError {
    /// Terminal outcome this error is reported as.
    pub fn outcome(&self) -> RunOutcome {
        match self {
            LoginError::CredentialsMissing => RunOutcome::CredentialsMissing,
            LoginError::LoginFailed(_)
            | LoginError::ChallengeRejected
            | LoginError::CodeInputMissing => RunOutcome::LoginFailed,
            LoginError::ChallengeTimedOut(_) => RunOutcome::ChallengeTimedOut,
            LoginError::RedirectFailed(_) => RunOutcome::RedirectFailed,
            LoginError::RegionUnavailable => RunOutcome::RegionUnavailable,
            LoginError::Browser(_) | LoginError::Unhandled(_) => RunOutcome::UnhandledException,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_onto_outcomes() {
        assert_eq!(
            LoginError::CodeInputMissing.outcome(),
            RunOutcome::LoginFailed
        );
        assert_eq!(
            LoginError::ChallengeTimedOut("late".into()).outcome(),
            RunOutcome::ChallengeTimedOut
        );
        assert_eq!(
            LoginError::Browser(BrowserError::Closed).outcome(),
            RunOutcome::UnhandledException
        );
        assert_eq!(
            LoginError::CredentialsMissing.outcome(),
            RunOutcome::CredentialsMissing
        );
        assert_ne!(
            LoginError::CodeInputMissing.to_string(),
            LoginError::ChallengeTimedOut("timed out".into()).to_string()
        );
    }
}
