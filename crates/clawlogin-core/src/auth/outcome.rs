use std::fmt;

/// Terminal result of one sign-in run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    CredentialsMissing,
    LoginFailed,
    ChallengeTimedOut,
    RedirectFailed,
    RegionUnavailable,
    UnhandledException,
}

impl RunOutcome {
    pub fn is_success(self) -> bool {
        self == RunOutcome::Success
    }

    /// Process exit status: zero only on success.
    pub fn exit_code(self) -> u8 {
        match self {
            RunOutcome::Success => 0,
            RunOutcome::CredentialsMissing => 2,
            RunOutcome::LoginFailed => 3,
            RunOutcome::ChallengeTimedOut => 4,
            RunOutcome::RedirectFailed => 5,
            RunOutcome::RegionUnavailable => 6,
            RunOutcome::UnhandledException => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::CredentialsMissing => "credentials missing",
            RunOutcome::LoginFailed => "login failed",
            RunOutcome::ChallengeTimedOut => "challenge timed out",
            RunOutcome::RedirectFailed => "redirect failed",
            RunOutcome::RegionUnavailable => "region unavailable",
            RunOutcome::UnhandledException => "unhandled exception",
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_success_exits_zero() {
        let all = [
            RunOutcome::Success,
            RunOutcome::CredentialsMissing,
            RunOutcome::LoginFailed,
            RunOutcome::ChallengeTimedOut,
            RunOutcome::RedirectFailed,
            RunOutcome::RegionUnavailable,
            RunOutcome::UnhandledException,
        ];
        for outcome in all {
            assert_eq!(outcome.exit_code() == 0, outcome.is_success(), "{outcome}");
        }
    }
}
