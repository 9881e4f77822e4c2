//! GitHub OAuth sign-in for the ClawCloud console.

mod challenge;
mod error;
mod markers;
mod orchestrator;
mod outcome;
mod region;
mod session;

pub use challenge::{ChallengeResult, VerificationChallenge, DEVICE_VERIFY_WAIT};
pub use error::LoginError;
pub use markers::{PageKind, FLASH_ERROR_SELECTOR, REGION_UNAVAILABLE_MARKER, REGION_UNAVAILABLE_SCRIPT};
pub use orchestrator::LoginOrchestrator;
pub use outcome::RunOutcome;
pub use region::{Region, RegionResolver};
pub use session::{Checkpoint, LogLevel, Session};
