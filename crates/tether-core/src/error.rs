use std::time::Duration;

use thiserror::Error;

/// Errors that can cross the harness boundary.
///
/// Transient probe outcomes never appear here; they only feed the readiness
/// loop and, if they persist, end up summarized in
/// [`HarnessError::ReadinessTimeout`].
#[derive(Debug, Error)]
pub enum HarnessError {
    /// The subordinate process could not be started.
    #[error("failed to launch {program:?}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The deadline elapsed without a `Ready` probe result.
    #[error(
        "{probe} not ready after {deadline:?} ({attempts} attempts, last outcome: {last_outcome})"
    )]
    ReadinessTimeout {
        probe: String,
        deadline: Duration,
        attempts: u32,
        last_outcome: String,
    },

    /// The acquisition was cancelled through its cancellation token.
    #[error("acquisition of {program:?} was cancelled")]
    Cancelled { program: String },

    /// A launch spec or probe violated one of its construction invariants.
    #[error("invalid harness spec: {0}")]
    InvalidSpec(String),
}

impl HarnessError {
    /// `true` for [`HarnessError::Launch`].
    pub fn is_launch(&self) -> bool {
        matches!(self, Self::Launch { .. })
    }

    /// `true` for [`HarnessError::ReadinessTimeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ReadinessTimeout { .. })
    }
}
