//! Termination events posted by child runner tasks.
//!
//! Every started child posts exactly one event onto the supervisor's
//! channel. The status is a tagged variant so the supervisor never has to
//! match on error strings to tell an interrupt from a crash.

/// How a child process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Exited with status 0.
    Succeeded,
    /// Exited as a consequence of cancellation (SIGINT/SIGTERM).
    Interrupted,
    /// Exited non-zero, died on an unexpected signal, or never started.
    Failed { error: String },
}

/// One terminated child, as delivered to the supervisor's drain loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationEvent {
    pub name: String,
    pub termination: Termination,
}
