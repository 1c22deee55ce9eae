//! Core error taxonomy.
//!
//! Everything the pool surfaces to the UI collaborator is one of these
//! structured variants; raw panics and stack traces never cross the
//! boundary.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the session pool and its collaborators.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Bad input, missing or uncreatable profile directory, broken config.
    #[error("configuration error: {0}")]
    Config(String),

    /// The reserved debugging port is still bound after stragglers were killed.
    #[error("debugging port {0} is busy")]
    PortBusy(u16),

    /// No usable browser binary on this machine.
    #[error("browser binary not found: {0}")]
    Toolchain(String),

    /// A navigation did not reach its target.
    #[error("navigation to {url} failed: {source}")]
    Navigation {
        url: String,
        #[source]
        source: chromiumoxide::error::CdpError,
    },

    /// Every candidate selector for a field was exhausted.
    #[error("no selector matched for `{field}` ({tried} candidates tried)")]
    Selector { field: String, tried: usize },

    /// The secret-question answer never arrived.
    #[error("secret answer was not supplied within {0:?}")]
    ChallengeTimeout(Duration),

    /// Solver transport failure.
    #[error("solver transport error: {0}")]
    Network(#[from] reqwest::Error),

    /// The solver answered, but with a semantic error.
    #[error("solver rejected the job: {0}")]
    Solver(String),

    /// The solver never produced coordinates in time.
    #[error("solver did not answer within {0:?}")]
    SolverTimeout(Duration),

    /// Coordinates came back but could not be replayed onto the page.
    #[error("coordinate replay failed: {0}")]
    Replay(String),

    #[error("account store error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error(transparent)]
    Cdp(#[from] chromiumoxide::error::CdpError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Fail-fast errors park the account as `disabled` instead of `error`.
    pub fn is_fatal_for_account(&self) -> bool {
        matches!(self, CoreError::Config(_) | CoreError::Toolchain(_))
    }
}

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, CoreError>;
