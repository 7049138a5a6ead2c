//! Error types for the cloaker.

use crate::detectors::Signal;
use thiserror::Error;

/// Errors raised inside the scoring pipeline.
///
/// None of these reach an HTTP caller: the engine downgrades signal errors to
/// absent signals and configuration errors to the safe default redirect.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CloakerError {
    /// An analyzer could not produce a score (timeout, missing telemetry).
    #[error("signal unavailable: {0}")]
    SignalUnavailable(Signal),

    /// A decision band has no redirect target, or the config is inconsistent.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Client-submitted payload could not be parsed.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// A counter store is full and refused to track a new key.
    #[error("store {store} is full ({capacity} entries)")]
    StoreFull { store: String, capacity: u64 },

    /// An evaluation was asked to move to a state it cannot reach.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, CloakerError>;
