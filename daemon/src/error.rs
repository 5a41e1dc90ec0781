use std::path::PathBuf;
use thiserror::Error;

/// Bad input from the requester. Answered with a re-prompt, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("Invalid URL")]
    InvalidUrl,
    #[error("Invalid time. Use HH:MM")]
    InvalidTime,
    #[error("End time must be after start time")]
    NonPositiveDuration,
    #[error("Max duration: {} hours", .max_minutes / 60)]
    DurationTooLong { max_minutes: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("You already have an active recording")]
    Conflict,
}

/// Why a job ended without an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Failure {
    #[error("engine failure: {0}")]
    Engine(String),
    #[error("conversion timed out")]
    ConversionTimeout,
    #[error("conversion failed: {0}")]
    Conversion(String),
}

/// Result of every pipeline stage, passed along by value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed(PathBuf),
    Failed(Failure),
    Cancelled,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Completed(_) => "completed",
            Outcome::Failed(_) => "failed",
            Outcome::Cancelled => "cancelled",
        }
    }
}
