//! Error types for the scheduling engine.
//!
//! One variant per failure kind, `#[from]` conversions at the edges, and a
//! `Categorizable` trait so callers (mainly the processor) can decide whether
//! a failure is worth a retry or should halt the affected job outright.

use thiserror::Error;

/// Errors raised by the scheduling engine itself (not by user handlers,
/// which report failure as a value via [`crate::job::Job::fail`]).
#[derive(Debug, Error)]
pub enum TaskloomError {
    #[error("invalid repeat interval: {0}")]
    InvalidRepeatInterval(String),

    #[error("invalid repeat-at phrase: {0}")]
    InvalidRepeatAt(String),

    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("invalid date phrase: {0}")]
    InvalidDatePhrase(String),

    #[error("no handler defined for job name {0:?}")]
    UndefinedJobName(String),

    #[error("job has no id; save it before this operation")]
    MissingId,

    #[error("repository error: {0}")]
    Repository(#[source] anyhow::Error),

    #[error("notification channel error: {0}")]
    Notification(#[source] anyhow::Error),

    #[error("scheduler is stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, TaskloomError>;

/// Error-kind classification used by the processor and by drivers to decide
/// retry-vs-halt behaviour without each call site re-deriving it.
pub trait Categorizable {
    fn category(&self) -> SafeErrorCategory;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafeErrorCategory {
    /// Transient: surface as an `error` event, next poll tick will retry.
    Transient,
    /// Fatal to the affected record: record `fail()`, no automatic retry.
    Fatal,
}

impl Categorizable for TaskloomError {
    fn category(&self) -> SafeErrorCategory {
        match self {
            TaskloomError::Repository(_) | TaskloomError::Notification(_) => {
                SafeErrorCategory::Transient
            }
            _ => SafeErrorCategory::Fatal,
        }
    }
}
