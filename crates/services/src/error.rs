//! Shared error types for the services crate.

use thiserror::Error;

use drill_core::model::{QuestionError, SessionError as SessionStateError, SummaryError};
use storage::repository::StorageError;
use storage::sqlite::SqliteInitError;

use crate::channel::ChannelError;

/// Errors emitted by `SessionManager`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SessionError {
    #[error("question count {0} outside allowed range")]
    InvalidCount(u32),
    #[error("unknown topic: {0}")]
    UnknownTopic(String),
    #[error("no study history yet")]
    NeverStudied,
    #[error("no failed questions left to retry")]
    NothingToRetry,
    #[error("no active session")]
    NoActiveSession,
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    #[error(transparent)]
    State(#[from] SessionStateError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors emitted by `DeliveryCoordinator`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DeliveryError {
    #[error("no deliverable question after {0} attempts")]
    Exhausted(u32),
    #[error("question pool is empty")]
    PoolEmpty,
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Question(#[from] QuestionError),
    #[error(transparent)]
    State(#[from] SessionStateError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors emitted by `CallbackReconciler`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReconcileError {
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    #[error(transparent)]
    Summary(#[from] SummaryError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors emitted while bootstrapping the engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    #[error(transparent)]
    Sqlite(#[from] SqliteInitError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Session(#[from] SessionError),
}
