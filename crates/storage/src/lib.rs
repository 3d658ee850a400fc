#![forbid(unsafe_code)]

pub mod repository;
pub mod sqlite;

pub use repository::{
    AnswerEvent, DegradedRecord, HistoryRepository, InMemoryRepository, QuestionRepository,
    ResolveOutcome, ResponseRepository, SessionRepository, StatsRepository, Storage, StorageError,
};
pub use sqlite::{SqliteInitError, SqliteRepository};
