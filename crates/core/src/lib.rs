#![forbid(unsafe_code)]

pub mod model;
pub mod poll;
pub mod time;

pub use time::Clock;

pub use model::{
    CancelReason, FailedScope, OwnerId, PendingResponse, PollKind, PollToken, Question,
    QuestionError, QuestionId, ResponseId, ResponseOutcome, ResponseState, Session, SessionId,
    SessionStatus, SessionSummary, SubjectStats, Topic, TopicError, TopicSelector,
};
