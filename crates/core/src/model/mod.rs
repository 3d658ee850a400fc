mod ids;
mod question;
mod response;
mod session;
mod stats;
mod summary;
mod topic;

pub use ids::{OwnerId, ParseIdError, PollToken, QuestionId, ResponseId, SessionId};
pub use question::{Question, QuestionError};
pub use response::{PendingResponse, PollKind, ResponseOutcome, ResponseState, ResponseStateError};
pub use session::{CancelReason, Session, SessionError, SessionStatus};
pub use stats::SubjectStats;
pub use summary::{SessionSummary, SummaryError};
pub use topic::{FailedScope, Topic, TopicError, TopicSelector};
