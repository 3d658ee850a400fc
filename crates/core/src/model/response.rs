use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{PollToken, QuestionId, ResponseId, SessionId, Topic};

/// What kind of poll a placeholder belongs to.
///
/// Dispatch on the kind happens exactly once, at the reconciliation entry
/// point; everything downstream only ever sees study-family placeholders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PollKind {
    Study,
    ExamDrill,
    Simulacro,
    Duel,
}

impl PollKind {
    /// Kinds handled by the study session engine.
    #[must_use]
    pub fn is_study_family(self) -> bool {
        matches!(self, PollKind::Study | PollKind::ExamDrill)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PollKind::Study => "study",
            PollKind::ExamDrill => "exam_drill",
            PollKind::Simulacro => "simulacro",
            PollKind::Duel => "duel",
        }
    }
}

/// Lifecycle state of a pending response.
///
/// Transitions are terminal and exclusive: `Pending -> Answered` or
/// `Pending -> TimedOut`, never both, never reversible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseState {
    Pending,
    Answered,
    TimedOut,
}

impl ResponseState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, ResponseState::Pending)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseState::Pending => "pending",
            ResponseState::Answered => "answered",
            ResponseState::TimedOut => "timed_out",
        }
    }
}

/// The winning terminal transition for a placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    Answered { selected: usize, correct: bool },
    TimedOut,
}

impl ResponseOutcome {
    #[must_use]
    pub fn state(self) -> ResponseState {
        match self {
            ResponseOutcome::Answered { .. } => ResponseState::Answered,
            ResponseOutcome::TimedOut => ResponseState::TimedOut,
        }
    }

    #[must_use]
    pub fn is_timeout(self) -> bool {
        matches!(self, ResponseOutcome::TimedOut)
    }
}

/// Raised when a terminal placeholder is asked to transition again.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("response already resolved to {0:?}")]
pub struct ResponseStateError(pub ResponseState);

/// The delivery receipt for exactly one delivered question.
///
/// Created only after the external channel accepted the poll; resolved
/// exactly once by the reconciler, never deleted while pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingResponse {
    id: ResponseId,
    session_id: SessionId,
    question_id: QuestionId,
    topic: Topic,
    kind: PollKind,
    token: PollToken,
    /// Position of this question within the session, 1-based.
    ordinal: u32,
    /// Index of the correct answer within the options as delivered, after
    /// shuffling. Answer callbacks report positions in this order.
    correct_index: u32,
    created_at: DateTime<Utc>,
    deadline_at: DateTime<Utc>,
    state: ResponseState,
    selected_option: Option<u32>,
    correct: Option<bool>,
    resolved_at: Option<DateTime<Utc>>,
}

impl PendingResponse {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        id: ResponseId,
        session_id: SessionId,
        question_id: QuestionId,
        topic: Topic,
        kind: PollKind,
        token: PollToken,
        ordinal: u32,
        correct_index: u32,
        created_at: DateTime<Utc>,
        deadline_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            session_id,
            question_id,
            topic,
            kind,
            token,
            ordinal,
            correct_index,
            created_at,
            deadline_at,
            state: ResponseState::Pending,
            selected_option: None,
            correct: None,
            resolved_at: None,
        }
    }

    /// Rehydrates a placeholder from storage without re-running transitions.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn from_persisted(
        id: ResponseId,
        session_id: SessionId,
        question_id: QuestionId,
        topic: Topic,
        kind: PollKind,
        token: PollToken,
        ordinal: u32,
        correct_index: u32,
        created_at: DateTime<Utc>,
        deadline_at: DateTime<Utc>,
        state: ResponseState,
        selected_option: Option<u32>,
        correct: Option<bool>,
        resolved_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id,
            session_id,
            question_id,
            topic,
            kind,
            token,
            ordinal,
            correct_index,
            created_at,
            deadline_at,
            state,
            selected_option,
            correct,
            resolved_at,
        }
    }

    #[must_use]
    pub fn id(&self) -> ResponseId {
        self.id
    }

    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    #[must_use]
    pub fn question_id(&self) -> QuestionId {
        self.question_id
    }

    #[must_use]
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    #[must_use]
    pub fn kind(&self) -> PollKind {
        self.kind
    }

    #[must_use]
    pub fn token(&self) -> &PollToken {
        &self.token
    }

    #[must_use]
    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    /// Position of the correct answer within the delivered options.
    #[must_use]
    pub fn correct_index(&self) -> u32 {
        self.correct_index
    }

    /// Whether an answer at `selected` hits the correct option.
    #[must_use]
    pub fn is_correct_selection(&self, selected: usize) -> bool {
        u32::try_from(selected).is_ok_and(|s| s == self.correct_index)
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn deadline_at(&self) -> DateTime<Utc> {
        self.deadline_at
    }

    #[must_use]
    pub fn state(&self) -> ResponseState {
        self.state
    }

    #[must_use]
    pub fn selected_option(&self) -> Option<u32> {
        self.selected_option
    }

    #[must_use]
    pub fn correct(&self) -> Option<bool> {
        self.correct
    }

    #[must_use]
    pub fn resolved_at(&self) -> Option<DateTime<Utc>> {
        self.resolved_at
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state == ResponseState::Pending
    }

    /// Applies a terminal transition.
    ///
    /// This is the domain-level half of the resolution contract; storage
    /// backends must pair it with a compare-and-set on the persisted state
    /// so only one resolver wins.
    ///
    /// # Errors
    ///
    /// Returns `ResponseStateError` when the placeholder is already terminal.
    pub fn resolve(
        &mut self,
        outcome: ResponseOutcome,
        resolved_at: DateTime<Utc>,
    ) -> Result<(), ResponseStateError> {
        if self.state.is_terminal() {
            return Err(ResponseStateError(self.state));
        }
        match outcome {
            ResponseOutcome::Answered { selected, correct } => {
                self.state = ResponseState::Answered;
                self.selected_option = u32::try_from(selected).ok();
                self.correct = Some(correct);
            }
            ResponseOutcome::TimedOut => {
                self.state = ResponseState::TimedOut;
                // Timeouts carry no selection and do not count toward accuracy.
                self.selected_option = None;
                self.correct = None;
            }
        }
        self.resolved_at = Some(resolved_at);
        Ok(())
    }
}
