use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{PendingResponse, ResponseState, SessionId, TopicSelector};

/// Errors raised while building a [`SessionSummary`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SummaryError {
    #[error("session resolved {resolved} questions but {responses} terminal responses exist")]
    CountMismatch { resolved: u32, responses: u32 },
    #[error("response in state {0:?} cannot enter a summary")]
    UnresolvedResponse(ResponseState),
}

/// End-of-session tally sent to the owner when the last question resolves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    session_id: SessionId,
    selector_label: String,
    total: u32,
    correct: u32,
    incorrect: u32,
    timed_out: u32,
}

impl SessionSummary {
    /// Tallies a finished session from its terminal responses.
    ///
    /// # Errors
    ///
    /// Returns `SummaryError::CountMismatch` if the response count disagrees
    /// with the session's resolved counter, and
    /// `SummaryError::UnresolvedResponse` if any response is still pending.
    pub fn from_responses(
        session_id: SessionId,
        selector: &TopicSelector,
        resolved: u32,
        responses: &[PendingResponse],
    ) -> Result<Self, SummaryError> {
        let count = u32::try_from(responses.len()).unwrap_or(u32::MAX);
        if count != resolved {
            return Err(SummaryError::CountMismatch {
                resolved,
                responses: count,
            });
        }
        let mut correct = 0;
        let mut incorrect = 0;
        let mut timed_out = 0;
        for response in responses {
            match response.state() {
                ResponseState::Answered => {
                    if response.correct() == Some(true) {
                        correct += 1;
                    } else {
                        incorrect += 1;
                    }
                }
                ResponseState::TimedOut => timed_out += 1,
                ResponseState::Pending => {
                    return Err(SummaryError::UnresolvedResponse(ResponseState::Pending));
                }
            }
        }
        Ok(Self {
            session_id,
            selector_label: selector.label(),
            total: resolved,
            correct,
            incorrect,
            timed_out,
        })
    }

    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    #[must_use]
    pub fn selector_label(&self) -> &str {
        &self.selector_label
    }

    #[must_use]
    pub fn total(&self) -> u32 {
        self.total
    }

    #[must_use]
    pub fn correct(&self) -> u32 {
        self.correct
    }

    #[must_use]
    pub fn incorrect(&self) -> u32 {
        self.incorrect
    }

    #[must_use]
    pub fn timed_out(&self) -> u32 {
        self.timed_out
    }

    /// Accuracy over answered questions; timeouts stay out of the
    /// denominator. `None` when every question timed out.
    #[must_use]
    pub fn accuracy(&self) -> Option<f64> {
        let answered = self.correct + self.incorrect;
        if answered == 0 {
            return None;
        }
        Some(f64::from(self.correct) / f64::from(answered))
    }
}
