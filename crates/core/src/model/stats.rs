use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{QuestionId, ResponseOutcome};

/// Lifetime drill statistics for one (owner, topic) pair.
///
/// The storage layer keys rows by owner and topic together; one value of
/// this type never mixes two topics.
///
/// Accuracy is `correct / (correct + incorrect)`; timeouts are counted
/// separately and never enter the accuracy denominator. The streak only
/// moves on answered questions: a wrong answer resets it, a timeout leaves
/// it alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SubjectStats {
    resolved: u64,
    correct: u64,
    incorrect: u64,
    timed_out: u64,
    current_streak: u32,
    best_streak: u32,
    /// Questions served to the owner in the current pool cycle, whatever
    /// the outcome was.
    seen: HashSet<QuestionId>,
    last_study_at: Option<DateTime<Utc>>,
}

impl SubjectStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rehydrates stats from storage.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn from_persisted(
        resolved: u64,
        correct: u64,
        incorrect: u64,
        timed_out: u64,
        current_streak: u32,
        best_streak: u32,
        seen: HashSet<QuestionId>,
        last_study_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            resolved,
            correct,
            incorrect,
            timed_out,
            current_streak,
            best_streak,
            seen,
            last_study_at,
        }
    }

    #[must_use]
    pub fn resolved(&self) -> u64 {
        self.resolved
    }

    #[must_use]
    pub fn correct(&self) -> u64 {
        self.correct
    }

    #[must_use]
    pub fn incorrect(&self) -> u64 {
        self.incorrect
    }

    #[must_use]
    pub fn timed_out(&self) -> u64 {
        self.timed_out
    }

    #[must_use]
    pub fn current_streak(&self) -> u32 {
        self.current_streak
    }

    #[must_use]
    pub fn best_streak(&self) -> u32 {
        self.best_streak
    }

    #[must_use]
    pub fn seen(&self) -> &HashSet<QuestionId> {
        &self.seen
    }

    #[must_use]
    pub fn has_seen(&self, question: QuestionId) -> bool {
        self.seen.contains(&question)
    }

    #[must_use]
    pub fn last_study_at(&self) -> Option<DateTime<Utc>> {
        self.last_study_at
    }

    /// Accuracy over answered questions, in `[0, 1]`. `None` before the
    /// first answered question.
    #[must_use]
    pub fn accuracy(&self) -> Option<f64> {
        let answered = self.correct + self.incorrect;
        if answered == 0 {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        Some(self.correct as f64 / answered as f64)
    }

    /// Folds one resolved question into the totals. Every resolution marks
    /// the question as seen; wrong answers and timeouts exhaust the pool
    /// just like correct ones.
    pub fn apply(&mut self, question: QuestionId, outcome: ResponseOutcome, at: DateTime<Utc>) {
        self.resolved += 1;
        self.last_study_at = Some(at);
        self.seen.insert(question);
        match outcome {
            ResponseOutcome::Answered { correct: true, .. } => {
                self.correct += 1;
                self.current_streak += 1;
                self.best_streak = self.best_streak.max(self.current_streak);
            }
            ResponseOutcome::Answered { correct: false, .. } => {
                self.incorrect += 1;
                self.current_streak = 0;
            }
            ResponseOutcome::TimedOut => {
                self.timed_out += 1;
            }
        }
    }

    /// Forgets which questions have been served, so a fresh single-topic
    /// session can reuse an exhausted pool.
    pub fn reset_seen(&mut self) {
        self.seen.clear();
    }
}
