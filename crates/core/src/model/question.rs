use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{QuestionId, Topic};

/// Errors raised while constructing a [`Question`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum QuestionError {
    #[error("question text is empty")]
    EmptyText,
    #[error("question has {0} options, at least 2 are required")]
    TooFewOptions(usize),
    #[error("correct option index {index} out of range for {len} options")]
    CorrectIndexOutOfRange { index: usize, len: usize },
}

/// One multiple-choice question from the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    id: QuestionId,
    topic: Topic,
    number: u32,
    text: String,
    options: Vec<String>,
    correct_index: usize,
}

impl Question {
    /// Creates a question, validating options and the correct-answer index.
    ///
    /// # Errors
    ///
    /// Returns `QuestionError` if the text is empty, fewer than two options
    /// are given, or the correct index does not address an option.
    pub fn new(
        id: QuestionId,
        topic: Topic,
        number: u32,
        text: impl Into<String>,
        options: Vec<String>,
        correct_index: usize,
    ) -> Result<Self, QuestionError> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(QuestionError::EmptyText);
        }
        if options.len() < 2 {
            return Err(QuestionError::TooFewOptions(options.len()));
        }
        if correct_index >= options.len() {
            return Err(QuestionError::CorrectIndexOutOfRange {
                index: correct_index,
                len: options.len(),
            });
        }
        Ok(Self {
            id,
            topic,
            number,
            text,
            options,
            correct_index,
        })
    }

    #[must_use]
    pub fn id(&self) -> QuestionId {
        self.id
    }

    #[must_use]
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Ordinal of the question within its source material.
    #[must_use]
    pub fn number(&self) -> u32 {
        self.number
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn options(&self) -> &[String] {
        &self.options
    }

    #[must_use]
    pub fn correct_index(&self) -> usize {
        self.correct_index
    }

    /// Whether the given selected option index is the correct answer.
    #[must_use]
    pub fn is_correct(&self, selected: usize) -> bool {
        selected == self.correct_index
    }
}
