//! Poll rendering: sanitizing catalog options and composing the question
//! text so it fits the external channel's limits.
//!
//! Catalog options may carry grading-weight prefixes such as `%100%` or
//! `%-33.33333%` inherited from the import format; those are presentation
//! noise and are stripped before delivery.

use rand::Rng;
use rand::seq::SliceRandom;
use thiserror::Error;

use crate::model::Question;

/// Channel ceiling for one option's text.
pub const MAX_OPTION_LEN: usize = 100;
/// Channel ceiling for the composed question text.
pub const MAX_QUESTION_LEN: usize = 280;

const ELLIPSIS: &str = "...";

/// Errors raised while preparing a question for delivery.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PollRenderError {
    #[error("question has {0} usable options after sanitizing, at least 2 required")]
    TooFewOptions(usize),
    #[error("correct option was dropped during sanitizing")]
    CorrectOptionDropped,
}

/// A question rendered and ready to hand to the poll channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollDraft {
    text: String,
    options: Vec<String>,
    correct_index: usize,
}

impl PollDraft {
    /// Sanitizes, truncates, and shuffles a question into channel-ready form.
    ///
    /// Options are shuffled so the correct answer does not sit at a fixed
    /// position across deliveries; the returned `correct_index` tracks the
    /// shuffle.
    ///
    /// # Errors
    ///
    /// Returns `PollRenderError` when sanitizing leaves fewer than two
    /// usable options or drops the correct one.
    pub fn prepare<R: Rng + ?Sized>(
        question: &Question,
        header: &str,
        rng: &mut R,
    ) -> Result<Self, PollRenderError> {
        let (options, correct_index) =
            sanitize_options(question.options(), question.correct_index())?;
        let (options, correct_index) = shuffle_options(options, correct_index, rng);
        let text = compose_text(header, question.text());
        Ok(Self {
            text,
            options,
            correct_index,
        })
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn options(&self) -> &[String] {
        &self.options
    }

    /// Index of the correct answer within the shuffled options.
    #[must_use]
    pub fn correct_index(&self) -> usize {
        self.correct_index
    }
}

/// Strips weight prefixes, drops empty options, and truncates long ones.
///
/// Returns the cleaned options plus the correct answer's index after drops.
///
/// # Errors
///
/// Returns `PollRenderError::CorrectOptionDropped` when the correct option
/// becomes empty, and `PollRenderError::TooFewOptions` when fewer than two
/// options survive.
pub fn sanitize_options(
    raw: &[String],
    correct_index: usize,
) -> Result<(Vec<String>, usize), PollRenderError> {
    let mut options = Vec::with_capacity(raw.len());
    let mut new_correct = None;
    for (i, option) in raw.iter().enumerate() {
        let cleaned = strip_weight_prefix(option).trim().to_owned();
        if cleaned.is_empty() {
            if i == correct_index {
                return Err(PollRenderError::CorrectOptionDropped);
            }
            continue;
        }
        if i == correct_index {
            new_correct = Some(options.len());
        }
        options.push(truncate(&cleaned, MAX_OPTION_LEN));
    }
    if options.len() < 2 {
        return Err(PollRenderError::TooFewOptions(options.len()));
    }
    let correct = new_correct.ok_or(PollRenderError::CorrectOptionDropped)?;
    Ok((options, correct))
}

/// Shuffles options, returning the correct answer's new position.
pub fn shuffle_options<R: Rng + ?Sized>(
    options: Vec<String>,
    correct_index: usize,
    rng: &mut R,
) -> (Vec<String>, usize) {
    let mut order: Vec<usize> = (0..options.len()).collect();
    order.shuffle(rng);
    let mut shuffled = Vec::with_capacity(options.len());
    let mut new_correct = 0;
    let mut slots: Vec<Option<String>> = options.into_iter().map(Some).collect();
    for (position, &source) in order.iter().enumerate() {
        if source == correct_index {
            new_correct = position;
        }
        if let Some(option) = slots[source].take() {
            shuffled.push(option);
        }
    }
    (shuffled, new_correct)
}

/// Joins header and question text, truncating the question part so the
/// whole message fits the channel limit. The header is never truncated.
#[must_use]
pub fn compose_text(header: &str, body: &str) -> String {
    let body = body.trim();
    if header.is_empty() {
        return truncate(body, MAX_QUESTION_LEN);
    }
    let reserved = header.chars().count() + 1;
    let budget = MAX_QUESTION_LEN.saturating_sub(reserved).max(ELLIPSIS.len());
    format!("{header}\n{}", truncate(body, budget))
}

/// Strips a leading `%<number>%` grading-weight marker.
fn strip_weight_prefix(option: &str) -> &str {
    let trimmed = option.trim_start();
    let Some(rest) = trimmed.strip_prefix('%') else {
        return option;
    };
    let Some(end) = rest.find('%') else {
        return option;
    };
    let weight = &rest[..end];
    if !weight.is_empty()
        && weight
            .chars()
            .all(|c| c.is_ascii_digit() || c == '.' || c == '-')
    {
        &rest[end + 1..]
    } else {
        option
    }
}

/// Char-aware truncation with a trailing ellipsis.
fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_owned();
    }
    let keep = max.saturating_sub(ELLIPSIS.len());
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(ELLIPSIS);
    out
}
