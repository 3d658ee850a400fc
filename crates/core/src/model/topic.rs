use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised while constructing a [`Topic`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TopicError {
    #[error("topic name is empty")]
    Empty,
    #[error("topic name `{0}` contains invalid characters")]
    InvalidChars(String),
}

/// A question-pool identifier (one subject area of the catalog).
///
/// Topics are lowercase ascii identifiers; construction normalizes case so
/// lookups never miss on capitalization.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Topic(String);

impl Topic {
    /// Creates a topic, normalizing to lowercase.
    ///
    /// # Errors
    ///
    /// Returns `TopicError::Empty` for blank input and
    /// `TopicError::InvalidChars` for anything outside `[a-z0-9_]`.
    pub fn new(name: impl AsRef<str>) -> Result<Self, TopicError> {
        let normalized = name.as_ref().trim().to_ascii_lowercase();
        if normalized.is_empty() {
            return Err(TopicError::Empty);
        }
        if !normalized
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(TopicError::InvalidChars(normalized));
        }
        Ok(Self(normalized))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Topic {
    type Error = TopicError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Topic::new(value)
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.0
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", self.0)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which failure history a retry-pool session draws from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailedScope {
    /// Failures across every topic.
    All,
    /// Failures within a single topic.
    Topic(Topic),
}

impl FailedScope {
    /// The topic this scope narrows to, if any.
    #[must_use]
    pub fn topic(&self) -> Option<&Topic> {
        match self {
            FailedScope::All => None,
            FailedScope::Topic(t) => Some(t),
        }
    }
}

/// How a session picks its questions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopicSelector {
    /// Fresh questions from one topic.
    Single(Topic),
    /// Previously-failed questions that have not graduated.
    Failed(FailedScope),
    /// Questions distributed evenly across every topic.
    Random,
}

impl TopicSelector {
    /// Returns true for retry-pool sessions.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, TopicSelector::Failed(_))
    }

    /// A short label used in progress and summary text.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            TopicSelector::Single(topic) => topic.to_string(),
            TopicSelector::Failed(FailedScope::All) => "failed (all topics)".to_owned(),
            TopicSelector::Failed(FailedScope::Topic(topic)) => format!("failed ({topic})"),
            TopicSelector::Random => "random (all topics)".to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_normalizes_case_and_whitespace() {
        let topic = Topic::new("  Constitucion ").unwrap();
        assert_eq!(topic.as_str(), "constitucion");
    }

    #[test]
    fn topic_rejects_empty_and_invalid() {
        assert_eq!(Topic::new("   "), Err(TopicError::Empty));
        assert!(matches!(
            Topic::new("bad topic!"),
            Err(TopicError::InvalidChars(_))
        ));
    }

    #[test]
    fn selector_labels() {
        let t = Topic::new("armada").unwrap();
        assert_eq!(TopicSelector::Single(t.clone()).label(), "armada");
        assert_eq!(
            TopicSelector::Failed(FailedScope::Topic(t)).label(),
            "failed (armada)"
        );
        assert_eq!(TopicSelector::Random.label(), "random (all topics)");
    }
}
