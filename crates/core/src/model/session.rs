use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{OwnerId, QuestionId, SessionId, TopicSelector};

/// Errors raised by session state transitions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SessionError {
    #[error("session is {0:?}, expected Active")]
    NotActive(SessionStatus),
    #[error("session already resolved all {0} questions")]
    AlreadyComplete(u32),
}

/// Why a session ended before resolving its full target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    /// The owner asked to stop.
    UserRequested,
    /// A newer session for the same owner replaced this one.
    Superseded,
    /// Delivery gave up after exhausting substitute questions.
    DeliveryFailed,
}

impl CancelReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CancelReason::UserRequested => "user_requested",
            CancelReason::Superseded => "superseded",
            CancelReason::DeliveryFailed => "delivery_failed",
        }
    }
}

/// Lifecycle state of a session.
///
/// `Active` is the only state that accepts deliveries; the other three are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Active,
    Completed,
    Cancelled,
    Expired,
}

impl SessionStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::Active)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Expired => "expired",
        }
    }
}

/// One owner's drill run: a target count of questions delivered one at a
/// time, with at most one question outstanding at any moment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    id: SessionId,
    owner: OwnerId,
    selector: TopicSelector,
    target: u32,
    resolved: u32,
    status: SessionStatus,
    cancel_reason: Option<CancelReason>,
    started_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    /// Questions already delivered, in delivery order. Also serves as the
    /// repeat-exclusion set for the next pick.
    delivered: Vec<QuestionId>,
    /// Pre-planned question list for retry-pool and random sessions; empty
    /// for single-topic sessions, which pick lazily.
    planned: Vec<QuestionId>,
}

impl Session {
    #[must_use]
    pub fn new(
        id: SessionId,
        owner: OwnerId,
        selector: TopicSelector,
        target: u32,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            owner,
            selector,
            target,
            resolved: 0,
            status: SessionStatus::Active,
            cancel_reason: None,
            started_at,
            last_activity_at: started_at,
            delivered: Vec::new(),
            planned: Vec::new(),
        }
    }

    /// Rehydrates a session from storage without re-running transitions.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn from_persisted(
        id: SessionId,
        owner: OwnerId,
        selector: TopicSelector,
        target: u32,
        resolved: u32,
        status: SessionStatus,
        cancel_reason: Option<CancelReason>,
        started_at: DateTime<Utc>,
        last_activity_at: DateTime<Utc>,
        delivered: Vec<QuestionId>,
        planned: Vec<QuestionId>,
    ) -> Self {
        Self {
            id,
            owner,
            selector,
            target,
            resolved,
            status,
            cancel_reason,
            started_at,
            last_activity_at,
            delivered,
            planned,
        }
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    #[must_use]
    pub fn selector(&self) -> &TopicSelector {
        &self.selector
    }

    #[must_use]
    pub fn target(&self) -> u32 {
        self.target
    }

    #[must_use]
    pub fn resolved(&self) -> u32 {
        self.resolved
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    #[must_use]
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.cancel_reason
    }

    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    #[must_use]
    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.last_activity_at
    }

    #[must_use]
    pub fn delivered(&self) -> &[QuestionId] {
        &self.delivered
    }

    #[must_use]
    pub fn planned(&self) -> &[QuestionId] {
        &self.planned
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// How many questions remain to be resolved.
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.target.saturating_sub(self.resolved)
    }

    /// Next planned question not yet delivered, for planned-list sessions.
    #[must_use]
    pub fn next_planned(&self) -> Option<QuestionId> {
        self.planned.get(self.delivered.len()).copied()
    }

    /// Installs the pre-planned question list. Overwrites any prior plan.
    pub fn set_planned(&mut self, planned: Vec<QuestionId>) {
        self.planned = planned;
    }

    /// Records that a question was handed to the delivery channel.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotActive` if the session is terminal.
    pub fn record_delivery(
        &mut self,
        question: QuestionId,
        at: DateTime<Utc>,
    ) -> Result<(), SessionError> {
        if !self.is_active() {
            return Err(SessionError::NotActive(self.status));
        }
        self.delivered.push(question);
        self.last_activity_at = at;
        Ok(())
    }

    /// Counts one resolved question and completes the session when the
    /// target is reached. Returns the new status.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotActive` for terminal sessions and
    /// `SessionError::AlreadyComplete` if every question is already counted.
    pub fn record_resolution(&mut self, at: DateTime<Utc>) -> Result<SessionStatus, SessionError> {
        if !self.is_active() {
            return Err(SessionError::NotActive(self.status));
        }
        if self.resolved >= self.target {
            return Err(SessionError::AlreadyComplete(self.target));
        }
        self.resolved += 1;
        self.last_activity_at = at;
        if self.resolved == self.target {
            self.status = SessionStatus::Completed;
        }
        Ok(self.status)
    }

    /// Cancels an active session. Terminal sessions are left untouched.
    pub fn cancel(&mut self, reason: CancelReason, at: DateTime<Utc>) {
        if self.is_active() {
            self.status = SessionStatus::Cancelled;
            self.cancel_reason = Some(reason);
            self.last_activity_at = at;
        }
    }

    /// Expires an active session that sat idle past the staleness cutoff.
    pub fn expire(&mut self, at: DateTime<Utc>) {
        if self.is_active() {
            self.status = SessionStatus::Expired;
            self.last_activity_at = at;
        }
    }
}
