use std::sync::Arc;

use drill_core::Clock;
use drill_core::model::{
    CancelReason, FailedScope, OwnerId, Session, SessionId, TopicSelector,
};
use storage::repository::Storage;
use tracing::{info, warn};

use crate::catalog::QuestionCatalog;
use crate::channel::NotificationSink;
use crate::config::EngineConfig;
use crate::error::SessionError;
use crate::flow::SessionFlow;
use crate::registry::PollRegistry;
use crate::timeout::TimeoutScheduler;

/// A snapshot of the owner's session for progress display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionProgress {
    pub session_id: SessionId,
    pub label: String,
    pub resolved: u32,
    pub target: u32,
}

/// Session lifecycle: starting, stopping, progress, and the staleness sweep.
///
/// An owner has at most one active session; starting a new one supersedes
/// the old.
pub struct SessionManager {
    storage: Storage,
    catalog: QuestionCatalog,
    flow: SessionFlow,
    scheduler: Arc<TimeoutScheduler>,
    registry: Arc<PollRegistry>,
    sink: Arc<dyn NotificationSink>,
    clock: Clock,
    config: EngineConfig,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        storage: Storage,
        catalog: QuestionCatalog,
        flow: SessionFlow,
        scheduler: Arc<TimeoutScheduler>,
        registry: Arc<PollRegistry>,
        sink: Arc<dyn NotificationSink>,
        clock: Clock,
        config: EngineConfig,
    ) -> Self {
        Self {
            storage,
            catalog,
            flow,
            scheduler,
            registry,
            sink,
            clock,
            config,
        }
    }

    /// Starts a single-topic session.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidCount`, `SessionError::UnknownTopic`,
    /// or a delivery failure for the first question.
    pub async fn start_topic(
        &self,
        owner: &OwnerId,
        topic: &str,
        count: u32,
    ) -> Result<Session, SessionError> {
        self.check_count(count)?;
        let topic = self.catalog.verify_topic(topic).await?;
        self.start(owner, TopicSelector::Single(topic), count, Vec::new())
            .await
    }

    /// Starts a retry-pool session over previously failed questions.
    ///
    /// The target shrinks to the pool size when fewer failures than
    /// requested remain.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NeverStudied` or `SessionError::NothingToRetry`
    /// when there is nothing to draw from.
    pub async fn start_failed(
        &self,
        owner: &OwnerId,
        topic: Option<&str>,
        count: u32,
    ) -> Result<Session, SessionError> {
        self.check_count(count)?;
        let scope = match topic {
            Some(raw) => FailedScope::Topic(self.catalog.verify_topic(raw).await?),
            None => FailedScope::All,
        };
        let planned = self.catalog.plan_failed(owner, &scope, count).await?;
        self.start(owner, TopicSelector::Failed(scope), count, planned)
            .await
    }

    /// Starts a session distributed evenly across every topic.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidCount` or a delivery failure.
    pub async fn start_random(&self, owner: &OwnerId, count: u32) -> Result<Session, SessionError> {
        self.check_count(count)?;
        let planned = self.catalog.plan_random(count).await?;
        self.start(owner, TopicSelector::Random, count, planned).await
    }

    /// Cancels the owner's active session at their request.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NoActiveSession` when there is none.
    pub async fn stop(&self, owner: &OwnerId) -> Result<Session, SessionError> {
        let Some(mut session) = self.storage.sessions.find_active(owner).await? else {
            return Err(SessionError::NoActiveSession);
        };
        self.cancel_session(&mut session, CancelReason::UserRequested)
            .await?;
        self.sink
            .notify(
                owner,
                &format!(
                    "Session stopped: {} of {} questions resolved.",
                    session.resolved(),
                    session.target()
                ),
            )
            .await;
        Ok(session)
    }

    /// Progress of the owner's active session.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NoActiveSession` when there is none.
    pub async fn progress(&self, owner: &OwnerId) -> Result<SessionProgress, SessionError> {
        let Some(session) = self.storage.sessions.find_active(owner).await? else {
            return Err(SessionError::NoActiveSession);
        };
        Ok(SessionProgress {
            session_id: session.id(),
            label: session.selector().label(),
            resolved: session.resolved(),
            target: session.target(),
        })
    }

    /// Expires active sessions idle past the configured cutoff, dropping
    /// their deadline timers and token mappings. Returns how many were
    /// expired.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Storage` on backend failure.
    pub async fn expire_stale(&self) -> Result<usize, SessionError> {
        let now = self.clock.now();
        let cutoff = chrono::Duration::from_std(self.config.session_max_age)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let mut expired = 0;
        for mut session in self.storage.sessions.active_sessions().await? {
            if now - session.last_activity_at() > cutoff {
                session.expire(now);
                self.storage.sessions.update_session(&session).await?;
                self.disarm_pending(session.id()).await?;
                info!(session = %session.id(), "session expired after inactivity");
                self.sink
                    .notify(session.owner(), "Session expired after inactivity.")
                    .await;
                expired += 1;
            }
        }
        Ok(expired)
    }

    fn check_count(&self, count: u32) -> Result<(), SessionError> {
        if self.config.count_in_bounds(count) {
            Ok(())
        } else {
            Err(SessionError::InvalidCount(count))
        }
    }

    async fn start(
        &self,
        owner: &OwnerId,
        selector: TopicSelector,
        count: u32,
        planned: Vec<drill_core::model::QuestionId>,
    ) -> Result<Session, SessionError> {
        if let Some(mut previous) = self.storage.sessions.find_active(owner).await? {
            warn!(session = %previous.id(), "superseding active session");
            self.cancel_session(&mut previous, CancelReason::Superseded)
                .await?;
            self.sink
                .notify(owner, "Previous session cancelled; starting a new one.")
                .await;
        }

        let target = if planned.is_empty() {
            count
        } else {
            count.min(u32::try_from(planned.len()).unwrap_or(u32::MAX))
        };
        let mut session = Session::new(
            SessionId::generate(),
            owner.clone(),
            selector,
            target,
            self.clock.now(),
        );
        session.set_planned(planned);
        self.storage.sessions.insert_session(&session).await?;
        info!(
            session = %session.id(),
            target,
            label = session.selector().label(),
            "session started"
        );
        self.flow
            .kick_off(&mut session)
            .await
            .map_err(|error| match error {
                crate::error::ReconcileError::Delivery(delivery) => {
                    SessionError::Delivery(delivery)
                }
                crate::error::ReconcileError::Storage(storage) => SessionError::Storage(storage),
                crate::error::ReconcileError::Summary(_) => {
                    SessionError::Delivery(crate::error::DeliveryError::PoolEmpty)
                }
            })?;
        Ok(session)
    }

    /// Cancels a session and disarms whatever it still has in flight.
    async fn cancel_session(
        &self,
        session: &mut Session,
        reason: CancelReason,
    ) -> Result<(), SessionError> {
        session.cancel(reason, self.clock.now());
        self.storage.sessions.update_session(session).await?;
        self.disarm_pending(session.id()).await
    }

    /// Drops deadline timers and token mappings for a session's pending
    /// responses. The responses themselves stay pending; a racing resolution
    /// is still recorded, just not advanced.
    async fn disarm_pending(&self, session: SessionId) -> Result<(), SessionError> {
        for response in self.storage.responses.list_for_session(session).await? {
            if response.is_pending() {
                self.scheduler.cancel(response.id());
                self.registry.remove(response.token());
            }
        }
        Ok(())
    }
}
