use std::sync::Arc;

use async_trait::async_trait;
use drill_core::Clock;
use drill_core::model::{
    PendingResponse, PollToken, ResponseId, ResponseOutcome, ResponseState,
};
use storage::repository::{DegradedRecord, ResolveOutcome, Storage};
use tracing::{debug, error, info, warn};

use crate::channel::NotificationSink;
use crate::error::ReconcileError;
use crate::flow::SessionFlow;
use crate::registry::PollRegistry;
use crate::retry::RetryExecutor;
use crate::timeout::TimeoutScheduler;

/// What a resolution attempt amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// This attempt won the race and was fully processed.
    Applied(ResponseOutcome),
    /// The response was already terminal; nothing changed.
    Duplicate(ResponseState),
    /// The token maps to nothing we know about.
    UnknownToken,
    /// The poll belongs to a family this engine does not handle.
    Ignored,
}

/// Reconciles answer callbacks and deadline firings against pending
/// responses.
///
/// Both paths funnel into one compare-and-set per response, so a late
/// answer and a racing timeout can never both count. Everything after the
/// winning transition (stats, advancement) happens exactly once, on the
/// winner's side.
pub struct CallbackReconciler {
    storage: Storage,
    registry: Arc<PollRegistry>,
    scheduler: Arc<TimeoutScheduler>,
    retry: RetryExecutor,
    flow: SessionFlow,
    sink: Arc<dyn NotificationSink>,
    clock: Clock,
}

impl CallbackReconciler {
    #[must_use]
    pub fn new(
        storage: Storage,
        registry: Arc<PollRegistry>,
        scheduler: Arc<TimeoutScheduler>,
        retry: RetryExecutor,
        flow: SessionFlow,
        sink: Arc<dyn NotificationSink>,
        clock: Clock,
    ) -> Self {
        Self {
            storage,
            registry,
            scheduler,
            retry,
            flow,
            sink,
            clock,
        }
    }

    /// Handles an answer callback from the channel.
    ///
    /// Unknown tokens and polls outside the study family are reported, not
    /// errored: the channel replays callbacks and shares its namespace with
    /// other poll producers.
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError` when storage fails.
    pub async fn resolve_answer(
        &self,
        token: &PollToken,
        selected: usize,
    ) -> Result<Resolution, ReconcileError> {
        let response = match self.registry.lookup(token) {
            Some(id) => match self.storage.responses.get_response(id).await {
                Ok(response) => Some(response),
                Err(storage::repository::StorageError::NotFound) => None,
                Err(error) => return Err(error.into()),
            },
            // Registry miss; the persisted token column is authoritative.
            None => self.storage.responses.find_by_token(token).await?,
        };
        let Some(response) = response else {
            debug!(%token, "answer for unknown token");
            return Ok(Resolution::UnknownToken);
        };
        if !response.kind().is_study_family() {
            debug!(%token, kind = response.kind().as_str(), "answer for foreign poll kind");
            return Ok(Resolution::Ignored);
        }
        let outcome = ResponseOutcome::Answered {
            selected,
            correct: response.is_correct_selection(selected),
        };
        self.resolve(response, outcome).await
    }

    /// Handles an elapsed question deadline.
    ///
    /// # Errors
    ///
    /// Returns `ReconcileError` when storage fails.
    pub async fn resolve_timeout(&self, id: ResponseId) -> Result<Resolution, ReconcileError> {
        let response = match self.storage.responses.get_response(id).await {
            Ok(response) => response,
            Err(storage::repository::StorageError::NotFound) => {
                warn!(%id, "deadline fired for unknown response");
                return Ok(Resolution::UnknownToken);
            }
            Err(error) => return Err(error.into()),
        };
        if !response.kind().is_study_family() {
            return Ok(Resolution::Ignored);
        }
        self.resolve(response, ResponseOutcome::TimedOut).await
    }

    /// The single resolution path: compare-and-set, then stats, then
    /// session advancement.
    async fn resolve(
        &self,
        response: PendingResponse,
        outcome: ResponseOutcome,
    ) -> Result<Resolution, ReconcileError> {
        let now = self.clock.now();
        // The transition itself runs under the retry policy: a busy backend
        // at the compare-and-set must not bounce the callback.
        let resolved = match self
            .retry
            .run("try_resolve", || {
                self.storage.responses.try_resolve(response.id(), outcome, now)
            })
            .await?
        {
            ResolveOutcome::Applied(resolved) => resolved,
            ResolveOutcome::AlreadyTerminal(state) => {
                debug!(response = %response.id(), ?state, "duplicate resolution ignored");
                return Ok(Resolution::Duplicate(state));
            }
        };
        self.scheduler.cancel(resolved.id());
        self.registry.remove(resolved.token());

        let mut session = self
            .storage
            .sessions
            .get_session(resolved.session_id())
            .await?;
        let owner = session.owner().clone();

        self.apply_stats(&owner, &resolved, outcome, now).await;

        if outcome.is_timeout() {
            self.sink
                .notify(
                    &owner,
                    &format!("Time is up for question {}.", resolved.ordinal()),
                )
                .await;
        }

        if session.is_active() {
            match session.record_resolution(now) {
                Ok(status) => {
                    // Conditional write: a stop or supersede racing with this
                    // resolution must not be overwritten back to active.
                    if !self.storage.sessions.update_if_active(&session).await? {
                        info!(
                            session = %session.id(),
                            "session ended mid-resolution, not advancing"
                        );
                        return Ok(Resolution::Applied(outcome));
                    }
                    debug!(session = %session.id(), ?status, "resolution counted");
                    self.flow.advance_or_finalize(&mut session).await?;
                }
                Err(error) => {
                    // Counter drift; the stats above are still correct.
                    warn!(session = %session.id(), %error, "resolution not counted");
                }
            }
        } else {
            info!(
                session = %session.id(),
                status = session.status().as_str(),
                "late resolution on a finished session"
            );
        }
        Ok(Resolution::Applied(outcome))
    }

    /// Applies stats under the retry policy; permanent failure degrades to
    /// an audit row so the resolution is never silently dropped.
    async fn apply_stats(
        &self,
        owner: &drill_core::model::OwnerId,
        resolved: &PendingResponse,
        outcome: ResponseOutcome,
        now: chrono::DateTime<chrono::Utc>,
    ) {
        let result = self
            .retry
            .run("apply_resolution", || {
                self.storage
                    .stats
                    .apply_resolution(owner, resolved, outcome, now)
            })
            .await;
        match result {
            Ok(true) => {}
            Ok(false) => {
                debug!(response = %resolved.id(), "stats already applied for response");
            }
            Err(stats_error) => {
                error!(
                    response = %resolved.id(),
                    error = %stats_error,
                    "stats application failed, writing degraded record"
                );
                let record = DegradedRecord {
                    owner: owner.clone(),
                    response_id: resolved.id(),
                    question_id: resolved.question_id(),
                    token: resolved.token().clone(),
                    selected_option: resolved.selected_option(),
                    correct: resolved.correct(),
                    recorded_at: now,
                };
                if let Err(degraded_error) = self.storage.stats.record_degraded(&record).await {
                    error!(
                        response = %resolved.id(),
                        error = %degraded_error,
                        "degraded record write failed, resolution lost from stats"
                    );
                }
            }
        }
    }
}

#[async_trait]
impl crate::timeout::DeadlineHandler for CallbackReconciler {
    async fn deadline_elapsed(&self, response: ResponseId) {
        if let Err(error) = self.resolve_timeout(response).await {
            error!(%response, %error, "timeout resolution failed");
        }
    }
}
