use std::sync::Arc;

use drill_core::Clock;
use drill_core::model::{
    PendingResponse, PollKind, Question, QuestionId, ResponseId, Session, TopicSelector,
};
use drill_core::poll::PollDraft;
use storage::repository::Storage;
use tracing::{debug, warn};

use crate::catalog::QuestionCatalog;
use crate::channel::PollChannel;
use crate::config::EngineConfig;
use crate::error::DeliveryError;
use crate::registry::PollRegistry;
use crate::timeout::TimeoutScheduler;

/// Sends the next question of a session and records the delivery.
///
/// One delivery is: pick a question, render it, push it through the
/// channel, persist the session update together with the new pending
/// response, index the channel token, and arm the deadline timer. A
/// question that cannot be rendered or that the channel refuses is swapped
/// for a substitute, up to the configured attempt budget.
#[derive(Clone)]
pub struct DeliveryCoordinator {
    storage: Storage,
    catalog: QuestionCatalog,
    channel: Arc<dyn PollChannel>,
    registry: Arc<PollRegistry>,
    scheduler: Arc<TimeoutScheduler>,
    clock: Clock,
    config: EngineConfig,
}

impl DeliveryCoordinator {
    #[must_use]
    pub fn new(
        storage: Storage,
        catalog: QuestionCatalog,
        channel: Arc<dyn PollChannel>,
        registry: Arc<PollRegistry>,
        scheduler: Arc<TimeoutScheduler>,
        clock: Clock,
        config: EngineConfig,
    ) -> Self {
        Self {
            storage,
            catalog,
            channel,
            registry,
            scheduler,
            clock,
            config,
        }
    }

    /// Delivers the session's next question, mutating `session` with the
    /// new delivery on success.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Exhausted` after the substitution budget is
    /// spent, `DeliveryError::PoolEmpty` when no candidate exists at all,
    /// and channel or storage errors otherwise.
    pub async fn deliver_next(
        &self,
        session: &mut Session,
    ) -> Result<PendingResponse, DeliveryError> {
        let ordinal = u32::try_from(session.delivered().len()).unwrap_or(u32::MAX) + 1;
        let header = format!("[{}] {}/{}", session.selector().label(), ordinal, session.target());

        let mut tried: Vec<QuestionId> = Vec::new();
        let mut question = self.first_candidate(session).await?;

        for attempt in 1..=self.config.max_delivery_attempts {
            match self.try_send(session, &question, &header).await {
                Ok(Some((token, correct_index))) => {
                    let now = self.clock.now();
                    let deadline = now
                        + chrono::Duration::from_std(self.config.question_time_limit)
                            .unwrap_or_else(|_| chrono::Duration::seconds(60));
                    let response = PendingResponse::new(
                        ResponseId::generate(),
                        session.id(),
                        question.id(),
                        question.topic().clone(),
                        PollKind::Study,
                        token,
                        ordinal,
                        correct_index,
                        now,
                        deadline,
                    );
                    session.record_delivery(question.id(), now)?;
                    self.storage.sessions.record_delivery(session, &response).await?;
                    self.registry
                        .insert(response.token().clone(), response.id());
                    self.scheduler
                        .arm(response.id(), self.config.question_time_limit);
                    debug!(
                        session = %session.id(),
                        response = %response.id(),
                        ordinal,
                        "question delivered"
                    );
                    return Ok(response);
                }
                Ok(None) => {
                    // Unusable question; try a substitute.
                    warn!(
                        session = %session.id(),
                        question = %question.id(),
                        attempt,
                        "question not deliverable, substituting"
                    );
                    tried.push(question.id());
                    let mut exclude = session.delivered().to_vec();
                    exclude.extend_from_slice(&tried);
                    match self.catalog.substitute(session, &exclude).await? {
                        Some(next) => question = next,
                        None => return Err(DeliveryError::Exhausted(attempt)),
                    }
                }
                Err(error) => return Err(error),
            }
        }
        Err(DeliveryError::Exhausted(self.config.max_delivery_attempts))
    }

    /// The session's nominal next question, before any substitution.
    async fn first_candidate(&self, session: &Session) -> Result<Question, DeliveryError> {
        if let Some(planned) = session.next_planned() {
            return self.catalog.question(planned).await;
        }
        match session.selector() {
            TopicSelector::Single(topic) => {
                self.catalog
                    .next_fresh(session.owner(), topic, session.delivered())
                    .await
            }
            // Planned-list sessions that ran out of plan draw substitutes.
            TopicSelector::Failed(_) | TopicSelector::Random => self
                .catalog
                .substitute(session, session.delivered())
                .await?
                .ok_or(DeliveryError::PoolEmpty),
        }
    }

    /// Renders and sends one candidate, returning the channel token and the
    /// correct answer's post-shuffle position. `Ok(None)` means the
    /// candidate is unusable but a substitute may still work.
    async fn try_send(
        &self,
        session: &Session,
        question: &Question,
        header: &str,
    ) -> Result<Option<(drill_core::model::PollToken, u32)>, DeliveryError> {
        let draft = {
            let mut rng = rand::rng();
            match PollDraft::prepare(question, header, &mut rng) {
                Ok(draft) => draft,
                Err(error) => {
                    warn!(question = %question.id(), %error, "question failed to render");
                    return Ok(None);
                }
            }
        };
        let correct_index = u32::try_from(draft.correct_index()).unwrap_or(u32::MAX);
        match self.channel.send_poll(session.owner(), &draft).await {
            Ok(token) => Ok(Some((token, correct_index))),
            Err(error) if error.is_substitutable() => {
                warn!(question = %question.id(), %error, "channel rejected poll");
                Ok(None)
            }
            Err(error) => Err(error.into()),
        }
    }
}
