use drill_core::model::{
    FailedScope, OwnerId, Question, QuestionId, Session, Topic, TopicSelector,
};
use rand::seq::{IndexedRandom, SliceRandom};
use storage::repository::Storage;
use tracing::debug;

use crate::error::{DeliveryError, SessionError};
use crate::planner::plan_distribution;

/// Question selection over the catalog, the owner's seen-set, and the
/// failure history.
#[derive(Clone)]
pub struct QuestionCatalog {
    storage: Storage,
}

impl QuestionCatalog {
    #[must_use]
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Parses a raw topic name and checks it exists in the catalog.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::UnknownTopic` for malformed or absent topics.
    pub async fn verify_topic(&self, raw: &str) -> Result<Topic, SessionError> {
        let topic =
            Topic::new(raw).map_err(|_| SessionError::UnknownTopic(raw.to_owned()))?;
        if self.storage.questions.count(&topic).await? == 0 {
            return Err(SessionError::UnknownTopic(raw.to_owned()));
        }
        Ok(topic)
    }

    /// All topics present in the catalog.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Storage` on backend failure.
    pub async fn topics(&self) -> Result<Vec<Topic>, SessionError> {
        Ok(self.storage.questions.topics().await?)
    }

    /// Fetch a planned question by ID.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Storage` if the question is missing.
    pub async fn question(&self, id: QuestionId) -> Result<Question, DeliveryError> {
        Ok(self.storage.questions.get_question(id).await?)
    }

    /// Builds the planned list for a random-mode session: the budget split
    /// evenly across topics, picks shuffled so topics interleave.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::PoolEmpty` (wrapped) when the catalog holds
    /// no questions at all.
    pub async fn plan_random(&self, total: u32) -> Result<Vec<QuestionId>, SessionError> {
        let topics = self.storage.questions.topics().await?;
        if topics.is_empty() {
            return Err(SessionError::Delivery(DeliveryError::PoolEmpty));
        }
        let allocation = {
            let mut rng = rand::rng();
            plan_distribution(total, &topics, &mut rng)
        };

        let mut planned = Vec::with_capacity(total as usize);
        for (topic, count) in allocation {
            let mut picked: Vec<QuestionId> = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let mut exclude = planned.clone();
                exclude.extend_from_slice(&picked);
                match self
                    .storage
                    .questions
                    .random_question(&topic, &exclude)
                    .await?
                {
                    Some(question) => picked.push(question.id()),
                    // Topic exhausted; the session target shrinks to fit.
                    None => break,
                }
            }
            planned.extend(picked);
        }
        if planned.is_empty() {
            return Err(SessionError::Delivery(DeliveryError::PoolEmpty));
        }
        let mut rng = rand::rng();
        planned.shuffle(&mut rng);
        debug!(planned = planned.len(), requested = total, "planned random session");
        Ok(planned)
    }

    /// Builds the planned list for a retry-pool session.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NeverStudied` for owners with no history and
    /// `SessionError::NothingToRetry` when every failure has graduated.
    pub async fn plan_failed(
        &self,
        owner: &OwnerId,
        scope: &FailedScope,
        count: u32,
    ) -> Result<Vec<QuestionId>, SessionError> {
        if !self.storage.history.has_history(owner).await? {
            return Err(SessionError::NeverStudied);
        }
        let pool = self
            .storage
            .history
            .failed_pool(owner, scope, count as usize)
            .await?;
        if pool.is_empty() {
            return Err(SessionError::NothingToRetry);
        }
        Ok(pool)
    }

    /// Picks the next fresh question for a single-topic session, skipping
    /// questions the owner has already been served and questions already
    /// delivered in this session.
    ///
    /// When the topic is exhausted, its seen-set is cleared once and the
    /// pick retried; a second miss means the topic genuinely has nothing
    /// left for this session. The reset touches only this topic.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::PoolEmpty` when no question can be picked.
    pub async fn next_fresh(
        &self,
        owner: &OwnerId,
        topic: &Topic,
        delivered: &[QuestionId],
    ) -> Result<Question, DeliveryError> {
        let stats = self.storage.stats.get_stats(owner, topic).await?;
        let mut exclude: Vec<QuestionId> = stats.seen().iter().copied().collect();
        exclude.extend_from_slice(delivered);
        if let Some(question) = self
            .storage
            .questions
            .random_question(topic, &exclude)
            .await?
        {
            return Ok(question);
        }

        debug!(%owner, %topic, "topic exhausted, resetting seen set");
        self.storage.stats.reset_seen(owner, topic).await?;
        self.storage
            .questions
            .random_question(topic, delivered)
            .await?
            .ok_or(DeliveryError::PoolEmpty)
    }

    /// Picks a substitute after a question failed to render or send.
    ///
    /// The substitute comes from the session's own topic where there is
    /// one; retry-pool sessions without a scoped topic fall back to the
    /// topic of the oldest outstanding failure, then to any catalog topic.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Storage` on backend failure.
    pub async fn substitute(
        &self,
        session: &Session,
        exclude: &[QuestionId],
    ) -> Result<Option<Question>, DeliveryError> {
        let topic = match session.selector() {
            TopicSelector::Single(topic) => Some(topic.clone()),
            TopicSelector::Failed(scope) => match scope.topic() {
                Some(topic) => Some(topic.clone()),
                None => {
                    self.storage
                        .history
                        .oldest_failure_topic(session.owner())
                        .await?
                }
            },
            TopicSelector::Random => None,
        };
        let topic = match topic {
            Some(topic) => topic,
            None => {
                let topics = self.storage.questions.topics().await?;
                let mut rng = rand::rng();
                match topics.choose(&mut rng) {
                    Some(topic) => topic.clone(),
                    None => return Ok(None),
                }
            }
        };
        Ok(self
            .storage
            .questions
            .random_question(&topic, exclude)
            .await?)
    }
}
