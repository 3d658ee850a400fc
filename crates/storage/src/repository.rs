use async_trait::async_trait;
use chrono::{DateTime, Utc};
use drill_core::model::{
    FailedScope, OwnerId, PendingResponse, PollToken, Question, QuestionId, ResponseId,
    ResponseOutcome, ResponseState, Session, SessionId, SessionStatus, SubjectStats, Topic,
};
use rand::Rng;
use rand::seq::IndexedRandom;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors surfaced by storage adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    #[error("conflict")]
    Conflict,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result of a compare-and-set resolution attempt on a pending response.
///
/// Exactly one caller ever sees `Applied` for a given response; every later
/// attempt gets `AlreadyTerminal` with the state the winner wrote.
#[derive(Debug)]
pub enum ResolveOutcome {
    Applied(PendingResponse),
    AlreadyTerminal(ResponseState),
}

/// One owner's answer or timeout on one question, kept as history for the
/// retry pool. `correct` is `None` for timeouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerEvent {
    pub owner: OwnerId,
    pub question_id: QuestionId,
    pub topic: Topic,
    pub correct: Option<bool>,
    pub occurred_at: DateTime<Utc>,
}

impl AnswerEvent {
    /// A failure keeps the question in the retry pool; both wrong answers
    /// and timeouts count.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.correct != Some(true)
    }
}

/// Fallback audit row written when stats could not be applied after
/// exhausting retries. Keeps the raw resolution so nothing is silently lost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DegradedRecord {
    pub owner: OwnerId,
    pub response_id: ResponseId,
    pub question_id: QuestionId,
    pub token: PollToken,
    pub selected_option: Option<u32>,
    pub correct: Option<bool>,
    pub recorded_at: DateTime<Utc>,
}

// ─── Repository contracts ──────────────────────────────────────────────────────

/// Read access to the question catalog.
#[async_trait]
pub trait QuestionRepository: Send + Sync {
    /// Persist or update a catalog question.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the question cannot be stored.
    async fn upsert_question(&self, question: &Question) -> Result<(), StorageError>;

    /// Fetch a question by ID.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if missing.
    async fn get_question(&self, id: QuestionId) -> Result<Question, StorageError>;

    /// All topics present in the catalog, sorted.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failure.
    async fn topics(&self) -> Result<Vec<Topic>, StorageError>;

    /// How many questions a topic holds.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failure.
    async fn count(&self, topic: &Topic) -> Result<u64, StorageError>;

    /// A uniformly random question from `topic`, skipping `exclude`.
    /// Returns `None` when the topic has no eligible question left.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failure.
    async fn random_question(
        &self,
        topic: &Topic,
        exclude: &[QuestionId],
    ) -> Result<Option<Question>, StorageError>;
}

/// Persistence for sessions and their delivery records.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Persist a new session.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the session cannot be stored.
    async fn insert_session(&self, session: &Session) -> Result<(), StorageError>;

    /// Fetch a session by ID.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if missing.
    async fn get_session(&self, id: SessionId) -> Result<Session, StorageError>;

    /// Persist the current state of an existing session.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the session was never inserted.
    async fn update_session(&self, session: &Session) -> Result<(), StorageError>;

    /// Persists `session` only if the stored row is still active; returns
    /// whether the write landed. A concurrent cancel or expiry between a
    /// read and this write leaves the terminal row untouched.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failure.
    async fn update_if_active(&self, session: &Session) -> Result<bool, StorageError>;

    /// The owner's active session, if any.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failure.
    async fn find_active(&self, owner: &OwnerId) -> Result<Option<Session>, StorageError>;

    /// Every active session, for the staleness sweep and crash recovery.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failure.
    async fn active_sessions(&self) -> Result<Vec<Session>, StorageError>;

    /// Atomically persists a delivery: the updated session and its new
    /// pending response land together or not at all.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the session was never inserted.
    async fn record_delivery(
        &self,
        session: &Session,
        response: &PendingResponse,
    ) -> Result<(), StorageError>;
}

/// Persistence for pending-response placeholders.
#[async_trait]
pub trait ResponseRepository: Send + Sync {
    /// Fetch a response by ID.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if missing.
    async fn get_response(&self, id: ResponseId) -> Result<PendingResponse, StorageError>;

    /// Looks up the response a channel token maps to.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failure.
    async fn find_by_token(&self, token: &PollToken)
    -> Result<Option<PendingResponse>, StorageError>;

    /// Compare-and-set resolution: transitions the response out of
    /// `Pending` only if it is still pending.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the response does not exist.
    async fn try_resolve(
        &self,
        id: ResponseId,
        outcome: ResponseOutcome,
        resolved_at: DateTime<Utc>,
    ) -> Result<ResolveOutcome, StorageError>;

    /// All responses belonging to a session, in delivery order.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failure.
    async fn list_for_session(
        &self,
        session: SessionId,
    ) -> Result<Vec<PendingResponse>, StorageError>;

    /// Every still-pending response, for deadline re-arming after restart.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failure.
    async fn pending_responses(&self) -> Result<Vec<PendingResponse>, StorageError>;
}

/// Persistence for per-(owner, topic) statistics and resolution history.
#[async_trait]
pub trait StatsRepository: Send + Sync {
    /// Fetch stats for one owner and topic, defaulting to zeroes where no
    /// row exists yet.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failure.
    async fn get_stats(&self, owner: &OwnerId, topic: &Topic)
    -> Result<SubjectStats, StorageError>;

    /// Folds one resolution into the stats row for the response's topic and
    /// into the history, keyed by the response ID so replays are no-ops.
    /// Returns `true` when the resolution was applied, `false` when it had
    /// been applied before.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failure.
    async fn apply_resolution(
        &self,
        owner: &OwnerId,
        response: &PendingResponse,
        outcome: ResponseOutcome,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError>;

    /// Writes the degraded fallback row for a resolution whose stats
    /// application kept failing.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failure.
    async fn record_degraded(&self, record: &DegradedRecord) -> Result<(), StorageError>;

    /// Clears the owner's seen set for one topic so the exhausted topic can
    /// be drilled again. Other topics keep their seen sets.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failure.
    async fn reset_seen(&self, owner: &OwnerId, topic: &Topic) -> Result<(), StorageError>;
}

/// Read access to failure history for retry-pool sessions.
#[async_trait]
pub trait HistoryRepository: Send + Sync {
    /// Whether the owner has any resolution history at all.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failure.
    async fn has_history(&self, owner: &OwnerId) -> Result<bool, StorageError>;

    /// Question IDs the owner has failed and not yet graduated, oldest
    /// outstanding failure first, capped at `limit`.
    ///
    /// A question graduates once a correct answer lands after its latest
    /// failure; graduated questions never reappear here.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failure.
    async fn failed_pool(
        &self,
        owner: &OwnerId,
        scope: &FailedScope,
        limit: usize,
    ) -> Result<Vec<QuestionId>, StorageError>;

    /// Topic of the owner's oldest outstanding failure, if any.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failure.
    async fn oldest_failure_topic(&self, owner: &OwnerId) -> Result<Option<Topic>, StorageError>;
}

// ─── In-memory backend ─────────────────────────────────────────────────────────

#[derive(Default)]
struct State {
    questions: HashMap<QuestionId, Question>,
    sessions: HashMap<SessionId, Session>,
    responses: HashMap<ResponseId, PendingResponse>,
    token_index: HashMap<PollToken, ResponseId>,
    stats: HashMap<(OwnerId, Topic), SubjectStats>,
    applied: std::collections::HashSet<ResponseId>,
    events: Vec<AnswerEvent>,
    degraded: Vec<DegradedRecord>,
}

/// In-memory repository implementation for testing and prototyping.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    state: Arc<Mutex<State>>,
}

impl InMemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, StorageError> {
        self.state
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    /// Degraded fallback rows written so far, for assertions in tests.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Connection` if the state lock is poisoned.
    pub fn degraded_records(&self) -> Result<Vec<DegradedRecord>, StorageError> {
        Ok(self.lock()?.degraded.clone())
    }
}

/// Per-question failure standing derived from the event history.
fn outstanding_failures(events: &[AnswerEvent], owner: &OwnerId) -> Vec<(QuestionId, Topic, DateTime<Utc>)> {
    let mut latest_failure: HashMap<QuestionId, (Topic, DateTime<Utc>)> = HashMap::new();
    let mut latest_correct: HashMap<QuestionId, DateTime<Utc>> = HashMap::new();
    for event in events.iter().filter(|e| &e.owner == owner) {
        if event.is_failure() {
            let entry = latest_failure
                .entry(event.question_id)
                .or_insert_with(|| (event.topic.clone(), event.occurred_at));
            if event.occurred_at > entry.1 {
                *entry = (event.topic.clone(), event.occurred_at);
            }
        } else {
            let entry = latest_correct
                .entry(event.question_id)
                .or_insert(event.occurred_at);
            if event.occurred_at > *entry {
                *entry = event.occurred_at;
            }
        }
    }
    let mut pool: Vec<(QuestionId, Topic, DateTime<Utc>)> = latest_failure
        .into_iter()
        .filter(|(id, (_, failed_at))| {
            latest_correct.get(id).is_none_or(|fixed_at| fixed_at < failed_at)
        })
        .map(|(id, (topic, failed_at))| (id, topic, failed_at))
        .collect();
    pool.sort_by_key(|(_, _, failed_at)| *failed_at);
    pool
}

#[async_trait]
impl QuestionRepository for InMemoryRepository {
    async fn upsert_question(&self, question: &Question) -> Result<(), StorageError> {
        self.lock()?.questions.insert(question.id(), question.clone());
        Ok(())
    }

    async fn get_question(&self, id: QuestionId) -> Result<Question, StorageError> {
        self.lock()?
            .questions
            .get(&id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn topics(&self) -> Result<Vec<Topic>, StorageError> {
        let guard = self.lock()?;
        let mut topics: Vec<Topic> = guard
            .questions
            .values()
            .map(|q| q.topic().clone())
            .collect();
        topics.sort();
        topics.dedup();
        Ok(topics)
    }

    async fn count(&self, topic: &Topic) -> Result<u64, StorageError> {
        let guard = self.lock()?;
        Ok(guard
            .questions
            .values()
            .filter(|q| q.topic() == topic)
            .count() as u64)
    }

    async fn random_question(
        &self,
        topic: &Topic,
        exclude: &[QuestionId],
    ) -> Result<Option<Question>, StorageError> {
        let guard = self.lock()?;
        let eligible: Vec<&Question> = guard
            .questions
            .values()
            .filter(|q| q.topic() == topic && !exclude.contains(&q.id()))
            .collect();
        let mut rng = rand::rng();
        Ok(eligible.choose(&mut rng).map(|q| (*q).clone()))
    }
}

#[async_trait]
impl SessionRepository for InMemoryRepository {
    async fn insert_session(&self, session: &Session) -> Result<(), StorageError> {
        self.lock()?.sessions.insert(session.id(), session.clone());
        Ok(())
    }

    async fn get_session(&self, id: SessionId) -> Result<Session, StorageError> {
        self.lock()?
            .sessions
            .get(&id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn update_session(&self, session: &Session) -> Result<(), StorageError> {
        let mut guard = self.lock()?;
        if !guard.sessions.contains_key(&session.id()) {
            return Err(StorageError::NotFound);
        }
        guard.sessions.insert(session.id(), session.clone());
        Ok(())
    }

    async fn update_if_active(&self, session: &Session) -> Result<bool, StorageError> {
        let mut guard = self.lock()?;
        match guard.sessions.get(&session.id()) {
            Some(stored) if stored.is_active() => {
                guard.sessions.insert(session.id(), session.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_active(&self, owner: &OwnerId) -> Result<Option<Session>, StorageError> {
        let guard = self.lock()?;
        Ok(guard
            .sessions
            .values()
            .find(|s| s.owner() == owner && s.is_active())
            .cloned())
    }

    async fn active_sessions(&self) -> Result<Vec<Session>, StorageError> {
        let guard = self.lock()?;
        Ok(guard
            .sessions
            .values()
            .filter(|s| s.is_active())
            .cloned()
            .collect())
    }

    async fn record_delivery(
        &self,
        session: &Session,
        response: &PendingResponse,
    ) -> Result<(), StorageError> {
        let mut guard = self.lock()?;
        if !guard.sessions.contains_key(&session.id()) {
            return Err(StorageError::NotFound);
        }
        guard.sessions.insert(session.id(), session.clone());
        guard.responses.insert(response.id(), response.clone());
        guard
            .token_index
            .insert(response.token().clone(), response.id());
        Ok(())
    }
}

#[async_trait]
impl ResponseRepository for InMemoryRepository {
    async fn get_response(&self, id: ResponseId) -> Result<PendingResponse, StorageError> {
        self.lock()?
            .responses
            .get(&id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn find_by_token(
        &self,
        token: &PollToken,
    ) -> Result<Option<PendingResponse>, StorageError> {
        let guard = self.lock()?;
        let Some(id) = guard.token_index.get(token) else {
            return Ok(None);
        };
        Ok(guard.responses.get(id).cloned())
    }

    async fn try_resolve(
        &self,
        id: ResponseId,
        outcome: ResponseOutcome,
        resolved_at: DateTime<Utc>,
    ) -> Result<ResolveOutcome, StorageError> {
        let mut guard = self.lock()?;
        let response = guard.responses.get_mut(&id).ok_or(StorageError::NotFound)?;
        match response.resolve(outcome, resolved_at) {
            Ok(()) => Ok(ResolveOutcome::Applied(response.clone())),
            Err(err) => Ok(ResolveOutcome::AlreadyTerminal(err.0)),
        }
    }

    async fn list_for_session(
        &self,
        session: SessionId,
    ) -> Result<Vec<PendingResponse>, StorageError> {
        let guard = self.lock()?;
        let mut responses: Vec<PendingResponse> = guard
            .responses
            .values()
            .filter(|r| r.session_id() == session)
            .cloned()
            .collect();
        responses.sort_by_key(PendingResponse::ordinal);
        Ok(responses)
    }

    async fn pending_responses(&self) -> Result<Vec<PendingResponse>, StorageError> {
        let guard = self.lock()?;
        Ok(guard
            .responses
            .values()
            .filter(|r| r.is_pending())
            .cloned()
            .collect())
    }
}

#[async_trait]
impl StatsRepository for InMemoryRepository {
    async fn get_stats(
        &self,
        owner: &OwnerId,
        topic: &Topic,
    ) -> Result<SubjectStats, StorageError> {
        let guard = self.lock()?;
        Ok(guard
            .stats
            .get(&(owner.clone(), topic.clone()))
            .cloned()
            .unwrap_or_default())
    }

    async fn apply_resolution(
        &self,
        owner: &OwnerId,
        response: &PendingResponse,
        outcome: ResponseOutcome,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let mut guard = self.lock()?;
        if !guard.applied.insert(response.id()) {
            return Ok(false);
        }
        guard
            .stats
            .entry((owner.clone(), response.topic().clone()))
            .or_default()
            .apply(response.question_id(), outcome, at);
        let correct = match outcome {
            ResponseOutcome::Answered { correct, .. } => Some(correct),
            ResponseOutcome::TimedOut => None,
        };
        guard.events.push(AnswerEvent {
            owner: owner.clone(),
            question_id: response.question_id(),
            topic: response.topic().clone(),
            correct,
            occurred_at: at,
        });
        Ok(true)
    }

    async fn record_degraded(&self, record: &DegradedRecord) -> Result<(), StorageError> {
        self.lock()?.degraded.push(record.clone());
        Ok(())
    }

    async fn reset_seen(&self, owner: &OwnerId, topic: &Topic) -> Result<(), StorageError> {
        let mut guard = self.lock()?;
        if let Some(stats) = guard.stats.get_mut(&(owner.clone(), topic.clone())) {
            stats.reset_seen();
        }
        Ok(())
    }
}

#[async_trait]
impl HistoryRepository for InMemoryRepository {
    async fn has_history(&self, owner: &OwnerId) -> Result<bool, StorageError> {
        let guard = self.lock()?;
        Ok(guard.events.iter().any(|e| &e.owner == owner))
    }

    async fn failed_pool(
        &self,
        owner: &OwnerId,
        scope: &FailedScope,
        limit: usize,
    ) -> Result<Vec<QuestionId>, StorageError> {
        let guard = self.lock()?;
        Ok(outstanding_failures(&guard.events, owner)
            .into_iter()
            .filter(|(_, topic, _)| scope.topic().is_none_or(|t| t == topic))
            .map(|(id, _, _)| id)
            .take(limit)
            .collect())
    }

    async fn oldest_failure_topic(&self, owner: &OwnerId) -> Result<Option<Topic>, StorageError> {
        let guard = self.lock()?;
        Ok(outstanding_failures(&guard.events, owner)
            .into_iter()
            .next()
            .map(|(_, topic, _)| topic))
    }
}

// ─── Aggregate ─────────────────────────────────────────────────────────────────

/// Aggregates the repositories behind trait objects for easy backend swapping.
#[derive(Clone)]
pub struct Storage {
    pub questions: Arc<dyn QuestionRepository>,
    pub sessions: Arc<dyn SessionRepository>,
    pub responses: Arc<dyn ResponseRepository>,
    pub stats: Arc<dyn StatsRepository>,
    pub history: Arc<dyn HistoryRepository>,
}

impl Storage {
    #[must_use]
    pub fn in_memory() -> Self {
        Self::from_in_memory(InMemoryRepository::new())
    }

    #[must_use]
    pub fn from_in_memory(repo: InMemoryRepository) -> Self {
        let questions: Arc<dyn QuestionRepository> = Arc::new(repo.clone());
        let sessions: Arc<dyn SessionRepository> = Arc::new(repo.clone());
        let responses: Arc<dyn ResponseRepository> = Arc::new(repo.clone());
        let stats: Arc<dyn StatsRepository> = Arc::new(repo.clone());
        let history: Arc<dyn HistoryRepository> = Arc::new(repo);
        Self {
            questions,
            sessions,
            responses,
            stats,
            history,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drill_core::model::{PollKind, TopicSelector};
    use drill_core::time::fixed_now;
    use chrono::Duration;

    fn topic(name: &str) -> Topic {
        Topic::new(name).unwrap()
    }

    fn question(t: &Topic, n: u32) -> Question {
        Question::new(
            QuestionId::generate(),
            t.clone(),
            n,
            format!("Question {n}?"),
            vec!["a".into(), "b".into(), "c".into()],
            0,
        )
        .unwrap()
    }

    fn pending(owner_session: &Session, q: &Question, ordinal: u32) -> PendingResponse {
        PendingResponse::new(
            ResponseId::generate(),
            owner_session.id(),
            q.id(),
            q.topic().clone(),
            PollKind::Study,
            PollToken::new(format!("tok-{ordinal}")),
            ordinal,
            0,
            fixed_now(),
            fixed_now() + Duration::seconds(60),
        )
    }

    fn session(owner: &str) -> Session {
        Session::new(
            SessionId::generate(),
            OwnerId::new(owner),
            TopicSelector::Single(topic("armada")),
            5,
            fixed_now(),
        )
    }

    #[tokio::test]
    async fn resolve_is_first_writer_wins() {
        let repo = InMemoryRepository::new();
        let t = topic("armada");
        let q = question(&t, 1);
        let mut s = session("owner-1");
        repo.insert_session(&s).await.unwrap();
        let r = pending(&s, &q, 1);
        s.record_delivery(q.id(), fixed_now()).unwrap();
        repo.record_delivery(&s, &r).await.unwrap();

        let first = repo
            .try_resolve(
                r.id(),
                ResponseOutcome::Answered {
                    selected: 0,
                    correct: true,
                },
                fixed_now(),
            )
            .await
            .unwrap();
        assert!(matches!(first, ResolveOutcome::Applied(_)));

        let second = repo
            .try_resolve(r.id(), ResponseOutcome::TimedOut, fixed_now())
            .await
            .unwrap();
        assert!(matches!(
            second,
            ResolveOutcome::AlreadyTerminal(ResponseState::Answered)
        ));
    }

    #[tokio::test]
    async fn apply_resolution_is_idempotent() {
        let repo = InMemoryRepository::new();
        let owner = OwnerId::new("owner-1");
        let t = topic("armada");
        let q = question(&t, 1);
        let s = session("owner-1");
        let r = pending(&s, &q, 1);
        let outcome = ResponseOutcome::Answered {
            selected: 0,
            correct: true,
        };
        assert!(repo.apply_resolution(&owner, &r, outcome, fixed_now()).await.unwrap());
        assert!(!repo.apply_resolution(&owner, &r, outcome, fixed_now()).await.unwrap());
        let stats = repo.get_stats(&owner, &t).await.unwrap();
        assert_eq!(stats.resolved(), 1);
        assert_eq!(stats.correct(), 1);
    }

    #[tokio::test]
    async fn stats_and_seen_reset_are_scoped_per_topic() {
        let repo = InMemoryRepository::new();
        let owner = OwnerId::new("owner-1");
        let alpha = topic("alpha");
        let beta = topic("beta");
        let qa = question(&alpha, 1);
        let qb = question(&beta, 1);
        let s = session("owner-1");
        let right = ResponseOutcome::Answered {
            selected: 0,
            correct: true,
        };

        let ra = pending(&s, &qa, 1);
        repo.apply_resolution(&owner, &ra, right, fixed_now()).await.unwrap();
        let rb = pending(&s, &qb, 2);
        repo.apply_resolution(&owner, &rb, right, fixed_now()).await.unwrap();

        // Each topic carries its own counters and seen set.
        let alpha_stats = repo.get_stats(&owner, &alpha).await.unwrap();
        assert_eq!(alpha_stats.resolved(), 1);
        assert!(alpha_stats.has_seen(qa.id()));
        assert!(!alpha_stats.has_seen(qb.id()));

        // Resetting alpha's pool leaves beta's membership intact.
        repo.reset_seen(&owner, &alpha).await.unwrap();
        assert!(repo.get_stats(&owner, &alpha).await.unwrap().seen().is_empty());
        let beta_stats = repo.get_stats(&owner, &beta).await.unwrap();
        assert!(beta_stats.has_seen(qb.id()));
        assert_eq!(beta_stats.resolved(), 1);
    }

    #[tokio::test]
    async fn update_if_active_refuses_terminal_sessions() {
        let repo = InMemoryRepository::new();
        let mut s = session("owner-1");
        repo.insert_session(&s).await.unwrap();

        let mut snapshot = s.clone();
        assert!(repo.update_if_active(&snapshot).await.unwrap());

        // A concurrent cancel lands between the snapshot read and its write.
        s.cancel(drill_core::model::CancelReason::UserRequested, fixed_now());
        repo.update_session(&s).await.unwrap();

        snapshot.record_resolution(fixed_now()).unwrap();
        assert!(!repo.update_if_active(&snapshot).await.unwrap());
        let stored = repo.get_session(s.id()).await.unwrap();
        assert_eq!(stored.status(), SessionStatus::Cancelled);
        assert_eq!(stored.resolved(), 0);
    }

    #[tokio::test]
    async fn failed_pool_graduates_after_later_correct_answer() {
        let repo = InMemoryRepository::new();
        let owner = OwnerId::new("owner-1");
        let t = topic("armada");
        let q = question(&t, 1);
        let s = session("owner-1");
        let wrong = ResponseOutcome::Answered {
            selected: 1,
            correct: false,
        };
        let right = ResponseOutcome::Answered {
            selected: 0,
            correct: true,
        };

        let r1 = pending(&s, &q, 1);
        repo.apply_resolution(&owner, &r1, wrong, fixed_now()).await.unwrap();
        let pool = repo.failed_pool(&owner, &FailedScope::All, 10).await.unwrap();
        assert_eq!(pool, vec![q.id()]);

        let r2 = pending(&s, &q, 2);
        repo.apply_resolution(&owner, &r2, right, fixed_now() + Duration::seconds(10))
            .await
            .unwrap();
        let pool = repo.failed_pool(&owner, &FailedScope::All, 10).await.unwrap();
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn failed_pool_orders_oldest_failure_first_and_scopes_by_topic() {
        let repo = InMemoryRepository::new();
        let owner = OwnerId::new("owner-1");
        let armada = topic("armada");
        let derecho = topic("derecho");
        let q1 = question(&armada, 1);
        let q2 = question(&derecho, 2);
        let s = session("owner-1");
        let wrong = ResponseOutcome::Answered {
            selected: 1,
            correct: false,
        };

        let r2 = pending(&s, &q2, 1);
        repo.apply_resolution(&owner, &r2, wrong, fixed_now()).await.unwrap();
        let r1 = pending(&s, &q1, 2);
        repo.apply_resolution(&owner, &r1, wrong, fixed_now() + Duration::seconds(5))
            .await
            .unwrap();

        let pool = repo.failed_pool(&owner, &FailedScope::All, 10).await.unwrap();
        assert_eq!(pool, vec![q2.id(), q1.id()]);

        let scoped = repo
            .failed_pool(&owner, &FailedScope::Topic(armada.clone()), 10)
            .await
            .unwrap();
        assert_eq!(scoped, vec![q1.id()]);

        assert_eq!(
            repo.oldest_failure_topic(&owner).await.unwrap(),
            Some(derecho)
        );
    }

    #[tokio::test]
    async fn timeout_counts_as_failure_for_the_pool() {
        let repo = InMemoryRepository::new();
        let owner = OwnerId::new("owner-1");
        let t = topic("armada");
        let q = question(&t, 1);
        let s = session("owner-1");
        let r = pending(&s, &q, 1);
        repo.apply_resolution(&owner, &r, ResponseOutcome::TimedOut, fixed_now())
            .await
            .unwrap();
        let pool = repo.failed_pool(&owner, &FailedScope::All, 10).await.unwrap();
        assert_eq!(pool, vec![q.id()]);
    }

    #[tokio::test]
    async fn random_question_honors_exclusions() {
        let repo = InMemoryRepository::new();
        let t = topic("armada");
        let q1 = question(&t, 1);
        let q2 = question(&t, 2);
        repo.upsert_question(&q1).await.unwrap();
        repo.upsert_question(&q2).await.unwrap();

        let picked = repo.random_question(&t, &[q1.id()]).await.unwrap().unwrap();
        assert_eq!(picked.id(), q2.id());
        let none = repo.random_question(&t, &[q1.id(), q2.id()]).await.unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn token_lookup_follows_delivery() {
        let repo = InMemoryRepository::new();
        let t = topic("armada");
        let q = question(&t, 1);
        let mut s = session("owner-1");
        repo.insert_session(&s).await.unwrap();
        let r = pending(&s, &q, 1);
        s.record_delivery(q.id(), fixed_now()).unwrap();
        repo.record_delivery(&s, &r).await.unwrap();

        let found = repo.find_by_token(r.token()).await.unwrap().unwrap();
        assert_eq!(found.id(), r.id());
        assert!(
            repo.find_by_token(&PollToken::new("unknown"))
                .await
                .unwrap()
                .is_none()
        );
    }
}
