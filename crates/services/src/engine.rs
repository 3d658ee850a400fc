use std::sync::Arc;
use std::time::Duration;

use drill_core::Clock;
use drill_core::model::{OwnerId, PollToken, Session, SubjectStats, Topic};
use storage::repository::Storage;
use tracing::info;

use crate::catalog::QuestionCatalog;
use crate::channel::{NotificationSink, PollChannel};
use crate::config::EngineConfig;
use crate::delivery::DeliveryCoordinator;
use crate::error::{EngineError, ReconcileError, SessionError};
use crate::flow::SessionFlow;
use crate::reconciler::{CallbackReconciler, Resolution};
use crate::registry::PollRegistry;
use crate::retry::RetryExecutor;
use crate::session_manager::{SessionManager, SessionProgress};
use crate::timeout::{DeadlineHandler, TimeoutScheduler};

/// The assembled drill engine: session lifecycle on one side, callback
/// reconciliation on the other, sharing one scheduler and token registry.
pub struct DrillEngine {
    storage: Storage,
    manager: SessionManager,
    reconciler: Arc<CallbackReconciler>,
    registry: Arc<PollRegistry>,
    scheduler: Arc<TimeoutScheduler>,
    clock: Clock,
}

impl DrillEngine {
    /// Wires the engine over the given storage and channel endpoints.
    #[must_use]
    pub fn new(
        storage: Storage,
        channel: Arc<dyn PollChannel>,
        sink: Arc<dyn NotificationSink>,
        clock: Clock,
        config: EngineConfig,
    ) -> Arc<Self> {
        let registry = Arc::new(PollRegistry::new(config.registry_capacity));
        let scheduler = Arc::new(TimeoutScheduler::new());
        let catalog = QuestionCatalog::new(storage.clone());
        let delivery = DeliveryCoordinator::new(
            storage.clone(),
            catalog.clone(),
            channel,
            registry.clone(),
            scheduler.clone(),
            clock,
            config.clone(),
        );
        let flow = SessionFlow::new(storage.clone(), delivery, sink.clone(), clock);
        let reconciler = Arc::new(CallbackReconciler::new(
            storage.clone(),
            registry.clone(),
            scheduler.clone(),
            RetryExecutor::new(config.retry),
            flow.clone(),
            sink.clone(),
            clock,
        ));
        // The reconciler arms timers through the scheduler and the scheduler
        // fires deadlines into the reconciler; the handler side is weak so
        // the pair can be dropped normally.
        let handler: Arc<dyn DeadlineHandler> = reconciler.clone();
        scheduler.install_handler(Arc::downgrade(&handler));

        let manager = SessionManager::new(
            storage.clone(),
            catalog,
            flow,
            scheduler.clone(),
            registry.clone(),
            sink,
            clock,
            config,
        );
        Arc::new(Self {
            storage,
            manager,
            reconciler,
            registry,
            scheduler,
            clock,
        })
    }

    /// Bootstraps an engine over a `SQLite` database.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Sqlite` when the database cannot be opened or
    /// migrated.
    pub async fn with_sqlite(
        database_url: &str,
        channel: Arc<dyn PollChannel>,
        sink: Arc<dyn NotificationSink>,
        config: EngineConfig,
    ) -> Result<Arc<Self>, EngineError> {
        let storage = Storage::sqlite(database_url).await?;
        Ok(Self::new(storage, channel, sink, Clock::default_clock(), config))
    }

    // ─── Session lifecycle ─────────────────────────────────────────────────

    /// See [`SessionManager::start_topic`].
    ///
    /// # Errors
    ///
    /// Propagates `SessionError` from the manager.
    pub async fn start_topic(
        &self,
        owner: &OwnerId,
        topic: &str,
        count: u32,
    ) -> Result<Session, SessionError> {
        self.manager.start_topic(owner, topic, count).await
    }

    /// See [`SessionManager::start_failed`].
    ///
    /// # Errors
    ///
    /// Propagates `SessionError` from the manager.
    pub async fn start_failed(
        &self,
        owner: &OwnerId,
        topic: Option<&str>,
        count: u32,
    ) -> Result<Session, SessionError> {
        self.manager.start_failed(owner, topic, count).await
    }

    /// See [`SessionManager::start_random`].
    ///
    /// # Errors
    ///
    /// Propagates `SessionError` from the manager.
    pub async fn start_random(&self, owner: &OwnerId, count: u32) -> Result<Session, SessionError> {
        self.manager.start_random(owner, count).await
    }

    /// See [`SessionManager::stop`].
    ///
    /// # Errors
    ///
    /// Propagates `SessionError` from the manager.
    pub async fn stop(&self, owner: &OwnerId) -> Result<Session, SessionError> {
        self.manager.stop(owner).await
    }

    /// See [`SessionManager::progress`].
    ///
    /// # Errors
    ///
    /// Propagates `SessionError` from the manager.
    pub async fn progress(&self, owner: &OwnerId) -> Result<SessionProgress, SessionError> {
        self.manager.progress(owner).await
    }

    /// See [`SessionManager::expire_stale`].
    ///
    /// # Errors
    ///
    /// Propagates `SessionError` from the manager.
    pub async fn expire_stale(&self) -> Result<usize, SessionError> {
        self.manager.expire_stale().await
    }

    // ─── Callbacks ─────────────────────────────────────────────────────────

    /// Reconciles an answer callback from the channel.
    ///
    /// # Errors
    ///
    /// Propagates `ReconcileError` from the reconciler.
    pub async fn answer(
        &self,
        token: &PollToken,
        selected: usize,
    ) -> Result<Resolution, ReconcileError> {
        self.reconciler.resolve_answer(token, selected).await
    }

    // ─── Queries ───────────────────────────────────────────────────────────

    /// Lifetime stats for an owner on one topic.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::UnknownTopic` for a malformed topic name and
    /// `SessionError::Storage` on backend failure.
    pub async fn stats(&self, owner: &OwnerId, topic: &str) -> Result<SubjectStats, SessionError> {
        let topic =
            Topic::new(topic).map_err(|_| SessionError::UnknownTopic(topic.to_owned()))?;
        Ok(self.storage.stats.get_stats(owner, &topic).await?)
    }

    /// Topics available in the catalog.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Storage` on backend failure.
    pub async fn topics(&self) -> Result<Vec<Topic>, SessionError> {
        Ok(self.storage.questions.topics().await?)
    }

    // ─── Recovery ──────────────────────────────────────────────────────────

    /// Re-arms deadline timers and token mappings for every response that
    /// was pending at shutdown. Deadlines already in the past fire
    /// immediately. Returns the number of responses re-armed.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Storage` on backend failure.
    pub async fn recover(&self) -> Result<usize, SessionError> {
        let now = self.clock.now();
        let pending = self.storage.responses.pending_responses().await?;
        let count = pending.len();
        for response in pending {
            let remaining = (response.deadline_at() - now)
                .to_std()
                .unwrap_or(Duration::ZERO);
            self.registry
                .insert(response.token().clone(), response.id());
            self.scheduler.arm(response.id(), remaining);
        }
        if count > 0 {
            info!(count, "re-armed pending question deadlines");
        }
        Ok(count)
    }

    /// Aborts every outstanding deadline timer.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::Resolution;
    use crate::test_support::{RecordingSink, ScriptedChannel};
    use drill_core::model::{
        PendingResponse, PollKind, Question, QuestionId, ResponseId, ResponseState, SessionId,
        SessionStatus, TopicSelector,
    };
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use drill_core::model::ResponseOutcome;
    use drill_core::time::{fixed_clock, fixed_now};
    use std::sync::atomic::{AtomicU32, Ordering};
    use storage::repository::{
        DegradedRecord, InMemoryRepository, QuestionRepository, ResolveOutcome,
        ResponseRepository, SessionRepository, StatsRepository, StorageError,
    };

    struct Harness {
        repo: InMemoryRepository,
        channel: Arc<ScriptedChannel>,
        sink: Arc<RecordingSink>,
        engine: Arc<DrillEngine>,
    }

    fn harness() -> Harness {
        let repo = InMemoryRepository::new();
        let channel = Arc::new(ScriptedChannel::new());
        let sink = Arc::new(RecordingSink::new());
        let engine = DrillEngine::new(
            Storage::from_in_memory(repo.clone()),
            channel.clone(),
            sink.clone(),
            fixed_clock(),
            EngineConfig::default(),
        );
        Harness {
            repo,
            channel,
            sink,
            engine,
        }
    }

    fn question(topic: &str, n: u32) -> Question {
        Question::new(
            QuestionId::generate(),
            Topic::new(topic).unwrap(),
            n,
            format!("Question {n}?"),
            vec!["a".into(), "b".into(), "c".into()],
            0,
        )
        .unwrap()
    }

    async fn seed(h: &Harness, topic: &str, n: u32) {
        for i in 0..n {
            h.repo.upsert_question(&question(topic, i)).await.unwrap();
        }
    }

    fn owner() -> OwnerId {
        OwnerId::new("owner-1")
    }

    /// Token and correct/wrong positions of the most recent poll.
    fn last_poll(h: &Harness) -> (PollToken, usize, usize) {
        let sent = h.channel.sent();
        let (_, draft) = sent.last().expect("no poll sent");
        let correct = draft.correct_index();
        let wrong = (correct + 1) % draft.options().len();
        let token = PollToken::new(format!("tok-{}", sent.len() - 1));
        (token, correct, wrong)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn full_session_delivers_summary_and_stats() {
        let h = harness();
        seed(&h, "armada", 5).await;
        let session = h.engine.start_topic(&owner(), "armada", 2).await.unwrap();

        let (token, correct, _) = last_poll(&h);
        let r = h.engine.answer(&token, correct).await.unwrap();
        assert!(matches!(r, Resolution::Applied(_)));

        // Second question went out automatically.
        assert_eq!(h.channel.sent_count(), 2);
        let (token, _, wrong) = last_poll(&h);
        h.engine.answer(&token, wrong).await.unwrap();

        let stored = h.repo.get_session(session.id()).await.unwrap();
        assert_eq!(stored.status(), SessionStatus::Completed);
        assert_eq!(stored.resolved(), 2);

        let stats = h.engine.stats(&owner(), "armada").await.unwrap();
        assert_eq!(stats.resolved(), 2);
        assert_eq!(stats.correct(), 1);
        assert_eq!(stats.incorrect(), 1);
        assert_eq!(stats.current_streak(), 0);
        assert_eq!(stats.best_streak(), 1);

        let messages = h.sink.messages();
        assert!(
            messages
                .iter()
                .any(|(_, text)| text.contains("Session finished")
                    && text.contains("1/2 correct"))
        );
    }

    #[tokio::test]
    async fn duplicate_answer_is_ignored() {
        let h = harness();
        seed(&h, "armada", 5).await;
        h.engine.start_topic(&owner(), "armada", 2).await.unwrap();

        let (token, correct, wrong) = last_poll(&h);
        h.engine.answer(&token, correct).await.unwrap();
        let second = h.engine.answer(&token, wrong).await.unwrap();
        assert_eq!(second, Resolution::Duplicate(ResponseState::Answered));

        // The duplicate neither advanced the session nor touched stats.
        assert_eq!(h.channel.sent_count(), 2);
        let stats = h.engine.stats(&owner(), "armada").await.unwrap();
        assert_eq!(stats.resolved(), 1);
        assert_eq!(stats.correct(), 1);
    }

    #[tokio::test]
    async fn unknown_token_is_reported_not_errored() {
        let h = harness();
        seed(&h, "armada", 2).await;
        h.engine.start_topic(&owner(), "armada", 1).await.unwrap();
        let r = h
            .engine
            .answer(&PollToken::new("never-issued"), 0)
            .await
            .unwrap();
        assert_eq!(r, Resolution::UnknownToken);
    }

    #[tokio::test]
    async fn foreign_poll_kinds_are_ignored() {
        let h = harness();
        let mut session = Session::new(
            SessionId::generate(),
            owner(),
            TopicSelector::Single(Topic::new("armada").unwrap()),
            1,
            fixed_now(),
        );
        h.repo.insert_session(&session).await.unwrap();
        let q = question("armada", 1);
        h.repo.upsert_question(&q).await.unwrap();
        let response = PendingResponse::new(
            ResponseId::generate(),
            session.id(),
            q.id(),
            q.topic().clone(),
            PollKind::Duel,
            PollToken::new("duel-tok"),
            1,
            0,
            fixed_now(),
            fixed_now() + chrono::Duration::seconds(60),
        );
        session.record_delivery(q.id(), fixed_now()).unwrap();
        h.repo.record_delivery(&session, &response).await.unwrap();

        let r = h.engine.answer(&PollToken::new("duel-tok"), 0).await.unwrap();
        assert_eq!(r, Resolution::Ignored);
        let stored = h.repo.get_response(response.id()).await.unwrap();
        assert!(stored.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_resolves_and_late_answer_is_duplicate() {
        let h = harness();
        seed(&h, "armada", 5).await;
        h.engine.start_topic(&owner(), "armada", 2).await.unwrap();
        let (token, correct, _) = last_poll(&h);

        tokio::time::sleep(Duration::from_secs(61)).await;
        settle().await;

        // The timeout won and the next question went out.
        assert_eq!(h.channel.sent_count(), 2);
        let stats = h.engine.stats(&owner(), "armada").await.unwrap();
        assert_eq!(stats.timed_out(), 1);
        assert_eq!(stats.resolved(), 1);
        assert!(
            h.sink
                .messages()
                .iter()
                .any(|(_, text)| text.contains("Time is up"))
        );

        let late = h.engine.answer(&token, correct).await.unwrap();
        assert_eq!(late, Resolution::Duplicate(ResponseState::TimedOut));
        let stats = h.engine.stats(&owner(), "armada").await.unwrap();
        assert_eq!(stats.resolved(), 1);
        assert_eq!(stats.correct(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn answer_disarms_the_deadline() {
        let h = harness();
        seed(&h, "armada", 5).await;
        h.engine.start_topic(&owner(), "armada", 2).await.unwrap();
        let (token, correct, _) = last_poll(&h);
        h.engine.answer(&token, correct).await.unwrap();

        // Sleep past the first question's original deadline; only the second
        // question's timer should fire.
        tokio::time::sleep(Duration::from_secs(61)).await;
        settle().await;

        let stats = h.engine.stats(&owner(), "armada").await.unwrap();
        assert_eq!(stats.correct(), 1);
        assert_eq!(stats.timed_out(), 1);
        assert_eq!(stats.resolved(), 2);
    }

    #[tokio::test]
    async fn timeout_does_not_break_the_streak() {
        let h = harness();
        seed(&h, "armada", 5).await;
        h.engine.start_topic(&owner(), "armada", 3).await.unwrap();

        let (token, correct, _) = last_poll(&h);
        h.engine.answer(&token, correct).await.unwrap();

        // Resolve the second question as a timeout directly through the
        // engine's deadline path.
        let pending = h.repo.pending_responses().await.unwrap();
        assert_eq!(pending.len(), 1);
        let timed_out = h
            .engine
            .reconciler
            .resolve_timeout(pending[0].id())
            .await
            .unwrap();
        assert!(matches!(timed_out, Resolution::Applied(_)));

        let (token, correct, _) = last_poll(&h);
        h.engine.answer(&token, correct).await.unwrap();

        let stats = h.engine.stats(&owner(), "armada").await.unwrap();
        assert_eq!(stats.current_streak(), 2);
        assert_eq!(stats.timed_out(), 1);
    }

    #[tokio::test]
    async fn starting_a_new_session_supersedes_the_old() {
        let h = harness();
        seed(&h, "armada", 5).await;
        let first = h.engine.start_topic(&owner(), "armada", 3).await.unwrap();
        let second = h.engine.start_topic(&owner(), "armada", 2).await.unwrap();

        let stored = h.repo.get_session(first.id()).await.unwrap();
        assert_eq!(stored.status(), SessionStatus::Cancelled);
        assert_ne!(first.id(), second.id());
        let progress = h.engine.progress(&owner()).await.unwrap();
        assert_eq!(progress.session_id, second.id());

        // The superseded session's poll no longer resolves.
        let sent = h.channel.sent();
        assert_eq!(sent.len(), 2);
        let old_token = PollToken::new("tok-0");
        let r = h.engine.answer(&old_token, 0).await.unwrap();
        assert!(matches!(r, Resolution::Applied(_) | Resolution::Duplicate(_)));
        let current = h.repo.get_session(second.id()).await.unwrap();
        // Whatever happened to the old poll, the new session is untouched.
        assert_eq!(current.resolved(), 0);
    }

    #[tokio::test]
    async fn failed_session_draws_from_the_retry_pool_and_graduates() {
        let h = harness();
        seed(&h, "armada", 3).await;
        // Fail one question in a normal session.
        h.engine.start_topic(&owner(), "armada", 1).await.unwrap();
        let (token, _, wrong) = last_poll(&h);
        h.engine.answer(&token, wrong).await.unwrap();
        let failed_question = {
            let sessions = h.repo.active_sessions().await.unwrap();
            assert!(sessions.is_empty());
            let stats = h.engine.stats(&owner(), "armada").await.unwrap();
            assert_eq!(stats.incorrect(), 1);
            h.channel.sent()[0].1.clone()
        };

        // The retry session replays exactly that question.
        let session = h.engine.start_failed(&owner(), None, 10).await.unwrap();
        assert_eq!(session.target(), 1);
        let (token, correct, _) = last_poll(&h);
        let replay = h.channel.sent().last().unwrap().1.clone();
        assert_eq!(
            replay.options()[replay.correct_index()],
            failed_question.options()[failed_question.correct_index()]
        );
        h.engine.answer(&token, correct).await.unwrap();

        // A correct answer later than the failure graduates the question.
        let err = h.engine.start_failed(&owner(), None, 10).await.unwrap_err();
        assert!(matches!(err, SessionError::NothingToRetry));
    }

    #[tokio::test]
    async fn random_session_spreads_across_topics() {
        let h = harness();
        for topic in ["alpha", "beta", "gamma"] {
            seed(&h, topic, 10).await;
        }
        let session = h.engine.start_random(&owner(), 9).await.unwrap();
        assert_eq!(session.target(), 9);
        assert_eq!(session.planned().len(), 9);
        let unique: std::collections::HashSet<_> = session.planned().iter().collect();
        assert_eq!(unique.len(), 9);
    }

    #[tokio::test]
    async fn count_bounds_are_enforced() {
        let h = harness();
        seed(&h, "armada", 5).await;
        assert!(matches!(
            h.engine.start_topic(&owner(), "armada", 0).await,
            Err(SessionError::InvalidCount(0))
        ));
        assert!(matches!(
            h.engine.start_topic(&owner(), "armada", 51).await,
            Err(SessionError::InvalidCount(51))
        ));
    }

    #[tokio::test]
    async fn stop_without_session_is_an_error() {
        let h = harness();
        assert!(matches!(
            h.engine.stop(&owner()).await,
            Err(SessionError::NoActiveSession)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn recover_rearms_persisted_pending_responses() {
        let repo = InMemoryRepository::new();
        let q = question("armada", 1);
        repo.upsert_question(&q).await.unwrap();
        let mut session = Session::new(
            SessionId::generate(),
            owner(),
            TopicSelector::Single(q.topic().clone()),
            1,
            fixed_now(),
        );
        repo.insert_session(&session).await.unwrap();
        let response = PendingResponse::new(
            ResponseId::generate(),
            session.id(),
            q.id(),
            q.topic().clone(),
            PollKind::Study,
            PollToken::new("orphan-tok"),
            1,
            0,
            fixed_now(),
            fixed_now() + chrono::Duration::seconds(60),
        );
        session.record_delivery(q.id(), fixed_now()).unwrap();
        repo.record_delivery(&session, &response).await.unwrap();

        let channel = Arc::new(ScriptedChannel::new());
        let sink = Arc::new(RecordingSink::new());
        let engine = DrillEngine::new(
            Storage::from_in_memory(repo.clone()),
            channel,
            sink,
            fixed_clock(),
            EngineConfig::default(),
        );
        assert_eq!(engine.recover().await.unwrap(), 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        let stored = repo.get_response(response.id()).await.unwrap();
        assert_eq!(stored.state(), ResponseState::TimedOut);
    }

    #[tokio::test]
    async fn expire_stale_only_touches_idle_sessions() {
        let h = harness();
        seed(&h, "armada", 5).await;
        h.engine.start_topic(&owner(), "armada", 3).await.unwrap();
        let (token, _, _) = last_poll(&h);
        assert_eq!(h.engine.scheduler.armed_count(), 1);
        // Fresh session: nothing to expire.
        assert_eq!(h.engine.expire_stale().await.unwrap(), 0);
        assert_eq!(h.engine.scheduler.armed_count(), 1);

        // Age the session past the cutoff by rewriting its activity stamp.
        let session = h.repo.find_active(&owner()).await.unwrap().unwrap();
        let aged = Session::from_persisted(
            session.id(),
            session.owner().clone(),
            session.selector().clone(),
            session.target(),
            session.resolved(),
            session.status(),
            session.cancel_reason(),
            session.started_at() - chrono::Duration::hours(2),
            session.last_activity_at() - chrono::Duration::hours(2),
            session.delivered().to_vec(),
            session.planned().to_vec(),
        );
        h.repo.update_session(&aged).await.unwrap();

        assert_eq!(h.engine.expire_stale().await.unwrap(), 1);
        let stored = h.repo.get_session(session.id()).await.unwrap();
        assert_eq!(stored.status(), SessionStatus::Expired);
        // Expiry disarms the outstanding deadline and token mapping, same
        // as an explicit cancel.
        assert_eq!(h.engine.scheduler.armed_count(), 0);
        assert!(h.engine.registry.lookup(&token).is_none());
    }

    /// Stats backend that keeps failing `apply_resolution` while delegating
    /// everything else to the in-memory repository.
    struct OutageStats {
        inner: InMemoryRepository,
    }

    #[async_trait]
    impl StatsRepository for OutageStats {
        async fn get_stats(
            &self,
            owner: &OwnerId,
            topic: &Topic,
        ) -> Result<SubjectStats, StorageError> {
            self.inner.get_stats(owner, topic).await
        }

        async fn apply_resolution(
            &self,
            _owner: &OwnerId,
            _response: &PendingResponse,
            _outcome: ResponseOutcome,
            _at: DateTime<Utc>,
        ) -> Result<bool, StorageError> {
            Err(StorageError::Connection("stats backend down".into()))
        }

        async fn record_degraded(&self, record: &DegradedRecord) -> Result<(), StorageError> {
            self.inner.record_degraded(record).await
        }

        async fn reset_seen(&self, owner: &OwnerId, topic: &Topic) -> Result<(), StorageError> {
            self.inner.reset_seen(owner, topic).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stats_outage_degrades_to_an_audit_row_and_still_advances() {
        let repo = InMemoryRepository::new();
        let channel = Arc::new(ScriptedChannel::new());
        let sink = Arc::new(RecordingSink::new());
        let mut storage = Storage::from_in_memory(repo.clone());
        storage.stats = Arc::new(OutageStats {
            inner: repo.clone(),
        });
        let engine = DrillEngine::new(
            storage,
            channel.clone(),
            sink.clone(),
            fixed_clock(),
            EngineConfig::default(),
        );
        let h = Harness {
            repo: repo.clone(),
            channel,
            sink,
            engine,
        };
        seed(&h, "armada", 3).await;
        let session = h.engine.start_topic(&owner(), "armada", 2).await.unwrap();

        let (token, correct, _) = last_poll(&h);
        let r = h.engine.answer(&token, correct).await.unwrap();
        assert!(matches!(r, Resolution::Applied(_)));

        // The retries were exhausted, the resolution landed in the audit
        // table, and the session still moved to its second question.
        let degraded = repo.degraded_records().unwrap();
        assert_eq!(degraded.len(), 1);
        assert_eq!(degraded[0].correct, Some(true));
        assert_eq!(h.channel.sent_count(), 2);
        let stored = h.repo.get_session(session.id()).await.unwrap();
        assert_eq!(stored.resolved(), 1);
    }

    /// Response backend whose compare-and-set fails transiently a scripted
    /// number of times before delegating.
    struct ContendedResponses {
        inner: InMemoryRepository,
        failures: AtomicU32,
    }

    #[async_trait]
    impl ResponseRepository for ContendedResponses {
        async fn get_response(&self, id: ResponseId) -> Result<PendingResponse, StorageError> {
            self.inner.get_response(id).await
        }

        async fn find_by_token(
            &self,
            token: &PollToken,
        ) -> Result<Option<PendingResponse>, StorageError> {
            self.inner.find_by_token(token).await
        }

        async fn try_resolve(
            &self,
            id: ResponseId,
            outcome: ResponseOutcome,
            resolved_at: DateTime<Utc>,
        ) -> Result<ResolveOutcome, StorageError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(StorageError::Conflict);
            }
            self.inner.try_resolve(id, outcome, resolved_at).await
        }

        async fn list_for_session(
            &self,
            session: SessionId,
        ) -> Result<Vec<PendingResponse>, StorageError> {
            self.inner.list_for_session(session).await
        }

        async fn pending_responses(&self) -> Result<Vec<PendingResponse>, StorageError> {
            self.inner.pending_responses().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn contended_resolution_is_retried_not_surfaced() {
        let repo = InMemoryRepository::new();
        let channel = Arc::new(ScriptedChannel::new());
        let sink = Arc::new(RecordingSink::new());
        let responses = Arc::new(ContendedResponses {
            inner: repo.clone(),
            failures: AtomicU32::new(2),
        });
        let mut storage = Storage::from_in_memory(repo.clone());
        storage.responses = responses.clone();
        let engine = DrillEngine::new(
            storage,
            channel.clone(),
            sink.clone(),
            fixed_clock(),
            EngineConfig::default(),
        );
        let h = Harness {
            repo: repo.clone(),
            channel,
            sink,
            engine,
        };
        seed(&h, "armada", 2).await;
        h.engine.start_topic(&owner(), "armada", 1).await.unwrap();

        let (token, correct, _) = last_poll(&h);
        let r = h.engine.answer(&token, correct).await.unwrap();
        assert!(matches!(r, Resolution::Applied(_)));
        assert_eq!(responses.failures.load(Ordering::SeqCst), 0);

        let stats = h.engine.stats(&owner(), "armada").await.unwrap();
        assert_eq!(stats.resolved(), 1);
        assert_eq!(stats.correct(), 1);
    }
}
