use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use drill_core::model::{OwnerId, PollToken, Question, QuestionId, SessionStatus, Topic};
use drill_core::poll::PollDraft;
use drill_core::time::fixed_clock;
use services::engine::DrillEngine;
use services::channel::{ChannelError, NotificationSink, PollChannel};
use services::config::EngineConfig;
use services::reconciler::Resolution;
use storage::repository::{QuestionRepository, SessionRepository, Storage};

struct CountingChannel {
    sent: Mutex<Vec<PollDraft>>,
    counter: AtomicU32,
}

impl CountingChannel {
    fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            counter: AtomicU32::new(0),
        }
    }

    fn draft(&self, n: usize) -> PollDraft {
        self.sent.lock().unwrap()[n].clone()
    }

    fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl PollChannel for CountingChannel {
    async fn send_poll(
        &self,
        _owner: &OwnerId,
        draft: &PollDraft,
    ) -> Result<PollToken, ChannelError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().unwrap().push(draft.clone());
        Ok(PollToken::new(format!("poll-{n}")))
    }
}

#[derive(Default)]
struct CollectingSink {
    messages: Mutex<Vec<String>>,
}

#[async_trait]
impl NotificationSink for CollectingSink {
    async fn notify(&self, _owner: &OwnerId, text: &str) {
        self.messages.lock().unwrap().push(text.to_owned());
    }
}

async fn seed_topic(storage: &Storage, topic: &str, count: u32) {
    let topic = Topic::new(topic).unwrap();
    for n in 0..count {
        let question = Question::new(
            QuestionId::generate(),
            topic.clone(),
            n,
            format!("Question {n}?"),
            vec!["alpha".into(), "beta".into(), "gamma".into()],
            0,
        )
        .unwrap();
        storage.questions.upsert_question(&question).await.unwrap();
    }
}

#[tokio::test]
async fn full_drill_over_sqlite() {
    let storage = Storage::sqlite("sqlite:file:memdb_drill_flow?mode=memory&cache=shared")
        .await
        .expect("connect sqlite");
    seed_topic(&storage, "armada", 5).await;

    let channel = Arc::new(CountingChannel::new());
    let sink = Arc::new(CollectingSink::default());
    let engine = DrillEngine::new(
        storage.clone(),
        channel.clone(),
        sink.clone(),
        fixed_clock(),
        EngineConfig::default(),
    );

    let owner = OwnerId::new("owner-1");
    let session = engine.start_topic(&owner, "armada", 2).await.unwrap();
    assert_eq!(channel.sent_count(), 1);

    // Correct answer on the first question.
    let draft = channel.draft(0);
    let r = engine
        .answer(&PollToken::new("poll-0"), draft.correct_index())
        .await
        .unwrap();
    assert!(matches!(r, Resolution::Applied(_)));
    assert_eq!(channel.sent_count(), 2);

    // Wrong answer on the second finishes the session.
    let draft = channel.draft(1);
    let wrong = (draft.correct_index() + 1) % draft.options().len();
    engine.answer(&PollToken::new("poll-1"), wrong).await.unwrap();

    let stored = storage.sessions.get_session(session.id()).await.unwrap();
    assert_eq!(stored.status(), SessionStatus::Completed);
    assert_eq!(stored.resolved(), 2);

    let stats = engine.stats(&owner, "armada").await.unwrap();
    assert_eq!(stats.resolved(), 2);
    assert_eq!(stats.correct(), 1);
    assert_eq!(stats.incorrect(), 1);

    let messages = sink.messages.lock().unwrap().clone();
    assert!(messages.iter().any(|m| m.contains("Session finished")));

    // Replayed callbacks stay idempotent across the persisted store.
    let replay = engine
        .answer(&PollToken::new("poll-1"), wrong)
        .await
        .unwrap();
    assert!(matches!(replay, Resolution::Duplicate(_)));
    let stats = engine.stats(&owner, "armada").await.unwrap();
    assert_eq!(stats.resolved(), 2);
}

#[tokio::test]
async fn failed_drill_replays_only_outstanding_failures() {
    let storage = Storage::sqlite("sqlite:file:memdb_drill_failed?mode=memory&cache=shared")
        .await
        .expect("connect sqlite");
    seed_topic(&storage, "armada", 3).await;

    let channel = Arc::new(CountingChannel::new());
    let sink = Arc::new(CollectingSink::default());
    let engine = DrillEngine::new(
        storage.clone(),
        channel.clone(),
        sink,
        fixed_clock(),
        EngineConfig::default(),
    );
    let owner = OwnerId::new("owner-1");

    // Fail one question.
    engine.start_topic(&owner, "armada", 1).await.unwrap();
    let draft = channel.draft(0);
    let wrong = (draft.correct_index() + 1) % draft.options().len();
    engine.answer(&PollToken::new("poll-0"), wrong).await.unwrap();

    // The retry session shrinks to the single outstanding failure.
    let session = engine.start_failed(&owner, Some("armada"), 10).await.unwrap();
    assert_eq!(session.target(), 1);
    let draft = channel.draft(1);
    engine
        .answer(&PollToken::new("poll-1"), draft.correct_index())
        .await
        .unwrap();

    // Everything graduated; a third retry session has nothing to draw.
    let err = engine.start_failed(&owner, None, 10).await.unwrap_err();
    assert!(matches!(err, services::SessionError::NothingToRetry));
}
