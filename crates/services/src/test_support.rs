//! Shared fakes for service tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use drill_core::model::{OwnerId, PollToken};
use drill_core::poll::PollDraft;

use crate::channel::{ChannelError, NotificationSink, PollChannel};

/// Poll channel that succeeds by default and fails on demand.
///
/// Failures are queued with `push_failure`; each send consumes at most one
/// queued failure before falling back to success.
#[derive(Default)]
pub(crate) struct ScriptedChannel {
    script: Mutex<VecDeque<ChannelError>>,
    sent: Mutex<Vec<(OwnerId, PollDraft)>>,
    counter: AtomicU32,
}

impl ScriptedChannel {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_failure(&self, error: ChannelError) {
        self.script.lock().unwrap().push_back(error);
    }

    pub(crate) fn sent(&self) -> Vec<(OwnerId, PollDraft)> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl PollChannel for ScriptedChannel {
    async fn send_poll(
        &self,
        owner: &OwnerId,
        draft: &PollDraft,
    ) -> Result<PollToken, ChannelError> {
        if let Some(error) = self.script.lock().unwrap().pop_front() {
            return Err(error);
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().unwrap().push((owner.clone(), draft.clone()));
        Ok(PollToken::new(format!("tok-{n}")))
    }
}

/// Notification sink that records every message.
#[derive(Default)]
pub(crate) struct RecordingSink {
    messages: Mutex<Vec<(OwnerId, String)>>,
}

impl RecordingSink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn messages(&self) -> Vec<(OwnerId, String)> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn notify(&self, owner: &OwnerId, text: &str) {
        self.messages
            .lock()
            .unwrap()
            .push((owner.clone(), text.to_owned()));
    }
}
