use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use drill_core::model::ResponseId;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Receiver for elapsed question deadlines.
#[async_trait]
pub trait DeadlineHandler: Send + Sync {
    async fn deadline_elapsed(&self, response: ResponseId);
}

/// One timer per outstanding question.
///
/// The handler is installed after wiring because the reconciler that handles
/// deadlines also arms new ones through this scheduler; holding it as a
/// `Weak` keeps the cycle from leaking. A deadline firing with no live
/// handler is dropped, which is safe: resolution is a compare-and-set, and
/// the startup sweep re-arms anything still pending.
pub struct TimeoutScheduler {
    handler: OnceLock<Weak<dyn DeadlineHandler>>,
    timers: Mutex<HashMap<ResponseId, JoinHandle<()>>>,
}

impl Default for TimeoutScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeoutScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            handler: OnceLock::new(),
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Installs the deadline handler. Later calls are ignored.
    pub fn install_handler(&self, handler: Weak<dyn DeadlineHandler>) {
        if self.handler.set(handler).is_err() {
            warn!("deadline handler installed twice, keeping the first");
        }
    }

    /// Arms (or re-arms) the deadline timer for a response. An existing
    /// timer for the same response is replaced.
    pub fn arm(self: &Arc<Self>, response: ResponseId, delay: Duration) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(scheduler) = weak.upgrade() else {
                return;
            };
            if let Ok(mut timers) = scheduler.timers.lock() {
                timers.remove(&response);
            }
            let Some(handler) = scheduler.handler.get().and_then(Weak::upgrade) else {
                warn!(%response, "deadline elapsed with no handler installed");
                return;
            };
            handler.deadline_elapsed(response).await;
        });
        if let Ok(mut timers) = self.timers.lock() {
            if let Some(old) = timers.insert(response, handle) {
                old.abort();
            }
        }
    }

    /// Cancels the timer for a response that resolved before its deadline.
    pub fn cancel(&self, response: ResponseId) {
        if let Ok(mut timers) = self.timers.lock() {
            if let Some(handle) = timers.remove(&response) {
                handle.abort();
                debug!(%response, "deadline timer cancelled");
            }
        }
    }

    /// Aborts every outstanding timer.
    pub fn shutdown(&self) {
        if let Ok(mut timers) = self.timers.lock() {
            for (_, handle) in timers.drain() {
                handle.abort();
            }
        }
    }

    #[must_use]
    pub fn armed_count(&self) -> usize {
        self.timers.lock().map(|t| t.len()).unwrap_or(0)
    }
}
