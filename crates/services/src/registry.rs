use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use drill_core::model::{PollToken, ResponseId};

/// Bounded in-memory index from channel tokens to pending responses.
///
/// This is a hot-path cache in front of the persisted token column: lookups
/// that miss here fall through to storage, so eviction never loses answers.
/// Capacity is enforced by evicting the oldest mapping first.
pub struct PollRegistry {
    capacity: usize,
    inner: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    map: HashMap<PollToken, ResponseId>,
    order: VecDeque<PollToken>,
}

impl PollRegistry {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(RegistryState::default()),
        }
    }

    /// Registers a token, evicting the oldest mapping when full.
    pub fn insert(&self, token: PollToken, response: ResponseId) {
        let Ok(mut state) = self.inner.lock() else {
            return;
        };
        if !state.map.contains_key(&token) {
            while state.map.len() >= self.capacity {
                let Some(oldest) = state.order.pop_front() else {
                    break;
                };
                state.map.remove(&oldest);
            }
            state.order.push_back(token.clone());
        }
        state.map.insert(token, response);
    }

    #[must_use]
    pub fn lookup(&self, token: &PollToken) -> Option<ResponseId> {
        self.inner.lock().ok()?.map.get(token).copied()
    }

    /// Drops a mapping once its response is terminal.
    pub fn remove(&self, token: &PollToken) {
        if let Ok(mut state) = self.inner.lock() {
            state.map.remove(token);
            state.order.retain(|t| t != token);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().map(|s| s.map.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
