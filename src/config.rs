//! Continuations for asynchronous config reads and writes.
//!
//! Each request stashes a single-shot continuation keyed by the request id the
//! service issued. A second request for the same key before the first resolves
//! drops the older continuation; the last writer wins.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::service::ConfigValue;

enum Continuation {
    Get(Box<dyn FnOnce(ConfigValue) + Send>),
    Set(Box<dyn FnOnce(bool) + Send>),
}

#[derive(Default)]
struct State {
    by_request: HashMap<u32, Continuation>,
    by_key: HashMap<String, u32>,
}

#[derive(Default)]
pub struct ConfigRequests {
    state: Mutex<State>,
}

impl ConfigRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stash_get(
        &self,
        request_id: u32,
        key: &str,
        on_value: impl FnOnce(ConfigValue) + Send + 'static,
    ) {
        self.stash(request_id, key, Continuation::Get(Box::new(on_value)));
    }

    pub fn stash_set(
        &self,
        request_id: u32,
        key: &str,
        on_done: impl FnOnce(bool) + Send + 'static,
    ) {
        self.stash(request_id, key, Continuation::Set(Box::new(on_done)));
    }

    fn stash(&self, request_id: u32, key: &str, continuation: Continuation) {
        let mut state = self.state.lock().unwrap();
        if let Some(stale) = state.by_key.insert(key.to_string(), request_id) {
            state.by_request.remove(&stale);
        }
        state.by_request.insert(request_id, continuation);
    }

    /// Resolves a value response. The continuation runs at most once, outside
    /// the lock. Unknown request ids are ignored.
    pub fn complete_response(&self, request_id: u32, value: ConfigValue) {
        if let Some(Continuation::Get(on_value)) = self.take(request_id) {
            on_value(value);
        }
    }

    /// Resolves a write confirmation.
    pub fn complete_change(&self, request_id: u32, success: bool) {
        if let Some(Continuation::Set(on_done)) = self.take(request_id) {
            on_done(success);
        }
    }

    fn take(&self, request_id: u32) -> Option<Continuation> {
        let mut state = self.state.lock().unwrap();
        let continuation = state.by_request.remove(&request_id)?;
        state.by_key.retain(|_, id| *id != request_id);
        Some(continuation)
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().by_request.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
