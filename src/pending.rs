//! Tracker for in-flight asynchronous image requests.
//!
//! Each entry pairs the correlation token issued by the service with the
//! pooled buffer reserved for the response. Entries that outlive the timeout
//! are purged and actively cancelled; a lookup miss is a normal outcome when
//! a completion races a cancellation.

use std::sync::Mutex;

use crate::service::RequestToken;

/// Requests older than this are considered abandoned (microseconds).
pub const REQUEST_TIMEOUT_US: i64 = 90_000;

struct Entry<B> {
    token: RequestToken,
    payload: B,
    issued_us: i64,
}

pub struct PendingRequests<B> {
    entries: Mutex<Vec<Entry<B>>>,
    timeout_us: i64,
}

impl<B> PendingRequests<B> {
    pub fn new() -> Self {
        Self::with_timeout(REQUEST_TIMEOUT_US)
    }

    pub fn with_timeout(timeout_us: i64) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            timeout_us,
        }
    }

    pub fn add(&self, token: RequestToken, payload: B, now_us: i64) {
        self.entries.lock().unwrap().push(Entry {
            token,
            payload,
            issued_us: now_us,
        });
    }

    /// Linear scan-and-remove by token. `None` when the entry was already
    /// purged or cancelled.
    pub fn find_and_remove(&self, token: RequestToken) -> Option<B> {
        let mut entries = self.entries.lock().unwrap();
        let index = entries.iter().position(|e| e.token == token)?;
        Some(entries.remove(index).payload)
    }

    /// Removes every entry older than the timeout, invoking `cancel` for each
    /// so the caller can notify the service and release the buffer. Returns
    /// the number purged.
    pub fn purge_old(&self, now_us: i64, mut cancel: impl FnMut(RequestToken, B)) -> usize {
        let expired: Vec<Entry<B>> = {
            let mut entries = self.entries.lock().unwrap();
            let mut expired = Vec::new();
            let mut i = 0;
            while i < entries.len() {
                if now_us - entries[i].issued_us > self.timeout_us {
                    expired.push(entries.remove(i));
                } else {
                    i += 1;
                }
            }
            expired
        };
        let purged = expired.len();
        for entry in expired {
            cancel(entry.token, entry.payload);
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<B> Default for PendingRequests<B> {
    fn default() -> Self {
        Self::new()
    }
}
