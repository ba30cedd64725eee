// ── Correlation table ──
//
// In-flight calls keyed by correlation id. Each entry holds the waiter's
// oneshot sender and a deadline. Resolution and expiry both remove the
// entry under the table lock, so whichever runs first completes the call
// and the other becomes a no-op.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tokio::time::Instant;

use devlink_api::Message;

use crate::call::Outcome;
use crate::error::CoreError;

/// Result of offering a response to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// A waiter was registered for the id and has been completed.
    Matched,
    /// No waiter: unknown id, already resolved, or already expired.
    Unmatched,
}

struct Entry {
    tx: oneshot::Sender<Outcome>,
    deadline: Instant,
    created: Instant,
}

#[derive(Default)]
pub struct CorrelationTable {
    entries: Mutex<HashMap<String, Entry>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a waiter for `id`. Fails if `id` is already in flight.
    pub fn register(
        &self,
        id: &str,
        deadline: Instant,
    ) -> Result<oneshot::Receiver<Outcome>, CoreError> {
        let mut entries = self.lock();
        if entries.contains_key(id) {
            return Err(CoreError::DuplicateCorrelation { id: id.to_owned() });
        }
        let (tx, rx) = oneshot::channel();
        entries.insert(
            id.to_owned(),
            Entry {
                tx,
                deadline,
                created: Instant::now(),
            },
        );
        Ok(rx)
    }

    /// Complete the waiter for `msg.id` with the response.
    pub fn resolve(&self, msg: Message) -> Resolution {
        let Some(entry) = self.lock().remove(&msg.id) else {
            return Resolution::Unmatched;
        };
        tracing::trace!(
            correlation_id = %msg.id,
            elapsed_ms = u64::try_from(entry.created.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Response matched"
        );
        // The caller may have dropped its handle; the entry is gone either way.
        let _ = entry.tx.send(Outcome::Response(Arc::new(msg)));
        Resolution::Matched
    }

    /// Time out every entry whose deadline is at or before `now`.
    pub fn expire(&self, now: Instant) -> Vec<String> {
        let expired: Vec<(String, Entry)> = {
            let mut entries = self.lock();
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|e| (id, e)))
                .collect()
        };

        expired
            .into_iter()
            .map(|(id, entry)| {
                tracing::debug!(correlation_id = %id, "Call timed out");
                let _ = entry.tx.send(Outcome::TimedOut);
                id
            })
            .collect()
    }

    /// Time out a single entry. Returns `false` if it was already resolved.
    pub fn expire_one(&self, id: &str) -> bool {
        let Some(entry) = self.lock().remove(id) else {
            return false;
        };
        tracing::debug!(correlation_id = %id, "Call timed out");
        let _ = entry.tx.send(Outcome::TimedOut);
        true
    }

    /// Drop an entry whose request never left, completing it as not sent.
    pub fn cancel(&self, id: &str, reason: &str) -> bool {
        let Some(entry) = self.lock().remove(id) else {
            return false;
        };
        let _ = entry.tx.send(Outcome::NotSent(reason.to_owned()));
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Earliest deadline in the table.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.lock().values().map(|e| e.deadline).min()
    }
}
