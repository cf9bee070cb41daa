//! Request table - tracks in-flight requests and routes replies to them.
//!
//! Every resolution path (reply, cancellation, timeout, send failure, daemon
//! exit) goes through an atomic remove under the table mutex. Whoever removes
//! the entry wins; everyone else finds it gone and does nothing. Completions
//! are sent after the lock is released.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex as StdMutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::bridge::protocol::RequestId;
use crate::session::SessionError;
use crate::supervisor::DaemonId;

/// What a waiting caller eventually receives.
pub type Completion = Result<String, SessionError>;

/// How many abandoned ids are remembered for log classification.
const ABANDONED_MEMORY: usize = 1024;

/// Bookkeeping for one outstanding request.
pub struct PendingRequest {
    id: RequestId,
    daemon: DaemonId,
    created_at: Instant,
    completion: oneshot::Sender<Completion>,
}

impl PendingRequest {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn daemon(&self) -> DaemonId {
        self.daemon
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn complete(self, result: Completion) {
        // The receiver is gone if the caller stopped waiting; nothing to do.
        let _ = self.completion.send(result);
    }
}

/// Where a reply ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    Delivered,
    /// The request was canceled or timed out before the reply arrived.
    Late,
    /// No such request was ever outstanding (or it was drained).
    Unknown,
}

struct TableInner {
    next_id: u64,
    entries: HashMap<RequestId, PendingRequest>,
    /// Abandoned ids with the daemon they were sent to.
    abandoned: VecDeque<(RequestId, DaemonId)>,
}

impl TableInner {
    fn remember_abandoned(&mut self, id: RequestId, daemon: DaemonId) {
        if self.abandoned.len() == ABANDONED_MEMORY {
            self.abandoned.pop_front();
        }
        self.abandoned.push_back((id, daemon));
    }

    fn forget_abandoned(&mut self, id: RequestId) -> bool {
        match self.abandoned.iter().position(|(a, _)| *a == id) {
            Some(pos) => {
                self.abandoned.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// Mapping from request id to the caller waiting on it.
pub struct RequestTable {
    inner: StdMutex<TableInner>,
}

impl Default for RequestTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTable {
    pub fn new() -> Self {
        Self {
            inner: StdMutex::new(TableInner {
                next_id: 1,
                entries: HashMap::new(),
                abandoned: VecDeque::new(),
            }),
        }
    }

    /// Lock the table. On poison: logs and recovers, since every critical
    /// section leaves the map consistent.
    fn lock(&self) -> MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Request table mutex poisoned - recovering");
            poisoned.into_inner()
        })
    }

    /// Allocate the next id and start tracking it.
    pub fn register(&self, daemon: DaemonId) -> (RequestId, oneshot::Receiver<Completion>) {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.lock();
        let id = RequestId::new(inner.next_id);
        inner.next_id += 1;
        inner.entries.insert(
            id,
            PendingRequest {
                id,
                daemon,
                created_at: Instant::now(),
                completion: tx,
            },
        );
        (id, rx)
    }

    /// Deliver a reply. No-op (reported as `Late` or `Unknown`) if the entry
    /// is already gone.
    pub fn resolve(&self, id: RequestId, result: Completion) -> Routed {
        let entry = {
            let mut inner = self.lock();
            match inner.entries.remove(&id) {
                Some(entry) => Ok(entry),
                None => Err(inner.forget_abandoned(id)),
            }
        };
        match entry {
            Ok(entry) => {
                entry.complete(result);
                Routed::Delivered
            }
            Err(true) => Routed::Late,
            Err(false) => Routed::Unknown,
        }
    }

    /// Stop tracking `id` and fail it with [`SessionError::Canceled`].
    ///
    /// Returns false if the request was already resolved.
    pub fn cancel(&self, id: RequestId) -> bool {
        self.cancel_with(id, SessionError::Canceled)
    }

    /// Stop tracking `id` and fail it with `error` (timeouts, send failures).
    pub fn cancel_with(&self, id: RequestId, error: SessionError) -> bool {
        let entry = {
            let mut inner = self.lock();
            let entry = inner.entries.remove(&id);
            if let Some(entry) = &entry {
                inner.remember_abandoned(id, entry.daemon);
            }
            entry
        };
        match entry {
            Some(entry) => {
                entry.complete(Err(error));
                true
            }
            None => false,
        }
    }

    /// Remove every entry and fail each with `error`.
    pub fn drain_all(&self, error: SessionError) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut inner = self.lock();
            inner.abandoned.clear();
            inner.entries.drain().map(|(_, entry)| entry).collect()
        };
        Self::fail_all(drained, error)
    }

    /// Remove the entries sent to one daemon and fail each with `error`.
    ///
    /// Used on process exit so that a restart racing with the old process's
    /// exit report never fails requests already sent to the new one.
    pub fn drain_daemon(&self, daemon: DaemonId, error: SessionError) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut inner = self.lock();
            // Late replies from the dead daemon can no longer arrive; a newer
            // daemon's abandoned ids still can.
            inner.abandoned.retain(|(_, d)| *d != daemon);
            let ids: Vec<RequestId> = inner
                .entries
                .values()
                .filter(|entry| entry.daemon == daemon)
                .map(|entry| entry.id)
                .collect();
            ids.iter()
                .filter_map(|id| inner.entries.remove(id))
                .collect()
        };
        Self::fail_all(drained, error)
    }

    fn fail_all(drained: Vec<PendingRequest>, error: SessionError) -> usize {
        let count = drained.len();
        for entry in drained {
            entry.complete(Err(error.clone()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.lock().entries.contains_key(&id)
    }

    /// Age of the longest-waiting request.
    pub fn oldest_age(&self) -> Option<Duration> {
        self.lock().entries.values().map(PendingRequest::age).max()
    }
}

/// Guard that cancels its request on drop unless it was resolved.
///
/// Covers callers that drop a `format()` future mid-flight (e.g. the editor
/// abandoned the command): the entry must not linger in the table.
pub struct PendingGuard<'a> {
    table: &'a RequestTable,
    id: RequestId,
}

impl<'a> PendingGuard<'a> {
    pub fn new(table: &'a RequestTable, id: RequestId) -> Self {
        Self { table, id }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.cancel(self.id);
    }
}
