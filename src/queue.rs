//! The persistent request queue.
//!
//! The queue lives in memory and is mirrored into the [`DataStore`]:
//!
//! - one entry per request, keyed by its hyphenated id, holding the
//!   [encoded](crate::request::encode) request
//! - one index entry under [`INDEX_KEY`] holding the ids in queue order as a
//!   JSON array of strings
//!
//! The in-memory queue is authoritative. Store failures are logged and the
//! next successful [`RequestQueue::persist_index`] catches the index up.
//!
//! Producers may enqueue from any thread; only the scheduler pops, sends
//! and pushes back.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::observers::{Listener, ObserverHandle, ObserverRegistry};
use crate::request::{self, ApiRequest};
use crate::store::{self, DataStore};
use crate::types::RequestId;

/// Store key of the ordered id list.
pub const INDEX_KEY: &str = "courier_api_request_queue";

/// What one [`RequestQueue::enqueue`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOutcome {
    /// Requests actually inserted; duplicates are not counted.
    pub added: usize,
    /// True when the queue was empty before this call and is not now.
    pub was_empty: bool,
    /// Queue length after the call.
    pub depth: usize,
}

#[derive(Debug, Default)]
struct Inner {
    requests: VecDeque<ApiRequest>,
    ids: HashSet<RequestId>,
    initialized: bool,
}

impl Inner {
    fn clear(&mut self) {
        self.requests.clear();
        self.ids.clear();
    }
}

/// Ordered, de-duplicated, persisted queue of [`ApiRequest`]s.
pub struct RequestQueue {
    inner: Mutex<Inner>,
    store: Arc<dyn DataStore>,
    observers: ObserverRegistry<ApiRequest>,
}

impl RequestQueue {
    /// Creates an empty queue over `store`. Call [`RequestQueue::restore`]
    /// to load what a previous run left behind.
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        RequestQueue {
            inner: Mutex::new(Inner::default()),
            store,
            observers: ObserverRegistry::new(),
        }
    }

    /// Adds requests whose ids are not already queued.
    ///
    /// With `head_of_line` the batch goes to the front, keeping its own
    /// order. Each new request is persisted and broadcast; the index is
    /// rewritten once if anything was added.
    pub fn enqueue(&self, requests: Vec<ApiRequest>, head_of_line: bool) -> EnqueueOutcome {
        let mut added = Vec::with_capacity(requests.len());
        let (was_empty, depth) = {
            let mut inner = self.inner.lock();
            let was_empty = inner.requests.is_empty();
            let mut insert_at = 0;
            for request in requests {
                if !inner.ids.insert(request.id) {
                    trace!(request_id = %request.id, "Request already queued, skipping");
                    continue;
                }
                if head_of_line {
                    inner.requests.insert(insert_at, request.clone());
                    insert_at += 1;
                } else {
                    inner.requests.push_back(request.clone());
                }
                added.push(request);
            }
            (was_empty, inner.requests.len())
        };

        for request in &added {
            self.persist_entry(request);
        }
        if !added.is_empty() {
            self.persist_index_logged();
            debug!(added = added.len(), depth, head_of_line, "Enqueued requests");
        }
        for request in &added {
            self.observers.notify(request);
        }

        EnqueueOutcome {
            added: added.len(),
            was_empty: was_empty && !added.is_empty(),
            depth,
        }
    }

    /// Reloads the queue from the store.
    ///
    /// A no-op once initialized unless `force` is set. Index entries whose
    /// request is missing or undecodable are dropped (undecodable entries are
    /// also cleared from the store) and the index is rewritten. Returns the
    /// number of requests restored.
    #[instrument(skip_all, fields(force = force))]
    pub fn restore(&self, force: bool) -> usize {
        if self.inner.lock().initialized && !force {
            trace!("Queue already initialized");
            return self.len();
        }

        let (keys, mut mutated) = self.read_index();
        let mut restored = VecDeque::with_capacity(keys.len());
        let mut seen = HashSet::with_capacity(keys.len());

        for key in keys {
            match self.store.fetch(&key) {
                Ok(Some(json)) => match request::decode(&json) {
                    Ok(request) if seen.insert(request.id) => restored.push_back(request),
                    Ok(request) => {
                        warn!(request_id = %request.id, "Duplicate id in queue index, dropping");
                        mutated = true;
                    }
                    Err(e) => {
                        error!(key = %key, error = %e, "Undecodable queued request, dropping");
                        if let Err(e) = self.store.clear(&key) {
                            warn!(key = %key, error = %e, "Failed to clear undecodable request");
                        }
                        mutated = true;
                    }
                },
                Ok(None) => {
                    error!(key = %key, "Queued request missing from store, dropping");
                    mutated = true;
                }
                Err(e) => {
                    error!(key = %key, error = %e, "Failed to read queued request, dropping");
                    mutated = true;
                }
            }
        }

        let count = restored.len();
        {
            let mut inner = self.inner.lock();
            inner.clear();
            inner.ids = seen;
            inner.requests = restored;
            inner.initialized = true;
        }

        if mutated {
            self.persist_index_logged();
        }
        info!(restored = count, repaired = mutated, "Restored request queue");
        count
    }

    /// Reads the index. The flag is true when the stored index was malformed.
    fn read_index(&self) -> (Vec<String>, bool) {
        let raw = match self.store.fetch(INDEX_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return (Vec::new(), false),
            Err(e) => {
                // Leave the stored index alone; it may be readable next time.
                error!(error = %e, "Failed to read queue index");
                return (Vec::new(), false);
            }
        };
        match serde_json::from_str::<Vec<String>>(&raw) {
            Ok(keys) => (keys, false),
            Err(e) => {
                error!(error = %e, "Malformed queue index, starting empty");
                (Vec::new(), true)
            }
        }
    }

    /// Writes the current id order to the store.
    pub fn persist_index(&self) -> store::Result<()> {
        let keys: Vec<String> = self
            .inner
            .lock()
            .requests
            .iter()
            .map(|r| r.id.to_key())
            .collect();
        let count = keys.len();
        self.store.store(INDEX_KEY, &Value::from(keys).to_string())?;
        trace!(count, "Persisted queue index");
        Ok(())
    }

    fn persist_index_logged(&self) {
        if let Err(e) = self.persist_index() {
            warn!(error = %e, "Failed to persist queue index");
        }
    }

    fn persist_entry(&self, request: &ApiRequest) {
        let json = match request::encode(request) {
            Ok(json) => json,
            Err(e) => {
                error!(request_id = %request.id, error = %e, "Failed to encode request");
                return;
            }
        };
        if let Err(e) = self.store.store(&request.id.to_key(), &json) {
            warn!(request_id = %request.id, error = %e, "Failed to persist request");
        }
    }

    /// Removes and returns the head of the queue.
    pub fn pop_front(&self) -> Option<ApiRequest> {
        let mut inner = self.inner.lock();
        let request = inner.requests.pop_front()?;
        inner.ids.remove(&request.id);
        Some(request)
    }

    /// Returns a popped request to the head. Ignored if the id was re-queued
    /// in the meantime.
    pub fn push_front(&self, request: ApiRequest) {
        let mut inner = self.inner.lock();
        if inner.ids.insert(request.id) {
            inner.requests.push_front(request);
        } else {
            trace!(request_id = %request.id, "Request re-queued meanwhile, not pushing back");
        }
    }

    /// Deletes a finished request's store entry.
    pub fn forget(&self, request: &ApiRequest) {
        if let Err(e) = self.store.clear(&request.id.to_key()) {
            warn!(request_id = %request.id, error = %e, "Failed to clear finished request");
        }
    }

    /// Tells observers about a state change of `request`.
    pub fn broadcast(&self, request: &ApiRequest) {
        self.observers.notify(request);
    }

    /// Registers a listener for enqueues and state changes.
    ///
    /// With `replay` the listener first sees every queued request, in order.
    pub fn on_observe(&self, listener: Listener<ApiRequest>, replay: bool) -> ObserverHandle {
        if replay {
            for request in self.snapshot() {
                listener(&request);
            }
        }
        self.observers.register(listener)
    }

    pub fn off_observe(&self, handle: ObserverHandle) {
        self.observers.unregister(handle);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().requests.is_empty()
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.inner.lock().ids.contains(id)
    }

    /// Ids in queue order.
    pub fn ids(&self) -> Vec<RequestId> {
        self.inner.lock().requests.iter().map(|r| r.id).collect()
    }

    pub fn snapshot(&self) -> Vec<ApiRequest> {
        self.inner.lock().requests.iter().cloned().collect()
    }
}

impl std::fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueue")
            .field("len", &self.len())
            .field("observers", &self.observers)
            .finish()
    }
}
