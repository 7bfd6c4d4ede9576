//! Per-request bookkeeping for live streams.
//!
//! An entry exists exactly as long as its [`StreamLease`]; dropping the lease
//! on any exit path (completion, error, client disconnect) removes it.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::protocol::canonical::WireApi;

#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub client_api: WireApi,
    pub backend_api: WireApi,
    pub model: String,
    pub started_at: Instant,
}

impl StreamEntry {
    #[must_use]
    pub fn new(client_api: WireApi, backend_api: WireApi, model: impl Into<String>) -> Self {
        Self {
            client_api,
            backend_api,
            model: model.into(),
            started_at: Instant::now(),
        }
    }
}

type Entries = Arc<Mutex<FxHashMap<uuid::Uuid, StreamEntry>>>;

/// Live streams keyed by request id. Cheap to clone; clones share entries.
#[derive(Debug, Clone, Default)]
pub struct StreamRegistry {
    entries: Entries,
}

impl StreamRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a stream and return the lease that owns its entry.
    /// Registering an id that is already live replaces the older entry.
    #[must_use]
    pub fn register(&self, request_id: uuid::Uuid, entry: StreamEntry) -> StreamLease {
        if self.entries.lock().insert(request_id, entry).is_some() {
            tracing::warn!(%request_id, "stream registered twice; replacing entry");
        }
        StreamLease {
            entries: Arc::clone(&self.entries),
            request_id,
        }
    }

    #[must_use]
    pub fn get(&self, request_id: &uuid::Uuid) -> Option<StreamEntry> {
        self.entries.lock().get(request_id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Removes its registry entry when dropped.
#[derive(Debug)]
pub struct StreamLease {
    entries: Entries,
    request_id: uuid::Uuid,
}

impl StreamLease {
    #[must_use]
    pub fn request_id(&self) -> uuid::Uuid {
        self.request_id
    }
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        if self.entries.lock().remove(&self.request_id).is_some() {
            tracing::debug!(request_id = %self.request_id, "stream bookkeeping released");
        }
    }
}
