//! Per-query memory accounting shared by every task of a query on this worker.

use std::sync::Mutex;

use igloo_common::QueryId;
use tokio::sync::watch;
use tracing::debug;

/// Memory pool for one query.
///
/// Output buffers reserve into it as pages arrive and free as pages are
/// acknowledged. Reservations never fail: when the pool is over its limit,
/// producers are throttled through [`QueryMemoryPool::wait_for_headroom`]
/// rather than rejected.
#[derive(Debug)]
pub struct QueryMemoryPool {
    limit_bytes: u64,
    reserved: Mutex<u64>,
    headroom: watch::Sender<bool>,
}

impl QueryMemoryPool {
    pub fn new(limit_bytes: u64) -> Self {
        let (headroom, _) = watch::channel(true);
        Self {
            limit_bytes,
            reserved: Mutex::new(0),
            headroom,
        }
    }

    pub fn limit_bytes(&self) -> u64 {
        self.limit_bytes
    }

    pub fn reserved_bytes(&self) -> u64 {
        *self.reserved.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_exhausted(&self) -> bool {
        self.reserved_bytes() > self.limit_bytes
    }

    pub fn reserve(&self, bytes: u64) {
        self.update(|reserved| reserved.saturating_add(bytes));
    }

    pub fn free(&self, bytes: u64) {
        self.update(|reserved| reserved.saturating_sub(bytes));
    }

    fn update(&self, f: impl FnOnce(u64) -> u64) {
        let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        *reserved = f(*reserved);
        let has_headroom = *reserved <= self.limit_bytes;
        // published under the lock so flips cannot be reordered
        self.headroom.send_if_modified(|current| {
            if *current != has_headroom {
                debug!(
                    reserved = *reserved,
                    limit = self.limit_bytes,
                    has_headroom,
                    "Query memory pool flipped"
                );
                *current = has_headroom;
                true
            } else {
                false
            }
        });
    }

    /// Resolves once reservations are back under the limit.
    pub async fn wait_for_headroom(&self) {
        let mut rx = self.headroom.subscribe();
        // the sender lives as long as self, so the error arm is unreachable
        let _ = rx.wait_for(|has_headroom| *has_headroom).await;
    }
}

/// Query-scoped state shared by all tasks of one query on this worker.
#[derive(Debug)]
pub struct QueryContext {
    query_id: QueryId,
    memory_pool: QueryMemoryPool,
}

impl QueryContext {
    pub fn new(query_id: QueryId, max_memory_bytes: u64) -> Self {
        Self {
            query_id,
            memory_pool: QueryMemoryPool::new(max_memory_bytes),
        }
    }

    pub fn query_id(&self) -> &QueryId {
        &self.query_id
    }

    pub fn memory_pool(&self) -> &QueryMemoryPool {
        &self.memory_pool
    }
}
