use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::watch;
use tracing::debug;

use super::Page;
use crate::memory::QueryContext;

#[derive(Debug, Default)]
struct MemoryState {
    buffered_bytes: u64,
    peak_bytes: u64,
    blocked: bool,
    never_block: bool,
}

/// Byte accounting shared by every buffer id of one task.
///
/// Producers are blocked once usage exceeds `max_buffered_bytes` and stay
/// blocked until acknowledgments bring usage down to `low_water_bytes`.
#[derive(Debug)]
pub struct OutputBufferMemoryManager {
    max_buffered_bytes: u64,
    low_water_bytes: u64,
    query: Arc<QueryContext>,
    state: Mutex<MemoryState>,
    not_full: watch::Sender<bool>,
}

impl OutputBufferMemoryManager {
    pub fn new(max_buffered_bytes: u64, low_water_bytes: u64, query: Arc<QueryContext>) -> Self {
        let (not_full, _) = watch::channel(true);
        Self {
            max_buffered_bytes,
            low_water_bytes: low_water_bytes.min(max_buffered_bytes),
            query,
            state: Mutex::new(MemoryState::default()),
            not_full,
        }
    }

    pub fn buffered_bytes(&self) -> u64 {
        self.lock().buffered_bytes
    }

    pub fn peak_bytes(&self) -> u64 {
        self.lock().peak_bytes
    }

    pub fn is_full(&self) -> bool {
        let state = self.lock();
        !state.never_block && state.blocked
    }

    /// Resolves when producers may add more pages.
    pub fn ready(self: &Arc<Self>) -> BoxFuture<'static, ()> {
        if !self.is_full() && !self.query.memory_pool().is_exhausted() {
            return futures::future::ready(()).boxed();
        }
        let this = Arc::clone(self);
        async move {
            let mut rx = this.not_full.subscribe();
            let _ = rx.wait_for(|not_full| *not_full).await;
            let never_block = this.lock().never_block;
            if !never_block {
                this.query.memory_pool().wait_for_headroom().await;
            }
        }
        .boxed()
    }

    pub(super) fn reserve(&self, bytes: u64) {
        let mut state = self.lock();
        state.buffered_bytes = state.buffered_bytes.saturating_add(bytes);
        state.peak_bytes = state.peak_bytes.max(state.buffered_bytes);
        self.query.memory_pool().reserve(bytes);
        if !state.never_block && state.buffered_bytes > self.max_buffered_bytes {
            state.blocked = true;
        }
        self.publish(&state);
    }

    pub(super) fn release(&self, bytes: u64) {
        let mut state = self.lock();
        state.buffered_bytes = state.buffered_bytes.saturating_sub(bytes);
        self.query.memory_pool().free(bytes);
        if state.blocked && state.buffered_bytes <= self.low_water_bytes {
            state.blocked = false;
        }
        self.publish(&state);
    }

    /// Permanently unblocks producers, used once the buffer can no longer grow.
    pub(super) fn set_no_block_on_full(&self) {
        let mut state = self.lock();
        state.never_block = true;
        state.blocked = false;
        self.publish(&state);
    }

    fn publish(&self, state: &MemoryState) {
        let not_full = state.never_block || !state.blocked;
        self.not_full.send_if_modified(|current| {
            if *current != not_full {
                debug!(
                    buffered_bytes = state.buffered_bytes,
                    not_full,
                    "Output buffer memory flipped"
                );
                *current = not_full;
                true
            } else {
                false
            }
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A page whose bytes stay reserved until the last holder drops it.
///
/// Broadcast buffers share one `Arc<TrackedPage>` across every buffer id, so
/// memory is released only after all consumers have acknowledged the page.
#[derive(Debug)]
pub(super) struct TrackedPage {
    page: Page,
    bytes: u64,
    memory: Arc<OutputBufferMemoryManager>,
}

impl TrackedPage {
    pub(super) fn new(page: Page, memory: &Arc<OutputBufferMemoryManager>) -> Arc<Self> {
        let bytes = page.size_in_bytes();
        memory.reserve(bytes);
        Arc::new(Self {
            page,
            bytes,
            memory: Arc::clone(memory),
        })
    }

    pub(super) fn page(&self) -> &Page {
        &self.page
    }

    pub(super) fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for TrackedPage {
    fn drop(&mut self) {
        self.memory.release(self.bytes);
    }
}
