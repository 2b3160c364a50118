use std::collections::VecDeque;
use std::sync::Arc;

use igloo_common::OutputBufferId;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::memory_manager::TrackedPage;
use super::{BufferInfo, BufferResult};
use crate::error::{Result, WorkerError};

struct PendingRead {
    token: u64,
    max_size_bytes: u64,
    tx: oneshot::Sender<BufferResult>,
}

pub(super) enum ReadOutcome {
    Ready(BufferResult),
    Pending(oneshot::Receiver<BufferResult>),
}

/// Page queue of a single buffer id.
///
/// `pages[0]` carries token `low_water_token`; tokens below it were
/// acknowledged and their pages released.
pub(super) struct ClientBuffer {
    buffer_id: OutputBufferId,
    pages: VecDeque<Arc<TrackedPage>>,
    low_water_token: u64,
    no_more_pages: bool,
    destroyed: bool,
    pending_read: Option<PendingRead>,
}

impl ClientBuffer {
    pub(super) fn new(buffer_id: OutputBufferId) -> Self {
        Self {
            buffer_id,
            pages: VecDeque::new(),
            low_water_token: 0,
            no_more_pages: false,
            destroyed: false,
            pending_read: None,
        }
    }

    pub(super) fn next_token(&self) -> u64 {
        self.low_water_token + self.pages.len() as u64
    }

    pub(super) fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Destroyed, or every page was produced and acknowledged.
    pub(super) fn is_finished(&self) -> bool {
        self.destroyed || (self.no_more_pages && self.pages.is_empty())
    }

    /// True when a read at the end of the queue is parked here.
    pub(super) fn pending_max_size(&self) -> Option<u64> {
        match &self.pending_read {
            Some(read) if read.token == self.next_token() && !read.tx.is_closed() => {
                Some(read.max_size_bytes)
            }
            _ => None,
        }
    }

    pub(super) fn buffered_pages(&self) -> usize {
        self.pages.len()
    }

    pub(super) fn enqueue_pages(&mut self, pages: impl IntoIterator<Item = Arc<TrackedPage>>) {
        if self.destroyed || self.no_more_pages {
            return;
        }
        self.pages.extend(pages);
        self.process_pending_read();
    }

    pub(super) fn get(&mut self, token: u64, max_size_bytes: u64) -> Result<ReadOutcome> {
        if let Some(result) = self.read_now(token, max_size_bytes)? {
            return Ok(ReadOutcome::Ready(result));
        }

        let (tx, rx) = oneshot::channel();
        let parked = PendingRead {
            token,
            max_size_bytes,
            tx,
        };
        if let Some(previous) = self.pending_read.replace(parked) {
            // a newer request supersedes the parked one
            let _ = previous.tx.send(BufferResult::empty(previous.token, false));
        }
        Ok(ReadOutcome::Pending(rx))
    }

    /// `Ok(None)` means the caller has to wait for more pages.
    fn read_now(&self, token: u64, max_size_bytes: u64) -> Result<Option<BufferResult>> {
        if self.destroyed {
            return Ok(Some(BufferResult::empty(token, true)));
        }
        let next_token = self.next_token();
        if token < self.low_water_token {
            if self.is_finished() {
                return Ok(Some(BufferResult::empty(token, true)));
            }
            return Err(self.invalid_token(token));
        }
        if token > next_token {
            return Err(self.invalid_token(token));
        }
        if token == next_token {
            if self.no_more_pages {
                return Ok(Some(BufferResult::empty(token, true)));
            }
            return Ok(None);
        }

        let skip = (token - self.low_water_token) as usize;
        let mut pages = Vec::new();
        let mut bytes = 0u64;
        for tracked in self.pages.iter().skip(skip) {
            // always hand out at least one page so oversized pages still flow
            if !pages.is_empty() && bytes + tracked.bytes() > max_size_bytes {
                break;
            }
            bytes += tracked.bytes();
            pages.push(tracked.page().clone());
        }
        let next = token + pages.len() as u64;
        Ok(Some(BufferResult {
            token,
            next_token: next,
            pages,
            buffer_complete: false,
        }))
    }

    fn invalid_token(&self, token: u64) -> WorkerError {
        WorkerError::InvalidToken {
            buffer_id: self.buffer_id,
            token,
            low: self.low_water_token,
            high: self.next_token(),
        }
    }

    fn process_pending_read(&mut self) {
        let Some(read) = self.pending_read.take() else {
            return;
        };
        if read.tx.is_closed() {
            return;
        }
        match self.read_now(read.token, read.max_size_bytes) {
            Ok(Some(result)) => {
                let _ = read.tx.send(result);
            }
            Ok(None) => self.pending_read = Some(read),
            Err(e) => {
                warn!(buffer_id = %self.buffer_id, error = %e, "Parked read became invalid");
                let _ = read.tx.send(BufferResult::empty(read.token, false));
            }
        }
    }

    /// Releases every page below `token`.
    pub(super) fn acknowledge(&mut self, token: u64) -> Result<()> {
        if self.destroyed || token <= self.low_water_token {
            return Ok(());
        }
        if token > self.next_token() {
            return Err(self.invalid_token(token));
        }
        let count = (token - self.low_water_token) as usize;
        self.pages.drain(..count);
        self.low_water_token = token;
        debug!(buffer_id = %self.buffer_id, token, "Acknowledged pages");
        Ok(())
    }

    pub(super) fn set_no_more_pages(&mut self) {
        self.no_more_pages = true;
        self.process_pending_read();
    }

    pub(super) fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.pages.clear();
        self.process_pending_read();
    }

    /// Moves pages from a shared queue while a reader waits at the end of this queue.
    ///
    /// Returns whether any page was taken.
    pub(super) fn load_from(
        &mut self,
        source: &mut VecDeque<Arc<TrackedPage>>,
        max_size_bytes: u64,
    ) -> bool {
        if self.destroyed || source.is_empty() {
            return false;
        }
        let mut bytes = 0u64;
        let mut taken = Vec::new();
        while let Some(front) = source.front() {
            if !taken.is_empty() && bytes + front.bytes() > max_size_bytes {
                break;
            }
            bytes += front.bytes();
            if let Some(page) = source.pop_front() {
                taken.push(page);
            }
        }
        let loaded = !taken.is_empty();
        self.pages.extend(taken);
        self.process_pending_read();
        loaded
    }

    pub(super) fn info(&self) -> BufferInfo {
        BufferInfo {
            buffer_id: self.buffer_id,
            finished: self.is_finished(),
            buffered_pages: self.pages.len() as u64,
            acknowledged_pages: self.low_water_token,
            total_pages_added: self.next_token(),
        }
    }
}
