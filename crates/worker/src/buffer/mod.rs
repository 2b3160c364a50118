//! Task output buffering.
//!
//! Pages produced by the execution engine are held per destination
//! ([`OutputBufferId`]) until the consumer acknowledges them. Consumers pull
//! with `get(buffer_id, token, max_size)` and may retry the same token any
//! number of times; only `acknowledge` releases memory.

mod client_buffer;
mod memory_manager;
mod output_buffer;
mod state;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use igloo_common::OutputBufferId;
use serde::{Deserialize, Serialize};

pub use memory_manager::OutputBufferMemoryManager;
pub use output_buffer::OutputBuffer;
pub use state::BufferState;

/// Opaque serialized columnar batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    data: Arc<[u8]>,
    position_count: u32,
}

impl Page {
    pub fn new(data: impl Into<Arc<[u8]>>, position_count: u32) -> Self {
        Self {
            data: data.into(),
            position_count,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn position_count(&self) -> u32 {
        self.position_count
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Answer to one `get` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferResult {
    /// Token the read started at.
    pub token: u64,
    /// Token to request next.
    pub next_token: u64,
    pub pages: Vec<Page>,
    pub buffer_complete: bool,
}

impl BufferResult {
    pub fn empty(token: u64, buffer_complete: bool) -> Self {
        Self {
            token,
            next_token: token,
            pages: Vec::new(),
            buffer_complete,
        }
    }
}

/// How pages are distributed across buffer ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferType {
    /// Every page goes to every buffer id.
    Broadcast,
    /// The producer names the buffer id of every page.
    Partitioned,
    /// Pages go to whichever buffer id asks next.
    Arbitrary,
}

impl fmt::Display for BufferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BufferType::Broadcast => "BROADCAST",
            BufferType::Partitioned => "PARTITIONED",
            BufferType::Arbitrary => "ARBITRARY",
        };
        f.write_str(name)
    }
}

/// Output buffer layout sent by the coordinator with every task update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputBuffersSpec {
    pub buffer_type: BufferType,
    pub buffer_ids: BTreeSet<OutputBufferId>,
    pub no_more_buffer_ids: bool,
}

impl OutputBuffersSpec {
    pub fn new(buffer_type: BufferType) -> Self {
        Self {
            buffer_type,
            buffer_ids: BTreeSet::new(),
            no_more_buffer_ids: false,
        }
    }

    pub fn with_buffer(mut self, buffer_id: OutputBufferId) -> Self {
        self.buffer_ids.insert(buffer_id);
        self
    }

    pub fn with_no_more_buffer_ids(mut self) -> Self {
        self.no_more_buffer_ids = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferInfo {
    pub buffer_id: OutputBufferId,
    pub finished: bool,
    pub buffered_pages: u64,
    /// Low-water mark: every page below this token has been acknowledged.
    pub acknowledged_pages: u64,
    pub total_pages_added: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputBufferInfo {
    pub buffer_type: Option<BufferType>,
    pub state: BufferState,
    pub can_add_buffers: bool,
    pub can_add_pages: bool,
    pub total_buffered_bytes: u64,
    pub total_buffered_pages: u64,
    pub total_pages_added: u64,
    pub buffers: Vec<BufferInfo>,
}
