use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of a task's output buffer. Transitions only move forward.
///
/// ```text
/// OPEN -> NO_MORE_BUFFER_IDS -> FLUSHING -> FINISHED
///  \----> NO_MORE_PAGES ------/
/// any non-terminal state -> FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferState {
    /// Buffer ids and pages may both still be added.
    Open,
    /// The set of buffer ids is closed; pages may still be added.
    NoMoreBufferIds,
    /// The producer is done; buffer ids may still be added.
    NoMorePages,
    /// Both sets are closed; waiting for consumers to drain or abort.
    Flushing,
    Finished,
    /// Destroyed or hit an internal error; buffered data is gone.
    Failed,
}

impl BufferState {
    pub(crate) fn from_flags(no_more_buffer_ids: bool, no_more_pages: bool) -> Self {
        match (no_more_buffer_ids, no_more_pages) {
            (false, false) => BufferState::Open,
            (true, false) => BufferState::NoMoreBufferIds,
            (false, true) => BufferState::NoMorePages,
            (true, true) => BufferState::Flushing,
        }
    }

    pub fn can_add_pages(self) -> bool {
        matches!(self, BufferState::Open | BufferState::NoMoreBufferIds)
    }

    pub fn can_add_buffers(self) -> bool {
        matches!(self, BufferState::Open | BufferState::NoMorePages)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BufferState::Finished | BufferState::Failed)
    }
}

impl fmt::Display for BufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BufferState::Open => "OPEN",
            BufferState::NoMoreBufferIds => "NO_MORE_BUFFER_IDS",
            BufferState::NoMorePages => "NO_MORE_PAGES",
            BufferState::Flushing => "FLUSHING",
            BufferState::Finished => "FINISHED",
            BufferState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}
