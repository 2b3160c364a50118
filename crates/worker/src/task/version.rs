use std::sync::{Mutex, MutexGuard};

use tokio::sync::watch;

/// Task status version shared by everything that feeds a status snapshot.
///
/// Changes run under the version lock and bump it before the lock is released,
/// and snapshots are read under the same lock, so two snapshots with the same
/// version always carry the same fields.
#[derive(Debug)]
pub struct StatusVersion {
    current: Mutex<u64>,
    published: watch::Sender<u64>,
}

impl Default for StatusVersion {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusVersion {
    pub fn new() -> Self {
        let (published, _) = watch::channel(0);
        Self {
            current: Mutex::new(0),
            published,
        }
    }

    fn lock(&self) -> MutexGuard<'_, u64> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn current(&self) -> u64 {
        *self.lock()
    }

    /// Runs `change` under the version lock and bumps the version when it
    /// reports a modification. Returns what `change` returned.
    ///
    /// `change` must not call back into this version.
    pub fn update(&self, change: impl FnOnce() -> bool) -> bool {
        let mut version = self.lock();
        let modified = change();
        if modified {
            *version += 1;
            self.published.send_replace(*version);
        }
        modified
    }

    /// Reads fields at a single version.
    pub fn read<R>(&self, read: impl FnOnce(u64) -> R) -> R {
        let version = self.lock();
        read(*version)
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.published.subscribe()
    }
}
