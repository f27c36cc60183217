//! Per-digest async mutual exclusion.
//!
//! Entries are created on demand and removed once the last holder or waiter is gone,
//! so the map only ever holds digests that are currently contended.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::checksum::Digest;

#[derive(Default)]
pub struct KeyLocks {
    entries: DashMap<Digest, Arc<AsyncMutex<()>>>,
}

impl KeyLocks {
    pub async fn lock(self: &Arc<Self>, digest: Digest) -> KeyGuard {
        let entry = Arc::clone(self.entries.entry(digest).or_default().value());
        let guard = entry.lock_owned().await;

        KeyGuard {
            digest,
            owner: Arc::clone(self),
            guard: Some(guard),
        }
    }

    /// Number of digests with a live entry.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Exclusive hold on one digest.
pub struct KeyGuard {
    digest: Digest,
    owner: Arc<KeyLocks>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.owner
            .entries
            .remove_if(&self.digest, |_, entry| Arc::strong_count(entry) == 1);
    }
}
