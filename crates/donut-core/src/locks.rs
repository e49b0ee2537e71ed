//! Per-path write serialization
//!
//! Writers to the same `bucket/object` path queue behind each other while
//! writers to distinct paths proceed in parallel. Readers take the same
//! lock while they resolve metadata and open the payload. Released paths are
//! dropped from the table, so it only ever holds paths with a live guard.

use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;

/// Table of currently locked paths
#[derive(Debug, Default)]
pub struct PathLocks {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl PathLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `path` is free, then hold it until the guard drops
    pub fn lock(&self, path: impl Into<String>) -> PathGuard<'_> {
        let path = path.into();
        let mut held = self.held.lock();
        while held.contains(&path) {
            self.released.wait(&mut held);
        }
        held.insert(path.clone());
        PathGuard { locks: self, path }
    }

    /// Number of paths currently held
    #[must_use]
    pub fn held(&self) -> usize {
        self.held.lock().len()
    }
}

/// Exclusive hold on one path
#[derive(Debug)]
pub struct PathGuard<'a> {
    locks: &'a PathLocks,
    path: String,
}

impl PathGuard<'_> {
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        self.locks.held.lock().remove(&self.path);
        self.locks.released.notify_all();
    }
}
