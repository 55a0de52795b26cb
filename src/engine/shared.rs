//! Swappable engine handle for the process boundary.
//!
//! Components receive their engine by injection. The one place that needs
//! to replace it at runtime (reconfiguration) holds a `SharedEngine`:
//! readers take a cheap snapshot, `swap` installs a new engine and hands
//! back the old one so the caller can close it.

use parking_lot::RwLock;

pub struct SharedEngine<E> {
    current: RwLock<E>,
}

impl<E: Clone> SharedEngine<E> {
    pub fn new(engine: E) -> Self {
        Self {
            current: RwLock::new(engine),
        }
    }

    /// Snapshot of the engine installed right now.
    pub fn current(&self) -> E {
        self.current.read().clone()
    }

    /// Install `next` and return the engine it replaced.
    pub fn swap(&self, next: E) -> E {
        std::mem::replace(&mut *self.current.write(), next)
    }
}
