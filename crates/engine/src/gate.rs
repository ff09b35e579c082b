use std::sync::{Mutex, MutexGuard, PoisonError};

/// Process-wide serialization point for heavy inventory writes.
///
/// The guard protects no data, so a poisoned lock is simply taken over.
#[derive(Debug, Default)]
pub struct WriteGate {
    lock: Mutex<()>,
}

impl WriteGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
