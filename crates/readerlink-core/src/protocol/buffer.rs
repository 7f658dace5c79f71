//! Shared receive buffer
//!
//! Written by the receive loop, scanned and cleared by the caller. Every
//! operation is one critical section; callers never hold the lock across a
//! scan.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Bytes received since the last clear
#[derive(Debug, Default)]
pub struct ReceiveBuffer {
    bytes: Mutex<Vec<u8>>,
}

impl ReceiveBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave a Vec half-extended in a
    // way that matters here, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a received chunk
    pub fn append(&self, chunk: &[u8]) {
        self.lock().extend_from_slice(chunk);
    }

    /// Copy of the current contents
    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().clone()
    }

    /// Discard everything received so far
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of buffered bytes
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
