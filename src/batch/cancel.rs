//! Cooperative cancellation flag shared by every job of a batch.

use crate::error::{Result, SamleError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A one-way switch. Once set it stays set for the life of the batch.
///
/// Jobs check it at every stage entry; collaborators may poll it mid-operation.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag. Returns false if it was already set.
    pub fn cancel(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Checkpoint: `Err(Cancelled)` once the flag is set.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(SamleError::Cancelled)
        } else {
            Ok(())
        }
    }
}
