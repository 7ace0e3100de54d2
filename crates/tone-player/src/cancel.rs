//! Generation-tagged cooperative cancellation.
//!
//! Every cycle gets a fresh [`CancelSource`]; tokens from an earlier cycle keep pointing at
//! their own flag, so cancelling (or having cancelled) an old cycle never leaks into a new one.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Owner side of a cancellation flag. Held by the session loop.
#[derive(Debug)]
pub struct CancelSource {
    generation: u64,
    flag: Arc<AtomicBool>,
}

/// Observer side handed to the encoder.
#[derive(Clone, Debug)]
pub struct CancelToken {
    generation: u64,
    flag: Arc<AtomicBool>,
}

impl CancelSource {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            generation: self.generation,
            flag: self.flag.clone(),
        }
    }

    /// Raise the flag. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

impl CancelToken {
    /// A token that is never cancelled (bulk/offline encoding).
    pub fn never() -> Self {
        Self {
            generation: 0,
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}
