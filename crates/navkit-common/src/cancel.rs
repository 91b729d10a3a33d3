//! Cooperative cancellation and build progress reporting

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::{Error, Result};

/// Shared flag checked by long-running builds and searches.
///
/// Clones observe the same flag, so a token handed to a worker can be cancelled from
/// the thread that started it.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates a token that is not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Returns `Err(Error::Cancelled)` once cancellation has been requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Fraction of build work completed, shared between the builder and observers.
///
/// Reads `-1.0` while no build is running.
#[derive(Debug, Clone)]
pub struct BuildProgress {
    bits: Arc<AtomicU32>,
}

impl Default for BuildProgress {
    fn default() -> Self {
        Self {
            bits: Arc::new(AtomicU32::new((-1.0f32).to_bits())),
        }
    }
}

impl BuildProgress {
    /// Creates an idle progress tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Current fraction in `[0, 1]`, or `-1.0` when idle
    pub fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Acquire))
    }

    /// Raises the completion fraction, clamped to `[0, 1]`.
    ///
    /// Reported progress never moves backwards while a build runs, so workers may
    /// publish their counts in any order. Lower values are ignored until `reset`.
    pub fn set(&self, fraction: f32) {
        let fraction = fraction.clamp(0.0, 1.0);
        let _ = self.bits.fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
            (fraction > f32::from_bits(bits)).then(|| fraction.to_bits())
        });
    }

    /// Marks the tracker idle
    pub fn reset(&self) {
        self.bits.store((-1.0f32).to_bits(), Ordering::Release);
    }

    /// Whether a build is currently reporting progress
    pub fn is_running(&self) -> bool {
        self.get() >= 0.0
    }
}
