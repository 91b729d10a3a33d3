//! Build context: stage timers, log forwarding and cancellation
//!
//! Every pipeline stage receives a `BuildContext`. Messages are forwarded to the `log`
//! facade and stage timings are accumulated so callers can report where a tile build
//! spent its time.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use navkit_common::{CancellationToken, Result};

/// Timer categories for performance profiling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerCategory {
    /// Whole tile build
    Total,
    /// Triangle rasterization
    Rasterization,
    /// Heightfield filtering
    Filtering,
    /// Compact heightfield building
    CompactHeightfield,
    /// Walkable area erosion
    Erosion,
    /// Distance field and region partitioning
    Regions,
    /// Contour tracing and simplification
    Contours,
    /// Polygon mesh generation
    PolyMesh,
    /// Detail mesh generation
    DetailMesh,
}

/// Context for a tile build
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    /// Accumulated time per category
    timers: HashMap<TimerCategory, Duration>,
    /// Running timers
    active: HashMap<TimerCategory, Instant>,
    /// Tile label prefixed to log messages
    label: String,
    cancel: CancellationToken,
}

impl BuildContext {
    /// Creates a new context that is never cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context observing `cancel`
    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..Self::default()
        }
    }

    /// Sets the label prefixed to every log message, such as the tile coordinate
    pub fn set_label(&mut self, label: impl Into<String>) {
        self.label = label.into();
    }

    /// Returns `Err(Error::Cancelled)` once the build was cancelled
    pub fn check_cancelled(&self) -> Result<()> {
        self.cancel.check()
    }

    /// The cancellation token of this build
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn log_debug(&self, message: impl AsRef<str>) {
        log::debug!("{}{}", self.label, message.as_ref());
    }

    pub fn log_warning(&self, message: impl AsRef<str>) {
        log::warn!("{}{}", self.label, message.as_ref());
    }

    pub fn log_error(&self, message: impl AsRef<str>) {
        log::error!("{}{}", self.label, message.as_ref());
    }

    /// Starts timing a category
    pub fn start_timer(&mut self, category: TimerCategory) {
        self.active.insert(category, Instant::now());
    }

    /// Stops timing a category and adds the elapsed time to its total
    pub fn stop_timer(&mut self, category: TimerCategory) {
        if let Some(start) = self.active.remove(&category) {
            *self.timers.entry(category).or_default() += start.elapsed();
        }
    }

    /// Accumulated time of a category
    pub fn accumulated_time(&self, category: TimerCategory) -> Duration {
        self.timers.get(&category).copied().unwrap_or_default()
    }

    /// Logs the accumulated timings at debug level
    pub fn log_timer_summary(&self) {
        let mut timers: Vec<_> = self.timers.iter().collect();
        timers.sort();
        for (category, duration) in timers {
            log::debug!(
                "{}{:?}: {:.2} ms",
                self.label,
                category,
                duration.as_secs_f64() * 1000.0
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timers_accumulate() {
        let mut ctx = BuildContext::new();
        ctx.start_timer(TimerCategory::Regions);
        std::thread::sleep(Duration::from_millis(2));
        ctx.stop_timer(TimerCategory::Regions);
        let first = ctx.accumulated_time(TimerCategory::Regions);
        assert!(first >= Duration::from_millis(2));

        ctx.start_timer(TimerCategory::Regions);
        ctx.stop_timer(TimerCategory::Regions);
        assert!(ctx.accumulated_time(TimerCategory::Regions) >= first);
        assert_eq!(ctx.accumulated_time(TimerCategory::Contours), Duration::ZERO);
    }

    #[test]
    fn test_stop_without_start_is_ignored() {
        let mut ctx = BuildContext::new();
        ctx.stop_timer(TimerCategory::Total);
        assert_eq!(ctx.accumulated_time(TimerCategory::Total), Duration::ZERO);
    }

    #[test]
    fn test_cancellation_is_observed() {
        let token = CancellationToken::new();
        let ctx = BuildContext::with_cancellation(token.clone());
        assert!(ctx.check_cancelled().is_ok());
        token.cancel();
        assert!(ctx.check_cancelled().unwrap_err().is_cancelled());
    }
}
