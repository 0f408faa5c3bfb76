use std::sync::Arc;

use tracing::info;

/// Width of one progress band, in percent.
pub const PROGRESS_STEP: u64 = 20;

/// One progress observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Bytes sent or received so far.
    pub transferred: u64,
    /// Declared size the percentage is computed against.
    pub total: u64,
    /// `floor(transferred * 100 / total)`, capped at 100.
    pub percent: u64,
}

/// Callback invoked with every progress observation.
pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// Throttles progress reports to one per 20% band.
///
/// A zero total never reports, so an empty file needs no special casing by
/// the caller.
#[derive(Debug, Clone)]
pub struct ProgressMark {
    total: u64,
    completed: u64,
}

impl ProgressMark {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            completed: 0,
        }
    }

    /// Record the running byte count, returning an observation when it moves
    /// the percentage past the current mark.
    pub fn update(&mut self, transferred: u64) -> Option<Progress> {
        if self.total == 0 || self.completed >= 100 {
            return None;
        }

        let percent = (u128::from(transferred) * 100 / u128::from(self.total)).min(100) as u64;
        if percent <= self.completed {
            return None;
        }
        while self.completed < percent {
            self.completed += PROGRESS_STEP;
        }

        Some(Progress {
            transferred,
            total: self.total,
            percent,
        })
    }

    /// The current mark, a multiple of [`PROGRESS_STEP`].
    pub fn completed(&self) -> u64 {
        self.completed
    }
}

/// A [`ProgressMark`] that logs each observation and forwards it to an
/// optional callback.
pub struct ProgressReporter {
    mark: ProgressMark,
    label: &'static str,
    callback: Option<ProgressCallback>,
}

impl ProgressReporter {
    pub fn new(total: u64, label: &'static str, callback: Option<ProgressCallback>) -> Self {
        Self {
            mark: ProgressMark::new(total),
            label,
            callback,
        }
    }

    pub fn record(&mut self, transferred: u64) {
        if let Some(progress) = self.mark.update(transferred) {
            info!(
                current_size = progress.transferred,
                "{} progress: {}% completed", self.label, progress.percent
            );
            if let Some(callback) = &self.callback {
                callback(progress);
            }
        }
    }
}
