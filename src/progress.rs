//! Cooperative cancellation and progress reporting.
//!
//! Long-running kernels take a [`RunContext`] and poll it once per outer
//! iteration (rotation, sky patch, time step). Progress values are percent
//! in `0..=100` and never decrease within a run.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared cancellation flag. Cloning shares the flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing flag, e.g. one owned by a Python runner.
    pub fn from_flag(flag: Arc<AtomicBool>) -> Self {
        Self { flag }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Observer for progress and log-style messages.
pub trait ProgressReporter: Send + Sync {
    fn set_progress(&self, percent: f64);

    fn message(&self, _msg: &str) {}
}

/// Reporter that discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn set_progress(&self, _percent: f64) {}
}

/// Pollable whole-percent counter.
///
/// Backed by `fetch_max`, so concurrent or out-of-order updates can never
/// move the reported value backwards.
#[derive(Clone, Debug, Default)]
pub struct AtomicProgress {
    percent: Arc<AtomicUsize>,
}

impl AtomicProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_counter(percent: Arc<AtomicUsize>) -> Self {
        Self { percent }
    }

    pub fn get(&self) -> usize {
        self.percent.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.percent.store(0, Ordering::Relaxed);
    }
}

impl ProgressReporter for AtomicProgress {
    fn set_progress(&self, percent: f64) {
        let pct = percent.clamp(0.0, 100.0) as usize;
        self.percent.fetch_max(pct, Ordering::Relaxed);
    }

    fn message(&self, msg: &str) {
        tracing::debug!(target: "rooftop_solar::progress", "{msg}");
    }
}

/// Everything a long-running call needs besides its data.
#[derive(Clone, Copy)]
pub struct RunContext<'a> {
    pub cancel: &'a CancelToken,
    pub progress: &'a dyn ProgressReporter,
    span: ProgressSpan,
}

impl<'a> RunContext<'a> {
    pub fn new(cancel: &'a CancelToken, progress: &'a dyn ProgressReporter) -> Self {
        Self {
            cancel,
            progress,
            span: ProgressSpan::FULL,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Report `fraction` (0..=1) of the current stage.
    pub fn report(&self, fraction: f64) {
        self.progress.set_progress(self.span.map(fraction));
    }

    pub fn message(&self, msg: &str) {
        self.progress.message(msg);
    }

    /// Narrow this context to the sub-range `start..end` of its own span.
    pub fn stage(&self, start: f64, end: f64) -> RunContext<'a> {
        RunContext {
            span: self.span.sub(start, end),
            ..*self
        }
    }
}

/// Maps a stage-local fraction onto an overall percentage range.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProgressSpan {
    pub start: f64,
    pub end: f64,
}

impl ProgressSpan {
    pub const FULL: ProgressSpan = ProgressSpan {
        start: 0.0,
        end: 100.0,
    };

    pub fn map(&self, fraction: f64) -> f64 {
        self.start + (self.end - self.start) * fraction.clamp(0.0, 1.0)
    }

    /// `start` and `end` are percentages of this span.
    pub fn sub(&self, start: f64, end: f64) -> ProgressSpan {
        ProgressSpan {
            start: self.map(start / 100.0),
            end: self.map(end / 100.0),
        }
    }
}

/// Outcome of a cancellable computation.
///
/// A `Cancelled` value holds whatever partial accumulation existed when the
/// flag was observed. It must not be used as a result.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion<T> {
    Finished(T),
    Cancelled(T),
}

impl<T> Completion<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Completion::Cancelled(_))
    }

    /// The result, or `None` when the run was cancelled.
    pub fn finished(self) -> Option<T> {
        match self {
            Completion::Finished(v) => Some(v),
            Completion::Cancelled(_) => None,
        }
    }

    pub fn into_inner(self) -> T {
        match self {
            Completion::Finished(v) | Completion::Cancelled(v) => v,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Completion<U> {
        match self {
            Completion::Finished(v) => Completion::Finished(f(v)),
            Completion::Cancelled(v) => Completion::Cancelled(f(v)),
        }
    }
}
