//! Progress reporting and cooperative cancellation across worker threads.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
    time::{Duration, Instant},
};

use log::debug;

/// Default minimum time between two recomputations of the progress estimate
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_millis(2000);

/// A consistent view of the progress of a run
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    /// Index of the current phase, starting at 1. `0` before the first phase started
    pub phase: usize,
    pub phase_count: usize,
    pub phase_name: String,
    /// Work items completed in the current phase
    pub work_done: usize,
    pub work_total: usize,
    /// Estimated fraction of the current phase that is done, in `[0, 1]`
    pub fraction: f64,
    /// Time since the current phase started
    pub elapsed: Duration,
    /// Estimated time until the current phase is done, if enough work was done to tell
    pub remaining: Option<Duration>,
    pub cancelled: bool,
}

/// Host side callbacks of a run
pub trait ProgressHook: Send + Sync {
    /// Asked before every unit of work. Returning `false` cancels the run
    fn should_continue(&self, snapshot: &ProgressSnapshot) -> bool;

    fn phase_started(&self, _phase: usize, _name: &str) {}

    fn phase_ended(&self, _phase: usize, _name: &str) {}
}

impl<F> ProgressHook for F
where
    F: Fn(&ProgressSnapshot) -> bool + Send + Sync,
{
    fn should_continue(&self, snapshot: &ProgressSnapshot) -> bool {
        self(snapshot)
    }
}

/// A hook that never cancels
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressHook for NoProgress {
    fn should_continue(&self, _snapshot: &ProgressSnapshot) -> bool {
        true
    }
}

#[derive(Debug)]
struct PhaseState {
    name: String,
    started: Instant,
    last_estimate: Option<Instant>,
    fraction: f64,
    remaining: Option<Duration>,
}

/// Shared progress counter of a run. All methods take `&self` and may be called from any thread
pub struct ProgressMonitor<'h> {
    hook: &'h dyn ProgressHook,
    phase_count: usize,
    update_interval: Duration,
    phase: AtomicUsize,
    work_done: AtomicUsize,
    work_total: AtomicUsize,
    cancelled: AtomicBool,
    error: AtomicBool,
    state: Mutex<PhaseState>,
}

impl<'h> ProgressMonitor<'h> {
    pub fn new(hook: &'h dyn ProgressHook, phase_count: usize) -> Self {
        Self {
            hook,
            phase_count,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            phase: AtomicUsize::new(0),
            work_done: AtomicUsize::new(0),
            work_total: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            error: AtomicBool::new(false),
            state: Mutex::new(PhaseState {
                name: String::new(),
                started: Instant::now(),
                last_estimate: None,
                fraction: 0.0,
                remaining: None,
            }),
        }
    }

    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    /// Starts the next phase, which consists of `work_total` work items
    pub fn start_phase(&self, name: &str, work_total: usize) {
        let phase = self.phase.fetch_add(1, Ordering::SeqCst) + 1;
        self.work_done.store(0, Ordering::SeqCst);
        self.work_total.store(work_total, Ordering::SeqCst);
        if let Ok(mut state) = self.state.lock() {
            *state = PhaseState {
                name: name.to_owned(),
                started: Instant::now(),
                last_estimate: None,
                fraction: 0.0,
                remaining: None,
            };
        }
        debug!("Phase {}/{}: {}", phase, self.phase_count, name);
        self.hook.phase_started(phase, name);
    }

    /// Ends the current phase
    pub fn end_phase(&self) {
        let phase = self.phase.load(Ordering::SeqCst);
        let name = match self.state.lock() {
            Ok(mut state) => {
                state.fraction = 1.0;
                state.remaining = Some(Duration::ZERO);
                state.name.clone()
            }
            Err(_) => String::new(),
        };
        self.hook.phase_ended(phase, &name);
    }

    /// Records `count` completed work items
    pub fn work_completed(&self, count: usize) {
        self.work_done.fetch_add(count, Ordering::SeqCst);
    }

    pub fn work_done(&self) -> usize {
        self.work_done.load(Ordering::SeqCst)
    }

    /// Current progress. The fraction and remaining time are recomputed at most once per update interval
    pub fn snapshot(&self) -> ProgressSnapshot {
        let work_done = self.work_done.load(Ordering::SeqCst);
        let work_total = self.work_total.load(Ordering::SeqCst);
        let (name, elapsed, fraction, remaining) = match self.state.lock() {
            Ok(mut state) => {
                let now = Instant::now();
                let due = state
                    .last_estimate
                    .map_or(true, |last| now.duration_since(last) >= self.update_interval);
                if due {
                    state.last_estimate = Some(now);
                    state.fraction = if work_total == 0 {
                        0.0
                    } else {
                        (work_done as f64 / work_total as f64).min(1.0)
                    };
                    state.remaining = if work_done == 0 || work_done >= work_total {
                        None
                    } else {
                        let per_item = now.duration_since(state.started).as_secs_f64() / work_done as f64;
                        Some(Duration::from_secs_f64(per_item * (work_total - work_done) as f64))
                    };
                }
                (
                    state.name.clone(),
                    now.duration_since(state.started),
                    state.fraction,
                    state.remaining,
                )
            }
            Err(_) => (String::new(), Duration::ZERO, 0.0, None),
        };
        ProgressSnapshot {
            phase: self.phase.load(Ordering::SeqCst),
            phase_count: self.phase_count,
            phase_name: name,
            work_done,
            work_total,
            fraction,
            elapsed,
            remaining,
            cancelled: self.is_cancelled(),
        }
    }

    /// Asks the hook whether to go on. Once the hook said no or an error was signaled, this returns
    /// `false` forever
    pub fn check_continue(&self) -> bool {
        if self.is_cancelled() || self.has_error() {
            return false;
        }
        if !self.hook.should_continue(&self.snapshot()) {
            self.cancel();
            return false;
        }
        true
    }

    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            debug!("Run cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Flags that an error happened somewhere during the run. No new work is started afterwards
    pub fn signal_error(&self) {
        if !self.error.swap(true, Ordering::SeqCst) {
            debug!("Error signaled, stopping");
        }
    }

    pub fn has_error(&self) -> bool {
        self.error.load(Ordering::SeqCst)
    }
}
