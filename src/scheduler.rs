//! Timer driven execution of jobs.
//!
//! A job runs once immediately and then on a fixed interval. A pass that
//! overruns the interval delays the next one to the following tick, missed
//! ticks are dropped rather than queued.
//!
//! Passes of the same job never overlap: [Scheduler::trigger] skips a job
//! whose previous pass is still running, whichever thread started it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// A unit of periodic work, e.g. a backup or monitor pass over all resources.
pub trait Job {
    /// What a pass returns.
    type Report;

    /// Identifies the job type, passes with the same name never overlap.
    fn name(&self) -> &str;

    /// Runs a full sequential pass.
    fn run_pass(&self) -> Self::Report;
}

impl<J: Job + ?Sized> Job for &J {
    type Report = J::Report;

    fn name(&self) -> &str {
        (**self).name()
    }

    fn run_pass(&self) -> Self::Report {
        (**self).run_pass()
    }
}

/// Set of job names with a pass in progress.
#[derive(Debug, Clone, Default)]
pub struct RunGuard {
    running: Arc<Mutex<HashSet<String>>>,
}

impl RunGuard {
    /// Marks `name` as running unless it already is.
    pub fn try_acquire(&self, name: &str) -> Option<RunTicket> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        running.insert(name.to_string()).then(|| RunTicket {
            guard: self.clone(),
            name: name.to_string(),
        })
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }
}

/// Proof of a running pass, released on drop.
#[derive(Debug)]
pub struct RunTicket {
    guard: RunGuard,
    name: String,
}

impl Drop for RunTicket {
    fn drop(&mut self) {
        self.guard
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
    }
}

/// Runs jobs immediately and then every `interval`.
#[derive(Debug, Clone)]
pub struct Scheduler {
    interval: Duration,
    guard: RunGuard,
}

impl Scheduler {
    pub fn new(interval: Duration) -> Self {
        Self::with_guard(interval, RunGuard::default())
    }

    /// Creates a scheduler sharing the running passes with other schedulers.
    pub fn with_guard(interval: Duration, guard: RunGuard) -> Self {
        Self { interval, guard }
    }

    /// Runs a single pass of `job` unless one is already in progress.
    ///
    /// Returns [None] if the pass was skipped.
    pub fn trigger<J: Job>(&self, job: &J) -> Option<J::Report> {
        let Some(_ticket) = self.guard.try_acquire(job.name()) else {
            log::warn!(target: "scheduler", "{} is still running, skipping this trigger", job.name());
            return None;
        };

        log::info!(target: "scheduler", "Starting pass of {}", job.name());
        let started = Instant::now();
        let report = job.run_pass();
        log::info!(
            target: "scheduler",
            "Finished pass of {} in {:.1?}",
            job.name(),
            started.elapsed()
        );

        Some(report)
    }

    /// Runs `job` now and then on every tick.
    ///
    /// Stops after `passes` triggers if given, otherwise runs forever.
    pub fn run<J: Job>(&self, job: &J, passes: Option<usize>) {
        let mut triggered = 0;
        loop {
            let started = Instant::now();
            self.trigger(job);

            triggered += 1;
            if passes.is_some_and(|passes| triggered >= passes) {
                return;
            }

            let wait = next_tick(self.interval, started.elapsed());
            log::debug!(target: "scheduler", "Next pass of {} in {wait:.0?}", job.name());
            thread::sleep(wait);
        }
    }
}

/// Time to wait until the next tick after a pass that took `elapsed`.
fn next_tick(interval: Duration, elapsed: Duration) -> Duration {
    if interval.is_zero() {
        return Duration::ZERO;
    }
    if elapsed < interval {
        return interval - elapsed;
    }

    log::warn!(target: "scheduler", "Pass took {elapsed:.0?}, longer than the interval of {interval:.0?}");
    let overrun = elapsed.as_nanos() % interval.as_nanos();
    // the remainder is below `interval`, which is a valid duration
    interval - Duration::from_nanos(overrun as u64)
}
