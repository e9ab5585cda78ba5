//! Hard timeout for handler invocations.
//!
//! The execution thread and the watchdog share one [`ExecutionState`]. An
//! invocation moves the phase `Idle -> Running`; completion moves it back. The
//! watchdog claims an overdue invocation with `Running -> Terminating`, asks the
//! engine to terminate, then publishes `Terminated`. Whoever wins the CAS on
//! `Running` decides the outcome, so a termination racing a normal return is
//! always observed by the execution thread, which then clears it before the
//! next invocation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::engine::Terminator;
use crate::metrics::WorkerMetrics;

pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const TERMINATING: u8 = 2;
const TERMINATED: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Running,
    Terminating,
    Terminated,
}

pub struct ExecutionState {
    phase: AtomicU8,
    epoch: Instant,
    started_at_nanos: AtomicU64,
    debugger_active: AtomicBool,
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self {
            phase: AtomicU8::new(IDLE),
            epoch: Instant::now(),
            started_at_nanos: AtomicU64::new(0),
            debugger_active: AtomicBool::new(false),
        }
    }
}

impl ExecutionState {
    pub fn phase(&self) -> Phase {
        match self.phase.load(Ordering::Acquire) {
            RUNNING => Phase::Running,
            TERMINATING => Phase::Terminating,
            TERMINATED => Phase::Terminated,
            _ => Phase::Idle,
        }
    }

    pub fn is_executing(&self) -> bool {
        self.phase() == Phase::Running
    }

    /// Mark an invocation as started. Execution thread only.
    pub fn begin(&self) {
        let now = self.epoch.elapsed().as_nanos() as u64;
        self.started_at_nanos.store(now, Ordering::Release);
        self.phase.store(RUNNING, Ordering::Release);
    }

    /// Mark the invocation as finished. Returns `true` when the watchdog
    /// terminated it; in that case the engine still has a termination pending.
    pub fn finish(&self) -> bool {
        if self
            .phase
            .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return false;
        }
        // The watchdog claimed it; wait until its terminate call has returned.
        while self.phase.load(Ordering::Acquire) == TERMINATING {
            std::hint::spin_loop();
        }
        self.phase.store(IDLE, Ordering::Release);
        true
    }

    pub fn elapsed(&self) -> Option<Duration> {
        if !self.is_executing() {
            return None;
        }
        let started = self.started_at_nanos.load(Ordering::Acquire);
        let now = self.epoch.elapsed().as_nanos() as u64;
        Some(Duration::from_nanos(now.saturating_sub(started)))
    }

    pub fn set_debugger_active(&self, active: bool) {
        self.debugger_active.store(active, Ordering::Release);
    }

    pub fn debugger_active(&self) -> bool {
        self.debugger_active.load(Ordering::Acquire)
    }

    fn claim(&self) -> bool {
        self.phase
            .compare_exchange(RUNNING, TERMINATING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn mark_terminated(&self) {
        self.phase.store(TERMINATED, Ordering::Release);
    }
}

/// One watchdog pass. Returns `true` when it terminated an invocation.
pub fn tick(
    state: &ExecutionState,
    terminator: &dyn Terminator,
    max_task_duration: Duration,
    metrics: &WorkerMetrics,
) -> bool {
    if state.debugger_active() {
        return false;
    }
    let Some(elapsed) = state.elapsed() else {
        return false;
    };
    if elapsed <= max_task_duration || !state.claim() {
        return false;
    }
    tracing::info!(
        "task took {:?} (limit {:?}), terminating its execution",
        elapsed,
        max_task_duration
    );
    WorkerMetrics::incr(&metrics.timeout_count);
    terminator.terminate();
    state.mark_terminated();
    true
}

pub struct Watchdog {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn spawn(
        state: Arc<ExecutionState>,
        terminator: Arc<dyn Terminator>,
        max_task_duration: Duration,
        metrics: Arc<WorkerMetrics>,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("eventing-watchdog".to_string())
            .spawn(move || {
                tracing::debug!("watchdog started, limit {:?}", max_task_duration);
                while !thread_stop.load(Ordering::Acquire) {
                    thread::park_timeout(POLL_INTERVAL);
                    tick(&state, terminator.as_ref(), max_task_duration, &metrics);
                }
                tracing::debug!("watchdog stopped");
            })?;
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            let _ = thread.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}
