//! Wall-clock time and cancellable delayed tasks.
//!
//! The debounce timer and the scheduler's deferred passes both go through
//! [`Clock::schedule`]. Each caller keeps a single [`Cancellable`] slot and
//! cancels the previous one before arming a new one.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a scheduled task. Cancelling is idempotent.
#[derive(Debug, Clone)]
pub struct Cancellable {
    token: CancellationToken,
}

impl Cancellable {
    fn new() -> Self {
        Cancellable {
            token: CancellationToken::new(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Source of time and delayed execution.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Runs `task` once after `delay`, unless cancelled first.
    fn schedule(&self, delay: Duration, task: Task) -> Cancellable;
}

// ─── Tokio clock ─────────────────────────────────────────────────────────────

/// Production clock: system time plus tasks spawned on a Tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioClock {
    runtime: Handle,
}

impl TokioClock {
    /// Creates a clock bound to the given runtime.
    pub fn new(runtime: Handle) -> Self {
        TokioClock { runtime }
    }

    /// Creates a clock bound to the runtime this is called from.
    ///
    /// Returns `None` outside a Tokio runtime.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn schedule(&self, delay: Duration, task: Task) -> Cancellable {
        let cancellable = Cancellable::new();
        let token = cancellable.token.clone();
        self.runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => trace!("Scheduled task cancelled"),
                _ = tokio::time::sleep(delay) => {
                    if !token.is_cancelled() {
                        task();
                    }
                }
            }
        });
        cancellable
    }
}

// ─── Manual clock ────────────────────────────────────────────────────────────

struct PendingTask {
    due: DateTime<Utc>,
    sequence: u64,
    cancellable: Cancellable,
    task: Task,
}

#[derive(Default)]
struct ManualState {
    now: Option<DateTime<Utc>>,
    next_sequence: u64,
    pending: Vec<PendingTask>,
    scheduled_delays: Vec<Duration>,
}

/// Deterministic clock for tests and for hosts that drive time themselves.
///
/// Time only moves when [`ManualClock::advance`] is called; due tasks run
/// inside that call, in due order, outside the internal lock.
#[derive(Clone, Default)]
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

impl ManualClock {
    /// Creates a clock starting at `start`.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        let clock = ManualClock::default();
        clock.state.lock().now = Some(start);
        clock
    }

    /// Creates a clock starting at the current system time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Moves time forward by `by`, running every task that becomes due.
    ///
    /// Tasks scheduled by a running task are run too if they fall inside
    /// the advanced window.
    pub fn advance(&self, by: Duration) {
        let target = {
            let state = self.state.lock();
            offset(state.now.unwrap_or_else(Utc::now), by)
        };

        loop {
            let next = {
                let mut state = self.state.lock();
                state.pending.retain(|p| !p.cancellable.is_cancelled());
                let position = state
                    .pending
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| p.due <= target)
                    .min_by_key(|(_, p)| (p.due, p.sequence))
                    .map(|(i, _)| i);
                match position {
                    Some(i) => {
                        let task = state.pending.remove(i);
                        state.now = Some(task.due.max(state.now.unwrap_or(task.due)));
                        Some(task)
                    }
                    None => {
                        state.now = Some(target);
                        None
                    }
                }
            };

            match next {
                Some(pending) => (pending.task)(),
                None => break,
            }
        }
    }

    /// Number of scheduled tasks that are neither run nor cancelled.
    pub fn pending_count(&self) -> usize {
        self.state
            .lock()
            .pending
            .iter()
            .filter(|p| !p.cancellable.is_cancelled())
            .count()
    }

    /// Every delay passed to [`Clock::schedule`], in call order.
    pub fn scheduled_delays(&self) -> Vec<Duration> {
        self.state.lock().scheduled_delays.clone()
    }

    /// Delay until the earliest live task, if any.
    pub fn next_due_in(&self) -> Option<Duration> {
        let state = self.state.lock();
        let now = state.now?;
        state
            .pending
            .iter()
            .filter(|p| !p.cancellable.is_cancelled())
            .map(|p| (p.due - now).to_std().unwrap_or(Duration::ZERO))
            .min()
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ManualClock")
            .field("now", &state.now)
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let mut state = self.state.lock();
        *state.now.get_or_insert_with(Utc::now)
    }

    fn schedule(&self, delay: Duration, task: Task) -> Cancellable {
        let cancellable = Cancellable::new();
        let mut state = self.state.lock();
        let now = *state.now.get_or_insert_with(Utc::now);
        let due = offset(now, delay);
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.scheduled_delays.push(delay);
        state.pending.push(PendingTask {
            due,
            sequence,
            cancellable: cancellable.clone(),
            task,
        });
        cancellable
    }
}

/// `at + by`, saturating at the latest representable instant.
fn offset(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
