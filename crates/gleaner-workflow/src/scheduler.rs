//! Continuation scheduling on top of a host's one-shot timers.
//!
//! ```text
//! ContinuationScheduler
//!     └── TimerHost (trait)
//!           └── TokioTimerHost    - in-process timers, delivered over mpsc
//!           └── ManualTimerHost   - recorded timers, fired by the caller
//! ```
//!
//! Each run holds at most one armed continuation: scheduling first disarms
//! every continuation timer already armed for that run.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use gleaner_types::{ContinuationLease, RunId, now};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::error::SchedulerError;

/// Handler name of the orchestrator's continuation entry point.
pub const CONTINUE_HANDLER: &str = "gleaner.continue_run";

/// Payload of a continuation callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Continuation {
    pub run_id: RunId,
    /// Must match the run's lease token, else the callback is stale.
    pub token: String,
}

/// A timer the host is holding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArmedTimer {
    pub timer_id: String,
    pub handler: String,
    pub delay: Duration,
    pub continuation: Continuation,
}

/// A host that can arm a limited number of one-shot timers.
pub trait TimerHost: Send + Sync {
    /// Arm a timer that invokes `handler` with `continuation` after `delay`.
    fn arm(
        &self,
        handler: &str,
        delay: Duration,
        continuation: Continuation,
    ) -> Result<String, SchedulerError>;

    /// Disarm a timer. Returns whether it was still armed.
    fn disarm(&self, timer_id: &str) -> bool;

    /// Timers currently armed.
    fn armed(&self) -> Vec<ArmedTimer>;

    /// Maximum number of timers that may be armed at once.
    fn capacity(&self) -> usize;
}

// ─────────────────────────────────────────────────────────────────────────────
// Tokio Timer Host
// ─────────────────────────────────────────────────────────────────────────────

type TimerTable = Arc<Mutex<HashMap<String, (ArmedTimer, JoinHandle<()>)>>>;

/// In-process timers. Fired continuations arrive on the receiver returned by
/// [`TokioTimerHost::new`]. Must be used inside a Tokio runtime.
pub struct TokioTimerHost {
    timers: TimerTable,
    tx: mpsc::UnboundedSender<Continuation>,
    capacity: usize,
}

impl TokioTimerHost {
    pub fn new(capacity: usize) -> (Self, mpsc::UnboundedReceiver<Continuation>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let host = Self {
            timers: Arc::new(Mutex::new(HashMap::new())),
            tx,
            capacity,
        };
        (host, rx)
    }
}

impl TimerHost for TokioTimerHost {
    fn arm(
        &self,
        handler: &str,
        delay: Duration,
        continuation: Continuation,
    ) -> Result<String, SchedulerError> {
        if self.tx.is_closed() {
            return Err(SchedulerError::Closed);
        }
        let mut timers = self.timers.lock();
        if timers.len() >= self.capacity {
            return Err(SchedulerError::QuotaExceeded {
                armed: timers.len(),
                capacity: self.capacity,
            });
        }

        let timer_id = Uuid::new_v4().to_string();
        let task = {
            let timers = Arc::clone(&self.timers);
            let tx = self.tx.clone();
            let timer_id = timer_id.clone();
            let continuation = continuation.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if timers.lock().remove(&timer_id).is_none() {
                    return;
                }
                if tx.send(continuation).is_err() {
                    debug!(timer_id = %timer_id, "Continuation receiver dropped");
                }
            })
        };

        let armed = ArmedTimer {
            timer_id: timer_id.clone(),
            handler: handler.to_string(),
            delay,
            continuation,
        };
        timers.insert(timer_id.clone(), (armed, task));
        Ok(timer_id)
    }

    fn disarm(&self, timer_id: &str) -> bool {
        match self.timers.lock().remove(timer_id) {
            Some((_, task)) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    fn armed(&self) -> Vec<ArmedTimer> {
        self.timers
            .lock()
            .values()
            .map(|(armed, _)| armed.clone())
            .collect()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for TokioTimerHost {
    fn drop(&mut self) {
        for (_, (_, task)) in self.timers.lock().drain() {
            task.abort();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Manual Timer Host
// ─────────────────────────────────────────────────────────────────────────────

/// Records armed timers; the caller decides when they fire.
#[derive(Debug)]
pub struct ManualTimerHost {
    timers: Mutex<Vec<ArmedTimer>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl Default for ManualTimerHost {
    fn default() -> Self {
        Self::new(20)
    }
}

impl ManualTimerHost {
    pub fn new(capacity: usize) -> Self {
        Self {
            timers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            capacity,
        }
    }

    /// Fire the oldest armed timer.
    pub fn fire_next(&self) -> Option<Continuation> {
        let mut timers = self.timers.lock();
        if timers.is_empty() {
            return None;
        }
        Some(timers.remove(0).continuation)
    }

    /// Fire every armed timer, oldest first.
    pub fn fire_all(&self) -> Vec<Continuation> {
        self.timers
            .lock()
            .drain(..)
            .map(|t| t.continuation)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.timers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.lock().is_empty()
    }
}

impl TimerHost for ManualTimerHost {
    fn arm(
        &self,
        handler: &str,
        delay: Duration,
        continuation: Continuation,
    ) -> Result<String, SchedulerError> {
        let mut timers = self.timers.lock();
        if timers.len() >= self.capacity {
            return Err(SchedulerError::QuotaExceeded {
                armed: timers.len(),
                capacity: self.capacity,
            });
        }
        let timer_id = format!("timer-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        timers.push(ArmedTimer {
            timer_id: timer_id.clone(),
            handler: handler.to_string(),
            delay,
            continuation,
        });
        Ok(timer_id)
    }

    fn disarm(&self, timer_id: &str) -> bool {
        let mut timers = self.timers.lock();
        let before = timers.len();
        timers.retain(|t| t.timer_id != timer_id);
        timers.len() != before
    }

    fn armed(&self) -> Vec<ArmedTimer> {
        self.timers.lock().clone()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Continuation Scheduler
// ─────────────────────────────────────────────────────────────────────────────

/// Arms and cancels continuation callbacks.
#[derive(Clone)]
pub struct ContinuationScheduler {
    host: Arc<dyn TimerHost>,
    delay: Duration,
}

impl ContinuationScheduler {
    pub fn new(host: Arc<dyn TimerHost>, delay: Duration) -> Self {
        Self { host, delay }
    }

    /// Arm the single continuation for `run_id`, replacing any earlier one.
    pub fn schedule(&self, run_id: &RunId) -> Result<ContinuationLease, SchedulerError> {
        let replaced = self.cancel(run_id);
        let token = Uuid::new_v4().to_string();
        let timer_id = self.host.arm(
            CONTINUE_HANDLER,
            self.delay,
            Continuation {
                run_id: run_id.clone(),
                token: token.clone(),
            },
        )?;
        debug!(
            run_id = %run_id,
            timer_id = %timer_id,
            replaced,
            delay_ms = self.delay.as_millis() as u64,
            "Continuation scheduled"
        );
        Ok(ContinuationLease {
            token,
            timer_id,
            armed_at: now(),
        })
    }

    /// Disarm every continuation armed for `run_id`.
    pub fn cancel(&self, run_id: &RunId) -> usize {
        self.disarm_where(|t| &t.continuation.run_id == run_id)
    }

    /// Disarm every continuation timer, whatever run it targets.
    pub fn cleanup(&self) -> usize {
        self.disarm_where(|_| true)
    }

    /// Continuations currently armed for `run_id`.
    pub fn pending(&self, run_id: &RunId) -> usize {
        self.host
            .armed()
            .iter()
            .filter(|t| t.handler == CONTINUE_HANDLER && &t.continuation.run_id == run_id)
            .count()
    }

    fn disarm_where(&self, pred: impl Fn(&ArmedTimer) -> bool) -> usize {
        self.host
            .armed()
            .iter()
            .filter(|t| t.handler == CONTINUE_HANDLER && pred(t))
            .filter(|t| self.host.disarm(&t.timer_id))
            .count()
    }
}
