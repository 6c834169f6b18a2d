//! Per-transaction alarm scheduling.
//!
//! There is at most one live alarm per (transaction, kind). Alarms sit in a
//! min-heap keyed by deadline; replacing or cancelling an alarm updates
//! the live table. Stale heap entries are skipped when they reach the top,
//! and the heap is pruned once they outnumber live alarms by more than
//! [`STALE_SLACK`], so it never holds more than `2 * live + STALE_SLACK`
//! entries.
//!
//! Alarms fire on a single scheduler thread. The scheduler lock is never
//! held while a [`TimeoutTarget`] runs, so targets may re-arm or cancel
//! their own alarms.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use fxhash::FxHashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

/// Kind of alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    /// Transaction lifetime expired.
    Active,
    /// Re-attempt a timeout rollback while the transaction is still on a
    /// thread.
    Repeat,
    /// Retry completion or replay with the superior.
    InDoubt,
    /// No client activity while suspended.
    Inactivity,
    /// Remove every alarm for the transaction.
    Cancel,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "ACTIVE",
            Self::Repeat => "REPEAT",
            Self::InDoubt => "IN_DOUBT",
            Self::Inactivity => "INACTIVITY",
            Self::Cancel => "CANCEL",
        };
        f.write_str(name)
    }
}

/// Receiver of alarms.
pub trait TimeoutTarget: Send + Sync {
    /// Called on the scheduler thread when an alarm of `kind` expires.
    fn timeout_fired(&self, kind: TimeoutKind);
}

/// Stale heap entries tolerated beyond the live alarm count.
const STALE_SLACK: usize = 64;

struct Alarm {
    deadline: Instant,
    seq: u64,
    tx: u64,
    kind: TimeoutKind,
}

impl PartialEq for Alarm {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Alarm {}

impl Ord for Alarm {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap behavior (earliest first)
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Alarm {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct LiveEntry {
    seq: u64,
    target: Weak<dyn TimeoutTarget>,
}

#[derive(Default)]
struct SchedulerState {
    heap: BinaryHeap<Alarm>,
    live: FxHashMap<(u64, TimeoutKind), LiveEntry>,
    next_seq: u64,
    shutdown: bool,
}

impl SchedulerState {
    fn is_current(&self, alarm: &Alarm) -> bool {
        self.live
            .get(&(alarm.tx, alarm.kind))
            .is_some_and(|entry| entry.seq == alarm.seq)
    }

    /// Drops stale heap entries once they outnumber live alarms.
    fn prune(&mut self) {
        let live_count = self.live.len();
        if self.heap.len() <= 2 * live_count + STALE_SLACK {
            return;
        }
        let before = self.heap.len();
        let Self { heap, live, .. } = self;
        heap.retain(|alarm| {
            live.get(&(alarm.tx, alarm.kind))
                .is_some_and(|entry| entry.seq == alarm.seq)
        });
        trace!(before, after = heap.len(), "pruned stale alarms");
    }
}

struct Shared {
    state: Mutex<SchedulerState>,
    wakeup: Condvar,
}

/// Alarm scheduler shared by every transaction in the process.
pub struct TimeoutManager {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimeoutManager {
    /// Starts the scheduler thread.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the thread cannot be spawned.
    pub fn start() -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(SchedulerState::default()),
            wakeup: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("xact-timeout".into())
            .spawn(move || run_scheduler(&worker))?;
        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Arms (or replaces) the alarm of `kind` for `tx`, firing after
    /// `seconds`. Zero seconds or [`TimeoutKind::Cancel`] disarm instead.
    pub fn set_timeout(
        &self,
        tx: u64,
        target: Weak<dyn TimeoutTarget>,
        kind: TimeoutKind,
        seconds: u64,
    ) {
        self.set_timeout_after(tx, target, kind, Duration::from_secs(seconds));
    }

    /// Like [`TimeoutManager::set_timeout`] with a [`Duration`].
    pub fn set_timeout_after(
        &self,
        tx: u64,
        target: Weak<dyn TimeoutTarget>,
        kind: TimeoutKind,
        after: Duration,
    ) {
        if kind == TimeoutKind::Cancel {
            self.cancel_all(tx);
            return;
        }
        if after.is_zero() {
            self.cancel(tx, kind);
            return;
        }

        let mut state = self.shared.state.lock();
        state.next_seq += 1;
        let seq = state.next_seq;
        let deadline = Instant::now() + after;
        let replaced = state
            .live
            .insert((tx, kind), LiveEntry { seq, target })
            .is_some();
        state.heap.push(Alarm {
            deadline,
            seq,
            tx,
            kind,
        });
        if replaced {
            state.prune();
        }
        drop(state);
        self.shared.wakeup.notify_one();
        debug!(tx, %kind, after = ?after, replaced, "alarm armed");
    }

    /// Disarms the alarm of `kind` for `tx`, if any.
    pub fn cancel(&self, tx: u64, kind: TimeoutKind) {
        let mut state = self.shared.state.lock();
        if state.live.remove(&(tx, kind)).is_some() {
            state.prune();
            trace!(tx, %kind, "alarm cancelled");
        }
    }

    /// Disarms every alarm for `tx`.
    pub fn cancel_all(&self, tx: u64) {
        let mut state = self.shared.state.lock();
        state.live.retain(|(id, _), _| *id != tx);
        state.prune();
    }

    /// Whether an alarm of `kind` is armed for `tx`.
    #[must_use]
    pub fn is_pending(&self, tx: u64, kind: TimeoutKind) -> bool {
        self.shared.state.lock().live.contains_key(&(tx, kind))
    }

    /// Number of armed alarms across all transactions.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().live.len()
    }

    /// Number of armed alarms for `tx`.
    #[must_use]
    pub fn pending_for(&self, tx: u64) -> usize {
        self.shared
            .state
            .lock()
            .live
            .keys()
            .filter(|(id, _)| *id == tx)
            .count()
    }

    #[cfg(test)]
    fn scheduled_len(&self) -> usize {
        self.shared.state.lock().heap.len()
    }
}

impl Drop for TimeoutManager {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.wakeup.notify_all();
        if let Some(handle) = self.thread.lock().take() {
            // The last strong reference may be dropped by a target running on
            // the scheduler thread itself; joining there would deadlock.
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

fn run_scheduler(shared: &Shared) {
    loop {
        let (target, tx, kind) = {
            let mut state = shared.state.lock();
            loop {
                if state.shutdown {
                    return;
                }
                let next = state
                    .heap
                    .peek()
                    .map(|top| (state.is_current(top), top.deadline));
                let Some((current, deadline)) = next else {
                    shared.wakeup.wait(&mut state);
                    continue;
                };
                if !current {
                    state.heap.pop();
                    continue;
                }
                if deadline > Instant::now() {
                    shared.wakeup.wait_until(&mut state, deadline);
                    continue;
                }
                let Some(alarm) = state.heap.pop() else {
                    continue;
                };
                let Some(entry) = state.live.remove(&(alarm.tx, alarm.kind)) else {
                    continue;
                };
                break (entry.target, alarm.tx, alarm.kind);
            }
        };

        match target.upgrade() {
            Some(target) => {
                debug!(tx, %kind, "alarm fired");
                target.timeout_fired(kind);
            }
            None => trace!(tx, %kind, "alarm target already gone"),
        }
    }
}
