//! Deadline timers.
//!
//! A [`TimerWheel`] owns a background thread that sleeps until the earliest
//! scheduled deadline and hands expirations to an [`Executor`]. Timers are
//! delivered through the same dispatch mechanism as every other socket
//! event; a cancelled timer never fires.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Instant;

use hashbrown::HashSet;
use parking_lot::{Condvar, Mutex};

use crate::strand::{Executor, Functor};

struct Entry {
    deadline: Instant,
    id: u64,
    callback: Option<Functor>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so the binary heap yields the earliest deadline first.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

struct WheelState {
    entries: BinaryHeap<Entry>,
    cancelled: HashSet<u64>,
    running: bool,
}

struct WheelShared {
    state: Mutex<WheelState>,
    condvar: Condvar,
    executor: Arc<dyn Executor>,
    next_id: AtomicU64,
}

/// A handle to one scheduled expiration.
///
/// Dropping the handle does not cancel the timer; call [`Timer::cancel`].
#[derive(Clone)]
pub struct Timer {
    id: u64,
    wheel: Weak<WheelShared>,
}

impl Timer {
    /// Prevent the timer from firing.
    ///
    /// Returns true if the timer had not yet fired and is now cancelled.
    pub fn cancel(&self) -> bool {
        let Some(wheel) = self.wheel.upgrade() else {
            return false;
        };
        let mut state = wheel.state.lock();
        let pending = state.entries.iter().any(|e| e.id == self.id);
        if pending {
            state.cancelled.insert(self.id);
        }
        pending
    }

    /// An identifier unique within the owning wheel.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer").field("id", &self.id).finish()
    }
}

/// A min-heap of deadlines drained by a dedicated thread.
pub struct TimerWheel {
    shared: Arc<WheelShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerWheel {
    /// Create a wheel delivering expirations through `executor` and start
    /// its driver thread.
    #[must_use]
    pub fn new(executor: Arc<dyn Executor>) -> Arc<Self> {
        let shared = Arc::new(WheelShared {
            state: Mutex::new(WheelState {
                entries: BinaryHeap::new(),
                cancelled: HashSet::new(),
                running: true,
            }),
            condvar: Condvar::new(),
            executor,
            next_id: AtomicU64::new(1),
        });

        let driver = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("outrigger-timer".into())
            .spawn(move || Self::drive(&driver))
            .expect("failed to spawn timer thread");

        Arc::new(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Schedule `callback` to run at `deadline`.
    pub fn schedule(&self, deadline: Instant, callback: Functor) -> Timer {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.shared.state.lock();
            state.entries.push(Entry {
                deadline,
                id,
                callback: Some(callback),
            });
        }
        self.shared.condvar.notify_one();
        Timer {
            id,
            wheel: Arc::downgrade(&self.shared),
        }
    }

    /// Stop the driver thread. Unfired timers are discarded.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            state.running = false;
            state.entries.clear();
            state.cancelled.clear();
        }
        self.shared.condvar.notify_one();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }

    fn drive(shared: &Arc<WheelShared>) {
        let mut state = shared.state.lock();
        loop {
            if !state.running {
                return;
            }

            let now = Instant::now();
            let next_deadline = state.entries.peek().map(|e| e.deadline);

            match next_deadline {
                None => {
                    shared.condvar.wait(&mut state);
                }
                Some(deadline) if deadline > now => {
                    let _ = shared.condvar.wait_until(&mut state, deadline);
                }
                Some(_) => {
                    let mut entry = state.entries.pop().expect("peeked entry exists");
                    let cancelled = state.cancelled.remove(&entry.id);
                    if !cancelled {
                        if let Some(callback) = entry.callback.take() {
                            let executor = Arc::clone(&shared.executor);
                            drop(state);
                            executor.execute(callback);
                            state = shared.state.lock();
                        }
                    }
                }
            }
        }
    }
}

impl Drop for TimerWheel {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strand::InlineExecutor;
    use std::time::Duration;

    #[test]
    fn test_expiration_fires() {
        let wheel = TimerWheel::new(Arc::new(InlineExecutor));
        let (tx, rx) = flume::bounded(1);

        wheel.schedule(
            Instant::now() + Duration::from_millis(10),
            Box::new(move || {
                tx.send(()).unwrap();
            }),
        );

        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        wheel.stop();
    }

    #[test]
    fn test_cancel_prevents_fire() {
        let wheel = TimerWheel::new(Arc::new(InlineExecutor));
        let (tx, rx) = flume::bounded(1);

        let timer = wheel.schedule(
            Instant::now() + Duration::from_millis(50),
            Box::new(move || {
                tx.send(()).unwrap();
            }),
        );
        assert!(timer.cancel());

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        wheel.stop();
    }

    #[test]
    fn test_expirations_in_deadline_order() {
        let wheel = TimerWheel::new(Arc::new(InlineExecutor));
        let (tx, rx) = flume::unbounded();

        let base = Instant::now() + Duration::from_millis(20);
        for i in (0..5u32).rev() {
            let tx = tx.clone();
            wheel.schedule(
                base + Duration::from_millis(u64::from(i) * 15),
                Box::new(move || {
                    tx.send(i).unwrap();
                }),
            );
        }

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        wheel.stop();
    }
}
