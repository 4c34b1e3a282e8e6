//! Executors and strands.
//!
//! An [`Executor`] runs functors on some pool of threads with no ordering
//! guarantee. A [`Strand`] wraps an executor with a serial guarantee:
//! functors posted through one strand never run concurrently and run in
//! post order. The dispatch layer uses the thread-local current-strand mark
//! to decide whether an announcement may run inline.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

/// A deferred unit of work.
pub type Functor = Box<dyn FnOnce() + Send + 'static>;

/// An execution context for functors.
pub trait Executor: Send + Sync {
    /// Run `f` at some point in the future, on any thread.
    fn execute(&self, f: Functor);
}

static NEXT_STRAND_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static ACTIVE_STRANDS: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

struct StrandQueue {
    queue: VecDeque<Functor>,
    draining: bool,
}

/// A serial executor.
///
/// Functors posted through a strand are run one at a time, in post order,
/// by the underlying executor. At most one drain loop is scheduled at a
/// time, so the serial guarantee holds no matter how many threads the
/// executor has.
pub struct Strand {
    id: u64,
    state: Mutex<StrandQueue>,
    executor: Arc<dyn Executor>,
}

impl Strand {
    /// Create a strand over `executor`.
    #[must_use]
    pub fn new(executor: Arc<dyn Executor>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_STRAND_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(StrandQueue {
                queue: VecDeque::new(),
                draining: false,
            }),
            executor,
        })
    }

    /// A unique identifier for this strand.
    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Post `f` to run serially after everything already posted.
    pub fn post(self: &Arc<Self>, f: Functor) {
        let schedule = {
            let mut state = self.state.lock();
            state.queue.push_back(f);
            if state.draining {
                false
            } else {
                state.draining = true;
                true
            }
        };

        if schedule {
            let strand = Arc::clone(self);
            self.executor.execute(Box::new(move || strand.drain()));
        }
    }

    /// Whether the calling thread is currently executing inside this strand.
    #[must_use]
    pub fn running_here(&self) -> bool {
        ACTIVE_STRANDS.with(|stack| stack.borrow().last() == Some(&self.id))
    }

    fn drain(self: Arc<Self>) {
        ACTIVE_STRANDS.with(|stack| stack.borrow_mut().push(self.id));

        loop {
            let next = {
                let mut state = self.state.lock();
                match state.queue.pop_front() {
                    Some(f) => Some(f),
                    None => {
                        state.draining = false;
                        None
                    }
                }
            };
            match next {
                Some(f) => f(),
                None => break,
            }
        }

        ACTIVE_STRANDS.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

impl std::fmt::Debug for Strand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strand").field("id", &self.id).finish()
    }
}

/// An executor that runs functors immediately on the calling thread.
///
/// Used by unit tests and by foreground-stepped dispatchers.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, f: Functor) {
        f();
    }
}

/// A fixed pool of worker threads fed over a channel.
pub struct ThreadExecutor {
    sender: Mutex<Option<flume::Sender<Functor>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    thread_count: usize,
}

impl ThreadExecutor {
    /// Spawn a pool of `threads` workers.
    ///
    /// Passing 0 uses one worker per available CPU.
    #[must_use]
    pub fn new(threads: usize) -> Arc<Self> {
        let threads = if threads == 0 {
            num_cpus::get()
        } else {
            threads
        };

        let (sender, receiver) = flume::unbounded::<Functor>();

        let workers = (0..threads)
            .map(|index| {
                let receiver = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("outrigger-executor-{index}"))
                    .spawn(move || {
                        while let Ok(f) = receiver.recv() {
                            f();
                        }
                    })
                    .expect("failed to spawn executor worker")
            })
            .collect();

        Arc::new(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            thread_count: threads,
        })
    }

    /// The number of worker threads.
    #[must_use]
    pub const fn threads(&self) -> usize {
        self.thread_count
    }

    /// Stop accepting work and join the workers.
    ///
    /// Functors already queued still run before the workers exit.
    pub fn shutdown(&self) {
        // Dropping the sender closes the channel; the workers drain what
        // remains and exit their recv loop.
        drop(self.sender.lock().take());

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.join();
        }
    }
}

impl Executor for ThreadExecutor {
    fn execute(&self, f: Functor) {
        let sender = self.sender.lock().clone();
        match sender {
            Some(sender) if sender.send(f).is_ok() => {}
            _ => tracing::warn!("executor pool is shut down; functor dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_inline_executor_runs_immediately() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        InlineExecutor.execute(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_strand_preserves_order() {
        let executor = ThreadExecutor::new(4);
        let strand = Strand::new(executor.clone() as Arc<dyn Executor>);

        let (tx, rx) = flume::unbounded();
        for i in 0..100 {
            let tx = tx.clone();
            strand.post(Box::new(move || {
                tx.send(i).unwrap();
            }));
        }

        let mut seen = Vec::new();
        for _ in 0..100 {
            seen.push(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        }
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_running_here() {
        let executor = ThreadExecutor::new(2);
        let strand = Strand::new(executor.clone() as Arc<dyn Executor>);

        assert!(!strand.running_here());

        let (tx, rx) = flume::bounded(1);
        let probe = Arc::clone(&strand);
        strand.post(Box::new(move || {
            tx.send(probe.running_here()).unwrap();
        }));

        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn test_distinct_strands_have_distinct_ids() {
        let executor: Arc<dyn Executor> = Arc::new(InlineExecutor);
        let a = Strand::new(Arc::clone(&executor));
        let b = Strand::new(executor);
        assert_ne!(a.id(), b.id());
    }
}
