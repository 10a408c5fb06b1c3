//! A bounded, lazily grown pool of worker threads.
//!
//! Each worker thread runs exactly one task and then finishes. Below the ceiling a submitted task
//! gets a fresh worker straight away; above it the task waits in a FIFO queue. A supervisor thread
//! reaps finished workers and starts queued tasks as room frees up.

use slab::Slab;

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

/// Ceiling used when none is configured.
pub const MAX_THREADS: usize = 50;

/// An opaque unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct Inner {
    /// Set once by `stop`. Tasks submitted afterwards are dropped.
    shutdown: bool,
    /// Most workers allowed to run at once.
    max_threads: usize,
    /// Workers currently executing their task.
    running: usize,
    /// Tasks waiting for a worker, oldest first.
    queue: VecDeque<Task>,
    /// Every worker not yet joined, keyed by the slot it reports back when done.
    workers: Slab<JoinHandle<()>>,
    /// Slots of workers whose task has ended.
    finished: Vec<usize>,
}

impl Inner {
    fn has_room(&self) -> bool {
        self.running < self.max_threads
    }

    fn should_wake(&self) -> bool {
        self.shutdown || !self.finished.is_empty() || (!self.queue.is_empty() && self.has_room())
    }
}

struct Shared {
    inner: Mutex<Inner>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<Inner> {
        // Tasks never run under this lock, so a poisoned guard still holds consistent state.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start `task` on a new worker. The caller has already checked there is room.
    fn launch(this: &Arc<Shared>, inner: &mut Inner, task: Task) {
        let entry = inner.workers.vacant_entry();
        let key = entry.key();
        let shared = this.clone();
        inner.running += 1;

        let spawned = thread::Builder::new()
            .name(format!("worker-{}", key))
            .spawn(move || {
                let _done = Finished { shared, key };
                task();
            });

        match spawned {
            Ok(handle) => {
                entry.insert(handle);
            }
            Err(e) => {
                // The closure, and the task with it, is gone; nothing is left to run.
                error!("Could not spawn worker thread: {}", e);
                inner.running -= 1;
            }
        }
    }
}

/// Marks a worker finished when its task ends, even by panicking.
struct Finished {
    shared: Arc<Shared>,
    key: usize,
}

impl Drop for Finished {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        inner.running -= 1;
        inner.finished.push(self.key);
        self.shared.wake.notify_all();
    }
}

/// The worker pool itself, plus its supervisor.
pub struct WorkerPool {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a new pool with the given ceiling, and start its supervisor.
    pub fn new(max_threads: usize) -> Self {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                shutdown: false,
                max_threads,
                running: 0,
                queue: VecDeque::new(),
                workers: Slab::new(),
                finished: Vec::new(),
            }),
            wake: Condvar::new(),
        });

        let supervisor = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("pool-supervisor".into())
                .spawn(move || supervise(&shared))
                .map_err(|e| error!("Could not spawn pool supervisor: {}", e))
                .ok()
        };

        WorkerPool {
            shared,
            supervisor: Mutex::new(supervisor),
        }
    }

    /// Run `task` on a worker. With a ceiling of zero it runs right here, before `add` returns.
    /// After `stop` the task is silently dropped.
    pub fn add<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.shared.lock();
        if inner.max_threads == 0 {
            drop(inner);
            task();
            return;
        }
        if inner.shutdown {
            return;
        }

        if inner.queue.is_empty() && inner.has_room() {
            Shared::launch(&self.shared, &mut inner, Box::new(task));
        } else {
            inner.queue.push_back(Box::new(task));
            self.shared.wake.notify_all();
        }
    }

    /// Submit a batch. Free worker slots are filled in order, the rest is queued behind anything
    /// already waiting.
    pub fn add_multi<I>(&self, tasks: I)
    where
        I: IntoIterator<Item = Task>,
    {
        let mut inner = self.shared.lock();
        if inner.max_threads == 0 {
            drop(inner);
            for task in tasks {
                task();
            }
            return;
        }
        if inner.shutdown {
            return;
        }

        let mut tasks = tasks.into_iter();
        while inner.queue.is_empty() && inner.has_room() {
            match tasks.next() {
                Some(task) => Shared::launch(&self.shared, &mut inner, task),
                None => return,
            }
        }

        let before = inner.queue.len();
        inner.queue.extend(tasks);
        if inner.queue.len() > before {
            self.shared.wake.notify_all();
        }
    }

    /// Change the ceiling. Workers above a lowered ceiling are left to finish.
    pub fn set_max_threads(&self, max_threads: usize) {
        self.shared.lock().max_threads = max_threads;
        self.shared.wake.notify_all();
    }

    pub fn max_threads(&self) -> usize {
        self.shared.lock().max_threads
    }

    /// Workers currently executing a task.
    pub fn running(&self) -> usize {
        self.shared.lock().running
    }

    /// Tasks waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.lock().shutdown
    }

    /// Refuse new work, drop what is still queued, and wait for every worker to finish its task.
    pub fn stop(&self) {
        {
            let mut inner = self.shared.lock();
            inner.shutdown = true;
            self.shared.wake.notify_all();
        }
        self.join();

        let workers: Vec<_> = {
            let mut inner = self.shared.lock();
            inner.queue.clear();
            inner.finished.clear();
            inner.workers.drain().collect()
        };
        for worker in workers {
            let _ = worker.join();
        }
    }

    /// Wait for the supervisor to exit, which happens once the pool is stopped.
    pub fn join(&self) {
        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(supervisor) = supervisor {
            let _ = supervisor.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.is_stopped() {
            self.stop();
        }
    }
}

fn supervise(shared: &Arc<Shared>) {
    loop {
        let mut inner = shared.lock();
        while !inner.should_wake() {
            inner = shared.wake.wait(inner).unwrap_or_else(|poisoned| poisoned.into_inner());
        }

        if inner.shutdown {
            break;
        }

        let finished: Vec<_> = inner.finished.drain(..).collect();
        let reaped: Vec<_> = finished
            .into_iter()
            .filter_map(|key| inner.workers.try_remove(key))
            .collect();

        while inner.has_room() {
            match inner.queue.pop_front() {
                Some(task) => Shared::launch(shared, &mut inner, task),
                None => break,
            }
        }
        drop(inner);

        // The task is over; only the thread's exit is left to wait for.
        for worker in reaped {
            let _ = worker.join();
        }
    }
    trace!("Pool supervisor exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn eventually<F: Fn() -> bool>(check: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn zero_ceiling_runs_on_caller() {
        let pool = WorkerPool::new(0);
        let caller = thread::current().id();
        let (tx, rx) = mpsc::channel();
        pool.add(move || tx.send(thread::current().id()).unwrap());
        assert_eq!(rx.try_recv().unwrap(), caller);
    }

    #[test]
    fn concurrency_never_exceeds_ceiling() {
        const CEILING: usize = 3;
        let pool = WorkerPool::new(CEILING);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..30 {
            let active = active.clone();
            let peak = peak.clone();
            let done = done.clone();
            pool.add(move || {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(2));
                active.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
            });
            assert!(pool.running() <= CEILING);
        }

        assert!(eventually(|| done.load(Ordering::SeqCst) == 30));
        assert!(peak.load(Ordering::SeqCst) <= CEILING);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn queued_tasks_start_in_order_as_slots_free() {
        let pool = WorkerPool::new(MAX_THREADS);
        pool.set_max_threads(2);

        let (started_tx, started_rx) = mpsc::channel();
        let mut releases = Vec::new();
        for i in 0..5 {
            let (release_tx, release_rx) = mpsc::channel::<()>();
            releases.push(release_tx);
            let started_tx = started_tx.clone();
            pool.add(move || {
                started_tx.send(i).unwrap();
                release_rx.recv().unwrap();
            });
        }

        let wait = Duration::from_secs(10);
        let mut first: Vec<_> = (0..2).map(|_| started_rx.recv_timeout(wait).unwrap()).collect();
        first.sort();
        assert_eq!(first, vec![0, 1]);
        assert!(started_rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(pool.queued(), 3);

        for expected in 2..5 {
            releases[expected - 2].send(()).unwrap();
            assert_eq!(started_rx.recv_timeout(wait).unwrap(), expected);
        }
        for release in &releases[3..] {
            release.send(()).unwrap();
        }
        assert!(eventually(|| pool.running() == 0));
    }

    #[test]
    fn batch_fills_slots_then_queues() {
        let pool = WorkerPool::new(1);
        let (tx, rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let mut tasks: Vec<Task> = Vec::new();
        {
            let tx = tx.clone();
            tasks.push(Box::new(move || {
                tx.send(0).unwrap();
                release_rx.recv().unwrap();
            }));
        }
        for i in 1..4 {
            let tx = tx.clone();
            tasks.push(Box::new(move || tx.send(i).unwrap()));
        }
        pool.add_multi(tasks);

        let wait = Duration::from_secs(10);
        assert_eq!(rx.recv_timeout(wait).unwrap(), 0);
        assert_eq!(pool.queued(), 3);
        release_tx.send(()).unwrap();
        let rest: Vec<_> = (0..3).map(|_| rx.recv_timeout(wait).unwrap()).collect();
        assert_eq!(rest, vec![1, 2, 3]);
    }

    #[test]
    fn raised_ceiling_drains_queue() {
        let pool = WorkerPool::new(1);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        pool.add(move || release_rx.recv().unwrap());

        let (tx, rx) = mpsc::channel();
        pool.add(move || tx.send(()).unwrap());
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        pool.set_max_threads(2);
        assert!(rx.recv_timeout(Duration::from_secs(10)).is_ok());
        release_tx.send(()).unwrap();
    }

    #[test]
    fn tasks_after_stop_are_dropped() {
        let pool = WorkerPool::new(2);
        let ran = Arc::new(AtomicUsize::new(0));
        pool.stop();
        assert!(pool.is_stopped());

        let counter = ran.clone();
        pool.add(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(50));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        pool.join();
    }

    #[test]
    fn stop_waits_for_running_tasks() {
        let pool = WorkerPool::new(2);
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        pool.add(move || {
            thread::sleep(Duration::from_millis(50));
            counter.fetch_add(1, Ordering::SeqCst);
        });
        pool.stop();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_task_frees_its_slot() {
        let pool = WorkerPool::new(1);
        pool.add(|| panic!("task failure"));

        let (tx, rx) = mpsc::channel();
        pool.add(move || tx.send(()).unwrap());
        assert!(rx.recv_timeout(Duration::from_secs(10)).is_ok());
        assert!(eventually(|| pool.running() == 0));
    }
}
