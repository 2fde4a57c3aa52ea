//! Fixed-size worker pool fed from a FIFO task queue.

use crate::error::{ServerError, ServerResult};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Queue {
    tasks: VecDeque<Task>,
    stopped: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    not_empty: Condvar,
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers. Zero means one worker per hardware thread.
    pub fn new(size: usize) -> Self {
        let size = if size == 0 { num_cpus::get() } else { size };

        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                tasks: VecDeque::new(),
                stopped: false,
            }),
            not_empty: Condvar::new(),
        });

        let workers = (0..size)
            .map(|i| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("vigil-worker-{}", i))
                    .spawn(move || worker_loop(&shared))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self { shared, workers }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn pending_tasks(&self) -> usize {
        self.shared.queue.lock().unwrap().tasks.len()
    }

    /// Enqueue a task. Fails once the pool has been shut down.
    pub fn submit<F>(&self, task: F) -> ServerResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            if queue.stopped {
                return Err(ServerError::PoolStopped);
            }
            queue.tasks.push_back(Box::new(task));
        }
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Enqueue a task and hand back a channel for its return value. The
    /// receiver yields nothing if the task panics.
    pub fn submit_with_result<F, T>(&self, task: F) -> ServerResult<mpsc::Receiver<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        self.submit(move || {
            let _ = tx.send(task());
        })?;
        Ok(rx)
    }

    fn shutdown(&mut self) {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            if queue.stopped {
                return;
            }
            queue.stopped = true;
            // Tasks still queued at shutdown are discarded.
            queue.tasks.clear();
        }
        self.shared.not_empty.notify_all();

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let task = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if queue.stopped {
                    return;
                }
                if let Some(task) = queue.tasks.pop_front() {
                    break task;
                }
                queue = shared.not_empty.wait(queue).unwrap();
            }
        };

        // The queue mutex is released here; a slow task never blocks enqueues.
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            tracing::error!("worker task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn executes_every_submitted_task() {
        let pool = WorkerPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));

        let receivers: Vec<_> = (0..50)
            .map(|_| {
                let counter = counter.clone();
                pool.submit_with_result(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
            })
            .collect();

        for rx in receivers {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn returns_values_through_result_handle() {
        let pool = WorkerPool::new(2);
        let rx = pool.submit_with_result(|| 6 * 7).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }

    #[test]
    fn submit_after_shutdown_fails() {
        let mut pool = WorkerPool::new(2);
        pool.shutdown();
        assert!(matches!(pool.submit(|| {}), Err(ServerError::PoolStopped)));
    }

    #[test]
    fn no_task_runs_after_shutdown_completes() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = WorkerPool::new(2);
            for _ in 0..20 {
                let counter = counter.clone();
                pool.submit(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }
        }
        // Pool dropped: workers joined, nothing can run afterwards.
        let settled = counter.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(counter.load(Ordering::SeqCst), settled);
    }

    #[test]
    fn task_panic_does_not_kill_worker() {
        let pool = WorkerPool::new(1);
        pool.submit(|| panic!("boom")).unwrap();

        let rx = pool.submit_with_result(|| "still alive").unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "still alive");
    }

    #[test]
    fn zero_size_defaults_to_core_count() {
        let pool = WorkerPool::new(0);
        assert!(pool.size() >= 1);
    }
}
