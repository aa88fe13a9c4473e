//! Bounded worker pool for processor invocations.
//!
//! Replaces detached per-job thread spawning: a fixed set of workers drains
//! a bounded queue, and `try_submit` fails fast when the queue is full so
//! the dispatcher can apply its drop policy instead of blocking the intake
//! loop.

use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    sender: Option<SyncSender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(workers: usize, queue_depth: usize) -> Self {
        let (sender, receiver) = mpsc::sync_channel::<Job>(queue_depth);
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..workers.max(1))
            .map(|i| {
                let receiver: Arc<Mutex<Receiver<Job>>> = Arc::clone(&receiver);
                thread::Builder::new()
                    .name(format!("worker-{i}"))
                    .spawn(move || loop {
                        // Hold the receiver lock only long enough to pop.
                        let job = match receiver.lock().unwrap().recv() {
                            Ok(job) => job,
                            Err(_) => break,
                        };
                        job();
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self {
            sender: Some(sender),
            workers,
        }
    }

    /// Queue a job, or return false immediately when the queue is full
    /// (back-pressure: the caller drops the work).
    pub fn try_submit<F: FnOnce() + Send + 'static>(&self, job: F) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };
        match sender.try_send(Box::new(job)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel lets the workers drain and exit.
        self.sender.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::channel;
    use std::time::Duration;

    #[test]
    fn test_jobs_run_on_workers() {
        let pool = WorkerPool::new(2, 4);
        let counter = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = channel();
        for _ in 0..8 {
            loop {
                let counter = Arc::clone(&counter);
                let done = done_tx.clone();
                let accepted = pool.try_submit(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    done.send(()).unwrap();
                });
                if accepted {
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
        }
        for _ in 0..8 {
            done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_try_submit_fails_when_queue_full() {
        // One worker blocked on a gate, queue depth 1: the third job is shed.
        let pool = WorkerPool::new(1, 1);
        let (gate_tx, gate_rx) = channel::<()>();
        assert!(pool.try_submit(move || {
            gate_rx.recv().unwrap();
        }));
        // Give the worker time to pick up the blocking job.
        thread::sleep(Duration::from_millis(20));
        assert!(pool.try_submit(|| {}));
        assert!(!pool.try_submit(|| {}));
        gate_tx.send(()).unwrap();
    }
}
