//! bounded set of worker coroutines
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use may::sync::{mpsc, Mutex};
use may::{coroutine, go};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed number of named worker coroutines pulling jobs from one queue.
///
/// A job holds its worker until it returns, so a long stream or a parked call takes one worker
/// out of the pool for its whole duration.
pub(crate) struct WorkerPool {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    in_flight: Arc<AtomicUsize>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let size = size.max(1);
        for i in 0..size {
            let rx = rx.clone();
            let in_flight = in_flight.clone();
            go!(
                coroutine::Builder::new().name(format!("RpcWorker-{i}")),
                move || loop {
                    let job = match rx.lock().unwrap().recv() {
                        Ok(job) => job,
                        Err(_) => break,
                    };
                    job();
                    in_flight.fetch_sub(1, Ordering::AcqRel);
                }
            )?;
        }
        info!("worker pool started, size={size}");

        Ok(WorkerPool {
            tx: Mutex::new(Some(tx)),
            in_flight,
            size,
        })
    }

    /// queue a job, returns false once the pool is closed
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> bool {
        let tx = self.tx.lock().unwrap();
        let Some(tx) = tx.as_ref() else {
            return false;
        };
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        if tx.send(Box::new(job)).is_err() {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// jobs queued or running
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// poll until every job finished, `None` waits forever
    pub fn wait_idle(&self, timeout: Option<Duration>, poll: Duration) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.in_flight() == 0 {
                return true;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return false;
            }
            coroutine::sleep(poll);
        }
    }

    /// Stop taking jobs.
    ///
    /// Idle workers exit; a worker busy with a job exits once the job returns.
    pub fn close(&self) {
        if self.tx.lock().unwrap().take().is_some() {
            info!("worker pool closed, in_flight={}", self.in_flight());
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_jobs_and_drains() {
        let pool = WorkerPool::new(3).unwrap();
        assert_eq!(pool.size(), 3);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let done = done.clone();
            assert!(pool.submit(move || {
                coroutine::sleep(Duration::from_millis(1));
                done.fetch_add(1, Ordering::AcqRel);
            }));
        }
        assert!(pool.wait_idle(Some(Duration::from_secs(5)), Duration::from_millis(1)));
        assert_eq!(done.load(Ordering::Acquire), 20);
    }

    #[test]
    fn drain_times_out_on_a_stuck_job() {
        let pool = WorkerPool::new(1).unwrap();
        let (tx, rx) = mpsc::channel::<()>();
        pool.submit(move || {
            rx.recv().ok();
        });
        assert!(!pool.wait_idle(Some(Duration::from_millis(20)), Duration::from_millis(1)));
        tx.send(()).unwrap();
        assert!(pool.wait_idle(Some(Duration::from_secs(5)), Duration::from_millis(1)));
    }

    #[test]
    fn closed_pool_rejects_jobs() {
        let pool = WorkerPool::new(1).unwrap();
        pool.close();
        assert!(!pool.submit(|| {}));
        assert_eq!(pool.in_flight(), 0);
    }
}
