//! Fixed worker pool backing the reactor's read/write dispatch.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::{io, thread};

use crossbeam_channel::{Receiver, Sender};
use tracing::{error, info, trace};

type Job = Box<dyn FnOnce() + Send>;

/// Named worker threads fed from an unbounded channel. A task counts as
/// in-flight from submission until it finishes, which drives the reactor's
/// adaptive poll timeout.
#[derive(Debug)]
pub(crate) struct WorkerPool {
    job_tx: Sender<Job>,
    in_flight: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub(crate) fn new(size: usize) -> io::Result<Self> {
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<Job>();
        let in_flight = Arc::new(AtomicUsize::new(0));
        for n in 0..size {
            let jobs = job_rx.clone();
            let counter = Arc::clone(&in_flight);
            thread::Builder::new()
                .name(format!("vortex-worker-{n}"))
                .spawn(move || worker_loop(&jobs, &counter))?;
        }
        info!(threads = size, "worker pool started");
        Ok(Self { job_tx, in_flight })
    }

    pub(crate) fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        if self.job_tx.send(Box::new(job)).is_err() {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            error!("worker pool is gone; dropping task");
        }
    }

    /// True while any task is queued or running.
    pub(crate) fn busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) > 0
    }
}

/// Panics are contained here so a misbehaving task never takes a worker
/// thread down with it.
fn worker_loop(jobs: &Receiver<Job>, in_flight: &AtomicUsize) {
    while let Ok(job) = jobs.recv() {
        let outcome = panic::catch_unwind(AssertUnwindSafe(job));
        in_flight.fetch_sub(1, Ordering::AcqRel);
        if let Err(panic) = outcome {
            let detail = panic
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("opaque panic payload");
            let current = thread::current();
            error!(thread = current.name().unwrap_or("vortex-worker"), detail, "task panicked");
        }
    }
    trace!("worker shutting down");
}
