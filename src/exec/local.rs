use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};

use super::{task, Backend, Finished, Job, Runtime};

/// Runs nodes on a fixed pool of worker threads on this machine.
///
/// Jobs are fed to the workers through a channel; results come back through another.
/// The pool size is the concurrency bound.
pub struct LocalBackend {
    workers: Vec<JoinHandle<()>>,
    jobs: Option<Sender<Job>>,
    results: Receiver<Finished>,
    capacity: usize,
    in_flight: usize,
}

impl LocalBackend {
    pub fn new(n_procs: usize, rt: Runtime) -> Result<Self> {
        let capacity = n_procs.max(1);
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (result_tx, result_rx) = mpsc::channel::<Finished>();

        let mut workers = Vec::with_capacity(capacity);
        for i in 0..capacity {
            let job_rx = Arc::clone(&job_rx);
            let result_tx = result_tx.clone();
            let rt = rt.clone();
            let handle = thread::Builder::new()
                .name(format!("worker-{i}"))
                .spawn(move || worker(job_rx, result_tx, rt))
                .context("spawning worker thread")?;
            workers.push(handle);
        }
        log::debug!("started local pool with {capacity} workers");

        Ok(Self {
            workers,
            jobs: Some(job_tx),
            results: result_rx,
            capacity,
            in_flight: 0,
        })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Return a finished job if one is available, without blocking.
    pub fn try_wait(&mut self) -> Result<Option<Finished>> {
        match self.results.try_recv() {
            Ok(finished) => {
                self.in_flight -= 1;
                Ok(Some(finished))
            }
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(anyhow!("all local workers have exited")),
        }
    }
}

impl Backend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn submit(&mut self, job: Job) -> Result<()> {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| anyhow!("local pool is shut down"))?;
        jobs.send(job)
            .map_err(|_| anyhow!("all local workers have exited"))?;
        self.in_flight += 1;
        Ok(())
    }

    fn wait(&mut self) -> Result<Finished> {
        if self.in_flight == 0 {
            return Err(anyhow!("waiting on local pool with no jobs in flight"));
        }
        let finished = self
            .results
            .recv()
            .map_err(|_| anyhow!("all local workers have exited"))?;
        self.in_flight -= 1;
        Ok(finished)
    }
}

impl Drop for LocalBackend {
    fn drop(&mut self) {
        // closing the channel lets idle workers exit:
        self.jobs.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!("local worker thread panicked");
            }
        }
    }
}

fn worker(jobs: Arc<Mutex<Receiver<Job>>>, results: Sender<Finished>, rt: Runtime) {
    loop {
        let job = match jobs.lock() {
            Ok(rx) => rx.recv(),
            Err(_) => break,
        };
        let Ok(job) = job else {
            break;
        };
        log::debug!("{} started on {:?}", job.node.name(), thread::current().name());
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| task::execute(&job, &rt)))
            .unwrap_or_else(|panic| Err(anyhow!(task::panic_message(panic))));
        if results.send(Finished { id: job.id, outcome }).is_err() {
            break;
        }
    }
}
