//! Worker Pool
//!
//! Runs processes on a fixed set of threads. Jobs go in through an mpsc
//! channel shared by all workers; results come back on a second channel.

use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};

use super::engine::Engine;
use crate::error::EngineError;
use crate::workflow::process::{ProcessId, ProcessStatus};
use crate::workflow::state::Fields;

/// Work item for a pool thread.
#[derive(Debug, Clone, PartialEq)]
pub enum Job {
    /// Continue a created or running process
    Run(ProcessId),
    /// Resume a waiting process with input
    Resume(ProcessId, Fields),
}

impl Job {
    pub fn process_id(&self) -> ProcessId {
        match self {
            Job::Run(id) | Job::Resume(id, _) => *id,
        }
    }
}

/// Outcome of one job.
#[derive(Debug)]
pub struct JobResult {
    pub process_id: ProcessId,
    pub outcome: Result<ProcessStatus, EngineError>,
}

/// Fixed-size pool of threads driving processes on one engine.
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    results: Receiver<JobResult>,
    handles: Vec<JoinHandle<()>>,
    engine: Arc<Engine>,
}

impl WorkerPool {
    /// Starts `size` worker threads (at least one).
    pub fn new(engine: Arc<Engine>, size: usize) -> Self {
        let size = size.max(1);
        let (job_tx, job_rx) = channel::<Job>();
        let (result_tx, result_rx) = channel::<JobResult>();
        let jobs = Arc::new(Mutex::new(job_rx));

        let handles = (0..size)
            .map(|n| {
                let jobs = Arc::clone(&jobs);
                let results = result_tx.clone();
                let engine = Arc::clone(&engine);
                thread::spawn(move || worker_loop(n, &engine, &jobs, &results))
            })
            .collect();

        info!("Started {} workers", size);
        Self {
            sender: Some(job_tx),
            results: result_rx,
            handles,
            engine,
        }
    }

    /// Starts one worker per CPU core.
    pub fn with_default_size(engine: Arc<Engine>) -> Self {
        Self::new(engine, num_cpus::get())
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Queues a job. Returns false once the pool is shut down.
    pub fn submit(&self, job: Job) -> bool {
        match &self.sender {
            Some(sender) => sender.send(job).is_ok(),
            None => false,
        }
    }

    pub fn submit_resume(&self, id: ProcessId, input: Fields) -> bool {
        self.submit(Job::Resume(id, input))
    }

    /// Queues every created or running process that nobody holds a lock
    /// for. Returns the number of jobs queued.
    pub fn enqueue_runnable(&self) -> Result<usize, EngineError> {
        let mut queued = 0;
        for process in self.engine.list(None)? {
            if !matches!(process.status, ProcessStatus::Created | ProcessStatus::Running) {
                continue;
            }
            if self.engine.lock_manager().holder(&process.lock_key())?.is_some() {
                continue;
            }
            if self.submit(Job::Run(process.id)) {
                queued += 1;
            }
        }
        debug!("Queued {} runnable processes", queued);
        Ok(queued)
    }

    /// Waits up to `timeout` for the next finished job.
    pub fn recv_result(&self, timeout: Duration) -> Option<JobResult> {
        match self.results.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Stops accepting jobs, lets the queue drain and joins the workers.
    pub fn shutdown(&mut self) {
        if self.sender.take().is_none() {
            return;
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }
        info!("Workers stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    n: usize,
    engine: &Engine,
    jobs: &Mutex<Receiver<Job>>,
    results: &Sender<JobResult>,
) {
    loop {
        let job = match jobs.lock() {
            Ok(receiver) => receiver.recv(),
            Err(_) => {
                error!("Worker {}: job queue poisoned", n);
                return;
            }
        };
        let Ok(job) = job else {
            debug!("Worker {} exiting", n);
            return;
        };

        let process_id = job.process_id();
        debug!("Worker {} picked up process {}", n, process_id);
        let outcome = match job {
            Job::Run(id) => engine.run_process(id),
            Job::Resume(id, input) => engine.resume(id, input),
        };
        if let Err(e) = &outcome {
            warn!("Worker {}: process {}: {}", n, process_id, e);
        }

        if results.send(JobResult { process_id, outcome }).is_err() {
            debug!("Worker {}: result receiver gone", n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::state::fields;
    use crate::workflow::{FieldKind, InputSchema, Registry, Step, Target, WorkflowDefinition};

    fn engine() -> Arc<Engine> {
        let mut registry = Registry::new();
        registry
            .register_step(Step::action("Count", |_, s| {
                let n = s.get_int("n").unwrap_or(0);
                Ok(s.clone().with("n", n + 1))
            }))
            .unwrap();
        registry
            .register_step(Step::input(
                "Confirm",
                InputSchema::new().required("ok", FieldKind::Bool),
            ))
            .unwrap();
        registry
            .register_workflow(
                WorkflowDefinition::new("count", Target::System).steps(["Count", "Count"]),
            )
            .unwrap();
        registry
            .register_workflow(
                WorkflowDefinition::new("confirm", Target::System).steps(["Confirm", "Count"]),
            )
            .unwrap();
        Arc::new(Engine::in_memory(Arc::new(registry)))
    }

    #[test]
    fn test_pool_runs_created_processes() {
        let engine = engine();
        let ids: Vec<_> = (0..4)
            .map(|_| engine.create("count", Fields::new()).unwrap())
            .collect();

        let mut pool = WorkerPool::new(Arc::clone(&engine), 2);
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.enqueue_runnable().unwrap(), 4);

        for _ in 0..4 {
            let result = pool.recv_result(Duration::from_secs(5)).unwrap();
            assert!(ids.contains(&result.process_id));
            assert_eq!(result.outcome.unwrap(), ProcessStatus::Completed);
        }
        pool.shutdown();

        for id in ids {
            assert_eq!(engine.state(id).unwrap().get_int("n"), Some(2));
        }
    }

    #[test]
    fn test_pool_resumes() {
        let engine = engine();
        let id = engine.start("confirm", Fields::new()).unwrap();
        assert_eq!(engine.process(id).unwrap().status, ProcessStatus::Waiting);

        let pool = WorkerPool::new(Arc::clone(&engine), 1);
        assert!(pool.submit_resume(id, fields([("ok", true.into())])));

        let result = pool.recv_result(Duration::from_secs(5)).unwrap();
        assert_eq!(result.outcome.unwrap(), ProcessStatus::Completed);
    }

    #[test]
    fn test_submit_after_shutdown() {
        let mut pool = WorkerPool::new(engine(), 1);
        pool.shutdown();
        assert!(!pool.submit(Job::Run(ProcessId::new())));
        assert!(pool.recv_result(Duration::from_millis(10)).is_none());
    }
}
