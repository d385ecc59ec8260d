use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error, info, warn};

use crate::db::Database;
use crate::error::WorkerError;
use crate::pipeline::{ArchiveProcessor, Persister};
use crate::storage::ObjectStore;
use crate::worker::task::{ArchiveTask, PersistTask, Task, TaskResult};

/// What every worker needs to run a task.
#[derive(Clone)]
pub struct WorkerContext {
    pub db: Database,
    pub store: Option<Arc<dyn ObjectStore>>,
}

struct Envelope {
    task: Task,
    reply: Option<Sender<TaskResult>>,
}

pub struct WorkerPool {
    task_sender: Sender<Envelope>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Starts `worker_count` worker threads.
    ///
    /// # Panics
    /// Panics if `worker_count` is 0.
    pub fn new(context: WorkerContext, worker_count: usize) -> Self {
        assert!(worker_count > 0, "worker_count must be > 0");
        let (task_sender, task_receiver) = bounded::<Envelope>(worker_count * 2);
        let shutdown = Arc::new(AtomicBool::new(false));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let task_rx = task_receiver.clone();
            let shutdown_flag = Arc::clone(&shutdown);
            let in_flight = Arc::clone(&in_flight);
            let worker_context = context.clone();

            let handle = thread::spawn(move || {
                run_worker(worker_id, task_rx, shutdown_flag, in_flight, worker_context);
            });

            workers.push(handle);
        }

        info!("Started {} workers", worker_count);

        Self {
            task_sender,
            workers,
            shutdown,
            in_flight,
        }
    }

    /// Queues a task without waiting for its result.
    pub fn submit(&self, task: Task) -> Result<(), WorkerError> {
        self.send(Envelope { task, reply: None })
    }

    /// Queues a task; its result arrives on the returned receiver.
    pub fn submit_with_reply(&self, task: Task) -> Result<Receiver<TaskResult>, WorkerError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.send(Envelope {
            task,
            reply: Some(reply_tx),
        })?;
        Ok(reply_rx)
    }

    fn send(&self, envelope: Envelope) -> Result<(), WorkerError> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(WorkerError::ChannelClosed);
        }

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.task_sender.send(envelope).map_err(|_| {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            WorkerError::ChannelClosed
        })
    }

    /// Tasks queued or running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Blocks until no task is queued or running. Returns `false` on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.in_flight() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        true
    }

    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Lets the workers drain the queue, then joins them.
    pub fn wait(self) {
        drop(self.task_sender);

        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }

        info!("All workers have stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

fn run_worker(
    worker_id: usize,
    task_receiver: Receiver<Envelope>,
    shutdown: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
    context: WorkerContext,
) {
    debug!("Worker {} started", worker_id);

    let persister = Persister::new(context.db.clone());

    loop {
        if shutdown.load(Ordering::Relaxed) {
            debug!("Worker {} received shutdown signal", worker_id);
            break;
        }

        match task_receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(Envelope { task, reply }) => {
                debug!(
                    "Worker {} running {} task for batch {}",
                    worker_id,
                    task.kind(),
                    task.batch_id()
                );

                let result = match task {
                    Task::Persist(task) => run_persist(&persister, task),
                    Task::Archive(task) => run_archive(&context, task),
                };

                if let Some(reply) = reply {
                    if reply.send(result).is_err() {
                        debug!("Worker {}: result receiver dropped", worker_id);
                    }
                }
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                continue;
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                debug!("Worker {} task channel disconnected", worker_id);
                break;
            }
        }
    }

    debug!("Worker {} stopped", worker_id);
}

fn run_persist(persister: &Persister, task: PersistTask) -> TaskResult {
    let mut attempt = 0;
    let result = loop {
        attempt += 1;
        match persister.persist(&task.run_id, &task.job, &task.outcome) {
            Ok(outcome) => break Ok(outcome),
            Err(e) if e.is_retryable() && attempt < task.retry.attempts => {
                warn!(
                    "Persisting run {} failed (attempt {}/{}): {}",
                    task.run_id, attempt, task.retry.attempts, e
                );
                thread::sleep(task.retry.delay);
            }
            Err(e) => {
                error!("Persisting run {} failed: {}", task.run_id, e);
                persister.mark_failed(&task.run_id, &e);
                break Err(e.to_string());
            }
        }
    };

    TaskResult::Persisted {
        batch_id: task.batch_id,
        run_id: task.run_id,
        job_id: task.outcome.job_id,
        attempts: attempt,
        result,
    }
}

fn run_archive(context: &WorkerContext, task: ArchiveTask) -> TaskResult {
    let processor = ArchiveProcessor::new(context.db.clone(), context.store.clone(), task.settings);
    let outcome = processor.archive_and_upload(&task.request);
    if let Some(error) = &outcome.error {
        error!("Archive {} failed: {}", outcome.archive_name, error);
    }
    TaskResult::Archived {
        batch_id: task.batch_id,
        outcome,
    }
}
