use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error, info};

use crate::error::WorkerError;
use crate::pipeline::{StageRunner, TaskOutcome};
use crate::stage::StageKind;

/// One processed delivery, as seen by the process that owns the pool.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskReport {
    pub worker_id: String,
    pub kind: StageKind,
    pub outcome: Result<TaskOutcome, String>,
}

/// Fixed set of threads that each poll the stage queues for `kinds`.
pub struct WorkerPool {
    report_receiver: Receiver<TaskReport>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn new(
        runner: Arc<StageRunner>,
        worker_count: usize,
        kinds: Vec<StageKind>,
        poll_interval: Duration,
    ) -> Result<Self, WorkerError> {
        let worker_count = worker_count.max(1);
        let (report_sender, report_receiver) = bounded::<TaskReport>(worker_count * 4);
        let shutdown = Arc::new(AtomicBool::new(false));
        let process = std::process::id();

        let mut workers = Vec::with_capacity(worker_count);
        for n in 0..worker_count {
            let worker_id = format!("worker-{}-{}", process, n);
            let runner = Arc::clone(&runner);
            let report_tx = report_sender.clone();
            let shutdown_flag = Arc::clone(&shutdown);
            let kinds = kinds.clone();

            let handle = thread::Builder::new()
                .name(worker_id.clone())
                .spawn(move || {
                    run_worker(worker_id, runner, kinds, report_tx, shutdown_flag, poll_interval)
                })
                .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;
            workers.push(handle);
        }

        info!("Started {} workers for {:?}", worker_count, kinds);

        Ok(Self {
            report_receiver,
            workers,
            shutdown,
        })
    }

    pub fn try_recv_report(&self) -> Option<TaskReport> {
        self.report_receiver.try_recv().ok()
    }

    pub fn recv_report_timeout(&self, timeout: Duration) -> Option<TaskReport> {
        self.report_receiver.recv_timeout(timeout).ok()
    }

    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Joins every worker. Call `shutdown` first.
    pub fn wait(self) {
        // Workers may be blocked sending a report.
        drop(self.report_receiver);

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
    worker_id: String,
    runner: Arc<StageRunner>,
    kinds: Vec<StageKind>,
    report_sender: Sender<TaskReport>,
    shutdown: Arc<AtomicBool>,
    poll_interval: Duration,
) {
    debug!("Worker {} started", worker_id);

    'outer: loop {
        if shutdown.load(Ordering::Relaxed) {
            debug!("Worker {} received shutdown signal", worker_id);
            break;
        }

        let mut idle = true;
        for &kind in &kinds {
            let outcome = match runner.poll(kind, &worker_id) {
                Ok(None) => continue,
                Ok(Some(outcome)) => Ok(outcome),
                Err(e) => {
                    error!("Worker {} failed to process {} task: {}", worker_id, kind, e);
                    Err(e.to_string())
                }
            };
            idle = false;

            let report = TaskReport {
                worker_id: worker_id.clone(),
                kind,
                outcome,
            };
            if report_sender.send(report).is_err() {
                debug!("Worker {} report channel closed", worker_id);
                break 'outer;
            }
        }

        if idle {
            thread::sleep(poll_interval);
        }
    }

    debug!("Worker {} stopped", worker_id);
}
