use crate::PipelineError;
use crossbeam_channel::unbounded;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

/// Where one work item sits within its phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskContext {
    pub worker: usize,
    /// 1-based order in which items were started.
    pub position: usize,
    pub total: usize,
}

impl TaskContext {
    pub fn percent_started(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        (self.position as f64 / self.total as f64) * 100.0
    }
}

/// Fixed number of worker threads that drain one phase at a time.
///
/// `run_phase` only returns after every worker has stopped, which is the
/// barrier between phases. Items are taken from a shared queue in no
/// particular order. The first failing item stops all workers from taking
/// new work and its error is returned.
#[derive(Clone, Copy, Debug)]
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Result<Self, PipelineError> {
        if workers == 0 {
            return Err(PipelineError::Config("worker count must be at least 1".to_string()));
        }
        Ok(Self { workers })
    }

    pub fn size(&self) -> usize {
        self.workers
    }

    pub fn run_phase<T, R, F>(&self, phase: &str, items: Vec<T>, task: F) -> Result<Vec<R>, PipelineError>
    where
        T: Send,
        R: Send,
        F: Fn(TaskContext, T) -> Result<R, PipelineError> + Sync,
    {
        let total = items.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        let (sender, receiver) = unbounded();
        for item in items {
            sender
                .send(item)
                .map_err(|_| PipelineError::Worker(format!("{} queue closed early", phase)))?;
        }
        // workers stop once the queue is drained
        drop(sender);

        let started = AtomicUsize::new(0);
        let abort = AtomicBool::new(false);
        let spawned = self.workers.min(total);

        thread::scope(|scope| {
            let handles: Vec<_> = (0..spawned)
                .map(|worker| {
                    let receiver = receiver.clone();
                    let task = &task;
                    let started = &started;
                    let abort = &abort;
                    scope.spawn(move || -> Result<Vec<R>, PipelineError> {
                        tracing::debug!(phase, worker, "starting worker");
                        let mut done = Vec::new();
                        while let Ok(item) = receiver.recv() {
                            if abort.load(Ordering::SeqCst) {
                                break;
                            }
                            let context = TaskContext {
                                worker,
                                position: started.fetch_add(1, Ordering::SeqCst) + 1,
                                total,
                            };
                            match task(context, item) {
                                Ok(result) => done.push(result),
                                Err(e) => {
                                    abort.store(true, Ordering::SeqCst);
                                    tracing::error!(phase, worker, error = %e, "worker failed");
                                    return Err(e);
                                }
                            }
                        }
                        tracing::debug!(phase, worker, "stopping worker");
                        Ok(done)
                    })
                })
                .collect();

            let mut results = Vec::with_capacity(total);
            let mut failure = None;
            for handle in handles {
                match handle.join() {
                    Ok(Ok(done)) => results.extend(done),
                    Ok(Err(e)) => {
                        failure.get_or_insert(e);
                    }
                    Err(panic) => {
                        abort.store(true, Ordering::SeqCst);
                        failure.get_or_insert(PipelineError::Worker(format!(
                            "{} worker panicked: {}",
                            phase,
                            panic_message(panic.as_ref())
                        )));
                    }
                }
            }

            match failure {
                Some(e) => Err(e),
                None => Ok(results),
            }
        })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
