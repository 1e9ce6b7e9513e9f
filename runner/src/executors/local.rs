use super::{join_until, ExecutorError, PoolSizing, Reply};
use crate::{
    distributed::util::HOSTNAME,
    environment::Environment,
    task::{run_guarded, Task, WorkerContext},
};
use crossbeam_channel::{unbounded, Sender};
use rayon::ThreadPoolBuilder;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, warn};

type LocalJob = Box<dyn FnOnce(&WorkerContext) + Send>;

/// Executor that works on local worker threads
///
/// Every worker owns its own rayon pool sized to `threads_per_worker`, units
/// run inside it so nested parallelism stays within the worker's budget.
#[derive(Debug)]
pub struct LocalExecutor {
    queue: Option<Sender<LocalJob>>,
    workers: Vec<JoinHandle<()>>,
    size: usize,
    cancelled: Arc<AtomicBool>,
    grace: Duration,
}

impl LocalExecutor {
    pub fn load(
        sizing: PoolSizing,
        env: Environment,
        grace: Duration,
    ) -> Result<Self, ExecutorError> {
        let threads = sizing.threads_per_worker();
        let (queue, jobs) = unbounded::<LocalJob>();
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(sizing.tasks_per_node);

        debug!(
            "Starting {} local workers with {threads} threads each",
            sizing.tasks_per_node
        );

        for slot in 0..sizing.tasks_per_node {
            let pool = ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(move |index| format!("streamd-{slot}-{index}"))
                .build()?;
            let context = WorkerContext {
                slot,
                hostname: HOSTNAME.clone(),
                threads,
                env: env.clone(),
            };
            let jobs = jobs.clone();
            let cancelled = Arc::clone(&cancelled);

            let handle = thread::Builder::new()
                .name(format!("streamd-worker-{slot}"))
                .spawn(move || {
                    for job in jobs.iter() {
                        // dropping the job abandons its reply
                        if cancelled.load(Ordering::Acquire) {
                            continue;
                        }

                        pool.install(|| job(&context));
                    }

                    debug!(slot = slot, "Local worker stopped");
                })
                .map_err(ExecutorError::Spawn)?;

            workers.push(handle);
        }

        Ok(Self {
            queue: Some(queue),
            size: workers.len(),
            workers,
            cancelled,
            grace,
        })
    }

    pub fn workers(&self) -> usize {
        if self.queue.is_some() {
            self.size
        } else {
            0
        }
    }

    pub fn submit<T: Task>(
        &self,
        task: &Arc<T>,
        arg: T::Arg,
        reply: Reply<T::Output>,
    ) -> Result<(), ExecutorError> {
        let queue = self.queue.as_ref().ok_or(ExecutorError::Closed)?;
        let task = Arc::clone(task);

        queue
            .send(Box::new(move |context: &WorkerContext| {
                reply.send(Ok(run_guarded(task.as_ref(), arg, context)));
            }))
            .map_err(|_| ExecutorError::NoLiveWorkers)
    }

    pub fn shutdown(&mut self) {
        let Some(queue) = self.queue.take() else {
            return;
        };

        self.cancelled.store(true, Ordering::Release);
        drop(queue);

        let deadline = Instant::now() + self.grace;
        for handle in self.workers.drain(..) {
            if let Some(handle) = join_until(handle, deadline) {
                warn!(
                    thread = ?handle.thread().name(),
                    "Local worker is still running a unit, detaching it"
                );
            }
        }
    }
}

impl Drop for LocalExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
