pub mod local;
pub mod process;

use crate::{
    environment::Environment,
    task::{Outcome, Task},
};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::{
    io,
    path::PathBuf,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{error, info, instrument};

/// identifier of a submitted unit, unique within one scheduling call
pub type JobId = u64;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to build worker thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(io::Error),
    #[error("The launcher command is empty")]
    EmptyLauncher,
    #[error("Failed to launch worker on {host}: {source}")]
    Launch { host: String, source: io::Error },
    #[error("Worker on {host} exited before it was ready ({status})")]
    Exited { host: String, status: String },
    #[error("Worker on {host} was not ready after {timeout:?}")]
    NotReady { host: String, timeout: Duration },
    #[error("Handshake with worker on {host} failed: {reason}")]
    Handshake { host: String, reason: String },
    #[error("Worker {slot} on {host} was lost: {reason}")]
    WorkerLost {
        host: String,
        slot: usize,
        reason: String,
    },
    #[error("Unit was abandoned by the pool before it completed")]
    Abandoned,
    #[error("No live workers are left in the pool")]
    NoLiveWorkers,
    #[error("The pool was shut down")]
    Closed,
}

/// a finished unit as delivered back to the submitting scheduler
#[derive(Debug)]
pub struct Completion<O> {
    pub id: JobId,
    pub result: Result<Outcome<O>, ExecutorError>,
}

/// Single-use handle through which a worker reports a unit back
///
/// A reply dropped without being sent reports `ExecutorError::Abandoned`, so a
/// unit lost inside the pool can never leave its scheduler waiting.
#[derive(Debug)]
pub struct Reply<O> {
    id: JobId,
    sender: Option<Sender<Completion<O>>>,
}

impl<O> Reply<O> {
    pub fn new(id: JobId, sender: Sender<Completion<O>>) -> Self {
        Self {
            id,
            sender: Some(sender),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn send(mut self, result: Result<Outcome<O>, ExecutorError>) {
        if let Some(sender) = self.sender.take() {
            // the scheduler may be gone already, nobody is left to tell
            let _ = sender.send(Completion {
                id: self.id,
                result,
            });
        }
    }
}

impl<O> Drop for Reply<O> {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Completion {
                id: self.id,
                result: Err(ExecutorError::Abandoned),
            });
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolSizing {
    /// worker processes (or local worker threads) per node
    pub tasks_per_node: usize,
    /// cores available on each node, split evenly over its workers
    pub cpu_per_node: usize,
}

impl PoolSizing {
    pub fn threads_per_worker(&self) -> usize {
        self.cpu_per_node
            .div_ceil(self.tasks_per_node.max(1))
            .max(1)
    }
}

#[derive(Clone, Debug)]
pub struct LaunchConfig {
    /// command prefix used to reach a node, `{host}` is substituted, otherwise
    /// the host is appended
    pub launcher: Vec<String>,
    pub worker_exec: PathBuf,
    pub ready_timeout: Duration,
    pub shutdown_grace: Duration,
}

/// How the workers of a local pool are kept apart
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// threads of the coordinator, units must not bring the process down
    Threads,
    /// `streamd worker` processes spawned without a launcher
    #[default]
    Processes,
}

/// Resolved description of a pool, an empty node list means a local pool
#[derive(Clone, Debug)]
pub struct PoolPlan {
    pub sizing: PoolSizing,
    pub nodes: Vec<String>,
    /// only read for local pools, remote workers are always processes
    pub isolation: Isolation,
    pub launch: LaunchConfig,
}

#[derive(Debug)]
pub enum Executors {
    Threads(local::LocalExecutor),
    Processes(process::ProcessExecutor),
}

impl Executors {
    /// start all workers of `plan` and hand `env` to each of them
    /// returns only once every worker is ready to accept units
    #[instrument(skip_all, level = "info", fields(nodes = plan.nodes.len()))]
    pub fn load(plan: &PoolPlan, env: Environment) -> Result<Self, ExecutorError> {
        let executor = if plan.nodes.is_empty() && plan.isolation == Isolation::Threads {
            Self::Threads(local::LocalExecutor::load(
                plan.sizing,
                env,
                plan.launch.shutdown_grace,
            )?)
        } else {
            Self::Processes(process::ProcessExecutor::load(plan, env)?)
        };

        info!(
            workers = executor.workers(),
            threads_per_worker = plan.sizing.threads_per_worker(),
            "Worker pool is ready"
        );

        Ok(executor)
    }

    /// number of workers currently able to take units
    pub fn workers(&self) -> usize {
        match self {
            Self::Threads(executor) => executor.workers(),
            Self::Processes(executor) => executor.workers(),
        }
    }

    /// hand a unit to the pool, the result arrives through `reply`
    pub fn submit<T: Task>(
        &self,
        task: &Arc<T>,
        arg: T::Arg,
        reply: Reply<T::Output>,
    ) -> Result<(), ExecutorError> {
        match self {
            Self::Threads(executor) => executor.submit(task, arg, reply),
            Self::Processes(executor) => executor.submit(task, arg, reply),
        }
    }

    /// stop all workers, units still queued or running are forgotten
    /// calling this more than once is fine
    pub fn shutdown(&mut self) {
        match self {
            Self::Threads(executor) => executor.shutdown(),
            Self::Processes(executor) => executor.shutdown(),
        }
    }
}

/// join `handle` if it finishes before `deadline`, otherwise give it back
fn join_until(handle: JoinHandle<()>, deadline: Instant) -> Option<JoinHandle<()>> {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return Some(handle);
        }

        thread::sleep(Duration::from_millis(10));
    }

    let name = handle.thread().name().map(str::to_owned);
    if handle.join().is_err() {
        error!(thread = ?name, "Worker thread panicked");
    }

    None
}

#[cfg(test)]
mod executors_test;
