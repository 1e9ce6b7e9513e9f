use super::{join_until, ExecutorError, JobId, PoolPlan, Reply};
use crate::{
    distributed::{
        protocol::{write_message, Request, Response},
        util::{launch_command, worker_command, HOSTNAME},
    },
    environment::Environment,
    task::{Outcome, Task},
};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde_json::Value;
use std::{
    io::{self, BufRead, BufReader},
    iter,
    process::{Child, ChildStdin, Command, Stdio},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

type ProcessReply = Box<dyn FnOnce(Result<Outcome<Value>, ExecutorError>) + Send>;

struct ProcessJob {
    id: JobId,
    task: &'static str,
    kwargs: Value,
    arg: Value,
    reply: ProcessReply,
}

/// a worker process that was started but not yet handed to a driver
struct Launched {
    slot: usize,
    host: String,
    child: Child,
    stdin: ChildStdin,
    lines: Receiver<io::Result<String>>,
}

impl Launched {
    fn spawn(mut command: Command, host: &str, slot: usize) -> Result<Self, ExecutorError> {
        debug!(host = host, slot = slot, command = ?command, "Launching worker");

        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ExecutorError::Launch {
                host: host.to_owned(),
                source,
            })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill();

            return Err(ExecutorError::Handshake {
                host: host.to_owned(),
                reason: String::from("worker pipes are missing"),
            });
        };

        let (sender, lines) = unbounded();
        let forwarded_host = host.to_owned();

        let readers = thread::Builder::new()
            .name(format!("streamd-read-{slot}"))
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    let failed = line.is_err();

                    if sender.send(line).is_err() || failed {
                        break;
                    }
                }
            })
            .and_then(|_| {
                thread::Builder::new()
                    .name(format!("streamd-log-{slot}"))
                    .spawn(move || {
                        for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                            info!(target: "streamd::worker", host = %forwarded_host, slot = slot, "{line}");
                        }
                    })
            });

        if let Err(error) = readers {
            let _ = child.kill();
            let _ = child.wait();

            return Err(ExecutorError::Spawn(error));
        }

        Ok(Self {
            slot,
            host: host.to_owned(),
            child,
            stdin,
            lines,
        })
    }

    /// send the environment and wait for the worker to report ready
    fn handshake(
        &mut self,
        env: &Environment,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<(), ExecutorError> {
        if let Err(error) = write_message(&mut self.stdin, &Request::Setup { env: env.clone() }) {
            // the worker most likely died already, reading tells us how
            debug!(host = %self.host, slot = self.slot, "Failed to send setup: {error}");
        }

        loop {
            match self.lines.recv_deadline(deadline) {
                Ok(Ok(line)) => match serde_json::from_str::<Response>(&line) {
                    Ok(Response::Ready {
                        hostname,
                        pid,
                        threads,
                    }) => {
                        info!(
                            host = %self.host,
                            slot = self.slot,
                            hostname = %hostname,
                            pid = pid,
                            threads = threads,
                            "Worker ready"
                        );

                        return Ok(());
                    }
                    Ok(other) => {
                        return Err(ExecutorError::Handshake {
                            host: self.host.clone(),
                            reason: format!("expected ready, got {other:?}"),
                        })
                    }
                    Err(_) => debug!(host = %self.host, line = %line, "Skipping non-protocol output"),
                },
                Ok(Err(error)) => {
                    return Err(ExecutorError::Handshake {
                        host: self.host.clone(),
                        reason: error.to_string(),
                    })
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(ExecutorError::NotReady {
                        host: self.host.clone(),
                        timeout,
                    })
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ExecutorError::Exited {
                        host: self.host.clone(),
                        status: self.exit_status(),
                    })
                }
            }
        }
    }

    fn exit_status(&mut self) -> String {
        match self.child.wait_timeout(Duration::from_secs(1)) {
            Ok(Some(status)) => status.to_string(),
            Ok(None) => String::from("output closed, process still running"),
            Err(error) => error.to_string(),
        }
    }

    fn kill(mut self) {
        if let Err(error) = self.child.kill() {
            debug!(host = %self.host, slot = self.slot, "Failed to kill worker: {error}");
        }
        let _ = self.child.wait();
    }
}

fn abort(launched: Vec<Launched>) {
    for worker in launched {
        worker.kill();
    }
}

/// wait for the `done` message of unit `id`
fn wait_for(lines: &Receiver<io::Result<String>>, id: JobId) -> Result<Outcome<Value>, String> {
    loop {
        match lines.recv() {
            Ok(Ok(line)) => match serde_json::from_str::<Response>(&line) {
                Ok(Response::Done { id: done, outcome }) if done == id => return Ok(outcome),
                Ok(other) => warn!(job = id, "Ignoring unexpected message {other:?}"),
                Err(_) => debug!(line = %line, "Skipping non-protocol output"),
            },
            Ok(Err(error)) => return Err(error.to_string()),
            Err(_) => return Err(String::from("worker closed its output")),
        }
    }
}

fn reap(child: &Mutex<Child>, host: &str, slot: usize, grace: Duration) {
    let mut child = child.lock();

    match child.wait_timeout(grace) {
        Ok(Some(status)) => debug!(host = host, slot = slot, "Worker exited with {status}"),
        Ok(None) => {
            warn!(host = host, slot = slot, "Worker did not exit within {grace:?}, killing it");

            if let Err(error) = child.kill() {
                error!(host = host, slot = slot, "Failed to kill worker: {error}");
            }
            let _ = child.wait();
        }
        Err(error) => error!(host = host, slot = slot, "Failed to wait for worker: {error}"),
    }
}

/// owns the coordinator side of one worker process
struct Driver {
    slot: usize,
    host: String,
    stdin: ChildStdin,
    lines: Receiver<io::Result<String>>,
    jobs: Receiver<ProcessJob>,
    child: Arc<Mutex<Child>>,
    live: Arc<AtomicUsize>,
    cancelled: Arc<AtomicBool>,
    grace: Duration,
}

impl Driver {
    fn run(self) {
        let Self {
            slot,
            host,
            mut stdin,
            lines,
            jobs,
            child,
            live,
            cancelled,
            grace,
        } = self;
        let mut lost = None;

        for ProcessJob {
            id,
            task,
            kwargs,
            arg,
            reply,
        } in jobs.iter()
        {
            // dropping the reply abandons the unit
            if cancelled.load(Ordering::Acquire) {
                continue;
            }

            let request = Request::Run {
                id,
                task: task.to_owned(),
                kwargs,
                arg,
            };

            let result = write_message(&mut stdin, &request)
                .map_err(|error| error.to_string())
                .and_then(|()| wait_for(&lines, id));

            match result {
                Ok(outcome) => reply(Ok(outcome)),
                Err(reason) => {
                    reply(Err(ExecutorError::WorkerLost {
                        host: host.clone(),
                        slot,
                        reason: reason.clone(),
                    }));
                    lost = Some(reason);

                    break;
                }
            }
        }

        let remaining = live.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);

        match lost {
            Some(reason) => {
                if cancelled.load(Ordering::Acquire) {
                    debug!(host = %host, slot = slot, "Worker stopped during shutdown: {reason}");
                } else {
                    error!(
                        host = %host,
                        slot = slot,
                        remaining = remaining,
                        "Worker left the pool: {reason}"
                    );
                }
            }
            None => {
                if let Err(error) = write_message(&mut stdin, &Request::Shutdown) {
                    debug!(host = %host, slot = slot, "Failed to send shutdown: {error}");
                }
            }
        }

        // the last driver to let go of the queue abandons whatever is left in it
        drop(jobs);
        drop(stdin);

        reap(&child, &host, slot, grace);
    }
}

#[derive(Debug)]
struct Slot {
    slot: usize,
    host: String,
    child: Arc<Mutex<Child>>,
    driver: Option<thread::JoinHandle<()>>,
}

/// Executor backed by `streamd worker` processes
///
/// Each slot is one worker process, reached through the launcher on remote
/// nodes or spawned directly for a local pool. A slot runs one unit at a time;
/// a slot whose process dies leaves the pool.
#[derive(Debug)]
pub struct ProcessExecutor {
    coordinator: String,
    queue: Option<Sender<ProcessJob>>,
    slots: Vec<Slot>,
    live: Arc<AtomicUsize>,
    cancelled: Arc<AtomicBool>,
    grace: Duration,
}

impl ProcessExecutor {
    #[instrument(skip_all, level = "debug")]
    pub fn load(plan: &PoolPlan, env: Environment) -> Result<Self, ExecutorError> {
        // without nodes the workers are started right here, without the launcher
        let remote = !plan.nodes.is_empty();
        let nodes = if remote {
            plan.nodes.clone()
        } else {
            vec![HOSTNAME.clone()]
        };
        let coordinator = nodes.first().cloned().unwrap_or_else(|| HOSTNAME.clone());

        if remote && coordinator != *HOSTNAME {
            warn!(
                coordinator = %coordinator,
                local = %*HOSTNAME,
                "First node is the coordinator, but this process runs on another host"
            );
        }

        let threads = plan.sizing.threads_per_worker();
        let mut launched = Vec::with_capacity(nodes.len() * plan.sizing.tasks_per_node);

        // launch everything first so the readiness waits overlap
        for (slot, host) in nodes
            .iter()
            .flat_map(|host| iter::repeat(host).take(plan.sizing.tasks_per_node))
            .enumerate()
        {
            let spawned = if remote {
                launch_command(&plan.launch, host, threads, slot)
            } else {
                Ok(worker_command(&plan.launch, threads, slot))
            }
            .and_then(|command| Launched::spawn(command, host, slot));

            match spawned {
                Ok(worker) => launched.push(worker),
                Err(error) => {
                    error!(host = %host, slot = slot, "Failed to launch worker: {error}");
                    abort(launched);

                    return Err(error);
                }
            }
        }

        let deadline = Instant::now() + plan.launch.ready_timeout;
        if let Some(error) = launched.iter_mut().find_map(|worker| {
            worker
                .handshake(&env, deadline, plan.launch.ready_timeout)
                .err()
        }) {
            error!("Worker pool failed to start: {error}");
            abort(launched);

            return Err(error);
        }

        let (queue, jobs) = unbounded::<ProcessJob>();
        let mut executor = Self {
            coordinator,
            queue: Some(queue),
            slots: Vec::with_capacity(launched.len()),
            live: Arc::new(AtomicUsize::new(0)),
            cancelled: Arc::new(AtomicBool::new(false)),
            grace: plan.launch.shutdown_grace,
        };

        let mut launched = launched.into_iter();
        while let Some(Launched {
            slot,
            host,
            child,
            stdin,
            lines,
        }) = launched.next()
        {
            let child = Arc::new(Mutex::new(child));
            let driver = Driver {
                slot,
                host: host.clone(),
                stdin,
                lines,
                jobs: jobs.clone(),
                child: Arc::clone(&child),
                live: Arc::clone(&executor.live),
                cancelled: Arc::clone(&executor.cancelled),
                grace: executor.grace,
            };

            executor.live.fetch_add(1, Ordering::AcqRel);

            match thread::Builder::new()
                .name(format!("streamd-driver-{slot}"))
                .spawn(move || driver.run())
            {
                Ok(handle) => executor.slots.push(Slot {
                    slot,
                    host,
                    child,
                    driver: Some(handle),
                }),
                Err(error) => {
                    // the driver never ran, so its process is still ours to stop
                    let _ = child.lock().kill();
                    abort(launched.collect());
                    executor.shutdown();

                    return Err(ExecutorError::Spawn(error));
                }
            }
        }

        Ok(executor)
    }

    pub fn workers(&self) -> usize {
        if self.queue.is_some() {
            self.live.load(Ordering::Acquire)
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

        if self.live.load(Ordering::Acquire) == 0 {
            return Err(ExecutorError::NoLiveWorkers);
        }

        let encoded = serde_json::to_value(task.as_ref())
            .and_then(|kwargs| Ok((kwargs, serde_json::to_value(&arg)?)));
        let (kwargs, arg) = match encoded {
            Ok(encoded) => encoded,
            Err(error) => {
                reply.send(Ok(Outcome::Failed(format!("unencodable unit: {error}"))));

                return Ok(());
            }
        };

        queue
            .send(ProcessJob {
                id: reply.id(),
                task: T::NAME,
                kwargs,
                arg,
                reply: Box::new(move |result| {
                    reply.send(result.map(|outcome| outcome.decode::<T::Output>()))
                }),
            })
            .map_err(|_| ExecutorError::NoLiveWorkers)
    }

    pub fn shutdown(&mut self) {
        let Some(queue) = self.queue.take() else {
            return;
        };

        self.cancelled.store(true, Ordering::Release);
        drop(queue);

        let deadline = Instant::now() + self.grace;
        let mut stuck = Vec::new();

        for slot in self.slots.iter_mut() {
            if let Some(driver) = slot.driver.take() {
                if let Some(driver) = join_until(driver, deadline) {
                    warn!(host = %slot.host, slot = slot.slot, "Worker is still busy, killing it");

                    if let Err(error) = slot.child.lock().kill() {
                        debug!(host = %slot.host, slot = slot.slot, "Failed to kill worker: {error}");
                    }
                    stuck.push(driver);
                }
            }
        }

        // killed workers close their output, which releases their drivers
        let deadline = Instant::now() + self.grace;
        for driver in stuck {
            if let Some(driver) = join_until(driver, deadline) {
                error!(thread = ?driver.thread().name(), "Detaching driver of a killed worker");
            }
        }

        info!(coordinator = %self.coordinator, "Worker processes shut down");
    }
}

impl Drop for ProcessExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
