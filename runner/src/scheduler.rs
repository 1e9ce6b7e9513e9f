use crate::{
    executors::{Completion, ExecutorError, Executors, JobId, Reply},
    report::Recorder,
    task::{Outcome, Task},
};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("The pool has no workers to schedule on")]
    NoWorkers,
    #[error("Unit {job} failed inside the pool: {source}")]
    Pool { job: JobId, source: ExecutorError },
    #[error("Unit {job} did not complete within {after:?}")]
    TimedOut { job: JobId, after: Duration },
    #[error("Failed to submit unit {job}: {source}")]
    Submit { job: JobId, source: ExecutorError },
    #[error("Completion channel closed while units were in flight")]
    Disconnected,
}

type UnitResult<O> = Result<Outcome<O>, ScheduleError>;
/// a unit handed back by `wait`, with its submission time
type Received<O> = (JobId, Instant, UnitResult<O>);

#[derive(Clone, Debug, Default)]
pub struct ScheduleOptions {
    /// upper bound of units in flight, defaults to the pool's worker count
    pub window: Option<usize>,
    /// give up on a unit this long after its submission, its slot stays taken
    /// until the pool hands the unit back
    pub timeout: Option<Duration>,
    /// write a performance report here once the call is done
    pub report: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// nothing submitted yet, the first `next` fills the window
    Filling,
    /// waiting for completions, each one is replaced by the next input
    Draining,
    /// no input left and nothing in flight
    Drained,
}

/// Lazy stream of unit results in completion order
///
/// At most `window` units are in flight. Each completion is handed out by
/// `next` after its slot was refilled from the input, the input iterator is
/// dropped as soon as it reports exhaustion. A unit that timed out still counts
/// against the window until its late completion arrives, since the pool is
/// still busy with it.
pub struct Completions<'p, T: Task, I> {
    pool: &'p Executors,
    task: Arc<T>,
    args: Option<I>,
    window: usize,
    timeout: Option<Duration>,
    in_flight: HashMap<JobId, Instant>,
    /// timed out and reported, but still occupying a worker
    expired: HashSet<JobId>,
    next_id: JobId,
    sender: Sender<Completion<T::Output>>,
    completions: Receiver<Completion<T::Output>>,
    state: State,
    fatal: Option<ScheduleError>,
    recorder: Option<Recorder>,
}

/// Run `task` for every element of `args` on `pool`
///
/// The window is the pool's worker count at the time of the call unless
/// `options.window` overrides it.
pub fn calc<T, I>(
    pool: &Executors,
    task: T,
    args: I,
    options: ScheduleOptions,
) -> Result<Completions<'_, T, I::IntoIter>, ScheduleError>
where
    T: Task,
    I: IntoIterator<Item = T::Arg>,
{
    let window = options.window.unwrap_or_else(|| pool.workers());

    if window == 0 {
        return Err(ScheduleError::NoWorkers);
    }

    let (sender, completions) = unbounded();
    debug!(task = T::NAME, window = window, "Starting scheduling call");

    Ok(Completions {
        pool,
        task: Arc::new(task),
        args: Some(args.into_iter()),
        window,
        timeout: options.timeout,
        in_flight: HashMap::with_capacity(window),
        expired: HashSet::new(),
        next_id: 0,
        sender,
        completions,
        state: State::Filling,
        fatal: None,
        recorder: options
            .report
            .map(|path| Recorder::new(path, T::NAME, window)),
    })
}

impl<'p, T: Task, I> Completions<'p, T, I> {
    /// units the pool is working on, timed out ones included
    pub fn in_flight(&self) -> usize {
        self.in_flight.len() + self.expired.len()
    }
}

impl<'p, T, I> Completions<'p, T, I>
where
    T: Task,
    I: Iterator<Item = T::Arg>,
{
    pub fn window(&self) -> usize {
        self.window
    }

    /// number of inputs handed to the pool so far
    pub fn submitted(&self) -> u64 {
        self.next_id
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// next input, never polls the iterator again once it ran dry
    fn pull(&mut self) -> Option<T::Arg> {
        let arg = self.args.as_mut()?.next();

        if arg.is_none() {
            self.args = None;
        }

        arg
    }

    /// submit the next input, `false` once the input is exhausted
    fn submit_next(&mut self) -> Result<bool, ScheduleError> {
        let Some(arg) = self.pull() else {
            return Ok(false);
        };

        let job = self.next_id;
        self.next_id += 1;

        self.pool
            .submit(&self.task, arg, Reply::new(job, self.sender.clone()))
            .map_err(|source| ScheduleError::Submit { job, source })?;
        self.in_flight.insert(job, Instant::now());

        let in_flight = self.in_flight();
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.submitted(in_flight);
        }

        Ok(true)
    }

    fn fill(&mut self) -> Result<(), ScheduleError> {
        while self.in_flight() < self.window && self.submit_next()? {}

        debug!(task = T::NAME, in_flight = self.in_flight(), "Window filled");

        Ok(())
    }

    /// Block until a unit completes or times out
    ///
    /// `None` means a unit that already timed out came back and freed its slot.
    fn wait(&mut self) -> Result<Option<Received<T::Output>>, ScheduleError> {
        loop {
            let oldest = self
                .in_flight
                .iter()
                .min_by_key(|(_, started)| **started)
                .map(|(&job, &started)| (job, started));

            let received = match (self.timeout, oldest) {
                (Some(after), Some((oldest, started))) => {
                    match self.completions.recv_deadline(started + after) {
                        Ok(completion) => completion,
                        Err(RecvTimeoutError::Timeout) => {
                            self.in_flight.remove(&oldest);
                            self.expired.insert(oldest);
                            warn!(task = T::NAME, job = oldest, "Unit timed out after {after:?}");

                            return Ok(Some((
                                oldest,
                                started,
                                Err(ScheduleError::TimedOut { job: oldest, after }),
                            )));
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            return Err(ScheduleError::Disconnected)
                        }
                    }
                }
                // nothing left with a deadline, only timed out units hold slots
                _ => self
                    .completions
                    .recv()
                    .map_err(|_| ScheduleError::Disconnected)?,
            };

            let Completion { id: job, result } = received;

            if let Some(started) = self.in_flight.remove(&job) {
                return Ok(Some((
                    job,
                    started,
                    result.map_err(|source| ScheduleError::Pool { job, source }),
                )));
            }

            if self.expired.remove(&job) {
                debug!(task = T::NAME, job = job, "Timed out unit finally completed");

                return Ok(None);
            }

            debug!(job = job, "Ignoring completion of an unknown unit");
        }
    }

    /// stop scheduling for good, units still in flight are forgotten
    fn abort(&mut self, error: ScheduleError) -> ScheduleError {
        error!(task = T::NAME, "Scheduling aborted: {error}");

        self.state = State::Drained;
        self.args = None;
        self.in_flight.clear();
        self.expired.clear();
        self.finish();

        error
    }

    fn finish(&mut self) {
        if let Some(recorder) = self.recorder.take() {
            let path = recorder.path().to_path_buf();

            match recorder.finish() {
                Ok(report) => info!(
                    path = ?path,
                    succeeded = report.succeeded,
                    submitted = report.submitted,
                    "Wrote performance report"
                ),
                Err(error) => error!(path = ?path, "Failed to write performance report: {error}"),
            }
        }
    }
}

impl<'p, T, I> Iterator for Completions<'p, T, I>
where
    T: Task,
    I: Iterator<Item = T::Arg>,
{
    type Item = Result<Outcome<T::Output>, ScheduleError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(error) = self.fatal.take() {
            return Some(Err(self.abort(error)));
        }

        loop {
            match self.state {
                State::Drained => return None,
                State::Filling => {
                    if let Err(error) = self.fill() {
                        return Some(Err(self.abort(error)));
                    }

                    self.state = State::Draining;
                }
                State::Draining => {
                    // late completions only matter while there is input to give their slots
                    if self.in_flight.is_empty() && (self.args.is_none() || self.expired.is_empty())
                    {
                        debug!(task = T::NAME, submitted = self.next_id, "Scheduling drained");

                        self.state = State::Drained;
                        self.finish();

                        return None;
                    }

                    let (job, started, result) = match self.wait() {
                        Ok(Some(received)) => received,
                        Ok(None) => {
                            if let Err(error) = self.fill() {
                                return Some(Err(self.abort(error)));
                            }

                            continue;
                        }
                        Err(error) => return Some(Err(self.abort(error))),
                    };
                    debug!(
                        task = T::NAME,
                        job = job,
                        in_flight = self.in_flight(),
                        "Unit completed"
                    );

                    if let Some(recorder) = self.recorder.as_mut() {
                        recorder.completed(started.elapsed(), &result);
                    }

                    // refill the freed slot before handing the result out, a
                    // timed out unit keeps its slot
                    if let Err(error) = self.fill() {
                        self.fatal = Some(error);
                    }

                    return Some(result);
                }
            }
        }
    }
}

impl<'p, T: Task, I> Drop for Completions<'p, T, I> {
    fn drop(&mut self) {
        if self.in_flight() > 0 {
            debug!(
                task = T::NAME,
                in_flight = self.in_flight(),
                "Dropping scheduling call with units in flight"
            );
        }

        if let Some(recorder) = self.recorder.take() {
            if let Err(error) = recorder.finish() {
                error!("Failed to write performance report: {error}");
            }
        }
    }
}
