use crate::environment::Environment;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::{
    any::Any,
    collections::BTreeMap,
    ffi::OsStr,
    fmt::Debug,
    panic::{catch_unwind, AssertUnwindSafe},
    process::Command,
};
use tracing::warn;

/// Result of a single unit of work
///
/// Anything but `Success` means the unit did not produce a usable value. The
/// scheduler never looks inside, it only hands outcomes back to the caller.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome<T> {
    Success(T),
    /// the unit was not attempted, e.g., its input was missing
    Skipped(String),
    Failed(String),
}

impl<T> Outcome<T> {
    pub fn success(self) -> Option<T> {
        match self {
            Self::Success(value) => Some(value),
            Self::Skipped(_) | Self::Failed(_) => None,
        }
    }
}

impl Outcome<Value> {
    /// decode a wire outcome into the task's output type
    /// undecodable values count as a failed unit
    pub fn decode<T: DeserializeOwned>(self) -> Outcome<T> {
        match self {
            Self::Success(value) => match serde_json::from_value(value) {
                Ok(value) => Outcome::Success(value),
                Err(error) => Outcome::Failed(format!("undecodable result: {error}")),
            },
            Self::Skipped(reason) => Outcome::Skipped(reason),
            Self::Failed(reason) => Outcome::Failed(reason),
        }
    }
}

/// Everything a unit may know about the worker it runs on
#[derive(Clone, Debug)]
pub struct WorkerContext {
    pub slot: usize,
    pub hostname: String,
    pub threads: usize,
    pub env: Environment,
}

impl WorkerContext {
    /// create a command with the forwarded environment applied
    pub fn command(&self, program: impl AsRef<OsStr>) -> Command {
        let mut command = Command::new(program);
        self.env.apply(&mut command);

        command
    }
}

/// A unit of work: the implementing value is the keyword set shared by all
/// units of one scheduling call, `Arg` is the per-unit positional argument.
///
/// Tasks travel to remote workers by name, so every task run on a remote pool
/// must also be registered in the worker's [`TaskRegistry`].
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    const NAME: &'static str;

    type Arg: Serialize + DeserializeOwned + Send + 'static;
    type Output: Serialize + DeserializeOwned + Send + 'static;

    fn run(&self, arg: Self::Arg, context: &WorkerContext) -> Outcome<Self::Output>;
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("unknown panic payload")
    }
}

/// run a task and turn a panic into a failed unit
pub fn run_guarded<T: Task>(task: &T, arg: T::Arg, context: &WorkerContext) -> Outcome<T::Output> {
    match catch_unwind(AssertUnwindSafe(|| task.run(arg, context))) {
        Ok(outcome) => outcome,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!(task = T::NAME, slot = context.slot, "Unit panicked: {message}");

            Outcome::Failed(format!("task {} panicked: {message}", T::NAME))
        }
    }
}

type ErasedRunner = Box<dyn Fn(Value, Value, &WorkerContext) -> Outcome<Value> + Send + Sync>;

/// name -> type erased runner, used by remote workers to resolve incoming units
#[derive(Default)]
pub struct TaskRegistry {
    runners: BTreeMap<&'static str, ErasedRunner>,
}

impl Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.runners.keys()).finish()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Task>(mut self) -> Self {
        self.runners.insert(
            T::NAME,
            Box::new(|kwargs, arg, context| {
                let task = match serde_json::from_value::<T>(kwargs) {
                    Ok(task) => task,
                    Err(error) => {
                        return Outcome::Failed(format!("undecodable task {}: {error}", T::NAME))
                    }
                };
                let arg = match serde_json::from_value::<T::Arg>(arg) {
                    Ok(arg) => arg,
                    Err(error) => {
                        return Outcome::Failed(format!(
                            "undecodable argument for {}: {error}",
                            T::NAME
                        ))
                    }
                };

                match run_guarded(&task, arg, context) {
                    Outcome::Success(output) => match serde_json::to_value(output) {
                        Ok(value) => Outcome::Success(value),
                        Err(error) => Outcome::Failed(format!("unencodable result: {error}")),
                    },
                    Outcome::Skipped(reason) => Outcome::Skipped(reason),
                    Outcome::Failed(reason) => Outcome::Failed(reason),
                }
            }),
        );

        self
    }

    /// run the unit named `name`, unknown names are a failed unit
    pub fn run(&self, name: &str, kwargs: Value, arg: Value, context: &WorkerContext) -> Outcome<Value> {
        match self.runners.get(name) {
            Some(runner) => runner(kwargs, arg, context),
            None => Outcome::Failed(format!("task {name} is not registered on this worker")),
        }
    }
}
