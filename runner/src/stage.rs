use crate::{
    environment::{absolute, resolve_program},
    task::{Outcome, Task, WorkerContext},
};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("Failed to create log file {path:?}: {source}")]
    LogFile { path: PathBuf, source: io::Error },
    #[error("Failed to spawn {script:?}: {source}")]
    SpawnScript { script: PathBuf, source: io::Error },
    #[error("Failed to wait for a child process: {0}")]
    ChildError(#[from] io::Error),
    #[error("Script timed out after {0:?}")]
    ChildTimeout(Duration),
    #[error("Script exited with {status}, see {log:?}")]
    ExitStatus { status: ExitStatus, log: PathBuf },
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
/// what a finished stage reports back for a work directory
pub struct StageOutput {
    pub work_dir: PathBuf,
    pub runtime_ms: u64,
    /// the checkpoint files were already present, the script did not run
    pub reused: bool,
    pub host: String,
}

/// Runs one MD stage script against one work directory
///
/// The script is called as `script params.. <work_dir>` from within the work
/// directory with `wdir` set, output goes to `<stage>.log` and `<stage>.err`.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ScriptTask {
    pub stage: String,
    pub script: PathBuf,
    #[serde(default)]
    pub params: Vec<String>,
    /// seconds
    pub timeout: Option<u64>,
    /// files that mark the stage as done in a work directory
    #[serde(default)]
    pub creates: Vec<String>,
}

impl ScriptTask {
    pub fn is_done(&self, work_dir: &Path) -> bool {
        !self.creates.is_empty() && self.creates.iter().all(|file| work_dir.join(file).is_file())
    }

    fn log_file(&self, work_dir: &Path, extension: &str) -> Result<(PathBuf, File), StageError> {
        let path = work_dir.join(format!("{}.{extension}", self.stage));

        File::create(&path)
            .map(|file| (path.clone(), file))
            .map_err(|source| StageError::LogFile { path, source })
    }

    fn execute(&self, work_dir: &Path, context: &WorkerContext) -> Result<Duration, StageError> {
        let (log, stdout) = self.log_file(work_dir, "log")?;
        let (_, stderr) = self.log_file(work_dir, "err")?;
        // the child starts inside the work dir, a relative script would be looked up there
        let script = resolve_program(&self.script)?;
        let start = Instant::now();

        let mut child = context
            .command(&script)
            .args(&self.params)
            .arg(work_dir)
            .current_dir(work_dir)
            .env("wdir", work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|source| StageError::SpawnScript { script, source })?;

        debug!(stage = %self.stage, work_dir = ?work_dir, "Script running as {}", child.id());

        let status = match self.timeout.map(Duration::from_secs) {
            Some(timeout) => match child.wait_timeout(timeout)? {
                Some(status) => status,
                None => {
                    // child hasn't exited yet
                    child.kill()?;
                    child.wait()?;

                    return Err(StageError::ChildTimeout(timeout));
                }
            },
            None => child.wait()?,
        };

        if status.success() {
            Ok(start.elapsed())
        } else {
            Err(StageError::ExitStatus { status, log })
        }
    }
}

impl Task for ScriptTask {
    const NAME: &'static str = "script";

    type Arg = PathBuf;
    type Output = StageOutput;

    fn run(&self, work_dir: PathBuf, context: &WorkerContext) -> Outcome<StageOutput> {
        let work_dir = match absolute(&work_dir) {
            Ok(work_dir) => work_dir,
            Err(error) => return Outcome::Failed(format!("{}: {error}", work_dir.display())),
        };

        if !work_dir.is_dir() {
            warn!(stage = %self.stage, work_dir = ?work_dir, "Work directory not found");

            return Outcome::Skipped(format!("{} is not a directory", work_dir.display()));
        }

        if self.is_done(&work_dir) {
            warn!(
                stage = %self.stage,
                work_dir = ?work_dir,
                "Checkpoint files exist, the stage will be skipped"
            );

            return Outcome::Success(StageOutput {
                work_dir,
                runtime_ms: 0,
                reused: true,
                host: context.hostname.clone(),
            });
        }

        match self.execute(&work_dir, context) {
            Ok(runtime) => Outcome::Success(StageOutput {
                work_dir,
                runtime_ms: u64::try_from(runtime.as_millis()).unwrap_or(u64::MAX),
                reused: false,
                host: context.hostname.clone(),
            }),
            Err(error) => Outcome::Failed(format!("{}: {error}", work_dir.display())),
        }
    }
}

#[cfg(test)]
mod stage_test;
