use crate::{
    distributed::util::parse_hosts,
    environment::resolve_program,
    executors::{Isolation, LaunchConfig, PoolPlan, PoolSizing},
    scheduler::ScheduleOptions,
    stage::ScriptTask,
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    env, fs,
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        Ok((fs::metadata(path)?.mode() & 0o111) != 0)
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Globs were invalid: {0}")]
    InvalidGlobs(#[from] globset::Error),
    #[error("File not found: {0:?}")]
    FileNotFound(PathBuf),
    #[error("Failed to read: {0}")]
    Io(#[from] Error),
    #[error("Failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Hostfile {0:?} does not list any node")]
    EmptyHostfile(PathBuf),
    #[error("No input paths were given")]
    NoInputs,
    #[error("Configuration contains errors, see the log above")]
    Preflight,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct CampaignConfig {
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub environment: EnvironmentConfig,
    pub inputs: InputConfig,
    // Stages run in order, the work dirs that succeed in one stage feed the next
    pub stages: Vec<StageConfig>,
    // remove the MD engine's `#name#` backup files from surviving work dirs
    #[serde(default = "default_true")]
    pub clean_backups: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    // one node per line, absent means a local pool
    pub hostfile: Option<PathBuf>,
    pub cpu_per_node: Option<usize>,
    #[serde(default = "default_tasks_per_node")]
    pub tasks_per_node: usize,
    #[serde(default = "default_launcher")]
    pub launcher: Vec<String>,
    pub worker_exec: Option<PathBuf>,
    // seconds
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,
    // how the workers of a pool without hostfile are started
    #[serde(default)]
    pub local_workers: Isolation,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentConfig {
    // variables to copy from the coordinator, on top of the conda defaults
    #[serde(default)]
    pub forward: Vec<String>,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub search_path: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct InputConfig {
    pub paths: Vec<PathBuf>,
    // when set, `paths` are walked and matching directories become inputs
    pub glob: Option<String>,
    pub max_depth: Option<usize>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    pub name: String,
    pub script: PathBuf,
    #[serde(default)]
    pub params: Vec<String>,
    pub tasks_per_node: Option<usize>,
    // seconds the script may run
    pub timeout: Option<u64>,
    #[serde(default)]
    pub creates: Vec<String>,
    pub window: Option<usize>,
    // seconds the scheduler waits for a unit before giving up its slot
    pub unit_timeout: Option<u64>,
    pub report: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            hostfile: None,
            cpu_per_node: None,
            tasks_per_node: default_tasks_per_node(),
            launcher: default_launcher(),
            worker_exec: None,
            ready_timeout: default_ready_timeout(),
            shutdown_grace: default_shutdown_grace(),
            local_workers: Isolation::default(),
        }
    }
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            forward: Vec::new(),
            vars: BTreeMap::new(),
            search_path: true,
        }
    }
}

/// one node per non-empty line, the first one is the coordinator
pub fn read_hostfile(path: &Path) -> Result<Vec<String>, ConfigErrors> {
    let hosts = parse_hosts(&fs::read_to_string(path)?);

    if hosts.is_empty() {
        Err(ConfigErrors::EmptyHostfile(path.to_path_buf()))
    } else {
        Ok(hosts)
    }
}

impl ExecutorConfig {
    /// resolve the pool for a stage, `tasks_per_node` overrides the executor default
    pub fn plan(&self, tasks_per_node: Option<usize>) -> Result<PoolPlan, ConfigErrors> {
        let nodes = match &self.hostfile {
            Some(hostfile) => read_hostfile(hostfile)?,
            None => Vec::new(),
        };
        let worker_exec = match &self.worker_exec {
            Some(path) => path.clone(),
            None => env::current_exe()?,
        };

        Ok(PoolPlan {
            sizing: PoolSizing {
                tasks_per_node: tasks_per_node.unwrap_or(self.tasks_per_node),
                cpu_per_node: self.cpu_per_node.unwrap_or_else(num_cpus::get),
            },
            nodes,
            isolation: self.local_workers,
            launch: LaunchConfig {
                launcher: self.launcher.clone(),
                worker_exec,
                ready_timeout: Duration::from_secs(self.ready_timeout),
                shutdown_grace: Duration::from_secs(self.shutdown_grace),
            },
        })
    }
}

impl StageConfig {
    pub fn task(&self) -> ScriptTask {
        // pinned here so workers don't resolve it from inside each work dir
        let script = match resolve_program(&self.script) {
            Ok(script) => script,
            Err(e) => {
                warn!("Failed to resolve stages.{}.script: {e}", self.name);
                self.script.clone()
            }
        };

        ScriptTask {
            stage: self.name.clone(),
            script,
            params: self.params.clone(),
            timeout: self.timeout,
            creates: self.creates.clone(),
        }
    }

    pub fn options(&self) -> ScheduleOptions {
        ScheduleOptions {
            window: self.window,
            timeout: self.unit_timeout.map(Duration::from_secs),
            report: self.report.clone(),
        }
    }
}

impl CampaignConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        Ok(serde_yaml::from_str(&fs::read_to_string(path)?)?)
    }

    /// log every problem at once instead of piece-by-piece to make debugging easier for users
    /// returns true if any error was found
    pub fn preflight_checks(&self) -> bool {
        let mut contains_error = false;

        if self.stages.is_empty() {
            error!("No stage was defined, there is nothing to run");
            contains_error = true;
        }

        if self.inputs.paths.is_empty() {
            error!("inputs.paths is empty, a campaign can't be a NOP");
            contains_error = true;
        }

        for name in self.stages.iter().map(|stage| &stage.name).duplicates() {
            error!("Stage {name} is defined more than once");
            contains_error = true;
        }

        if self.executor.tasks_per_node == 0 {
            error!("executor.tasks_per_node cannot be 0");
            contains_error = true;
        }

        if self.executor.cpu_per_node == Some(0) {
            error!("executor.cpu_per_node cannot be 0");
            contains_error = true;
        }

        if self.executor.launcher.is_empty() {
            error!("executor.launcher cannot be empty");
            contains_error = true;
        }

        if let Some(hostfile) = &self.executor.hostfile {
            if let Err(e) = read_hostfile(hostfile) {
                error!("executor.hostfile is unusable: {e}");
                contains_error = true;
            }
        }

        for stage in self.stages.iter() {
            let name = &stage.name;

            match check_executable(&stage.script) {
                Ok(true) => {}
                Ok(false) => {
                    error!(
                        "Stage {name} script {} is not executable",
                        stage.script.to_string_lossy()
                    );
                    contains_error = true;
                }
                Err(e) => {
                    error!(
                        "Failed to determine if stages.{name}.script ({}) is an executable: {e}",
                        stage.script.to_string_lossy()
                    );
                    contains_error = true;
                }
            }

            if stage.tasks_per_node == Some(0) {
                error!("stages.{name}.tasks_per_node cannot be 0");
                contains_error = true;
            }

            if stage.window == Some(0) {
                error!("stages.{name}.window cannot be 0, nothing would ever run");
                contains_error = true;
            }

            if stage.timeout == Some(0) || stage.unit_timeout == Some(0) {
                error!("stages.{name} timeouts cannot be 0");
                contains_error = true;
            }

            if self.executor.hostfile.is_some() && stage.script.is_relative() {
                warn!("stages.{name}.script is relative, it has to exist below the same directory on every node");
            }
        }

        contains_error
    }
}

fn default_true() -> bool {
    true
}

fn default_tasks_per_node() -> usize {
    1
}

fn default_launcher() -> Vec<String> {
    ["ssh", "-o", "BatchMode=yes"]
        .into_iter()
        .map(String::from)
        .collect_vec()
}

fn default_ready_timeout() -> u64 {
    60
}

fn default_shutdown_grace() -> u64 {
    10
}
