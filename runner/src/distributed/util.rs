use crate::executors::{ExecutorError, LaunchConfig};
use itertools::Itertools;
use once_cell::sync::Lazy;
use std::process::Command;
use tracing::error;

/// placeholder in launcher arguments replaced by the node name
pub const HOST_PLACEHOLDER: &str = "{host}";

pub static HOSTNAME: Lazy<String> = Lazy::new(|| match nix::unistd::gethostname() {
    Ok(hostname) => hostname.to_string_lossy().into_owned(),
    Err(error) => {
        error!(error = ?error, "Failed to retrieve hostname: {error}");

        String::from("localhost")
    }
});

/// one node per non-empty line, `#` starts a comment
pub fn parse_hosts(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect_vec()
}

/// build the command starting worker `slot` on `host`
pub fn launch_command(
    config: &LaunchConfig,
    host: &str,
    threads: usize,
    slot: usize,
) -> Result<Command, ExecutorError> {
    let (program, args) = config
        .launcher
        .split_first()
        .ok_or(ExecutorError::EmptyLauncher)?;

    let substitute = |value: &String| value.replace(HOST_PLACEHOLDER, host);
    let mut command = Command::new(substitute(program));
    command.args(args.iter().map(substitute));

    if !config
        .launcher
        .iter()
        .any(|value| value.contains(HOST_PLACEHOLDER))
    {
        command.arg(host);
    }

    command.arg(&config.worker_exec);
    worker_args(&mut command, threads, slot);

    Ok(command)
}

/// build the command starting worker `slot` on this host, without a launcher
pub fn worker_command(config: &LaunchConfig, threads: usize, slot: usize) -> Command {
    let mut command = Command::new(&config.worker_exec);
    worker_args(&mut command, threads, slot);

    command
}

fn worker_args(command: &mut Command, threads: usize, slot: usize) {
    command
        .arg("worker")
        .arg("--threads")
        .arg(threads.to_string())
        .arg("--slot")
        .arg(slot.to_string());
}
