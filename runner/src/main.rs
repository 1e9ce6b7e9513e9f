use clap::{Parser, Subcommand};
use std::{
    fs::{self, File},
    io,
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
};
use streamd_runner::{
    campaign::Campaign, config::CampaignConfig, distributed::worker::serve,
    environment::Environment, registry,
};
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use tracing_unwrap::ResultExt;

#[derive(Parser, Debug)]
#[command(name = "streamd", version, about = "Run MD campaigns on a pool of local or remote workers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every stage of a campaign
    Run {
        #[arg(short, long)]
        config: PathBuf,
        /// overrides executor.hostfile
        #[arg(long)]
        hostfile: Option<PathBuf>,
        /// overrides executor.cpu_per_node
        #[arg(long)]
        ncpu: Option<usize>,
        /// also write the log here
        #[arg(long)]
        log_file: Option<PathBuf>,
        #[arg(long, default_value_t = Level::INFO)]
        log_level: Level,
    },
    /// Serve units over stdin/stdout, started by the coordinator
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        threads: usize,
        #[arg(long)]
        slot: usize,
    },
}

/// `ansi` only applies to stderr, the log file never gets escape codes
fn init_logging(level: Level, log_file: Option<&PathBuf>, ansi: bool) -> io::Result<()> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()))
    };
    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            let file = File::create(path)?;

            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file))
                    .with_filter(filter()),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_ansi(ansi)
                .with_writer(io::stderr)
                .with_filter(filter()),
        )
        .with(file_layer)
        .init();

    Ok(())
}

fn run(config: PathBuf, hostfile: Option<PathBuf>, ncpu: Option<usize>) -> ExitCode {
    let mut config = match CampaignConfig::load(&config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load {config:?}: {e}");
            return ExitCode::FAILURE;
        }
    };

    if hostfile.is_some() {
        config.executor.hostfile = hostfile;
    }
    if ncpu.is_some() {
        config.executor.cpu_per_node = ncpu;
    }

    if config.preflight_checks() {
        error!("Refusing to start, fix the configuration first");
        return ExitCode::FAILURE;
    }

    let env = Environment::capture(&config.environment);
    match Campaign::new(config, env).run() {
        Ok(summaries) => {
            for summary in summaries {
                info!(
                    "{}: {} succeeded ({} reused), {} skipped, {} failed, {} lost",
                    summary.stage,
                    summary.succeeded,
                    summary.reused,
                    summary.skipped,
                    summary.failed,
                    summary.errors
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Campaign failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn main() -> ExitCode {
    match Cli::parse().command {
        Command::Run {
            config,
            hostfile,
            ncpu,
            log_file,
            log_level,
        } => {
            if let Err(e) = init_logging(log_level, log_file.as_ref(), true) {
                eprintln!("Failed to open log file {log_file:?}: {e}");
                return ExitCode::FAILURE;
            }
            run(config, hostfile, ncpu)
        }
        Command::Worker { threads, slot } => {
            // stdout carries the protocol, logs go to stderr and are forwarded by the
            // coordinator, which adds its own formatting
            init_logging(Level::INFO, None, false).expect_or_log("Failed to set up logging");

            let stdin = io::stdin();
            let stdout = io::stdout();
            let processed = serve(&registry(), slot, threads, stdin.lock(), stdout.lock())
                .expect_or_log("Worker protocol failed");
            info!(slot = slot, "Worker exiting after {processed} units");

            ExitCode::SUCCESS
        }
    }
}
