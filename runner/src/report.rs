use crate::{scheduler::ScheduleError, task::Outcome};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Failed to write report: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to serialize report: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct LatencySummary {
    pub min_ms: u64,
    pub mean_ms: f64,
    pub max_ms: u64,
}

/// Performance report covering one scheduling call
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct RunReport {
    pub task: String,
    pub window: usize,
    /// unix seconds
    pub started_at: u64,
    pub wall_time_ms: u64,
    pub submitted: u64,
    pub succeeded: u64,
    pub skipped: u64,
    pub failed: u64,
    pub pool_errors: u64,
    pub timed_out: u64,
    pub peak_in_flight: usize,
    pub latency: Option<LatencySummary>,
}

#[derive(Debug)]
pub struct Recorder {
    path: PathBuf,
    started: Instant,
    report: RunReport,
    latency_sum: Duration,
    latency_count: u32,
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Recorder {
    pub fn new(path: PathBuf, task: &str, window: usize) -> Self {
        let started_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();

        Self {
            path,
            started: Instant::now(),
            report: RunReport {
                task: task.to_owned(),
                window,
                started_at,
                wall_time_ms: 0,
                submitted: 0,
                succeeded: 0,
                skipped: 0,
                failed: 0,
                pool_errors: 0,
                timed_out: 0,
                peak_in_flight: 0,
                latency: None,
            },
            latency_sum: Duration::ZERO,
            latency_count: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn submitted(&mut self, in_flight: usize) {
        self.report.submitted += 1;
        self.report.peak_in_flight = self.report.peak_in_flight.max(in_flight);
    }

    pub fn completed<O>(&mut self, latency: Duration, result: &Result<Outcome<O>, ScheduleError>) {
        match result {
            Ok(Outcome::Success(_)) => self.report.succeeded += 1,
            Ok(Outcome::Skipped(_)) => self.report.skipped += 1,
            Ok(Outcome::Failed(_)) => self.report.failed += 1,
            Err(ScheduleError::TimedOut { .. }) => self.report.timed_out += 1,
            Err(_) => self.report.pool_errors += 1,
        }

        let latency_ms = millis(latency);
        self.report.latency = Some(match self.report.latency.take() {
            Some(summary) => LatencySummary {
                min_ms: summary.min_ms.min(latency_ms),
                max_ms: summary.max_ms.max(latency_ms),
                mean_ms: 0.0,
            },
            None => LatencySummary {
                min_ms: latency_ms,
                max_ms: latency_ms,
                mean_ms: 0.0,
            },
        });
        self.latency_sum += latency;
        self.latency_count += 1;
    }

    /// write the report and hand it back
    pub fn finish(mut self) -> Result<RunReport, ReportError> {
        self.report.wall_time_ms = millis(self.started.elapsed());

        if let Some(summary) = self.report.latency.as_mut() {
            summary.mean_ms =
                (self.latency_sum / self.latency_count.max(1)).as_secs_f64() * 1000.0;
        }

        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        serde_yaml::to_writer(File::create(&self.path)?, &self.report)?;

        Ok(self.report)
    }
}
