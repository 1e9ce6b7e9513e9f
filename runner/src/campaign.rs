use crate::{
    collector::Collector,
    config::{CampaignConfig, ConfigErrors, StageConfig},
    environment::Environment,
    executors::{ExecutorError, Executors},
    scheduler::{calc, ScheduleError},
    task::Outcome,
};
use globset::{Glob, GlobMatcher};
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// backups the MD engine leaves behind, e.g. `#md_out.log.1#`
const BACKUP_GLOB: &str = "#*#";

#[derive(Debug, Error)]
pub enum CampaignError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error("Stage {stage} failed to start its worker pool: {source}")]
    Pool {
        stage: String,
        source: ExecutorError,
    },
    #[error("Stage {stage} was aborted: {source}")]
    Schedule {
        stage: String,
        source: ScheduleError,
    },
    #[error("No work directory survived stage {0}")]
    NoSurvivors(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageSummary {
    pub stage: String,
    pub succeeded: usize,
    /// part of `succeeded`, checkpoint files were already in place
    pub reused: usize,
    pub skipped: usize,
    pub failed: usize,
    /// units lost or timed out inside the pool
    pub errors: usize,
}

#[derive(Debug)]
pub struct Campaign {
    config: CampaignConfig,
    env: Environment,
}

impl Campaign {
    pub fn new(config: CampaignConfig, env: Environment) -> Self {
        Self { config, env }
    }

    /// run every stage in order, each on its own pool
    #[instrument(skip_all, level = "info")]
    pub fn run(&self) -> Result<Vec<StageSummary>, CampaignError> {
        let mut summaries = Vec::with_capacity(self.config.stages.len());
        let mut survivors: Option<Vec<PathBuf>> = None;

        for stage in self.config.stages.iter() {
            let (summary, passed) = match survivors.take() {
                Some(work_dirs) => self.run_stage(stage, work_dirs)?,
                None => self.run_stage(stage, Collector::load(&self.config.inputs)?)?,
            };

            info!(
                stage = %stage.name,
                succeeded = summary.succeeded,
                reused = summary.reused,
                skipped = summary.skipped,
                failed = summary.failed,
                errors = summary.errors,
                "Stage finished"
            );
            summaries.push(summary);

            if passed.is_empty() {
                return Err(CampaignError::NoSurvivors(stage.name.clone()));
            }
            survivors = Some(passed);
        }

        let survivors = survivors.unwrap_or_default();
        info!("Campaign finished for {} work directories", survivors.len());

        if self.config.clean_backups {
            let matcher = Glob::new(BACKUP_GLOB)
                .map_err(ConfigErrors::from)?
                .compile_matcher();

            survivors
                .iter()
                .for_each(|work_dir| remove_backups(work_dir, &matcher));
        }

        Ok(summaries)
    }

    /// run a single stage on a freshly started pool, which is always shut down again
    #[instrument(skip(self, stage, inputs), fields(stage = %stage.name), level = "info")]
    pub fn run_stage<I>(
        &self,
        stage: &StageConfig,
        inputs: I,
    ) -> Result<(StageSummary, Vec<PathBuf>), CampaignError>
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let plan = self.config.executor.plan(stage.tasks_per_node)?;
        let mut pool =
            Executors::load(&plan, self.env.clone()).map_err(|source| CampaignError::Pool {
                stage: stage.name.clone(),
                source,
            })?;

        let result = drain(&pool, stage, inputs);
        pool.shutdown();

        result
    }
}

fn drain<I>(
    pool: &Executors,
    stage: &StageConfig,
    inputs: I,
) -> Result<(StageSummary, Vec<PathBuf>), CampaignError>
where
    I: IntoIterator<Item = PathBuf>,
{
    let schedule_error = |source| CampaignError::Schedule {
        stage: stage.name.clone(),
        source,
    };
    let mut summary = StageSummary {
        stage: stage.name.clone(),
        ..StageSummary::default()
    };
    let mut passed = Vec::new();

    for (processed, result) in calc(pool, stage.task(), inputs, stage.options())
        .map_err(schedule_error)?
        .enumerate()
    {
        match result {
            Ok(Outcome::Success(output)) => {
                debug!(work_dir = ?output.work_dir, host = %output.host, "Finished in {} ms", output.runtime_ms);

                summary.succeeded += 1;
                if output.reused {
                    summary.reused += 1;
                }
                passed.push(output.work_dir);
            }
            Ok(Outcome::Skipped(reason)) => {
                warn!(stage = %stage.name, "Skipped: {reason}");
                summary.skipped += 1;
            }
            Ok(Outcome::Failed(reason)) => {
                error!(stage = %stage.name, "{reason}");
                summary.failed += 1;
            }
            Err(error @ ScheduleError::Submit { .. }) => return Err(schedule_error(error)),
            Err(error) => {
                error!(stage = %stage.name, "{error}");
                summary.errors += 1;
            }
        }

        info!(stage = %stage.name, "Done with {}", processed + 1);
    }

    Ok((summary, passed))
}

fn remove_backups(work_dir: &Path, matcher: &GlobMatcher) {
    let entries = match fs::read_dir(work_dir) {
        Ok(entries) => entries,
        Err(error) => {
            warn!(work_dir = ?work_dir, "Failed to list work directory: {error}");
            return;
        }
    };

    for entry in entries.filter_map(Result::ok) {
        if matcher.is_match(entry.file_name()) {
            match fs::remove_file(entry.path()) {
                Ok(()) => debug!(path = ?entry.path(), "Removed backup file"),
                Err(error) => warn!(path = ?entry.path(), "Failed to remove backup file: {error}"),
            }
        }
    }
}

#[cfg(test)]
mod campaign_test;
