use crate::{
    config::{ConfigErrors, InputConfig},
    environment::absolute,
};
use globset::{GlobBuilder, GlobMatcher};
use ignore::{Walk, WalkBuilder};
use std::{fmt::Debug, path::PathBuf, vec};
use tracing::{debug, warn};

/// Lazy source of work directories
/// These should be initialized from `Collector::load`, every variant is
/// consumed exactly once
pub enum Collector {
    Paths {
        paths: vec::IntoIter<PathBuf>,
    },
    Glob {
        walk: Walk,
        matcher: GlobMatcher,
    },
}

impl Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paths { paths } => f.debug_struct("Paths").field("paths", paths).finish(),
            Self::Glob { matcher, .. } => f
                .debug_struct("Glob")
                .field("glob", &matcher.glob().glob())
                .finish_non_exhaustive(),
        }
    }
}

impl Collector {
    pub fn load(config: &InputConfig) -> Result<Self, ConfigErrors> {
        match &config.glob {
            // work dirs travel to workers with another current directory
            None => Ok(Self::Paths {
                paths: config
                    .paths
                    .iter()
                    .map(|path| absolute(path))
                    .collect::<Result<Vec<_>, _>>()?
                    .into_iter(),
            }),
            Some(glob) => {
                let matcher = GlobBuilder::new(glob)
                    .literal_separator(true)
                    .build()?
                    .compile_matcher();
                let (first, others) = config
                    .paths
                    .split_first()
                    .ok_or(ConfigErrors::NoInputs)?;
                let mut builder = WalkBuilder::new(first);

                debug!("Filtering with glob: {glob}");
                others.iter().for_each(|path| {
                    builder.add(path);
                });
                builder
                    .standard_filters(false)
                    .max_depth(config.max_depth)
                    .sort_by_file_path(|a, b| a.cmp(b));

                Ok(Self::Glob {
                    walk: builder.build(),
                    matcher,
                })
            }
        }
    }
}

impl Iterator for Collector {
    type Item = PathBuf;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Paths { paths } => paths.next(),
            Self::Glob { walk, matcher } => {
                for entry in walk.by_ref() {
                    match entry {
                        Ok(entry) => {
                            let is_dir = entry.file_type().map_or(false, |kind| kind.is_dir());

                            // the glob sees paths as configured, workers get them anchored
                            if is_dir && matcher.is_match(entry.path()) {
                                match absolute(entry.path()) {
                                    Ok(path) => return Some(path),
                                    Err(error) => warn!(path = ?entry.path(), "Failed to resolve work directory: {error}"),
                                }
                            }
                        }
                        Err(error) => warn!("Failed to search for work directories: {error}"),
                    }
                }

                None
            }
        }
    }
}

#[cfg(test)]
mod collector_test;
