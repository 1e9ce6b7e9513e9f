use crate::config::EnvironmentConfig;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    env,
    ffi::{OsStr, OsString},
    io,
    path::{Path, PathBuf},
    process::Command,
};
use tracing::debug;

/// Variables forwarded to every worker even if the config does not list them
pub const DEFAULT_FORWARDED: [&str; 4] = [
    "CONDA_DEFAULT_ENV",
    "CONDA_PREFIX",
    "CONDA_PROMPT_MODIFIER",
    "CONDA_SHLVL",
];

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
/// Snapshot of the coordinator environment handed to each worker once, before
/// the first unit is submitted
pub struct Environment {
    /// prepended to the worker's own PATH, empty means "leave PATH alone"
    #[serde(default)]
    pub search_path: String,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

impl Environment {
    /// capture the coordinator environment as selected by `config`
    pub fn capture(config: &EnvironmentConfig) -> Self {
        let mut vars = BTreeMap::new();

        for name in DEFAULT_FORWARDED
            .iter()
            .copied()
            .chain(config.forward.iter().map(String::as_str))
        {
            match env::var(name) {
                Ok(value) => {
                    vars.insert(name.to_owned(), value);
                }
                Err(error) => debug!(name = name, "Not forwarding variable: {error}"),
            }
        }

        // literal values win over captured ones
        vars.extend(config.vars.clone());

        let search_path = if config.search_path {
            env::var("PATH").unwrap_or_default()
        } else {
            String::new()
        };

        Self { search_path, vars }
    }

    /// join the forwarded search path in front of `own`
    pub fn joined_path(&self, own: Option<&OsStr>) -> OsString {
        let mut path = OsString::from(&self.search_path);

        match own {
            Some(own) if !own.is_empty() => {
                if !path.is_empty() {
                    path.push(":");
                }
                path.push(own);
            }
            _ => {}
        }

        path
    }

    /// apply the snapshot to a command which is about to be spawned
    pub fn apply(&self, command: &mut Command) {
        if !self.search_path.is_empty() {
            let own = env::var_os("PATH");
            command.env("PATH", self.joined_path(own.as_deref()));
        }

        command.envs(self.vars.iter());
    }
}

/// anchor a relative path at the current directory, children run elsewhere
pub fn absolute(path: &Path) -> io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(env::current_dir()?.join(path).components().collect())
    }
}

/// like `absolute`, but a bare program name is left to the search path
pub fn resolve_program(program: &Path) -> io::Result<PathBuf> {
    if program.components().count() > 1 {
        absolute(program)
    } else {
        Ok(program.to_path_buf())
    }
}
