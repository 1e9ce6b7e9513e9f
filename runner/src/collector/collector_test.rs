use super::Collector;
use crate::config::{ConfigErrors, InputConfig};
use std::{
    env,
    fs::{self, File},
    path::{Path, PathBuf},
};

fn layout(root: &Path) {
    for dir in ["a/run1", "a/run2", "b/run3", "b/run3/run5", "c"] {
        fs::create_dir_all(root.join(dir)).expect("temp dir is writable");
    }
    File::create(root.join("a/run4")).expect("temp dir is writable");
}

fn inputs(paths: Vec<PathBuf>, glob: Option<&str>, max_depth: Option<usize>) -> InputConfig {
    InputConfig {
        paths,
        glob: glob.map(str::to_owned),
        max_depth,
    }
}

#[test]
pub fn plain_paths_pass_through() {
    let paths = vec![PathBuf::from("/md/run2"), PathBuf::from("/md/missing"), PathBuf::from("/md/run1")];

    let collected = Collector::load(&inputs(paths.clone(), None, None))
        .expect("plain paths are valid")
        .collect::<Vec<_>>();

    assert_eq!(collected, paths);
}

#[test]
pub fn glob_matches_directories_only() {
    let dir = tempfile::tempdir().expect("temp dir is available");
    layout(dir.path());

    let collected = Collector::load(&inputs(vec![dir.path().to_path_buf()], Some("**/run*"), None))
        .expect("glob is valid")
        .collect::<Vec<_>>();

    assert_eq!(
        collected,
        ["a/run1", "a/run2", "b/run3", "b/run3/run5"].map(|dir_name| dir.path().join(dir_name))
    );
}

#[test]
pub fn glob_respects_max_depth() {
    let dir = tempfile::tempdir().expect("temp dir is available");
    layout(dir.path());
    fs::create_dir(dir.path().join("run0")).expect("temp dir is writable");

    let collected = Collector::load(&inputs(vec![dir.path().to_path_buf()], Some("**/run*"), Some(2)))
        .expect("glob is valid")
        .collect::<Vec<_>>();

    assert_eq!(
        collected,
        ["a/run1", "a/run2", "b/run3", "run0"].map(|dir_name| dir.path().join(dir_name))
    );
}

#[test]
pub fn glob_over_several_roots() {
    let dir = tempfile::tempdir().expect("temp dir is available");
    layout(dir.path());

    let roots = vec![dir.path().join("b"), dir.path().join("a")];
    let collected = Collector::load(&inputs(roots, Some("**/run[0-9]"), Some(1)))
        .expect("glob is valid")
        .collect::<Vec<_>>();

    assert_eq!(
        collected,
        ["b/run3", "a/run1", "a/run2"].map(|dir_name| dir.path().join(dir_name))
    );
}

#[test]
pub fn glob_without_paths() {
    assert!(matches!(
        Collector::load(&inputs(Vec::new(), Some("**/run*"), None)),
        Err(ConfigErrors::NoInputs)
    ));
}

#[test]
pub fn invalid_glob() {
    assert!(matches!(
        Collector::load(&inputs(vec![PathBuf::from(".")], Some("run[1-"), None)),
        Err(ConfigErrors::InvalidGlobs(_))
    ));
}

#[test]
pub fn relative_inputs_are_anchored() {
    let dir = tempfile::Builder::new()
        .prefix("collector")
        .tempdir_in(".")
        .expect("current dir is writable");
    layout(dir.path());
    let cwd = env::current_dir().expect("current dir is readable");
    let relative = PathBuf::from(dir.path().file_name().expect("temp dir has a name"));

    let collected = Collector::load(&inputs(vec![relative.join("a/run1")], None, None))
        .expect("plain paths are valid")
        .collect::<Vec<_>>();
    assert_eq!(collected, vec![cwd.join(&relative).join("a/run1")]);

    // the glob is written against the configured, relative root
    let glob = format!("{}/b/run*", relative.display());
    let collected = Collector::load(&inputs(vec![relative.join("b")], Some(&glob), None))
        .expect("glob is valid")
        .collect::<Vec<_>>();
    assert_eq!(collected, vec![cwd.join(&relative).join("b/run3")]);
}
