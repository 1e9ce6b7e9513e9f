use super::{ScriptTask, StageOutput};
use crate::{
    environment::Environment,
    task::{Outcome, Task, WorkerContext},
};
use std::{
    collections::BTreeMap,
    env, fs,
    os::unix::fs::symlink,
    path::{Path, PathBuf},
};

fn context(vars: &[(&str, &str)]) -> WorkerContext {
    WorkerContext {
        slot: 0,
        hostname: String::from("node01"),
        threads: 1,
        env: Environment {
            search_path: String::new(),
            vars: vars
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect::<BTreeMap<_, _>>(),
        },
    }
}

/// run `body` through `sh`, so the test never executes a file it just wrote
fn task(dir: &Path, body: &str) -> ScriptTask {
    let script = dir.join("stage.sh");
    fs::write(&script, body).expect("temp dir is writable");

    ScriptTask {
        stage: String::from("equilibrate"),
        script: PathBuf::from("/bin/sh"),
        params: vec![script.to_string_lossy().into_owned()],
        timeout: None,
        creates: Vec::new(),
    }
}

fn work_dir(root: &Path) -> PathBuf {
    let work_dir = root.join("run1");
    fs::create_dir(&work_dir).expect("temp dir is writable");

    work_dir
}

#[test]
pub fn script_runs_in_work_dir() {
    let dir = tempfile::tempdir().expect("temp dir is available");
    let work_dir = work_dir(dir.path());
    let task = task(
        dir.path(),
        "echo \"arg=$1\"\necho \"wdir=$wdir\"\necho \"var=$STAGE_VAR\"\necho oops >&2\ntouch marker\n",
    );

    let outcome = task.run(work_dir.clone(), &context(&[("STAGE_VAR", "forwarded")]));

    match outcome {
        Outcome::Success(StageOutput {
            work_dir: done,
            reused,
            host,
            ..
        }) => {
            assert_eq!(done, work_dir);
            assert!(!reused);
            assert_eq!(host, "node01");
        }
        other => panic!("expected success, got {other:?}"),
    }

    let log = fs::read_to_string(work_dir.join("equilibrate.log")).expect("log was written");
    assert_eq!(
        log,
        format!(
            "arg={0}\nwdir={0}\nvar=forwarded\n",
            work_dir.display()
        )
    );
    assert_eq!(
        fs::read_to_string(work_dir.join("equilibrate.err")).expect("log was written"),
        "oops\n"
    );
    assert!(work_dir.join("marker").is_file());
}

#[test]
pub fn checkpoint_files_skip_the_script() {
    let dir = tempfile::tempdir().expect("temp dir is available");
    let work_dir = work_dir(dir.path());
    fs::write(work_dir.join("npt.gro"), "").expect("temp dir is writable");
    fs::write(work_dir.join("npt.cpt"), "").expect("temp dir is writable");

    let mut task = task(dir.path(), "exit 1\n");
    task.creates = vec![String::from("npt.gro"), String::from("npt.cpt")];

    assert!(task.is_done(&work_dir));
    assert!(matches!(
        task.run(work_dir.clone(), &context(&[])),
        Outcome::Success(StageOutput {
            reused: true,
            runtime_ms: 0,
            ..
        })
    ));
    assert!(!work_dir.join("equilibrate.log").exists());
}

#[test]
pub fn partial_checkpoint_runs_the_script() {
    let dir = tempfile::tempdir().expect("temp dir is available");
    let work_dir = work_dir(dir.path());
    fs::write(work_dir.join("npt.gro"), "").expect("temp dir is writable");

    let mut task = task(dir.path(), "exit 0\n");
    task.creates = vec![String::from("npt.gro"), String::from("npt.cpt")];

    assert!(!task.is_done(&work_dir));
    assert!(matches!(
        task.run(work_dir, &context(&[])),
        Outcome::Success(StageOutput { reused: false, .. })
    ));
}

#[test]
pub fn missing_work_dir_is_skipped() {
    let dir = tempfile::tempdir().expect("temp dir is available");
    let task = task(dir.path(), "exit 0\n");

    assert!(matches!(
        task.run(dir.path().join("missing"), &context(&[])),
        Outcome::Skipped(_)
    ));
}

#[test]
pub fn failing_script_fails_the_unit() {
    let dir = tempfile::tempdir().expect("temp dir is available");
    let work_dir = work_dir(dir.path());
    let task = task(dir.path(), "exit 3\n");

    match task.run(work_dir.clone(), &context(&[])) {
        Outcome::Failed(reason) => {
            assert!(reason.contains(&work_dir.display().to_string()));
            assert!(reason.contains("equilibrate.log"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[test]
pub fn slow_script_times_out() {
    let dir = tempfile::tempdir().expect("temp dir is available");
    let work_dir = work_dir(dir.path());
    let mut task = task(dir.path(), "exec sleep 30\n");
    task.timeout = Some(1);

    match task.run(work_dir, &context(&[])) {
        Outcome::Failed(reason) => assert!(reason.contains("timed out")),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[test]
pub fn missing_script_fails_the_unit() {
    let dir = tempfile::tempdir().expect("temp dir is available");
    let work_dir = work_dir(dir.path());
    let mut task = task(dir.path(), "exit 0\n");
    task.script = dir.path().join("missing.sh");
    task.params.clear();

    match task.run(work_dir, &context(&[])) {
        Outcome::Failed(reason) => assert!(reason.contains("Failed to spawn")),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[test]
pub fn relative_script_and_work_dir() {
    let dir = tempfile::Builder::new()
        .prefix("stage")
        .tempdir_in(".")
        .expect("current dir is writable");
    let cwd = env::current_dir().expect("current dir is readable");
    let relative = PathBuf::from(dir.path().file_name().expect("temp dir has a name"));
    work_dir(dir.path());

    let mut task = task(&cwd.join(&relative), "echo \"wdir=$wdir\"\necho \"arg=$1\"\n");
    symlink("/bin/sh", dir.path().join("shell")).expect("current dir is writable");
    task.script = relative.join("shell");

    let expected = cwd.join(&relative).join("run1");
    match task.run(relative.join("run1"), &context(&[])) {
        Outcome::Success(StageOutput { work_dir, .. }) => assert_eq!(work_dir, expected),
        other => panic!("expected success, got {other:?}"),
    }
    assert_eq!(
        fs::read_to_string(expected.join("equilibrate.log")).expect("log was written"),
        format!("wdir={0}\narg={0}\n", expected.display())
    );
}
