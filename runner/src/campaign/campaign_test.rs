use super::{Campaign, CampaignError, StageSummary};
use crate::{config::CampaignConfig, environment::Environment};
use std::{fs, path::Path};

const PREP: &str = "[ -f fail ] && exit 1\ntouch prep.done '#prep.log.1#'\n";
const PROD: &str = "touch prod.done\n";

fn config(root: &Path, inputs: &[&str], creates: &str, clean_backups: bool) -> CampaignConfig {
    fs::write(root.join("prep.sh"), PREP).expect("temp dir is writable");
    fs::write(root.join("prod.sh"), PROD).expect("temp dir is writable");

    let paths = inputs
        .iter()
        .map(|input| format!("\"{}\"", root.join(input).display()))
        .collect::<Vec<_>>()
        .join(", ");

    serde_yaml::from_str(&format!(
        r#"
executor:
  cpu_per_node: 2
  tasks_per_node: 2
  local_workers: threads
environment:
  search_path: false
inputs:
  paths: [{paths}]
stages:
  - name: prep
    script: /bin/sh
    params: ["{root}/prep.sh"]
    creates: [{creates}]
  - name: prod
    script: /bin/sh
    params: ["{root}/prod.sh"]
    tasks_per_node: 1
clean_backups: {clean_backups}
"#,
        root = root.display(),
    ))
    .expect("config is valid")
}

fn work_dirs(root: &Path) {
    for run in ["run1", "run2"] {
        fs::create_dir(root.join(run)).expect("temp dir is writable");
    }
    fs::write(root.join("run2/fail"), "").expect("temp dir is writable");
}

#[test]
pub fn survivors_feed_the_next_stage() {
    let dir = tempfile::tempdir().expect("temp dir is available");
    work_dirs(dir.path());
    let config = config(dir.path(), &["run1", "run2", "missing"], "", true);

    let summaries = Campaign::new(config, Environment::default())
        .run()
        .expect("campaign succeeds");

    assert_eq!(
        summaries,
        vec![
            StageSummary {
                stage: String::from("prep"),
                succeeded: 1,
                reused: 0,
                skipped: 1,
                failed: 1,
                errors: 0,
            },
            StageSummary {
                stage: String::from("prod"),
                succeeded: 1,
                ..StageSummary::default()
            },
        ]
    );

    let run1 = dir.path().join("run1");
    assert!(run1.join("prep.done").is_file());
    assert!(run1.join("prod.done").is_file());
    assert!(run1.join("prep.log").is_file());
    assert!(!run1.join("#prep.log.1#").exists());
    assert!(!dir.path().join("run2/prod.done").exists());
}

#[test]
pub fn checkpoints_are_reused() {
    let dir = tempfile::tempdir().expect("temp dir is available");
    work_dirs(dir.path());
    fs::write(dir.path().join("run2/prep.done"), "").expect("temp dir is writable");
    let config = config(dir.path(), &["run1", "run2"], "prep.done", false);

    let summaries = Campaign::new(config, Environment::default())
        .run()
        .expect("campaign succeeds");

    assert_eq!(summaries[0].succeeded, 2);
    assert_eq!(summaries[0].reused, 1);
    assert_eq!(summaries[1].succeeded, 2);
    assert!(dir.path().join("run1/#prep.log.1#").is_file());
    assert!(dir.path().join("run2/prod.done").is_file());
}

#[test]
pub fn campaign_stops_without_survivors() {
    let dir = tempfile::tempdir().expect("temp dir is available");
    work_dirs(dir.path());
    let config = config(dir.path(), &["run2", "missing"], "", true);

    match Campaign::new(config, Environment::default()).run() {
        Err(CampaignError::NoSurvivors(stage)) => assert_eq!(stage, "prep"),
        other => panic!("expected no survivors, got {other:?}"),
    }
}

#[test]
pub fn single_stage_on_explicit_inputs() {
    let dir = tempfile::tempdir().expect("temp dir is available");
    work_dirs(dir.path());
    let config = config(dir.path(), &["run1"], "", true);
    let stage = config.stages[1].clone();
    let campaign = Campaign::new(config, Environment::default());

    let (summary, passed) = campaign
        .run_stage(&stage, vec![dir.path().join("run1"), dir.path().join("run2")])
        .expect("stage runs");

    assert_eq!(summary.succeeded, 2);
    assert_eq!(passed.len(), 2);
}
