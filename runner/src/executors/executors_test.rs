use super::{
    process::ProcessExecutor, Completion, ExecutorError, Executors, Isolation, LaunchConfig, PoolPlan,
    PoolSizing, Reply,
};
use crate::{
    environment::Environment,
    task::{Outcome, Task, WorkerContext},
};
use crossbeam_channel::{unbounded, Receiver};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

#[derive(Deserialize, Serialize)]
struct Square;

impl Task for Square {
    const NAME: &'static str = "square";

    type Arg = u64;
    type Output = u64;

    fn run(&self, arg: u64, _context: &WorkerContext) -> Outcome<u64> {
        if arg == 0 {
            panic!("zero is not allowed");
        }

        Outcome::Success(arg * arg)
    }
}

#[derive(Deserialize, Serialize)]
struct Budget;

impl Task for Budget {
    const NAME: &'static str = "threads";

    type Arg = ();
    type Output = (usize, usize, Option<String>);

    fn run(&self, _arg: (), context: &WorkerContext) -> Outcome<Self::Output> {
        Outcome::Success((
            context.threads,
            rayon::current_num_threads(),
            context.env.vars.get("STREAMD_TEST").cloned(),
        ))
    }
}

fn plan(nodes: &[&str], launcher: &[&str], tasks_per_node: usize, cpu_per_node: usize) -> PoolPlan {
    PoolPlan {
        sizing: PoolSizing {
            tasks_per_node,
            cpu_per_node,
        },
        nodes: nodes.iter().map(|node| node.to_string()).collect(),
        isolation: Isolation::Threads,
        launch: LaunchConfig {
            launcher: launcher.iter().map(|arg| arg.to_string()).collect(),
            worker_exec: PathBuf::from("/nonexistent/streamd"),
            ready_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
        },
    }
}

fn collect<O>(completions: &Receiver<Completion<O>>, count: usize) -> Vec<Completion<O>> {
    let mut received = (0..count)
        .map(|_| {
            completions
                .recv_timeout(Duration::from_secs(10))
                .expect("unit completes")
        })
        .collect::<Vec<_>>();
    received.sort_by_key(|completion| completion.id);

    received
}

#[test]
pub fn threads_per_worker() {
    let sizing = |tasks_per_node, cpu_per_node| PoolSizing {
        tasks_per_node,
        cpu_per_node,
    };

    assert_eq!(sizing(2, 8).threads_per_worker(), 4);
    assert_eq!(sizing(3, 8).threads_per_worker(), 3);
    assert_eq!(sizing(4, 2).threads_per_worker(), 1);
    assert_eq!(sizing(1, 0).threads_per_worker(), 1);
}

#[test]
pub fn local_pool_runs_units() {
    let mut pool = Executors::load(&plan(&[], &["ssh"], 2, 2), Environment::default())
        .expect("local pool starts");
    let task = Arc::new(Square);
    let (sender, completions) = unbounded();

    assert_eq!(pool.workers(), 2);

    for id in 0..4 {
        pool.submit(&task, id + 1, Reply::new(id, sender.clone()))
            .expect("pool accepts units");
    }

    let results = collect(&completions, 4)
        .into_iter()
        .map(|completion| completion.result.ok().and_then(Outcome::success))
        .collect::<Vec<_>>();
    assert_eq!(results, vec![Some(1), Some(4), Some(9), Some(16)]);

    pool.shutdown();
}

#[test]
pub fn local_pool_contains_panics() {
    let pool = Executors::load(&plan(&[], &["ssh"], 1, 1), Environment::default())
        .expect("local pool starts");
    let task = Arc::new(Square);
    let (sender, completions) = unbounded();

    pool.submit(&task, 0, Reply::new(0, sender.clone())).expect("pool accepts units");
    pool.submit(&task, 3, Reply::new(1, sender)).expect("pool accepts units");

    let results = collect(&completions, 2);
    assert!(matches!(
        &results[0].result,
        Ok(Outcome::Failed(reason)) if reason.contains("zero is not allowed")
    ));
    assert!(matches!(results[1].result, Ok(Outcome::Success(9))));
}

#[test]
pub fn local_pool_sizes_worker_threads() {
    let env = Environment {
        search_path: String::new(),
        vars: BTreeMap::from([("STREAMD_TEST".to_owned(), "forwarded".to_owned())]),
    };
    let pool = Executors::load(&plan(&[], &["ssh"], 2, 6), env).expect("local pool starts");
    let (sender, completions) = unbounded();

    pool.submit(&Arc::new(Budget), (), Reply::new(7, sender))
        .expect("pool accepts units");

    let completion = collect(&completions, 1).remove(0);
    assert_eq!(completion.id, 7);
    assert_eq!(
        completion.result.ok().and_then(Outcome::success),
        Some((3, 3, Some(String::from("forwarded"))))
    );
}

#[test]
pub fn shutdown_is_idempotent() {
    let mut pool = Executors::load(&plan(&[], &["ssh"], 1, 1), Environment::default())
        .expect("local pool starts");
    let (sender, _completions) = unbounded();

    pool.shutdown();
    pool.shutdown();

    assert_eq!(pool.workers(), 0);
    assert!(matches!(
        pool.submit(&Arc::new(Square), 2, Reply::new(0, sender)),
        Err(ExecutorError::Closed)
    ));
}

#[test]
pub fn dropped_reply_is_abandoned() {
    let (sender, completions) = unbounded::<Completion<u64>>();

    drop(Reply::new(3, sender.clone()));
    Reply::new(4, sender).send(Ok(Outcome::Success(1)));

    let results = collect(&completions, 2);
    assert!(matches!(results[0].result, Err(ExecutorError::Abandoned)));
    assert!(matches!(results[1].result, Ok(Outcome::Success(1))));
    assert!(completions.try_recv().is_err());
}

#[test]
pub fn local_process_pool_skips_the_launcher() {
    let mut local = plan(&[], &["/nonexistent/launcher"], 2, 2);
    local.isolation = Isolation::Processes;

    // the worker executable itself is missing, the launcher is never tried
    assert!(matches!(
        ProcessExecutor::load(&local, Environment::default()),
        Err(ExecutorError::Launch { .. })
    ));
    assert!(matches!(
        Executors::load(&local, Environment::default()),
        Err(ExecutorError::Launch { .. })
    ));
}

#[test]
pub fn remote_pool_empty_launcher() {
    assert!(matches!(
        Executors::load(&plan(&["localhost"], &[], 1, 1), Environment::default()),
        Err(ExecutorError::EmptyLauncher)
    ));
}

#[test]
pub fn remote_pool_unlaunchable() {
    assert!(matches!(
        Executors::load(
            &plan(&["localhost"], &["/nonexistent/launcher"], 1, 1),
            Environment::default()
        ),
        Err(ExecutorError::Launch { .. })
    ));
}

#[test]
pub fn remote_pool_worker_exits_before_ready() {
    // `false` ignores its arguments and exits right away
    assert!(matches!(
        Executors::load(&plan(&["localhost"], &["false"], 2, 1), Environment::default()),
        Err(ExecutorError::Exited { .. })
    ));
}
