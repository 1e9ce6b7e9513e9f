pub mod campaign;
pub mod collector;
pub mod config;
pub mod distributed;
pub mod environment;
pub mod executors;
pub mod report;
pub mod scheduler;
pub mod stage;
pub mod task;

use stage::ScriptTask;
use task::TaskRegistry;

/// every task a `streamd worker` process can run
pub fn registry() -> TaskRegistry {
    TaskRegistry::new().register::<ScriptTask>()
}
