pub mod protocol;
pub mod util;
pub mod worker;

/*
 * Worker process layout:
 * 1. The coordinator launches one `streamd worker` process per slot through the
 *    launcher (ssh by default), `tasks_per_node` slots on every node. Local
 *    process pools start the same workers directly, without the launcher
 * 2. Each worker receives the environment snapshot (`setup`) and answers with
 *    `ready`, only then the pool is handed to the scheduler
 * 3. Units travel as `run` messages, one in flight per worker, and come back as
 *    `done`
 * 4. stdout carries the protocol, stderr is forwarded into the coordinator log
 */
