use super::{
    protocol::{read_message, write_message, ProtocolError, Request, Response},
    util::HOSTNAME,
};
use crate::task::{TaskRegistry, WorkerContext};
use rayon::ThreadPoolBuilder;
use std::{
    io::{BufRead, Write},
    process,
};
use tracing::{debug, info, warn};

/// Serve units for a coordinator until it says `shutdown` or closes `input`
///
/// Returns the number of units processed.
pub fn serve<R: BufRead, W: Write>(
    registry: &TaskRegistry,
    slot: usize,
    threads: usize,
    mut input: R,
    mut output: W,
) -> Result<usize, ProtocolError> {
    let env = match read_message::<_, Request>(&mut input)? {
        Some(Request::Setup { env }) => env,
        Some(other) => {
            return Err(ProtocolError::Unexpected(format!(
                "expected setup, got {other:?}"
            )))
        }
        None => {
            return Err(ProtocolError::Unexpected(String::from(
                "input closed before setup",
            )))
        }
    };

    let pool = ThreadPoolBuilder::new().num_threads(threads).build()?;
    let context = WorkerContext {
        slot,
        hostname: HOSTNAME.clone(),
        threads,
        env,
    };

    write_message(
        &mut output,
        &Response::Ready {
            hostname: context.hostname.clone(),
            pid: process::id(),
            threads,
        },
    )?;
    info!(slot = slot, threads = threads, "Worker ready, tasks: {registry:?}");

    let mut processed = 0;

    while let Some(request) = read_message::<_, Request>(&mut input)? {
        match request {
            Request::Run {
                id,
                task,
                kwargs,
                arg,
            } => {
                debug!(job = id, task = %task, "Running unit");

                let outcome = pool.install(|| registry.run(&task, kwargs, arg, &context));
                write_message(&mut output, &Response::Done { id, outcome })?;

                processed += 1;
            }
            Request::Shutdown => break,
            Request::Setup { .. } => warn!("Ignoring repeated setup"),
        }
    }

    info!(slot = slot, "Worker done after {processed} units");

    Ok(processed)
}
