use crate::{environment::Environment, executors::JobId, task::Outcome};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::io::{self, BufRead, Write};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Failed to read or write a message: {0}")]
    Io(#[from] io::Error),
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to build worker thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Unexpected message: {0}")]
    Unexpected(String),
}

/// coordinator -> worker
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Setup {
        env: Environment,
    },
    Run {
        id: JobId,
        task: String,
        kwargs: Value,
        arg: Value,
    },
    Shutdown,
}

/// worker -> coordinator
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ready {
        hostname: String,
        pid: u32,
        threads: usize,
    },
    Done {
        id: JobId,
        outcome: Outcome<Value>,
    },
}

/// write a single message as one line and flush it
pub fn write_message<W: Write, M: Serialize>(output: &mut W, message: &M) -> Result<(), ProtocolError> {
    serde_json::to_writer(&mut *output, message)?;
    output.write_all(b"\n")?;
    output.flush()?;

    Ok(())
}

/// read the next message, `None` once the input is closed
/// blank lines are skipped
pub fn read_message<R: BufRead, M: DeserializeOwned>(input: &mut R) -> Result<Option<M>, ProtocolError> {
    let mut line = String::new();

    loop {
        line.clear();

        if input.read_line(&mut line)? == 0 {
            return Ok(None);
        }

        if !line.trim().is_empty() {
            return Ok(Some(serde_json::from_str(line.trim_end())?));
        }
    }
}
