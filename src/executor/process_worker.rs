//! Child side of the process pool: the job registry and the stdin/stdout
//! frame loop that [`worker_main`](crate::executor::process_pool::worker_main)
//! runs inside a worker process.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};

use super::task::panic_message;

/// A named job body. Payload and result cross the process boundary as JSON,
/// errors as plain messages.
pub type JobFn = fn(Value) -> std::result::Result<Value, String>;

static REGISTRY: Lazy<RwLock<HashMap<String, JobFn>>> = Lazy::new(|| {
    let mut jobs: HashMap<String, JobFn> = HashMap::new();
    jobs.insert(ECHO_JOB.to_string(), echo_job);
    jobs.insert(RUN_COMMAND_JOB.to_string(), run_command_job);
    RwLock::new(jobs)
});

/// Built-in diagnostic job: returns its payload unchanged.
pub const ECHO_JOB: &str = "strand.echo";

/// Built-in job wrapping [`crate::subprocess::run`].
pub const RUN_COMMAND_JOB: &str = "strand.run_command";

fn echo_job(payload: Value) -> std::result::Result<Value, String> {
    Ok(payload)
}

#[derive(Debug, Serialize, Deserialize)]
struct RunCommandPayload {
    command: String,
    #[serde(default)]
    args: Vec<String>,
}

fn run_command_job(payload: Value) -> std::result::Result<Value, String> {
    let request: RunCommandPayload =
        serde_json::from_value(payload).map_err(|e| e.to_string())?;
    let output =
        crate::subprocess::run(&request.command, &request.args).map_err(|e| e.to_string())?;
    serde_json::to_value(output).map_err(|e| e.to_string())
}

/// Register a job under `name` for this process. Both the submitting
/// process and the worker program must agree on the name; only the worker
/// needs the body.
pub fn register_job<S: Into<String>>(name: S, job: JobFn) {
    REGISTRY.write().insert(name.into(), job);
}

pub fn is_registered(name: &str) -> bool {
    REGISTRY.read().contains_key(name)
}

/// Run a registered job in the current process. Used by worker processes
/// and by the chain's single-threaded execution mode.
pub(crate) fn run_local(name: &str, payload: Value) -> WireOutcome {
    let job = match REGISTRY.read().get(name) {
        Some(job) => *job,
        None => return WireOutcome::UnknownJob(name.to_string()),
    };
    match catch_unwind(AssertUnwindSafe(|| job(payload))) {
        Ok(Ok(value)) => WireOutcome::Ok(value),
        Ok(Err(msg)) => WireOutcome::Err(msg),
        Err(panic) => WireOutcome::Panic(panic_message(panic)),
    }
}

#[derive(Debug)]
pub(crate) enum WireOutcome {
    Ok(Value),
    Err(String),
    UnknownJob(String),
    Panic(String),
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct JobRequest {
    pub id: u64,
    pub job: String,
    pub payload: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct JobResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<WireError>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WireError {
    pub kind: String,
    pub message: String,
}

impl JobResponse {
    fn from_outcome(id: u64, outcome: WireOutcome) -> Self {
        match outcome {
            WireOutcome::Ok(value) => JobResponse {
                id,
                ok: Some(value),
                err: None,
            },
            WireOutcome::Err(message) => JobResponse {
                id,
                ok: None,
                err: Some(WireError {
                    kind: "work".to_string(),
                    message,
                }),
            },
            WireOutcome::UnknownJob(name) => JobResponse {
                id,
                ok: None,
                err: Some(WireError {
                    kind: "unknown_job".to_string(),
                    message: name,
                }),
            },
            WireOutcome::Panic(message) => JobResponse {
                id,
                ok: None,
                err: Some(WireError {
                    kind: "panic".to_string(),
                    message,
                }),
            },
        }
    }
}

/// Serve newline-delimited JSON job frames from stdin until EOF.
pub(crate) fn serve<R: BufRead, W: Write>(input: R, mut output: W) -> std::io::Result<()> {
    for line in input.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let request: JobRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                tracing::error!(error = %e, "malformed job frame, exiting");
                return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e));
            }
        };
        let response =
            JobResponse::from_outcome(request.id, run_local(&request.job, request.payload));
        let frame = serde_json::to_string(&response)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        output.write_all(frame.as_bytes())?;
        output.write_all(b"\n")?;
        output.flush()?;
    }
    Ok(())
}
