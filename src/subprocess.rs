//! External command execution as ordinary units of work.
//!
//! A thin I/O wrapper, not part of the scheduling core: a command run is
//! just a callable that produces a [`CommandOutput`] or an error, and can
//! therefore be submitted to any pool like any other work item. It is also
//! registered as the built-in process-pool job
//! [`RUN_COMMAND_JOB`](crate::executor::process_pool::RUN_COMMAND_JOB).

use crate::error::{Error, Result};
use crate::executor::{TaskHandle, ThreadPool};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};

/// Captured result of one finished command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Process exit code; -1 when the process was killed by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run `command` to completion, capturing stdout and stderr.
pub fn run<S: AsRef<str>>(command: &str, args: &[S]) -> Result<CommandOutput> {
    let output = Command::new(command)
        .args(args.iter().map(|a| a.as_ref()))
        .stdin(Stdio::null())
        .output()?;

    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run `command`, invoking `on_stdout` / `on_stderr` for every output line
/// as it is produced, and return the exit code. The two streams are drained
/// concurrently so neither can stall the other.
pub fn run_streaming<S, FO, FE>(
    command: &str,
    args: &[S],
    on_stdout: FO,
    on_stderr: FE,
) -> Result<i32>
where
    S: AsRef<str>,
    FO: FnMut(&str) + Send,
    FE: FnMut(&str) + Send,
{
    let mut child = Command::new(command)
        .args(args.iter().map(|a| a.as_ref()))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::protocol("child stdout unavailable"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::protocol("child stderr unavailable"))?;

    let status = std::thread::scope(|scope| -> Result<std::process::ExitStatus> {
        let out = scope.spawn(move || feed_lines(stdout, on_stdout));
        let err = scope.spawn(move || feed_lines(stderr, on_stderr));
        let status = child.wait();
        let out = out.join().expect("stdout reader panicked");
        let err = err.join().expect("stderr reader panicked");
        out?;
        err?;
        Ok(status?)
    })?;

    Ok(status.code().unwrap_or(-1))
}

fn feed_lines<R: std::io::Read, F: FnMut(&str)>(stream: R, mut callback: F) -> Result<()> {
    for line in BufReader::new(stream).lines() {
        callback(&line?);
    }
    Ok(())
}

/// Submit a command run to `pool` as a background unit of work.
pub fn spawn<S: AsRef<str>>(
    pool: &ThreadPool,
    command: &str,
    args: &[S],
) -> Result<TaskHandle<CommandOutput>> {
    let command = command.to_string();
    let args: Vec<String> = args.iter().map(|a| a.as_ref().to_string()).collect();
    pool.submit_fallible(move || run(&command, &args))
}
