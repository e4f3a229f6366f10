//! Deadline-bound execution of external commands.
//!
//! Monitoring plugins must never outlive their scheduler's patience, so the
//! child is polled against a deadline and killed once it passes.

use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

/// Captured output of a finished command.
#[derive(Debug)]
pub struct CommandOutput {
    /// Exit code, `None` if the child was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Wall-clock time the child ran for.
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("command did not finish within {} seconds and was killed", .timeout.as_secs())]
    TimedOut { timeout: Duration },
    #[error("failed to run command: {0}")]
    Io(#[from] std::io::Error),
}

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Runs the command with stdout/stderr captured, killing it if it has not
/// exited before the timeout elapses.
pub fn run_with_deadline(mut cmd: Command, timeout: Duration) -> Result<CommandOutput, ExecError> {
    let start = Instant::now();
    let deadline = start + timeout;

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("running {:?} with a {:?} deadline", cmd, timeout);

    let mut child = cmd.spawn()?;

    // The pipes are drained on separate threads so a chatty child cannot
    // block on a full pipe while we wait for it.
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();

    let stdout_handle = thread::spawn(move || read_pipe(stdout_pipe));
    let stderr_handle = thread::spawn(move || read_pipe(stderr_pipe));

    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }

        if Instant::now() >= deadline {
            trace!("deadline passed, killing child");
            let _ = child.kill();
            let _ = child.wait();
            return Err(ExecError::TimedOut { timeout });
        }

        thread::sleep(POLL_INTERVAL);
    };

    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();

    Ok(CommandOutput {
        exit_code: status.code(),
        stdout,
        stderr,
        duration: start.elapsed(),
    })
}

fn read_pipe(pipe: Option<impl Read>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf);
    }
    String::from_utf8_lossy(&buf).into_owned()
}
