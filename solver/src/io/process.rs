//! Bounded subprocess execution (the execution gateway).
//!
//! Programs are always spawned with an argument vector, never through a shell.
//! Each child leads its own process group so that a timeout or a session
//! cancellation kills everything it started, not just the direct child.

use std::io;
use std::path::Path;
use std::process::{Command as StdCommand, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::types::ExecutionResult;

/// Grace period for both pipe readers after the process group was killed.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Bytes read from one pipe so far. Shared with the reader task so a reader
/// abandoned after the grace period still yields what it captured.
#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: usize,
}

type SharedCapture = Arc<Mutex<Captured>>;

/// Per-call resource limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub timeout: Duration,
    /// Bytes kept per stream; the excess is drained and discarded.
    pub output_limit_bytes: usize,
}

enum Outcome {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

/// Run `program` with `args` inside `cwd`.
///
/// Non-zero exits, timeouts and cancellation are reported in the returned
/// [`ExecutionResult`]. `Err` is reserved for failing to start the program or
/// losing track of it.
#[instrument(skip_all, fields(program, timeout_ms = limits.timeout.as_millis() as u64))]
pub async fn execute(
    program: &str,
    args: &[String],
    stdin: Option<&str>,
    cwd: &Path,
    limits: Limits,
    cancel: &CancellationToken,
) -> Result<ExecutionResult> {
    let started = Instant::now();
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    debug!(args = args.len(), cwd = %cwd.display(), "spawning child process");
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            error!(err = %err, program, "failed to spawn command");
            return Err(err).with_context(|| format!("spawn {program}"));
        }
    };
    let pid = child.id();

    let stdin_task = match (stdin, child.stdin.take()) {
        (Some(input), Some(mut pipe)) => {
            let input = input.as_bytes().to_vec();
            Some(tokio::spawn(async move {
                // The child may exit without reading; a broken pipe is not an error here.
                if let Err(err) = pipe.write_all(&input).await
                    && err.kind() != io::ErrorKind::BrokenPipe
                {
                    warn!(err = %err, "failed to write stdin");
                }
            }))
        }
        _ => None,
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let limit = limits.output_limit_bytes;
    let stdout_capture = SharedCapture::default();
    let stderr_capture = SharedCapture::default();
    let readers = [
        tokio::spawn(read_stream_limited(stdout, limit, Arc::clone(&stdout_capture))),
        tokio::spawn(read_stream_limited(stderr, limit, Arc::clone(&stderr_capture))),
    ];

    let outcome = tokio::select! {
        status = child.wait() => Outcome::Exited(status.context("wait for command")?),
        () = tokio::time::sleep(limits.timeout) => Outcome::TimedOut,
        () = cancel.cancelled() => Outcome::Cancelled,
    };

    let (status, timed_out, cancelled) = match outcome {
        Outcome::Exited(status) => (status, false, false),
        Outcome::TimedOut | Outcome::Cancelled => {
            let timed_out = matches!(outcome, Outcome::TimedOut);
            warn!(timed_out, "terminating child process group");
            if let Err(err) = child.start_kill()
                && err.kind() != io::ErrorKind::InvalidInput
            {
                warn!(err = %err, "kill child");
            }
            let status = child.wait().await.context("wait command after kill")?;
            (status, timed_out, !timed_out)
        }
    };
    // Descendants left behind by a child that exited on its own would keep
    // the pipes open and outlive the step.
    if let Some(pid) = pid {
        kill_process_group(pid);
    }

    if let Some(task) = stdin_task {
        task.abort();
    }
    join_readers(readers, READER_GRACE).await;
    let stdout = take_capture(&stdout_capture);
    let stderr = take_capture(&stderr_capture);
    if stdout.truncated > 0 || stderr.truncated > 0 {
        warn!(
            stdout_truncated = stdout.truncated,
            stderr_truncated = stderr.truncated,
            "output truncated"
        );
    }

    let duration_ms = started.elapsed().as_millis() as u64;
    debug!(exit_code = ?status.code(), timed_out, cancelled, duration_ms, "command finished");
    Ok(ExecutionResult {
        exit_code: if timed_out || cancelled {
            None
        } else {
            status.code()
        },
        stdout: String::from_utf8_lossy(&stdout.bytes).into_owned(),
        stderr: String::from_utf8_lossy(&stderr.bytes).into_owned(),
        duration_ms,
        truncated: stdout.truncated > 0 || stderr.truncated > 0,
        timed_out,
        cancelled,
    })
}

/// True when `err` comes from the program not existing.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<io::Error>()
            .is_some_and(|io_err| io_err.kind() == io::ErrorKind::NotFound)
    })
}

/// Check that `program --version` starts and exits successfully.
///
/// Blocking; call from `spawn_blocking`.
pub fn probe_program(program: &str, timeout: Duration) -> Result<(), String> {
    let mut child = StdCommand::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|err| format!("{program}: {err}"))?;
    match child.wait_timeout(timeout) {
        Ok(Some(status)) if status.success() => Ok(()),
        Ok(Some(status)) => Err(format!("{program} --version exited with {status}")),
        Ok(None) => {
            let _ = child.kill();
            let _ = child.wait();
            Err(format!("{program} --version timed out"))
        }
        Err(err) => Err(format!("{program}: wait failed: {err}")),
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn kill_process_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: killpg only sends a signal. The child was spawned with
    // `process_group(0)`, so its pid is the id of a group we created.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(err = %io::Error::last_os_error(), "killpg");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

/// Wait for both readers under one shared grace period, then abandon them.
async fn join_readers(readers: [JoinHandle<io::Result<()>>; 2], grace: Duration) {
    let aborts: Vec<_> = readers.iter().map(JoinHandle::abort_handle).collect();
    let joined = tokio::time::timeout(grace, async {
        for reader in readers {
            match reader.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(err = %err, "read output"),
                Err(err) => warn!(err = %err, "output reader task failed"),
            }
        }
    })
    .await;
    if joined.is_err() {
        warn!("output pipes still open after the process group was killed");
        for abort in aborts {
            abort.abort();
        }
    }
}

fn take_capture(capture: &SharedCapture) -> Captured {
    std::mem::take(&mut *capture.lock().unwrap_or_else(PoisonError::into_inner))
}

async fn read_stream_limited<R: AsyncRead + Unpin>(
    mut reader: R,
    limit: usize,
    capture: SharedCapture,
) -> io::Result<()> {
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let mut captured = capture.lock().unwrap_or_else(PoisonError::into_inner);
        let keep = n.min(limit.saturating_sub(captured.bytes.len()));
        captured.bytes.extend_from_slice(&chunk[..keep]);
        captured.truncated += n - keep;
    }

    Ok(())
}
