//! External command execution with a wall-clock timeout.

use std::io::Read;
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::HandlerFailure;
use crate::host::{CommandOutput, CommandSpec};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Run `spec` to completion, killing it once its timeout (or `default_timeout`)
/// expires. Output pipes are drained on background threads so a chatty child
/// cannot block on a full pipe.
pub fn run(spec: &CommandSpec, default_timeout: Duration) -> Result<CommandOutput, HandlerFailure> {
    let timeout = spec.timeout.unwrap_or(default_timeout);

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = &spec.cwd {
        cmd.current_dir(dir);
    }

    debug!(command = %spec, timeout_secs = timeout.as_secs(), "spawning");
    let mut child = cmd.spawn().map_err(|e| {
        HandlerFailure::Io(std::io::Error::new(
            e.kind(),
            format!("cannot run {}: {e}", spec.program),
        ))
    })?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if started.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            warn!(command = %spec, "command timed out");
            return Err(HandlerFailure::Timeout {
                command: spec.to_string(),
                after: timeout,
            });
        }
        thread::sleep(POLL_INTERVAL);
    };

    let output = CommandOutput {
        code: status.code(),
        stdout: collect(stdout),
        stderr: collect(stderr),
    };
    debug!(command = %spec, code = ?output.code, "finished");
    Ok(output)
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn collect(handle: JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}
