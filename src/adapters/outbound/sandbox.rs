//! Sandboxed command execution.
//!
//! `DockerSandbox` runs every command in a fresh `--rm` container with the working
//! directory bind-mounted at `/workspace`. `HostSandbox` runs `sh -c` directly in the
//! working directory for machines without a container runtime.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
};
use tracing::{debug, warn};

use crate::core::{
    domain::LogSink,
    error::{Error, Result},
    ports::{CommandRunner, CommandSpec},
};

/// Exit status the container runtime reserves for its own failures.
const RUNTIME_FAILURE_EXIT: i32 = 125;

#[derive(Debug, Clone)]
pub struct DockerSandbox {
    runtime: String,
}

impl DockerSandbox {
    pub fn new(runtime: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
        }
    }
}

#[async_trait]
impl CommandRunner for DockerSandbox {
    async fn run(&self, spec: &CommandSpec, sink: &LogSink) -> Result<String> {
        let mut cmd = Command::new(&self.runtime);
        cmd.arg("run")
            .arg("--rm")
            .arg("-v")
            .arg(format!("{}:/workspace", spec.workdir.display()))
            .arg("-w")
            .arg("/workspace")
            .arg(&spec.image)
            .arg("bash")
            .arg("-lc")
            .arg(&spec.command);
        debug!(image = %spec.image, command = %spec.command, "starting container");

        match stream_process(cmd, &spec.command, sink).await {
            Err(Error::CommandFailed {
                exit_code: Some(RUNTIME_FAILURE_EXIT),
                ..
            }) => Err(Error::ProcessSpawnFailed(format!(
                "{} could not start image {}",
                self.runtime, spec.image
            ))),
            other => other,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HostSandbox;

impl HostSandbox {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for HostSandbox {
    async fn run(&self, spec: &CommandSpec, sink: &LogSink) -> Result<String> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&spec.command).current_dir(&spec.workdir);
        debug!(workdir = %spec.workdir.display(), command = %spec.command, "starting host command");
        stream_process(cmd, &spec.command, sink).await
    }
}

/// Spawns `cmd`, forwards each output line to `sink` and returns stdout on success.
///
/// Both pipes are drained to EOF. Bytes that are not UTF-8 are replaced, never fatal.
async fn stream_process(mut cmd: Command, command_line: &str, sink: &LogSink) -> Result<String> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| {
        warn!(command = %command_line, error = %e, "sandbox spawn failed");
        Error::ProcessSpawnFailed(e.to_string())
    })?;

    let stdout_handle = child.stdout.take();
    let stderr_handle = child.stderr.take();

    let stdout_task = async {
        let mut captured = String::new();
        if let Some(stdout) = stdout_handle {
            drain_lines(stdout, |line| {
                captured.push_str(&line);
                captured.push('\n');
                sink.stdout(line);
            })
            .await;
        }
        captured
    };

    let stderr_task = async {
        if let Some(stderr) = stderr_handle {
            drain_lines(stderr, |line| sink.stderr(line)).await;
        }
    };

    let (stdout, ()) = tokio::join!(stdout_task, stderr_task);

    let status = child
        .wait()
        .await
        .map_err(|e| {
            Error::ProcessSpawnFailed(format!("failed to wait for `{command_line}`: {e}"))
        })?;

    if status.success() {
        Ok(stdout)
    } else {
        debug!(command = %command_line, exit = ?status.code(), "command failed");
        Err(Error::CommandFailed {
            command: command_line.to_string(),
            exit_code: status.code(),
        })
    }
}

/// Reads `reader` to EOF, handing each newline-terminated line to `emit` with the
/// trailing `\n` (and `\r`) removed.
async fn drain_lines<R>(reader: R, mut emit: impl FnMut(String))
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                emit(String::from_utf8_lossy(&buf).into_owned());
            }
            Err(err) => {
                warn!(error = %err, "output pipe read failed");
                break;
            }
        }
    }
}
