//! External tool execution with timeouts
//!
//! This is the only place partjob spawns processes. Every invocation:
//!
//! - runs in its own process group (see `process_guard`)
//! - is registered with `ChildRegistry::global()` while alive
//! - is bounded by a timeout; a tool that overruns is killed, never retried
//! - has stdout and stderr captured for the operator-facing failure message

use crate::error::JobError;
use crate::process_guard::{kill_group, ChildRegistry, CommandProcessGroup};
use nix::sys::signal::Signal;
use std::fmt;
use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A fully described tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Written to the tool's stdin, which is then closed
    pub stdin: Option<String>,
    pub timeout: Duration,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured output of a tool that exited with status 0.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// stdout and stderr joined for display.
    pub fn combined(&self) -> String {
        join_output(&self.stdout, &self.stderr)
    }
}

/// Ways an external tool invocation can fail
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Command {command} failed to start: {details}")]
    FailedToStart { command: String, details: String },

    #[error("Command {command} crashed.\nOutput:\n{output}")]
    Crashed { command: String, output: String },

    #[error("Command {command} failed to finish in {seconds}s.\nOutput:\n{output}")]
    Timeout {
        command: String,
        seconds: u64,
        output: String,
    },

    #[error("Command {command} finished with exit code {code}.\nOutput:\n{output}")]
    ExitCode {
        command: String,
        code: i32,
        output: String,
    },
}

impl CommandError {
    /// Captured output, if the tool got far enough to produce any.
    pub fn output(&self) -> &str {
        match self {
            Self::FailedToStart { details, .. } => details,
            Self::Crashed { output, .. }
            | Self::Timeout { output, .. }
            | Self::ExitCode { output, .. } => output,
        }
    }

    /// Convert into a job failure.
    ///
    /// Timeouts always become `CommandTimeout`; every other failure is shaped
    /// by `otherwise`, which receives the full message as details.
    pub fn into_job_error(self, otherwise: impl FnOnce(String) -> JobError) -> JobError {
        match self {
            Self::Timeout {
                command,
                seconds,
                output,
            } => JobError::CommandTimeout {
                command,
                seconds,
                output,
            },
            other => otherwise(other.to_string()),
        }
    }
}

/// Run a tool to completion, or kill it when its timeout expires.
pub fn run_command(cmd: &ToolCommand) -> Result<CommandOutput, CommandError> {
    let shown = cmd.to_string();
    info!("run_command: {} (timeout {}s)", shown, cmd.timeout.as_secs());

    let mut command = Command::new(&cmd.program);
    command
        .args(&cmd.args)
        .stdin(if cmd.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .in_new_process_group();

    let mut child = command.spawn().map_err(|e| CommandError::FailedToStart {
        command: shown.clone(),
        details: e.to_string(),
    })?;
    let pid = child.id();

    if let Ok(mut registry) = ChildRegistry::global().lock() {
        registry.register(pid);
    }

    let result = supervise(&mut child, cmd, &shown);

    if let Ok(mut registry) = ChildRegistry::global().lock() {
        registry.unregister(pid);
    }
    result
}

fn supervise(
    child: &mut Child,
    cmd: &ToolCommand,
    shown: &str,
) -> Result<CommandOutput, CommandError> {
    if let (Some(input), Some(mut pipe)) = (cmd.stdin.as_ref(), child.stdin.take()) {
        // Dropping the pipe at the end of this block closes the tool's stdin
        if let Err(e) = pipe.write_all(input.as_bytes()) {
            warn!("Failed to write stdin of {}: {}", shown, e);
        }
    }

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let started = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) if started.elapsed() >= cmd.timeout => break None,
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                return Err(CommandError::FailedToStart {
                    command: shown.to_string(),
                    details: e.to_string(),
                });
            }
        }
    };

    let Some(status) = status else {
        warn!("{} exceeded {}s, killing process group", shown, cmd.timeout.as_secs());
        if let Err(e) = kill_group(child.id(), Signal::SIGKILL) {
            debug!("Group kill failed ({}), killing leader only", e);
            let _ = child.kill();
        }
        let _ = child.wait();
        return Err(CommandError::Timeout {
            command: shown.to_string(),
            seconds: cmd.timeout.as_secs(),
            output: join_output(&collect(stdout), &collect(stderr)),
        });
    };

    let stdout = collect(stdout);
    let stderr = collect(stderr);

    match status.code() {
        Some(0) => {
            debug!("{} succeeded", shown);
            Ok(CommandOutput { stdout, stderr })
        }
        Some(code) => {
            info!("{} failed with exit code {}", shown, code);
            Err(CommandError::ExitCode {
                command: shown.to_string(),
                code,
                output: join_output(&stdout, &stderr),
            })
        }
        None => Err(CommandError::Crashed {
            command: shown.to_string(),
            output: join_output(&stdout, &stderr),
        }),
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

fn join_output(stdout: &str, stderr: &str) -> String {
    match (stdout.trim(), stderr.trim()) {
        ("", err) => err.to_string(),
        (out, "") => out.to_string(),
        (out, err) => format!("{}\n{}", out, err),
    }
}
