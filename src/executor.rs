// SPDX-License-Identifier: AGPL-3.0-or-later
//! External process execution
//!
//! Every side effect that leaves this process (package manager, key tool,
//! version control, build tool, sysctl, service manager) goes through the
//! [`Executor`] trait so the provisioning sequence can be driven against a
//! scripted implementation in tests.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

/// A single external command invocation
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    /// Program to run
    pub program: String,
    /// Arguments
    pub args: Vec<String>,
    /// Data written to the child's stdin
    pub stdin: Option<String>,
    /// Working directory
    pub cwd: Option<PathBuf>,
    /// Extra environment variables
    pub env: HashMap<String, String>,
    /// Overrides the executor's default timeout
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
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

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Display for CommandSpec {
    /// Program and arguments; stdin is never shown since it may carry a secret.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Handle to a process left running in the background
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: u32,
    pub program: String,
}

/// Narrow capability over the host's external tools
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run a command to completion and capture its output.
    ///
    /// `Err` means the command could not be run at all (missing binary,
    /// timeout); a non-zero exit is reported through [`CommandOutput::status`].
    async fn run(&self, command: &CommandSpec) -> io::Result<CommandOutput>;

    /// Start a command in the background without waiting for it.
    async fn spawn_detached(&self, command: &CommandSpec) -> io::Result<ProcessHandle>;

    /// Whether the current process runs with root privileges
    fn is_privileged(&self) -> bool;
}

/// Run a command and require a zero exit status.
///
/// Returns stdout on success and a one-line failure description otherwise,
/// which callers wrap in the error variant of their own step.
pub async fn run_checked<E>(executor: &E, command: &CommandSpec) -> Result<String, String>
where
    E: Executor + ?Sized,
{
    debug!(command = %command, "Running command");

    match executor.run(command).await {
        Ok(output) if output.success() => Ok(output.stdout),
        Ok(output) => {
            let status = output
                .status
                .map(|code| code.to_string())
                .unwrap_or_else(|| "signal".to_string());
            Err(format!(
                "`{}` exited with status {}: {}",
                command,
                status,
                output.stderr.trim()
            ))
        }
        Err(e) => Err(format!("`{}` could not be run: {}", command, e)),
    }
}

/// Executor backed by the real host
pub struct SystemExecutor {
    /// Upper bound on `run` calls that set no timeout of their own
    timeout: Duration,
}

impl SystemExecutor {
    /// Create a new executor
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Executor for SystemExecutor {
    async fn run(&self, spec: &CommandSpec) -> io::Result<CommandOutput> {
        let mut command = Command::new(&spec.program);
        command.args(&spec.args);

        if let Some(dir) = &spec.cwd {
            command.current_dir(dir);
        }

        for (key, value) in &spec.env {
            command.env(key, value);
        }

        command.stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.kill_on_drop(true);

        let mut child = command.spawn()?;

        if let Some(input) = &spec.stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes()).await?;
                // dropping the pipe closes it so the child sees EOF
            }
        }

        let limit = spec.timeout.unwrap_or(self.timeout);
        match timeout(limit, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                status: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("timed out after {:?}", limit),
            )),
        }
    }

    async fn spawn_detached(&self, spec: &CommandSpec) -> io::Result<ProcessHandle> {
        let mut command = std::process::Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        if let Some(dir) = &spec.cwd {
            command.current_dir(dir);
        }

        for (key, value) in &spec.env {
            command.env(key, value);
        }

        #[cfg(unix)]
        {
            // own process group: the daemon must outlive a Ctrl+C on this run
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let child = command.spawn()?;

        Ok(ProcessHandle {
            pid: child.id(),
            program: spec.program.clone(),
        })
    }

    fn is_privileged(&self) -> bool {
        nix::unistd::geteuid().is_root()
    }
}
