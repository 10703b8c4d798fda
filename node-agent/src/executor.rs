// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Local process execution for the agent.

use async_trait::async_trait;
use itertools::Itertools;
use slog::debug;
use slog::error;
use slog::info;
use slog::Logger;
use std::fmt;
use std::process::Stdio;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;

/// A command to run: program, arguments, extra environment and stdin.
///
/// This is a plain value (unlike [`tokio::process::Command`]) so that fake
/// executors can inspect it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<String>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Invocation { program: program.into(), ..Default::default() }
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

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Environment values and stdin may carry credentials; only the
        // command line is shown.
        write!(
            f,
            "{}",
            std::iter::once(self.program.as_str())
                .chain(self.args.iter().map(String::as_str))
                .map(|a| shell_words::quote(a))
                .join(" ")
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Output {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn success() -> Self {
        Output { status: Some(0), ..Default::default() }
    }

    pub fn with_stdout(stdout: impl Into<String>) -> Self {
        Output { stdout: stdout.into(), ..Output::success() }
    }

    pub fn failure(status: i32, stderr: impl Into<String>) -> Self {
        Output { status: Some(status), stderr: stderr.into(), ..Default::default() }
    }

    pub fn succeeded(&self) -> bool {
        self.status == Some(0)
    }
}

#[derive(Debug)]
pub struct CommandFailureInfo {
    pub command: String,
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl fmt::Display for CommandFailureInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Command [{}] executed and failed with status: ", self.command)?;
        match self.status {
            Some(code) => write!(f, "{code}")?,
            None => write!(f, "<signal>")?,
        }
        write!(f, "  stdout: {}", self.stdout.trim())?;
        write!(f, "  stderr: {}", self.stderr.trim())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ExecutionError {
    #[error("Failed to start execution of [{command}]: {err}")]
    ExecutionStart { command: String, err: std::io::Error },

    #[error("{0}")]
    CommandFailure(Box<CommandFailureInfo>),
}

fn log_input(log: &Logger, id: u64, invocation: &Invocation) {
    info!(log, "running command via executor"; "id" => id, "command" => %invocation);
}

fn log_output(log: &Logger, id: u64, output: &Output) {
    info!(
        log,
        "finished running command via executor";
        "id" => id,
        "result" => if output.succeeded() { "OK" } else { "ERROR" },
        "status" => output
            .status
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string()),
    );
    if !output.stdout.is_empty() {
        debug!(log, "finished command stdout"; "id" => id, "stdout" => &output.stdout);
    }
    if !output.stderr.is_empty() {
        debug!(log, "finished command stderr"; "id" => id, "stderr" => &output.stderr);
    }
}

fn output_to_exec_error(invocation: &Invocation, output: Output) -> ExecutionError {
    ExecutionError::CommandFailure(Box::new(CommandFailureInfo {
        command: invocation.to_string(),
        status: output.status,
        stdout: output.stdout,
        stderr: output.stderr,
    }))
}

/// Describes the commonly-used "safe-to-reference" type describing the
/// Executor as a trait object.
pub type BoxedExecutor = Arc<dyn Executor>;

/// Runs [`Invocation`]s and returns their output.
///
/// - In production, this is a [HostExecutor].
/// - Under test, a [FakeExecutor] answers from a handler.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Executes a command, waiting for it to complete. A non-zero exit is an
    /// error.
    async fn execute(
        &self,
        invocation: &Invocation,
    ) -> Result<Output, ExecutionError>;
}

pub struct HostExecutor {
    log: Logger,
    counter: AtomicU64,
}

impl HostExecutor {
    pub fn new(log: Logger) -> Arc<Self> {
        Arc::new(Self { log, counter: AtomicU64::new(0) })
    }

    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }
}

#[async_trait]
impl Executor for HostExecutor {
    async fn execute(
        &self,
        invocation: &Invocation,
    ) -> Result<Output, ExecutionError> {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        log_input(&self.log, id, invocation);

        let start_err = |err| {
            error!(self.log, "Could not start program!"; "id" => id);
            ExecutionError::ExecutionStart {
                command: invocation.to_string(),
                err,
            }
        };
        let mut command = tokio::process::Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k, v)))
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command.spawn().map_err(start_err)?;
        if let (Some(input), Some(mut pipe)) =
            (&invocation.stdin, child.stdin.take())
        {
            pipe.write_all(input.as_bytes()).await.map_err(start_err)?;
        }
        let raw = child.wait_with_output().await.map_err(start_err)?;
        let output = Output {
            status: raw.status.code(),
            stdout: String::from_utf8_lossy(&raw.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&raw.stderr).into_owned(),
        };
        log_output(&self.log, id, &output);
        if !output.succeeded() {
            return Err(output_to_exec_error(invocation, output));
        }
        Ok(output)
    }
}

/// Handler called for every invocation run through a [FakeExecutor].
pub type ExecuteFn = dyn FnMut(&Invocation) -> Output + Send;
pub type BoxedExecuteFn = Box<ExecuteFn>;

/// An executor which can expect certain inputs, and respond with specific
/// outputs.
pub struct FakeExecutor {
    log: Logger,
    counter: AtomicU64,
    handler: Mutex<BoxedExecuteFn>,
    history: Mutex<Vec<Invocation>>,
}

impl FakeExecutor {
    pub fn new(log: Logger) -> Arc<FakeExecutor> {
        Arc::new(FakeExecutor {
            log,
            counter: AtomicU64::new(0),
            handler: Mutex::new(Box::new(|_| Output::success())),
            history: Mutex::new(Vec::new()),
        })
    }

    /// Set the request handler to an arbitrary function.
    pub fn set_handler(&self, f: BoxedExecuteFn) {
        *self.handler.lock().unwrap() = f;
    }

    /// Every invocation seen so far, rendered as command lines.
    pub fn history(&self) -> Vec<String> {
        self.history.lock().unwrap().iter().map(|i| i.to_string()).collect()
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.history.lock().unwrap().clone()
    }

    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn execute(
        &self,
        invocation: &Invocation,
    ) -> Result<Output, ExecutionError> {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        log_input(&self.log, id, invocation);
        self.history.lock().unwrap().push(invocation.clone());
        let output = self.handler.lock().unwrap()(invocation);
        log_output(&self.log, id, &output);
        if !output.succeeded() {
            return Err(output_to_exec_error(invocation, output));
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::o;

    #[tokio::test]
    async fn host_executor_reports_failures_with_output() {
        let log = Logger::root(slog::Discard, o!());
        let executor = HostExecutor::new(log).as_executor();

        let output = executor
            .execute(&Invocation::new("sh").args(["-c", "echo hello"]))
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "hello");

        let output = executor
            .execute(&Invocation::new("cat").stdin("from stdin"))
            .await
            .unwrap();
        assert_eq!(output.stdout, "from stdin");

        let err = executor
            .execute(&Invocation::new("sh").args(["-c", "echo oops >&2; exit 3"]))
            .await
            .unwrap_err();
        match err {
            ExecutionError::CommandFailure(info) => {
                assert_eq!(info.status, Some(3));
                assert_eq!(info.stderr.trim(), "oops");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn display_quotes_arguments() {
        let invocation = Invocation::new("mysql")
            .args(["-e", "SELECT 1"])
            .env("MYSQL_PWD", "secret");
        let shown = invocation.to_string();
        assert_eq!(shown, "mysql -e 'SELECT 1'");
        assert!(!shown.contains("secret"));
    }
}
