//! Utilies for [`std::process::Command`].

use std::{fmt, io, process, sync::Arc};

use parking_lot::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("empty commmand provided")]
    Empty,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("non-zero exit status: {}", .0.stderr.trim())]
    NonZero(Output),
}

#[derive(Debug, Clone)]
pub struct Output {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    /// A successful, empty output.
    pub fn success() -> Self {
        Self { status: Some(0), stdout: String::new(), stderr: String::new() }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.status == Some(0)
    }
}

impl From<process::Output> for Output {
    fn from(value: process::Output) -> Self {
        Self {
            status: value.status.code(),
            stdout: String::from_utf8_lossy(&value.stdout).to_string(),
            stderr: String::from_utf8_lossy(&value.stderr).to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Something able to run a program with arguments to completion.
///
/// Everything in this crate shells out through a runner, so callers can swap the system
/// runner for a [`Recorder`] when they want a dry run.
pub trait CommandRunner: Send + Sync + fmt::Debug {
    fn run(&self, program: &str, args: &[String]) -> Result<Output>;

    /// Runs the command provided as a string, separating args with whitespaces.
    fn run_str(&self, cmd: &str) -> Result<Output> {
        let mut iter = cmd.split_ascii_whitespace();
        let program = iter.next().ok_or(Error::Empty)?;
        let args: Vec<String> = iter.map(str::to_owned).collect();
        self.run(program, &args)
    }
}

impl<R: CommandRunner + ?Sized> CommandRunner for Arc<R> {
    fn run(&self, program: &str, args: &[String]) -> Result<Output> {
        (**self).run(program, args)
    }
}

/// Runs commands on the host, optionally prefixed with `sudo`.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    sudo: bool,
}

impl SystemRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefix every command with `sudo`.
    pub fn with_sudo(mut self) -> Self {
        self.sudo = true;
        self
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<Output> {
        let mut cmd = if self.sudo {
            let mut cmd = process::Command::new("sudo");
            cmd.arg(program);
            cmd
        } else {
            process::Command::new(program)
        };
        cmd.args(args).stderr(process::Stdio::piped()).stdout(process::Stdio::piped());

        tracing::debug!(?cmd, "running command");

        let output: Output = cmd.spawn()?.wait_with_output()?.into();

        if !output.is_success() {
            tracing::debug!(?output.stderr, ?output.status, ?cmd, "command returned non-zero status");
            return Err(Error::NonZero(output));
        }

        Ok(output)
    }
}

/// A dry-run runner: records every command line instead of executing it.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    commands: Arc<Mutex<Vec<String>>>,
    fail_on: Arc<Mutex<Option<String>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every command line containing `pattern` fail with a non-zero status.
    pub fn fail_on(&self, pattern: impl Into<String>) {
        *self.fail_on.lock() = Some(pattern.into());
    }

    /// The recorded command lines, in execution order.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    pub fn clear(&self) {
        self.commands.lock().clear();
    }
}

impl CommandRunner for Recorder {
    fn run(&self, program: &str, args: &[String]) -> Result<Output> {
        let line = std::iter::once(program)
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");

        tracing::debug!(cmd = %line, "dry run");
        self.commands.lock().push(line.clone());

        if let Some(pattern) = self.fail_on.lock().as_deref() {
            if line.contains(pattern) {
                let output = Output { status: Some(1), stdout: String::new(), stderr: line };
                return Err(Error::NonZero(output));
            }
        }

        Ok(Output::success())
    }
}
