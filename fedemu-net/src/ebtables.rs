//! Atomic ebtables updates.
//!
//! The kernel ebtables table can only be replaced as a whole without races, so every
//! change goes through the atomic file: save the live table, apply the queued commands to
//! the file, then commit the file back to the kernel.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use crate::command::{self, CommandRunner};

pub const EBTABLES_BIN: &str = "ebtables";

pub type Result<T> = std::result::Result<T, command::Error>;

/// Target of a forwarding rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
}

impl Verdict {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "ACCEPT",
            Self::Drop => "DROP",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single ebtables invocation, without the binary and the atomic file arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleCommand(Vec<String>);

impl RuleCommand {
    /// Flush every rule in `chain`.
    pub fn flush(chain: &str) -> Self {
        Self(vec!["-F".into(), chain.into()])
    }

    /// Append a rule for frames entering on `input` and leaving on `output`.
    pub fn append(chain: &str, input: &str, output: &str, verdict: Verdict) -> Self {
        Self(vec![
            "-A".into(),
            chain.into(),
            "-i".into(),
            input.into(),
            "-o".into(),
            output.into(),
            "-j".into(),
            verdict.as_str().into(),
        ])
    }

    /// The rule pair covering both directions between `a` and `b`.
    pub fn append_pair(chain: &str, a: &str, b: &str, verdict: Verdict) -> [Self; 2] {
        [Self::append(chain, a, b, verdict), Self::append(chain, b, a, verdict)]
    }

    pub fn args(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for RuleCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

/// Applies batches of [`RuleCommand`]s through an ebtables atomic file.
#[derive(Debug)]
pub struct AtomicTable<R> {
    runner: R,
    atomic_file: PathBuf,
}

impl<R: CommandRunner> AtomicTable<R> {
    pub fn new(runner: R, atomic_file: impl Into<PathBuf>) -> Self {
        Self { runner, atomic_file: atomic_file.into() }
    }

    pub fn atomic_file(&self) -> &Path {
        &self.atomic_file
    }

    fn atomic(&self, cmd: &[String]) -> Vec<String> {
        let mut args = vec!["--atomic-file".to_owned(), self.atomic_file.display().to_string()];
        args.extend_from_slice(cmd);
        args
    }

    /// Snapshot the kernel table, apply `commands` to the snapshot and commit it.
    pub fn commit(&self, commands: &[RuleCommand]) -> Result<()> {
        let _span =
            tracing::debug_span!("ebtables_commit", file = %self.atomic_file.display()).entered();

        self.runner.run(EBTABLES_BIN, &self.atomic(&["--atomic-save".into()]))?;
        for cmd in commands {
            self.runner.run(EBTABLES_BIN, &self.atomic(cmd.args()))?;
        }
        self.runner.run(EBTABLES_BIN, &self.atomic(&["--atomic-commit".into()]))?;

        if let Err(e) = std::fs::remove_file(&self.atomic_file) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(?e, file = %self.atomic_file.display(), "error removing atomic file");
            }
        }

        tracing::debug!(commands = commands.len(), "committed ebtables rules");
        Ok(())
    }
}
