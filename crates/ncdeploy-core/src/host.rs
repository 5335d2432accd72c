//! Side-effecting collaborators invoked by action handlers.
//!
//! The reconciliation core only ever talks to the machine through [`Host`].
//! Production uses `SystemHost`; tests use a scripted fake.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{HandlerFailure, HandlerResult};
use crate::types::{ServiceAction, Status};

// ---------------------------------------------------------------------------
// CommandSpec
// ---------------------------------------------------------------------------

/// An external command: program, arguments, working directory and timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// Argument values that must not appear in logs or error messages.
    #[serde(default, skip_serializing)]
    pub secrets: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            timeout: None,
            secrets: Vec::new(),
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

    /// Add an argument whose value is masked in [`fmt::Display`].
    pub fn secret_arg(mut self, arg: impl Into<String>) -> Self {
        let arg = arg.into();
        self.secrets.push(arg.clone());
        self.args.push(arg);
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Full argv, program first.
    pub fn argv(&self) -> Vec<&str> {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if self.secrets.contains(arg) {
                f.write_str(" ***")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CommandOutput
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// `None` when terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success() -> Self {
        Self {
            code: Some(0),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }

    /// Turn a non-zero exit into `HandlerFailure::CommandFailed`.
    pub fn check(self, spec: &CommandSpec) -> Result<Self, HandlerFailure> {
        if self.is_success() {
            return Ok(self);
        }
        let detail = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        Err(HandlerFailure::CommandFailed {
            command: spec.to_string(),
            code: self.code,
            output: detail.trim().chars().take(500).collect(),
        })
    }
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

/// Every side effect the deployment performs.
pub trait Host {
    /// Run an external command to completion (or its timeout).
    /// A non-zero exit is returned as output, not as an error.
    fn run(&mut self, command: &CommandSpec) -> Result<CommandOutput, HandlerFailure>;

    /// Recursive content copy of `from` into `to`, preserving attributes.
    fn copy_tree(&mut self, from: &Path, to: &Path) -> HandlerResult;

    /// Atomic rename within one filesystem.
    fn rename(&mut self, from: &Path, to: &Path) -> HandlerResult;

    fn symlink(&mut self, target: &Path, link: &Path) -> HandlerResult;

    fn chown_recursive(&mut self, path: &Path, user: &str, group: &str) -> HandlerResult;

    fn chmod(&mut self, path: &Path, mode: u32) -> HandlerResult;

    fn exists(&self, path: &Path) -> bool;

    /// Bytes used by the tree rooted at `path`.
    fn used_bytes(&self, path: &Path) -> Result<u64, HandlerFailure>;

    /// Bytes available on the filesystem holding `path`.
    fn free_bytes(&self, path: &Path) -> Result<u64, HandlerFailure>;

    fn service(&mut self, name: &str, action: ServiceAction) -> HandlerResult;

    fn open_port(&mut self, port: u16) -> HandlerResult;

    fn set_status(&mut self, status: &Status);

    fn set_application_version(&mut self, version: &str);

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Run `command` and fail on a non-zero exit.
pub fn run_checked(host: &mut dyn Host, command: &CommandSpec) -> Result<CommandOutput, HandlerFailure> {
    host.run(command)?.check(command)
}
