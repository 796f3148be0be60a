//! Subprocess execution seam.
//!
//! Every interaction with the operating system (`security`, `launchctl`,
//! `system_profiler`, ...) goes through a [`CommandRunner`] so that the
//! components above it can be exercised against a recording fake.

use std::fmt;
use std::process::Command;

use crate::error::{DeviceTrustError, Result};

/// Account a command should run as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunAs {
    /// Login name.
    pub name: String,
    /// Numeric user id.
    pub uid: u32,
}

#[derive(Clone, PartialEq, Eq)]
enum Arg {
    Plain(String),
    Secret(String),
}

impl Arg {
    fn value(&self) -> &str {
        match self {
            Arg::Plain(s) | Arg::Secret(s) => s,
        }
    }
}

/// A single subprocess invocation.
///
/// Secret arguments are passed to the program verbatim but rendered as
/// `****` by [`fmt::Display`] and [`fmt::Debug`].
#[derive(Clone, PartialEq, Eq)]
pub struct Invocation {
    program: String,
    args: Vec<Arg>,
    run_as: Option<RunAs>,
    quiet_output: bool,
}

impl Invocation {
    /// Start an invocation of `program`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            run_as: None,
            quiet_output: false,
        }
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(Arg::Plain(arg.into()));
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args
            .extend(args.into_iter().map(|a| Arg::Plain(a.into())));
        self
    }

    /// Append an argument that must never appear in logs.
    pub fn secret_arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(Arg::Secret(arg.as_ref().to_string()));
        self
    }

    /// Run in the context of the given user.
    pub fn as_user(mut self, run_as: RunAs) -> Self {
        self.run_as = Some(run_as);
        self
    }

    /// Do not log the captured output (it carries a secret).
    pub fn quiet_output(mut self) -> Self {
        self.quiet_output = true;
        self
    }

    /// Program name.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Argument values, secrets included.
    pub fn arg_values(&self) -> Vec<&str> {
        self.args.iter().map(Arg::value).collect()
    }

    /// Requested user context.
    pub fn run_as(&self) -> Option<&RunAs> {
        self.run_as.as_ref()
    }

    /// True if the invocation has the given argument.
    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a.value() == arg)
    }

    /// Full argv for execution.
    ///
    /// When `elevated` and a user context is requested, the command is
    /// wrapped in `launchctl asuser <uid> sudo -u <name>` so it runs in the
    /// user's login session.
    pub fn argv(&self, elevated: bool) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 6);
        if let (true, Some(user)) = (elevated, &self.run_as) {
            argv.extend([
                "launchctl".to_string(),
                "asuser".to_string(),
                user.uid.to_string(),
                "sudo".to_string(),
                "-u".to_string(),
                user.name.clone(),
            ]);
        }
        argv.push(self.program.clone());
        argv.extend(self.args.iter().map(|a| a.value().to_string()));
        argv
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            match arg {
                Arg::Plain(s) => write!(f, " {}", s)?,
                Arg::Secret(_) => f.write_str(" ****")?,
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invocation({})", self)
    }
}

/// Captured result of a finished subprocess.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit code, if the process exited normally.
    pub status: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// A successful result with the given stdout.
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed result with the given exit code and stderr.
    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// True if the process exited with status 0.
    pub fn is_success(&self) -> bool {
        self.status == Some(0)
    }

    /// Error message describing a failed run.
    pub fn describe_failure(&self) -> String {
        let detail = self.stderr.trim();
        match (self.status, detail.is_empty()) {
            (Some(code), true) => format!("exit status {}", code),
            (Some(code), false) => format!("exit status {}: {}", code, detail),
            (None, _) => "terminated by signal".to_string(),
        }
    }
}

/// Executes subprocesses synchronously.
pub trait CommandRunner: Send + Sync {
    /// Run the invocation to completion and capture its output.
    ///
    /// A non-zero exit status is not an error; only failure to spawn is.
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput>;

    /// Run the invocation and require a zero exit status.
    fn run_checked(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let output = self.run(invocation)?;
        if output.is_success() {
            Ok(output)
        } else {
            Err(DeviceTrustError::command(
                invocation.program(),
                output.describe_failure(),
            ))
        }
    }
}

/// [`CommandRunner`] backed by [`std::process::Command`].
#[derive(Debug, Clone)]
pub struct SystemCommandRunner {
    elevated: bool,
}

impl Default for SystemCommandRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemCommandRunner {
    /// Create a runner; user-context wrapping is enabled when running as root.
    pub fn new() -> Self {
        Self {
            elevated: is_elevated(),
        }
    }

    /// True if commands requesting a user context will be wrapped.
    pub fn is_elevated(&self) -> bool {
        self.elevated
    }
}

impl CommandRunner for SystemCommandRunner {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let argv = invocation.argv(self.elevated);
        tracing::debug!("exec: {}", invocation);

        let output = Command::new(&argv[0])
            .args(&argv[1..])
            .output()
            .map_err(|e| DeviceTrustError::command(&argv[0], e.to_string()))?;

        let result = CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !invocation.quiet_output {
            if !result.stdout.trim().is_empty() {
                tracing::debug!("stdout: {}", result.stdout.trim_end());
            }
            if !result.stderr.trim().is_empty() {
                tracing::debug!("stderr: {}", result.stderr.trim_end());
            }
        }
        if !result.is_success() {
            tracing::debug!("{} exited with {:?}", invocation.program(), result.status);
        }

        Ok(result)
    }
}

/// True if the process runs with an effective uid of 0.
#[cfg(unix)]
pub fn is_elevated() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

/// True if the process runs with an effective uid of 0.
#[cfg(not(unix))]
pub fn is_elevated() -> bool {
    false
}
