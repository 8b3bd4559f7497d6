//! External tool invocation.
//!
//! Uploader tools (`bossac`, `dfu-util`, `adb`) are treated as opaque
//! processes: a literal argument vector goes in, a merged stream of text lines
//! and an exit status come out. No shell is involved, so arguments are never
//! subject to metacharacter expansion.
//!
//! The [`CommandRunner`] trait is the seam the orchestration code is written
//! against; [`ProcessRunner`] is the real implementation.

use crate::error::{Error, Result};
use log::{debug, trace};
use std::ffi::OsString;
use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;

/// How much of a tool's output is echoed while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Capture output silently.
    #[default]
    Quiet,
    /// Echo each output line as it arrives.
    Verbose,
}

impl Verbosity {
    /// Build from a plain verbose flag.
    pub fn from_flag(verbose: bool) -> Self {
        if verbose { Self::Verbose } else { Self::Quiet }
    }

    /// Whether output lines are echoed.
    pub fn is_verbose(self) -> bool {
        self == Self::Verbose
    }
}

/// A program path plus literal arguments and extra environment entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
    env: Vec<(String, OsString)>,
}

impl CommandLine {
    /// Start a command line for `program`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Build from a full argument vector (program first).
    pub fn from_argv<I, S>(argv: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut iter = argv.into_iter().map(Into::into);
        let program = iter
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::InvalidCommand("empty command line".to_string()))?;
        Ok(Self::new(program).args(iter))
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the child process only.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Program path.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments after the program.
    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Extra environment entries.
    pub fn environment(&self) -> &[(String, OsString)] {
        &self.env
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// How an external command ended.
#[derive(Debug)]
pub enum ExitState {
    /// Exit code 0.
    Success,
    /// Ran, but exited non-zero or was killed by a signal.
    Failed {
        /// Exit code, `None` when terminated by a signal.
        code: Option<i32>,
    },
    /// Never started (binary missing, permission denied, ...).
    StartFailed(io::Error),
}

/// Result of a blocking tool invocation.
#[derive(Debug)]
pub struct ProcessOutcome {
    /// Program that was run.
    pub program: String,
    /// Exit state.
    pub status: ExitState,
    /// Captured lines of stdout and stderr, in arrival order.
    pub output: Vec<String>,
    /// Whether the search pattern occurred in any line.
    pub pattern_found: bool,
    /// First line containing the search pattern.
    pub first_match: Option<String>,
}

impl ProcessOutcome {
    /// Outcome for a command that never started.
    pub fn start_failed(program: impl Into<String>, error: io::Error) -> Self {
        Self {
            program: program.into(),
            status: ExitState::StartFailed(error),
            output: Vec::new(),
            pattern_found: false,
            first_match: None,
        }
    }

    /// Whether the command ran and exited with code 0.
    pub fn success(&self) -> bool {
        matches!(self.status, ExitState::Success)
    }

    /// Captured output as one newline-terminated text block.
    pub fn text(&self) -> String {
        let mut text = String::new();
        for line in &self.output {
            text.push_str(line);
            text.push('\n');
        }
        text
    }

    /// Convert a failed outcome into the matching error.
    pub fn into_result(self) -> Result<Self> {
        match self.status {
            ExitState::Success => Ok(self),
            ExitState::Failed { code } => Err(Error::ProcessExit {
                program: self.program,
                code,
            }),
            ExitState::StartFailed(source) => Err(Error::ProcessStart {
                program: self.program,
                source,
            }),
        }
    }
}

/// Something that can run external commands.
pub trait CommandRunner {
    /// Run `command` to completion, capturing its merged output.
    ///
    /// `search` is a literal substring looked for in every output line; `None`
    /// or an empty string disables the search.
    fn run(
        &mut self,
        command: &CommandLine,
        search: Option<&str>,
        verbosity: Verbosity,
    ) -> ProcessOutcome;

    /// Start `command` and return without waiting for it.
    fn run_background(&mut self, command: &CommandLine) -> Result<()>;
}

impl<R: CommandRunner + ?Sized> CommandRunner for &mut R {
    fn run(
        &mut self,
        command: &CommandLine,
        search: Option<&str>,
        verbosity: Verbosity,
    ) -> ProcessOutcome {
        (**self).run(command, search, verbosity)
    }

    fn run_background(&mut self, command: &CommandLine) -> Result<()> {
        (**self).run_background(command)
    }
}

/// Runs commands as real OS processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl ProcessRunner {
    /// Create a runner.
    pub fn new() -> Self {
        Self
    }
}

impl CommandRunner for ProcessRunner {
    fn run(
        &mut self,
        command: &CommandLine,
        search: Option<&str>,
        verbosity: Verbosity,
    ) -> ProcessOutcome {
        debug!("Running: {command}");
        let search = search.filter(|s| !s.is_empty());

        let mut child = match command
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                debug!("Failed to start {}: {e}", command.program());
                return ProcessOutcome::start_failed(command.program(), e);
            },
        };

        let (tx, rx) = mpsc::channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_line_reader(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_line_reader(stderr, tx.clone()));
        }
        drop(tx);

        let mut output = Vec::new();
        let mut first_match = None;
        // Ends once both pipes are closed and their readers have dropped the sender.
        for line in rx {
            if verbosity.is_verbose() {
                let mut stdout = io::stdout().lock();
                let _ = writeln!(stdout, "{line}");
            }
            trace!("{}: {line}", command.program());
            if first_match.is_none() && search.is_some_and(|pattern| line.contains(pattern)) {
                first_match = Some(line.clone());
            }
            output.push(line);
        }
        for reader in readers {
            let _ = reader.join();
        }

        let status = match child.wait() {
            Ok(status) if status.success() => ExitState::Success,
            Ok(status) => ExitState::Failed {
                code: status.code(),
            },
            Err(e) => {
                debug!("Failed to wait for {}: {e}", command.program());
                ExitState::Failed { code: None }
            },
        };
        debug!("{} finished: {status:?}", command.program());

        ProcessOutcome {
            program: command.program().to_string(),
            status,
            output,
            pattern_found: first_match.is_some(),
            first_match,
        }
    }

    fn run_background(&mut self, command: &CommandLine) -> Result<()> {
        debug!("Starting in background: {command}");
        let child = command
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| Error::ProcessStart {
                program: command.program().to_string(),
                source,
            })?;
        debug!("{} started with pid {}", command.program(), child.id());
        Ok(())
    }
}

fn spawn_line_reader<R>(stream: R, tx: mpsc::Sender<String>) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    while matches!(buf.last(), Some(b'\n' | b'\r')) {
                        buf.pop();
                    }
                    if tx
                        .send(String::from_utf8_lossy(&buf).into_owned())
                        .is_err()
                    {
                        break;
                    }
                },
            }
        }
    })
}
