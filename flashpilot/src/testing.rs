//! Scripted stand-ins for the serial bus and the uploader tools.

use crate::error::{Error, Result};
use crate::port::{Port, PortInfo, SerialBackend, SerialConfig};
use crate::process::{CommandLine, CommandRunner, ExitState, ProcessOutcome, Verbosity};
use crate::reset::ResetTiming;
use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Serial backend replaying a scripted sequence of port snapshots.
///
/// The last snapshot repeats forever once the script runs out.
#[derive(Default)]
pub(crate) struct ScriptedSerial {
    snapshots: Mutex<VecDeque<Vec<String>>>,
    log: Arc<Mutex<Vec<String>>>,
    pub(crate) fail_open: bool,
}

impl ScriptedSerial {
    pub(crate) fn new(script: &[&[&str]]) -> Self {
        Self {
            snapshots: Mutex::new(
                script
                    .iter()
                    .map(|s| s.iter().map(|p| (*p).to_string()).collect())
                    .collect(),
            ),
            ..Self::default()
        }
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl SerialBackend for ScriptedSerial {
    fn list_ports(&self) -> Result<Vec<PortInfo>> {
        let mut snapshots = self.snapshots.lock().unwrap();
        let current = if snapshots.len() > 1 {
            snapshots.pop_front().unwrap_or_default()
        } else {
            snapshots.front().cloned().unwrap_or_default()
        };
        Ok(current.into_iter().map(PortInfo::named).collect())
    }

    fn open(&self, config: &SerialConfig) -> Result<Box<dyn Port>> {
        self.log
            .lock()
            .unwrap()
            .push(format!("open {} @{}", config.port_name, config.baud_rate));
        if self.fail_open {
            return Err(Error::DeviceNotFound);
        }
        Ok(Box::new(FakePort {
            events: Arc::clone(&self.log),
        }))
    }
}

struct FakePort {
    events: Arc<Mutex<Vec<String>>>,
}

impl Port for FakePort {
    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.events.lock().unwrap().push(format!("dtr {level}"));
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.events.lock().unwrap().push("close".to_string());
        Ok(())
    }
}

pub(crate) fn fast_timing() -> ResetTiming {
    ResetTiming {
        timeout: Duration::from_millis(300),
        poll_interval: Duration::from_millis(20),
        settle_delay: Duration::from_millis(5),
    }
}

/// What a fake tool invocation does.
pub(crate) enum Reply {
    /// Exit 0 printing these lines.
    Lines(Vec<String>),
    /// Exit with this code.
    Exit(i32),
    /// The binary does not exist.
    Missing,
}

impl Reply {
    pub(crate) fn ok() -> Self {
        Self::Lines(Vec::new())
    }

    pub(crate) fn print(line: &str) -> Self {
        Self::Lines(vec![line.to_string()])
    }
}

/// One recorded invocation.
#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub(crate) command: CommandLine,
    pub(crate) verbosity: Verbosity,
    pub(crate) background: bool,
}

impl Call {
    /// Program name without its directory.
    pub(crate) fn tool(&self) -> &str {
        let program = self.command.program();
        program.rsplit(['/', '\\']).next().unwrap_or(program)
    }

    pub(crate) fn has_arg(&self, arg: &str) -> bool {
        self.command.arguments().iter().any(|a| a == arg)
    }
}

/// Command runner answering from a closure and recording every call.
pub(crate) struct FakeRunner<F> {
    handler: F,
    pub(crate) calls: Vec<Call>,
}

impl<F: FnMut(&CommandLine) -> Reply> FakeRunner<F> {
    pub(crate) fn new(handler: F) -> Self {
        Self {
            handler,
            calls: Vec::new(),
        }
    }

    /// Calls whose argument list contains `arg`.
    pub(crate) fn calls_with(&self, arg: &str) -> Vec<&Call> {
        self.calls.iter().filter(|c| c.has_arg(arg)).collect()
    }
}

impl<F: FnMut(&CommandLine) -> Reply> CommandRunner for FakeRunner<F> {
    fn run(
        &mut self,
        command: &CommandLine,
        search: Option<&str>,
        verbosity: Verbosity,
    ) -> ProcessOutcome {
        self.calls.push(Call {
            command: command.clone(),
            verbosity,
            background: false,
        });
        let (status, output) = match (self.handler)(command) {
            Reply::Lines(lines) => (ExitState::Success, lines),
            Reply::Exit(code) => (ExitState::Failed { code: Some(code) }, Vec::new()),
            Reply::Missing => {
                let err = io::Error::new(io::ErrorKind::NotFound, "no such file");
                return ProcessOutcome::start_failed(command.program(), err);
            },
        };
        let search = search.filter(|s| !s.is_empty());
        let first_match = output
            .iter()
            .find(|line| search.is_some_and(|p| line.contains(p)))
            .cloned();
        ProcessOutcome {
            program: command.program().to_string(),
            status,
            output,
            pattern_found: first_match.is_some(),
            first_match,
        }
    }

    fn run_background(&mut self, command: &CommandLine) -> Result<()> {
        self.calls.push(Call {
            command: command.clone(),
            verbosity: Verbosity::Quiet,
            background: true,
        });
        match (self.handler)(command) {
            Reply::Missing => Err(Error::ProcessStart {
                program: command.program().to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
            }),
            _ => Ok(()),
        }
    }
}

/// Destination file of a dfu-util readback (`-U <file>`).
pub(crate) fn readback_target(command: &CommandLine) -> Option<PathBuf> {
    let args = command.arguments();
    args.iter()
        .position(|a| a == "-U")
        .and_then(|i| args.get(i + 1))
        .filter(|_| args.iter().any(|a| a == "-K"))
        .map(PathBuf::from)
}
