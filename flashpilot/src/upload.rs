//! Upload orchestration.
//!
//! One pass through a fixed sequence of phases:
//!
//! ```text
//! Discovering -> Resetting? -> Ready -> CheckingCompliance* -> Reflashing*
//!             -> FlashingApplication? -> Done
//! ```
//!
//! Which phases run is decided by the board family's [`Capabilities`] and by
//! the [`UploadPlan`]. Any failure ends the pass in [`Phase::Failed`] and is
//! reported as an [`UploadFailure`] naming the phase it happened in.
//!
//! [`Capabilities`]: crate::board::Capabilities

use crate::board::{BoardFamily, FirmwareDomain, Toolchain};
use crate::compliance::{ComplianceCheck, ComplianceChecker};
use crate::device::{DeviceIdentity, PortSet};
use crate::error::{Error, Result};
use crate::port::SerialBackend;
use crate::process::{CommandRunner, ExitState, Verbosity};
use crate::reset::{ResetSequencer, ResetTiming};
use log::{debug, info, warn};
use std::fmt;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

/// Probe attempts before discovery gives up.
pub const DISCOVERY_ATTEMPTS: usize = 100;

/// Delay between two discovery probes.
pub const DISCOVERY_INTERVAL: Duration = Duration::from_millis(100);

/// Failed probes after which the user is asked to reset the board by hand.
pub const MANUAL_RESET_HINT_AFTER: usize = 40;

/// Orchestration phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the board to show up.
    Discovering,
    /// Bootloader-entry reset and re-enumeration.
    Resetting,
    /// Board located.
    Ready,
    /// Reading back firmware domains.
    CheckingCompliance,
    /// Writing bundled firmware to outdated domains.
    Reflashing,
    /// Writing the application binary.
    FlashingApplication,
    /// Finished successfully.
    Done,
    /// Finished with an error.
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Discovering => "discovering",
            Self::Resetting => "resetting",
            Self::Ready => "ready",
            Self::CheckingCompliance => "checking compliance",
            Self::Reflashing => "reflashing",
            Self::FlashingApplication => "flashing application",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What to do in one run. Built once, then only read.
#[derive(Debug, Clone)]
pub struct UploadPlan {
    /// Board family driving the run.
    pub family: BoardFamily,
    /// Known board identity, if any.
    pub port: Option<DeviceIdentity>,
    /// Application binary to flash.
    pub binary: Option<PathBuf>,
    /// Domains to version-check, in order.
    pub checks: Vec<ComplianceCheck>,
    /// Re-flash every domain of the family without checking.
    pub force_update: bool,
    /// Output echo for the uploader calls.
    pub verbosity: Verbosity,
}

impl UploadPlan {
    /// Empty plan for `family`.
    pub fn new(family: BoardFamily) -> Self {
        Self {
            family,
            port: None,
            binary: None,
            checks: Vec::new(),
            force_update: false,
            verbosity: Verbosity::Quiet,
        }
    }

    /// Set the board identity.
    #[must_use]
    pub fn with_port(mut self, port: Option<impl Into<DeviceIdentity>>) -> Self {
        self.port = port.map(Into::into);
        self
    }

    /// Set the application binary.
    #[must_use]
    pub fn with_binary(mut self, binary: Option<impl Into<PathBuf>>) -> Self {
        self.binary = binary.map(Into::into);
        self
    }

    /// Request re-flashing of every domain.
    #[must_use]
    pub fn with_force_update(mut self, force: bool) -> Self {
        self.force_update = force;
        self
    }

    /// Set the uploader verbosity.
    #[must_use]
    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Add a version check for the domain called `domain`.
    ///
    /// Fails when the family has no such domain or cannot read firmware back.
    pub fn with_check(mut self, domain: &str, marker: &str, bytes: usize) -> Result<Self> {
        if !self.family.capabilities().supports_compliance_check {
            return Err(Error::Config(format!(
                "{} boards do not support firmware checks",
                self.family
            )));
        }
        let Some(domain) = self.family.domain(domain) else {
            return Err(Error::Config(format!(
                "unknown firmware domain {domain:?} for {} boards",
                self.family
            )));
        };
        if bytes == 0 {
            return Err(Error::Config(format!(
                "readback size for {} must be positive",
                domain.name
            )));
        }
        self.checks.push(ComplianceCheck::new(domain, marker, bytes));
        Ok(self)
    }
}

/// Summary of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    /// Identity the board was flashed on.
    pub port: Option<DeviceIdentity>,
    /// Failed discovery probes before the board was found.
    pub discovery_retries: usize,
    /// Domains that were re-flashed.
    pub reflashed: Vec<FirmwareDomain>,
    /// Whether an application was written.
    pub application_flashed: bool,
}

/// A run that ended in [`Phase::Failed`].
#[derive(Debug, thiserror::Error)]
#[error("{}", failure_message(.phase, .port.as_deref(), .source))]
pub struct UploadFailure {
    /// Phase the error happened in.
    pub phase: Phase,
    /// Identity in use at the time, if known.
    pub port: Option<DeviceIdentity>,
    /// Underlying error.
    #[source]
    pub source: Error,
}

fn failure_message(phase: &Phase, port: Option<&str>, source: &Error) -> String {
    match (phase, source) {
        (_, Error::DiscoveryTimeout { board, .. }) => {
            format!("{board} not found, try a manual reset")
        },
        (Phase::FlashingApplication, _) => match port {
            Some(port) => format!("Upload failed on {port}: {source}"),
            None => format!("Upload failed: {source}"),
        },
        (Phase::Reflashing, _) => format!("Firmware update failed: {source}"),
        (Phase::CheckingCompliance, _) => format!("Firmware check failed: {source}"),
        (Phase::Resetting, _) => format!("Board reset failed: {source}"),
        _ => source.to_string(),
    }
}

/// Receives progress notifications. Every method defaults to a no-op.
pub trait UploadObserver {
    /// A phase has started.
    fn phase(&mut self, _phase: Phase) {}

    /// A discovery probe did not find the board.
    fn discovery_retry(&mut self, _attempt: usize) {}

    /// The board has been missing for a while.
    fn manual_reset_hint(&mut self) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentObserver;

impl UploadObserver for SilentObserver {}

/// Timing of the static discovery poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryPolicy {
    /// Probe attempts before giving up.
    pub attempts: usize,
    /// Delay between probes.
    pub interval: Duration,
    /// Failed probes before the manual reset hint.
    pub hint_after: usize,
}

impl Default for DiscoveryPolicy {
    fn default() -> Self {
        Self {
            attempts: DISCOVERY_ATTEMPTS,
            interval: DISCOVERY_INTERVAL,
            hint_after: MANUAL_RESET_HINT_AFTER,
        }
    }
}

/// Drives one upload through all of its phases.
pub struct UploadOrchestrator<'a, B, R> {
    ports: &'a PortSet<B>,
    runner: R,
    toolchain: Toolchain,
    reset_timing: ResetTiming,
    discovery: DiscoveryPolicy,
}

impl<'a, B: SerialBackend, R: CommandRunner> UploadOrchestrator<'a, B, R> {
    /// Orchestrator using `ports` for enumeration and `runner` for the tools.
    pub fn new(ports: &'a PortSet<B>, runner: R, toolchain: Toolchain) -> Self {
        Self {
            ports,
            runner,
            toolchain,
            reset_timing: ResetTiming::default(),
            discovery: DiscoveryPolicy::default(),
        }
    }

    /// Override the reset timing.
    #[must_use]
    pub fn with_reset_timing(mut self, timing: ResetTiming) -> Self {
        self.reset_timing = timing;
        self
    }

    /// Override the discovery poll.
    #[must_use]
    pub fn with_discovery(mut self, policy: DiscoveryPolicy) -> Self {
        self.discovery = policy;
        self
    }

    /// Execute `plan`.
    pub fn run(
        &mut self,
        plan: &UploadPlan,
        observer: &mut dyn UploadObserver,
    ) -> std::result::Result<UploadReport, UploadFailure> {
        if plan.family != self.toolchain.family() {
            warn!(
                "Plan is for {} but the toolchain drives {}",
                plan.family,
                self.toolchain.family()
            );
        }
        let mut report = UploadReport {
            port: plan.port.clone(),
            ..UploadReport::default()
        };
        let result = self.run_phases(plan, observer, &mut report);
        match result {
            Ok(()) => {
                observer.phase(Phase::Done);
                Ok(report)
            },
            Err((phase, source)) => {
                observer.phase(Phase::Failed);
                Err(UploadFailure {
                    phase,
                    port: report.port,
                    source,
                })
            },
        }
    }

    fn run_phases(
        &mut self,
        plan: &UploadPlan,
        observer: &mut dyn UploadObserver,
        report: &mut UploadReport,
    ) -> std::result::Result<(), (Phase, Error)> {
        let caps = plan.family.capabilities();

        observer.phase(Phase::Discovering);
        if caps.uses_static_discovery_poll {
            report.discovery_retries = self
                .poll_for_board(plan.family, observer)
                .map_err(|e| (Phase::Discovering, e))?;
        }

        if caps.supports_auto_reset {
            observer.phase(Phase::Resetting);
            let port = self
                .reset(plan.port.as_deref(), caps.waits_for_new_port)
                .map_err(|e| (Phase::Resetting, e))?;
            report.port = Some(port);
        }
        observer.phase(Phase::Ready);

        let mut outdated: Vec<FirmwareDomain> = Vec::new();
        if !plan.checks.is_empty() {
            observer.phase(Phase::CheckingCompliance);
            let checker = ComplianceChecker::new(&self.toolchain);
            for check in &plan.checks {
                let result = checker
                    .check_version(&mut self.runner, check)
                    .map_err(|e| (Phase::CheckingCompliance, e))?;
                if result.update_required && !outdated.contains(&result.domain) {
                    outdated.push(result.domain);
                }
            }
        }
        if plan.force_update {
            for domain in plan.family.domains() {
                if !outdated.contains(domain) {
                    outdated.push(*domain);
                }
            }
        }

        if !outdated.is_empty() {
            observer.phase(Phase::Reflashing);
            for domain in outdated {
                info!("Updating {} firmware", domain.name);
                let cmd = self.toolchain.reflash(domain);
                // Always shown, whatever the user asked for.
                self.runner
                    .run(&cmd, None, Verbosity::Verbose)
                    .into_result()
                    .map_err(|e| (Phase::Reflashing, e))?;
                report.reflashed.push(domain);
            }
        }

        let Some(binary) = &plan.binary else {
            debug!("No application binary given, skipping application flash");
            return Ok(());
        };
        observer.phase(Phase::FlashingApplication);
        for cmd in self
            .toolchain
            .flash_application(report.port.as_deref(), binary)
        {
            self.runner
                .run(&cmd, None, plan.verbosity)
                .into_result()
                .map_err(|e| (Phase::FlashingApplication, e))?;
        }
        report.application_flashed = true;
        Ok(())
    }

    /// Poll the uploader's listing until the board's marker shows up.
    ///
    /// Returns the number of failed probes. A probe that exits non-zero just
    /// means "not there yet"; a tool that cannot be started is fatal.
    fn poll_for_board(
        &mut self,
        family: BoardFamily,
        observer: &mut dyn UploadObserver,
    ) -> Result<usize> {
        let Some((probe, marker)) = self.toolchain.discovery_probe() else {
            return Ok(0);
        };
        debug!("Waiting for {family} board ({probe})");

        for attempt in 0..self.discovery.attempts {
            let outcome = self.runner.run(&probe, Some(marker), Verbosity::Quiet);
            if outcome.pattern_found {
                if attempt > 0 {
                    info!("Board found after {attempt} retries");
                }
                return Ok(attempt);
            }
            if matches!(outcome.status, ExitState::StartFailed(_)) {
                outcome.into_result()?;
            }

            let failed = attempt + 1;
            observer.discovery_retry(failed);
            if failed == self.discovery.hint_after {
                debug!("Board still not found after {failed} probes");
                observer.manual_reset_hint();
            }
            if failed < self.discovery.attempts {
                thread::sleep(self.discovery.interval);
            }
        }

        Err(Error::DiscoveryTimeout {
            board: family.to_string(),
            attempts: self.discovery.attempts,
        })
    }

    /// Reset the board and return the identity to flash on.
    fn reset(&self, port: Option<&str>, wait: bool) -> Result<DeviceIdentity> {
        let sequencer = ResetSequencer::new(self.ports).with_timing(self.reset_timing);

        if let Some(port) = port {
            return match sequencer.reset_and_await(port, wait) {
                Err(Error::NoNewPort { original }) => Ok(original),
                other => other,
            };
        }

        let candidates = self.ports.list();
        if candidates.is_empty() {
            return Err(Error::DeviceNotFound);
        }
        let mut fallback = None;
        for candidate in candidates.iter() {
            debug!("Trying reset on {candidate}");
            match sequencer.reset_and_await(candidate, wait) {
                Err(Error::NoNewPort { original }) => fallback = Some(original),
                other => return other,
            }
        }
        fallback.ok_or(Error::DeviceNotFound)
    }
}
