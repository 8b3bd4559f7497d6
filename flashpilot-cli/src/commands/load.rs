//! Load command: reset, check, update and flash.

use anyhow::{Result, bail};
use console::style;
use flashpilot::{
    BoardFamily, NativeSerial, Phase, PortSet, ProcessRunner, Toolchain, UploadObserver,
    UploadOrchestrator, UploadPlan, UploadReport, Verbosity,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::config::Config;
use crate::{Cli, CliError, use_fancy_output};

/// Readback size when neither the flag nor the config names one.
pub(crate) const DEFAULT_READBACK_BYTES: usize = 1024;

/// A `--check DOMAIN=MARKER[@BYTES]` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CheckArg {
    pub(crate) domain: String,
    pub(crate) marker: String,
    pub(crate) bytes: Option<usize>,
}

/// Parse a check argument in format "DOMAIN=MARKER[@BYTES]".
pub(crate) fn parse_check(s: &str) -> Result<CheckArg, String> {
    let invalid = || {
        format!(
            "Invalid format: '{s}'. Expected 'DOMAIN=MARKER[@BYTES]' (e.g., 'radio=ATP1BLE00R-1631C4439@1024')"
        )
    };
    let (domain, rest) = s.split_once('=').ok_or_else(invalid)?;

    let (marker, bytes) = match rest.rsplit_once('@') {
        Some((marker, bytes)) if !bytes.is_empty() && bytes.bytes().all(|b| b.is_ascii_digit()) => {
            let bytes: usize = bytes
                .parse()
                .map_err(|e| format!("Invalid readback size: {e}"))?;
            (marker, Some(bytes))
        },
        _ => (rest, None),
    };

    if domain.trim().is_empty() || marker.is_empty() {
        return Err(invalid());
    }
    Ok(CheckArg {
        domain: domain.trim().to_string(),
        marker: marker.to_string(),
        bytes,
    })
}

/// Resolve flags and config into an upload plan.
fn build_plan(
    cli: &Cli,
    config: &Config,
    family: BoardFamily,
    binary: Option<&Path>,
    checks: &[CheckArg],
    force_update: bool,
) -> Result<UploadPlan> {
    let port = cli.port.clone().or_else(|| config.port.serial.clone());
    let mut plan = UploadPlan::new(family)
        .with_port(port)
        .with_binary(binary)
        .with_force_update(force_update)
        .with_verbosity(Verbosity::from_flag(cli.verbose > 0 && !cli.quiet));

    // Config entries first, flags replace them per domain
    let mut wanted: BTreeMap<&str, (&str, usize)> = BTreeMap::new();
    if family.capabilities().supports_compliance_check {
        for (domain, check) in &config.compliance {
            if let Some(marker) = &check.marker {
                let bytes = check.offset.unwrap_or(DEFAULT_READBACK_BYTES);
                wanted.insert(domain.as_str(), (marker.as_str(), bytes));
            }
        }
    }
    for check in checks {
        let bytes = check
            .bytes
            .or_else(|| config.compliance.get(&check.domain).and_then(|c| c.offset))
            .unwrap_or(DEFAULT_READBACK_BYTES);
        wanted.insert(check.domain.as_str(), (check.marker.as_str(), bytes));
    }

    for (domain, (marker, bytes)) in wanted {
        plan = plan
            .with_check(domain, marker, bytes)
            .map_err(|e| CliError::Usage(e.to_string()))?;
    }
    Ok(plan)
}

/// Shows upload progress on stderr.
struct ConsoleObserver {
    quiet: bool,
    polls: bool,
    spinner: Option<ProgressBar>,
}

impl ConsoleObserver {
    fn new(quiet: bool, family: BoardFamily) -> Self {
        Self {
            quiet,
            polls: family.capabilities().uses_static_discovery_poll,
            spinner: None,
        }
    }

    fn start_spinner(&mut self) {
        let pb = ProgressBar::new_spinner();
        if let Ok(spinner_style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
            pb.set_style(spinner_style);
        }
        pb.set_message("Waiting for board...");
        pb.enable_steady_tick(Duration::from_millis(100));
        self.spinner = Some(pb);
    }

    fn status(&self, message: &str) {
        if !self.quiet {
            eprintln!("{} {message}", style("→").cyan());
        }
    }
}

impl UploadObserver for ConsoleObserver {
    fn phase(&mut self, phase: Phase) {
        if let Some(pb) = self.spinner.take() {
            pb.finish_and_clear();
        }
        match phase {
            Phase::Discovering if self.polls => {
                if !self.quiet && use_fancy_output() {
                    self.start_spinner();
                } else {
                    self.status("Waiting for board");
                }
            },
            Phase::Resetting => self.status("Resetting board into bootloader"),
            Phase::CheckingCompliance => self.status("Checking firmware versions"),
            Phase::Reflashing => self.status("Updating firmware"),
            Phase::FlashingApplication => self.status("Flashing application"),
            _ => {},
        }
    }

    fn discovery_retry(&mut self, attempt: usize) {
        if let Some(pb) = &self.spinner {
            pb.set_message(format!("Waiting for board (attempt {attempt})"));
        }
    }

    fn manual_reset_hint(&mut self) {
        let hint = format!(
            "{} Board not found yet, try a manual reset",
            style("!").yellow().bold()
        );
        match &self.spinner {
            Some(pb) => pb.println(hint),
            None => eprintln!("{hint}"),
        }
    }
}

fn print_success(cli: &Cli, report: &UploadReport) {
    if !cli.quiet {
        for domain in &report.reflashed {
            eprintln!("{} Updated {} firmware", style("✓").green(), domain.name);
        }
        if let Some(port) = &report.port {
            eprintln!("{} Using {}", style("✓").green(), style(port).cyan());
        }
    }

    if report.application_flashed {
        println!("SUCCESS: Sketch will execute in about 5 seconds.");
    } else if !report.reflashed.is_empty() {
        println!("SUCCESS: Firmware updated.");
    } else {
        println!("SUCCESS: Nothing to flash.");
    }
}

/// Load command implementation.
pub(crate) fn cmd_load(
    cli: &Cli,
    config: &Config,
    tools_dir: &Path,
    binary: Option<&Path>,
    checks: &[CheckArg],
    force_update: bool,
) -> Result<()> {
    let family = cli.board.or(config.board.family).unwrap_or_default();

    if let Some(binary) = binary {
        if !binary.is_file() {
            bail!("Binary not found: {}", binary.display());
        }
    }
    let plan = build_plan(cli, config, family, binary, checks, force_update)?;

    if !cli.quiet {
        eprintln!(
            "{} Uploading to {} board with {}",
            style("ℹ").blue(),
            style(family).yellow(),
            style(family.tool_name()).cyan()
        );
    }

    let ports = PortSet::new(NativeSerial);
    let toolchain = Toolchain::new(family, tools_dir);
    let mut observer = ConsoleObserver::new(cli.quiet, family);

    let report =
        UploadOrchestrator::new(&ports, ProcessRunner::new(), toolchain).run(&plan, &mut observer)?;

    print_success(cli, &report);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ComplianceConfig;
    use clap::Parser;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["flashpilot"];
        argv.extend_from_slice(args);
        argv.push("load");
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_parse_check() {
        assert_eq!(
            parse_check("radio=v2.3@64"),
            Ok(CheckArg {
                domain: "radio".into(),
                marker: "v2.3".into(),
                bytes: Some(64),
            })
        );
        assert_eq!(parse_check("radio=v2.3").unwrap().bytes, None);
        // '@' not followed by digits belongs to the marker
        assert_eq!(parse_check("radio=build@home").unwrap().marker, "build@home");
        assert!(parse_check("radio").is_err());
        assert!(parse_check("=v2.3").is_err());
        assert!(parse_check("radio=").is_err());
    }

    #[test]
    fn test_plan_port_flag_wins_over_config() {
        let mut config = Config::default();
        config.port.serial = Some("/dev/ttyACM9".into());

        let plan = build_plan(
            &cli(&["-p", "/dev/ttyACM0"]),
            &config,
            BoardFamily::SerialReset,
            None,
            &[],
            false,
        )
        .unwrap();
        assert_eq!(plan.port.as_deref(), Some("/dev/ttyACM0"));

        let plan = build_plan(&cli(&[]), &config, BoardFamily::SerialReset, None, &[], false)
            .unwrap();
        assert_eq!(plan.port.as_deref(), Some("/dev/ttyACM9"));
    }

    #[test]
    fn test_plan_verbosity_follows_flag() {
        let config = Config::default();
        let quiet = build_plan(&cli(&[]), &config, BoardFamily::SerialReset, None, &[], false)
            .unwrap();
        assert_eq!(quiet.verbosity, Verbosity::Quiet);

        let verbose = build_plan(&cli(&["-v"]), &config, BoardFamily::SerialReset, None, &[], false)
            .unwrap();
        assert_eq!(verbose.verbosity, Verbosity::Verbose);
    }

    #[test]
    fn test_plan_merges_config_and_flag_checks() {
        let mut config = Config::default();
        config.compliance.insert(
            "radio".into(),
            ComplianceConfig {
                marker: Some("old".into()),
                offset: Some(512),
            },
        );
        config.compliance.insert(
            "real-time-core".into(),
            ComplianceConfig {
                marker: Some("QRK".into()),
                offset: None,
            },
        );
        let flags = [parse_check("radio=new").unwrap()];

        let plan = build_plan(
            &cli(&[]),
            &config,
            BoardFamily::DfuCoprocessor,
            None,
            &flags,
            false,
        )
        .unwrap();

        assert_eq!(plan.checks.len(), 2);
        let radio = &plan.checks[0];
        assert_eq!(radio.domain.name, "radio");
        assert_eq!(radio.marker, "new");
        assert_eq!(radio.bytes, 512);
        assert_eq!(plan.checks[1].bytes, DEFAULT_READBACK_BYTES);
    }

    #[test]
    fn test_plan_ignores_config_checks_for_other_families() {
        let mut config = Config::default();
        config.compliance.insert(
            "radio".into(),
            ComplianceConfig {
                marker: Some("v2.3".into()),
                offset: None,
            },
        );

        let plan = build_plan(&cli(&[]), &config, BoardFamily::SerialReset, None, &[], false)
            .unwrap();
        assert!(plan.checks.is_empty());
    }

    #[test]
    fn test_plan_rejects_flag_check_for_wrong_family() {
        let flags = [parse_check("radio=v2.3").unwrap()];
        let err = build_plan(
            &cli(&[]),
            &Config::default(),
            BoardFamily::SerialReset,
            None,
            &flags,
            false,
        )
        .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Usage(_))
        ));
    }
}
