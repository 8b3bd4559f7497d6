//! flashpilot CLI - Command-line tool for resetting and flashing boards.
//!
//! ## Features
//!
//! - Bootloader-entry reset and port re-enumeration tracking
//! - Firmware version checks with automatic coprocessor updates
//! - bossac, dfu-util and adb uploaders
//! - Auxiliary command runner for debug sessions
//! - Environment variable and config file support

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;
use env_logger::Env;
use flashpilot::BoardFamily;
use log::debug;
use std::env;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Check if spinners and colours should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Failures raised by the CLI itself rather than by the library.
///
/// Like every other error they end the process with status 1.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad arguments or configuration.
    #[error("{0}")]
    Usage(String),
    /// An auxiliary debug command failed.
    #[error("Command \"{0}\" failed")]
    CommandFailed(String),
}

/// Exit status for an argument parsing outcome: 0 for help and version, 1 otherwise.
fn parse_exit_code(err: &clap::Error) -> u8 {
    u8::from(err.use_stderr())
}

/// flashpilot - Reset, discover and flash microcontroller boards.
///
/// Environment variables:
///   FLASHPILOT_PORT        - Default serial port
///   FLASHPILOT_BOARD       - Default board family
///   FLASHPILOT_TOOLS_DIR   - Directory holding the uploader tools
#[derive(Debug, Parser)]
#[command(name = "flashpilot")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port of the board (auto-detected if not specified).
    #[arg(short, long, global = true, env = "FLASHPILOT_PORT")]
    port: Option<String>,

    /// Board family: serial-reset, dfu-coprocessor, adb-sketch, adb-firmware.
    #[arg(short, long, global = true, env = "FLASHPILOT_BOARD", value_parser = parse_board)]
    board: Option<BoardFamily>,

    /// Directory holding the uploader tools (defaults to the executable's directory).
    #[arg(long, global = true, env = "FLASHPILOT_TOOLS_DIR", value_name = "DIR")]
    tools_dir: Option<PathBuf>,

    /// Verbose output level (-v shows uploader output, -vv and -vvv add detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Debug, Subcommand)]
enum Commands {
    /// Reset the board, check its firmware and flash an application.
    Load {
        /// Application binary to flash. Without it only checks and updates run.
        binary: Option<PathBuf>,

        /// Version check for a firmware domain (can be repeated).
        #[arg(long = "check", value_name = "DOMAIN=MARKER[@BYTES]", value_parser = commands::load::parse_check)]
        checks: Vec<commands::load::CheckArg>,

        /// Re-flash every firmware domain without checking.
        #[arg(long)]
        force_update: bool,
    },

    /// Run auxiliary commands: ';' runs in sequence, '&' starts in background.
    Debug {
        /// Command line(s) to run.
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        commands: Vec<String>,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },
}

fn parse_board(s: &str) -> Result<BoardFamily, String> {
    BoardFamily::from_name(s).ok_or_else(|| {
        let known: Vec<_> = BoardFamily::ALL.iter().map(|f| f.name()).collect();
        format!("unknown board '{s}', expected one of: {}", known.join(", "))
    })
}

/// Subcommand implied by the executable name (`flashpilot-load`, `debug.exe`, ...).
fn mode_from_program_name(argv0: &OsStr) -> Option<&'static str> {
    let name = Path::new(argv0).file_stem()?.to_string_lossy().to_lowercase();
    if name.contains("load") {
        Some("load")
    } else if name.contains("debug") {
        Some("debug")
    } else {
        None
    }
}

/// Insert the subcommand implied by the executable name, unless already given.
fn with_invocation_mode(mut args: Vec<OsString>) -> Vec<OsString> {
    let Some(mode) = args.first().and_then(|a| mode_from_program_name(a)) else {
        return args;
    };
    if args.get(1).is_some_and(|a| a == mode) {
        return args;
    }
    args.insert(1, OsString::from(mode));
    args
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

/// Tool directory: flag or env, then config, then next to the executable.
fn resolve_tools_dir(cli: &Cli, config: &Config) -> Result<PathBuf> {
    if let Some(dir) = cli.tools_dir.clone().or_else(|| config.tools.dir.clone()) {
        return Ok(dir);
    }
    let exe = env::current_exe()?;
    Ok(exe
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf))
}

fn run(cli: &Cli) -> Result<()> {
    let config = match &cli.config_path {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load(),
    };

    match &cli.command {
        Commands::Load {
            binary,
            checks,
            force_update,
        } => {
            let tools_dir = resolve_tools_dir(cli, &config)?;
            commands::load::cmd_load(
                cli,
                &config,
                &tools_dir,
                binary.as_deref(),
                checks,
                *force_update,
            )
        },
        Commands::Debug { commands: lines } => {
            commands::debug::cmd_debug(&mut flashpilot::ProcessRunner::new(), lines)
        },
        Commands::ListPorts { json } => commands::ports::cmd_list_ports(*json),
    }
}

fn main() -> ExitCode {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var_os("NO_COLOR").is_some() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = match Cli::try_parse_from(with_invocation_mode(env::args_os().collect())) {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(parse_exit_code(&err));
        },
    };
    init_logging(&cli);

    debug!(
        "flashpilot v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("ERROR:").red().bold());
            ExitCode::FAILURE
        },
    }
}
