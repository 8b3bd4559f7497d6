//! Error types for flashpilot.

use std::io;
use thiserror::Error;

/// Result type for flashpilot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for flashpilot operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (scratch files, pipes).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The board never showed up within the bounded discovery budget.
    #[error("Timed out waiting for {board} after {attempts} attempts")]
    DiscoveryTimeout {
        /// Human-readable board family name.
        board: String,
        /// Number of probe attempts made.
        attempts: usize,
    },

    /// No new port identity appeared after a bootloader-entry reset.
    ///
    /// This is a soft failure: `original` is the best-known identity and the
    /// run is expected to continue with it.
    #[error("no new port found after resetting {original}")]
    NoNewPort {
        /// Identity the reset was issued on.
        original: String,
    },

    /// The external tool could not be started at all.
    #[error("failed to start {program}: {source}")]
    ProcessStart {
        /// Program path as given on the command line.
        program: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The external tool ran but reported failure.
    #[error("{program} exited with {}", exit_code_text(.code))]
    ProcessExit {
        /// Program path as given on the command line.
        program: String,
        /// Exit code, `None` when terminated by a signal.
        code: Option<i32>,
    },

    /// Firmware readback for a compliance check failed.
    #[error("cannot read back {domain} firmware: {source}")]
    ComplianceRead {
        /// Firmware domain being checked.
        domain: String,
        /// What went wrong during readback.
        #[source]
        source: Box<Error>,
    },

    /// No candidate device is attached.
    #[error("Device not found")]
    DeviceNotFound,

    /// A command line could not be built or parsed.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

#[allow(clippy::ref_option, clippy::trivially_copy_pass_by_ref)]
fn exit_code_text(code: &Option<i32>) -> String {
    match *code {
        Some(code) => format!("exit code {code}"),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

impl Error {
    /// Whether this error is the soft "identity did not change" outcome of a reset.
    pub fn is_soft_reset_failure(&self) -> bool {
        matches!(self, Self::NoNewPort { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_exit_message() {
        let err = Error::ProcessExit {
            program: "bossac".into(),
            code: Some(3),
        };
        assert_eq!(err.to_string(), "bossac exited with exit code 3");

        let err = Error::ProcessExit {
            program: "bossac".into(),
            code: None,
        };
        assert!(err.to_string().contains("signal"));
    }

    #[test]
    fn test_soft_reset_failure() {
        assert!(
            Error::NoNewPort {
                original: "/dev/ttyACM0".into()
            }
            .is_soft_reset_failure()
        );
        assert!(!Error::DeviceNotFound.is_soft_reset_failure());
    }

    #[test]
    fn test_compliance_read_keeps_source() {
        let err = Error::ComplianceRead {
            domain: "radio".into(),
            source: Box::new(Error::ProcessExit {
                program: "dfu-util".into(),
                code: Some(74),
            }),
        };
        let text = err.to_string();
        assert!(text.contains("radio"));
        assert!(text.contains("dfu-util exited with exit code 74"));
    }
}
