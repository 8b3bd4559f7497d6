//! # flashpilot
//!
//! A library for resetting, discovering and flashing microcontroller boards
//! through their vendor uploader tools.
//!
//! The uploaders themselves (`bossac`, `dfu-util`, `adb`) are opaque external
//! processes. This crate provides what happens around them:
//!
//! - bootloader-entry reset over the serial control channel
//! - tracking a board across USB re-enumeration
//! - firmware version checks by readback and marker search
//! - one orchestrated pass from discovery to application flash
//!
//! ## Supported Boards
//!
//! - `serial-reset`: native-USB boards flashed with bossac
//! - `dfu-coprocessor`: Curie boards flashed with dfu-util
//! - `adb-sketch` / `adb-firmware`: Linux boards reached through adb
//!
//! ## Features
//!
//! - `native` (default): serial port access via the `serialport` crate
//! - `serde`: Serialization support for configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use flashpilot::{
//!     BoardFamily, NativeSerial, PortSet, ProcessRunner, SilentObserver, Toolchain,
//!     UploadOrchestrator, UploadPlan,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let family = BoardFamily::SerialReset;
//!     let plan = UploadPlan::new(family)
//!         .with_port(Some("/dev/ttyACM0"))
//!         .with_binary(Some("sketch.bin"));
//!
//!     let ports = PortSet::new(NativeSerial);
//!     let tools = Toolchain::new(family, "/opt/flashpilot");
//!     let report = UploadOrchestrator::new(&ports, ProcessRunner::new(), tools)
//!         .run(&plan, &mut SilentObserver)?;
//!
//!     println!("Flashed on {:?}", report.port);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod board;
pub mod compliance;
pub mod device;
pub mod error;
pub mod port;
pub mod process;
pub mod reset;
pub mod upload;

#[cfg(test)]
mod testing;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativePort, NativeSerial};
pub use {
    board::{BoardFamily, Capabilities, FirmwareDomain, Toolchain},
    compliance::{ComplianceCheck, ComplianceChecker, ComplianceResult},
    device::{DeviceIdentity, DeviceKind, IdentityRule, PortChange, PortSet, PortSnapshot, diff},
    error::{Error, Result},
    port::{Port, PortInfo, SerialBackend, SerialConfig},
    process::{CommandLine, CommandRunner, ExitState, ProcessOutcome, ProcessRunner, Verbosity},
    reset::{Deadline, ResetSequencer, ResetTiming},
    upload::{
        DiscoveryPolicy, Phase, SilentObserver, UploadFailure, UploadObserver, UploadOrchestrator,
        UploadPlan, UploadReport,
    },
};
