//! Firmware version compliance checks.
//!
//! A coprocessor domain is up to date when a known version marker occurs in
//! the first bytes of its partition. The partition is read back with the
//! uploader into a private scratch directory and searched as raw bytes.

use crate::board::{FirmwareDomain, Toolchain};
use crate::error::{Error, Result};
use crate::process::{CommandRunner, Verbosity};
use log::{debug, info, warn};
use std::fs;
use std::io;
use std::path::Path;

/// Bytes read by the throwaway first readback.
const PRIMING_READ_BYTES: usize = 1;

/// Result of checking one domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComplianceResult {
    /// Domain that was checked.
    pub domain: FirmwareDomain,
    /// The marker was absent, so the domain needs re-flashing.
    pub update_required: bool,
}

/// One domain to check, with its expected marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComplianceCheck {
    /// Domain to read back.
    pub domain: FirmwareDomain,
    /// Byte string expected somewhere in the readback.
    pub marker: String,
    /// Number of bytes to read back from the start of the partition.
    pub bytes: usize,
}

impl ComplianceCheck {
    /// Check `domain` for `marker` within its first `bytes` bytes.
    pub fn new(domain: FirmwareDomain, marker: impl Into<String>, bytes: usize) -> Self {
        Self {
            domain,
            marker: marker.into(),
            bytes,
        }
    }
}

/// Runs compliance checks through a toolchain.
pub struct ComplianceChecker<'a> {
    toolchain: &'a Toolchain,
}

impl<'a> ComplianceChecker<'a> {
    /// Checker issuing readbacks with `toolchain`.
    pub fn new(toolchain: &'a Toolchain) -> Self {
        Self { toolchain }
    }

    /// Read back the start of a domain and look for its marker.
    ///
    /// Any readback failure is returned as [`Error::ComplianceRead`]. The
    /// scratch file never outlives the call.
    pub fn check_version<R: CommandRunner>(
        &self,
        runner: &mut R,
        check: &ComplianceCheck,
    ) -> Result<ComplianceResult> {
        let domain = check.domain;
        debug!(
            "Checking {} firmware for {:?} in the first {} bytes",
            domain.name, check.marker, check.bytes
        );

        let data = self
            .read_back(runner, domain, check.bytes)
            .map_err(|source| Error::ComplianceRead {
                domain: domain.name.to_string(),
                source: Box::new(source),
            })?;

        let update_required = !contains_marker(&data, check.marker.as_bytes());
        if update_required {
            info!("{} firmware is outdated", domain.name);
        } else {
            info!("{} firmware is up to date", domain.name);
        }
        Ok(ComplianceResult {
            domain,
            update_required,
        })
    }

    fn read_back<R: CommandRunner>(
        &self,
        runner: &mut R,
        domain: FirmwareDomain,
        bytes: usize,
    ) -> Result<Vec<u8>> {
        let scratch = tempfile::Builder::new().prefix("flashpilot-").tempdir()?;
        let dump = scratch.path().join(format!("{}.bin", domain.name));

        // The first transfer after entering DFU mode is unreliable, so read a
        // single byte and throw it away.
        self.transfer(runner, domain, &dump, PRIMING_READ_BYTES)?;
        remove_if_present(&dump)?;

        self.transfer(runner, domain, &dump, bytes)?;
        let data = fs::read(&dump)?;
        remove_if_present(&dump)?;

        if let Err(e) = scratch.close() {
            warn!("Cannot remove scratch directory: {e}");
        }
        Ok(data)
    }

    fn transfer<R: CommandRunner>(
        &self,
        runner: &mut R,
        domain: FirmwareDomain,
        dest: &Path,
        bytes: usize,
    ) -> Result<()> {
        let cmd = self.toolchain.readback(domain, dest, bytes);
        runner.run(&cmd, None, Verbosity::Quiet).into_result()?;
        Ok(())
    }
}

/// The uploader refuses to overwrite, so every readback needs a fresh path.
fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Raw byte substring search. An empty marker always matches.
pub fn contains_marker(haystack: &[u8], marker: &[u8]) -> bool {
    marker.is_empty() || haystack.windows(marker.len()).any(|w| w == marker)
}
