//! Board families and the uploader command lines they use.
//!
//! Every supported board goes through the same Discover, Reset?, Check?,
//! Flash skeleton. What differs per family is captured by [`Capabilities`]
//! and by the command lines [`Toolchain`] builds for the family's uploader.

use crate::device::IdentityRule;
use crate::process::CommandLine;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};

/// USB id the DFU tool is pointed at on Curie boards.
const DFU_DEVICE: &str = "-d,8087:0ABA";

/// DFU alt setting holding the application sketch.
const DFU_APPLICATION_ALT: u8 = 7;

/// Marker printed by `dfu-util -l` once the board is in DFU mode.
const DFU_PRESENCE_MARKER: &str = "sensor_core";

/// Marker printed by `adb devices` for an authorised, online device.
const ADB_PRESENCE_MARKER: &str = "\tdevice";

/// Sub-directory of the tool directory holding bundled firmware images.
const FIRMWARE_DIR: &str = "firmwares";

/// Dynamic loader search path variable the bundled tools rely on.
#[cfg(target_os = "macos")]
const LIBRARY_PATH_VAR: Option<&str> = Some("DYLD_LIBRARY_PATH");
#[cfg(not(target_os = "macos"))]
const LIBRARY_PATH_VAR: Option<&str> = None;

/// A firmware region that can be read back and re-flashed on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FirmwareDomain {
    /// Domain name used in configuration and messages.
    pub name: &'static str,
    /// Partition (DFU alt setting) holding the domain.
    pub alt: u8,
    /// Bundled image file name under `firmwares/`.
    pub image: &'static str,
}

/// Bluetooth radio coprocessor firmware.
pub const RADIO: FirmwareDomain = FirmwareDomain {
    name: "radio",
    alt: 8,
    image: "ble_core.bin",
};

/// Real-time OS core firmware.
pub const REAL_TIME_CORE: FirmwareDomain = FirmwareDomain {
    name: "real-time-core",
    alt: 2,
    image: "rtos.bin",
};

/// Behavioural switches of a board family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Reset into the bootloader with the 1200 baud touch.
    pub supports_auto_reset: bool,
    /// After the touch, wait for the board to come back under a new name.
    pub waits_for_new_port: bool,
    /// Firmware domains can be read back and version-checked.
    pub supports_compliance_check: bool,
    /// Presence is detected by polling the uploader's own listing.
    pub uses_static_discovery_poll: bool,
    /// How a port name is rewritten before the uploader sees it.
    pub identity_rule: IdentityRule,
}

/// Supported board families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum BoardFamily {
    /// Native-USB SAMD boards flashed with bossac after a 1200 baud touch.
    #[default]
    SerialReset,
    /// Curie boards flashed with dfu-util, with radio and RTOS coprocessors.
    DfuCoprocessor,
    /// Linux boards running sketches, reached through adb.
    AdbSketch,
    /// Linux boards taking a whole firmware image, reached through adb.
    AdbFirmware,
}

impl BoardFamily {
    /// All families, in display order.
    pub const ALL: [Self; 4] = [
        Self::SerialReset,
        Self::DfuCoprocessor,
        Self::AdbSketch,
        Self::AdbFirmware,
    ];

    /// Capability set of this family.
    pub fn capabilities(self) -> Capabilities {
        match self {
            Self::SerialReset => Capabilities {
                supports_auto_reset: true,
                waits_for_new_port: true,
                supports_compliance_check: false,
                uses_static_discovery_poll: false,
                identity_rule: IdentityRule::StripDevPrefix,
            },
            Self::DfuCoprocessor => Capabilities {
                supports_auto_reset: false,
                waits_for_new_port: false,
                supports_compliance_check: true,
                uses_static_discovery_poll: true,
                identity_rule: IdentityRule::Verbatim,
            },
            Self::AdbSketch | Self::AdbFirmware => Capabilities {
                supports_auto_reset: false,
                waits_for_new_port: false,
                supports_compliance_check: false,
                uses_static_discovery_poll: true,
                identity_rule: IdentityRule::Verbatim,
            },
        }
    }

    /// Firmware domains that can be checked and re-flashed.
    pub fn domains(self) -> &'static [FirmwareDomain] {
        match self {
            Self::DfuCoprocessor => &[RADIO, REAL_TIME_CORE],
            _ => &[],
        }
    }

    /// Look up one of this family's domains by name.
    pub fn domain(self, name: &str) -> Option<FirmwareDomain> {
        self.domains().iter().copied().find(|d| d.name == name)
    }

    /// Uploader executable name.
    pub fn tool_name(self) -> &'static str {
        match self {
            Self::SerialReset => "bossac",
            Self::DfuCoprocessor => "dfu-util",
            Self::AdbSketch | Self::AdbFirmware => "adb",
        }
    }

    /// Configuration name.
    pub fn name(self) -> &'static str {
        match self {
            Self::SerialReset => "serial-reset",
            Self::DfuCoprocessor => "dfu-coprocessor",
            Self::AdbSketch => "adb-sketch",
            Self::AdbFirmware => "adb-firmware",
        }
    }

    /// Parse a configuration name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "serial-reset" | "bossac" | "samd" => Some(Self::SerialReset),
            "dfu-coprocessor" | "dfu" | "curie" => Some(Self::DfuCoprocessor),
            "adb-sketch" => Some(Self::AdbSketch),
            "adb-firmware" => Some(Self::AdbFirmware),
            _ => None,
        }
    }
}

impl fmt::Display for BoardFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Builds uploader command lines for one family from a tool directory.
#[derive(Debug, Clone)]
pub struct Toolchain {
    family: BoardFamily,
    dir: PathBuf,
}

impl Toolchain {
    /// Toolchain for `family` with binaries and firmware images under `dir`.
    pub fn new(family: BoardFamily, dir: impl Into<PathBuf>) -> Self {
        Self {
            family,
            dir: dir.into(),
        }
    }

    /// Board family.
    pub fn family(&self) -> BoardFamily {
        self.family
    }

    /// Tool directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Full path of the uploader binary.
    pub fn tool_path(&self) -> PathBuf {
        self.dir.join(self.family.tool_name())
    }

    /// Path of a bundled firmware image.
    pub fn firmware_image(&self, domain: FirmwareDomain) -> PathBuf {
        self.dir.join(FIRMWARE_DIR).join(domain.image)
    }

    fn base(&self) -> CommandLine {
        let mut cmd = CommandLine::new(path_arg(&self.tool_path()));
        if let Some(var) = LIBRARY_PATH_VAR {
            let current = std::env::var_os(var);
            if let Some(value) = extend_search_path(current.as_deref(), &self.dir) {
                cmd = cmd.env(var, value);
            }
        }
        if self.family == BoardFamily::DfuCoprocessor {
            cmd = cmd.arg(DFU_DEVICE);
        }
        cmd
    }

    /// Command listing attached boards, and the marker meaning "present".
    pub fn discovery_probe(&self) -> Option<(CommandLine, &'static str)> {
        match self.family {
            BoardFamily::DfuCoprocessor => Some((self.base().arg("-l"), DFU_PRESENCE_MARKER)),
            BoardFamily::AdbSketch | BoardFamily::AdbFirmware => {
                Some((self.base().arg("devices"), ADB_PRESENCE_MARKER))
            },
            BoardFamily::SerialReset => None,
        }
    }

    /// Read `bytes` bytes of `domain` into `dest`.
    pub fn readback(&self, domain: FirmwareDomain, dest: &Path, bytes: usize) -> CommandLine {
        self.base()
            .arg("-U")
            .arg(path_arg(dest))
            .arg("--alt")
            .arg(domain.alt.to_string())
            .arg("-K")
            .arg(bytes.to_string())
    }

    /// Write the bundled image of `domain`.
    pub fn reflash(&self, domain: FirmwareDomain) -> CommandLine {
        self.base()
            .arg("-D")
            .arg(path_arg(&self.firmware_image(domain)))
            .arg("--alt")
            .arg(domain.alt.to_string())
    }

    /// Commands flashing the application and relaunching it, in order.
    pub fn flash_application(&self, port: Option<&str>, binary: &Path) -> Vec<CommandLine> {
        let binary = path_arg(binary);
        match self.family {
            BoardFamily::SerialReset => {
                let mut cmd = self.base().args(["-i", "-d"]);
                if let Some(port) = port {
                    let bare = self.family.capabilities().identity_rule.normalize(port);
                    cmd = cmd.arg(format!("--port={bare}"));
                }
                vec![
                    cmd.args(["-U", "true", "-i", "-e", "-w", "-v"])
                        .arg(binary)
                        .arg("-R"),
                ]
            },
            BoardFamily::DfuCoprocessor => vec![
                self.base()
                    .arg("-D")
                    .arg(binary)
                    .arg("-v")
                    .arg("--alt")
                    .arg(DFU_APPLICATION_ALT.to_string())
                    .arg("-R"),
            ],
            BoardFamily::AdbSketch => vec![
                self.base()
                    .arg("push")
                    .arg(binary)
                    .arg("/sketch/sketch.elf"),
                self.base()
                    .arg("shell")
                    .arg("/opt/cln/galileo/launcher.sh"),
            ],
            BoardFamily::AdbFirmware => vec![
                self.base()
                    .arg("push")
                    .arg(binary)
                    .arg("/tmp/firmware.bin"),
                self.base()
                    .arg("shell")
                    .arg("/usr/bin/firmware-update /tmp/firmware.bin"),
            ],
        }
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Append `dir` to a loader search path unless it is already listed.
///
/// Returns `None` when nothing needs to change.
pub fn extend_search_path(current: Option<&OsStr>, dir: &Path) -> Option<OsString> {
    let mut entries: Vec<PathBuf> = current
        .map(|c| std::env::split_paths(c).collect())
        .unwrap_or_default();
    if entries.iter().any(|e| e == dir) {
        return None;
    }
    entries.push(dir.to_path_buf());
    std::env::join_paths(entries).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_names_round_trip() {
        for family in BoardFamily::ALL {
            assert_eq!(BoardFamily::from_name(family.name()), Some(family));
        }
        assert_eq!(BoardFamily::from_name("DFU"), Some(BoardFamily::DfuCoprocessor));
        assert_eq!(BoardFamily::from_name("esp32"), None);
    }

    #[test]
    fn test_capabilities() {
        let serial = BoardFamily::SerialReset.capabilities();
        assert!(serial.supports_auto_reset);
        assert!(!serial.uses_static_discovery_poll);
        assert_eq!(serial.identity_rule, IdentityRule::StripDevPrefix);

        let dfu = BoardFamily::DfuCoprocessor.capabilities();
        assert!(dfu.supports_compliance_check);
        assert!(dfu.uses_static_discovery_poll);
        assert!(!dfu.supports_auto_reset);

        assert!(!BoardFamily::AdbSketch.capabilities().supports_compliance_check);
    }

    #[test]
    fn test_domains() {
        assert_eq!(BoardFamily::DfuCoprocessor.domain("radio"), Some(RADIO));
        assert_eq!(BoardFamily::SerialReset.domain("radio"), None);
        assert!(BoardFamily::AdbFirmware.domains().is_empty());
    }

    #[test]
    fn test_bossac_application_command() {
        let tools = Toolchain::new(BoardFamily::SerialReset, "/opt/tools");
        let cmds = tools.flash_application(Some("/dev/ttyACM1"), Path::new("/tmp/sketch.bin"));

        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].program(), "/opt/tools/bossac");
        assert_eq!(
            cmds[0].arguments(),
            [
                "-i",
                "-d",
                "--port=ttyACM1",
                "-U",
                "true",
                "-i",
                "-e",
                "-w",
                "-v",
                "/tmp/sketch.bin",
                "-R"
            ]
        );
    }

    #[test]
    fn test_dfu_commands() {
        let tools = Toolchain::new(BoardFamily::DfuCoprocessor, "/opt/tools");

        let (discovery, marker) = tools.discovery_probe().unwrap();
        assert_eq!(discovery.arguments(), ["-d,8087:0ABA", "-l"]);
        assert_eq!(marker, "sensor_core");

        let readback = tools.readback(RADIO, Path::new("/tmp/dump.bin"), 64);
        assert_eq!(
            readback.arguments(),
            ["-d,8087:0ABA", "-U", "/tmp/dump.bin", "--alt", "8", "-K", "64"]
        );

        let reflash = tools.reflash(REAL_TIME_CORE);
        assert_eq!(
            reflash.arguments(),
            ["-d,8087:0ABA", "-D", "/opt/tools/firmwares/rtos.bin", "--alt", "2"]
        );

        let app = tools.flash_application(None, Path::new("app.bin"));
        assert_eq!(
            app[0].arguments(),
            ["-d,8087:0ABA", "-D", "app.bin", "-v", "--alt", "7", "-R"]
        );
    }

    #[test]
    fn test_adb_application_pushes_then_relaunches() {
        let tools = Toolchain::new(BoardFamily::AdbSketch, "/opt/tools");
        let cmds = tools.flash_application(None, Path::new("sketch.elf"));

        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0].arguments()[0], "push");
        assert_eq!(cmds[1].arguments()[0], "shell");
        assert!(tools.discovery_probe().unwrap().1.contains("device"));
    }

    #[cfg(unix)]
    #[test]
    fn test_extend_search_path_is_idempotent() {
        let dir = Path::new("/opt/tools");

        let fresh = extend_search_path(None, dir).unwrap();
        assert_eq!(fresh, OsString::from("/opt/tools"));

        let extended = extend_search_path(Some(OsStr::new("/usr/lib")), dir).unwrap();
        assert_eq!(extended, OsString::from("/usr/lib:/opt/tools"));

        assert!(extend_search_path(Some(&extended), dir).is_none());
    }
}
