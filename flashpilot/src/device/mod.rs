//! Device discovery: port snapshots and snapshot diffing.
//!
//! A board that resets into its bootloader usually drops off the bus and comes
//! back under a different name. Discovery is therefore done by comparing
//! [`PortSnapshot`]s taken before and after the reset rather than by looking
//! for a specific name.

use crate::port::{PortInfo, SerialBackend};
use log::{debug, trace};
use std::collections::{BTreeMap, BTreeSet};

/// OS-visible name of an attached device endpoint (e.g. "/dev/ttyACM0", "COM3").
pub type DeviceIdentity = String;

/// Known USB vendors of boards handled by this tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Arduino / Genuino native USB boards.
    Arduino,
    /// Intel Curie boards in DFU mode.
    IntelCurie,
    /// Android-debug-bridge capable boards.
    AdbBridge,
    /// Generic USB-to-serial bridge (CH340, CP210x, FTDI).
    UsbSerialBridge,
    /// Unknown device.
    Unknown,
}

/// Known USB vendor IDs.
const KNOWN_USB_VENDORS: &[(u16, DeviceKind)] = &[
    (0x2341, DeviceKind::Arduino),
    (0x2A03, DeviceKind::Arduino),
    (0x8087, DeviceKind::IntelCurie),
    (0x18D1, DeviceKind::AdbBridge),
    (0x1A86, DeviceKind::UsbSerialBridge),
    (0x10C4, DeviceKind::UsbSerialBridge),
    (0x0403, DeviceKind::UsbSerialBridge),
];

impl DeviceKind {
    /// Classify a USB vendor ID.
    #[must_use]
    pub fn from_vid(vid: u16) -> Self {
        KNOWN_USB_VENDORS
            .iter()
            .find(|(known, _)| *known == vid)
            .map_or(Self::Unknown, |(_, kind)| *kind)
    }

    /// Get a human-readable name for the device kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Arduino => "Arduino",
            Self::IntelCurie => "Intel Curie",
            Self::AdbBridge => "ADB bridge",
            Self::UsbSerialBridge => "USB-serial bridge",
            Self::Unknown => "Unknown",
        }
    }

    /// Check if this is a known/expected device kind.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// Classify a port by its USB vendor ID.
pub fn classify(info: &PortInfo) -> DeviceKind {
    info.vid.map_or(DeviceKind::Unknown, DeviceKind::from_vid)
}

/// The set of device identities visible at one instant.
///
/// Ordered so that iteration, and therefore tie-breaking, is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortSnapshot {
    ports: BTreeSet<DeviceIdentity>,
}

impl PortSnapshot {
    /// An empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether no device was visible.
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Number of visible devices.
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    /// Whether `identity` was visible.
    pub fn contains(&self, identity: &str) -> bool {
        self.ports.contains(identity)
    }

    /// Visible identities in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.ports.iter().map(String::as_str)
    }
}

impl<S: Into<DeviceIdentity>> FromIterator<S> for PortSnapshot {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            ports: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// What changed between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortChange {
    /// Same identities in both snapshots.
    Unchanged,
    /// Exactly one identity is present in only one of the snapshots.
    Changed(DeviceIdentity),
    /// Several identities changed at once; which one is the board is unknown.
    Ambiguous(Vec<DeviceIdentity>),
}

impl PortChange {
    /// The changed identity, only when it is unambiguous.
    pub fn identity(&self) -> Option<&str> {
        match self {
            Self::Changed(id) => Some(id),
            Self::Unchanged | Self::Ambiguous(_) => None,
        }
    }

    /// Whether anything changed at all.
    pub fn is_changed(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Live view of the attached devices.
pub struct PortSet<B> {
    backend: B,
}

impl<B: SerialBackend> PortSet<B> {
    /// Wrap a serial backend.
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    /// Backend used for enumeration.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Snapshot the currently visible ports.
    ///
    /// Enumeration failures are logged and produce an empty snapshot.
    pub fn list(&self) -> PortSnapshot {
        match self.backend.list_ports() {
            Ok(ports) => {
                let snapshot: PortSnapshot = ports.into_iter().map(|p| p.name).collect();
                trace!("Port snapshot: {:?}", snapshot.ports);
                snapshot
            },
            Err(e) => {
                debug!("Failed to enumerate serial ports: {e}");
                PortSnapshot::new()
            },
        }
    }

    /// Detailed port information, for display.
    pub fn detailed(&self) -> Vec<PortInfo> {
        self.backend.list_ports().unwrap_or_else(|e| {
            debug!("Failed to enumerate serial ports: {e}");
            Vec::new()
        })
    }
}

/// Compare two snapshots.
///
/// Each identity in `before` counts once and each in `after` counts once more;
/// identities whose total is exactly one appeared or disappeared. The result is
/// symmetric: swapping the arguments finds the same identities.
pub fn diff(before: &PortSnapshot, after: &PortSnapshot) -> PortChange {
    let mut counts: BTreeMap<&str, u8> = BTreeMap::new();
    for id in before.iter() {
        *counts.entry(id).or_default() += 1;
    }
    for id in after.iter() {
        *counts.entry(id).or_default() += 1;
    }

    let mut changed: Vec<DeviceIdentity> = counts
        .into_iter()
        .filter(|(_, n)| *n == 1)
        .map(|(id, _)| id.to_string())
        .collect();

    match changed.len() {
        0 => PortChange::Unchanged,
        1 => PortChange::Changed(changed.remove(0)),
        _ => PortChange::Ambiguous(changed),
    }
}

/// Rewrite an identity for a tool that wants a bare device name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum IdentityRule {
    /// Pass the identity through unchanged.
    #[default]
    Verbatim,
    /// Drop a leading "/dev/" ("/dev/ttyACM0" becomes "ttyACM0").
    StripDevPrefix,
}

impl IdentityRule {
    /// Apply the rule.
    pub fn normalize(self, identity: &str) -> String {
        match self {
            Self::Verbatim => identity.to_string(),
            Self::StripDevPrefix => identity
                .strip_prefix("/dev/")
                .unwrap_or(identity)
                .to_string(),
        }
    }
}
