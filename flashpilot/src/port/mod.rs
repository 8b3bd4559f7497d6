//! Serial control-channel abstraction.
//!
//! The reset sequence only needs a tiny slice of a serial port: open it with a
//! given line configuration, drive DTR, close it. That slice is the [`Port`]
//! trait. Enumeration and opening live on [`SerialBackend`] so the whole
//! device side can be replaced by a scripted fake in tests.
//!
//! ```text
//! +------------------+     +------------------+
//! |  ResetSequencer  |     |     PortSet      |
//! +--------+---------+     +--------+---------+
//!          |  open/set_dtr/close    |  list_ports
//!          v                        v
//! +--------+------------------------+---------+
//! |              SerialBackend                |
//! +--------+------------------------+---------+
//!          |                        |
//!          v                        v
//! +--------+---------+     +--------+---------+
//! |   NativeSerial   |     |  scripted fakes  |
//! |   (serialport)   |     |     (tests)      |
//! +------------------+     +------------------+
//! ```

#[cfg(feature = "native")]
pub mod native;

use std::time::Duration;

use crate::error::Result;

/// Line rate that asks a board to jump into its bootloader.
///
/// Not a real data rate: the CDC-ACM firmware on these boards watches for the
/// host opening the port at 1200 baud and dropping DTR.
pub const BOOTLOADER_TOUCH_BAUD: u32 = 1200;

/// Line settings for opening a control channel.
///
/// Framing is always 8N1 without flow control; only the rate matters to the
/// boards handled here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyACM0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read/write timeout.
    pub timeout: Duration,
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout: Duration::from_millis(1000),
        }
    }

    /// Configuration used for the bootloader-entry touch.
    pub fn bootloader_touch(port_name: impl Into<String>) -> Self {
        Self::new(port_name, BOOTLOADER_TOUCH_BAUD).with_timeout(Duration::from_millis(100))
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Serial port information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial_number: Option<String>,
}

impl PortInfo {
    /// Port info carrying only a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        }
    }
}

/// An open serial control channel.
pub trait Port: Send {
    /// Set DTR (Data Terminal Ready) pin state.
    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Close the port and release resources.
    ///
    /// After calling this method, the port cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;
}

/// Enumerates and opens serial ports.
pub trait SerialBackend {
    /// List all currently visible serial ports.
    fn list_ports(&self) -> Result<Vec<PortInfo>>;

    /// Open a port with the given configuration.
    fn open(&self, config: &SerialConfig) -> Result<Box<dyn Port>>;
}

impl<B: SerialBackend + ?Sized> SerialBackend for &B {
    fn list_ports(&self) -> Result<Vec<PortInfo>> {
        (**self).list_ports()
    }

    fn open(&self, config: &SerialConfig) -> Result<Box<dyn Port>> {
        (**self).open(config)
    }
}

#[cfg(feature = "native")]
pub use native::{NativePort, NativeSerial};
