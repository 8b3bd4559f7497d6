//! Native serial port implementation using the `serialport` crate.

use {
    crate::{
        error::{Error, Result},
        port::{Port, PortInfo, SerialBackend, SerialConfig},
    },
    log::trace,
};

/// Native serial port implementation.
pub struct NativePort {
    port: Option<Box<dyn serialport::SerialPort>>,
    name: String,
}

impl NativePort {
    /// Open a serial port with the given configuration, framed 8N1.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let port = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()?;
        trace!("Opened {} at {} baud", config.port_name, config.baud_rate);

        Ok(Self {
            port: Some(port),
            name: config.port_name.clone(),
        })
    }
}

impl Port for NativePort {
    fn set_dtr(&mut self, level: bool) -> Result<()> {
        trace!("Setting DTR to {level} on {}", self.name);
        match self.port {
            Some(ref mut p) => Ok(p.write_data_terminal_ready(level)?),
            None => Err(Error::Serial(serialport::Error::new(
                serialport::ErrorKind::NoDevice,
                "Port is closed",
            ))),
        }
    }

    fn close(&mut self) -> Result<()> {
        // Dropping the handle closes the descriptor
        self.port.take();
        Ok(())
    }
}

/// Serial backend talking to the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeSerial;

impl SerialBackend for NativeSerial {
    fn list_ports(&self) -> Result<Vec<PortInfo>> {
        let ports = serialport::available_ports().map_err(Error::Serial)?;

        Ok(ports
            .into_iter()
            .map(|p| match p.port_type {
                serialport::SerialPortType::UsbPort(info) => {
                    trace!(
                        "Found USB port: {} (VID: {:04X}, PID: {:04X})",
                        p.port_name, info.vid, info.pid
                    );
                    PortInfo {
                        name: p.port_name,
                        vid: Some(info.vid),
                        pid: Some(info.pid),
                        manufacturer: info.manufacturer,
                        product: info.product,
                        serial_number: info.serial_number,
                    }
                },
                _ => PortInfo::named(p.port_name),
            })
            .collect())
    }

    fn open(&self, config: &SerialConfig) -> Result<Box<dyn Port>> {
        Ok(Box::new(NativePort::open(config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_ports() {
        // Only checks that enumeration doesn't panic on this host
        let _ = NativeSerial.list_ports();
    }

    #[test]
    fn test_open_missing_port_fails() {
        let config = SerialConfig::bootloader_touch("/dev/flashpilot-no-such-port");
        assert!(NativeSerial.open(&config).is_err());
    }
}
