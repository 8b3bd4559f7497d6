//! Port listing command implementation.

use anyhow::Result;
use console::style;
use flashpilot::device::classify;
use flashpilot::{NativeSerial, PortInfo, PortSet};

fn port_json(port: &PortInfo) -> serde_json::Value {
    let device = classify(port);
    serde_json::json!({
        "name": port.name,
        "device": device.name(),
        "known": device.is_known(),
        "vid": port.vid,
        "pid": port.pid,
        "manufacturer": port.manufacturer,
        "product": port.product,
        "serial": port.serial_number,
    })
}

fn port_line(port: &PortInfo) -> String {
    let device = classify(port);
    let device_type = if device.is_known() {
        format!(" [{}]", style(device.name()).yellow())
    } else {
        String::new()
    };
    let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        format!(" ({vid:04X}:{pid:04X})")
    } else {
        String::new()
    };
    let product = match port.product.as_deref() {
        Some(product) if !product.is_empty() => format!(" - {}", style(product).dim()),
        _ => String::new(),
    };

    format!(
        "  {} {}{device_type}{vid_pid}{product}",
        style("•").green(),
        style(&port.name).cyan()
    )
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let detected = PortSet::new(NativeSerial).detailed();

    if json {
        let ports: Vec<serde_json::Value> = detected.iter().map(port_json).collect();
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "ports": ports,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!("{}", style("Available serial ports:").bold().underlined());
    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
    } else {
        for port in &detected {
            eprintln!("{}", port_line(port));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_json_classifies_vendor() {
        let port = PortInfo {
            vid: Some(0x8087),
            pid: Some(0x0ABA),
            product: Some("Curie".into()),
            ..PortInfo::named("/dev/ttyACM0")
        };
        let value = port_json(&port);

        assert_eq!(value["name"], "/dev/ttyACM0");
        assert_eq!(value["device"], "Intel Curie");
        assert_eq!(value["known"], true);
        assert_eq!(value["vid"], 0x8087);
        assert!(value["serial"].is_null());
    }

    #[test]
    fn test_port_line_unknown_device() {
        console::set_colors_enabled(false);
        let line = port_line(&PortInfo::named("COM3"));
        assert!(line.contains("COM3"));
        assert!(!line.contains('['));
    }

    #[test]
    fn test_port_line_known_device() {
        console::set_colors_enabled(false);
        let port = PortInfo {
            vid: Some(0x2341),
            pid: Some(0x804D),
            ..PortInfo::named("/dev/ttyACM1")
        };
        assert_eq!(port_line(&port), "  • /dev/ttyACM1 [Arduino] (2341:804D)");
    }
}
