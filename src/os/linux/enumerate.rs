//! Device discovery through sysfs.
use crate::descriptors::{DEVICE_DESC_LENGTH, DT_CONFIG};
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// One `/sys/bus/usb/devices/<name>` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SysfsDevice {
    pub(crate) name: String,
    pub(crate) dir: PathBuf,
    pub(crate) bus_number: u8,
    pub(crate) device_address: u8,
    pub(crate) port_number: u8,
    /// Device descriptor followed by every configuration descriptor.
    pub(crate) descriptors: Vec<u8>,
}

impl SysfsDevice {
    pub(crate) fn session_id(&self) -> u64 {
        session_id(self.bus_number, self.device_address)
    }

    pub(crate) fn parent_name(&self) -> Option<String> {
        parent_name(&self.name)
    }
}

pub(crate) fn session_id(bus_number: u8, device_address: u8) -> u64 {
    (bus_number as u64) << 8 | device_address as u64
}

/// Root hubs are `usbN`, devices `B-P[.P...]`, interfaces carry a `:`.
fn is_device_name(name: &str) -> bool {
    !name.contains(':') && (name.starts_with("usb") || name.contains('-'))
}

pub(crate) fn parent_name(name: &str) -> Option<String> {
    if name.starts_with("usb") {
        return None;
    }
    match name.rfind('.') {
        Some(dot) => Some(name[..dot].to_string()),
        None => name.split('-').next().map(|bus| format!("usb{}", bus)),
    }
}

pub(crate) fn port_number(name: &str) -> u8 {
    if name.starts_with("usb") {
        return 0;
    }
    name.rsplit(|c| c == '.' || c == '-')
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or(0)
}

/// Parents sort before their children.
fn depth(name: &str) -> usize {
    if name.starts_with("usb") {
        0
    } else {
        1 + name.matches('.').count()
    }
}

pub(crate) fn read_attr(dir: &Path, attr: &str) -> Result<String> {
    let value = fs::read_to_string(dir.join(attr)).map_err(|e| {
        log::debug!("read {}/{} failed: {}", dir.display(), attr, e);
        Error::from(e)
    })?;
    Ok(value.trim().to_string())
}

fn read_u8_attr(dir: &Path, attr: &str) -> Result<u8> {
    read_attr(dir, attr)?.parse().map_err(|_| {
        log::error!("malformed {} in {}", attr, dir.display());
        Error::Io
    })
}

/// Active configuration value, 0 when unconfigured.
pub(crate) fn active_configuration(dir: &Path) -> Result<u8> {
    let value = read_attr(dir, "bConfigurationValue")?;
    if value.is_empty() {
        return Ok(0);
    }
    value.parse().map_err(|_| {
        log::error!("malformed bConfigurationValue {:?}", value);
        Error::Io
    })
}

fn read_device(dir: &Path, name: &str) -> Result<SysfsDevice> {
    let bus_number = read_u8_attr(dir, "busnum")?;
    let device_address = read_u8_attr(dir, "devnum")?;
    let descriptors = fs::read(dir.join("descriptors"))?;
    if descriptors.len() < DEVICE_DESC_LENGTH {
        log::error!("short sysfs descriptors read ({} bytes)", descriptors.len());
        return Err(Error::Io);
    }
    Ok(SysfsDevice {
        name: name.to_string(),
        dir: dir.to_path_buf(),
        bus_number,
        device_address,
        port_number: port_number(name),
        descriptors,
    })
}

/// Every device under `root`, parents first. Entries that cannot be read
/// are skipped.
pub(crate) fn scan(root: &Path) -> Result<Vec<SysfsDevice>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                log::debug!("{}", e);
                continue;
            }
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_device_name(&name) {
            continue;
        }
        match read_device(&entry.path(), &name) {
            Ok(dev) => found.push(dev),
            Err(e) => log::debug!("skipping {}: {}", name, e),
        }
    }
    found.sort_by(|a, b| depth(&a.name).cmp(&depth(&b.name)).then(a.name.cmp(&b.name)));
    Ok(found)
}

/// Splits the configuration descriptors that follow the device descriptor.
pub(crate) fn config_blobs(descriptors: &[u8]) -> Vec<&[u8]> {
    let mut blobs = Vec::new();
    let mut rest = descriptors.get(DEVICE_DESC_LENGTH..).unwrap_or(&[]);
    while rest.len() >= 4 {
        if rest[1] != DT_CONFIG {
            log::debug!("expected config descriptor, found type 0x{:02x}", rest[1]);
            break;
        }
        let total = u16::from_le_bytes([rest[2], rest[3]]) as usize;
        if total < 4 {
            break;
        }
        let len = total.min(rest.len());
        if len < total {
            log::warn!("short descriptor read {}/{}", len, total);
        }
        blobs.push(&rest[..len]);
        rest = &rest[len..];
    }
    blobs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::tests::{CONFIG, DEVICE};

    #[test]
    fn topology_from_names() {
        assert_eq!(parent_name("usb1"), None);
        assert_eq!(parent_name("1-2"), Some("usb1".to_string()));
        assert_eq!(parent_name("3-1.4.2"), Some("3-1.4".to_string()));
        assert_eq!(port_number("usb2"), 0);
        assert_eq!(port_number("1-2"), 2);
        assert_eq!(port_number("3-1.4.2"), 2);
        assert!(is_device_name("1-1.2"));
        assert!(!is_device_name("1-1.2:1.0"));
        assert!(depth("usb1") < depth("1-1") && depth("1-1") < depth("1-1.3"));
        assert_eq!(session_id(3, 7), 0x0307);
    }

    #[test]
    fn splits_configurations() {
        let mut raw = DEVICE.to_vec();
        raw.extend_from_slice(&CONFIG);
        raw.extend_from_slice(&CONFIG);
        let blobs = config_blobs(&raw);
        assert_eq!(blobs.len(), 2);
        assert_eq!(blobs[1].len(), CONFIG.len());
        assert!(config_blobs(&DEVICE).is_empty());
    }

    #[test]
    fn scans_a_sysfs_tree() {
        let root = std::env::temp_dir().join(format!("usbhost-sysfs-{}", std::process::id()));
        let _ = fs::remove_dir_all(&root);
        let mut descriptors = DEVICE.to_vec();
        descriptors.extend_from_slice(&CONFIG);
        for (name, bus, dev) in [("usb1", 1, 1), ("1-1.2", 1, 5), ("1-1", 1, 3)] {
            let dir = root.join(name);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("busnum"), format!("{}\n", bus)).unwrap();
            fs::write(dir.join("devnum"), format!("{}\n", dev)).unwrap();
            fs::write(dir.join("descriptors"), &descriptors).unwrap();
            fs::write(dir.join("bConfigurationValue"), "1\n").unwrap();
        }
        fs::create_dir_all(root.join("1-1:1.0")).unwrap();

        let devices = scan(&root).unwrap();
        let names: Vec<&str> = devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["usb1", "1-1", "1-1.2"]);
        assert_eq!(devices[2].device_address, 5);
        assert_eq!(devices[2].port_number, 2);
        assert_eq!(devices[2].parent_name(), Some("1-1".to_string()));
        assert_eq!(active_configuration(&devices[0].dir).unwrap(), 1);
        fs::remove_dir_all(&root).unwrap();
    }
}
