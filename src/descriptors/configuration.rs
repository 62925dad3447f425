use crate::descriptors::interface::InterfaceDescriptor;
#[cfg(feature = "serde")]
use serde::Serialize;
use super::{le16, CONFIG_DESC_LENGTH};
use std::fmt;

pub const CONFIG_ATTR_SELF_POWERED: u8 = 0x40;
pub const CONFIG_ATTR_REMOTE_WAKEUP: u8 = 0x20;

#[cfg_attr(feature = "serde", derive(Serialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDescriptor {
    pub length: u8,
    pub kind: u8,
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub iconfiguration: u8,
    pub bmattributes: u8,
    pub max_power: u8,
    /// Descriptors between the configuration and its first interface.
    pub extra: Vec<u8>,
    /// One entry per (interface, alternate setting) pair, in descriptor order.
    pub interfaces: Vec<InterfaceDescriptor>,
}

impl fmt::Display for ConfigDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "  Configuration Descriptor:")?;
        writeln!(f, "    bLength {:>15}", self.length)?;
        writeln!(f, "    bDescriptorType {:>7}", self.kind)?;
        writeln!(f, "    wTotalLength {:>10}", format!("0x{:04x}", self.total_length))?;
        writeln!(f, "    bNumInterfaces {:>8}", self.num_interfaces)?;
        writeln!(f, "    bConfigurationValue {:>3}", self.configuration_value)?;
        writeln!(f, "    iConfiguration {:>8}", self.iconfiguration)?;
        writeln!(f, "    bmAttributes {:>10}", format!("0x{:02x}", self.bmattributes))?;
        if self.bmattributes & CONFIG_ATTR_SELF_POWERED != 0 {
            writeln!(f, "      Self Powered")?;
        }
        if self.bmattributes & CONFIG_ATTR_REMOTE_WAKEUP != 0 {
            writeln!(f, "      Remote Wakeup")?;
        }
        writeln!(f, "    MaxPower {:>12}mA", self.max_power as u32 * 2)?;
        self.interfaces.iter().try_for_each(|iface| write!(f, "{}", iface))
    }
}

impl ConfigDescriptor {
    /// Decodes the 9 byte header. Interfaces are attached by
    /// [`super::parse_configuration`].
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() < CONFIG_DESC_LENGTH {
            return None;
        }
        Some(ConfigDescriptor {
            length: raw[0],
            kind: raw[1],
            total_length: le16(raw, 2),
            num_interfaces: raw[4],
            configuration_value: raw[5],
            iconfiguration: raw[6],
            bmattributes: raw[7],
            max_power: raw[8],
            extra: Vec::new(),
            interfaces: Vec::new(),
        })
    }

    /// All alternate settings of `interface_number`.
    pub fn alt_settings(&self, interface_number: u8) -> impl Iterator<Item = &InterfaceDescriptor> {
        self.interfaces
            .iter()
            .filter(move |i| i.interface_number == interface_number)
    }
}
