#[cfg(feature = "serde")]
use serde::Serialize;
use super::{le16, DEVICE_DESC_LENGTH};
use std::fmt;
#[cfg_attr(feature = "serde", derive(Serialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub length: u8,
    pub kind: u8,
    pub bcd_usb: u16,
    pub device_class: u8,
    pub device_sub_class: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub imanufacturer: u8,
    pub iproduct: u8,
    pub iserial_number: u8,
    pub num_configurations: u8,
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Device Descriptor:")?;
        writeln!(f, "  bLength {:>17}", self.length)?;
        writeln!(f, "  bDescriptorType {:>9}", self.kind)?;
        writeln!(f, "  bcdUSB {:>18x}.{:02x}", self.bcd_usb >> 8, self.bcd_usb & 0xff)?;
        writeln!(f, "  bDeviceClass {:>12}", self.device_class)?;
        writeln!(f, "  bDeviceSubClass {:>9}", self.device_sub_class)?;
        writeln!(f, "  bDeviceProtocol {:>9}", self.device_protocol)?;
        writeln!(f, "  bMaxPacketSize0 {:>9}", self.max_packet_size0)?;
        writeln!(f, "  idVendor {:>16}", format!("0x{:04x}", self.id_vendor))?;
        writeln!(f, "  idProduct {:>15}", format!("0x{:04x}", self.id_product))?;
        writeln!(f, "  bcdDevice {:>15x}.{:02x}", self.bcd_device >> 8, self.bcd_device & 0xff)?;
        writeln!(f, "  iManufacturer {:>11}", self.imanufacturer)?;
        writeln!(f, "  iProduct {:>16}", self.iproduct)?;
        writeln!(f, "  iSerial {:>17}", self.iserial_number)?;
        writeln!(f, "  bNumConfigurations {:>6}", self.num_configurations)
    }
}

impl DeviceDescriptor {
    /// Decodes the fixed 18 byte layout; `None` if `raw` is shorter.
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() < DEVICE_DESC_LENGTH {
            return None;
        }
        Some(DeviceDescriptor {
            length: raw[0],
            kind: raw[1],
            bcd_usb: le16(raw, 2),
            device_class: raw[4],
            device_sub_class: raw[5],
            device_protocol: raw[6],
            max_packet_size0: raw[7],
            id_vendor: le16(raw, 8),
            id_product: le16(raw, 10),
            bcd_device: le16(raw, 12),
            imanufacturer: raw[14],
            iproduct: raw[15],
            iserial_number: raw[16],
            num_configurations: raw[17],
        })
    }
}
