use crate::descriptors::endpoint::EndpointDescriptor;
#[cfg(feature = "serde")]
use serde::Serialize;
use super::INTERFACE_DESC_LENGTH;
use std::fmt;
#[cfg_attr(feature = "serde", derive(Serialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub length: u8,
    pub kind: u8,
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_sub_class: u8,
    pub interface_protocol: u8,
    pub iinterface: u8,
    /// Class specific descriptors that followed this interface.
    pub extra: Vec<u8>,
    pub endpoints: Vec<EndpointDescriptor>,
}

impl fmt::Display for InterfaceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "    Interface Descriptor:")?;
        writeln!(f, "      bLength {:>13}", self.length)?;
        writeln!(f, "      bDescriptorType {:>5}", self.kind)?;
        writeln!(f, "      bInterfaceNumber {:>4}", self.interface_number)?;
        writeln!(f, "      bAlternateSetting {:>3}", self.alternate_setting)?;
        writeln!(f, "      bNumEndpoints {:>7}", self.num_endpoints)?;
        writeln!(f, "      bInterfaceClass {:>5}", self.interface_class)?;
        writeln!(f, "      bInterfaceSubClass {:>2}", self.interface_sub_class)?;
        writeln!(f, "      bInterfaceProtocol {:>2}", self.interface_protocol)?;
        writeln!(f, "      iInterface {:>10}", self.iinterface)?;
        self.endpoints.iter().try_for_each(|ep| write!(f, "{}", ep))
    }
}

impl InterfaceDescriptor {
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() < INTERFACE_DESC_LENGTH {
            return None;
        }
        Some(InterfaceDescriptor {
            length: raw[0],
            kind: raw[1],
            interface_number: raw[2],
            alternate_setting: raw[3],
            num_endpoints: raw[4],
            interface_class: raw[5],
            interface_sub_class: raw[6],
            interface_protocol: raw[7],
            iinterface: raw[8],
            extra: Vec::new(),
            endpoints: Vec::with_capacity(raw[4] as usize),
        })
    }
}
