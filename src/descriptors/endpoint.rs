use crate::transfer::TransferType;
#[cfg(feature = "serde")]
use serde::Serialize;
use super::{le16, ENDPOINT_DESC_LENGTH};
use std::fmt;
#[cfg_attr(feature = "serde", derive(Serialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub length: u8,
    pub kind: u8,
    pub endpoint_address: u8,
    pub bm_attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl fmt::Display for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let dir = if self.endpoint_address & 0x80 != 0 { "IN" } else { "OUT" };
        writeln!(f, "      Endpoint Descriptor:")?;
        writeln!(f, "        bLength {:>11}", self.length)?;
        writeln!(f, "        bDescriptorType {:>3}", self.kind)?;
        writeln!(
            f,
            "        bEndpointAddress  0x{:02x}  EP {} {}",
            self.endpoint_address,
            self.endpoint_address & 0x0f,
            dir
        )?;
        writeln!(f, "        bmAttributes {:>6}  {:?}", self.bm_attributes, self.transfer_type())?;
        writeln!(f, "        wMaxPacketSize {:>4}", format!("0x{:04x}", self.max_packet_size))?;
        writeln!(f, "        bInterval {:>9}", self.interval)
    }
}

impl EndpointDescriptor {
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() < ENDPOINT_DESC_LENGTH {
            return None;
        }
        Some(EndpointDescriptor {
            length: raw[0],
            kind: raw[1],
            endpoint_address: raw[2],
            bm_attributes: raw[3],
            max_packet_size: le16(raw, 4),
            interval: raw[6],
        })
    }

    pub fn transfer_type(&self) -> TransferType {
        TransferType::from_attributes(self.bm_attributes)
    }

    /// Bytes per service interval: `wMaxPacketSize` bits 0-10 times the
    /// additional-transaction multiplier in bits 11-12 for isochronous and
    /// interrupt endpoints.
    pub fn max_iso_packet_size(&self) -> usize {
        let val = self.max_packet_size;
        let mut size = (val & 0x07ff) as usize;
        match self.transfer_type() {
            TransferType::Isochronous | TransferType::Interrupt => {
                size *= 1 + ((val >> 11) & 3) as usize;
            }
            _ => {}
        }
        size
    }
}
