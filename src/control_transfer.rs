//! The 8 byte SETUP packet that starts every control transfer.
use crate::endpoint::ENDPOINT_IN;

pub const CONTROL_SETUP_SIZE: usize = 8;

pub const REQUEST_TYPE_STANDARD: u8 = 0x00 << 5;
pub const REQUEST_TYPE_CLASS: u8 = 0x01 << 5;
pub const REQUEST_TYPE_VENDOR: u8 = 0x02 << 5;

pub const RECIPIENT_DEVICE: u8 = 0x00;
pub const RECIPIENT_INTERFACE: u8 = 0x01;
pub const RECIPIENT_ENDPOINT: u8 = 0x02;
pub const RECIPIENT_OTHER: u8 = 0x03;

pub const REQUEST_GET_STATUS: u8 = 0x00;
pub const REQUEST_CLEAR_FEATURE: u8 = 0x01;
pub const REQUEST_SET_FEATURE: u8 = 0x03;
pub const REQUEST_SET_ADDRESS: u8 = 0x05;
pub const REQUEST_GET_DESCRIPTOR: u8 = 0x06;
pub const REQUEST_SET_DESCRIPTOR: u8 = 0x07;
pub const REQUEST_GET_CONFIGURATION: u8 = 0x08;
pub const REQUEST_SET_CONFIGURATION: u8 = 0x09;
pub const REQUEST_GET_INTERFACE: u8 = 0x0a;
pub const REQUEST_SET_INTERFACE: u8 = 0x0b;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlSetup {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl ControlSetup {
    pub fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        ControlSetup {
            request_type,
            request,
            value,
            index,
            length,
        }
    }

    pub fn is_in(&self) -> bool {
        self.request_type & ENDPOINT_IN == ENDPOINT_IN
    }

    /// Little-endian wire layout.
    pub fn to_bytes(&self) -> [u8; CONTROL_SETUP_SIZE] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() < CONTROL_SETUP_SIZE {
            return None;
        }
        Some(ControlSetup {
            request_type: raw[0],
            request: raw[1],
            value: u16::from_le_bytes([raw[2], raw[3]]),
            index: u16::from_le_bytes([raw[4], raw[5]]),
            length: u16::from_le_bytes([raw[6], raw[7]]),
        })
    }

    /// Buffer holding the setup packet followed by `data` (OUT) or
    /// `length` zeroed bytes (IN).
    pub fn fill_buffer(&self, data: &[u8]) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(CONTROL_SETUP_SIZE + self.length as usize);
        buffer.extend_from_slice(&self.to_bytes());
        if self.is_in() {
            buffer.resize(CONTROL_SETUP_SIZE + self.length as usize, 0);
        } else {
            buffer.extend_from_slice(&data[..data.len().min(self.length as usize)]);
        }
        buffer
    }
}
