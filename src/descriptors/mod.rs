//! Decoding of the binary USB descriptors the core caches and hands out.
//!
//! Everything in here is pure: `parse` takes the raw little-endian bytes as the
//! device reports them and returns the decoded structure or a [`DecodeError`].
pub mod configuration;
pub mod descriptor;
pub mod device;
pub mod endpoint;
pub mod interface;

pub use configuration::ConfigDescriptor;
pub use descriptor::{DescriptorIter, DescriptorType};
pub use device::DeviceDescriptor;
pub use endpoint::EndpointDescriptor;
pub use interface::InterfaceDescriptor;

use thiserror::Error;

pub const DT_DEVICE: u8 = 0x01;
pub const DT_CONFIG: u8 = 0x02;
pub const DT_STRING: u8 = 0x03;
pub const DT_INTERFACE: u8 = 0x04;
pub const DT_ENDPOINT: u8 = 0x05;

pub const DEVICE_DESC_LENGTH: usize = 18;
pub const CONFIG_DESC_LENGTH: usize = 9;
pub const INTERFACE_DESC_LENGTH: usize = 9;
pub const ENDPOINT_DESC_LENGTH: usize = 7;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("descriptor too short: need {expected} bytes, got {actual}")]
    Short { expected: usize, actual: usize },
    #[error("unexpected descriptor type 0x{found:02x}, expected 0x{expected:02x}")]
    WrongType { expected: u8, found: u8 },
    #[error("invalid descriptor length {0}")]
    InvalidLength(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    Device,
    Configuration,
    String,
}

#[derive(Debug, Clone)]
pub enum Parsed {
    Device(DeviceDescriptor),
    Configuration(ConfigDescriptor),
    String(String),
}

pub fn parse(raw: &[u8], kind: DescriptorKind) -> Result<Parsed, DecodeError> {
    match kind {
        DescriptorKind::Device => parse_device(raw).map(Parsed::Device),
        DescriptorKind::Configuration => parse_configuration(raw).map(Parsed::Configuration),
        DescriptorKind::String => parse_string(raw).map(Parsed::String),
    }
}

pub(crate) fn le16(raw: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([raw[at], raw[at + 1]])
}

fn header(raw: &[u8], expected_type: u8, min_length: usize) -> Result<usize, DecodeError> {
    if raw.len() < 2 {
        return Err(DecodeError::Short {
            expected: min_length,
            actual: raw.len(),
        });
    }
    let length = raw[0];
    if raw[1] != expected_type {
        return Err(DecodeError::WrongType {
            expected: expected_type,
            found: raw[1],
        });
    }
    if (length as usize) < min_length {
        return Err(DecodeError::InvalidLength(length));
    }
    if raw.len() < length as usize {
        return Err(DecodeError::Short {
            expected: length as usize,
            actual: raw.len(),
        });
    }
    Ok(length as usize)
}

pub fn parse_device(raw: &[u8]) -> Result<DeviceDescriptor, DecodeError> {
    let length = header(raw, DT_DEVICE, DEVICE_DESC_LENGTH)?;
    DeviceDescriptor::from_bytes(&raw[..length]).ok_or(DecodeError::Short {
        expected: DEVICE_DESC_LENGTH,
        actual: length,
    })
}

/// Decodes a full configuration blob (`wTotalLength` bytes) into the
/// configuration, its interfaces (one entry per alternate setting) and their
/// endpoints.
pub fn parse_configuration(raw: &[u8]) -> Result<ConfigDescriptor, DecodeError> {
    header(raw, DT_CONFIG, CONFIG_DESC_LENGTH)?;
    let total = u16::from_le_bytes([raw[2], raw.get(3).copied().unwrap_or(0)]) as usize;
    let raw = if total < raw.len() {
        &raw[..total]
    } else {
        if total > raw.len() {
            log::warn!(
                "short config descriptor read {}/{}, parsing what is there",
                raw.len(),
                total
            );
        }
        raw
    };

    let mut descs = DescriptorIter::new(raw);
    let mut config = match descs.next() {
        Some(Ok(DescriptorType::Configuration(conf))) => conf,
        Some(Ok(other)) => {
            log::debug!("expected configuration descriptor, found {:?}", other);
            return Err(DecodeError::WrongType {
                expected: DT_CONFIG,
                found: raw[1],
            });
        }
        Some(Err(err)) => return Err(err),
        None => {
            return Err(DecodeError::Short {
                expected: CONFIG_DESC_LENGTH,
                actual: raw.len(),
            })
        }
    };

    for kind in descs {
        match kind? {
            DescriptorType::Interface(iface) => config.interfaces.push(iface),
            DescriptorType::Endpoint(endpoint) => match config.interfaces.last_mut() {
                Some(iface) => iface.endpoints.push(endpoint),
                None => log::debug!("endpoint 0x{:02x} before any interface", endpoint.endpoint_address),
            },
            DescriptorType::Unknown(bytes) => match config.interfaces.last_mut() {
                Some(iface) => iface.extra.extend_from_slice(&bytes),
                None => config.extra.extend_from_slice(&bytes),
            },
            other => {
                log::debug!("Unexpected descriptor inside configuration: {:?}", other);
            }
        }
    }
    Ok(config)
}

/// String descriptors carry UTF-16LE text after the two byte header.
pub fn parse_string(raw: &[u8]) -> Result<String, DecodeError> {
    let length = header(raw, DT_STRING, 2)?;
    let utf: Vec<u16> = raw[2..length]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    Ok(String::from_utf16_lossy(&utf))
}

/// String descriptor zero lists the supported language ids.
pub fn parse_language_ids(raw: &[u8]) -> Result<Vec<u16>, DecodeError> {
    let length = header(raw, DT_STRING, 2)?;
    Ok(raw[2..length]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect())
}
