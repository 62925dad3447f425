use super::configuration::ConfigDescriptor;
use super::device::DeviceDescriptor;
use super::endpoint::EndpointDescriptor;
use super::interface::InterfaceDescriptor;
use super::DecodeError;

#[derive(Debug, Clone)]
pub enum DescriptorType {
    Device(DeviceDescriptor),
    Configuration(ConfigDescriptor),
    String(String),
    Interface(InterfaceDescriptor),
    Endpoint(EndpointDescriptor),
    /// Class specific, hub, SuperSpeed companion or anything else we do not
    /// decode. Holds the raw bytes including the header.
    Unknown(Vec<u8>),
}

/// Walks a buffer of back to back descriptors.
///
/// Every item is decoded according to its `bDescriptorType`. A descriptor
/// whose `bLength` is below 2 or runs past the end of the buffer ends the walk
/// with an error.
#[derive(Debug, Clone)]
pub struct DescriptorIter<'a> {
    raw: &'a [u8],
}

impl<'a> DescriptorIter<'a> {
    pub fn new(raw: &'a [u8]) -> Self {
        DescriptorIter { raw }
    }
}

impl<'a> Iterator for DescriptorIter<'a> {
    type Item = Result<DescriptorType, DecodeError>;
    fn next(&mut self) -> Option<Self::Item> {
        if self.raw.is_empty() {
            // We are done
            return None;
        }

        let dlength = self.raw[0] as usize;
        if dlength < 2 {
            self.raw = &[];
            return Some(Err(DecodeError::InvalidLength(dlength as u8)));
        }
        if dlength > self.raw.len() {
            let actual = self.raw.len();
            self.raw = &[];
            return Some(Err(DecodeError::Short {
                expected: dlength,
                actual,
            }));
        }

        let (current, rest) = self.raw.split_at(dlength);
        self.raw = rest;
        let kind = current[1];
        let res = match kind {
            super::DT_DEVICE => DeviceDescriptor::from_bytes(current).map(DescriptorType::Device),
            super::DT_CONFIG => ConfigDescriptor::from_bytes(current).map(DescriptorType::Configuration),
            super::DT_STRING => super::parse_string(current).ok().map(DescriptorType::String),
            super::DT_INTERFACE => InterfaceDescriptor::from_bytes(current).map(DescriptorType::Interface),
            super::DT_ENDPOINT => EndpointDescriptor::from_bytes(current).map(DescriptorType::Endpoint),
            _ => {
                log::debug!("Found unknown descriptor: {} {}", kind, dlength);
                Some(DescriptorType::Unknown(current.to_vec()))
            }
        };

        match res {
            Some(desc) => Some(Ok(desc)),
            None => {
                self.raw = &[];
                Some(Err(DecodeError::InvalidLength(dlength as u8)))
            }
        }
    }
}
