use std::fmt;

pub const ENDPOINT_IN: u8 = 0x80;
pub const ENDPOINT_OUT: u8 = 0x00;
pub const ENDPOINT_ADDRESS_MASK: u8 = 0x0f;

/// An endpoint address: number in bits 0-3, direction in bit 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint(u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "EP: 0x{:02x} ({})",
            self.0,
            if self.is_control() {
                "Control"
            } else if self.is_in() {
                "In"
            } else {
                "Out"
            }
        )
    }
}

impl From<Endpoint> for u8 {
    fn from(ep: Endpoint) -> u8 {
        ep.0
    }
}

impl From<u8> for Endpoint {
    fn from(address: u8) -> Self {
        Endpoint(address)
    }
}

impl Endpoint {
    pub const CONTROL: Endpoint = Endpoint(0);

    pub fn new(address: u8) -> Self {
        Endpoint(address)
    }

    pub fn in_ep(number: u8) -> Self {
        Endpoint(ENDPOINT_IN | (number & ENDPOINT_ADDRESS_MASK))
    }

    pub fn out_ep(number: u8) -> Self {
        Endpoint(number & ENDPOINT_ADDRESS_MASK)
    }

    pub fn address(&self) -> u8 {
        self.0
    }

    pub fn number(&self) -> u8 {
        self.0 & ENDPOINT_ADDRESS_MASK
    }

    pub fn direction(&self) -> Direction {
        if self.0 & ENDPOINT_IN == ENDPOINT_IN {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn is_control(&self) -> bool {
        self.number() == 0
    }

    pub fn is_in(&self) -> bool {
        self.direction() == Direction::In
    }

    pub fn is_out(&self) -> bool {
        self.direction() == Direction::Out
    }
}
