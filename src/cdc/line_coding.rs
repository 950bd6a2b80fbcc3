//! PSTN line coding

use crate::{Error, Result};

/// Size of the line coding structure on the wire
pub const LINE_CODING_LEN: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One = 0,
    OnePointFive = 1,
    Two = 2,
}

impl TryFrom<u8> for StopBits {
    type Error = Error;
    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => StopBits::One,
            1 => StopBits::OnePointFive,
            2 => StopBits::Two,
            _ => return Err(Error::InvalidResponse),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None = 0,
    Odd = 1,
    Even = 2,
    Mark = 3,
    Space = 4,
}

impl TryFrom<u8> for Parity {
    type Error = Error;
    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Parity::None,
            1 => Parity::Odd,
            2 => Parity::Even,
            3 => Parity::Mark,
            4 => Parity::Space,
            _ => return Err(Error::InvalidResponse),
        })
    }
}

/// Serial parameters for SET_LINE_CODING / GET_LINE_CODING
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineCoding {
    pub bit_rate: u32,
    pub stop_bits: StopBits,
    pub parity: Parity,
    /// 5, 6, 7, 8 or 16
    pub data_bits: u8,
}

impl Default for LineCoding {
    fn default() -> Self {
        LineCoding {
            bit_rate: 115_200,
            stop_bits: StopBits::One,
            parity: Parity::None,
            data_bits: 8,
        }
    }
}

impl LineCoding {
    pub fn to_bytes(&self) -> [u8; LINE_CODING_LEN] {
        let rate = self.bit_rate.to_le_bytes();
        [
            rate[0],
            rate[1],
            rate[2],
            rate[3],
            self.stop_bits as u8,
            self.parity as u8,
            self.data_bits,
        ]
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < LINE_CODING_LEN {
            return Err(Error::InvalidResponse);
        }
        Ok(LineCoding {
            bit_rate: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            stop_bits: StopBits::try_from(bytes[4])?,
            parity: Parity::try_from(bytes[5])?,
            data_bits: bytes[6],
        })
    }
}
