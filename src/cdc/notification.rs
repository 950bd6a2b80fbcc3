//! CDC notifications from the interrupt endpoint

use bitflags::bitflags;

/// Notification header size
pub const HEADER_LEN: usize = 8;

/// Notification codes
pub mod code {
    pub const NETWORK_CONNECTION: u8 = 0x00;
    pub const RESPONSE_AVAILABLE: u8 = 0x01;
    pub const SERIAL_STATE: u8 = 0x20;
    pub const CONNECTION_SPEED_CHANGE: u8 = 0x2A;
}

bitflags! {
    /// UART state bitmap, from the SERIAL_STATE notification
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SerialState : u16 {
        /// Carrier detect (`bRxCarrier`)
        const DCD = 1 << 0;
        /// Data set ready (`bTxCarrier`)
        const DSR = 1 << 1;
        const BREAK = 1 << 2;
        const RING = 1 << 3;
        const FRAMING_ERROR = 1 << 4;
        const PARITY_ERROR = 1 << 5;
        /// Received data was lost, by the device or by this driver's receive buffer
        const OVERRUN = 1 << 6;
    }
}

/// A decoded notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    NetworkConnection(bool),
    SerialState(SerialState),
    ResponseAvailable,
    /// Connection speed change, downstream and upstream bit rates
    ConnectionSpeed { downstream: u32, upstream: u32 },
    Unsupported { code: u8 },
}

impl Notification {
    /// Decode one notification, or `None` if it's shorter than its header
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        let value = u16::from_le_bytes([bytes[2], bytes[3]]);
        let data = &bytes[HEADER_LEN..];
        let notification = match bytes[1] {
            code::NETWORK_CONNECTION => Notification::NetworkConnection(value != 0),
            code::RESPONSE_AVAILABLE => Notification::ResponseAvailable,
            code::SERIAL_STATE => {
                let bits = match data {
                    [lo, hi, ..] => u16::from_le_bytes([*lo, *hi]),
                    [lo] => u16::from(*lo),
                    [] => 0,
                };
                Notification::SerialState(SerialState::from_bits_truncate(bits))
            }
            code::CONNECTION_SPEED_CHANGE if data.len() >= 8 => Notification::ConnectionSpeed {
                downstream: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
                upstream: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            },
            code => Notification::Unsupported { code },
        };
        Some(notification)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn network_connection() {
        let connected = [0xA1, code::NETWORK_CONNECTION, 1, 0, 0, 0, 0, 0];
        assert_eq!(
            Notification::parse(&connected),
            Some(Notification::NetworkConnection(true))
        );
        let disconnected = [0xA1, code::NETWORK_CONNECTION, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            Notification::parse(&disconnected),
            Some(Notification::NetworkConnection(false))
        );
    }

    #[test]
    fn serial_state() {
        let bytes = [0xA1, code::SERIAL_STATE, 0, 0, 0, 0, 2, 0, 0x43, 0x00];
        assert_eq!(
            Notification::parse(&bytes),
            Some(Notification::SerialState(
                SerialState::DCD | SerialState::DSR | SerialState::OVERRUN
            ))
        );
    }

    #[test]
    fn connection_speed() {
        let mut bytes = vec![0xA1, code::CONNECTION_SPEED_CHANGE, 0, 0, 0, 0, 8, 0];
        bytes.extend_from_slice(&100_000_000u32.to_le_bytes());
        bytes.extend_from_slice(&50_000_000u32.to_le_bytes());
        assert_eq!(
            Notification::parse(&bytes),
            Some(Notification::ConnectionSpeed {
                downstream: 100_000_000,
                upstream: 50_000_000
            })
        );
    }

    #[test]
    fn unsupported_and_short() {
        assert_eq!(
            Notification::parse(&[0xA1, 0x7E, 0, 0, 0, 0, 0, 0]),
            Some(Notification::Unsupported { code: 0x7E })
        );
        assert_eq!(Notification::parse(&[0xA1, 0x20, 0]), None);
    }
}
