//! Driver errors

use core::fmt;

use crate::host::TransferStatus;

/// Errors returned by the CDC driver and the RNDIS layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A bad handle, an empty buffer, or an argument out of range
    InvalidArgument,
    /// The payload does not fit the transfer buffer
    InvalidSize,
    /// No matching device, interface or OID
    NotFound,
    /// A control, bulk or teardown deadline expired
    ///
    /// The endpoint was halted and flushed before this was returned.
    Timeout,
    /// The peer answered with a malformed or mismatched message
    InvalidResponse,
    /// A buffer or queue could not take more data
    NoMemory,
    /// The device is closed, disconnected, or the session is not connected
    InvalidState,
    /// The device lacks the pipe or management element this operation needs
    NotSupported,
    /// A waited transfer finished with a USB error
    Transfer(TransferStatus),
    /// The RNDIS device returned a non-success status code
    Rndis(u32),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::InvalidSize => write!(f, "payload exceeds transfer capacity"),
            Error::NotFound => write!(f, "not found"),
            Error::Timeout => write!(f, "timed out"),
            Error::InvalidResponse => write!(f, "invalid response from device"),
            Error::NoMemory => write!(f, "out of buffer space"),
            Error::InvalidState => write!(f, "invalid state"),
            Error::NotSupported => write!(f, "not supported by this device"),
            Error::Transfer(status) => write!(f, "transfer failed: {status:?}"),
            Error::Rndis(status) => write!(f, "RNDIS status {status:#010x}"),
        }
    }
}

impl std::error::Error for Error {}

/// Driver result type
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod test {
    use super::Error;
    use crate::host::TransferStatus;

    #[test]
    fn display() {
        assert_eq!(Error::Timeout.to_string(), "timed out");
        assert_eq!(
            Error::Transfer(TransferStatus::Stall).to_string(),
            "transfer failed: Stall"
        );
        assert_eq!(
            Error::Rndis(0xC00000BB).to_string(),
            "RNDIS status 0xc00000bb"
        );
    }
}
