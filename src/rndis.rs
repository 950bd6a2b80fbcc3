//! RNDIS over CDC
//!
//! RNDIS tunnels Ethernet frames over the bulk pipes of a CDC function, and
//! runs a command / response protocol over class control requests:
//! SEND_ENCAPSULATED_COMMAND carries a message to the device, and
//! GET_ENCAPSULATED_RESPONSE reads its answer. [`RndisSession`] drives that
//! protocol. [`message`] has the wire format.
//!
//! ```no_run
//! use usbh_cdc_rndis::cdc::{CdcDriver, DeviceConfig, DriverConfig};
//! use usbh_cdc_rndis::rndis::{RndisConfig, RndisSession};
//! # fn host() -> std::sync::Arc<dyn usbh_cdc_rndis::host::UsbHost> { unimplemented!() }
//!
//! let driver = CdcDriver::install(host(), DriverConfig::default());
//! let device = driver.open(0x1E0E, 0x9011, 0, DeviceConfig::default())?;
//! let session = RndisSession::new(device, RndisConfig::default());
//! session.bring_up()?;
//! println!("MAC {:02x?}, connected: {}", session.mac_address(), session.get_connect_status()?);
//! # Ok::<(), usbh_cdc_rndis::Error>(())
//! ```

use bitflags::bitflags;

pub mod message;
mod session;

pub use session::{LinkInfo, RndisConfig, RndisSession, SessionState};

#[cfg(test)]
pub(crate) use session::test::{rndis_host, Peer, MAC, PID, VID};

/// Message types
pub mod msg {
    pub const PACKET: u32 = 0x0000_0001;
    pub const INITIALIZE: u32 = 0x0000_0002;
    pub const HALT: u32 = 0x0000_0003;
    pub const QUERY: u32 = 0x0000_0004;
    pub const SET: u32 = 0x0000_0005;
    pub const RESET: u32 = 0x0000_0006;
    pub const INDICATE_STATUS: u32 = 0x0000_0007;
    pub const KEEPALIVE: u32 = 0x0000_0008;

    /// Set in the type of every completion message
    pub const COMPLETION: u32 = 0x8000_0000;
    pub const INITIALIZE_COMPLETE: u32 = INITIALIZE | COMPLETION;
    pub const QUERY_COMPLETE: u32 = QUERY | COMPLETION;
    pub const SET_COMPLETE: u32 = SET | COMPLETION;
    pub const RESET_COMPLETE: u32 = RESET | COMPLETION;
    pub const KEEPALIVE_COMPLETE: u32 = KEEPALIVE | COMPLETION;
}

/// Object identifiers
pub mod oid {
    pub const GEN_SUPPORTED_LIST: u32 = 0x0001_0101;
    pub const GEN_HARDWARE_STATUS: u32 = 0x0001_0102;
    pub const GEN_MEDIA_SUPPORTED: u32 = 0x0001_0103;
    pub const GEN_MEDIA_IN_USE: u32 = 0x0001_0104;
    pub const GEN_MAXIMUM_FRAME_SIZE: u32 = 0x0001_0106;
    pub const GEN_LINK_SPEED: u32 = 0x0001_0107;
    pub const GEN_CURRENT_PACKET_FILTER: u32 = 0x0001_010E;
    pub const GEN_MAXIMUM_TOTAL_SIZE: u32 = 0x0001_0111;
    pub const GEN_MEDIA_CONNECT_STATUS: u32 = 0x0001_0114;
    pub const GEN_PHYSICAL_MEDIUM: u32 = 0x0001_0202;
    pub const GEN_XMIT_OK: u32 = 0x0002_0101;
    pub const GEN_RCV_OK: u32 = 0x0002_0102;

    pub const ETH_PERMANENT_ADDRESS: u32 = 0x0101_0101;
    pub const ETH_CURRENT_ADDRESS: u32 = 0x0101_0102;
    pub const ETH_MULTICAST_LIST: u32 = 0x0101_0103;
    pub const ETH_MAXIMUM_LIST_SIZE: u32 = 0x0101_0104;
}

/// Status codes
pub mod status {
    pub const SUCCESS: u32 = 0x0000_0000;
    pub const FAILURE: u32 = 0xC000_0001;
    pub const INVALID_DATA: u32 = 0xC001_0015;
    pub const NOT_SUPPORTED: u32 = 0xC000_00BB;
    pub const MEDIA_CONNECT: u32 = 0x4001_000B;
    pub const MEDIA_DISCONNECT: u32 = 0x4001_000C;
}

/// `GEN_MEDIA_CONNECT_STATUS` value for a connected link
pub const MEDIA_STATE_CONNECTED: u32 = 0;

bitflags! {
    /// Frames the device should pass up, for `GEN_CURRENT_PACKET_FILTER`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PacketFilter : u32 {
        const DIRECTED = 0x0001;
        const MULTICAST = 0x0002;
        const ALL_MULTICAST = 0x0004;
        const BROADCAST = 0x0008;
        const SOURCE_ROUTING = 0x0010;
        const PROMISCUOUS = 0x0020;
        const ALL_LOCAL = 0x0080;
    }
}

/// Map an RNDIS status to a result
pub(crate) fn check_status(code: u32) -> crate::Result<()> {
    match code {
        status::SUCCESS => Ok(()),
        status::NOT_SUPPORTED => Err(crate::Error::NotFound),
        other => Err(crate::Error::Rndis(other)),
    }
}
