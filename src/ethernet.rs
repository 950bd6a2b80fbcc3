//! An RNDIS Ethernet link
//!
//! [`RndisEthernet`] wires the pieces together: it opens the CDC function
//! with a [`FrameRelay`] as its data callback, brings the RNDIS session up,
//! waits for the link, and then starts delivering frames to your
//! [`NetworkInterface`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use usbh_cdc_rndis::cdc::{CdcDriver, DriverConfig, ANY_PID, ANY_VID};
//! use usbh_cdc_rndis::ethernet::{EthernetConfig, RndisEthernet};
//! use usbh_cdc_rndis::relay::NetworkInterface;
//! # fn host() -> Arc<dyn usbh_cdc_rndis::host::UsbHost> { unimplemented!() }
//!
//! struct Stack;
//! impl NetworkInterface for Stack {
//!     fn receive(&self, frame: &[u8]) {
//!         println!("{} byte frame", frame.len());
//!     }
//! }
//!
//! let driver = CdcDriver::install(host(), DriverConfig::default());
//! let link = RndisEthernet::open(
//!     &driver,
//!     ANY_VID,
//!     ANY_PID,
//!     0,
//!     Arc::new(Stack),
//!     EthernetConfig::default(),
//! )?;
//! println!("MAC {:02x?}", link.mac_address());
//! link.transmit(&[0xFF; 60])?;
//! link.close(&driver)?;
//! # Ok::<(), usbh_cdc_rndis::Error>(())
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cdc::{CdcDriver, DeviceConfig};
use crate::relay::{self, FrameRelay, NetworkInterface, RelayConfig, RelayStats};
use crate::rndis::message::PACKET_HEADER_LEN;
use crate::rndis::{RndisConfig, RndisSession};
use crate::{Error, Result};

/// Options for [`RndisEthernet::open`]
///
/// The device's data callback is replaced by the relay.
#[derive(Debug, Clone)]
pub struct EthernetConfig {
    pub device: DeviceConfig,
    pub rndis: RndisConfig,
    pub relay: RelayConfig,
    /// How often to ask for the link state while waiting for it
    pub link_poll_interval: Duration,
    /// How long to wait for the link. Zero waits forever.
    pub link_timeout: Duration,
}

impl Default for EthernetConfig {
    fn default() -> Self {
        let relay = RelayConfig::default();
        let rndis = RndisConfig::default();
        EthernetConfig {
            device: DeviceConfig::default()
                .with_in_buffer_size(relay.max_chunk_size)
                .with_out_buffer_size(PACKET_HEADER_LEN + rndis.max_frame_size),
            rndis,
            relay,
            link_poll_interval: Duration::from_millis(100),
            link_timeout: Duration::from_secs(10),
        }
    }
}

/// An Ethernet link over an RNDIS device
#[derive(Debug)]
pub struct RndisEthernet {
    session: RndisSession,
    relay: Arc<FrameRelay>,
    link_poll_interval: Duration,
}

impl RndisEthernet {
    /// Open and configure an RNDIS device, and wait for its link
    ///
    /// On failure, the device is closed again.
    pub fn open(
        driver: &CdcDriver,
        vendor_id: u16,
        product_id: u16,
        interface_index: u8,
        netif: Arc<dyn NetworkInterface>,
        config: EthernetConfig,
    ) -> Result<Self> {
        let relay = FrameRelay::new(netif, config.relay);
        let mut device_config = config.device;
        device_config.data_callback = Some(relay.data_callback());
        let device = driver.open(vendor_id, product_id, interface_index, device_config)?;

        let ethernet = RndisEthernet {
            session: RndisSession::new(device, config.rndis),
            relay,
            link_poll_interval: config.link_poll_interval,
        };
        if let Err(err) = ethernet.bring_up(config.link_timeout) {
            warn!("RNDIS bring-up failed: {}", err);
            if let Err(close) = ethernet.close(driver) {
                warn!("Closing after failed bring-up: {}", close);
            }
            return Err(err);
        }
        Ok(ethernet)
    }

    fn bring_up(&self, timeout: Duration) -> Result<()> {
        self.session.bring_up()?;
        let start = Instant::now();
        while !self.session.is_connected() {
            if !timeout.is_zero() && start.elapsed() >= timeout {
                return Err(Error::Timeout);
            }
            std::thread::sleep(self.link_poll_interval);
            self.session.get_connect_status()?;
        }
        self.relay.start()
    }

    /// Send one Ethernet frame
    pub fn transmit(&self, frame: &[u8]) -> Result<usize> {
        relay::transmit(&self.session, frame)
    }

    pub fn mac_address(&self) -> [u8; 6] {
        self.session.mac_address()
    }

    pub fn session(&self) -> &RndisSession {
        &self.session
    }

    pub fn relay_stats(&self) -> RelayStats {
        self.relay.stats()
    }

    /// Ask the device for its link state
    ///
    /// Call this periodically; not every device reports link changes on
    /// its own.
    pub fn poll_link(&self) -> Result<bool> {
        let up = self.session.get_connect_status()?;
        if up {
            self.relay.start()?;
        }
        Ok(up)
    }

    /// Halt the session, stop the relay, and close the device
    pub fn close(&self, driver: &CdcDriver) -> Result<()> {
        if let Err(err) = self.session.halt() {
            warn!("RNDIS halt: {}", err);
        }
        self.relay.shutdown();
        driver.close(self.session.device())
    }
}
