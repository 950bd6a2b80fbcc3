//! CDC-ACM host driver
//!
//! Install a [`CdcDriver`] over your [`UsbHost`](crate::host::UsbHost), then
//! open devices by vendor and product ID, and the interface index of the CDC
//! function.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use usbh_cdc_rndis::cdc::{CdcDriver, DeviceConfig, DeviceEvent, DriverConfig};
//! # fn host() -> Arc<dyn usbh_cdc_rndis::host::UsbHost> { unimplemented!() }
//!
//! let driver = CdcDriver::install(host(), DriverConfig::default());
//! let config = DeviceConfig::default()
//!     .with_in_buffer_size(512)
//!     .with_out_buffer_size(512)
//!     .with_data_callback(|data| {
//!         println!("received {} bytes", data.len());
//!         true
//!     })
//!     .with_event_callback(|_, event| {
//!         if let DeviceEvent::Disconnected = event {
//!             println!("unplugged");
//!         }
//!     });
//! let device = driver.open(0x303A, 0x4001, 0, config)?;
//! device.set_control_line_state(true, true)?;
//! device.send_blocking(b"AT\r", Duration::from_millis(100))?;
//! driver.close(&device)?;
//! # Ok::<(), usbh_cdc_rndis::Error>(())
//! ```

use std::sync::Arc;
use std::time::Duration;

mod device;
mod driver;
mod line_coding;
mod notification;
mod parser;

pub use device::CdcDevice;
pub use driver::{CdcDriver, DriverConfig, NewDeviceCallback};
pub use line_coding::{LineCoding, Parity, StopBits};
pub use notification::{Notification, SerialState};
pub use parser::{parse_interface, subtype, FunctionalDescriptor, InterfaceMap};

use crate::host::TransferStatus;

/// Matches any vendor ID
pub const ANY_VID: u16 = 0;
/// Matches any product ID
pub const ANY_PID: u16 = 0;

/// CDC class request codes
pub mod request {
    pub const SEND_ENCAPSULATED_COMMAND: u8 = 0x00;
    pub const GET_ENCAPSULATED_RESPONSE: u8 = 0x01;
    pub const SET_LINE_CODING: u8 = 0x20;
    pub const GET_LINE_CODING: u8 = 0x21;
    pub const SET_CONTROL_LINE_STATE: u8 = 0x22;
    pub const SEND_BREAK: u8 = 0x23;
}

/// Events delivered to the event callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A polling pipe failed, and stopped
    Error(TransferStatus),
    /// New serial state, or a receive buffer overrun
    SerialState(SerialState),
    NetworkConnection(bool),
    ConnectionSpeed { downstream: u32, upstream: u32 },
    /// The device was unplugged. Close it; further I/O fails.
    Disconnected,
}

/// Called with the unconsumed received data
///
/// Return `true` once the data is consumed. Return `false` to keep it, and
/// have the next receive appended.
pub type DataCallback = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Called for notifications, errors and disconnects
pub type EventCallback = Arc<dyn Fn(&CdcDevice, &DeviceEvent) + Send + Sync>;

/// Control transfer buffer size, including the setup packet
pub const DEFAULT_CONTROL_BUFFER_SIZE: usize = 512;
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_millis(5000);

/// Options for [`CdcDriver::open`]
#[derive(Clone)]
pub struct DeviceConfig {
    /// How long to wait for a matching device. Zero waits forever.
    pub connection_timeout: Duration,
    /// Bulk IN buffer size. Zero disables receiving.
    pub in_buffer_size: usize,
    /// Bulk OUT buffer size. Zero makes the device read-only.
    pub out_buffer_size: usize,
    pub control_buffer_size: usize,
    pub control_timeout: Duration,
    pub data_callback: Option<DataCallback>,
    pub event_callback: Option<EventCallback>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            connection_timeout: Duration::from_millis(1000),
            in_buffer_size: 0,
            out_buffer_size: 0,
            control_buffer_size: DEFAULT_CONTROL_BUFFER_SIZE,
            control_timeout: DEFAULT_CONTROL_TIMEOUT,
            data_callback: None,
            event_callback: None,
        }
    }
}

impl DeviceConfig {
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_in_buffer_size(mut self, size: usize) -> Self {
        self.in_buffer_size = size;
        self
    }

    pub fn with_out_buffer_size(mut self, size: usize) -> Self {
        self.out_buffer_size = size;
        self
    }

    pub fn with_control_timeout(mut self, timeout: Duration) -> Self {
        self.control_timeout = timeout;
        self
    }

    pub fn with_data_callback(
        mut self,
        callback: impl Fn(&[u8]) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.data_callback = Some(Arc::new(callback));
        self
    }

    pub fn with_event_callback(
        mut self,
        callback: impl Fn(&CdcDevice, &DeviceEvent) + Send + Sync + 'static,
    ) -> Self {
        self.event_callback = Some(Arc::new(callback));
        self
    }
}

impl core::fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("connection_timeout", &self.connection_timeout)
            .field("in_buffer_size", &self.in_buffer_size)
            .field("out_buffer_size", &self.out_buffer_size)
            .field("control_buffer_size", &self.control_buffer_size)
            .field("control_timeout", &self.control_timeout)
            .field("data_callback", &self.data_callback.is_some())
            .field("event_callback", &self.event_callback.is_some())
            .finish()
    }
}
