//! Host controller boundary
//!
//! The CDC driver doesn't schedule USB traffic itself. It consumes a host
//! controller through [`UsbHost`]: device enumeration, interface claims,
//! transfer submission and the endpoint halt / flush / clear primitives.
//!
//! Completion is callback based. When the host finishes a [`Transfer`], it
//! calls [`Transfer::complete`] from its completion context, which hands the
//! transfer back to the pipe that submitted it.

use usb_device::endpoint::EndpointAddress;

use crate::transfer::Transfer;
use crate::Result;

#[cfg(test)]
pub(crate) mod mock;

/// An opened USB device, as issued by the host controller
///
/// The CDC driver never owns the device. It borrows the handle from
/// [`UsbHost::open_device`], and returns it with [`UsbHost::close_device`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u32);

/// How a transfer finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// All requested bytes, or a short packet, were transferred
    Completed,
    /// Generic transaction error
    Error,
    /// The host gave up on the transfer
    TimedOut,
    /// The endpoint was halted and flushed while the transfer was queued
    Cancelled,
    /// The device answered with STALL
    Stall,
    /// The device went away
    NoDevice,
    /// The device sent more data than requested
    Overflow,
    /// An isochronous packet was skipped
    Skipped,
}

impl TransferStatus {
    /// Indicates a status that polling pipes report to the user
    ///
    /// Cancellation and device removal are part of normal teardown, and
    /// are not reported.
    pub fn is_reportable(self) -> bool {
        !matches!(
            self,
            TransferStatus::Completed | TransferStatus::Cancelled | TransferStatus::NoDevice
        )
    }
}

/// Out-of-band notifications from the host controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    /// A device finished enumeration at `address`
    NewDevice { address: u8 },
    /// The device behind the handle was unplugged
    DeviceGone(DeviceHandle),
}

/// A submission the host controller refused
///
/// The transfer returns to the caller, untouched.
pub struct SubmitError {
    pub transfer: Transfer,
    pub error: crate::Error,
}

impl core::fmt::Debug for SubmitError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SubmitError")
            .field("endpoint", &u8::from(self.transfer.endpoint()))
            .field("error", &self.error)
            .finish()
    }
}

/// A USB host controller
///
/// Implementations must meet these rules, which the CDC driver relies on:
///
/// - every transfer accepted by [`submit`](UsbHost::submit) is completed
///   exactly once, by calling [`Transfer::complete`];
/// - completion happens outside of any host lock, since the continuation
///   may resubmit;
/// - a halted endpoint refuses submissions until it's cleared;
/// - [`flush_endpoint`](UsbHost::flush_endpoint) completes every transfer
///   queued on a halted endpoint with [`TransferStatus::Cancelled`].
///
/// For control transfers, the transfer data starts with the 8 byte setup
/// packet, and the actual byte count includes it.
pub trait UsbHost: Send + Sync {
    /// Addresses of every enumerated device
    fn device_addresses(&self) -> Vec<u8>;
    /// Open the device at `address`
    fn open_device(&self, address: u8) -> Result<DeviceHandle>;
    /// Give back a handle obtained from [`open_device`](UsbHost::open_device)
    fn close_device(&self, device: DeviceHandle) -> Result<()>;
    /// The raw 18 byte device descriptor
    fn device_descriptor(&self, device: DeviceHandle) -> Result<Vec<u8>>;
    /// The raw active configuration descriptor, including all subordinate
    /// descriptors
    fn config_descriptor(&self, device: DeviceHandle) -> Result<Vec<u8>>;
    /// Claim `interface` and select its `alternate` setting
    fn claim_interface(&self, device: DeviceHandle, interface: u8, alternate: u8) -> Result<()>;
    fn release_interface(&self, device: DeviceHandle, interface: u8) -> Result<()>;
    /// Queue a transfer on its endpoint
    fn submit(&self, transfer: Transfer) -> core::result::Result<(), SubmitError>;
    fn halt_endpoint(&self, device: DeviceHandle, endpoint: EndpointAddress) -> Result<()>;
    fn flush_endpoint(&self, device: DeviceHandle, endpoint: EndpointAddress) -> Result<()>;
    fn clear_endpoint(&self, device: DeviceHandle, endpoint: EndpointAddress) -> Result<()>;
}
