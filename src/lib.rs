//! A USB host CDC driver, with an RNDIS network layer
//!
//! `usbh-cdc-rndis` turns a USB connection to a modem or dongle into a
//! serial port, or into an Ethernet frame transport. It sits on top of a
//! host controller that you provide by implementing [`host::UsbHost`].
//!
//! - [`cdc`] finds the CDC function on a device, owns its pipes, and exposes
//!   blocking send and control requests with callback-based receive.
//! - [`rndis`] runs the RNDIS control protocol over CDC control requests.
//! - [`relay`] moves received data off the USB completion context, splits
//!   it into Ethernet frames, and wraps outgoing frames.
//! - [`ethernet`] ties the three together for a network stack.
//!
//! See each module for usage and examples.

#[macro_use]
mod log;

mod error;

pub mod cdc;
pub mod descriptor;
pub mod ethernet;
pub mod host;
pub mod relay;
pub mod rndis;
pub mod transfer;

pub use error::{Error, Result};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, ignoring poisoning
///
/// No lock in the driver is held across a user callback, and nothing it
/// guards is left half-updated by a panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
