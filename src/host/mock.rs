//! A scripted host controller for tests
//!
//! Poll transfers (bulk IN, interrupt IN) stay queued until a test delivers
//! data. Control and bulk OUT transfers go through a responder; without one,
//! or when it returns `None`, they stay queued until the endpoint is flushed.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use usb_device::endpoint::{EndpointAddress, EndpointType};

use super::{DeviceHandle, SubmitError, TransferStatus, UsbHost};
use crate::transfer::Transfer;
use crate::{lock, Error, Result};

/// Decides how a control or bulk OUT transfer completes
///
/// May write a response into the transfer. Returning `None` leaves the
/// transfer stuck.
pub(crate) type Responder = Box<dyn FnMut(&mut Transfer) -> Option<(TransferStatus, usize)> + Send>;

struct MockDevice {
    address: u8,
    device: Vec<u8>,
    config: Vec<u8>,
    open_count: usize,
}

#[derive(Default)]
struct State {
    devices: Vec<MockDevice>,
    claimed: Vec<(u8, u8)>,
    released: Vec<u8>,
    pending: Vec<Transfer>,
    halted: Vec<u8>,
    control: Option<Responder>,
    bulk_out: Option<Responder>,
    halts: usize,
    claim_delay: Duration,
}

#[derive(Default)]
pub(crate) struct MockHost {
    state: Mutex<State>,
    submitted: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
    threaded: AtomicBool,
}

impl MockHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_device(&self, address: u8, device: Vec<u8>, config: Vec<u8>) -> DeviceHandle {
        lock(&self.state).devices.push(MockDevice {
            address,
            device,
            config,
            open_count: 0,
        });
        DeviceHandle(u32::from(address))
    }

    /// Unplug a device. Its queued transfers complete with `NoDevice`.
    pub fn remove_device(&self, address: u8) {
        let gone = {
            let mut state = lock(&self.state);
            state.devices.retain(|dev| dev.address != address);
            let (gone, keep) = state
                .pending
                .drain(..)
                .partition(|t| t.device() == DeviceHandle(u32::from(address)));
            state.pending = keep;
            gone
        };
        for transfer in gone {
            self.finish(transfer, TransferStatus::NoDevice, 0);
        }
    }

    /// Complete responder transfers from a spawned thread
    pub fn complete_on_thread(&self, threaded: bool) {
        self.threaded.store(threaded, Ordering::SeqCst);
    }

    /// Make every interface claim take `delay`
    pub fn set_claim_delay(&self, delay: Duration) {
        lock(&self.state).claim_delay = delay;
    }

    pub fn on_control(
        &self,
        responder: impl FnMut(&mut Transfer) -> Option<(TransferStatus, usize)> + Send + 'static,
    ) {
        lock(&self.state).control = Some(Box::new(responder));
    }

    pub fn on_bulk_out(
        &self,
        responder: impl FnMut(&mut Transfer) -> Option<(TransferStatus, usize)> + Send + 'static,
    ) {
        lock(&self.state).bulk_out = Some(Box::new(responder));
    }

    /// Complete the oldest transfer queued on `endpoint` with `data`
    pub fn deliver(&self, endpoint: u8, data: &[u8]) -> bool {
        let Some(mut transfer) = self.take_pending(endpoint) else {
            return false;
        };
        let len = data.len().min(transfer.num_bytes());
        transfer.data_mut()[..len].copy_from_slice(&data[..len]);
        self.finish(transfer, TransferStatus::Completed, len);
        true
    }

    /// Complete the oldest transfer queued on `endpoint` with `status`
    pub fn fail(&self, endpoint: u8, status: TransferStatus) -> bool {
        let Some(transfer) = self.take_pending(endpoint) else {
            return false;
        };
        self.finish(transfer, status, 0);
        true
    }

    pub fn pending(&self, endpoint: u8) -> usize {
        lock(&self.state)
            .pending
            .iter()
            .filter(|t| u8::from(t.endpoint()) == endpoint)
            .count()
    }

    /// Claimed `(interface, alternate)` pairs, in order
    pub fn claimed(&self) -> Vec<(u8, u8)> {
        lock(&self.state).claimed.clone()
    }

    pub fn released(&self) -> Vec<u8> {
        lock(&self.state).released.clone()
    }

    pub fn open_count(&self, address: u8) -> usize {
        lock(&self.state)
            .devices
            .iter()
            .find(|dev| dev.address == address)
            .map_or(0, |dev| dev.open_count)
    }

    pub fn halts(&self) -> usize {
        lock(&self.state).halts
    }

    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    fn take_pending(&self, endpoint: u8) -> Option<Transfer> {
        let mut state = lock(&self.state);
        let index = state
            .pending
            .iter()
            .position(|t| u8::from(t.endpoint()) == endpoint)?;
        Some(state.pending.remove(index))
    }

    fn finish(&self, transfer: Transfer, status: TransferStatus, actual: usize) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        transfer.complete(status, actual);
    }
}

impl UsbHost for MockHost {
    fn device_addresses(&self) -> Vec<u8> {
        lock(&self.state).devices.iter().map(|dev| dev.address).collect()
    }

    fn open_device(&self, address: u8) -> Result<DeviceHandle> {
        let mut state = lock(&self.state);
        let dev = state
            .devices
            .iter_mut()
            .find(|dev| dev.address == address)
            .ok_or(Error::NotFound)?;
        dev.open_count += 1;
        Ok(DeviceHandle(u32::from(address)))
    }

    fn close_device(&self, device: DeviceHandle) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(dev) = state
            .devices
            .iter_mut()
            .find(|dev| u32::from(dev.address) == device.0)
        {
            dev.open_count = dev.open_count.saturating_sub(1);
        }
        Ok(())
    }

    fn device_descriptor(&self, device: DeviceHandle) -> Result<Vec<u8>> {
        lock(&self.state)
            .devices
            .iter()
            .find(|dev| u32::from(dev.address) == device.0)
            .map(|dev| dev.device.clone())
            .ok_or(Error::NotFound)
    }

    fn config_descriptor(&self, device: DeviceHandle) -> Result<Vec<u8>> {
        lock(&self.state)
            .devices
            .iter()
            .find(|dev| u32::from(dev.address) == device.0)
            .map(|dev| dev.config.clone())
            .ok_or(Error::NotFound)
    }

    fn claim_interface(&self, _: DeviceHandle, interface: u8, alternate: u8) -> Result<()> {
        let delay = lock(&self.state).claim_delay;
        std::thread::sleep(delay);
        lock(&self.state).claimed.push((interface, alternate));
        Ok(())
    }

    fn release_interface(&self, _: DeviceHandle, interface: u8) -> Result<()> {
        lock(&self.state).released.push(interface);
        Ok(())
    }

    fn submit(&self, mut transfer: Transfer) -> core::result::Result<(), SubmitError> {
        let endpoint = u8::from(transfer.endpoint());
        let response = {
            let mut state = lock(&self.state);
            let present = state
                .devices
                .iter()
                .any(|dev| u32::from(dev.address) == transfer.device().0);
            if !present {
                return Err(SubmitError {
                    transfer,
                    error: Error::NotFound,
                });
            }
            if state.halted.contains(&endpoint) {
                return Err(SubmitError {
                    transfer,
                    error: Error::InvalidState,
                });
            }
            self.submitted.fetch_add(1, Ordering::SeqCst);
            let responder = match transfer.kind() {
                EndpointType::Control => state.control.as_mut(),
                EndpointType::Bulk if transfer.endpoint().is_out() => state.bulk_out.as_mut(),
                _ => None,
            };
            match responder.and_then(|respond| respond(&mut transfer)) {
                Some(response) => response,
                None => {
                    state.pending.push(transfer);
                    return Ok(());
                }
            }
        };

        let (status, actual) = response;
        if self.threaded.load(Ordering::SeqCst) {
            let completed = Arc::clone(&self.completed);
            std::thread::spawn(move || {
                completed.fetch_add(1, Ordering::SeqCst);
                transfer.complete(status, actual);
            });
        } else {
            self.finish(transfer, status, actual);
        }
        Ok(())
    }

    fn halt_endpoint(&self, _: DeviceHandle, endpoint: EndpointAddress) -> Result<()> {
        let mut state = lock(&self.state);
        state.halts += 1;
        state.halted.push(u8::from(endpoint));
        Ok(())
    }

    fn flush_endpoint(&self, _: DeviceHandle, endpoint: EndpointAddress) -> Result<()> {
        let endpoint = u8::from(endpoint);
        let flushed = {
            let mut state = lock(&self.state);
            let (flushed, keep) = state
                .pending
                .drain(..)
                .partition(|t| u8::from(t.endpoint()) == endpoint);
            state.pending = keep;
            flushed
        };
        for transfer in flushed {
            self.finish(transfer, TransferStatus::Cancelled, 0);
        }
        Ok(())
    }

    fn clear_endpoint(&self, _: DeviceHandle, endpoint: EndpointAddress) -> Result<()> {
        let endpoint = u8::from(endpoint);
        lock(&self.state).halted.retain(|ep| *ep != endpoint);
        Ok(())
    }
}
