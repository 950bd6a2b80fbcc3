//! An open CDC device and its pipes

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, Weak};
use std::thread::ThreadId;
use std::time::Duration;

use usb_device::{
    control::{Recipient, RequestType},
    endpoint::{EndpointAddress, EndpointType},
    UsbDirection,
};

use super::line_coding::{LineCoding, LINE_CODING_LEN};
use super::notification::{Notification, SerialState, HEADER_LEN};
use super::parser::{FunctionalDescriptor, InterfaceMap};
use super::{request, DeviceConfig, DeviceEvent};
use crate::descriptor::{self, DeviceDescriptor};
use crate::host::{DeviceHandle, SubmitError, TransferStatus, UsbHost};
use crate::transfer::{Completion, SetupPacket, Transfer, SETUP_PACKET_LEN};
use crate::{lock, Error, Result};

/// How long teardown waits for a flushed transfer to come back
const TEARDOWN_TIMEOUT: Duration = Duration::from_millis(1000);

/// A pipe driven by blocking callers: control, and bulk OUT
///
/// The transfer is `None` while it's with the host, or after close.
struct BlockingPipe {
    transfer: Option<Transfer>,
    done: Receiver<Transfer>,
}

impl BlockingPipe {
    fn new(
        handle: DeviceHandle,
        endpoint: EndpointAddress,
        kind: EndpointType,
        capacity: usize,
    ) -> Self {
        let (tx, done) = mpsc::sync_channel(1);
        let completion: Completion = Arc::new(move |transfer| {
            // One transfer per pipe, so the channel always has room
            if let Err(err) = tx.try_send(transfer) {
                error!("Completion for an abandoned transfer: {:?}", err);
            }
        });
        BlockingPipe {
            transfer: Some(Transfer::new(handle, endpoint, kind, capacity, completion)),
            done,
        }
    }

    fn transfer_mut(&mut self) -> Result<&mut Transfer> {
        self.transfer.as_mut().ok_or(Error::InvalidState)
    }

    /// Submit the transfer, and wait for it to complete
    ///
    /// On timeout, the endpoint is halted and flushed, and the cancelled
    /// transfer is recovered before this returns [`Error::Timeout`].
    fn run(&mut self, host: &dyn UsbHost, timeout: Duration) -> Result<&Transfer> {
        let transfer = self.transfer.take().ok_or(Error::InvalidState)?;
        let device = transfer.device();
        let endpoint = transfer.endpoint();
        if let Err(SubmitError { transfer, error }) = host.submit(transfer) {
            self.transfer = Some(transfer);
            return Err(error);
        }

        match self.done.recv_timeout(timeout) {
            Ok(transfer) => self.transfer = Some(transfer),
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Transfer on endpoint {:#04x} timed out, resetting",
                    u8::from(endpoint)
                );
                halt_and_flush(host, device, endpoint);
                match self.done.recv_timeout(TEARDOWN_TIMEOUT) {
                    Ok(transfer) => self.transfer = Some(transfer),
                    Err(_) => {
                        error!("Endpoint {:#04x} lost its transfer", u8::from(endpoint));
                    }
                }
                if let Err(err) = host.clear_endpoint(device, endpoint) {
                    warn!("Clearing endpoint {:#04x}: {}", u8::from(endpoint), err);
                }
                return Err(Error::Timeout);
            }
            Err(RecvTimeoutError::Disconnected) => return Err(Error::InvalidState),
        }
        self.transfer.as_ref().ok_or(Error::InvalidState)
    }
}

/// A continuously resubmitted IN pipe: bulk IN, or notifications
///
/// Only the completion context touches the transfer once it's started.
/// When the pipe stops, the transfer is parked for teardown to collect.
struct PollPipe {
    endpoint: EndpointAddress,
    idle: Mutex<Option<Transfer>>,
    parked: Mutex<Receiver<Transfer>>,
    /// The thread running this pipe's completion, if any
    completing: Arc<Mutex<Option<ThreadId>>>,
}

impl PollPipe {
    fn new(
        shared: &Weak<Shared>,
        handle: DeviceHandle,
        endpoint: EndpointAddress,
        kind: EndpointType,
        capacity: usize,
        on_complete: fn(&Arc<Shared>, Transfer, &SyncSender<Transfer>),
    ) -> Self {
        let (park, parked) = mpsc::sync_channel(1);
        let weak = Weak::clone(shared);
        let completing = Arc::new(Mutex::new(None));
        let running = Arc::clone(&completing);
        let completion: Completion = Arc::new(move |transfer| match weak.upgrade() {
            Some(shared) => {
                *lock(&running) = Some(std::thread::current().id());
                on_complete(&shared, transfer, &park);
                *lock(&running) = None;
            }
            None => drop(transfer),
        });
        let mut transfer = Transfer::new(handle, endpoint, kind, capacity, completion);
        transfer.set_num_bytes(capacity);
        PollPipe {
            endpoint,
            idle: Mutex::new(Some(transfer)),
            parked: Mutex::new(parked),
            completing,
        }
    }

    fn start(&self, host: &dyn UsbHost) -> Result<()> {
        let mut idle = lock(&self.idle);
        let transfer = idle.take().ok_or(Error::InvalidState)?;
        if let Err(SubmitError { transfer, error }) = host.submit(transfer) {
            *idle = Some(transfer);
            return Err(error);
        }
        Ok(())
    }

    /// Halt and flush the endpoint, then wait for the transfer to park
    ///
    /// From inside this pipe's own completion (an event callback closing
    /// the device), the transfer isn't with the host. That completion parks
    /// it once it sees the device closing, so there's nothing to wait for.
    fn stop(&self, host: &dyn UsbHost, device: DeviceHandle) -> Result<()> {
        if lock(&self.idle).take().is_some() {
            return Ok(());
        }
        if *lock(&self.completing) == Some(std::thread::current().id()) {
            debug!(
                "Stopping endpoint {:#04x} from its own completion",
                u8::from(self.endpoint)
            );
            return Ok(());
        }
        halt_and_flush(host, device, self.endpoint);
        let result = match lock(&self.parked).recv_timeout(TEARDOWN_TIMEOUT) {
            Ok(transfer) => {
                drop(transfer);
                Ok(())
            }
            Err(_) => {
                error!(
                    "Endpoint {:#04x} did not return its transfer",
                    u8::from(self.endpoint)
                );
                Err(Error::Timeout)
            }
        };
        if let Err(err) = host.clear_endpoint(device, self.endpoint) {
            debug!("Clearing endpoint {:#04x}: {}", u8::from(self.endpoint), err);
        }
        result
    }
}

fn halt_and_flush(host: &dyn UsbHost, device: DeviceHandle, endpoint: EndpointAddress) {
    if let Err(err) = host.halt_endpoint(device, endpoint) {
        debug!("Halting endpoint {:#04x}: {}", u8::from(endpoint), err);
    }
    if let Err(err) = host.flush_endpoint(device, endpoint) {
        debug!("Flushing endpoint {:#04x}: {}", u8::from(endpoint), err);
    }
}

fn park(transfer: Transfer, park: &SyncSender<Transfer>) {
    if park.try_send(transfer).is_err() {
        error!("Pipe already parked a transfer");
    }
}

#[derive(Default)]
struct Callbacks {
    data: Option<super::DataCallback>,
    event: Option<super::EventCallback>,
}

pub(crate) struct Shared {
    host: Arc<dyn UsbHost>,
    handle: DeviceHandle,
    interface_index: u8,
    device: DeviceDescriptor,
    config: Vec<u8>,
    map: InterfaceMap,
    control_timeout: Duration,
    callbacks: Mutex<Callbacks>,
    ctrl: Mutex<BlockingPipe>,
    out: Option<Mutex<BlockingPipe>>,
    bulk_in: Option<PollPipe>,
    notification: Option<PollPipe>,
    /// Interfaces to release on close
    claimed: Mutex<Vec<u8>>,
    serial_state: AtomicU16,
    closing: AtomicBool,
    disconnected: AtomicBool,
}

impl Shared {
    fn callbacks(&self) -> (Option<super::DataCallback>, Option<super::EventCallback>) {
        let callbacks = lock(&self.callbacks);
        (callbacks.data.clone(), callbacks.event.clone())
    }

    /// Invoke the event callback outside of any lock
    fn emit(self: &Arc<Self>, event: DeviceEvent) {
        if let (_, Some(callback)) = self.callbacks() {
            callback(&CdcDevice::from_shared(Arc::clone(self)), &event);
        }
    }

    fn resubmit(&self, transfer: Transfer, parking: &SyncSender<Transfer>) {
        if self.closing.load(Ordering::Acquire) {
            park(transfer, parking);
            return;
        }
        if let Err(SubmitError { transfer, error }) = self.host.submit(transfer) {
            warn!(
                "Resubmitting on endpoint {:#04x} failed: {}",
                u8::from(transfer.endpoint()),
                error
            );
            park(transfer, parking);
        }
    }

    /// Sort out a completion on a polling pipe
    ///
    /// Returns `false` if the pipe stops. Errors are reported through the
    /// event callback, since nobody waits on these transfers.
    fn accept(self: &Arc<Self>, transfer: &Transfer) -> bool {
        match transfer.status() {
            Some(TransferStatus::Completed) => true,
            Some(status) => {
                if status.is_reportable() {
                    warn!(
                        "Endpoint {:#04x} failed with {:?}",
                        u8::from(transfer.endpoint()),
                        status
                    );
                    self.emit(DeviceEvent::Error(status));
                }
                false
            }
            None => false,
        }
    }
}

fn bulk_in_complete(shared: &Arc<Shared>, mut transfer: Transfer, parking: &SyncSender<Transfer>) {
    if !shared.accept(&transfer) || shared.closing.load(Ordering::Acquire) {
        park(transfer, parking);
        return;
    }

    let consumed = match shared.callbacks() {
        (Some(data), _) if transfer.actual_num_bytes() > 0 || transfer.offset() > 0 => {
            data(transfer.received())
        }
        _ => true,
    };

    let capacity = transfer.capacity();
    let mps = shared.map.bulk_in.max_packet_len().max(1);
    let full = capacity / mps * mps;
    if consumed {
        transfer.set_offset(0);
        transfer.set_num_bytes(full);
    } else {
        let offset = transfer.offset() + transfer.actual_num_bytes();
        let space = (capacity - offset) / mps * mps;
        if space == 0 {
            warn!("Receive buffer overrun, dropping {} bytes", offset);
            let state = SerialState::from_bits_truncate(shared.serial_state.load(Ordering::Relaxed));
            shared.emit(DeviceEvent::SerialState(state | SerialState::OVERRUN));
            transfer.set_offset(0);
            transfer.set_num_bytes(full);
        } else {
            transfer.set_offset(offset);
            transfer.set_num_bytes(space);
        }
    }
    shared.resubmit(transfer, parking);
}

fn notification_complete(
    shared: &Arc<Shared>,
    mut transfer: Transfer,
    parking: &SyncSender<Transfer>,
) {
    if !shared.accept(&transfer) || shared.closing.load(Ordering::Acquire) {
        park(transfer, parking);
        return;
    }

    match Notification::parse(transfer.received()) {
        Some(Notification::NetworkConnection(connected)) => {
            shared.emit(DeviceEvent::NetworkConnection(connected));
        }
        Some(Notification::SerialState(state)) => {
            shared.serial_state.store(state.bits(), Ordering::Relaxed);
            shared.emit(DeviceEvent::SerialState(state));
        }
        Some(Notification::ConnectionSpeed {
            downstream,
            upstream,
        }) => {
            shared.emit(DeviceEvent::ConnectionSpeed {
                downstream,
                upstream,
            });
        }
        Some(Notification::ResponseAvailable) => {
            debug!("Response available notification");
        }
        Some(Notification::Unsupported { code }) => {
            warn!("Unsupported notification {:#04x}", code);
        }
        None => {
            warn!(
                "Short notification, {} bytes",
                transfer.actual_num_bytes()
            );
        }
    }
    let capacity = transfer.capacity();
    transfer.set_num_bytes(capacity);
    shared.resubmit(transfer, parking);
}

/// Handle to an open CDC device
///
/// Clones refer to the same device. Close it with
/// [`CdcDriver::close`](super::CdcDriver::close).
#[derive(Clone)]
pub struct CdcDevice {
    shared: Arc<Shared>,
}

impl PartialEq for CdcDevice {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for CdcDevice {}

impl core::fmt::Debug for CdcDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CdcDevice")
            .field("handle", &self.shared.handle)
            .field("vendor_id", &self.shared.device.vendor_id)
            .field("product_id", &self.shared.device.product_id)
            .field("interface", &self.shared.interface_index)
            .finish()
    }
}

impl CdcDevice {
    fn from_shared(shared: Arc<Shared>) -> Self {
        CdcDevice { shared }
    }

    /// Allocate pipes, claim interfaces and start polling
    ///
    /// On failure, everything acquired so far is released again, but the
    /// host device handle stays open.
    pub(crate) fn start(
        host: Arc<dyn UsbHost>,
        handle: DeviceHandle,
        interface_index: u8,
        device: DeviceDescriptor,
        config: Vec<u8>,
        map: InterfaceMap,
        cfg: &DeviceConfig,
    ) -> Result<Self> {
        if cfg.control_buffer_size < SETUP_PACKET_LEN {
            return Err(Error::InvalidArgument);
        }

        let ctrl = BlockingPipe::new(
            handle,
            EndpointAddress::from(0),
            EndpointType::Control,
            cfg.control_buffer_size,
        );
        let out = (cfg.out_buffer_size > 0).then(|| {
            Mutex::new(BlockingPipe::new(
                handle,
                map.bulk_out.address,
                EndpointType::Bulk,
                cfg.out_buffer_size,
            ))
        });

        let bulk_in = (cfg.in_buffer_size > 0).then(|| {
            let mps = map.bulk_in.max_packet_len().max(1);
            // Room for at least one packet, in whole packets
            (map.bulk_in.address, cfg.in_buffer_size.max(mps) / mps * mps)
        });
        let notification = map
            .notification_endpoint
            .map(|ep| (ep.address, ep.max_packet_len().max(HEADER_LEN)));

        let shared = Arc::new_cyclic(|weak| Shared {
            host,
            handle,
            interface_index,
            device,
            config,
            map,
            control_timeout: cfg.control_timeout,
            callbacks: Mutex::new(Callbacks {
                data: cfg.data_callback.clone(),
                event: cfg.event_callback.clone(),
            }),
            ctrl: Mutex::new(ctrl),
            out,
            bulk_in: bulk_in.map(|(ep, capacity)| {
                PollPipe::new(weak, handle, ep, EndpointType::Bulk, capacity, bulk_in_complete)
            }),
            notification: notification.map(|(ep, capacity)| {
                PollPipe::new(
                    weak,
                    handle,
                    ep,
                    EndpointType::Interrupt,
                    capacity,
                    notification_complete,
                )
            }),
            claimed: Mutex::new(Vec::new()),
            serial_state: AtomicU16::new(0),
            closing: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
        });

        let device = CdcDevice { shared };
        if let Err(err) = device.claim_and_poll() {
            warn!("Starting CDC device failed: {}", err);
            if let Err(teardown) = device.teardown() {
                warn!("Cleanup after failed start: {}", teardown);
            }
            return Err(err);
        }
        Ok(device)
    }

    fn claim_and_poll(&self) -> Result<()> {
        let shared = &self.shared;
        let host = shared.host.as_ref();
        let data = shared.map.data_interface;
        host.claim_interface(shared.handle, data.number, data.alternate)?;
        lock(&shared.claimed).push(data.number);
        debug!("Claimed data interface {} alt {}", data.number, data.alternate);

        if let Some(pipe) = &shared.bulk_in {
            pipe.start(host)?;
        }

        if let (Some(pipe), Some(intf)) = (&shared.notification, shared.map.notification_interface) {
            if intf.number != data.number {
                host.claim_interface(shared.handle, intf.number, intf.alternate)?;
                lock(&shared.claimed).push(intf.number);
                debug!("Claimed notification interface {}", intf.number);
            }
            pipe.start(host)?;
        }
        Ok(())
    }

    /// Stop the pipes, release interfaces and free the transfers
    ///
    /// Runs once per device. Returns the first error, after doing as much
    /// of the teardown as it can.
    pub(crate) fn teardown(&self) -> Result<()> {
        let shared = &self.shared;
        let host = shared.host.as_ref();
        shared.closing.store(true, Ordering::Release);
        *lock(&shared.callbacks) = Callbacks::default();

        let mut result = Ok(());
        for pipe in [&shared.notification, &shared.bulk_in].into_iter().flatten() {
            if let Err(err) = pipe.stop(host, shared.handle) {
                result = result.and(Err(err));
            }
        }

        for interface in lock(&shared.claimed).drain(..) {
            if let Err(err) = host.release_interface(shared.handle, interface) {
                warn!("Releasing interface {}: {}", interface, err);
            }
        }

        // Waits out any blocking call in progress
        lock(&shared.ctrl).transfer = None;
        if let Some(out) = &shared.out {
            lock(out).transfer = None;
        }
        result
    }

    /// Mark closed before teardown. Returns `false` if it already was.
    pub(crate) fn begin_close(&self) -> bool {
        !self.shared.closing.swap(true, Ordering::AcqRel)
    }

    /// Deliver the disconnect event, at most once
    pub(crate) fn notify_gone(&self) {
        if !self.shared.disconnected.swap(true, Ordering::AcqRel) {
            info!("CDC device {:?} disconnected", self.shared.handle);
            self.shared.emit(DeviceEvent::Disconnected);
        }
    }

    fn check_usable(&self) -> Result<()> {
        if self.shared.closing.load(Ordering::Acquire)
            || self.shared.disconnected.load(Ordering::Acquire)
        {
            Err(Error::InvalidState)
        } else {
            Ok(())
        }
    }

    /// Host controller handle of the device
    pub fn handle(&self) -> DeviceHandle {
        self.shared.handle
    }

    pub fn vendor_id(&self) -> u16 {
        self.shared.device.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.shared.device.product_id
    }

    /// The interface index this device was opened with
    pub fn interface_index(&self) -> u8 {
        self.shared.interface_index
    }

    pub fn interface_map(&self) -> &InterfaceMap {
        &self.shared.map
    }

    /// Number of the interface that receives class requests
    pub fn notification_interface(&self) -> Option<u8> {
        self.shared.map.notification_interface_number()
    }

    /// Communication and data interface protocols
    ///
    /// The communication protocol is 0 if the function has no management
    /// element.
    pub fn protocols(&self) -> (u8, u8) {
        let map = &self.shared.map;
        let comm = map.notification_interface.map_or(0, |intf| intf.protocol);
        (comm, map.data_interface.protocol)
    }

    /// The first functional descriptor with `subtype`
    pub fn functional_descriptor(&self, subtype: u8) -> Option<&FunctionalDescriptor> {
        self.shared.map.functional_descriptor(subtype)
    }

    /// The last serial state the device reported
    pub fn serial_state(&self) -> SerialState {
        SerialState::from_bits_truncate(self.shared.serial_state.load(Ordering::Relaxed))
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closing.load(Ordering::Acquire)
    }

    pub fn is_disconnected(&self) -> bool {
        self.shared.disconnected.load(Ordering::Acquire)
    }

    /// Capacity of the bulk OUT transfer, or `None` for read-only devices
    pub fn out_capacity(&self) -> Option<usize> {
        let out = self.shared.out.as_ref()?;
        lock(out).transfer.as_ref().map(Transfer::capacity)
    }

    /// Log the device and configuration descriptors
    pub fn print_descriptors(&self) {
        let dev = &self.shared.device;
        info!(
            "Device {:04x}:{:04x}, USB {:#06x}, class {:#04x}/{:#04x}/{:#04x}",
            dev.vendor_id,
            dev.product_id,
            dev.usb_version,
            dev.class,
            dev.subclass,
            dev.protocol
        );
        descriptor::print_descriptors(&self.shared.config);
    }

    /// Send `data` on the bulk OUT endpoint, and wait for it to complete
    ///
    /// Returns the number of bytes sent, which is always `data.len()`.
    pub fn send_blocking(&self, data: &[u8], timeout: Duration) -> Result<usize> {
        self.check_usable()?;
        if data.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let out = self.shared.out.as_ref().ok_or(Error::NotSupported)?;
        let mut pipe = lock(out);
        let transfer = pipe.transfer_mut()?;
        if data.len() > transfer.capacity() {
            return Err(Error::InvalidSize);
        }
        transfer.set_offset(0);
        transfer.set_num_bytes(data.len());
        transfer.data_mut().copy_from_slice(data);

        let transfer = pipe.run(self.shared.host.as_ref(), timeout)?;
        match transfer.status() {
            Some(TransferStatus::Completed) if transfer.actual_num_bytes() == data.len() => {
                Ok(data.len())
            }
            Some(TransferStatus::Completed) | None => Err(Error::InvalidResponse),
            Some(status) => Err(Error::Transfer(status)),
        }
    }

    /// Run a control transfer on the default pipe
    ///
    /// `setup.length` is replaced by `data.len()`. For IN requests, the
    /// response is copied into `data`. Returns the number of data stage
    /// bytes transferred.
    pub fn control_request_blocking(&self, mut setup: SetupPacket, data: &mut [u8]) -> Result<usize> {
        self.check_usable()?;
        setup.length = u16::try_from(data.len()).map_err(|_| Error::InvalidSize)?;
        let direction = setup.direction();

        let mut pipe = lock(&self.shared.ctrl);
        let transfer = pipe.transfer_mut()?;
        if SETUP_PACKET_LEN + data.len() > transfer.capacity() {
            return Err(Error::InvalidSize);
        }
        transfer.set_offset(0);
        transfer.set_num_bytes(SETUP_PACKET_LEN + data.len());
        let buffer = transfer.data_mut();
        buffer[..SETUP_PACKET_LEN].copy_from_slice(&setup.to_bytes());
        if direction == UsbDirection::Out {
            buffer[SETUP_PACKET_LEN..].copy_from_slice(data);
        }

        let transfer = pipe.run(self.shared.host.as_ref(), self.shared.control_timeout)?;
        match transfer.status() {
            Some(TransferStatus::Completed) => {}
            Some(status) => return Err(Error::Transfer(status)),
            None => return Err(Error::InvalidResponse),
        }
        let moved = transfer.actual_num_bytes().saturating_sub(SETUP_PACKET_LEN);
        match direction {
            UsbDirection::In => {
                data[..moved].copy_from_slice(&transfer.data()[SETUP_PACKET_LEN..][..moved]);
                Ok(moved)
            }
            UsbDirection::Out if moved == data.len() => Ok(moved),
            UsbDirection::Out => Err(Error::InvalidResponse),
        }
    }

    /// Send a raw control request
    ///
    /// The data stage direction comes from bit 7 of `request_type`.
    pub fn send_custom_request(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
    ) -> Result<usize> {
        let setup = SetupPacket {
            request_type,
            request,
            value,
            index,
            length: 0,
        };
        self.control_request_blocking(setup, data)
    }

    /// Class request to the management element
    pub(crate) fn class_request(
        &self,
        direction: UsbDirection,
        request: u8,
        value: u16,
        data: &mut [u8],
    ) -> Result<usize> {
        let interface = self.notification_interface().ok_or(Error::NotSupported)?;
        let setup = SetupPacket::new(
            direction,
            RequestType::Class,
            Recipient::Interface,
            request,
            value,
            u16::from(interface),
            0,
        );
        self.control_request_blocking(setup, data)
    }

    pub fn line_coding(&self) -> Result<LineCoding> {
        let mut bytes = [0; LINE_CODING_LEN];
        let len = self.class_request(UsbDirection::In, request::GET_LINE_CODING, 0, &mut bytes)?;
        let coding = LineCoding::parse(&bytes[..len])?;
        debug!("Line coding: {:?}", coding);
        Ok(coding)
    }

    pub fn set_line_coding(&self, coding: &LineCoding) -> Result<()> {
        let mut bytes = coding.to_bytes();
        self.class_request(UsbDirection::Out, request::SET_LINE_CODING, 0, &mut bytes)?;
        debug!("Set line coding: {:?}", coding);
        Ok(())
    }

    /// Drive the DTR and RTS lines
    pub fn set_control_line_state(&self, dtr: bool, rts: bool) -> Result<()> {
        let value = u16::from(dtr) | u16::from(rts) << 1;
        self.class_request(
            UsbDirection::Out,
            request::SET_CONTROL_LINE_STATE,
            value,
            &mut [],
        )?;
        Ok(())
    }

    /// Send a break of `duration`, and wait for it to end
    pub fn send_break(&self, duration: Duration) -> Result<()> {
        let millis = u16::try_from(duration.as_millis()).map_err(|_| Error::InvalidArgument)?;
        self.class_request(UsbDirection::Out, request::SEND_BREAK, millis, &mut [])?;
        std::thread::sleep(duration + Duration::from_millis(1));
        Ok(())
    }
}
