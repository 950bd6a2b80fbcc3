//! USB transfers
//!
//! A [`Transfer`] is a fixed-size buffer bound to one endpoint of one device,
//! plus the continuation that runs when the host controller completes it.
//! Ownership moves with the transfer: it's owned by the pipe while idle, by
//! the host controller while submitted, and by the continuation once it
//! completes. A transfer can't be freed while its completion is outstanding,
//! because nobody else holds it.

use std::sync::Arc;

use usb_device::{
    control::{Recipient, RequestType},
    endpoint::{EndpointAddress, EndpointType},
    UsbDirection,
};

use crate::host::{DeviceHandle, TransferStatus};

/// Size of a control setup packet
pub const SETUP_PACKET_LEN: usize = 8;

/// Runs in the host's completion context, and must never block
pub type Completion = Arc<dyn Fn(Transfer) + Send + Sync>;

/// A control transfer setup packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    /// Assemble `bmRequestType` from its parts
    pub fn new(
        direction: UsbDirection,
        kind: RequestType,
        recipient: Recipient,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> Self {
        SetupPacket {
            request_type: direction as u8 | (kind as u8) << 5 | recipient as u8,
            request,
            value,
            index,
            length,
        }
    }

    /// The data stage direction, from bit 7 of `bmRequestType`
    pub fn direction(&self) -> UsbDirection {
        if self.request_type & 0x80 != 0 {
            UsbDirection::In
        } else {
            UsbDirection::Out
        }
    }

    pub fn to_bytes(&self) -> [u8; SETUP_PACKET_LEN] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    pub fn from_bytes(bytes: &[u8; SETUP_PACKET_LEN]) -> Self {
        SetupPacket {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }
}

/// A buffer and completion continuation for one endpoint
pub struct Transfer {
    device: DeviceHandle,
    endpoint: EndpointAddress,
    kind: EndpointType,
    buffer: Box<[u8]>,
    /// Start of the region the host fills or drains
    offset: usize,
    num_bytes: usize,
    actual: usize,
    status: Option<TransferStatus>,
    completion: Completion,
}

impl Transfer {
    pub(crate) fn new(
        device: DeviceHandle,
        endpoint: EndpointAddress,
        kind: EndpointType,
        capacity: usize,
        completion: Completion,
    ) -> Self {
        Transfer {
            device,
            endpoint,
            kind,
            buffer: vec![0; capacity].into_boxed_slice(),
            offset: 0,
            num_bytes: 0,
            actual: 0,
            status: None,
            completion,
        }
    }

    pub fn device(&self) -> DeviceHandle {
        self.device
    }

    pub fn endpoint(&self) -> EndpointAddress {
        self.endpoint
    }

    pub fn kind(&self) -> EndpointType {
        self.kind
    }

    /// Size of the backing storage
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Number of bytes requested for the next submission
    pub fn num_bytes(&self) -> usize {
        self.num_bytes
    }

    /// Bytes moved by the last completion
    pub fn actual_num_bytes(&self) -> usize {
        self.actual
    }

    /// Status of the last completion, or `None` if it never completed
    pub fn status(&self) -> Option<TransferStatus> {
        self.status
    }

    /// The region the host transmits from (OUT) or receives into (IN)
    pub fn data(&self) -> &[u8] {
        &self.buffer[self.offset..self.offset + self.num_bytes]
    }

    /// Mutable access to the region described by [`data`](Transfer::data)
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.offset..self.offset + self.num_bytes]
    }

    /// The setup packet of a control transfer
    pub fn setup(&self) -> Option<SetupPacket> {
        if self.kind != EndpointType::Control {
            return None;
        }
        let bytes = self.buffer.get(..SETUP_PACKET_LEN)?;
        let mut setup = [0; SETUP_PACKET_LEN];
        setup.copy_from_slice(bytes);
        Some(SetupPacket::from_bytes(&setup))
    }

    /// Finish the transfer, and run its continuation
    ///
    /// Called by the host controller exactly once per accepted submission.
    /// `actual` is clamped to the requested length.
    pub fn complete(mut self, status: TransferStatus, actual: usize) {
        self.status = Some(status);
        self.actual = actual.min(self.num_bytes);
        let completion = Arc::clone(&self.completion);
        completion(self)
    }

    /// Request `num_bytes` starting at the current offset
    ///
    /// # Panics
    ///
    /// Panics if the region exceeds the buffer.
    pub(crate) fn set_num_bytes(&mut self, num_bytes: usize) {
        assert!(self.offset + num_bytes <= self.buffer.len());
        self.num_bytes = num_bytes;
    }

    /// Move the start of the receive region
    pub(crate) fn set_offset(&mut self, offset: usize) {
        assert!(offset <= self.buffer.len());
        self.offset = offset;
        self.num_bytes = self.num_bytes.min(self.buffer.len() - offset);
    }

    pub(crate) fn offset(&self) -> usize {
        self.offset
    }

    /// Everything from the start of the buffer through the last received byte
    pub(crate) fn received(&self) -> &[u8] {
        &self.buffer[..self.offset + self.actual]
    }
}

impl core::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Transfer")
            .field("device", &self.device)
            .field("endpoint", &u8::from(self.endpoint))
            .field("capacity", &self.buffer.len())
            .field("offset", &self.offset)
            .field("num_bytes", &self.num_bytes)
            .field("actual", &self.actual)
            .field("status", &self.status)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::mpsc;

    fn bulk_in(capacity: usize) -> (Transfer, mpsc::Receiver<Transfer>) {
        let (tx, rx) = mpsc::sync_channel(1);
        let completion: Completion = Arc::new(move |t| tx.try_send(t).unwrap());
        let transfer = Transfer::new(
            DeviceHandle(1),
            EndpointAddress::from(0x81),
            EndpointType::Bulk,
            capacity,
            completion,
        );
        (transfer, rx)
    }

    #[test]
    fn setup_packet_layout() {
        let setup = SetupPacket::new(
            UsbDirection::In,
            RequestType::Class,
            Recipient::Interface,
            0x21,
            0x1234,
            2,
            7,
        );
        assert_eq!(setup.request_type, 0xA1);
        assert_eq!(setup.direction(), UsbDirection::In);
        let bytes = setup.to_bytes();
        assert_eq!(bytes, [0xA1, 0x21, 0x34, 0x12, 2, 0, 7, 0]);
        assert_eq!(SetupPacket::from_bytes(&bytes), setup);
    }

    #[test]
    fn out_request_type() {
        let setup = SetupPacket::new(
            UsbDirection::Out,
            RequestType::Class,
            Recipient::Interface,
            0x00,
            0,
            0,
            24,
        );
        assert_eq!(setup.request_type, 0x21);
        assert_eq!(setup.direction(), UsbDirection::Out);
    }

    #[test]
    fn completion_hands_back_transfer() {
        let (mut transfer, rx) = bulk_in(64);
        transfer.set_num_bytes(64);
        transfer.data_mut()[..3].copy_from_slice(&[1, 2, 3]);
        transfer.complete(TransferStatus::Completed, 3);

        let transfer = rx.try_recv().unwrap();
        assert_eq!(transfer.status(), Some(TransferStatus::Completed));
        assert_eq!(transfer.actual_num_bytes(), 3);
        assert_eq!(transfer.received(), &[1, 2, 3]);
    }

    #[test]
    fn actual_clamped_to_request() {
        let (mut transfer, rx) = bulk_in(16);
        transfer.set_num_bytes(8);
        transfer.complete(TransferStatus::Overflow, 100);
        let transfer = rx.try_recv().unwrap();
        assert_eq!(transfer.actual_num_bytes(), 8);
    }

    #[test]
    fn receive_region_follows_offset() {
        let (mut transfer, rx) = bulk_in(16);
        transfer.set_num_bytes(8);
        transfer.data_mut()[..2].copy_from_slice(&[0xAA, 0xBB]);
        transfer.complete(TransferStatus::Completed, 2);

        let mut transfer = rx.try_recv().unwrap();
        transfer.set_offset(2);
        transfer.set_num_bytes(8);
        transfer.data_mut()[0] = 0xCC;
        transfer.complete(TransferStatus::Completed, 1);

        let transfer = rx.try_recv().unwrap();
        assert_eq!(transfer.received(), &[0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn no_setup_on_bulk() {
        let (transfer, _rx) = bulk_in(16);
        assert!(transfer.setup().is_none());
    }
}
