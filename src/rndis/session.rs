use std::sync::Mutex;
use std::time::Duration;

use usb_device::UsbDirection;

use super::message::{Request, Response};
use super::{check_status, msg, oid, status, PacketFilter, MEDIA_STATE_CONNECTED};
use crate::cdc::{request, CdcDevice, DEFAULT_CONTROL_BUFFER_SIZE};
use crate::transfer::SETUP_PACKET_LEN;
use crate::{lock, Error, Result};

const MAJOR_VERSION: u32 = 1;
const MINOR_VERSION: u32 = 0;

/// Status indications read while waiting for one completion
const MAX_INDICATIONS: usize = 4;

/// Options for an [`RndisSession`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RndisConfig {
    /// Proposed in the initialize message
    pub max_transfer_size: u32,
    pub packet_filter: PacketFilter,
    /// Set during bring-up, unless empty
    pub multicast_list: Vec<[u8; 6]>,
    /// Scratch buffer for control messages. Must fit in the device's
    /// control transfer, after the setup packet.
    pub response_buffer_size: usize,
    /// Bulk OUT timeout for outbound frames
    pub send_timeout: Duration,
    /// Largest Ethernet frame passed in either direction
    pub max_frame_size: usize,
}

impl Default for RndisConfig {
    fn default() -> Self {
        RndisConfig {
            max_transfer_size: 0x4000,
            packet_filter: PacketFilter::DIRECTED
                | PacketFilter::MULTICAST
                | PacketFilter::BROADCAST
                | PacketFilter::PROMISCUOUS,
            multicast_list: vec![[0x01, 0x00, 0x5E, 0x00, 0x00, 0x01]],
            response_buffer_size: DEFAULT_CONTROL_BUFFER_SIZE - SETUP_PACKET_LEN,
            send_timeout: Duration::from_millis(1000),
            max_frame_size: 2048,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    QueryingCapabilities,
    Configuring,
    Connected,
    Disconnected,
    Closed,
}

/// What the device told us about itself
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkInfo {
    pub max_transfer_size: u32,
    pub max_packets_per_transfer: u32,
    pub packet_alignment_factor: u32,
    pub mac_address: [u8; 6],
    pub permanent_address: Option<[u8; 6]>,
    pub physical_medium: Option<u32>,
    pub max_frame_size: Option<u32>,
    pub max_total_size: Option<u32>,
    /// In units of 100 bit/s
    pub link_speed: Option<u32>,
    pub max_multicast_list_size: Option<u32>,
    pub supported_oids: Vec<u32>,
}

/// One control exchange at a time goes through here
struct Exchange {
    scratch: Vec<u8>,
    request_id: u32,
}

/// An RNDIS control session over a CDC device
///
/// The session is passive. Callers schedule [`keepalive`](Self::keepalive)
/// and [`get_connect_status`](Self::get_connect_status) polls themselves.
pub struct RndisSession {
    device: CdcDevice,
    config: RndisConfig,
    exchange: Mutex<Exchange>,
    state: Mutex<SessionState>,
    info: Mutex<LinkInfo>,
}

impl RndisSession {
    pub fn new(device: CdcDevice, config: RndisConfig) -> Self {
        let exchange = Exchange {
            scratch: vec![0; config.response_buffer_size],
            request_id: 0,
        };
        RndisSession {
            device,
            config,
            exchange: Mutex::new(exchange),
            state: Mutex::new(SessionState::Uninitialized),
            info: Mutex::new(LinkInfo::default()),
        }
    }

    pub fn device(&self) -> &CdcDevice {
        &self.device
    }

    pub fn config(&self) -> &RndisConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn link_info(&self) -> LinkInfo {
        lock(&self.info).clone()
    }

    pub fn mac_address(&self) -> [u8; 6] {
        lock(&self.info).mac_address
    }

    fn set_state(&self, next: SessionState) {
        let mut state = lock(&self.state);
        if *state != next {
            debug!("RNDIS {:?} -> {:?}", *state, next);
            *state = next;
        }
    }

    /// Move between connected and disconnected, once configured
    fn set_link(&self, connected: bool) {
        let mut state = lock(&self.state);
        let next = match (*state, connected) {
            (SessionState::Connected | SessionState::Disconnected, true) => SessionState::Connected,
            (SessionState::Connected | SessionState::Disconnected, false) => {
                SessionState::Disconnected
            }
            _ => return,
        };
        if *state != next {
            info!("RNDIS link {}", if connected { "up" } else { "down" });
            *state = next;
        }
    }

    fn check_open(&self) -> Result<()> {
        match self.state() {
            SessionState::Uninitialized | SessionState::Closed => Err(Error::InvalidState),
            _ => Ok(()),
        }
    }

    /// Send one request, without waiting for an answer
    fn send<'a>(
        &self,
        exchange: &mut Exchange,
        build: impl FnOnce(u32) -> Request<'a>,
    ) -> Result<u32> {
        exchange.request_id = exchange.request_id.wrapping_add(1);
        let request_id = exchange.request_id;
        let len = build(request_id).encode(&mut exchange.scratch)?;
        self.device.class_request(
            UsbDirection::Out,
            request::SEND_ENCAPSULATED_COMMAND,
            0,
            &mut exchange.scratch[..len],
        )?;
        Ok(request_id)
    }

    /// Send one request, and read its completion
    ///
    /// `expect` is the completion message type. `handle` sees the completion
    /// while it still borrows the scratch buffer.
    fn exchange<'a, T>(
        &self,
        build: impl FnOnce(u32) -> Request<'a>,
        expect: u32,
        handle: impl FnOnce(&Response<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut exchange = lock(&self.exchange);
        let request_id = self.send(&mut exchange, build)?;

        for _ in 0..=MAX_INDICATIONS {
            let read = self.device.class_request(
                UsbDirection::In,
                request::GET_ENCAPSULATED_RESPONSE,
                0,
                &mut exchange.scratch,
            )?;
            let response = Response::parse(&exchange.scratch[..read])?;
            match response {
                Response::IndicateStatus { status, .. } => {
                    self.indicate(status);
                    continue;
                }
                Response::Keepalive { .. } => {
                    debug!("RNDIS keepalive from device");
                    continue;
                }
                _ => {}
            }
            if response.message_type() != expect {
                warn!(
                    "RNDIS expected message {:#010x}, got {:#010x}",
                    expect,
                    response.message_type()
                );
                return Err(Error::InvalidResponse);
            }
            if let Some(id) = response.request_id() {
                if id != request_id {
                    warn!("RNDIS request ID {} answered as {}", request_id, id);
                }
            }
            return handle(&response);
        }
        Err(Error::InvalidResponse)
    }

    fn indicate(&self, code: u32) {
        match code {
            status::MEDIA_CONNECT => self.set_link(true),
            status::MEDIA_DISCONNECT => self.set_link(false),
            other => {
                debug!("RNDIS status indication {:#010x}", other);
            }
        }
    }

    /// Negotiate versions and transfer sizes
    pub fn initialize(&self) -> Result<()> {
        if self.state() == SessionState::Closed {
            return Err(Error::InvalidState);
        }
        self.set_state(SessionState::Initializing);
        let max_transfer_size = self.config.max_transfer_size;
        let result = self.exchange(
            |request_id| Request::Initialize {
                request_id,
                major_version: MAJOR_VERSION,
                minor_version: MINOR_VERSION,
                max_transfer_size,
            },
            msg::INITIALIZE_COMPLETE,
            |response| match response {
                Response::InitializeComplete(complete) => {
                    check_status(complete.status)?;
                    Ok(*complete)
                }
                _ => Err(Error::InvalidResponse),
            },
        );
        let complete = match result {
            Ok(complete) => complete,
            Err(error) => {
                self.set_state(SessionState::Uninitialized);
                return Err(error);
            }
        };

        debug!(
            "RNDIS {}.{}, {} packets per transfer, {} bytes",
            complete.major_version,
            complete.minor_version,
            complete.max_packets_per_transfer,
            complete.max_transfer_size
        );
        let mut info = lock(&self.info);
        info.max_packets_per_transfer = complete.max_packets_per_transfer;
        info.max_transfer_size = complete.max_transfer_size;
        info.packet_alignment_factor = complete.packet_alignment_factor;
        drop(info);
        self.set_state(SessionState::QueryingCapabilities);
        Ok(())
    }

    /// Query an OID, offering `len` bytes for the answer
    ///
    /// An OID the device doesn't support is [`Error::NotFound`].
    pub fn query(&self, oid: u32, len: usize) -> Result<Vec<u8>> {
        self.check_open()?;
        self.exchange(
            |request_id| Request::Query {
                request_id,
                oid,
                len,
            },
            msg::QUERY_COMPLETE,
            |response| match response {
                Response::QueryComplete { status, info, .. } => {
                    check_status(*status)?;
                    Ok(info.to_vec())
                }
                _ => Err(Error::InvalidResponse),
            },
        )
    }

    pub fn set(&self, oid: u32, data: &[u8]) -> Result<()> {
        self.check_open()?;
        self.exchange(
            |request_id| Request::Set {
                request_id,
                oid,
                data,
            },
            msg::SET_COMPLETE,
            |response| match response {
                Response::SetComplete { status, .. } => check_status(*status),
                _ => Err(Error::InvalidResponse),
            },
        )
    }

    fn query_u32(&self, oid: u32) -> Result<u32> {
        let info = self.query(oid, 4)?;
        let bytes = info.get(..4).ok_or(Error::InvalidResponse)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn query_address(&self, oid: u32) -> Result<[u8; 6]> {
        let info = self.query(oid, 6)?;
        let mut address = [0; 6];
        address.copy_from_slice(info.get(..6).ok_or(Error::InvalidResponse)?);
        Ok(address)
    }

    /// Ask the device for its link state
    ///
    /// Once the session is configured, this also moves it between connected
    /// and disconnected.
    pub fn get_connect_status(&self) -> Result<bool> {
        let connected = self.query_u32(oid::GEN_MEDIA_CONNECT_STATUS)? == MEDIA_STATE_CONNECTED;
        self.set_link(connected);
        Ok(connected)
    }

    pub fn keepalive(&self) -> Result<()> {
        self.check_open()?;
        self.exchange(
            |request_id| Request::Keepalive { request_id },
            msg::KEEPALIVE_COMPLETE,
            |response| match response {
                Response::KeepaliveComplete { status, .. } => check_status(*status),
                _ => Err(Error::InvalidResponse),
            },
        )
    }

    /// Soft-reset the device
    ///
    /// Returns `true` when the device lost its addressing state, and its
    /// filter and multicast list need setting again.
    pub fn reset(&self) -> Result<bool> {
        self.check_open()?;
        self.exchange(
            |_| Request::Reset,
            msg::RESET_COMPLETE,
            |response| match response {
                Response::ResetComplete {
                    status,
                    addressing_reset,
                } => {
                    check_status(*status)?;
                    Ok(*addressing_reset)
                }
                _ => Err(Error::InvalidResponse),
            },
        )
    }

    /// Tell the device we're going away, and close the session
    ///
    /// The device doesn't answer a halt.
    pub fn halt(&self) -> Result<()> {
        if self.state() == SessionState::Closed {
            return Ok(());
        }
        let result = if self.state() == SessionState::Uninitialized {
            Ok(())
        } else {
            let mut exchange = lock(&self.exchange);
            self.send(&mut exchange, |request_id| Request::Halt { request_id })
                .map(|_| ())
        };
        self.set_state(SessionState::Closed);
        result
    }

    /// Initialize, discover capabilities, and configure the device
    ///
    /// Ends connected or disconnected, depending on the link. On failure,
    /// the session goes back to uninitialized.
    pub fn bring_up(&self) -> Result<()> {
        let result = self.try_bring_up();
        if result.is_err() && self.state() != SessionState::Closed {
            self.set_state(SessionState::Uninitialized);
        }
        result
    }

    fn try_bring_up(&self) -> Result<()> {
        self.initialize()?;

        let list = self.query(oid::GEN_SUPPORTED_LIST, 0)?;
        let supported: Vec<u32> = list
            .chunks_exact(4)
            .map(|id| u32::from_le_bytes([id[0], id[1], id[2], id[3]]))
            .collect();
        debug!("RNDIS supports {} OIDs", supported.len());
        lock(&self.info).supported_oids = supported.clone();

        for &id in &supported {
            match self.discover(id) {
                Ok(()) => {}
                Err(Error::NotFound) => {
                    warn!("RNDIS OID {:#010x} listed, but not supported", id);
                }
                Err(error) => return Err(error),
            }
        }

        self.set_state(SessionState::Configuring);
        self.set(
            oid::GEN_CURRENT_PACKET_FILTER,
            &self.config.packet_filter.bits().to_le_bytes(),
        )?;
        if !self.config.multicast_list.is_empty() {
            let list = self.config.multicast_list.concat();
            self.set(oid::ETH_MULTICAST_LIST, &list)?;
        }

        self.set_state(SessionState::Disconnected);
        let connected = self.get_connect_status()?;
        info!(
            "RNDIS up, MAC {:02x?}, link {}",
            self.mac_address(),
            if connected { "up" } else { "down" }
        );
        Ok(())
    }

    /// Query one OID from the supported list, and record its value
    fn discover(&self, id: u32) -> Result<()> {
        match id {
            oid::GEN_PHYSICAL_MEDIUM => {
                let medium = self.query_u32(id)?;
                lock(&self.info).physical_medium = Some(medium);
            }
            oid::GEN_MAXIMUM_FRAME_SIZE => {
                let size = self.query_u32(id)?;
                lock(&self.info).max_frame_size = Some(size);
            }
            oid::GEN_MAXIMUM_TOTAL_SIZE => {
                let size = self.query_u32(id)?;
                lock(&self.info).max_total_size = Some(size);
            }
            oid::GEN_LINK_SPEED => {
                let speed = self.query_u32(id)?;
                lock(&self.info).link_speed = Some(speed);
            }
            oid::ETH_MAXIMUM_LIST_SIZE => {
                let size = self.query_u32(id)?;
                lock(&self.info).max_multicast_list_size = Some(size);
            }
            oid::ETH_CURRENT_ADDRESS => {
                let address = self.query_address(id)?;
                lock(&self.info).mac_address = address;
            }
            oid::ETH_PERMANENT_ADDRESS => {
                let address = self.query_address(id)?;
                lock(&self.info).permanent_address = Some(address);
            }
            // Asked once configured
            oid::GEN_MEDIA_CONNECT_STATUS => {}
            other => {
                debug!("RNDIS skipping OID {:#010x}", other);
            }
        }
        Ok(())
    }
}

impl core::fmt::Debug for RndisSession {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RndisSession")
            .field("device", &self.device)
            .field("state", &self.state())
            .finish()
    }
}
