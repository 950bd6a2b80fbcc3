//! RNDIS message encoding and decoding
//!
//! Every message starts with `MessageType` and `MessageLength`, both
//! little-endian `u32`s. Offsets inside a message count from the field after
//! those two, byte 8.

use super::{msg, status};
use crate::{Error, Result};

/// `MessageType` and `MessageLength`
pub const MESSAGE_HEADER_LEN: usize = 8;
pub const INITIALIZE_LEN: usize = 24;
/// Query and set messages, without their information buffer
pub const REQUEST_HEADER_LEN: usize = 28;
pub const KEEPALIVE_LEN: usize = 12;
pub const HALT_LEN: usize = 12;
pub const RESET_LEN: usize = 12;
/// Packet message header, before the frame
pub const PACKET_HEADER_LEN: usize = 44;

/// Offset of the information buffer in requests, relative to byte 8
const REQUEST_INFO_OFFSET: u32 = (REQUEST_HEADER_LEN - MESSAGE_HEADER_LEN) as u32;
/// Offset of the frame in packet messages, relative to byte 8
const PACKET_DATA_OFFSET: u32 = (PACKET_HEADER_LEN - MESSAGE_HEADER_LEN) as u32;

/// Shortest initialize completion we accept, up to the alignment factor
const INITIALIZE_COMPLETE_MIN: usize = 44;
const QUERY_COMPLETE_MIN: usize = 24;
const INDICATE_STATUS_MIN: usize = 20;

fn u32_at(bytes: &[u8], offset: usize) -> Option<u32> {
    let field = bytes.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([field[0], field[1], field[2], field[3]]))
}

fn put_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// A host to device control message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request<'a> {
    Initialize {
        request_id: u32,
        major_version: u32,
        minor_version: u32,
        max_transfer_size: u32,
    },
    /// Query an OID, offering `len` bytes of zeroed information buffer
    Query { request_id: u32, oid: u32, len: usize },
    Set { request_id: u32, oid: u32, data: &'a [u8] },
    Keepalive { request_id: u32 },
    Halt { request_id: u32 },
    Reset,
}

impl Request<'_> {
    pub fn message_type(&self) -> u32 {
        match self {
            Request::Initialize { .. } => msg::INITIALIZE,
            Request::Query { .. } => msg::QUERY,
            Request::Set { .. } => msg::SET,
            Request::Keepalive { .. } => msg::KEEPALIVE,
            Request::Halt { .. } => msg::HALT,
            Request::Reset => msg::RESET,
        }
    }

    /// Encoded size, in bytes
    pub fn encoded_len(&self) -> usize {
        match self {
            Request::Initialize { .. } => INITIALIZE_LEN,
            Request::Query { len, .. } => REQUEST_HEADER_LEN + len,
            Request::Set { data, .. } => REQUEST_HEADER_LEN + data.len(),
            Request::Keepalive { .. } => KEEPALIVE_LEN,
            Request::Halt { .. } => HALT_LEN,
            Request::Reset => RESET_LEN,
        }
    }

    /// Encode into the front of `buffer`, returning the encoded size
    pub fn encode(&self, buffer: &mut [u8]) -> Result<usize> {
        let len = self.encoded_len();
        let length = u32::try_from(len).map_err(|_| Error::InvalidSize)?;
        let buffer = buffer.get_mut(..len).ok_or(Error::InvalidSize)?;
        buffer.fill(0);
        put_u32(buffer, 0, self.message_type());
        put_u32(buffer, 4, length);

        match *self {
            Request::Initialize {
                request_id,
                major_version,
                minor_version,
                max_transfer_size,
            } => {
                put_u32(buffer, 8, request_id);
                put_u32(buffer, 12, major_version);
                put_u32(buffer, 16, minor_version);
                put_u32(buffer, 20, max_transfer_size);
            }
            Request::Query {
                request_id,
                oid,
                len: info_len,
            } => {
                put_u32(buffer, 8, request_id);
                put_u32(buffer, 12, oid);
                put_u32(buffer, 16, info_len as u32);
                put_u32(buffer, 20, REQUEST_INFO_OFFSET);
            }
            Request::Set {
                request_id,
                oid,
                data,
            } => {
                put_u32(buffer, 8, request_id);
                put_u32(buffer, 12, oid);
                put_u32(buffer, 16, data.len() as u32);
                put_u32(buffer, 20, REQUEST_INFO_OFFSET);
                buffer[REQUEST_HEADER_LEN..].copy_from_slice(data);
            }
            Request::Keepalive { request_id } | Request::Halt { request_id } => {
                put_u32(buffer, 8, request_id);
            }
            // Reserved field stays zero
            Request::Reset => {}
        }
        Ok(len)
    }
}

/// Negotiated parameters from an initialize completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitializeComplete {
    pub request_id: u32,
    pub status: u32,
    pub major_version: u32,
    pub minor_version: u32,
    pub device_flags: u32,
    pub medium: u32,
    pub max_packets_per_transfer: u32,
    pub max_transfer_size: u32,
    /// Packets in a transfer align to `1 << packet_alignment_factor`
    pub packet_alignment_factor: u32,
}

/// A device to host control message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response<'a> {
    InitializeComplete(InitializeComplete),
    /// `info` is empty unless `status` is success
    QueryComplete {
        request_id: u32,
        status: u32,
        info: &'a [u8],
    },
    SetComplete { request_id: u32, status: u32 },
    KeepaliveComplete { request_id: u32, status: u32 },
    ResetComplete { status: u32, addressing_reset: bool },
    /// Unsolicited status, like a link change
    IndicateStatus { status: u32, info: &'a [u8] },
    /// The device checking that we're alive
    Keepalive { request_id: u32 },
}

impl<'a> Response<'a> {
    /// Decode a control message
    ///
    /// The advertised `MessageLength` bounds the message, clamped to the
    /// bytes actually received.
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        let message_type = u32_at(bytes, 0).ok_or(Error::InvalidResponse)?;
        let advertised = u32_at(bytes, 4).ok_or(Error::InvalidResponse)? as usize;
        if advertised < MESSAGE_HEADER_LEN {
            return Err(Error::InvalidResponse);
        }
        let bytes = &bytes[..advertised.min(bytes.len())];
        let field = |offset| u32_at(bytes, offset).ok_or(Error::InvalidResponse);

        let response = match message_type {
            msg::INITIALIZE_COMPLETE => {
                if bytes.len() < INITIALIZE_COMPLETE_MIN {
                    return Err(Error::InvalidResponse);
                }
                Response::InitializeComplete(InitializeComplete {
                    request_id: field(8)?,
                    status: field(12)?,
                    major_version: field(16)?,
                    minor_version: field(20)?,
                    device_flags: field(24)?,
                    medium: field(28)?,
                    max_packets_per_transfer: field(32)?,
                    max_transfer_size: field(36)?,
                    packet_alignment_factor: field(40)?,
                })
            }
            msg::QUERY_COMPLETE => {
                if bytes.len() < QUERY_COMPLETE_MIN {
                    return Err(Error::InvalidResponse);
                }
                let code = field(12)?;
                let info = if code == status::SUCCESS {
                    info_buffer(bytes, field(16)?, field(20)?)?
                } else {
                    &[]
                };
                Response::QueryComplete {
                    request_id: field(8)?,
                    status: code,
                    info,
                }
            }
            msg::SET_COMPLETE => Response::SetComplete {
                request_id: field(8)?,
                status: field(12)?,
            },
            msg::KEEPALIVE_COMPLETE => Response::KeepaliveComplete {
                request_id: field(8)?,
                status: field(12)?,
            },
            msg::RESET_COMPLETE => Response::ResetComplete {
                status: field(8)?,
                addressing_reset: field(12)? != 0,
            },
            msg::INDICATE_STATUS => {
                if bytes.len() < INDICATE_STATUS_MIN {
                    return Err(Error::InvalidResponse);
                }
                Response::IndicateStatus {
                    status: field(8)?,
                    info: info_buffer(bytes, field(12)?, field(16)?)?,
                }
            }
            msg::KEEPALIVE => Response::Keepalive {
                request_id: field(8)?,
            },
            _ => return Err(Error::InvalidResponse),
        };
        Ok(response)
    }

    pub fn message_type(&self) -> u32 {
        match self {
            Response::InitializeComplete(_) => msg::INITIALIZE_COMPLETE,
            Response::QueryComplete { .. } => msg::QUERY_COMPLETE,
            Response::SetComplete { .. } => msg::SET_COMPLETE,
            Response::KeepaliveComplete { .. } => msg::KEEPALIVE_COMPLETE,
            Response::ResetComplete { .. } => msg::RESET_COMPLETE,
            Response::IndicateStatus { .. } => msg::INDICATE_STATUS,
            Response::Keepalive { .. } => msg::KEEPALIVE,
        }
    }

    /// The request this answers, if the message type carries one
    pub fn request_id(&self) -> Option<u32> {
        match *self {
            Response::InitializeComplete(InitializeComplete { request_id, .. })
            | Response::QueryComplete { request_id, .. }
            | Response::SetComplete { request_id, .. }
            | Response::KeepaliveComplete { request_id, .. }
            | Response::Keepalive { request_id } => Some(request_id),
            Response::ResetComplete { .. } | Response::IndicateStatus { .. } => None,
        }
    }
}

/// The information buffer at `offset` from byte 8, cut to the message
fn info_buffer(bytes: &[u8], len: u32, offset: u32) -> Result<&[u8]> {
    if len == 0 {
        return Ok(&[]);
    }
    let start = usize::try_from(offset)
        .ok()
        .and_then(|offset| offset.checked_add(MESSAGE_HEADER_LEN))
        .filter(|start| *start <= bytes.len())
        .ok_or(Error::InvalidResponse)?;
    let end = start.saturating_add(len as usize).min(bytes.len());
    Ok(&bytes[start..end])
}

/// Wrap an Ethernet frame into a packet message
pub fn encode_packet(frame: &[u8]) -> Result<Vec<u8>> {
    let len = PACKET_HEADER_LEN + frame.len();
    let length = u32::try_from(len).map_err(|_| Error::InvalidSize)?;
    let mut packet = vec![0; len];
    put_u32(&mut packet, 0, msg::PACKET);
    put_u32(&mut packet, 4, length);
    put_u32(&mut packet, 8, PACKET_DATA_OFFSET);
    put_u32(&mut packet, 12, frame.len() as u32);
    packet[PACKET_HEADER_LEN..].copy_from_slice(frame);
    Ok(packet)
}

/// Frames from back-to-back packet messages
///
/// Fewer than four trailing bytes are padding, and end the walk. A message
/// that isn't a packet, or that doesn't fit, yields an error and ends the
/// walk.
pub struct Packets<'a> {
    remaining: &'a [u8],
}

impl<'a> Packets<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Packets { remaining: bytes }
    }

    fn next_frame(&mut self) -> Result<&'a [u8]> {
        let bytes = self.remaining;
        if u32_at(bytes, 0) != Some(msg::PACKET) {
            return Err(Error::InvalidResponse);
        }
        let length = u32_at(bytes, 4).ok_or(Error::InvalidResponse)? as usize;
        let data_offset = u32_at(bytes, 8).ok_or(Error::InvalidResponse)? as usize;
        let data_len = u32_at(bytes, 12).ok_or(Error::InvalidResponse)? as usize;
        if length < 16 || length > bytes.len() {
            return Err(Error::InvalidSize);
        }
        let start = MESSAGE_HEADER_LEN.saturating_add(data_offset);
        let end = start.saturating_add(data_len);
        if end > length {
            return Err(Error::InvalidSize);
        }
        self.remaining = &bytes[length..];
        Ok(&bytes[start..end])
    }
}

impl<'a> Iterator for Packets<'a> {
    type Item = Result<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining.len() < 4 {
            return None;
        }
        let frame = self.next_frame();
        if frame.is_err() {
            self.remaining = &[];
        }
        Some(frame)
    }
}
