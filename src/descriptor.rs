//! Standard USB descriptors
//!
//! Zero-copy views over the raw descriptor blobs returned by the host
//! controller. Multi-byte fields are little endian.

use usb_device::{
    descriptor::descriptor_type,
    endpoint::{EndpointAddress, EndpointType},
};

use crate::{Error, Result};

/// Interface association descriptor type
pub const INTERFACE_ASSOCIATION: u8 = 0x0B;
/// Class-specific interface descriptor type, used by CDC functional descriptors
pub const CS_INTERFACE: u8 = 0x24;

/// Class is declared per interface
pub const CLASS_PER_INTERFACE: u8 = 0x00;
/// Communications and CDC control
pub const CLASS_COMM: u8 = 0x02;
/// CDC data
pub const CLASS_CDC_DATA: u8 = 0x0A;
/// Wireless controller, used by RNDIS functions
pub const CLASS_WIRELESS_CONTROLLER: u8 = 0xE0;
/// Miscellaneous, used with interface association descriptors
pub const CLASS_MISC: u8 = 0xEF;
pub const CLASS_VENDOR_SPECIFIC: u8 = 0xFF;

const DEVICE_DESCRIPTOR_LEN: usize = 18;
const INTERFACE_DESCRIPTOR_LEN: usize = 9;
const ENDPOINT_DESCRIPTOR_LEN: usize = 7;
const IAD_LEN: usize = 8;

fn le16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

/// The device descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub usb_version: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub max_packet_size_0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version: u16,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < DEVICE_DESCRIPTOR_LEN || bytes[1] != descriptor_type::DEVICE {
            return Err(Error::InvalidResponse);
        }
        Ok(DeviceDescriptor {
            usb_version: le16(bytes, 2),
            class: bytes[4],
            subclass: bytes[5],
            protocol: bytes[6],
            max_packet_size_0: bytes[7],
            vendor_id: le16(bytes, 8),
            product_id: le16(bytes, 10),
            device_version: le16(bytes, 12),
            num_configurations: bytes[17],
        })
    }

    /// Class, subclass and protocol are all zero
    pub fn has_null_class_triple(&self) -> bool {
        self.class == 0 && self.subclass == 0 && self.protocol == 0
    }

    /// Class triple that announces interface association descriptors
    pub fn uses_iad(&self) -> bool {
        self.class == CLASS_MISC && self.subclass == 0x02 && self.protocol == 0x01
    }
}

/// One descriptor inside a configuration blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawDescriptor<'a> {
    /// Byte offset into the configuration
    pub offset: usize,
    pub descriptor_type: u8,
    /// The whole descriptor, length and type bytes included
    pub bytes: &'a [u8],
}

/// Walks the descriptors of a configuration blob
///
/// Iteration stops at the first descriptor with a bad length.
#[derive(Debug, Clone)]
pub struct Descriptors<'a> {
    config: &'a [u8],
    offset: usize,
}

impl<'a> Descriptors<'a> {
    pub fn new(config: &'a [u8]) -> Self {
        Descriptors { config, offset: 0 }
    }

    /// Start walking at `offset`
    pub fn starting_at(config: &'a [u8], offset: usize) -> Self {
        Descriptors { config, offset }
    }
}

impl<'a> Iterator for Descriptors<'a> {
    type Item = RawDescriptor<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.config.get(self.offset..)?;
        let len = usize::from(*rest.first()?);
        if len < 2 || len > rest.len() {
            if !rest.is_empty() {
                warn!("Malformed descriptor at offset {}", self.offset);
            }
            self.offset = self.config.len();
            return None;
        }
        let descriptor = RawDescriptor {
            offset: self.offset,
            descriptor_type: rest[1],
            bytes: &rest[..len],
        };
        self.offset += len;
        Some(descriptor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub alternate: u8,
    pub num_endpoints: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

impl InterfaceDescriptor {
    pub fn parse(raw: &RawDescriptor<'_>) -> Option<Self> {
        let b = raw.bytes;
        if raw.descriptor_type != descriptor_type::INTERFACE || b.len() < INTERFACE_DESCRIPTOR_LEN {
            return None;
        }
        Some(InterfaceDescriptor {
            number: b[2],
            alternate: b[3],
            num_endpoints: b[4],
            class: b[5],
            subclass: b[6],
            protocol: b[7],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: EndpointAddress,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn parse(raw: &RawDescriptor<'_>) -> Option<Self> {
        let b = raw.bytes;
        if raw.descriptor_type != descriptor_type::ENDPOINT || b.len() < ENDPOINT_DESCRIPTOR_LEN {
            return None;
        }
        Some(EndpointDescriptor {
            address: EndpointAddress::from(b[2]),
            attributes: b[3],
            max_packet_size: le16(b, 4),
            interval: b[6],
        })
    }

    /// The transfer type, or `None` for isochronous endpoints
    pub fn transfer_type(&self) -> Option<EndpointType> {
        match self.attributes & 0b11 {
            0 => Some(EndpointType::Control),
            2 => Some(EndpointType::Bulk),
            3 => Some(EndpointType::Interrupt),
            _ => None,
        }
    }

    /// Maximum packet size, without the high-bandwidth multiplier bits
    pub fn max_packet_len(&self) -> usize {
        usize::from(self.max_packet_size & 0x7FF)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceAssociation {
    pub first_interface: u8,
    pub interface_count: u8,
    pub function_class: u8,
    pub function_subclass: u8,
    pub function_protocol: u8,
}

impl InterfaceAssociation {
    pub fn parse(raw: &RawDescriptor<'_>) -> Option<Self> {
        let b = raw.bytes;
        if raw.descriptor_type != INTERFACE_ASSOCIATION || b.len() < IAD_LEN {
            return None;
        }
        Some(InterfaceAssociation {
            first_interface: b[2],
            interface_count: b[3],
            function_class: b[4],
            function_subclass: b[5],
            function_protocol: b[6],
        })
    }
}

/// Find the interface descriptor for `number` and `alternate`
///
/// Returns the descriptor's byte offset with the parsed view.
pub fn find_interface(
    config: &[u8],
    number: u8,
    alternate: u8,
) -> Option<(usize, InterfaceDescriptor)> {
    Descriptors::new(config).find_map(|raw| {
        InterfaceDescriptor::parse(&raw)
            .filter(|intf| intf.number == number && intf.alternate == alternate)
            .map(|intf| (raw.offset, intf))
    })
}

/// Every alternate setting of interface `number`, in descriptor order
pub fn alternates(config: &[u8], number: u8) -> impl Iterator<Item = (usize, InterfaceDescriptor)> + '_ {
    Descriptors::new(config).filter_map(move |raw| {
        InterfaceDescriptor::parse(&raw)
            .filter(|intf| intf.number == number)
            .map(|intf| (raw.offset, intf))
    })
}

/// Endpoints belonging to the interface descriptor at `offset`
///
/// Stops at the next interface descriptor.
pub fn endpoints(config: &[u8], offset: usize) -> impl Iterator<Item = EndpointDescriptor> + '_ {
    Descriptors::starting_at(config, offset)
        .skip(1)
        .take_while(|raw| raw.descriptor_type != descriptor_type::INTERFACE)
        .filter_map(|raw| EndpointDescriptor::parse(&raw))
}

/// All interface association descriptors in the configuration
pub fn associations(config: &[u8]) -> impl Iterator<Item = InterfaceAssociation> + '_ {
    Descriptors::new(config).filter_map(|raw| InterfaceAssociation::parse(&raw))
}

/// Log a readable dump of a configuration
pub fn print_descriptors(config: &[u8]) {
    for raw in Descriptors::new(config) {
        match raw.descriptor_type {
            descriptor_type::CONFIGURATION if raw.bytes.len() >= 9 => {
                info!(
                    "Configuration: total length {}, {} interfaces, value {}",
                    le16(raw.bytes, 2),
                    raw.bytes[4],
                    raw.bytes[5]
                );
            }
            descriptor_type::INTERFACE => {
                if let Some(intf) = InterfaceDescriptor::parse(&raw) {
                    info!(
                        "  Interface {} alt {}: class {:#04x}/{:#04x}/{:#04x}, {} endpoints",
                        intf.number,
                        intf.alternate,
                        intf.class,
                        intf.subclass,
                        intf.protocol,
                        intf.num_endpoints
                    );
                }
            }
            descriptor_type::ENDPOINT => {
                if let Some(ep) = EndpointDescriptor::parse(&raw) {
                    info!(
                        "    Endpoint {:#04x}: attributes {:#04x}, max packet {}, interval {}",
                        u8::from(ep.address),
                        ep.attributes,
                        ep.max_packet_len(),
                        ep.interval
                    );
                }
            }
            INTERFACE_ASSOCIATION => {
                if let Some(iad) = InterfaceAssociation::parse(&raw) {
                    info!(
                        "  IAD: interfaces {}..{}, class {:#04x}/{:#04x}/{:#04x}",
                        iad.first_interface,
                        iad.first_interface.wrapping_add(iad.interface_count),
                        iad.function_class,
                        iad.function_subclass,
                        iad.function_protocol
                    );
                }
            }
            CS_INTERFACE => {
                let subtype = raw.bytes.get(2).copied().unwrap_or(0xFF);
                info!(
                    "    CDC functional descriptor {:#04x}: {:02x?}",
                    subtype,
                    &raw.bytes[2..]
                );
            }
            other => {
                debug!("  Descriptor type {:#04x}, {} bytes", other, raw.bytes.len());
            }
        }
    }
}


#[cfg(test)]
mod test {
    use super::fixtures::{self, ConfigBuilder};
    use super::*;

    #[test]
    fn device_descriptor() {
        let bytes = fixtures::device(CLASS_MISC, 0x02, 0x01, 0x1234, 0xABCD);
        let desc = DeviceDescriptor::parse(&bytes).unwrap();
        assert_eq!(desc.vendor_id, 0x1234);
        assert_eq!(desc.product_id, 0xABCD);
        assert!(desc.uses_iad());
        assert!(!desc.has_null_class_triple());
    }

    #[test]
    fn device_descriptor_too_short() {
        let bytes = fixtures::device(0, 0, 0, 1, 1);
        assert_eq!(
            DeviceDescriptor::parse(&bytes[..10]),
            Err(Error::InvalidResponse)
        );
    }

    #[test]
    fn walk_stops_on_bad_length() {
        let mut config = ConfigBuilder::new()
            .interface(0, 0, 0, CLASS_VENDOR_SPECIFIC, 0, 0)
            .build();
        config.extend_from_slice(&[0, 0xFF]);
        assert_eq!(Descriptors::new(&config).count(), 2);

        let mut config = ConfigBuilder::new().build();
        config.extend_from_slice(&[40, descriptor_type::INTERFACE, 0]);
        assert_eq!(Descriptors::new(&config).count(), 1);
    }

    #[test]
    fn endpoints_stop_at_next_interface() {
        let (_, config) = fixtures::acm_with_alternate_data();
        let (offset, intf) = find_interface(&config, 0, 0).unwrap();
        assert_eq!(intf.num_endpoints, 3);
        let eps: Vec<_> = endpoints(&config, offset).collect();
        assert_eq!(eps.len(), 3);
        assert_eq!(eps[0].transfer_type(), Some(EndpointType::Interrupt));
        assert_eq!(eps[1].transfer_type(), Some(EndpointType::Bulk));
        assert!(eps[1].address.is_in());
        assert!(eps[2].address.is_out());
    }

    #[test]
    fn alternate_settings() {
        let (_, config) = fixtures::acm_with_alternate_data();
        let alts: Vec<_> = alternates(&config, 2).map(|(_, intf)| intf.alternate).collect();
        assert_eq!(alts, [0, 1]);
        assert!(find_interface(&config, 2, 1).is_some());
        assert!(find_interface(&config, 3, 0).is_none());
    }

    #[test]
    fn association() {
        let (_, config) = fixtures::rndis(1, 2);
        let iads: Vec<_> = associations(&config).collect();
        assert_eq!(iads.len(), 1);
        assert_eq!(iads[0].first_interface, 0);
        assert_eq!(iads[0].interface_count, 2);
        assert_eq!(iads[0].function_class, CLASS_WIRELESS_CONTROLLER);
    }

    #[test]
    fn isochronous_has_no_transfer_type() {
        let config = ConfigBuilder::new()
            .interface(0, 0, 1, CLASS_VENDOR_SPECIFIC, 0, 0)
            .endpoint(0x81, 0x01, 1023)
            .build();
        let (offset, _) = find_interface(&config, 0, 0).unwrap();
        let ep = endpoints(&config, offset).next().unwrap();
        assert_eq!(ep.transfer_type(), None);
        assert_eq!(ep.max_packet_len(), 1023);
    }
}
