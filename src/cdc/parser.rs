//! CDC function discovery
//!
//! Turns a device descriptor and its configuration into an [`InterfaceMap`]:
//! which interface carries notifications, which carries the bulk data pair,
//! and the CDC functional descriptors that describe the function.

use usb_device::endpoint::EndpointType;

use crate::descriptor::{
    alternates, associations, endpoints, find_interface, DeviceDescriptor, Descriptors,
    EndpointDescriptor, InterfaceDescriptor, CLASS_COMM, CLASS_PER_INTERFACE,
    CLASS_WIRELESS_CONTROLLER, CS_INTERFACE,
};
use crate::{Error, Result};

/// CDC functional descriptor subtypes
pub mod subtype {
    pub const HEADER: u8 = 0x00;
    pub const CALL_MANAGEMENT: u8 = 0x01;
    pub const ABSTRACT_CONTROL: u8 = 0x02;
    pub const UNION: u8 = 0x06;
    pub const COUNTRY_SELECTION: u8 = 0x07;
    pub const ETHERNET: u8 = 0x0F;
}

/// A class-specific interface descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionalDescriptor {
    Header {
        /// `bcdCDC`
        cdc_version: u16,
    },
    CallManagement {
        capabilities: u8,
        data_interface: u8,
    },
    AbstractControl {
        capabilities: u8,
    },
    Union {
        control_interface: u8,
        subordinates: Vec<u8>,
    },
    /// Any other subtype, including vendor-specific ones and truncated
    /// descriptors of known subtypes
    Other { subtype: u8, data: Vec<u8> },
}

impl FunctionalDescriptor {
    /// Parse a whole CS_INTERFACE descriptor, header bytes included
    fn parse(bytes: &[u8]) -> Self {
        let subtype = bytes.get(2).copied().unwrap_or(0xFF);
        let data = bytes.get(3..).unwrap_or(&[]);
        match (subtype, data) {
            (subtype::HEADER, [lo, hi, ..]) => FunctionalDescriptor::Header {
                cdc_version: u16::from_le_bytes([*lo, *hi]),
            },
            (subtype::CALL_MANAGEMENT, [capabilities, data_interface, ..]) => {
                FunctionalDescriptor::CallManagement {
                    capabilities: *capabilities,
                    data_interface: *data_interface,
                }
            }
            (subtype::ABSTRACT_CONTROL, [capabilities, ..]) => {
                FunctionalDescriptor::AbstractControl {
                    capabilities: *capabilities,
                }
            }
            (subtype::UNION, [control_interface, subordinates @ ..]) => FunctionalDescriptor::Union {
                control_interface: *control_interface,
                subordinates: subordinates.to_vec(),
            },
            _ => FunctionalDescriptor::Other {
                subtype,
                data: data.to_vec(),
            },
        }
    }

    pub fn subtype(&self) -> u8 {
        match self {
            FunctionalDescriptor::Header { .. } => subtype::HEADER,
            FunctionalDescriptor::CallManagement { .. } => subtype::CALL_MANAGEMENT,
            FunctionalDescriptor::AbstractControl { .. } => subtype::ABSTRACT_CONTROL,
            FunctionalDescriptor::Union { .. } => subtype::UNION,
            FunctionalDescriptor::Other { subtype, .. } => *subtype,
        }
    }
}

/// Interfaces and endpoints of one CDC function
///
/// The notification and data interfaces are independent. Don't assume they
/// are the same interface, or that they're adjacent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceMap {
    /// The management element. Set for every compliant function, even when
    /// it has no notification endpoint.
    pub notification_interface: Option<InterfaceDescriptor>,
    pub notification_endpoint: Option<EndpointDescriptor>,
    /// The data interface, with the alternate setting that carries the
    /// bulk pair
    pub data_interface: InterfaceDescriptor,
    pub bulk_in: EndpointDescriptor,
    pub bulk_out: EndpointDescriptor,
    /// Functional descriptors following the notification interface
    pub functional: Vec<FunctionalDescriptor>,
}

impl InterfaceMap {
    /// The first functional descriptor of the given subtype
    pub fn functional_descriptor(&self, subtype: u8) -> Option<&FunctionalDescriptor> {
        self.functional.iter().find(|desc| desc.subtype() == subtype)
    }

    pub fn notification_interface_number(&self) -> Option<u8> {
        self.notification_interface.map(|intf| intf.number)
    }
}

/// Is `intf` the management element of a CDC function?
fn is_cdc_compliant(device: &DeviceDescriptor, config: &[u8], intf: &InterfaceDescriptor) -> bool {
    if device.class == CLASS_PER_INTERFACE && intf.class == CLASS_COMM {
        return true;
    }
    if device.uses_iad() || device.has_null_class_triple() {
        return associations(config).any(|iad| {
            iad.first_interface == intf.number
                && iad.interface_count == 2
                && iad.function_class == CLASS_WIRELESS_CONTROLLER
        });
    }
    false
}

/// The bulk IN and OUT endpoints of the interface at `offset`
fn bulk_pair(
    config: &[u8],
    offset: usize,
) -> (Option<EndpointDescriptor>, Option<EndpointDescriptor>) {
    let mut pair = (None, None);
    for ep in endpoints(config, offset) {
        if ep.transfer_type() == Some(EndpointType::Bulk) {
            if ep.address.is_in() {
                pair.0 = Some(ep);
            } else {
                pair.1 = Some(ep);
            }
        }
    }
    pair
}

/// Find a CDC function starting at interface `index`
///
/// Returns [`Error::NotFound`] if the interface doesn't exist, or if no bulk
/// IN / bulk OUT pair could be resolved for it. Devices that aren't CDC
/// compliant are accepted when the bulk pair sits on the requested
/// interface.
pub fn parse_interface(device: &DeviceDescriptor, config: &[u8], index: u8) -> Result<InterfaceMap> {
    let (offset, first) = find_interface(config, index, 0).ok_or(Error::NotFound)?;

    let mut notification_interface = None;
    let mut notification_endpoint = None;
    let mut data_interface = None;
    let mut bulk_in = None;
    let mut bulk_out = None;

    for ep in endpoints(config, offset) {
        match ep.transfer_type() {
            Some(EndpointType::Interrupt) => {
                notification_endpoint = Some(ep);
                notification_interface = Some(first);
            }
            Some(EndpointType::Bulk) => {
                data_interface = Some(first);
                if ep.address.is_in() {
                    bulk_in = Some(ep);
                } else {
                    bulk_out = Some(ep);
                }
            }
            _ => {}
        }
    }

    let mut functional = Vec::new();
    if is_cdc_compliant(device, config, &first) {
        notification_interface = Some(first);
        functional = Descriptors::starting_at(config, offset)
            .skip(1)
            .take_while(|raw| raw.descriptor_type == CS_INTERFACE)
            .map(|raw| FunctionalDescriptor::parse(raw.bytes))
            .collect();

        if data_interface.is_none() {
            if let Some(next) = index.checked_add(1) {
                // Alternate 0 is often a placeholder with no endpoints
                for (alt_offset, alt) in alternates(config, next) {
                    if alt.num_endpoints != 2 {
                        continue;
                    }
                    if let (Some(i), Some(o)) = bulk_pair(config, alt_offset) {
                        data_interface = Some(alt);
                        bulk_in = Some(i);
                        bulk_out = Some(o);
                        break;
                    }
                }
            }
        }
    }

    match (data_interface, bulk_in, bulk_out) {
        (Some(data_interface), Some(bulk_in), Some(bulk_out)) => {
            debug!(
                "CDC function at interface {}: data interface {} alt {}, notification {:?}",
                index,
                data_interface.number,
                data_interface.alternate,
                notification_interface.map(|intf| intf.number)
            );
            Ok(InterfaceMap {
                notification_interface,
                notification_endpoint,
                data_interface,
                bulk_in,
                bulk_out,
                functional,
            })
        }
        _ => {
            debug!("No bulk pair for interface {}", index);
            Err(Error::NotFound)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::descriptor::fixtures::{self, ConfigBuilder};
    use crate::descriptor::{CLASS_CDC_DATA, CLASS_VENDOR_SPECIFIC};

    fn parse(device: &[u8], config: &[u8], index: u8) -> Result<InterfaceMap> {
        let device = DeviceDescriptor::parse(device).unwrap();
        parse_interface(&device, config, index)
    }

    #[test]
    fn acm_function_on_one_interface() {
        let (device, config) = fixtures::acm_with_alternate_data();
        let map = parse(&device, &config, 0).unwrap();

        assert_eq!(map.notification_interface_number(), Some(0));
        assert_eq!(map.notification_endpoint.map(|ep| u8::from(ep.address)), Some(0x83));
        assert_eq!(map.data_interface.number, 0);
        assert_eq!(u8::from(map.bulk_in.address), 0x81);
        assert_eq!(u8::from(map.bulk_out.address), 0x02);
        assert_eq!(map.functional.len(), 4);
        assert_eq!(
            map.functional_descriptor(subtype::HEADER),
            Some(&FunctionalDescriptor::Header { cdc_version: 0x0110 })
        );
        assert_eq!(
            map.functional_descriptor(subtype::ABSTRACT_CONTROL),
            Some(&FunctionalDescriptor::AbstractControl { capabilities: 0x02 })
        );
    }

    #[test]
    fn data_pair_on_second_alternate() {
        let (device, config) = fixtures::acm_with_alternate_data();
        let map = parse(&device, &config, 1).unwrap();

        assert_eq!(map.notification_interface_number(), Some(1));
        assert_eq!(map.notification_endpoint.map(|ep| u8::from(ep.address)), Some(0x84));
        assert_eq!(map.data_interface.number, 2);
        assert_eq!(map.data_interface.alternate, 1);
        assert_eq!(map.data_interface.num_endpoints, 2);
        assert_eq!(u8::from(map.bulk_in.address), 0x85);
        assert_eq!(u8::from(map.bulk_out.address), 0x06);
        assert_eq!(
            map.functional_descriptor(subtype::UNION),
            Some(&FunctionalDescriptor::Union {
                control_interface: 1,
                subordinates: vec![2],
            })
        );
    }

    #[test]
    fn bare_data_interface_is_not_a_function() {
        let (device, config) = fixtures::acm_with_alternate_data();
        assert_eq!(parse(&device, &config, 2), Err(Error::NotFound));
    }

    #[test]
    fn missing_interface() {
        let (device, config) = fixtures::acm_with_alternate_data();
        assert_eq!(parse(&device, &config, 7), Err(Error::NotFound));
    }

    #[test]
    fn rndis_function_through_iad() {
        let (device, config) = fixtures::rndis(0x1E0E, 0x9011);
        let map = parse(&device, &config, 0).unwrap();
        assert_eq!(map.notification_interface_number(), Some(0));
        assert_eq!(map.data_interface.number, 1);
        assert_eq!(map.bulk_in.max_packet_len(), 512);
        assert_eq!(map.functional.len(), 4);
    }

    #[test]
    fn iad_with_wrong_function_class() {
        let device = fixtures::device(0xEF, 0x02, 0x01, 1, 1);
        let config = ConfigBuilder::new()
            .iad(0, 2, CLASS_COMM, 0x02, 0x01)
            .interface(0, 0, 1, CLASS_COMM, 0x02, 0x01)
            .endpoint(0x81, 0x03, 8)
            .interface(1, 0, 2, CLASS_CDC_DATA, 0, 0)
            .endpoint(0x82, 0x02, 64)
            .endpoint(0x01, 0x02, 64)
            .build();
        // Not compliant, so the data interface is never probed
        assert_eq!(parse(&device, &config, 0), Err(Error::NotFound));
    }

    #[test]
    fn null_class_triple_consults_iad() {
        let device = fixtures::device(0, 0, 0, 1, 1);
        let config = ConfigBuilder::new()
            .iad(0, 2, CLASS_WIRELESS_CONTROLLER, 0x01, 0x03)
            .interface(0, 0, 1, CLASS_WIRELESS_CONTROLLER, 0x01, 0x03)
            .endpoint(0x81, 0x03, 8)
            .interface(1, 0, 2, CLASS_CDC_DATA, 0, 0)
            .endpoint(0x82, 0x02, 64)
            .endpoint(0x01, 0x02, 64)
            .build();
        let map = parse(&device, &config, 0).unwrap();
        assert_eq!(map.data_interface.number, 1);
    }

    #[test]
    fn vendor_serial_bridge() {
        let device = fixtures::device(CLASS_VENDOR_SPECIFIC, 0, 0, 0x10C4, 0xEA60);
        let config = ConfigBuilder::new()
            .interface(0, 0, 2, CLASS_VENDOR_SPECIFIC, 0, 0)
            .endpoint(0x81, 0x02, 64)
            .endpoint(0x01, 0x02, 64)
            .build();
        let map = parse(&device, &config, 0).unwrap();
        assert!(map.notification_interface.is_none());
        assert!(map.notification_endpoint.is_none());
        assert!(map.functional.is_empty());
    }

    #[test]
    fn bulk_in_only_is_rejected() {
        let device = fixtures::device(CLASS_VENDOR_SPECIFIC, 0, 0, 1, 1);
        let config = ConfigBuilder::new()
            .interface(0, 0, 1, CLASS_VENDOR_SPECIFIC, 0, 0)
            .endpoint(0x81, 0x02, 64)
            .build();
        assert_eq!(parse(&device, &config, 0), Err(Error::NotFound));
    }

    #[test]
    fn every_parsed_function_has_a_bulk_pair() {
        let (device, config) = fixtures::acm_with_alternate_data();
        for index in 0..=u8::MAX {
            if let Ok(map) = parse(&device, &config, index) {
                assert!(map.bulk_in.address.is_in());
                assert!(map.bulk_out.address.is_out());
            }
        }
    }

    #[test]
    fn truncated_functional_descriptor() {
        assert_eq!(
            FunctionalDescriptor::parse(&[4, CS_INTERFACE, subtype::HEADER, 0x10]),
            FunctionalDescriptor::Other {
                subtype: subtype::HEADER,
                data: vec![0x10],
            }
        );
    }
}
