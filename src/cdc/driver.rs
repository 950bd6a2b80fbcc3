//! The registry of open CDC devices

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::device::CdcDevice;
use super::parser::parse_interface;
use super::{DeviceConfig, ANY_PID, ANY_VID};
use crate::descriptor::DeviceDescriptor;
use crate::host::{DeviceHandle, HostEvent, UsbHost};
use crate::{lock, Error, Result};

/// Called with the address of every newly enumerated device
pub type NewDeviceCallback = Arc<dyn Fn(u8) + Send + Sync>;

/// How often `open` rescans the bus while waiting for a device
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Driver-wide options
#[derive(Clone)]
pub struct DriverConfig {
    pub new_device_callback: Option<NewDeviceCallback>,
    pub poll_interval: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            new_device_callback: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl DriverConfig {
    pub fn with_new_device_callback(mut self, callback: impl Fn(u8) + Send + Sync + 'static) -> Self {
        self.new_device_callback = Some(Arc::new(callback));
        self
    }
}

struct Registry {
    devices: Vec<CdcDevice>,
    /// Data interfaces reserved by opens still in progress
    opening: Vec<(DeviceHandle, u8)>,
    installed: bool,
}

impl Registry {
    fn is_taken(&self, handle: DeviceHandle, data_interface: u8) -> bool {
        self.opening.contains(&(handle, data_interface))
            || self.devices.iter().any(|open| {
                open.handle() == handle
                    && open.interface_map().data_interface.number == data_interface
            })
    }

    fn unreserve(&mut self, handle: DeviceHandle, data_interface: u8) {
        self.opening.retain(|entry| *entry != (handle, data_interface));
    }
}

/// The CDC host driver
///
/// Owns the set of open devices. The registry lock is only held while the
/// set changes, never across USB I/O.
pub struct CdcDriver {
    host: Arc<dyn UsbHost>,
    config: DriverConfig,
    registry: Mutex<Registry>,
}

impl CdcDriver {
    pub fn install(host: Arc<dyn UsbHost>, config: DriverConfig) -> Self {
        info!("CDC driver installed");
        CdcDriver {
            host,
            config,
            registry: Mutex::new(Registry {
                devices: Vec::new(),
                opening: Vec::new(),
                installed: true,
            }),
        }
    }

    /// Uninstall the driver
    ///
    /// Fails with [`Error::InvalidState`] while any device is open. After
    /// this, `open` fails.
    pub fn uninstall(&self) -> Result<()> {
        let mut registry = lock(&self.registry);
        if !registry.devices.is_empty() {
            warn!("{} devices still open", registry.devices.len());
            return Err(Error::InvalidState);
        }
        registry.installed = false;
        info!("CDC driver uninstalled");
        Ok(())
    }

    /// Every open device
    pub fn devices(&self) -> Vec<CdcDevice> {
        lock(&self.registry).devices.clone()
    }

    /// Open the CDC function at `interface_index` of a matching device
    ///
    /// Use [`ANY_VID`] or [`ANY_PID`] to match any vendor or product. Waits
    /// up to the connection timeout for the device to appear.
    pub fn open(
        &self,
        vendor_id: u16,
        product_id: u16,
        interface_index: u8,
        config: DeviceConfig,
    ) -> Result<CdcDevice> {
        if !lock(&self.registry).installed {
            return Err(Error::InvalidState);
        }

        let (handle, fresh) = self.find_device(vendor_id, product_id, config.connection_timeout)?;
        let device = match self.start(handle, interface_index, &config) {
            Ok(device) => device,
            Err(err) => {
                if fresh {
                    self.close_handle(handle);
                }
                return Err(err);
            }
        };

        let data_interface = device.interface_map().data_interface.number;
        let mut registry = lock(&self.registry);
        registry.unreserve(handle, data_interface);
        if !registry.installed {
            drop(registry);
            warn!("Driver uninstalled while opening");
            if device.begin_close() {
                if let Err(err) = device.teardown() {
                    warn!("Cleanup after uninstall: {}", err);
                }
            }
            if fresh {
                self.close_handle(handle);
            }
            return Err(Error::InvalidState);
        }
        registry.devices.push(device.clone());
        info!(
            "Opened CDC device {:04x}:{:04x}, interface {}",
            device.vendor_id(),
            device.product_id(),
            interface_index
        );
        Ok(device)
    }

    fn start(&self, handle: DeviceHandle, interface_index: u8, config: &DeviceConfig) -> Result<CdcDevice> {
        let device = DeviceDescriptor::parse(&self.host.device_descriptor(handle)?)?;
        let blob = self.host.config_descriptor(handle)?;
        let map = parse_interface(&device, &blob, interface_index)?;

        // Reserved until `open` registers the device, so a concurrent open
        // of the same interface fails here instead of claiming it twice
        let data_interface = map.data_interface.number;
        {
            let mut registry = lock(&self.registry);
            if registry.is_taken(handle, data_interface) {
                warn!("Interface {} is already open", data_interface);
                return Err(Error::InvalidState);
            }
            registry.opening.push((handle, data_interface));
        }

        let started = CdcDevice::start(
            Arc::clone(&self.host),
            handle,
            interface_index,
            device,
            blob,
            map,
            config,
        );
        if started.is_err() {
            lock(&self.registry).unreserve(handle, data_interface);
        }
        started
    }

    /// Find a matching device, checking the open devices first
    ///
    /// Returns the handle, and whether it was freshly opened.
    fn find_device(
        &self,
        vendor_id: u16,
        product_id: u16,
        timeout: Duration,
    ) -> Result<(DeviceHandle, bool)> {
        let matches = |vid: u16, pid: u16| {
            (vendor_id == ANY_VID || vid == vendor_id) && (product_id == ANY_PID || pid == product_id)
        };

        let open = self.devices();
        if let Some(device) = open
            .iter()
            .find(|dev| matches(dev.vendor_id(), dev.product_id()))
        {
            return Ok((device.handle(), false));
        }

        let deadline = (timeout != Duration::ZERO).then(|| Instant::now() + timeout);
        loop {
            for address in self.host.device_addresses() {
                let Ok(handle) = self.host.open_device(address) else {
                    continue;
                };
                match self
                    .host
                    .device_descriptor(handle)
                    .and_then(|bytes| DeviceDescriptor::parse(&bytes))
                {
                    Ok(desc) if matches(desc.vendor_id, desc.product_id) => {
                        debug!("Found {:04x}:{:04x} at address {}", desc.vendor_id, desc.product_id, address);
                        return Ok((handle, true));
                    }
                    _ => self.close_handle(handle),
                }
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                debug!("No device {:04x}:{:04x}", vendor_id, product_id);
                return Err(Error::NotFound);
            }
            std::thread::sleep(self.config.poll_interval);
        }
    }

    fn close_handle(&self, handle: DeviceHandle) {
        if let Err(err) = self.host.close_device(handle) {
            warn!("Closing device {:?}: {}", handle, err);
        }
    }

    /// Close a device
    ///
    /// Closing a device that isn't open, or was already closed, succeeds
    /// without doing anything.
    pub fn close(&self, device: &CdcDevice) -> Result<()> {
        if !lock(&self.registry).devices.contains(device) || !device.begin_close() {
            return Ok(());
        }

        let result = device.teardown();
        let last_user = {
            let mut registry = lock(&self.registry);
            registry.devices.retain(|open| open != device);
            !registry.devices.iter().any(|open| open.handle() == device.handle())
        };
        if last_user {
            self.close_handle(device.handle());
        }
        info!("Closed CDC device {:?}", device.handle());
        result
    }

    /// Entry point for host controller notifications
    pub fn handle_host_event(&self, event: HostEvent) {
        match event {
            HostEvent::NewDevice { address } => {
                debug!("New device at address {}", address);
                if let Some(callback) = &self.config.new_device_callback {
                    callback(address);
                }
            }
            HostEvent::DeviceGone(handle) => {
                let gone: Vec<_> = lock(&self.registry)
                    .devices
                    .iter()
                    .filter(|dev| dev.handle() == handle)
                    .cloned()
                    .collect();
                // Outside the lock, so callbacks may close the device
                for device in gone {
                    device.notify_gone();
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cdc::DeviceEvent;
    use crate::descriptor::fixtures;
    use crate::host::mock::MockHost;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn acm_host() -> Arc<MockHost> {
        let host = MockHost::new();
        let (device, config) = fixtures::acm_with_alternate_data();
        host.add_device(1, device, config);
        host
    }

    fn quick() -> DeviceConfig {
        DeviceConfig::default().with_connection_timeout(Duration::from_millis(100))
    }

    #[test]
    fn open_with_wildcards() {
        let host = acm_host();
        let driver = CdcDriver::install(host.clone(), DriverConfig::default());
        let device = driver.open(ANY_VID, ANY_PID, 0, quick()).unwrap();
        assert_eq!(device.vendor_id(), 0x303A);
        assert_eq!(driver.devices(), [device]);
    }

    #[test]
    fn open_times_out() {
        let host = acm_host();
        let driver = CdcDriver::install(host.clone(), DriverConfig::default());
        let start = Instant::now();
        assert_eq!(driver.open(0x1234, 0x5678, 0, quick()).err(), Some(Error::NotFound));
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(host.open_count(1), 0);
    }

    #[test]
    fn open_waits_for_device() {
        let host = MockHost::new();
        let driver = CdcDriver::install(host.clone(), DriverConfig::default());
        let plug = {
            let host = host.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(60));
                let (device, config) = fixtures::acm_with_alternate_data();
                host.add_device(4, device, config);
            })
        };
        let config = DeviceConfig::default().with_connection_timeout(Duration::from_secs(2));
        let device = driver.open(0x303A, 0x4001, 0, config).unwrap();
        assert_eq!(device.handle(), DeviceHandle(4));
        plug.join().unwrap();
    }

    #[test]
    fn missing_interface_releases_device() {
        let host = acm_host();
        let driver = CdcDriver::install(host.clone(), DriverConfig::default());
        assert_eq!(driver.open(0x303A, 0x4001, 5, quick()).err(), Some(Error::NotFound));
        assert_eq!(host.open_count(1), 0);
        assert!(driver.devices().is_empty());
    }

    #[test]
    fn close_is_idempotent() {
        let host = acm_host();
        let driver = CdcDriver::install(host.clone(), DriverConfig::default());
        let device = driver.open(0x303A, 0x4001, 1, quick().with_in_buffer_size(64)).unwrap();
        assert_eq!(host.open_count(1), 1);

        assert_eq!(driver.close(&device), Ok(()));
        assert_eq!(driver.close(&device), Ok(()));
        assert_eq!(host.released(), [2, 1]);
        assert_eq!(host.open_count(1), 0);
        assert_eq!(host.pending(0x84), 0);
        assert_eq!(host.pending(0x85), 0);
        assert!(device.is_closed());
        assert_eq!(
            device.send_blocking(&[1], Duration::from_millis(10)),
            Err(Error::InvalidState)
        );
    }

    #[test]
    fn interface_opens_once() {
        let host = acm_host();
        let driver = CdcDriver::install(host.clone(), DriverConfig::default());
        let _device = driver.open(0x303A, 0x4001, 0, quick()).unwrap();
        assert_eq!(
            driver.open(0x303A, 0x4001, 0, quick()).err(),
            Some(Error::InvalidState)
        );
    }

    #[test]
    fn concurrent_opens_claim_once() {
        let host = acm_host();
        host.set_claim_delay(Duration::from_millis(100));
        let driver = Arc::new(CdcDriver::install(host.clone(), DriverConfig::default()));
        let threads: Vec<_> = (0..2)
            .map(|_| {
                let driver = driver.clone();
                std::thread::spawn(move || driver.open(0x303A, 0x4001, 0, quick()))
            })
            .collect();
        let results: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.contains(&Err(Error::InvalidState)));
        assert_eq!(driver.devices().len(), 1);
        assert_eq!(host.claimed(), [(0, 0)]);
        assert_eq!(host.open_count(1), 1);
    }

    #[test]
    fn uninstall_during_open_cleans_up() {
        let host = acm_host();
        host.set_claim_delay(Duration::from_millis(100));
        let driver = Arc::new(CdcDriver::install(host.clone(), DriverConfig::default()));
        let opener = {
            let driver = driver.clone();
            std::thread::spawn(move || driver.open(0x303A, 0x4001, 0, quick()))
        };
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(driver.uninstall(), Ok(()));

        assert_eq!(opener.join().unwrap().err(), Some(Error::InvalidState));
        assert!(driver.devices().is_empty());
        assert_eq!(host.released(), [0]);
        assert_eq!(host.open_count(1), 0);
    }

    #[test]
    fn functions_share_device_handle() {
        let host = acm_host();
        let driver = CdcDriver::install(host.clone(), DriverConfig::default());
        let first = driver.open(0x303A, 0x4001, 0, quick()).unwrap();
        let second = driver.open(0x303A, 0x4001, 1, quick()).unwrap();
        assert_eq!(first.handle(), second.handle());
        assert_eq!(host.open_count(1), 1);

        driver.close(&first).unwrap();
        assert_eq!(host.open_count(1), 1);
        driver.close(&second).unwrap();
        assert_eq!(host.open_count(1), 0);
    }

    #[test]
    fn disconnect_notifies_once() {
        let host = acm_host();
        let driver = CdcDriver::install(host.clone(), DriverConfig::default());
        let disconnects = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));
        let config = {
            let disconnects = disconnects.clone();
            let errors = errors.clone();
            quick()
                .with_in_buffer_size(64)
                .with_out_buffer_size(64)
                .with_event_callback(move |_, event| match event {
                    DeviceEvent::Disconnected => {
                        disconnects.fetch_add(1, Ordering::SeqCst);
                    }
                    _ => {
                        errors.fetch_add(1, Ordering::SeqCst);
                    }
                })
        };
        let device = driver.open(0x303A, 0x4001, 0, config).unwrap();

        host.remove_device(1);
        driver.handle_host_event(HostEvent::DeviceGone(device.handle()));
        driver.handle_host_event(HostEvent::DeviceGone(device.handle()));
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        // No-device completions are part of teardown, not errors
        assert_eq!(errors.load(Ordering::SeqCst), 0);
        assert!(device.is_disconnected());
        assert_eq!(
            device.send_blocking(&[1], Duration::from_secs(5)),
            Err(Error::InvalidState)
        );
        assert_eq!(driver.close(&device), Ok(()));
    }

    #[test]
    fn close_from_disconnect_callback() {
        let host = acm_host();
        let driver = Arc::new(CdcDriver::install(host.clone(), DriverConfig::default()));
        let config = {
            let driver = driver.clone();
            quick()
                .with_in_buffer_size(64)
                .with_event_callback(move |device, event| {
                    if let DeviceEvent::Disconnected = event {
                        driver.close(device).unwrap();
                    }
                })
        };
        let device = driver.open(0x303A, 0x4001, 0, config).unwrap();
        let handle = device.handle();

        host.remove_device(1);
        driver.handle_host_event(HostEvent::DeviceGone(handle));
        assert!(driver.devices().is_empty());
        assert!(device.is_closed());
        assert_eq!(driver.uninstall(), Ok(()));
    }

    #[test]
    fn close_from_network_connection_event() {
        let host = acm_host();
        let driver = Arc::new(CdcDriver::install(host.clone(), DriverConfig::default()));
        let (tx, rx) = std::sync::mpsc::channel();
        let config = {
            let driver = driver.clone();
            let tx = std::sync::Mutex::new(tx);
            quick()
                .with_in_buffer_size(64)
                .with_event_callback(move |device, event| {
                    if let DeviceEvent::NetworkConnection(false) = event {
                        let start = Instant::now();
                        let result = driver.close(device);
                        let _ = tx.lock().unwrap().send((result, start.elapsed()));
                    }
                })
        };
        let device = driver.open(0x303A, 0x4001, 0, config).unwrap();

        assert!(host.deliver(0x83, &[0xA1, 0x00, 0, 0, 0, 0, 0, 0]));
        let (result, elapsed) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result, Ok(()));
        assert!(elapsed < Duration::from_millis(500));
        assert!(device.is_closed());
        assert!(driver.devices().is_empty());
        assert_eq!(host.pending(0x83), 0);
        assert_eq!(host.pending(0x81), 0);
        assert_eq!(host.open_count(1), 0);
    }

    #[test]
    fn uninstall_requires_closed_devices() {
        let host = acm_host();
        let driver = CdcDriver::install(host.clone(), DriverConfig::default());
        let device = driver.open(0x303A, 0x4001, 0, quick()).unwrap();
        assert_eq!(driver.uninstall(), Err(Error::InvalidState));
        driver.close(&device).unwrap();
        assert_eq!(driver.uninstall(), Ok(()));
        assert_eq!(
            driver.open(0x303A, 0x4001, 0, quick()).err(),
            Some(Error::InvalidState)
        );
    }

    #[test]
    fn new_device_callback() {
        let host = acm_host();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let config =
            DriverConfig::default().with_new_device_callback(move |address| sink.lock().unwrap().push(address));
        let driver = CdcDriver::install(host, config);
        driver.handle_host_event(HostEvent::NewDevice { address: 7 });
        assert_eq!(*seen.lock().unwrap(), [7]);
    }
}
